use rand::RngCore;
use rand::rngs::OsRng;

/// Generate a 128-bit random token rendered as 32 lowercase hex characters.
/// Used for session tokens, invite tokens, and agent keys alike.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    let mut hex = String::with_capacity(32);
    for b in &bytes {
        use std::fmt::Write;
        write!(hex, "{b:02x}").unwrap();
    }
    hex
}
