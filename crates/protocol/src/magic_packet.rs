//! Wake-on-LAN magic packet construction.
//!
//! 102 bytes total:
//! ```text
//! [0..6]    synchronization stream: 6 bytes of 0xFF
//! [6..102]  target MAC address (6 bytes) repeated 16 times
//! ```

pub const MAGIC_PACKET_LEN: usize = 102;
const SYNC_BYTES: usize = 6;
const MAC_REPEATS: usize = 16;

/// A parsed 6-octet MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn from_octets(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Parse a MAC address in colon- or hyphen-separated hex form,
    /// e.g. `"AA:BB:CC:DD:EE:FF"` or `"aa-bb-cc-dd-ee-ff"`.
    pub fn parse(s: &str) -> Result<Self, MacAddressError> {
        let parts: Vec<&str> = s.split(|c| c == ':' || c == '-').collect();
        if parts.len() != 6 {
            return Err(MacAddressError::WrongOctetCount(parts.len()));
        }
        let mut octets = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            octets[i] = u8::from_str_radix(part, 16)
                .map_err(|_| MacAddressError::InvalidOctet(part.to_string()))?;
        }
        Ok(Self(octets))
    }
}

impl std::fmt::Display for MacAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MacAddressError {
    #[error("MAC address must have 6 octets, found {0}")]
    WrongOctetCount(usize),
    #[error("invalid hex octet {0:?}")]
    InvalidOctet(String),
}

/// Build the 102-byte magic packet for the given MAC address.
pub fn build_magic_packet(mac: &MacAddress) -> [u8; MAGIC_PACKET_LEN] {
    let mut packet = [0xFFu8; MAGIC_PACKET_LEN];
    let octets = mac.octets();
    for i in 0..MAC_REPEATS {
        let start = SYNC_BYTES + i * 6;
        packet[start..start + 6].copy_from_slice(&octets);
    }
    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_is_102_bytes() {
        let mac = MacAddress::parse("11:22:33:44:55:66").unwrap();
        let packet = build_magic_packet(&mac);
        assert_eq!(packet.len(), MAGIC_PACKET_LEN);
    }

    #[test]
    fn packet_starts_with_six_ff_bytes() {
        let mac = MacAddress::parse("11:22:33:44:55:66").unwrap();
        let packet = build_magic_packet(&mac);
        assert_eq!(&packet[0..6], &[0xFF; 6]);
    }

    #[test]
    fn packet_repeats_mac_sixteen_times() {
        let mac = MacAddress::parse("11:22:33:44:55:66").unwrap();
        let packet = build_magic_packet(&mac);
        for i in 0..16 {
            let start = 6 + i * 6;
            assert_eq!(&packet[start..start + 6], &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        }
    }

    #[test]
    fn parse_accepts_colon_and_hyphen() {
        let a = MacAddress::parse("AA:BB:CC:DD:EE:FF").unwrap();
        let b = MacAddress::parse("aa-bb-cc-dd-ee-ff").unwrap();
        assert_eq!(a.octets(), b.octets());
    }

    #[test]
    fn parse_rejects_wrong_octet_count() {
        match MacAddress::parse("AA:BB:CC") {
            Err(MacAddressError::WrongOctetCount(3)) => {}
            other => panic!("expected WrongOctetCount(3), got {:?}", other),
        }
    }

    #[test]
    fn parse_rejects_invalid_hex() {
        match MacAddress::parse("ZZ:BB:CC:DD:EE:FF") {
            Err(MacAddressError::InvalidOctet(_)) => {}
            other => panic!("expected InvalidOctet, got {:?}", other),
        }
    }

    #[test]
    fn display_formats_uppercase_colon_separated() {
        let mac = MacAddress::parse("aa:bb:cc:dd:ee:ff").unwrap();
        assert_eq!(mac.to_string(), "AA:BB:CC:DD:EE:FF");
    }
}
