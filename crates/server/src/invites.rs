use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::RwLock;

use crate::tokens::generate_token;

#[derive(Debug, Clone)]
pub struct Invite {
    pub token: String,
    pub user_id: String,
    pub machine_id: String,
    pub display_name: String,
    pub machine_name: String,
    pub expires_at: u64,
}

/// Single-use-capable share tokens with absolute expiry. Expired entries are
/// deleted lazily on access; there is no background sweep (§4.3).
pub struct InviteStore {
    invites: RwLock<HashMap<String, Invite>>,
    ttl: Duration,
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl InviteStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            invites: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub async fn create(
        &self,
        user_id: &str,
        machine_id: &str,
        display_name: &str,
        machine_name: &str,
    ) -> Invite {
        let token = generate_token();
        let invite = Invite {
            token: token.clone(),
            user_id: user_id.to_string(),
            machine_id: machine_id.to_string(),
            display_name: display_name.to_string(),
            machine_name: machine_name.to_string(),
            expires_at: now_unix() + self.ttl.as_secs(),
        };
        self.invites.write().await.insert(token, invite.clone());
        invite
    }

    /// Return a snapshot of the invite if it exists and hasn't expired,
    /// removing it on the way out if it has.
    pub async fn inspect(&self, token: &str) -> Option<Invite> {
        let mut invites = self.invites.write().await;
        let invite = invites.get(token)?;
        if invite.expires_at <= now_unix() {
            invites.remove(token);
            return None;
        }
        Some(invite.clone())
    }

    /// Revoke an invite; only the owning user may do so.
    pub async fn revoke(&self, user_id: &str, token: &str) -> bool {
        let mut invites = self.invites.write().await;
        match invites.get(token) {
            Some(invite) if invite.user_id == user_id => {
                invites.remove(token);
                true
            }
            _ => false,
        }
    }
}
