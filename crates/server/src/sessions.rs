use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::tokens::generate_token;

#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub user_id: String,
    pub created_at: Instant,
    pub last_active: Instant,
}

/// In-memory token→session map with a fixed inactivity TTL and periodic sweep.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Mint a new session for `user_id` and return its bearer token.
    pub async fn create(&self, user_id: &str) -> String {
        let token = generate_token();
        let now = Instant::now();
        let session = Session {
            token: token.clone(),
            user_id: user_id.to_string(),
            created_at: now,
            last_active: now,
        };
        self.sessions.write().await.insert(token.clone(), session);
        token
    }

    /// Validate a token, refreshing `last_active` on success and lazily
    /// deleting it if it has expired.
    pub async fn validate(&self, token: &str) -> Option<Session> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get(token)?;
        if session.last_active.elapsed() > self.ttl {
            sessions.remove(token);
            return None;
        }
        let session = sessions.get_mut(token).unwrap();
        session.last_active = Instant::now();
        Some(session.clone())
    }

    pub async fn destroy(&self, token: &str) {
        self.sessions.write().await.remove(token);
    }

    /// Remove every session whose `last_active` exceeds the TTL. Intended to
    /// be called on a fixed timer (see `main.rs`).
    pub async fn sweep(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let ttl = self.ttl;
        let before = sessions.len();
        sessions.retain(|_, s| s.last_active.elapsed() <= ttl);
        before - sessions.len()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}
