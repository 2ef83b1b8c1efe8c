use axum::http::HeaderMap;

use crate::error::RelayError;
use crate::invites::InviteStore;
use crate::sessions::{Session, SessionStore};
use crate::users::UserStore;

/// A closed, already-resolved identity for one socket connection. The
/// authenticator is the only site that constructs one — nothing downstream
/// re-derives a role from a string (§9, "string-typed roles").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Agent {
        user_id: String,
        machine_id: String,
        agent_key: String,
    },
    /// `machine_id` is `None` until the viewer picks a target; invite-granted
    /// viewers always carry `Some` and are implicitly restricted to it by the
    /// dispatcher (no machine-management calls are ever reachable from a
    /// socket connection regardless of role).
    Viewer {
        user_id: String,
        machine_id: Option<String>,
    },
    Dashboard {
        user_id: String,
    },
}

/// The opaque handshake fields carried by a socket connection attempt (§6).
#[derive(Debug, Default, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeFields {
    pub token: Option<String>,
    pub role: Option<String>,
    pub agent_key: Option<String>,
    pub machine_id: Option<String>,
    pub invite_token: Option<String>,
}

pub struct Authenticator<'a> {
    pub users: &'a UserStore,
    pub sessions: &'a SessionStore,
    pub invites: &'a InviteStore,
}

impl<'a> Authenticator<'a> {
    pub fn new(users: &'a UserStore, sessions: &'a SessionStore, invites: &'a InviteStore) -> Self {
        Self {
            users,
            sessions,
            invites,
        }
    }

    /// Resolve a handshake's opaque fields into a `Role`, or reject it. Any
    /// unresolved handshake is an `AuthFailed` — the caller never connects
    /// the socket first and authenticates second (§4.4).
    pub async fn resolve_handshake(&self, fields: &HandshakeFields) -> Result<Role, RelayError> {
        if fields.role.as_deref() == Some("agent") {
            let agent_key = fields.agent_key.as_deref().ok_or(RelayError::AuthFailed)?;
            let (user, machine) = self
                .users
                .get_by_agent_key(agent_key)
                .await
                .ok_or(RelayError::AuthFailed)?;
            return Ok(Role::Agent {
                user_id: user.id,
                machine_id: machine.id,
                agent_key: agent_key.to_string(),
            });
        }

        if let Some(invite_token) = &fields.invite_token {
            let invite = self
                .invites
                .inspect(invite_token)
                .await
                .ok_or(RelayError::AuthFailed)?;
            return Ok(Role::Viewer {
                user_id: invite.user_id,
                machine_id: Some(invite.machine_id),
            });
        }

        if let Some(token) = &fields.token {
            let session = self.sessions.validate(token).await.ok_or(RelayError::AuthFailed)?;
            return Ok(match fields.role.as_deref() {
                Some("dashboard") => Role::Dashboard {
                    user_id: session.user_id,
                },
                _ => Role::Viewer {
                    user_id: session.user_id,
                    machine_id: fields.machine_id.clone(),
                },
            });
        }

        Err(RelayError::AuthFailed)
    }
}

/// Extract and validate a bearer session token from an HTTP `Authorization`
/// header, used by every authenticated control-plane route.
pub async fn authenticate_http(
    sessions: &SessionStore,
    headers: &HeaderMap,
) -> Result<Session, RelayError> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(RelayError::AuthFailed)?;
    sessions.validate(token).await.ok_or(RelayError::AuthFailed)
}

/// Enforce the §4.4 auth-boundary invariant: a valid session for a different
/// user never authorizes access to `path_user_id`.
pub fn require_owner(session: &Session, path_user_id: &str) -> Result<(), RelayError> {
    if session.user_id == path_user_id {
        Ok(())
    } else {
        Err(RelayError::Forbidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    async fn test_stores() -> (UserStore, SessionStore, InviteStore) {
        let dir = tempdir().unwrap();
        let users = UserStore::init(dir.path().join("users.json")).await.unwrap();
        let sessions = SessionStore::new(Duration::from_secs(3600));
        let invites = InviteStore::new(Duration::from_secs(7 * 86400));
        (users, sessions, invites)
    }

    #[tokio::test]
    async fn agent_handshake_resolves_user_and_machine() {
        let (users, sessions, invites) = test_stores().await;
        let machines = users.get_machines("kingpin").await.unwrap();
        let agent_key = machines[0].agent_key.clone();

        let auth = Authenticator::new(&users, &sessions, &invites);
        let role = auth
            .resolve_handshake(&HandshakeFields {
                role: Some("agent".to_string()),
                agent_key: Some(agent_key.clone()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(
            role,
            Role::Agent {
                user_id: "kingpin".to_string(),
                machine_id: machines[0].id.clone(),
                agent_key,
            }
        );
    }

    #[tokio::test]
    async fn agent_handshake_with_unknown_key_fails() {
        let (users, sessions, invites) = test_stores().await;
        let auth = Authenticator::new(&users, &sessions, &invites);
        let result = auth
            .resolve_handshake(&HandshakeFields {
                role: Some("agent".to_string()),
                agent_key: Some("bogus".to_string()),
                ..Default::default()
            })
            .await;
        assert!(matches!(result, Err(RelayError::AuthFailed)));
    }

    #[tokio::test]
    async fn session_token_resolves_viewer() {
        let (users, sessions, invites) = test_stores().await;
        let token = sessions.create("kingpin").await;
        let auth = Authenticator::new(&users, &sessions, &invites);

        let role = auth
            .resolve_handshake(&HandshakeFields {
                token: Some(token),
                role: Some("viewer".to_string()),
                machine_id: Some("m1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(
            role,
            Role::Viewer {
                user_id: "kingpin".to_string(),
                machine_id: Some("m1".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn session_token_with_dashboard_role_resolves_dashboard() {
        let (users, sessions, invites) = test_stores().await;
        let token = sessions.create("kingpin").await;
        let auth = Authenticator::new(&users, &sessions, &invites);

        let role = auth
            .resolve_handshake(&HandshakeFields {
                token: Some(token),
                role: Some("dashboard".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(
            role,
            Role::Dashboard {
                user_id: "kingpin".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn invite_token_resolves_machine_scoped_viewer() {
        let (users, sessions, invites) = test_stores().await;
        let invite = invites.create("kingpin", "m1", "Kingpin", "Home PC").await;
        let auth = Authenticator::new(&users, &sessions, &invites);

        let role = auth
            .resolve_handshake(&HandshakeFields {
                invite_token: Some(invite.token),
                role: Some("viewer".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(
            role,
            Role::Viewer {
                user_id: "kingpin".to_string(),
                machine_id: Some("m1".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn unresolvable_handshake_is_rejected() {
        let (users, sessions, invites) = test_stores().await;
        let auth = Authenticator::new(&users, &sessions, &invites);
        let result = auth.resolve_handshake(&HandshakeFields::default()).await;
        assert!(matches!(result, Err(RelayError::AuthFailed)));
    }

    #[tokio::test]
    async fn require_owner_rejects_mismatched_user() {
        let (_users, sessions, _invites) = test_stores().await;
        let token = sessions.create("kingpin").await;
        let session = sessions.validate(&token).await.unwrap();
        assert!(require_owner(&session, "kingpin").is_ok());
        assert!(matches!(
            require_owner(&session, "tez"),
            Err(RelayError::Forbidden)
        ));
    }
}
