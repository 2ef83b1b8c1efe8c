use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::tokens::generate_token;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    pub id: String,
    pub name: String,
    pub agent_key: String,
    pub mac_address: Option<String>,
    pub broadcast_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub display_name: String,
    pub password_hash: String,
    pub machines: Vec<Machine>,
}

/// Pre-migration on-disk shape: a single machine's fields sat directly on the
/// user record instead of in a `machines` list.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyUserRecord {
    id: String,
    display_name: String,
    password_hash: String,
    #[serde(default)]
    machines: Option<Vec<Machine>>,
    agent_key: Option<String>,
    #[serde(default)]
    mac_address: Option<String>,
    #[serde(default)]
    broadcast_address: Option<String>,
}

fn argon2() -> Argon2<'static> {
    // ~100-250ms per check on commodity hardware.
    let params = Params::new(19_456, 2, 1, None).expect("valid argon2 params");
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
}

fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    argon2()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| anyhow::anyhow!("failed to hash password: {e}"))
}

fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    argon2()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

fn fresh_machine_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("m{millis}{}", &generate_token()[..6])
}

/// Durable identity and machine records, backed by a single JSON document.
pub struct UserStore {
    path: PathBuf,
    users: RwLock<Vec<User>>,
}

impl UserStore {
    /// Load the store from disk, or seed two demo users if the file is absent.
    pub async fn init(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let users = if path.exists() {
            let data = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            Self::parse_and_migrate(&data)?
        } else {
            tracing::info!(path = %path.display(), "No user store found, seeding demo users");
            Self::seed_demo_users()?
        };

        let store = Self {
            path,
            users: RwLock::new(users),
        };
        store.persist().await?;
        Ok(store)
    }

    fn seed_demo_users() -> Result<Vec<User>> {
        let mut users = Vec::new();
        for (id, display_name) in [("kingpin", "Kingpin"), ("tez", "Tez")] {
            users.push(User {
                id: id.to_string(),
                display_name: display_name.to_string(),
                password_hash: hash_password(id)?,
                machines: vec![Machine {
                    id: fresh_machine_id(),
                    name: format!("{display_name}'s Desktop"),
                    agent_key: generate_token(),
                    mac_address: None,
                    broadcast_address: None,
                }],
            });
        }
        Ok(users)
    }

    fn parse_and_migrate(data: &str) -> Result<Vec<User>> {
        let records: Vec<LegacyUserRecord> =
            serde_json::from_str(data).context("failed to parse user store JSON")?;
        let mut users = Vec::with_capacity(records.len());
        for record in records {
            let machines = match record.machines {
                Some(machines) => machines,
                None => {
                    // Legacy single-machine record: synthesize a machines list.
                    let agent_key = record.agent_key.unwrap_or_else(generate_token);
                    tracing::info!(user = %record.id, "Migrating legacy user record to machines list");
                    vec![Machine {
                        id: fresh_machine_id(),
                        name: format!("{}'s Desktop", record.display_name),
                        agent_key,
                        mac_address: record.mac_address,
                        broadcast_address: record.broadcast_address,
                    }]
                }
            };
            users.push(User {
                id: record.id,
                display_name: record.display_name,
                password_hash: record.password_hash,
                machines,
            });
        }
        Ok(users)
    }

    /// Sequential verifier scan: returns the first user whose password verifies.
    /// A password collision between two users would silently misauthenticate —
    /// see `would_collide`, used at seed/creation time to prevent that.
    pub async fn authenticate_by_password(&self, password: &str) -> Option<User> {
        let users = self.users.read().await;
        users
            .iter()
            .find(|u| verify_password(password, &u.password_hash))
            .cloned()
    }

    /// Would hashing `password` collide with an existing user's verifier?
    /// Enforced at user-creation time per the unique-password invariant.
    pub async fn would_collide(&self, password: &str) -> bool {
        let users = self.users.read().await;
        users.iter().any(|u| verify_password(password, &u.password_hash))
    }

    pub async fn get_by_agent_key(&self, key: &str) -> Option<(User, Machine)> {
        let users = self.users.read().await;
        for user in users.iter() {
            if let Some(machine) = user.machines.iter().find(|m| m.agent_key == key) {
                return Some((user.clone(), machine.clone()));
            }
        }
        None
    }

    pub async fn get_user(&self, user_id: &str) -> Option<User> {
        let users = self.users.read().await;
        users.iter().find(|u| u.id == user_id).cloned()
    }

    pub async fn get_machines(&self, user_id: &str) -> Option<Vec<Machine>> {
        let users = self.users.read().await;
        users
            .iter()
            .find(|u| u.id == user_id)
            .map(|u| u.machines.clone())
    }

    pub async fn get_machine(&self, user_id: &str, machine_id: &str) -> Option<Machine> {
        let users = self.users.read().await;
        users
            .iter()
            .find(|u| u.id == user_id)?
            .machines
            .iter()
            .find(|m| m.id == machine_id)
            .cloned()
    }

    pub async fn add_machine(&self, user_id: &str, name: &str) -> Result<Machine> {
        let mut users = self.users.write().await;
        let user = users
            .iter_mut()
            .find(|u| u.id == user_id)
            .ok_or_else(|| anyhow::anyhow!("unknown user {user_id}"))?;

        let mut id = fresh_machine_id();
        while user.machines.iter().any(|m| m.id == id) {
            id = fresh_machine_id();
        }

        let machine = Machine {
            id,
            name: name.to_string(),
            agent_key: generate_token(),
            mac_address: None,
            broadcast_address: None,
        };
        user.machines.push(machine.clone());
        drop(users);
        self.persist().await?;
        Ok(machine)
    }

    pub async fn rename_machine(&self, user_id: &str, machine_id: &str, name: &str) -> Result<()> {
        {
            let mut users = self.users.write().await;
            let user = users
                .iter_mut()
                .find(|u| u.id == user_id)
                .ok_or_else(|| anyhow::anyhow!("unknown user {user_id}"))?;
            let machine = user
                .machines
                .iter_mut()
                .find(|m| m.id == machine_id)
                .ok_or_else(|| anyhow::anyhow!("unknown machine {machine_id}"))?;
            machine.name = name.to_string();
        }
        self.persist().await
    }

    pub async fn remove_machine(&self, user_id: &str, machine_id: &str) -> Result<()> {
        {
            let mut users = self.users.write().await;
            let user = users
                .iter_mut()
                .find(|u| u.id == user_id)
                .ok_or_else(|| anyhow::anyhow!("unknown user {user_id}"))?;
            let before = user.machines.len();
            user.machines.retain(|m| m.id != machine_id);
            if user.machines.len() == before {
                anyhow::bail!("unknown machine {machine_id}");
            }
        }
        self.persist().await
    }

    pub async fn set_mac_address(
        &self,
        user_id: &str,
        machine_id: &str,
        mac_address: Option<String>,
        broadcast_address: Option<String>,
    ) -> Result<()> {
        {
            let mut users = self.users.write().await;
            let user = users
                .iter_mut()
                .find(|u| u.id == user_id)
                .ok_or_else(|| anyhow::anyhow!("unknown user {user_id}"))?;
            let machine = user
                .machines
                .iter_mut()
                .find(|m| m.id == machine_id)
                .ok_or_else(|| anyhow::anyhow!("unknown machine {machine_id}"))?;
            machine.mac_address = mac_address;
            machine.broadcast_address = broadcast_address;
        }
        self.persist().await
    }

    /// Atomically rewrite the entire document (write-temp, rename).
    async fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let users = self.users.read().await;
        let data = serde_json::to_string_pretty(&*users)?;
        drop(users);

        let tmp_path = self.path.with_extension("json.tmp");
        write_restricted(&tmp_path, &data)
            .await
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| format!("failed to rename into {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(unix)]
async fn write_restricted(path: &Path, data: &str) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .await?;
    file.write_all(data.as_bytes()).await
}

#[cfg(not(unix))]
async fn write_restricted(path: &Path, data: &str) -> std::io::Result<()> {
    tokio::fs::write(path, data).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn init_seeds_two_demo_users_when_missing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("users.json");
        let store = UserStore::init(&path).await.unwrap();

        let kingpin = store.authenticate_by_password("kingpin").await;
        assert!(kingpin.is_some());
        assert_eq!(kingpin.unwrap().display_name, "Kingpin");

        let tez = store.authenticate_by_password("tez").await;
        assert!(tez.is_some());
        assert_eq!(tez.unwrap().display_name, "Tez");

        assert!(path.exists());
    }

    #[tokio::test]
    async fn authenticate_rejects_wrong_password() {
        let dir = tempdir().unwrap();
        let store = UserStore::init(dir.path().join("users.json")).await.unwrap();
        assert!(store.authenticate_by_password("not-a-password").await.is_none());
    }

    #[tokio::test]
    async fn add_machine_generates_fresh_id_and_key() {
        let dir = tempdir().unwrap();
        let store = UserStore::init(dir.path().join("users.json")).await.unwrap();
        let machine = store.add_machine("kingpin", "Second PC").await.unwrap();
        assert!(machine.id.starts_with('m'));
        assert_eq!(machine.name, "Second PC");

        let machines = store.get_machines("kingpin").await.unwrap();
        assert_eq!(machines.len(), 2);
    }

    #[tokio::test]
    async fn get_by_agent_key_resolves_user_and_machine() {
        let dir = tempdir().unwrap();
        let store = UserStore::init(dir.path().join("users.json")).await.unwrap();
        let machines = store.get_machines("kingpin").await.unwrap();
        let key = machines[0].agent_key.clone();

        let (user, machine) = store.get_by_agent_key(&key).await.unwrap();
        assert_eq!(user.id, "kingpin");
        assert_eq!(machine.id, machines[0].id);
    }

    #[tokio::test]
    async fn set_mac_address_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("users.json");
        let store = UserStore::init(&path).await.unwrap();
        let machine_id = store.get_machines("kingpin").await.unwrap()[0].id.clone();

        store
            .set_mac_address(
                "kingpin",
                &machine_id,
                Some("11:22:33:44:55:66".to_string()),
                Some("192.168.1.255".to_string()),
            )
            .await
            .unwrap();

        let machine = store.get_machine("kingpin", &machine_id).await.unwrap();
        assert_eq!(machine.mac_address.as_deref(), Some("11:22:33:44:55:66"));
    }

    #[tokio::test]
    async fn remove_machine_then_rename_fails() {
        let dir = tempdir().unwrap();
        let store = UserStore::init(dir.path().join("users.json")).await.unwrap();
        let machine_id = store.get_machines("kingpin").await.unwrap()[0].id.clone();
        store.remove_machine("kingpin", &machine_id).await.unwrap();
        assert!(store.rename_machine("kingpin", &machine_id, "x").await.is_err());
    }

    #[tokio::test]
    async fn legacy_record_migrates_to_machines_list() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("users.json");
        let legacy = serde_json::json!([
            {
                "id": "legacy",
                "displayName": "Legacy",
                "passwordHash": hash_password("legacy").unwrap(),
                "agentKey": "deadbeefdeadbeefdeadbeefdeadbeef",
                "macAddress": "AA:BB:CC:DD:EE:FF"
            }
        ]);
        tokio::fs::write(&path, serde_json::to_string(&legacy).unwrap())
            .await
            .unwrap();

        let store = UserStore::init(&path).await.unwrap();
        let machines = store.get_machines("legacy").await.unwrap();
        assert_eq!(machines.len(), 1);
        assert_eq!(machines[0].agent_key, "deadbeefdeadbeefdeadbeefdeadbeef");
        assert_eq!(machines[0].mac_address.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
    }

    #[test]
    fn would_collide_is_symmetric_with_verify() {
        let hash = hash_password("shared-secret").unwrap();
        assert!(verify_password("shared-secret", &hash));
        assert!(!verify_password("other", &hash));
    }
}
