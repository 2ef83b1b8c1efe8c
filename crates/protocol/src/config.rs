use serde::{Deserialize, Serialize};

/// Top-level configuration for the relay process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub invite: InviteConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the HTTP/socket listener.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Listen port. Overridden by the `PORT` environment variable.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path to the persisted user/machine document.
    #[serde(default = "default_users_file")]
    pub users_file: String,
    /// Broadcast address used for Wake-on-LAN when a machine has none of its own.
    #[serde(default = "default_broadcast_address")]
    pub default_broadcast_address: String,
    /// UDP port Wake-on-LAN packets are sent to.
    #[serde(default = "default_wake_port")]
    pub wake_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Login attempts allowed per source before lockout.
    /// Overridden by the `MAX_LOGIN_ATTEMPTS` environment variable.
    #[serde(default = "default_max_login_attempts")]
    pub max_login_attempts: u32,
    /// Lockout window in minutes after `max_login_attempts` is exceeded.
    /// Overridden by the `LOCKOUT_MINUTES` environment variable.
    #[serde(default = "default_lockout_minutes")]
    pub lockout_minutes: u64,
    /// Wake-on-LAN attempts allowed per source per minute.
    #[serde(default = "default_wake_rate_limit")]
    pub wake_rate_limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Inactivity TTL for login sessions, in hours.
    #[serde(default = "default_session_ttl_hours")]
    pub ttl_hours: u64,
    /// How often the session sweeper runs, in minutes.
    #[serde(default = "default_sweep_interval_minutes")]
    pub sweep_interval_minutes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteConfig {
    /// Absolute expiry for invite tokens, in days.
    #[serde(default = "default_invite_ttl_days")]
    pub ttl_days: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            users_file: default_users_file(),
            default_broadcast_address: default_broadcast_address(),
            wake_port: default_wake_port(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_login_attempts: default_max_login_attempts(),
            lockout_minutes: default_lockout_minutes(),
            wake_rate_limit: default_wake_rate_limit(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_hours: default_session_ttl_hours(),
            sweep_interval_minutes: default_sweep_interval_minutes(),
        }
    }
}

impl Default for InviteConfig {
    fn default() -> Self {
        Self {
            ttl_days: default_invite_ttl_days(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            security: SecurityConfig::default(),
            session: SessionConfig::default(),
            invite: InviteConfig::default(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3456
}
fn default_users_file() -> String {
    "data/users.json".to_string()
}
fn default_broadcast_address() -> String {
    "255.255.255.255".to_string()
}
fn default_wake_port() -> u16 {
    9
}
fn default_max_login_attempts() -> u32 {
    5
}
fn default_lockout_minutes() -> u64 {
    15
}
fn default_wake_rate_limit() -> u32 {
    5
}
fn default_session_ttl_hours() -> u64 {
    24
}
fn default_sweep_interval_minutes() -> u64 {
    10
}
fn default_invite_ttl_days() -> u64 {
    7
}

impl RelayConfig {
    /// Validate semantic constraints beyond what serde/toml already enforce.
    /// Returns a list of `ERROR:`/`WARNING:`-prefixed issues; any `ERROR:` should
    /// prevent the process from starting.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push("ERROR: server.port must be between 1 and 65535, got 0.".to_string());
        }

        if self.server.users_file.trim().is_empty() {
            issues.push("ERROR: server.users_file must not be empty.".to_string());
        }

        if self.server.wake_port == 0 {
            issues.push("ERROR: server.wake_port must be between 1 and 65535, got 0.".to_string());
        }

        if self
            .server
            .default_broadcast_address
            .parse::<std::net::Ipv4Addr>()
            .is_err()
        {
            issues.push(format!(
                "ERROR: server.default_broadcast_address '{}' is not a valid IPv4 dotted-quad.",
                self.server.default_broadcast_address
            ));
        }

        if self.security.max_login_attempts == 0 {
            issues.push(
                "ERROR: security.max_login_attempts must be at least 1.".to_string(),
            );
        } else if self.security.max_login_attempts > 1000 {
            issues.push(
                "WARNING: security.max_login_attempts is unusually high (> 1000).".to_string(),
            );
        }

        if self.security.lockout_minutes == 0 {
            issues.push(
                "WARNING: security.lockout_minutes is 0 — login lockout is effectively disabled."
                    .to_string(),
            );
        }

        if self.security.wake_rate_limit == 0 {
            issues.push(
                "WARNING: security.wake_rate_limit is 0 — Wake-on-LAN rate limiting is effectively disabled."
                    .to_string(),
            );
        }

        if self.session.ttl_hours == 0 {
            issues.push("ERROR: session.ttl_hours must be at least 1.".to_string());
        }

        if self.session.sweep_interval_minutes == 0 {
            issues.push(
                "WARNING: session.sweep_interval_minutes is 0 — the sweeper will busy-loop."
                    .to_string(),
            );
        }

        if self.invite.ttl_days == 0 {
            issues.push("ERROR: invite.ttl_days must be at least 1.".to_string());
        }

        if issues.iter().any(|i| i.starts_with("ERROR:")) {
            Err(issues)
        } else if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> RelayConfig {
        RelayConfig::default()
    }

    fn validate_issues(config: &RelayConfig) -> Vec<String> {
        match config.validate() {
            Ok(()) => vec![],
            Err(issues) => issues,
        }
    }

    fn has_error(issues: &[String], substring: &str) -> bool {
        issues
            .iter()
            .any(|i| i.starts_with("ERROR:") && i.contains(substring))
    }

    fn has_warning(issues: &[String], substring: &str) -> bool {
        issues
            .iter()
            .any(|i| i.starts_with("WARNING:") && i.contains(substring))
    }

    #[test]
    fn config_defaults_from_empty_toml() {
        let config: RelayConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 3456);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.wake_port, 9);
        assert_eq!(config.server.default_broadcast_address, "255.255.255.255");
        assert_eq!(config.security.max_login_attempts, 5);
        assert_eq!(config.security.lockout_minutes, 15);
        assert_eq!(config.security.wake_rate_limit, 5);
        assert_eq!(config.session.ttl_hours, 24);
        assert_eq!(config.session.sweep_interval_minutes, 10);
        assert_eq!(config.invite.ttl_days, 7);
    }

    #[test]
    fn partial_config_merges_with_defaults() {
        let toml_str = r#"
            [server]
            port = 8080
        "#;
        let config: RelayConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.security.max_login_attempts, 5);
    }

    #[test]
    fn validate_default_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn validate_port_zero_is_error() {
        let mut config = valid_config();
        config.server.port = 0;
        assert!(has_error(&validate_issues(&config), "port"));
    }

    #[test]
    fn validate_empty_users_file_is_error() {
        let mut config = valid_config();
        config.server.users_file = "   ".to_string();
        assert!(has_error(&validate_issues(&config), "users_file"));
    }

    #[test]
    fn validate_bad_broadcast_address_is_error() {
        let mut config = valid_config();
        config.server.default_broadcast_address = "not-an-ip".to_string();
        assert!(has_error(&validate_issues(&config), "default_broadcast_address"));
    }

    #[test]
    fn validate_zero_login_attempts_is_error() {
        let mut config = valid_config();
        config.security.max_login_attempts = 0;
        assert!(has_error(&validate_issues(&config), "max_login_attempts"));
    }

    #[test]
    fn validate_huge_login_attempts_is_warning() {
        let mut config = valid_config();
        config.security.max_login_attempts = 5000;
        assert!(has_warning(&validate_issues(&config), "max_login_attempts"));
    }

    #[test]
    fn validate_zero_session_ttl_is_error() {
        let mut config = valid_config();
        config.session.ttl_hours = 0;
        assert!(has_error(&validate_issues(&config), "ttl_hours"));
    }

    #[test]
    fn validate_zero_invite_ttl_is_error() {
        let mut config = valid_config();
        config.invite.ttl_days = 0;
        assert!(has_error(&validate_issues(&config), "ttl_days"));
    }

    #[test]
    fn validate_zero_lockout_minutes_is_warning_not_error() {
        let mut config = valid_config();
        config.security.lockout_minutes = 0;
        let issues = validate_issues(&config);
        assert!(has_warning(&issues, "lockout_minutes"));
        assert!(!has_error(&issues, "lockout_minutes"));
    }
}
