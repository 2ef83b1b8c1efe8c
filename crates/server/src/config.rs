use std::path::Path;

use anyhow::{Context, Result};
use relay_protocol::RelayConfig;

/// Load configuration from a TOML file at the given path, falling back to
/// defaults if it doesn't exist, then apply the three environment-variable
/// overrides named in `spec.md` §6.
pub fn load_config(path: &Path) -> Result<RelayConfig> {
    let mut config = if path.exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: RelayConfig =
            toml::from_str(&contents).context("failed to parse config TOML")?;
        tracing::info!(path = %path.display(), "loaded config");
        config
    } else {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        RelayConfig::default()
    };

    apply_env_overrides(&mut config);
    Ok(config)
}

fn apply_env_overrides(config: &mut RelayConfig) {
    if let Ok(port) = std::env::var("PORT") {
        match port.parse() {
            Ok(p) => config.server.port = p,
            Err(_) => tracing::warn!(value = %port, "ignoring invalid PORT env var"),
        }
    }
    if let Ok(value) = std::env::var("MAX_LOGIN_ATTEMPTS") {
        match value.parse() {
            Ok(n) => config.security.max_login_attempts = n,
            Err(_) => tracing::warn!(value = %value, "ignoring invalid MAX_LOGIN_ATTEMPTS env var"),
        }
    }
    if let Ok(value) = std::env::var("LOCKOUT_MINUTES") {
        match value.parse() {
            Ok(n) => config.security.lockout_minutes = n,
            Err(_) => tracing::warn!(value = %value, "ignoring invalid LOCKOUT_MINUTES env var"),
        }
    }
}
