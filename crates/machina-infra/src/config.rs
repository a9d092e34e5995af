//! Engine configuration loader.
//!
//! Reads `machina.toml` from the data directory and deserializes it into
//! [`EngineConfig`]. A missing or malformed file falls back to the defaults
//! with a log line; the engine always starts.

use std::path::{Path, PathBuf};

use machina_types::config::EngineConfig;

pub const CONFIG_FILE: &str = "machina.toml";

/// Data directory from `MACHINA_DATA_DIR`, falling back to `~/.machina`.
pub fn default_data_dir() -> PathBuf {
    match std::env::var("MACHINA_DATA_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".machina")
        }
    }
}

/// Load `{data_dir}/machina.toml`.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join(CONFIG_FILE);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No {CONFIG_FILE} found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", config_path.display());
            EngineConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use machina_types::guardrail::GuardSpec;
    use machina_types::resilience::BackoffKind;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.run_timeout_secs, 1800);
        assert!(!config.fail_fast);
    }

    #[tokio::test]
    async fn partial_file_overrides_selected_fields() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join(CONFIG_FILE),
            r#"
max_concurrency = 2
fail_fast = true

[retry]
max_attempts = 5
base_delay_ms = 50
max_delay_ms = 2000
backoff = "decorrelated_jitter"

[services.cms]
failure_threshold = 2

[guards.pii]
type = "pii"
mode = "redact"

[guards.outbound]
type = "domain_policy"
denied = ["evil.com"]
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.max_concurrency, 2);
        assert!(config.fail_fast);
        assert_eq!(config.node_timeout_secs, 300);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.backoff, BackoffKind::DecorrelatedJitter);
        assert_eq!(config.services["cms"].failure_threshold, 2);
        assert!(matches!(config.guards["pii"], GuardSpec::Pii { .. }));
        assert_eq!(
            config.guards["outbound"],
            GuardSpec::DomainPolicy {
                allowed: vec![],
                denied: vec!["evil.com".into()],
            }
        );
    }

    #[tokio::test]
    async fn malformed_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join(CONFIG_FILE), "max_concurrency = \"many\"")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config, EngineConfig::default());
    }
}
