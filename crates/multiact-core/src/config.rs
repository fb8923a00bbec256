//! Backend configuration loader.
//!
//! Reads `multiact.toml` from a configuration directory and deserializes it
//! into [`BackendConfig`]. Falls back to defaults when the file is missing or
//! malformed.

use std::path::Path;

use multiact_types::config::BackendConfig;

/// File name looked up inside the configuration directory.
pub const CONFIG_FILE_NAME: &str = "multiact.toml";

/// Parse the contents of a `multiact.toml` file. Cores below 1 are raised to 1.
pub fn parse_backend_config(content: &str) -> Result<BackendConfig, toml::de::Error> {
    let mut config: BackendConfig = toml::from_str(content)?;
    config.cores = config.effective_cores();
    Ok(config)
}

/// Load backend configuration from `{config_dir}/multiact.toml`.
///
/// Never fails: a missing file yields [`BackendConfig::default()`] and an
/// unreadable or unparsable one is logged and replaced by the default.
pub async fn load_backend_config(config_dir: &Path) -> BackendConfig {
    let path = config_dir.join(CONFIG_FILE_NAME);

    let loaded = match tokio::fs::read_to_string(&path).await {
        Ok(content) => parse_backend_config(&content).map_err(|e| e.to_string()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no backend config, using defaults");
            return BackendConfig::default();
        }
        Err(e) => Err(e.to_string()),
    };

    loaded.unwrap_or_else(|error| {
        tracing::warn!(path = %path.display(), %error, "ignoring backend config, using defaults");
        BackendConfig::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_backend_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_backend_config(tmp.path()).await;
        assert_eq!(config, BackendConfig::default());
    }

    #[tokio::test]
    async fn load_backend_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join(CONFIG_FILE_NAME),
            r#"
cores = 8
use_singularity = true
log_shipper = "vector --config /etc/vector.toml"
"#,
        )
        .await
        .unwrap();

        let config = load_backend_config(tmp.path()).await;
        assert_eq!(config.cores, 8);
        assert!(config.use_singularity);
        assert_eq!(
            config.log_shipper.as_deref(),
            Some("vector --config /etc/vector.toml")
        );
        assert_eq!(config.runner, "snakemake");
    }

    #[test]
    fn parse_backend_config_clamps_cores() {
        let config = parse_backend_config("cores = 0\nrunner = \"/opt/snakemake/bin/snakemake\"").unwrap();
        assert_eq!(config.cores, 1);
        assert_eq!(config.runner, "/opt/snakemake/bin/snakemake");
        assert!(parse_backend_config("cores = \"many\"").is_err());
    }

    #[tokio::test]
    async fn load_backend_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join(CONFIG_FILE_NAME), "cores = [not valid")
            .await
            .unwrap();

        let config = load_backend_config(tmp.path()).await;
        assert_eq!(config, BackendConfig::default());
    }
}
