//! Backend configuration types.
//!
//! `BackendConfig` is the top-level table of a
//! `multiact.toml` file. Every field has a default, so an empty file is valid.

use serde::{Deserialize, Serialize};

/// Settings for lowering and launching a pipeline on the external runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Runner executable (looked up on `PATH`).
    #[serde(default = "default_runner")]
    pub runner: String,

    /// Parallelism handed to the runner (`--cores`). Values below 1 are raised to 1.
    #[serde(default = "default_cores")]
    pub cores: u32,

    /// Detach the runner with `nohup` so it survives the caller.
    #[serde(default)]
    pub background: bool,

    /// Re-execute every rule regardless of existing outputs.
    #[serde(default)]
    pub force_run: bool,

    /// Run container rules in an isolated Singularity environment.
    #[serde(default)]
    pub use_singularity: bool,

    /// Print executed shell commands into the log.
    #[serde(default = "default_print_commands")]
    pub print_commands: bool,

    /// Optional log-collection command the runner's output is piped into.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_shipper: Option<String>,

    /// File name of the rendered workflow description.
    #[serde(default = "default_workflow_file_name")]
    pub workflow_file_name: String,

    /// File name of the run log inside the working directory.
    #[serde(default = "default_log_file_name")]
    pub log_file_name: String,
}

fn default_runner() -> String {
    "snakemake".to_string()
}

fn default_cores() -> u32 {
    1
}

fn default_print_commands() -> bool {
    true
}

fn default_workflow_file_name() -> String {
    "Snakefile".to_string()
}

fn default_log_file_name() -> String {
    "multiact.log".to_string()
}

impl BackendConfig {
    pub fn effective_cores(&self) -> u32 {
        self.cores.max(1)
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            runner: default_runner(),
            cores: default_cores(),
            background: false,
            force_run: false,
            use_singularity: false,
            print_commands: default_print_commands(),
            log_shipper: None,
            workflow_file_name: default_workflow_file_name(),
            log_file_name: default_log_file_name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_config_default_values() {
        let config = BackendConfig::default();
        assert_eq!(config.runner, "snakemake");
        assert_eq!(config.cores, 1);
        assert!(!config.background);
        assert!(config.print_commands);
        assert!(config.log_shipper.is_none());
        assert_eq!(config.workflow_file_name, "Snakefile");
    }

    #[test]
    fn test_backend_config_deserialize_with_defaults() {
        let config: BackendConfig = toml::from_str("").unwrap();
        assert_eq!(config, BackendConfig::default());
    }

    #[test]
    fn test_backend_config_deserialize_with_values() {
        let toml_str = r#"
runner = "/opt/snakemake/bin/snakemake"
cores = 16
background = true
force_run = true
use_singularity = true
print_commands = false
log_shipper = "logger -t multiact"
"#;
        let config: BackendConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.runner, "/opt/snakemake/bin/snakemake");
        assert_eq!(config.cores, 16);
        assert!(config.background);
        assert!(config.force_run);
        assert!(config.use_singularity);
        assert!(!config.print_commands);
        assert_eq!(config.log_shipper.as_deref(), Some("logger -t multiact"));
        assert_eq!(config.log_file_name, "multiact.log");
    }

    #[test]
    fn test_effective_cores_floor() {
        let config = BackendConfig {
            cores: 0,
            ..BackendConfig::default()
        };
        assert_eq!(config.effective_cores(), 1);
    }
}
