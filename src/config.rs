use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

pub const DEFAULT_MAX_WORKERS: usize = 6;
pub const DEFAULT_MAX_FILE_SIZE_BYTES: u64 = 50 * 1024 * 1024;
pub const DEFAULT_TASK_DELAY_SECONDS: f64 = 0.01;
pub const DEFAULT_MAX_QR_CONTENT_LENGTH: usize = 500;

/// Runtime configuration, resolved once at startup and passed by reference
/// into the batch runner. Sources, later overriding earlier: built-in
/// defaults, an optional YAML file, environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Worker pool size; 0 means one worker per CPU core.
    pub max_workers: usize,
    pub max_file_size_bytes: u64,
    pub require_signature: bool,
    pub signature_secret: String,
    /// Artificial delay before each unit of work, in seconds.
    pub task_delay_seconds: f64,
    pub audit_log_path: PathBuf,
    pub app_log_path: PathBuf,
    pub max_qr_content_length: usize,
}

#[derive(Deserialize, Debug, Default)]
struct FileConfig {
    max_workers: Option<usize>,
    max_file_size_bytes: Option<u64>,
    require_signature: Option<bool>,
    signature_secret: Option<String>,
    task_delay_seconds: Option<f64>,
    audit_log_path: Option<PathBuf>,
    app_log_path: Option<PathBuf>,
    max_qr_content_length: Option<usize>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            max_file_size_bytes: DEFAULT_MAX_FILE_SIZE_BYTES,
            require_signature: false,
            signature_secret: String::new(),
            task_delay_seconds: DEFAULT_TASK_DELAY_SECONDS,
            audit_log_path: PathBuf::from("/tmp/generate_audit.jsonl"),
            app_log_path: PathBuf::from("/tmp/generate.log"),
            max_qr_content_length: DEFAULT_MAX_QR_CONTENT_LENGTH,
        }
    }
}

impl AppConfig {
    /// Resolves the effective configuration from defaults, an optional YAML
    /// file and the process environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(path) = file {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            let parsed: FileConfig = serde_yaml::from_str(&raw)
                .with_context(|| format!("failed to parse config YAML from {}", path.display()))?;
            config.apply_file(parsed);
        }
        config.apply_env(|key| env::var(key).ok());
        Ok(config)
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(v) = file.max_workers {
            self.max_workers = v;
        }
        if let Some(v) = file.max_file_size_bytes {
            self.max_file_size_bytes = v;
        }
        if let Some(v) = file.require_signature {
            self.require_signature = v;
        }
        if let Some(v) = file.signature_secret {
            self.signature_secret = v;
        }
        if let Some(v) = file.task_delay_seconds {
            self.task_delay_seconds = v;
        }
        if let Some(v) = file.audit_log_path {
            self.audit_log_path = v;
        }
        if let Some(v) = file.app_log_path {
            self.app_log_path = v;
        }
        if let Some(v) = file.max_qr_content_length {
            self.max_qr_content_length = v;
        }
    }

    /// Environment overrides; the lookup is injected so tests never have to
    /// mutate the real process environment.
    fn apply_env<F: Fn(&str) -> Option<String>>(&mut self, lookup: F) {
        if let Some(v) = lookup("MAX_WORKERS").and_then(|v| v.parse().ok()) {
            self.max_workers = v;
        }
        if let Some(v) = lookup("MAX_FILE_SIZE_BYTES").and_then(|v| v.parse().ok()) {
            self.max_file_size_bytes = v;
        }
        if let Some(v) = lookup("REQUIRE_SIGNATURE") {
            self.require_signature = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Some(v) = lookup("SIGNATURE_SECRET") {
            self.signature_secret = v;
        }
        if let Some(v) = lookup("RATE_LIMIT_DELAY_SECONDS").and_then(|v| v.parse().ok()) {
            self.task_delay_seconds = v;
        }
        if let Some(v) = lookup("AUDIT_LOG_PATH") {
            self.audit_log_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("APP_LOG_PATH") {
            self.app_log_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("MAX_QR_CONTENT_LENGTH").and_then(|v| v.parse().ok()) {
            self.max_qr_content_length = v;
        }
    }

    pub fn effective_workers(&self) -> usize {
        if self.max_workers == 0 {
            num_cpus::get()
        } else {
            self.max_workers
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.max_workers, 6);
        assert_eq!(config.max_file_size_bytes, 50 * 1024 * 1024);
        assert!(!config.require_signature);
        assert_eq!(config.max_qr_content_length, 500);
    }

    #[test]
    fn yaml_file_overrides_defaults() {
        let mut config = AppConfig::default();
        let parsed: FileConfig = serde_yaml::from_str(
            "max_workers: 2\nmax_qr_content_length: 120\naudit_log_path: /tmp/other.jsonl\n",
        )
        .unwrap();
        config.apply_file(parsed);
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.max_qr_content_length, 120);
        assert_eq!(config.audit_log_path, PathBuf::from("/tmp/other.jsonl"));
        // untouched keys keep their defaults
        assert_eq!(config.max_file_size_bytes, DEFAULT_MAX_FILE_SIZE_BYTES);
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = AppConfig::default();
        config.max_workers = 2;
        let env: HashMap<&str, &str> = [
            ("MAX_WORKERS", "8"),
            ("REQUIRE_SIGNATURE", "1"),
            ("RATE_LIMIT_DELAY_SECONDS", "0.5"),
        ]
        .into_iter()
        .collect();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.max_workers, 8);
        assert!(config.require_signature);
        assert_eq!(config.task_delay_seconds, 0.5);
    }

    #[test]
    fn unparseable_env_values_are_ignored() {
        let mut config = AppConfig::default();
        config.apply_env(|key| (key == "MAX_WORKERS").then(|| "not-a-number".to_string()));
        assert_eq!(config.max_workers, DEFAULT_MAX_WORKERS);
    }

    #[test]
    fn zero_workers_means_cpu_count() {
        let mut config = AppConfig::default();
        config.max_workers = 0;
        assert_eq!(config.effective_workers(), num_cpus::get());
        config.max_workers = 3;
        assert_eq!(config.effective_workers(), 3);
    }
}
