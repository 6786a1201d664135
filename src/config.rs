//! Configuration surface.
//!
//! `Config::load` resolves settings through a precedence chain — explicit
//! path beats environment beats on-disk file beats built-in default — and
//! loads the file with the `toml` crate.

use std::path::{Path, PathBuf};

use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

/// Audio formats accepted at submission.
pub const SUPPORTED_AUDIO_FORMATS: &[&str] = &["mp3", "wav", "m4a", "ogg", "flac", "aac", "wma"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub work_dir: PathBuf,
    pub whisper_model: crate::job::ModelSize,
    pub device: crate::job::DeviceHint,
    pub use_gpu: bool,
    pub max_file_size: u64,
    pub max_processing_time_secs: u64,
    pub retain_hours: i64,
    pub worker_concurrency: usize,
    pub batch_max_concurrent: u32,
    pub hf_token: Option<String>,
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            work_dir: default_work_dir(),
            whisper_model: crate::job::ModelSize::Base,
            device: crate::job::DeviceHint::Auto,
            use_gpu: true,
            max_file_size: 5 * 1024 * 1024 * 1024,
            max_processing_time_secs: 3600,
            retain_hours: 48,
            worker_concurrency: 2,
            batch_max_concurrent: 5,
            hf_token: None,
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

fn default_work_dir() -> PathBuf {
    if let Some(base_dirs) = BaseDirs::new() {
        #[cfg(windows)]
        let base = base_dirs.data_local_dir().to_path_buf();
        #[cfg(not(windows))]
        let base = base_dirs.home_dir().join(".local").join("share");
        return base.join("transcribe-orchestrator");
    }
    PathBuf::from("~/.local/share/transcribe-orchestrator")
}

/// Default on-disk config location: `$XDG_CONFIG_HOME/transcribe-orchestrator/config.toml`,
/// falling back to `~/.config/transcribe-orchestrator/config.toml`.
fn default_config_path() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        if !xdg.is_empty() {
            return PathBuf::from(xdg)
                .join("transcribe-orchestrator")
                .join("config.toml");
        }
    }
    if let Some(base_dirs) = BaseDirs::new() {
        #[cfg(windows)]
        let base = base_dirs.config_dir().to_path_buf();
        #[cfg(not(windows))]
        let base = base_dirs.home_dir().join(".config");
        return base.join("transcribe-orchestrator").join("config.toml");
    }
    PathBuf::from("~/.config/transcribe-orchestrator/config.toml")
}

impl Config {
    /// Resolve configuration: `explicit_path` > `TRANSCRIBE_CONFIG` env var
    /// > on-disk TOML at the default location (if present) > built-in
    /// defaults. `work_dir` and `hf_token` are then layered on top from
    /// `TRANSCRIBE_WORK_DIR` / `TRANSCRIBE_HF_TOKEN`, regardless of where
    /// the rest of the config came from.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let path = explicit_path
            .map(PathBuf::from)
            .or_else(|| std::env::var("TRANSCRIBE_CONFIG").ok().map(PathBuf::from))
            .or_else(|| {
                let default_path = default_config_path();
                default_path.is_file().then_some(default_path)
            });

        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Config::default(),
        };

        if let Ok(work_dir) = std::env::var("TRANSCRIBE_WORK_DIR") {
            if !work_dir.is_empty() {
                config.work_dir = PathBuf::from(work_dir);
            }
        }
        if let Ok(token) = std::env::var("TRANSCRIBE_HF_TOKEN") {
            if !token.is_empty() {
                config.hf_token = Some(token);
            }
        }

        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| OrchestratorError::server(format!("read config {}: {e}", path.display())))?;
        toml::from_str(&contents)
            .map_err(|e| OrchestratorError::server(format!("parse config {}: {e}", path.display())))
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.work_dir.join("artifacts")
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.work_dir.join("jobs")
    }

    pub fn retain_horizon(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retain_hours)
    }

    pub fn max_processing_time(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.max_processing_time_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_values() {
        let config = Config::default();
        assert_eq!(config.worker_concurrency, 2);
        assert_eq!(config.batch_max_concurrent, 5);
        assert_eq!(config.retain_hours, 48);
        assert_eq!(config.max_file_size, 5 * 1024 * 1024 * 1024);
    }

    #[test]
    fn explicit_path_wins_over_missing_file_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "worker_concurrency = 4\nretain_hours = 12\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.worker_concurrency, 4);
        assert_eq!(config.retain_hours, 12);
    }

    #[test]
    fn unset_fields_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(&path, "worker_concurrency = 8\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.worker_concurrency, 8);
        assert_eq!(config.batch_max_concurrent, 5);
    }
}
