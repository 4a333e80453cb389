//! Working-directory layout and daemon configuration.
//!
//! Everything the daemon touches lives under one working directory:
//! the fifo directory with the persistent state files and control
//! fifos, the file spool, and `etc/` with the operator-editable
//! configuration. The layout is shared with the surrounding tooling,
//! so the path helpers here are the single source of truth for it.

pub mod paths;

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Load(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Fallback used when `max_connections` is absent or out of range.
pub const MAX_DEFAULT_CONNECTIONS: u32 = 50;
/// Hard ceiling on parallel worker processes.
pub const MAX_CONFIGURABLE_CONNECTIONS: u32 = 512;
/// Default seconds between retrieve-poller rounds.
pub const DEFAULT_REMOTE_FILE_CHECK_INTERVAL: u32 = 150;
/// Default cap on rotated output log files.
pub const MAX_OUTPUT_LOG_FILES: u32 = 6;

/// Operator configuration, read from `etc/fd.conf`.
///
/// Out-of-range values are clamped back to the defaults rather than
/// refusing to start; a transfer scheduler that stays down over a typo
/// helps nobody.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FdConfig {
    pub max_connections: u32,
    pub remote_file_check_interval: u32,
    /// Seconds a job may wait in the queue; 0 disables the age check.
    pub default_age_limit: u32,
    pub max_output_log_files: u32,
    pub create_target_dir: bool,
    pub default_smtp_server: Option<String>,
    pub default_smtp_from: Option<String>,
}

impl Default for FdConfig {
    fn default() -> Self {
        FdConfig {
            max_connections: MAX_DEFAULT_CONNECTIONS,
            remote_file_check_interval: DEFAULT_REMOTE_FILE_CHECK_INTERVAL,
            default_age_limit: 0,
            max_output_log_files: MAX_OUTPUT_LOG_FILES,
            create_target_dir: false,
            default_smtp_server: None,
            default_smtp_from: None,
        }
    }
}

impl FdConfig {
    /// Load the configuration under `workdir`. A missing file yields
    /// the defaults.
    pub fn load(workdir: &Path) -> Result<Self> {
        Self::load_file(&paths::config_file(workdir))
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let loaded = config::Config::builder()
            .add_source(
                config::File::from(path.to_path_buf())
                    .format(config::FileFormat::Toml)
                    .required(false),
            )
            .build()?;
        let mut cfg: FdConfig = loaded.try_deserialize()?;
        cfg.clamp();
        Ok(cfg)
    }

    fn clamp(&mut self) {
        if self.max_connections < 1
            || self.max_connections > MAX_CONFIGURABLE_CONNECTIONS
        {
            tracing::warn!(
                max_connections = self.max_connections,
                "max_connections out of range, using default"
            );
            self.max_connections = MAX_DEFAULT_CONNECTIONS;
        }
        if self.remote_file_check_interval < 1 {
            self.remote_file_check_interval =
                DEFAULT_REMOTE_FILE_CHECK_INTERVAL;
        }
        if self.max_output_log_files < 1 || self.max_output_log_files > 599 {
            self.max_output_log_files = MAX_OUTPUT_LOG_FILES;
        }
    }
}

/// The resolved working directory.
#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    /// Resolve and create the directory skeleton.
    pub fn init(root: &Path) -> Result<Self> {
        for dir in [
            root.to_path_buf(),
            paths::fifo_dir(root),
            paths::etc_dir(root),
            root.join("files/outgoing"),
            root.join("files/outgoing/.error"),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(WorkDir {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = FdConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.max_connections, MAX_DEFAULT_CONNECTIONS);
        assert_eq!(
            cfg.remote_file_check_interval,
            DEFAULT_REMOTE_FILE_CHECK_INTERVAL
        );
        assert_eq!(cfg.default_age_limit, 0);
        assert!(!cfg.create_target_dir);
    }

    #[test]
    fn values_are_read_and_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let etc = paths::etc_dir(dir.path());
        std::fs::create_dir_all(&etc).unwrap();
        std::fs::write(
            etc.join("fd.conf"),
            r#"
max_connections = 100000
remote_file_check_interval = 60
default_age_limit = 3600
create_target_dir = true
default_smtp_server = "mail.example.org"
"#,
        )
        .unwrap();
        let cfg = FdConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.max_connections, MAX_DEFAULT_CONNECTIONS);
        assert_eq!(cfg.remote_file_check_interval, 60);
        assert_eq!(cfg.default_age_limit, 3600);
        assert!(cfg.create_target_dir);
        assert_eq!(
            cfg.default_smtp_server.as_deref(),
            Some("mail.example.org")
        );
        assert_eq!(cfg.default_smtp_from, None);
    }

    #[test]
    fn workdir_skeleton_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("dray");
        let workdir = WorkDir::init(&root).unwrap();
        assert!(paths::fifo_dir(workdir.root()).is_dir());
        assert!(workdir.root().join("files/outgoing/.error").is_dir());
    }
}
