use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Model error: {0}")]
    Model(#[from] dray_model::ModelError),

    #[error("Corrupt mapped file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Region lock failed: {0}")]
    RegionLock(#[from] nix::errno::Errno),

    #[error("Unknown host alias: {0}")]
    UnknownHost(String),

    #[error("Job {0:#x} not present in the job-id table")]
    UnknownJobId(u32),
}

pub type Result<T> = std::result::Result<T, CoreError>;
