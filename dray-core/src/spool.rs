//! Spool directory layout and the error-spool pressure check.
//!
//! Every push job's files wait in
//! `<workdir>/files/outgoing/<jobId>/<dirNo>/<creation>_<unique>_<split>`;
//! failed jobs are parked under `.error/<host alias>`. The number of
//! subdirectories a filesystem allows per directory bounds how many
//! parked jobs a host can accumulate, which is what the pressure check
//! watches.

use std::path::{Path, PathBuf};

use crate::error::Result;

pub const OUTGOING_DIR: &str = "files/outgoing";
pub const ERROR_DIR: &str = ".error";

pub fn outgoing_dir(workdir: &Path) -> PathBuf {
    workdir.join(OUTGOING_DIR)
}

pub fn msg_spool_dir(workdir: &Path, msg_name: &str) -> PathBuf {
    outgoing_dir(workdir).join(msg_name)
}

pub fn host_error_dir(workdir: &Path, host_alias: &str) -> PathBuf {
    outgoing_dir(workdir).join(ERROR_DIR).join(host_alias)
}

/// Hard link ceiling of the spool filesystem, with the POSIX floor as
/// fallback when the filesystem will not say.
pub fn link_max(workdir: &Path) -> u64 {
    match nix::unistd::pathconf(workdir, nix::unistd::PathconfVar::LINK_MAX) {
        Ok(Some(value)) if value > 0 => value as u64,
        // POSIX defines _POSIX_LINK_MAX as 8; the libc crate doesn't
        // expose it since it's a <limits.h> macro, not a linked symbol.
        _ => 8u64,
    }
}

/// Whether the host's error spool is close enough to the link ceiling
/// that further ingestion must pause.
pub fn error_dir_pressure(
    workdir: &Path,
    host_alias: &str,
    link_max: u64,
) -> Result<bool> {
    let dir = host_error_dir(workdir, host_alias);
    let mut count: u64 = 0;
    match std::fs::read_dir(&dir) {
        Ok(entries) => {
            for entry in entries {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    count += 1;
                }
            }
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(false)
        }
        Err(err) => return Err(err.into()),
    }
    Ok(count >= link_max.saturating_sub(2))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_message_names() {
        let workdir = Path::new("/var/dray");
        assert_eq!(
            msg_spool_dir(workdir, "2a/0/3e8_7_0"),
            PathBuf::from("/var/dray/files/outgoing/2a/0/3e8_7_0")
        );
        assert_eq!(
            host_error_dir(workdir, "wx-alpha"),
            PathBuf::from("/var/dray/files/outgoing/.error/wx-alpha")
        );
    }

    #[test]
    fn pressure_trips_near_the_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let host_dir = host_error_dir(dir.path(), "wx-alpha");
        std::fs::create_dir_all(&host_dir).unwrap();
        for i in 0..8 {
            std::fs::create_dir(host_dir.join(format!("job{i}"))).unwrap();
        }
        assert!(!error_dir_pressure(dir.path(), "wx-alpha", 11).unwrap());
        assert!(error_dir_pressure(dir.path(), "wx-alpha", 10).unwrap());
        // Missing error dir: no pressure.
        assert!(!error_dir_pressure(dir.path(), "wx-nope", 10).unwrap());
    }
}
