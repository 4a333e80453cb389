//! Transfer-rate-limit groups.
//!
//! A host can carry its own byte-per-second ceiling, or share one with
//! a group of hosts behind the same line. The per-process share is
//! recomputed whenever a worker starts or stops, so running workers
//! always divide the ceiling evenly.
//!
//! Group file, one group per line:
//! `<name>:<bytes-per-second>:<alias>[,<alias>...]`, `#` comments.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::Result;
use crate::fsa::HostStatusArea;

#[derive(Debug, Clone)]
pub struct TrlGroup {
    pub name: String,
    pub limit: u64,
    pub members: Vec<String>,
}

#[derive(Debug, Default)]
pub struct TrlData {
    path: Option<PathBuf>,
    mtime: Option<SystemTime>,
    pub groups: Vec<TrlGroup>,
}

impl TrlData {
    /// Load the group file; a missing file means no groups.
    pub fn load(path: &Path) -> Result<Self> {
        let mut data = TrlData {
            path: Some(path.to_path_buf()),
            ..TrlData::default()
        };
        data.reload()?;
        Ok(data)
    }

    fn reload(&mut self) -> Result<()> {
        self.groups.clear();
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        let metadata = match std::fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(_) => {
                self.mtime = None;
                return Ok(());
            }
        };
        self.mtime = metadata.modified().ok();
        let contents = std::fs::read_to_string(&path)?;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.splitn(3, ':');
            let (Some(name), Some(limit), Some(members)) =
                (fields.next(), fields.next(), fields.next())
            else {
                tracing::warn!(%line, "malformed rate-limit group line");
                continue;
            };
            let Ok(limit) = limit.trim().parse::<u64>() else {
                tracing::warn!(%line, "bad rate limit, skipping group");
                continue;
            };
            self.groups.push(TrlGroup {
                name: name.trim().to_string(),
                limit,
                members: members
                    .split(',')
                    .map(|alias| alias.trim().to_string())
                    .filter(|alias| !alias.is_empty())
                    .collect(),
            });
        }
        Ok(())
    }

    /// Reload when the file changed on disk. Returns whether it did.
    pub fn check_file(&mut self) -> Result<bool> {
        let Some(path) = self.path.clone() else {
            return Ok(false);
        };
        let current = std::fs::metadata(&path)
            .ok()
            .and_then(|metadata| metadata.modified().ok());
        if current != self.mtime {
            self.reload()?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn group_of(&self, alias: &str) -> Option<&TrlGroup> {
        self.groups
            .iter()
            .find(|group| group.members.iter().any(|member| member == alias))
    }

    pub fn has_groups(&self) -> bool {
        !self.groups.is_empty()
    }
}

/// Recompute the per-process share for the host at `pos`.
pub fn calc_trl_per_process(
    fsa: &mut HostStatusArea,
    pos: usize,
    trl: &TrlData,
) {
    let alias = fsa.get(pos).host_alias_str().to_string();
    if let Some(group) = trl.group_of(&alias) {
        let active: u32 = group
            .members
            .iter()
            .filter_map(|member| fsa.position_of_alias(member))
            .map(|member_pos| fsa.get(member_pos).active_transfers)
            .sum();
        let share = group.limit / u64::from(active.max(1));
        // Every member shares the same line, keep them consistent.
        for member in &group.members {
            if let Some(member_pos) = fsa.position_of_alias(member) {
                fsa.get_mut(member_pos).trl_per_process = share;
            }
        }
    } else {
        let host = fsa.get_mut(pos);
        if host.transfer_rate_limit > 0 {
            host.trl_per_process = host.transfer_rate_limit
                / u64::from(host.active_transfers.max(1));
        } else {
            host.trl_per_process = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_host_limit_splits_across_active_transfers() {
        let dir = tempfile::tempdir().unwrap();
        let mut fsa =
            HostStatusArea::open(&dir.path().join("fsa_status"), 0).unwrap();
        fsa.add_host("wx-alpha").unwrap();
        fsa.get_mut(0).transfer_rate_limit = 1_000_000;
        fsa.get_mut(0).active_transfers = 4;
        calc_trl_per_process(&mut fsa, 0, &TrlData::default());
        assert_eq!(fsa.get(0).trl_per_process, 250_000);
    }

    #[test]
    fn group_limit_is_shared_between_members() {
        let dir = tempfile::tempdir().unwrap();
        let mut fsa =
            HostStatusArea::open(&dir.path().join("fsa_status"), 0).unwrap();
        fsa.add_host("wx-alpha").unwrap();
        fsa.add_host("wx-beta").unwrap();
        fsa.get_mut(0).active_transfers = 1;
        fsa.get_mut(1).active_transfers = 3;

        let group_file = dir.path().join("transfer_rate.conf");
        std::fs::write(&group_file, "# uplink\nuplink:800000:wx-alpha,wx-beta\n")
            .unwrap();
        let trl = TrlData::load(&group_file).unwrap();
        assert!(trl.has_groups());

        calc_trl_per_process(&mut fsa, 0, &trl);
        assert_eq!(fsa.get(0).trl_per_process, 200_000);
        assert_eq!(fsa.get(1).trl_per_process, 200_000);
    }

    #[test]
    fn check_file_notices_a_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let group_file = dir.path().join("transfer_rate.conf");
        std::fs::write(&group_file, "uplink:100:a\n").unwrap();
        let mut trl = TrlData::load(&group_file).unwrap();
        assert!(!trl.check_file().unwrap());
        std::fs::write(&group_file, "uplink:200:a\n").unwrap();
        // Force a visible mtime change even on coarse filesystems.
        let bumped = std::time::SystemTime::now()
            + std::time::Duration::from_secs(2);
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(&group_file)
            .unwrap();
        file.set_times(
            std::fs::FileTimes::new().set_modified(bumped),
        )
        .unwrap();
        assert!(trl.check_file().unwrap());
        assert_eq!(trl.groups[0].limit, 200);
    }
}
