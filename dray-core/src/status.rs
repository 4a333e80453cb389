//! The daemon status singleton shared with the controller and the UI.

use std::fs::OpenOptions;
use std::path::Path;

use memmap2::MmapMut;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::Result;

/// Global transfer counters and the generator handshake bits.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
#[repr(C)]
pub struct DaemonStatus {
    /// Workers currently alive across all hosts.
    pub no_of_transfers: u32,
    pub max_queue_length: u32,
    pub burst2_counter: u32,
    pub fd_fork_counter: u32,
    pub amg_jobs: u8,
    /// 1 while the scheduler runs, 0 after a crash or shutdown.
    pub fd: u8,
    _pad: [u8; 6],
}

/// Mapped view of `fifodir/fd.status`.
#[derive(Debug)]
pub struct StatusArea {
    map: MmapMut,
}

impl StatusArea {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let wanted = size_of::<DaemonStatus>() as u64;
        if file.metadata()?.len() < wanted {
            file.set_len(wanted)?;
        }
        // SAFETY: fixed-size singleton, layout shared by contract.
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(StatusArea { map })
    }

    pub fn get(&self) -> &DaemonStatus {
        DaemonStatus::ref_from_bytes(&self.map[..size_of::<DaemonStatus>()])
            .expect("status layout")
    }

    pub fn get_mut(&mut self) -> &mut DaemonStatus {
        DaemonStatus::mut_from_bytes(
            &mut self.map[..size_of::<DaemonStatus>()],
        )
        .expect("status layout")
    }

    pub fn sync(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fd.status");
        {
            let mut status = StatusArea::open(&path).unwrap();
            status.get_mut().burst2_counter = 3;
            status.get_mut().fd = 1;
            status.sync().unwrap();
        }
        let status = StatusArea::open(&path).unwrap();
        assert_eq!(status.get().burst2_counter, 3);
        assert_eq!(status.get().fd, 1);
    }
}
