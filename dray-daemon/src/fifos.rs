//! Control fifos.
//!
//! Six inbound fifos drive the whole daemon: operator commands, the
//! intake stream from the job generator, worker completion reports,
//! wake-up nudges, retry requests and delete batches. All are opened
//! read-write so an absent peer never turns the read side into a
//! stream of EOFs.

use std::path::Path;

use nix::sys::stat::Mode;
use tokio::net::unix::pipe;

use dray_config::paths;

/// Command fifo opcodes.
pub mod opcode {
    /// Force one spool orphan sweep.
    pub const CHECK_FILE_DIR: u8 = 1;
    /// Host table is about to be swapped; ack and re-attach.
    pub const FSA_ABOUT_TO_CHANGE: u8 = 2;
    /// Run the retrieve poller on the next tick.
    pub const FORCE_REMOTE_DIR_CHECK: u8 = 3;
    /// Graceful shutdown: finish running transfers, start nothing new.
    pub const SAVE_STOP: u8 = 4;
    /// Shutdown, aborting transfers.
    pub const STOP: u8 = 5;
    /// Shutdown as fast as possible.
    pub const QUICK_STOP: u8 = 6;
}

/// Create the fifo at `path` when it is missing or not a fifo.
pub fn ensure_fifo(path: &Path) -> std::io::Result<()> {
    match std::fs::metadata(path) {
        Ok(metadata) => {
            use std::os::unix::fs::FileTypeExt;
            if metadata.file_type().is_fifo() {
                return Ok(());
            }
            std::fs::remove_file(path)?;
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    nix::unistd::mkfifo(path, Mode::from_bits_truncate(0o660))
        .map_err(std::io::Error::from)
}

fn open_receiver(path: &Path) -> std::io::Result<pipe::Receiver> {
    ensure_fifo(path)?;
    pipe::OpenOptions::new().read_write(true).open_receiver(path)
}

/// The inbound side of the event loop.
#[derive(Debug)]
pub struct FifoSet {
    pub cmd: pipe::Receiver,
    pub msg: pipe::Receiver,
    pub fin: pipe::Receiver,
    pub wake_up: pipe::Receiver,
    pub retry: pipe::Receiver,
    pub delete: pipe::Receiver,
}

impl FifoSet {
    pub fn open(workdir: &Path) -> std::io::Result<Self> {
        Ok(FifoSet {
            cmd: open_receiver(&paths::cmd_fifo(workdir))?,
            msg: open_receiver(&paths::msg_fifo(workdir))?,
            fin: open_receiver(&paths::fin_fifo(workdir))?,
            wake_up: open_receiver(&paths::wake_up_fifo(workdir))?,
            retry: open_receiver(&paths::retry_fifo(workdir))?,
            delete: open_receiver(&paths::delete_jobs_fifo(workdir))?,
        })
    }
}

/// Write one ack byte into the ready fifo so the peer that announced a
/// host-table change can proceed.
pub fn ack_ready(workdir: &Path) -> std::io::Result<()> {
    use std::io::Write;

    let path = paths::ready_fifo(workdir);
    ensure_fifo(&path)?;
    // Read-write so the open cannot block on a missing reader.
    let mut fifo = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)?;
    fifo.write_all(&[0u8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifos_are_created_on_open() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(paths::fifo_dir(dir.path())).unwrap();
        let _fifos = FifoSet::open(dir.path()).unwrap();
        use std::os::unix::fs::FileTypeExt;
        let metadata =
            std::fs::metadata(paths::cmd_fifo(dir.path())).unwrap();
        assert!(metadata.file_type().is_fifo());
    }

    #[tokio::test]
    async fn a_regular_file_in_the_way_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(paths::fifo_dir(dir.path())).unwrap();
        std::fs::write(paths::cmd_fifo(dir.path()), b"junk").unwrap();
        let _fifos = FifoSet::open(dir.path()).unwrap();
        use std::os::unix::fs::FileTypeExt;
        let metadata =
            std::fs::metadata(paths::cmd_fifo(dir.path())).unwrap();
        assert!(metadata.file_type().is_fifo());
    }
}
