//! Canonical locations inside the working directory.

use std::path::{Path, PathBuf};

pub fn fifo_dir(workdir: &Path) -> PathBuf {
    workdir.join("fifodir")
}

pub fn etc_dir(workdir: &Path) -> PathBuf {
    workdir.join("etc")
}

pub fn config_file(workdir: &Path) -> PathBuf {
    etc_dir(workdir).join("fd.conf")
}

pub fn trl_file(workdir: &Path) -> PathBuf {
    etc_dir(workdir).join("transfer_rate.conf")
}

/// Whole-process lock; holds the pid of the running daemon.
pub fn lock_file(workdir: &Path) -> PathBuf {
    fifo_dir(workdir).join("fd.lock")
}

// Persistent state files.

pub fn queue_buffer(workdir: &Path) -> PathBuf {
    fifo_dir(workdir).join("queue_buffer")
}

pub fn msg_cache(workdir: &Path) -> PathBuf {
    fifo_dir(workdir).join("msg_cache_buf")
}

pub fn job_id_table(workdir: &Path) -> PathBuf {
    fifo_dir(workdir).join("jid_data")
}

pub fn fsa_status(workdir: &Path) -> PathBuf {
    fifo_dir(workdir).join("fsa_status")
}

pub fn fra_status(workdir: &Path) -> PathBuf {
    fifo_dir(workdir).join("fra_status")
}

pub fn daemon_status(workdir: &Path) -> PathBuf {
    fifo_dir(workdir).join("fd.status")
}

// Control fifos.

pub fn cmd_fifo(workdir: &Path) -> PathBuf {
    fifo_dir(workdir).join("fd_cmd.fifo")
}

pub fn msg_fifo(workdir: &Path) -> PathBuf {
    fifo_dir(workdir).join("msg.fifo")
}

pub fn fin_fifo(workdir: &Path) -> PathBuf {
    fifo_dir(workdir).join("sf_fin.fifo")
}

pub fn wake_up_fifo(workdir: &Path) -> PathBuf {
    fifo_dir(workdir).join("fd_wake_up.fifo")
}

pub fn retry_fifo(workdir: &Path) -> PathBuf {
    fifo_dir(workdir).join("retry.fifo")
}

pub fn delete_jobs_fifo(workdir: &Path) -> PathBuf {
    fifo_dir(workdir).join("delete_jobs.fifo")
}

pub fn ready_fifo(workdir: &Path) -> PathBuf {
    fifo_dir(workdir).join("fd_ready.fifo")
}

// Log fifos drained by the external log daemons.

pub fn transfer_log_fifo(workdir: &Path) -> PathBuf {
    fifo_dir(workdir).join("transfer_log.fifo")
}

pub fn delete_log_fifo(workdir: &Path) -> PathBuf {
    fifo_dir(workdir).join("delete_log.fifo")
}
