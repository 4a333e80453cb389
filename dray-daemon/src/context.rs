//! The daemon's mutable world.
//!
//! One [`Fd`] value owns every piece of state the event loop touches:
//! the mapped queue, cache and status areas, the connection table, the
//! live worker handles and the log writers. All handlers are methods
//! on it, split across the sibling modules by concern.

use std::path::{Path, PathBuf};

use dray_config::{paths, FdConfig};
use dray_core::{
    queue, spool, trl::TrlData, ConnectionTable, HostStatusArea, JobIdTable,
    MsgCache, QueueBuffer, RetrieveArea, StatusArea,
};
use dray_model::priority::max_threshold;
use dray_model::status::DISABLE_ARCHIVE;

use crate::logs::{DeleteLog, DeleteReason, TransferLog};
use crate::worker::{WorkerArgs, WorkerTable};

/// Seconds between scheduler rescans when nothing else wakes us.
pub const FD_RESCAN_TIME: i64 = 90;
/// Ceiling on a graceful shutdown before the hard phase starts.
pub const FD_TIMEOUT: i64 = 600;
/// Ceiling on a quick shutdown.
pub const FD_QUICK_TIMEOUT: i64 = 30;
/// Seconds between spool orphan sweeps.
pub const DIR_CHECK_TIME: i64 = 1500;
/// Seconds between abnormal-termination sweeps.
pub const ABNORMAL_TERM_CHECK_TIME: i64 = 45;
/// Queue length beyond which full scans are throttled.
pub const MAX_QUEUED_BEFORE_CHECKED: usize = 4000;
/// Wake-ups skipped between full scans of an oversized queue.
pub const ELAPSED_LOOPS_BEFORE_CHECK: u32 = 20;

/// Shutdown state, latched by the command fifo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    Run,
    Save,
    Stop,
    Quick,
}

impl StopMode {
    pub fn is_stopping(self) -> bool {
        self != StopMode::Run
    }

    pub fn timeout(self) -> i64 {
        match self {
            StopMode::Quick => FD_QUICK_TIMEOUT,
            _ => FD_TIMEOUT,
        }
    }
}

/// Wall clock in epoch seconds.
pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[derive(Debug)]
pub struct Fd {
    pub workdir: PathBuf,
    pub config: FdConfig,
    pub qb: QueueBuffer,
    pub mdb: MsgCache,
    pub jid: JobIdTable,
    pub fsa: HostStatusArea,
    pub fra: RetrieveArea,
    pub status: StatusArea,
    pub connections: ConnectionTable,
    pub workers: WorkerTable,
    pub trl: TrlData,
    pub transfer_log: TransferLog,
    pub delete_log: DeleteLog,
    pub stop: StopMode,
    /// Instant after which a pending shutdown stops waiting for
    /// workers.
    pub stop_deadline: i64,
    /// Wake-ups skipped by the oversized-queue throttle.
    pub scan_throttle: u32,
    pub max_threshold: f64,
    pub link_max: u64,
    pub force_check: bool,
    pub next_dir_check_time: i64,
    pub remote_file_check_time: i64,
    pub abnormal_check_time: i64,
    pub host_config_counter: u8,
}

impl Fd {
    /// Attach every area under `workdir` and reset runtime state the
    /// way a fresh scheduler must: no live transfers, queued pulls
    /// dropped (their directory table may have changed while we were
    /// down), everything else pending.
    pub fn new(workdir: &Path, config: FdConfig) -> anyhow::Result<Self> {
        let qb = QueueBuffer::open(&paths::queue_buffer(workdir))?;
        let mdb = MsgCache::open(&paths::msg_cache(workdir))?;
        let jid = JobIdTable::open(&paths::job_id_table(workdir))?;
        let mut fsa = HostStatusArea::open(&paths::fsa_status(workdir), 0)?;
        let mut fra = RetrieveArea::open(&paths::fra_status(workdir), 0)?;
        let mut status = StatusArea::open(&paths::daemon_status(workdir))?;
        let transfer_log = TransferLog::open(workdir)?;
        let delete_log = DeleteLog::open(workdir)?;
        let trl = TrlData::load(&paths::trl_file(workdir))?;

        fra.clear_queued_flags();

        // A crash may have left stale counters and slots behind.
        status.get_mut().no_of_transfers = 0;
        for host in fsa.hosts_mut() {
            host.active_transfers = 0;
            for slot in &mut host.job_status {
                slot.reset_disconnect();
            }
        }
        let host_config_counter = fsa.config_counter();

        let current = now();
        let max_connections = config.max_connections as usize;
        let remote_interval = i64::from(config.remote_file_check_interval);
        let mut fd = Fd {
            workdir: workdir.to_path_buf(),
            config,
            qb,
            mdb,
            jid,
            fsa,
            fra,
            status,
            connections: ConnectionTable::new(max_connections),
            workers: WorkerTable::default(),
            trl,
            transfer_log,
            delete_log,
            stop: StopMode::Run,
            stop_deadline: 0,
            scan_throttle: 0,
            max_threshold: max_threshold(current),
            link_max: spool::link_max(workdir),
            force_check: true,
            next_dir_check_time: 0,
            remote_file_check_time: next_boundary(current, remote_interval),
            abnormal_check_time: next_boundary(
                current,
                ABNORMAL_TERM_CHECK_TIME,
            ),
            host_config_counter,
        };
        for pos in 0..fd.fsa.len() {
            dray_core::trl::calc_trl_per_process(&mut fd.fsa, pos, &fd.trl);
        }

        // Requeue everything that was mid-flight; queued pulls are
        // dropped because the directory table may no longer match.
        let mut index = 0;
        while index < fd.qb.len() {
            fd.qb.get_mut(index).pid = queue::PENDING;
            fd.qb.get_mut(index).connect_pos = -1;
            if !fd.qb.get(index).is_push() {
                let fra_pos = fd.qb.get(index).pos as usize;
                if fra_pos < fd.fra.len() {
                    let fsa_pos = fd.fra.get(fra_pos).fsa_pos;
                    fd.abs_reduce(fsa_pos);
                }
                fd.remove_msg(index);
            } else {
                index += 1;
            }
        }
        fd.status.get_mut().fd = 1;

        tracing::info!("Starting FD ({})", env!("CARGO_PKG_VERSION"));
        tracing::debug!(
            "FD configuration: Max. connections              {}",
            fd.config.max_connections
        );
        tracing::debug!(
            "FD configuration: Remote file check interval    {} (sec)",
            fd.config.remote_file_check_interval
        );
        tracing::debug!(
            "FD configuration: FD rescan interval            {} (sec)",
            FD_RESCAN_TIME
        );
        tracing::debug!(
            "FD configuration: Default age limit             {} (sec)",
            fd.config.default_age_limit
        );
        Ok(fd)
    }

    /// Host index backing the queue entry at `qb_pos`.
    pub fn fsa_pos_of_entry(&self, qb_pos: usize) -> i32 {
        let entry = self.qb.get(qb_pos);
        if entry.is_push() {
            self.mdb.get(entry.pos as usize).fsa_pos
        } else {
            self.fra.get(entry.pos as usize).fsa_pos
        }
    }

    /// Decrement a host's queued counter, guarding against drift.
    pub fn abs_reduce(&mut self, fsa_pos: i32) {
        if fsa_pos < 0 || fsa_pos as usize >= self.fsa.len() {
            return;
        }
        let host = self.fsa.get_mut(fsa_pos as usize);
        if host.jobs_queued == 0 {
            tracing::debug!(
                host = host.host_alias_str(),
                "jobs_queued already zero on decrement"
            );
        } else {
            host.jobs_queued -= 1;
        }
    }

    /// Drop the queue entry at `qb_pos`, clearing the directory's
    /// queued mark when it was a pull.
    pub fn remove_msg(&mut self, qb_pos: usize) {
        let entry = self.qb.get(qb_pos);
        if !entry.is_push() {
            let fra_pos = entry.pos as usize;
            if fra_pos < self.fra.len() {
                self.fra.get_mut(fra_pos).queued = 0;
            }
        }
        self.qb.remove(qb_pos);
    }

    /// Delete a push job's spool directory and record why.
    pub fn remove_job_files(
        &mut self,
        msg_name: &str,
        job_id: u32,
        reason: DeleteReason,
    ) {
        let dir = spool::msg_spool_dir(&self.workdir, msg_name);
        if let Err(err) = std::fs::remove_dir_all(&dir) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::error!(
                    dir = %dir.display(),
                    %err,
                    "failed to remove spool directory"
                );
            }
        }
        self.delete_log.record(reason, msg_name, job_id);
    }

    /// Argv configuration shared by every spawn this round.
    pub fn worker_args(&self, debug: bool) -> WorkerArgs {
        WorkerArgs {
            workdir: self.workdir.clone(),
            fsa_id: u32::from(self.fsa.config_counter()),
            archive_disabled: self.fsa.feature_flags() & DISABLE_ARCHIVE != 0,
            default_age_limit: self.config.default_age_limit,
            default_smtp_server: self.config.default_smtp_server.clone(),
            default_smtp_from: self.config.default_smtp_from.clone(),
            debug,
        }
    }
}

/// Next multiple of `interval` strictly after `current`.
pub fn next_boundary(current: i64, interval: i64) -> i64 {
    (current / interval) * interval + interval
}
