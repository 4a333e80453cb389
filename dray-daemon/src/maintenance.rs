//! Periodic upkeep: the 45-second sweep and the spool orphan sweep.

use std::path::Path;

use dray_core::trl::calc_trl_per_process;
use dray_model::status::{
    DIR_CHECK_ACTIVE, DIR_CHECK_MSG_QUEUED, FD_DIR_CHECK_ACTIVE,
};
use dray_model::MsgName;

use crate::context::{
    next_boundary, Fd, ABNORMAL_TERM_CHECK_TIME, DIR_CHECK_TIME,
};
use crate::logs::DeleteReason;

/// Skip the orphan sweep when the spool holds more jobs than this;
/// walking a huge spool would stall the event loop.
const MAX_SPOOL_JOBS_CHECKED: usize = 150;

impl Fd {
    /// The 45-second boundary work.
    pub async fn periodic_maintenance(&mut self, now: i64) {
        if now <= self.abnormal_check_time {
            return;
        }
        self.abnormal_term_sweep(now).await;
        self.mdb.check_msg_time(&self.jid, &self.fsa);
        self.jobs_queued_sanity();
        match self.trl.check_file() {
            Ok(true) => {
                for pos in 0..self.fsa.len() {
                    calc_trl_per_process(&mut self.fsa, pos, &self.trl);
                }
            }
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(%err, "failed to re-read rate-limit groups")
            }
        }
        self.transfer_log.flush_repeats();
        self.abnormal_check_time =
            next_boundary(now, ABNORMAL_TERM_CHECK_TIME);
    }

    /// Reap workers that died without a fin-fifo report (killed from
    /// outside, crashed before the final write).
    async fn abnormal_term_sweep(&mut self, now: i64) {
        if self.status.get().no_of_transfers == 0 {
            return;
        }
        for conn_pos in 0..self.connections.len() {
            let pid = self.connections.get(conn_pos).pid;
            if pid <= 0 {
                continue;
            }
            let Some(mut qb_pos) = self.qb.position_of_pid(pid) else {
                continue;
            };
            let verdict =
                self.zombie_check(conn_pos, &mut qb_pos, now, false).await;
            self.apply_verdict(qb_pos, verdict);
            if verdict != crate::lifecycle::Verdict::StillRunning {
                self.try_handle_queue(now);
            }
        }
    }

    /// With an empty queue, every per-host queued counter must read
    /// zero; anything else is drift from a crash or a missed decrement.
    pub fn jobs_queued_sanity(&mut self) {
        if !self.qb.is_empty() {
            return;
        }
        for pos in 0..self.fsa.len() {
            let host = self.fsa.get_mut(pos);
            if host.jobs_queued != 0 {
                tracing::debug!(
                    host = host.host_dsp_name_str(),
                    jobs_queued = host.jobs_queued,
                    "jobs queued is not zero, resetting"
                );
                host.jobs_queued = 0;
            }
        }
    }

    /// React to an operator host-configuration change: reload the
    /// rate-limit groups and recompute every per-process share.
    pub fn host_config_check(&mut self) {
        let counter = self.fsa.config_counter();
        if counter == self.host_config_counter {
            return;
        }
        if let Err(err) = self.trl.check_file() {
            tracing::warn!(%err, "failed to re-read rate-limit groups");
        }
        for pos in 0..self.fsa.len() {
            calc_trl_per_process(&mut self.fsa, pos, &self.trl);
        }
        match dray_config::FdConfig::load(&self.workdir) {
            Ok(config) => self.config = config,
            Err(err) => {
                tracing::warn!(%err, "keeping previous configuration")
            }
        }
        self.host_config_counter = counter;
    }

    /// Walk the outgoing spool for job directories that lost their
    /// queue entry (a crash between spool write and fifo write) and
    /// re-queue them; directories whose job id no longer resolves are
    /// deleted.
    pub fn check_file_dir(&mut self, now: i64) {
        if now <= self.next_dir_check_time && !self.force_check {
            return;
        }
        // Never sweep while the generator is mid-write, and never
        // while its fifo still holds unread messages: both would
        // duplicate jobs.
        let amg_jobs = self.status.get().amg_jobs;
        if amg_jobs & DIR_CHECK_ACTIVE != 0
            || amg_jobs & DIR_CHECK_MSG_QUEUED != 0
        {
            return;
        }
        self.status.get_mut().amg_jobs |= FD_DIR_CHECK_ACTIVE;
        self.sweep_spool(now);
        self.status.get_mut().amg_jobs &= !FD_DIR_CHECK_ACTIVE;
        self.next_dir_check_time = next_boundary(now, DIR_CHECK_TIME);
        self.force_check = false;
    }

    fn sweep_spool(&mut self, now: i64) {
        let outgoing = dray_core::spool::outgoing_dir(&self.workdir);
        let mut found = Vec::new();
        collect_spool_jobs(&outgoing, &mut found);
        if found.len() > MAX_SPOOL_JOBS_CHECKED {
            tracing::debug!(
                jobs = found.len(),
                "spool too full to check for orphans"
            );
            return;
        }
        for name in found {
            let rendered = name.to_string();
            if self
                .qb
                .entries()
                .iter()
                .any(|entry| entry.msg_name_str() == rendered)
            {
                continue;
            }
            match self.mdb.lookup_job_id(name.job_id, &self.jid, &self.fsa)
            {
                Ok(cache_pos) => {
                    tracing::info!(
                        msg = %rendered,
                        "queueing orphaned spool directory"
                    );
                    let priority = self
                        .jid
                        .find(name.job_id)
                        .map_or(b'9', |record| record.priority);
                    let (files, bytes) = spool_contents(
                        &dray_core::spool::msg_spool_dir(
                            &self.workdir,
                            &rendered,
                        ),
                    );
                    let key = dray_model::msg_number(
                        priority,
                        name.creation_time,
                        name.unique_number,
                        name.split_counter,
                    );
                    let entry = dray_core::QueueEntry::new_push(
                        &name,
                        key,
                        name.creation_time,
                        cache_pos as u32,
                        files,
                        bytes,
                        false,
                    );
                    if self.qb.insert_ordered(entry).is_ok() {
                        let fsa_pos = self.mdb.get(cache_pos).fsa_pos;
                        if fsa_pos >= 0
                            && (fsa_pos as usize) < self.fsa.len()
                        {
                            self.fsa
                                .get_mut(fsa_pos as usize)
                                .jobs_queued += 1;
                        }
                    }
                }
                Err(_) => {
                    tracing::warn!(
                        msg = %rendered,
                        "orphaned spool directory for unknown job, removing"
                    );
                    self.remove_job_files(
                        &rendered,
                        name.job_id,
                        DeleteReason::OtherDel,
                    );
                }
            }
        }
        let _ = now;
    }
}

impl Fd {
    /// The host or directory table was swapped underneath us:
    /// re-attach both maps and recompute every index that pointed into
    /// the old ones.
    pub fn reattach_status_areas(&mut self) -> anyhow::Result<()> {
        self.fsa = dray_core::HostStatusArea::open(
            &dray_config::paths::fsa_status(&self.workdir),
            0,
        )?;
        self.fra = dray_core::RetrieveArea::open(
            &dray_config::paths::fra_status(&self.workdir),
            0,
        )?;
        self.host_config_counter = self.fsa.config_counter();
        self.mdb.recompute_host_bindings(&self.fsa);

        // Live connections keep their worker; only the host index may
        // have moved.
        for conn_pos in 0..self.connections.len() {
            let hostname = self.connections.get(conn_pos).hostname.clone();
            if hostname.is_empty() {
                continue;
            }
            match self.fsa.position_of_alias(&hostname) {
                Some(pos) => {
                    self.connections.get_mut(conn_pos).fsa_pos = pos as i32;
                }
                None => {
                    tracing::warn!(
                        host = %hostname,
                        "host vanished from the new host table"
                    );
                    self.connections.get_mut(conn_pos).fsa_pos = -1;
                }
            }
        }
        Ok(())
    }
}

/// Gather `<job>/<dir>/<creation>_<unique>_<split>` leaves.
fn collect_spool_jobs(outgoing: &Path, found: &mut Vec<MsgName>) {
    let Ok(jobs) = std::fs::read_dir(outgoing) else {
        return;
    };
    for job in jobs.flatten() {
        let job_name = job.file_name();
        let Some(job_str) = job_name.to_str() else { continue };
        if job_str.starts_with('.') || !job.path().is_dir() {
            continue;
        }
        let Ok(dirs) = std::fs::read_dir(job.path()) else { continue };
        for dir in dirs.flatten() {
            let Ok(leaves) = std::fs::read_dir(dir.path()) else {
                continue;
            };
            let dir_name = dir.file_name();
            for leaf in leaves.flatten() {
                let leaf_name = leaf.file_name();
                let (Some(dir_str), Some(leaf_str)) =
                    (dir_name.to_str(), leaf_name.to_str())
                else {
                    continue;
                };
                let rendered = format!("{job_str}/{dir_str}/{leaf_str}");
                if let Ok(name) = rendered.parse::<MsgName>() {
                    found.push(name);
                }
            }
        }
    }
}

/// File count and byte total of one spool directory.
fn spool_contents(dir: &Path) -> (u32, u64) {
    let mut files = 0u32;
    let mut bytes = 0u64;
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            if let Ok(metadata) = entry.metadata() {
                if metadata.is_file() {
                    files += 1;
                    bytes += metadata.len();
                }
            }
        }
    }
    (files, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestFd;
    use dray_core::QueueSlot;

    #[test]
    fn sanity_resets_stale_jobs_queued() {
        let mut harness = TestFd::new();
        harness.fd.fsa.get_mut(0).jobs_queued = 7;
        harness.fd.jobs_queued_sanity();
        assert_eq!(harness.fd.fsa.get(0).jobs_queued, 0);
    }

    #[test]
    fn sanity_leaves_counters_alone_while_queue_is_busy() {
        let mut harness = TestFd::new();
        harness.queue_push_with_key(0x2a, 100.0, 1000);
        assert_eq!(harness.fd.fsa.get(0).jobs_queued, 1);
        harness.fd.jobs_queued_sanity();
        assert_eq!(harness.fd.fsa.get(0).jobs_queued, 1);
    }

    #[test]
    fn orphaned_spool_dir_is_requeued() {
        let mut harness = TestFd::new();
        let name = MsgName {
            job_id: 0x2a,
            dir_no: 0,
            creation_time: 1000,
            unique_number: 9,
            split_counter: 0,
        };
        let spool = dray_core::spool::msg_spool_dir(
            &harness.fd.workdir,
            &name.to_string(),
        );
        std::fs::create_dir_all(&spool).unwrap();
        std::fs::write(spool.join("data1"), b"hello").unwrap();
        std::fs::write(spool.join("data2"), b"world!").unwrap();

        harness.fd.force_check = true;
        harness.fd.check_file_dir(harness.now);

        assert_eq!(harness.fd.qb.len(), 1);
        let entry = harness.fd.qb.get(0);
        assert_eq!(entry.msg_name_str(), name.to_string());
        assert_eq!(entry.files_to_send, 2);
        assert_eq!(entry.file_size_to_send, 11);
        assert_eq!(entry.slot(), QueueSlot::Pending);
        assert_eq!(harness.fd.fsa.get(0).jobs_queued, 1);
        assert!(!harness.fd.force_check);
    }

    #[test]
    fn spool_dir_for_unknown_job_is_removed() {
        let mut harness = TestFd::new();
        let rendered = "dead/0/3e8_1_0";
        let spool = dray_core::spool::msg_spool_dir(
            &harness.fd.workdir,
            rendered,
        );
        std::fs::create_dir_all(&spool).unwrap();
        harness.fd.force_check = true;
        harness.fd.check_file_dir(harness.now);
        assert_eq!(harness.fd.qb.len(), 0);
        assert!(!spool.exists());
    }

    #[test]
    fn sweep_skips_while_the_generator_is_active() {
        let mut harness = TestFd::new();
        let rendered = "2a/0/3e8_c_0";
        let spool = dray_core::spool::msg_spool_dir(
            &harness.fd.workdir,
            rendered,
        );
        std::fs::create_dir_all(&spool).unwrap();
        harness.fd.status.get_mut().amg_jobs |= DIR_CHECK_ACTIVE;
        harness.fd.force_check = true;
        harness.fd.check_file_dir(harness.now);
        assert_eq!(harness.fd.qb.len(), 0);
        assert!(spool.exists());
    }
}
