//! Reaping workers and deciding what happens to their queue entries.
//!
//! Workers report on the fin fifo: a positive pid means "I exited",
//! a negative pid means "connection still open, give me more work"
//! (burst mode). Exits are classified into a [`Verdict`] that drives
//! the requeue/remove decision; burst requests are answered by
//! rewriting the job slot in place and waking the worker with SIGUSR1.

use dray_core::fsa::TOGGLE_NONE;
use dray_core::{queue, trl::calc_trl_per_process};
use dray_model::{
    classify_exit, decay, ConnectStatus, ExitDisposition, WorkerExit,
    AUTO_PAUSE_QUEUE_LOCK_STAT, AUTO_PAUSE_QUEUE_STAT,
};
use nix::sys::signal::Signal;

use crate::context::Fd;
use crate::logs::DeleteReason;

/// Outcome of one reaped worker, seen from the queue's side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Transfer failed; requeue with error bookkeeping.
    Failed,
    /// Transfer done (or hopeless); drop the entry.
    Done,
    /// Requeue without counting an error.
    Requeue,
    /// Child not reaped yet; leave the entry alone.
    StillRunning,
}

/// In `unique_name`, byte 2 set to this value means the worker is
/// alive and waiting for a follow-up job.
const BURST_WAITING_SENTINEL: u8 = 4;

impl Fd {
    /// Drain one batch of fin-fifo pids.
    pub async fn handle_fin_data(&mut self, data: &[u8], now: i64) {
        let mut progressed = false;
        for chunk in data.chunks_exact(size_of::<i32>()) {
            let pid = i32::from_ne_bytes(chunk.try_into().unwrap());
            self.handle_fin_pid(pid, now).await;
            progressed = true;
        }
        if data.len() % size_of::<i32>() != 0 {
            tracing::debug!(
                trailing = data.len() % size_of::<i32>(),
                "reading garbage from fin fifo"
            );
        }
        if progressed {
            self.try_handle_queue(now);
        }
    }

    async fn handle_fin_pid(&mut self, raw_pid: i32, now: i64) {
        if raw_pid < 0 {
            let pid = i64::from(-raw_pid);
            let Some(qb_pos) = self.qb.position_of_pid(pid) else {
                tracing::debug!(pid, "burst request from pid not in queue");
                return;
            };
            if self.burst_slot_waiting(qb_pos) {
                self.check_burst(qb_pos, pid, now);
                return;
            }
            // Worker gave up waiting and exited; fall through to a
            // normal reap.
            self.reap_at(qb_pos, now, true).await;
            return;
        }
        let pid = i64::from(raw_pid);
        let Some(qb_pos) = self.qb.position_of_pid(pid) else {
            tracing::debug!(pid, "caught some unknown zombie");
            // Not one of ours (anymore); reap the handle if we hold
            // one so it cannot linger.
            let _ = self.workers.try_reap(pid);
            return;
        };
        self.reap_at(qb_pos, now, true).await;
    }

    /// Whether the job slot behind `qb_pos` carries the burst-waiting
    /// sentinel.
    fn burst_slot_waiting(&self, qb_pos: usize) -> bool {
        let entry = self.qb.get(qb_pos);
        if entry.connect_pos < 0 {
            return false;
        }
        let conn = self.connections.get(entry.connect_pos as usize);
        if conn.fsa_pos < 0 || conn.job_no < 0 {
            return false;
        }
        let host = self.fsa.get(conn.fsa_pos as usize);
        host.job_status[conn.job_no as usize].unique_name[2]
            == BURST_WAITING_SENTINEL
    }

    /// Reap the worker owning `qb_pos` and apply the verdict.
    pub async fn reap_at(&mut self, qb_pos: usize, now: i64, blocking: bool) {
        let connect_pos = self.qb.get(qb_pos).connect_pos;
        if connect_pos < 0 {
            return;
        }
        let mut qb_pos = qb_pos;
        let verdict = self
            .zombie_check(connect_pos as usize, &mut qb_pos, now, blocking)
            .await;
        self.apply_verdict(qb_pos, verdict);
    }

    /// Requeue or drop the entry according to `verdict`.
    pub fn apply_verdict(&mut self, qb_pos: usize, verdict: Verdict) {
        match verdict {
            Verdict::Failed | Verdict::Requeue => {
                let fsa_pos = self.fsa_pos_of_entry(qb_pos);
                if fsa_pos >= 0 && (fsa_pos as usize) < self.fsa.len() {
                    self.fsa.get_mut(fsa_pos as usize).jobs_queued += 1;
                }
                let entry = self.qb.get_mut(qb_pos);
                entry.pid = queue::PENDING;
                entry.connect_pos = -1;
            }
            Verdict::Done => self.remove_msg(qb_pos),
            Verdict::StillRunning => {}
        }
    }

    /// Reap and classify the worker in connection slot `conn_pos`.
    ///
    /// Releases the slot on any terminal outcome, before the caller
    /// can run the scheduler again. A priority decay may re-sort the
    /// queue, which is why `qb_pos` is updated in place.
    pub async fn zombie_check(
        &mut self,
        conn_pos: usize,
        qb_pos: &mut usize,
        now: i64,
        blocking: bool,
    ) -> Verdict {
        let pid = self.connections.get(conn_pos).pid;
        let exit = if blocking {
            match self.workers.reap(pid).await {
                Ok(exit) => exit,
                Err(err) => return self.reap_failed(conn_pos, now, err),
            }
        } else {
            match self.workers.try_reap(pid) {
                Ok(Some(exit)) => exit,
                Ok(None) => return Verdict::StillRunning,
                Err(err) => return self.reap_failed(conn_pos, now, err),
            }
        };

        self.qb.get_mut(*qb_pos).retries += 1;
        let disposition = classify_exit(exit);
        let mut verdict = self.apply_disposition(
            disposition,
            exit,
            conn_pos,
            qb_pos,
            now,
        );

        if let Some(code) = exit.history_code() {
            let fsa_pos = self.connections.get(conn_pos).fsa_pos;
            if fsa_pos >= 0 {
                self.fsa
                    .get_mut(fsa_pos as usize)
                    .push_error_history(code);
            }
        }

        // An alternate host failing must not mark the primary bad.
        if self.connections.get(conn_pos).temp_toggle
            && verdict == Verdict::Failed
        {
            verdict = Verdict::Requeue;
        }

        self.remove_connection(conn_pos, verdict, now);

        // Win or lose, the cache keeps the last time a worker touched
        // this job so age-based cleanup has something to go by.
        let entry = *self.qb.get(*qb_pos);
        if entry.is_push() && (entry.pos as usize) < self.mdb.len() {
            self.mdb.get_mut(entry.pos as usize).last_transfer_time = now;
        }
        verdict
    }

    fn reap_failed(
        &mut self,
        conn_pos: usize,
        now: i64,
        err: std::io::Error,
    ) -> Verdict {
        if err.raw_os_error() == Some(nix::libc::ECHILD) {
            // The child is gone without a status; free the slot and
            // requeue without blaming the host.
            self.remove_connection(conn_pos, Verdict::Requeue, now);
            Verdict::Requeue
        } else {
            tracing::error!(%err, "waitpid failed");
            Verdict::Failed
        }
    }

    #[allow(clippy::too_many_lines)]
    fn apply_disposition(
        &mut self,
        disposition: ExitDisposition,
        exit: WorkerExit,
        conn_pos: usize,
        qb_pos: &mut usize,
        now: i64,
    ) -> Verdict {
        let fsa_pos = self.connections.get(conn_pos).fsa_pos;
        let job_no = self.connections.get(conn_pos).job_no;
        let hostname = self.connections.get(conn_pos).hostname.clone();

        match disposition {
            ExitDisposition::Success | ExitDisposition::StillFiles => {
                self.transfer_succeeded(conn_pos, now);
                if disposition == ExitDisposition::StillFiles {
                    self.next_dir_check_time = 0;
                    Verdict::Requeue
                } else {
                    Verdict::Done
                }
            }

            ExitDisposition::Retryable {
                sets_first_error,
                warn,
            } => {
                if sets_first_error && fsa_pos >= 0 {
                    let host = self.fsa.get_mut(fsa_pos as usize);
                    if host.first_error_time == 0 {
                        host.first_error_time = now;
                    }
                }
                if let Some(message) = warn {
                    self.transfer_log.warn(now, &hostname, job_no, message);
                }
                Verdict::Failed
            }

            ExitDisposition::DecayRetryable => {
                *qb_pos = self.decay_entry(*qb_pos);
                if fsa_pos >= 0 {
                    let host = self.fsa.get_mut(fsa_pos as usize);
                    if host.first_error_time == 0 {
                        host.first_error_time = now;
                    }
                }
                Verdict::Failed
            }

            ExitDisposition::MissingMessage => {
                let msg_name = self
                    .connections
                    .get(conn_pos)
                    .msg_name
                    .map(|name| name.to_string());
                if let Some(name) = msg_name {
                    let job_id = self
                        .qb
                        .get(*qb_pos)
                        .msg_name()
                        .map_or(0, |parsed| parsed.job_id);
                    self.remove_job_files(
                        &name,
                        job_id,
                        DeleteReason::OtherDel,
                    );
                }
                Verdict::Failed
            }

            ExitDisposition::Broken { warn } => {
                if fsa_pos >= 0 && job_no >= 0 {
                    self.fsa.get_mut(fsa_pos as usize).job_status
                        [job_no as usize]
                        .reset_broken();
                }
                let message = match exit {
                    WorkerExit::Exited(code) => {
                        format!("{warn} (exit {code})")
                    }
                    WorkerExit::Signaled(signo) => {
                        format!("{warn} (signal {signo})")
                    }
                };
                self.transfer_log.warn(now, &hostname, job_no, &message);
                Verdict::Failed
            }

            ExitDisposition::Killed => {
                if fsa_pos >= 0 && job_no >= 0 {
                    self.fsa.get_mut(fsa_pos as usize).job_status
                        [job_no as usize]
                        .connect_status = ConnectStatus::Disconnect as u8;
                }
                Verdict::Requeue
            }

            ExitDisposition::Empty => {
                self.recover_auto_pause(fsa_pos, now);
                Verdict::Done
            }

            ExitDisposition::QuietDrop => Verdict::Done,
        }
    }

    /// Success bookkeeping: clear error state, toggle back to the
    /// original host when we had failed over, and reopen a locked
    /// input queue.
    fn transfer_succeeded(&mut self, conn_pos: usize, now: i64) {
        let fsa_pos = self.connections.get(conn_pos).fsa_pos;
        if fsa_pos < 0 {
            return;
        }
        let temp_toggle = self.connections.get(conn_pos).temp_toggle;
        let host = self.fsa.get_mut(fsa_pos as usize);

        let on_original = host.original_toggle_pos == host.host_toggle;
        if (temp_toggle && !on_original) || on_original {
            self.connections.get_mut(conn_pos).temp_toggle = false;
            let host = self.fsa.get_mut(fsa_pos as usize);
            host.successful_retries = 0;
            if host.original_toggle_pos != TOGGLE_NONE {
                host.host_toggle = host.original_toggle_pos;
                host.original_toggle_pos = TOGGLE_NONE;
                host.refresh_toggle_char();
                let name = host.host_dsp_name_str().to_string();
                tracing::info!(
                    "Switching back to host <{name}> after successful transfer."
                );
            }
        }
        let host = self.fsa.get_mut(fsa_pos as usize);
        if host.host_status & AUTO_PAUSE_QUEUE_LOCK_STAT != 0 {
            host.host_status &= !AUTO_PAUSE_QUEUE_LOCK_STAT;
            let alias = host.host_alias_str().to_string();
            tracing::info!(
                "Started input queue for host <{alias}>, due to too many \
                 jobs in the error directory."
            );
        }
        let host = self.fsa.get_mut(fsa_pos as usize);
        host.last_connection = now;
        host.first_error_time = 0;
    }

    /// A host with nothing left to send and a paused input queue is a
    /// deadlock; clear the pause and the error state behind it.
    fn recover_auto_pause(&mut self, fsa_pos: i32, _now: i64) {
        if fsa_pos < 0 {
            return;
        }
        let pos = fsa_pos as usize;
        let host = *self.fsa.get(pos);
        if host.total_file_counter != 0
            || host.total_file_size != 0
            || host.host_status & AUTO_PAUSE_QUEUE_STAT == 0
        {
            return;
        }
        if host.error_counter > 0 {
            let guard = self.fsa.lock_error_counter(pos);
            let host = self.fsa.get_mut(pos);
            host.error_counter = 0;
            host.error_history = [0; dray_core::fsa::ERROR_HISTORY_LENGTH];
            for slot in &mut host.job_status {
                if slot.connect_status == ConnectStatus::NotWorking as u8 {
                    slot.connect_status = ConnectStatus::Disconnect as u8;
                }
            }
            drop(guard);
        }
        let host = self.fsa.get_mut(pos);
        host.host_status &= !AUTO_PAUSE_QUEUE_STAT;
        let alias = host.host_alias_str().to_string();
        tracing::info!(
            "Starting input queue for {alias} that was stopped by the \
             controller."
        );
    }

    /// Push the failing entry's key back so other hosts' jobs move
    /// ahead, then re-sort it in place. Returns the entry's new index.
    fn decay_entry(&mut self, qb_pos: usize) -> usize {
        let entry = *self.qb.get(qb_pos);
        if !entry.is_push() {
            return qb_pos;
        }
        let decayed = decay(
            entry.msg_number,
            entry.creation_time,
            entry.retries,
            self.max_threshold,
        );
        if decayed != entry.msg_number {
            self.qb.get_mut(qb_pos).msg_number = decayed;
            self.qb.resort_forward(qb_pos)
        } else {
            qb_pos
        }
    }

    /// Release connection slot `conn_pos` and settle the host's
    /// counters.
    pub fn remove_connection(
        &mut self,
        conn_pos: usize,
        verdict: Verdict,
        now: i64,
    ) {
        let conn = self.connections.get(conn_pos).clone();
        if conn.is_free() {
            return;
        }
        if conn.fsa_pos >= 0 && (conn.fsa_pos as usize) < self.fsa.len() {
            let pos = conn.fsa_pos as usize;
            match verdict {
                Verdict::Failed => {
                    let guard = self.fsa.lock_error_counter(pos);
                    let host = self.fsa.get_mut(pos);
                    host.error_counter += 1;
                    host.last_retry_time = now;
                    drop(guard);
                }
                Verdict::Done => {
                    let guard = self.fsa.lock_error_counter(pos);
                    self.fsa.get_mut(pos).error_counter = 0;
                    drop(guard);
                }
                Verdict::Requeue | Verdict::StillRunning => {}
            }
            let host = self.fsa.get_mut(pos);
            host.active_transfers = host.active_transfers.saturating_sub(1);
            if conn.job_no >= 0 {
                let slot = &mut host.job_status[conn.job_no as usize];
                slot.proc_id = -1;
                if slot.connect_status != ConnectStatus::NotWorking as u8 {
                    slot.connect_status = ConnectStatus::Disconnect as u8;
                }
                slot.unique_name = [0; 48];
                slot.job_id = dray_core::fsa::NO_ID;
            }
            if self.fsa.get(pos).transfer_rate_limit > 0
                || self.trl.has_groups()
            {
                calc_trl_per_process(&mut self.fsa, pos, &self.trl);
            }
        }
        self.connections.get_mut(conn_pos).clear();
        let status = self.status.get_mut();
        status.no_of_transfers = status.no_of_transfers.saturating_sub(1);
    }

    /// Answer a burst request: hand the worker the next pending push
    /// for the same host, protocol and port, or tell it to exit.
    pub fn check_burst(&mut self, qb_pos: usize, pid: i64, now: i64) {
        let _ = now;
        let entry = *self.qb.get(qb_pos);
        let connect_pos = entry.connect_pos;
        if connect_pos < 0 || !entry.is_push() {
            tracing::debug!(pid, "burst request without a usable slot");
            return;
        }
        let cache = *self.mdb.get(entry.pos as usize);
        let fsa_pos = cache.fsa_pos;

        let mut successor = None;
        if fsa_pos >= 0
            && self.fsa.get(fsa_pos as usize).jobs_queued > 0
        {
            for index in 0..self.qb.len() {
                let candidate = self.qb.get(index);
                if candidate.slot() == queue::QueueSlot::Pending
                    && candidate.is_push()
                {
                    let candidate_cache =
                        self.mdb.get(candidate.pos as usize);
                    if candidate_cache.fsa_pos == fsa_pos
                        && candidate_cache.protocol == cache.protocol
                        && candidate_cache.port == cache.port
                    {
                        successor = Some(index);
                        break;
                    }
                }
            }
        }

        let conn = self.connections.get(connect_pos as usize);
        let job_no = conn.job_no;
        match successor {
            Some(index) => {
                let next = *self.qb.get(index);
                let next_job_id = self.mdb.get(next.pos as usize).job_id;
                if fsa_pos >= 0 && job_no >= 0 {
                    let slot = &mut self
                        .fsa
                        .get_mut(fsa_pos as usize)
                        .job_status[job_no as usize];
                    slot.job_id = next_job_id;
                    slot.unique_name = next.msg_name;
                }
                self.qb.get_mut(index).pid = pid;
                self.qb.get_mut(index).connect_pos = connect_pos;
                self.connections.get_mut(connect_pos as usize).msg_name =
                    next.msg_name();
                self.abs_reduce(fsa_pos);
                self.remove_msg(qb_pos);
                self.status.get_mut().burst2_counter += 1;
            }
            None => {
                if fsa_pos >= 0 && job_no >= 0 {
                    let slot = &mut self
                        .fsa
                        .get_mut(fsa_pos as usize)
                        .job_status[job_no as usize];
                    // Byte 1 set to 1 tells the worker there is no
                    // follow-up job and it should exit.
                    slot.unique_name = [0; 48];
                    slot.unique_name[1] = 1;
                }
            }
        }
        if let Err(errno) = self.workers.signal(pid, Signal::SIGUSR1) {
            tracing::debug!(pid, %errno, "failed to send SIGUSR1");
        }
    }
}
