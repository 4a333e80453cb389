//! The two-phase shutdown sequencer.
//!
//! Phase one asks nicely: SIGINT to every live worker, then up to
//! fifteen one-second rounds of non-blocking reaps. Phase two ends the
//! discussion with SIGKILL and blocking reaps. Afterwards every mapped
//! area is flushed and the shared slots are returned to their idle
//! state, so the next daemon start finds a clean world.

use std::time::Duration;

use nix::sys::signal::Signal;

use crate::context::{now, Fd};

/// Polite-phase rounds before the hard kill.
const SOFT_KILL_ROUNDS: u32 = 15;

impl Fd {
    /// Run the full shutdown sequence. Idempotent: a second call finds
    /// nothing to do.
    pub async fn fd_exit(&mut self) {
        let mut round = 0;
        while self.status.get().no_of_transfers > 0
            && round < SOFT_KILL_ROUNDS
        {
            for pid in self.workers.live_pids() {
                if let Err(errno) = self.workers.signal(pid, Signal::SIGINT)
                {
                    tracing::warn!(
                        pid,
                        %errno,
                        "failed to interrupt transfer job"
                    );
                }
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            self.reap_all(false).await;
            round += 1;
        }

        // Anything still alive gets the hard kill.
        let mut killed = 0u32;
        for pid in self.workers.live_pids() {
            if self.workers.signal(pid, Signal::SIGKILL).is_ok() {
                killed += 1;
            }
        }
        self.reap_all(true).await;
        if killed > 0 {
            tracing::debug!("Have killed {killed} jobs the hard way!");
        }

        self.transfer_log.flush_repeats();
        if let Err(err) = self.qb.sync() {
            tracing::error!(%err, "failed to sync queue buffer");
        }
        if let Err(err) = self.mdb.sync() {
            tracing::error!(%err, "failed to sync message cache");
        }

        // Leave the shared areas the way a starting daemon expects
        // them.
        self.status.get_mut().no_of_transfers = 0;
        for host in self.fsa.hosts_mut() {
            host.active_transfers = 0;
            host.trl_per_process = 0;
            for slot in &mut host.job_status {
                slot.reset_disconnect();
            }
        }
        self.status.get_mut().fd = 0;
        let _ = self.status.sync();
        let _ = self.fsa.sync();
        let _ = self.fra.sync();

        tracing::info!("Stopped FD.");
    }

    /// Reap every live worker once, applying verdicts.
    async fn reap_all(&mut self, blocking: bool) {
        let current = now();
        for conn_pos in 0..self.connections.len() {
            let pid = self.connections.get(conn_pos).pid;
            if pid <= 0 {
                continue;
            }
            let Some(mut qb_pos) = self.qb.position_of_pid(pid) else {
                // Rogue slot without a queue entry: free it anyway.
                let _ = if blocking {
                    self.workers.reap(pid).await.map(Some)
                } else {
                    self.workers.try_reap(pid)
                };
                self.remove_connection(
                    conn_pos,
                    crate::lifecycle::Verdict::Requeue,
                    current,
                );
                continue;
            };
            let verdict = self
                .zombie_check(conn_pos, &mut qb_pos, current, blocking)
                .await;
            self.apply_verdict(qb_pos, verdict);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::testutil::TestFd;

    #[tokio::test]
    async fn exit_with_no_workers_is_quick_and_resets_state() {
        let mut harness = TestFd::new();
        harness.fd.fsa.get_mut(0).active_transfers = 2;
        harness.fd.fsa.get_mut(0).trl_per_process = 77;
        harness.fd.fd_exit().await;
        let host = harness.fd.fsa.get(0);
        assert_eq!(host.active_transfers, 0);
        assert_eq!(host.trl_per_process, 0);
        for slot in &host.job_status {
            assert_eq!(slot.proc_id, -1);
        }
        assert_eq!(harness.fd.status.get().no_of_transfers, 0);
        assert_eq!(harness.fd.status.get().fd, 0);
    }

    #[tokio::test]
    async fn exit_is_idempotent() {
        let mut harness = TestFd::new();
        harness.fd.fd_exit().await;
        harness.fd.fd_exit().await;
        assert_eq!(harness.fd.status.get().no_of_transfers, 0);
    }
}
