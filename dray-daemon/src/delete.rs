//! Operator-driven job deletion.
//!
//! The delete fifo carries batches of NUL-separated message names. A
//! named job is torn down wherever it is: a running worker is killed
//! and reaped on the spot (so its connection slot cannot leak), the
//! spool directory is removed, and the queue entry goes away.

use nix::sys::signal::Signal;

use crate::context::Fd;
use crate::logs::DeleteReason;

impl Fd {
    /// Handle one batch off the delete fifo.
    pub async fn handle_delete_data(&mut self, data: &[u8], now: i64) {
        for raw_name in data.split(|&byte| byte == 0) {
            if raw_name.is_empty() {
                continue;
            }
            let Ok(name) = std::str::from_utf8(raw_name) else {
                tracing::debug!("non-utf8 name on delete fifo");
                continue;
            };
            self.delete_by_name(name, now).await;
        }
    }

    async fn delete_by_name(&mut self, name: &str, now: i64) {
        let Some(qb_pos) = self
            .qb
            .entries()
            .iter()
            .position(|entry| entry.msg_name_str() == name)
        else {
            tracing::debug!(%name, "delete request for unknown message");
            return;
        };
        let entry = *self.qb.get(qb_pos);

        if entry.pid > 0 {
            // Kill and reap synchronously; the GOT_KILLED path would
            // requeue it, so the slot is released here instead.
            if let Err(errno) =
                self.workers.signal(entry.pid, Signal::SIGKILL)
            {
                tracing::warn!(
                    pid = entry.pid,
                    %errno,
                    "failed to kill worker for deleted job"
                );
            }
            if entry.connect_pos >= 0 {
                let mut reap_pos = qb_pos;
                let _ = self
                    .zombie_check(
                        entry.connect_pos as usize,
                        &mut reap_pos,
                        now,
                        true,
                    )
                    .await;
            }
        } else {
            // Pending jobs still hold a queued slot on their host.
            let fsa_pos = self.fsa_pos_of_entry(qb_pos);
            self.abs_reduce(fsa_pos);
        }

        if entry.is_push() {
            let job_id =
                entry.msg_name().map_or(0, |parsed| parsed.job_id);
            self.remove_job_files(name, job_id, DeleteReason::UserDel);
        }
        // A decay inside the reap may have re-sorted the queue.
        if let Some(current) = self
            .qb
            .entries()
            .iter()
            .position(|candidate| candidate.msg_name_str() == name)
        {
            self.remove_msg(current);
        }
    }
}
