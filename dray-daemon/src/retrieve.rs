//! The retrieve poller: pull-side jobs on a timer.
//!
//! Unlike pushes, pull jobs are generated here, not received: every
//! poll interval each remote directory is checked against its state
//! bits and timetable, and eligible ones get a queue entry. The
//! directory's `queued` bit guarantees one pull at a time, so the sort
//! key needs no uniqueness term.

use dray_core::timetable::Timetable;
use dray_core::{queue, QueueEntry};
use dray_model::status::{DIR_DISABLED, DISABLE_RETRIEVE};
use dray_model::{retrieve_msg_number, HOST_DISABLED, STOP_TRANSFER_STAT};

use crate::context::{next_boundary, Fd};
use crate::scheduler::StartOutcome;

impl Fd {
    /// One poller round. Runs only while a global slot is free; even
    /// when retrieving is disabled the timetables advance, so a later
    /// re-enable does not fire every directory at once.
    pub fn check_retrieve_dirs(&mut self, now: i64) {
        if now < self.remote_file_check_time {
            return;
        }
        let positions = self.fra.retrieve_positions();
        if positions.is_empty() {
            return;
        }
        let retrieve_disabled =
            self.fsa.feature_flags() & DISABLE_RETRIEVE != 0;
        let slots_free = self.status.get().no_of_transfers
            < self.config.max_connections;

        for fra_pos in positions {
            if retrieve_disabled || !slots_free {
                self.advance_timetable(fra_pos, now);
                continue;
            }
            let dir = self.fra.get(fra_pos);
            let host_ok = (dir.fsa_pos as usize) < self.fsa.len() && {
                let host = self.fsa.get(dir.fsa_pos as usize);
                host.special_flag & HOST_DISABLED == 0
                    && host.host_status & STOP_TRANSFER_STAT == 0
            };
            let eligible = dir.queued == 0
                && dir.dir_status != DIR_DISABLED
                && host_ok
                && (dir.time_option == 0 || dir.next_check_time <= now);

            if eligible {
                self.enqueue_retrieve(fra_pos, now);
            } else if dir.time_option != 0 && dir.next_check_time <= now {
                // Blocked but scheduled: keep the timetable moving.
                self.advance_timetable(fra_pos, now);
            }
        }
        self.remote_file_check_time = next_boundary(
            now,
            i64::from(self.config.remote_file_check_interval),
        );
    }

    fn enqueue_retrieve(&mut self, fra_pos: usize, now: i64) {
        let (priority, fsa_pos) = {
            let dir = self.fra.get(fra_pos);
            (dir.priority, dir.fsa_pos)
        };
        let key = retrieve_msg_number(priority, now);
        let entry = QueueEntry::new_retrieve(key, now, fra_pos as u32);
        let qb_pos = match self.qb.insert_ordered(entry) {
            Ok(pos) => pos,
            Err(err) => {
                tracing::error!(%err, "failed to grow the queue");
                return;
            }
        };
        self.fra.get_mut(fra_pos).queued = 1;
        if (fsa_pos as usize) < self.fsa.len() {
            self.fsa.get_mut(fsa_pos as usize).jobs_queued += 1;
        }
        self.advance_timetable(fra_pos, now);

        let error_free = (fsa_pos as usize) < self.fsa.len()
            && self.fsa.get(fsa_pos as usize).error_counter == 0;
        if error_free && !self.stop.is_stopping() {
            match self.start_process(fsa_pos, qb_pos, now, false) {
                StartOutcome::Started(pid) => {
                    self.qb.get_mut(qb_pos).pid = pid;
                }
                StartOutcome::Removed => self.remove_msg(qb_pos),
                StartOutcome::NotStarted => {
                    self.qb.get_mut(qb_pos).pid = queue::PENDING;
                }
            }
        }
    }

    fn advance_timetable(&mut self, fra_pos: usize, now: i64) {
        let dir = self.fra.get(fra_pos);
        if dir.time_option == 0 || dir.next_check_time > now {
            return;
        }
        let expr = dir.timetable_str().to_string();
        let next = match Timetable::parse(&expr) {
            Ok(timetable) => timetable.next_after(now),
            Err(err) => {
                tracing::warn!(
                    dir = self.fra.get(fra_pos).dir_alias_str(),
                    %err,
                    "bad timetable, backing off a day"
                );
                now + 86_400
            }
        };
        self.fra.get_mut(fra_pos).next_check_time = next;
    }
}
