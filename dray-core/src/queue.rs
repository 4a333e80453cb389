//! The persistent transfer queue.
//!
//! Entries are kept sorted by `msg_number` (lower dequeues first) in a
//! memory-mapped file so a daemon restart picks up exactly where it
//! stopped. Indices into the queue are identities handed out to the
//! rest of the scheduler, which is why insertion and removal shift
//! records explicitly rather than swapping.

use std::path::Path;

use dray_model::message::MAX_MSG_NAME_LENGTH;
use dray_model::MsgName;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::Result;
use crate::mapped::MappedRecords;

/// `pid` value of an entry waiting to be scheduled.
pub const PENDING: i64 = -2;
/// `pid` value of an entry the scheduler decided to drop.
pub const REMOVED: i64 = -3;

/// Scheduling state of one queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueSlot {
    Pending,
    Removed,
    Running(i64),
}

/// One transfer unit in the queue.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
#[repr(C)]
pub struct QueueEntry {
    pub msg_number: f64,
    pub pid: i64,
    pub creation_time: i64,
    pub file_size_to_send: u64,
    /// Message-cache index for pushes, retrieve-directory index for
    /// pulls.
    pub pos: u32,
    pub connect_pos: i32,
    pub retries: u32,
    pub files_to_send: u32,
    pub special_flag: u8,
    pub msg_name: [u8; MAX_MSG_NAME_LENGTH],
    _pad: [u8; 7],
}

/// `special_flag`: job is an operator resend.
pub const RESEND_JOB: u8 = 0x01;

impl QueueEntry {
    pub fn new_push(
        name: &MsgName,
        msg_number: f64,
        creation_time: i64,
        cache_pos: u32,
        files_to_send: u32,
        file_size_to_send: u64,
        resend: bool,
    ) -> Self {
        QueueEntry {
            msg_number,
            pid: PENDING,
            creation_time,
            file_size_to_send,
            pos: cache_pos,
            connect_pos: -1,
            retries: 0,
            files_to_send,
            special_flag: if resend { RESEND_JOB } else { 0 },
            msg_name: name.to_field(),
            _pad: [0; 7],
        }
    }

    pub fn new_retrieve(msg_number: f64, now: i64, fra_pos: u32) -> Self {
        QueueEntry {
            msg_number,
            pid: PENDING,
            creation_time: now,
            file_size_to_send: 0,
            pos: fra_pos,
            connect_pos: -1,
            retries: 0,
            files_to_send: 0,
            special_flag: 0,
            msg_name: [0; MAX_MSG_NAME_LENGTH],
            _pad: [0; 7],
        }
    }

    pub fn slot(&self) -> QueueSlot {
        match self.pid {
            PENDING => QueueSlot::Pending,
            REMOVED => QueueSlot::Removed,
            pid => QueueSlot::Running(pid),
        }
    }

    /// A push job carries a message name; a pull job does not.
    pub fn is_push(&self) -> bool {
        self.msg_name[0] != 0
    }

    pub fn msg_name(&self) -> Option<MsgName> {
        MsgName::from_field(&self.msg_name).ok().flatten()
    }

    pub fn msg_name_str(&self) -> &str {
        let end = self
            .msg_name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.msg_name.len());
        std::str::from_utf8(&self.msg_name[..end]).unwrap_or("")
    }

    pub fn is_resend(&self) -> bool {
        self.special_flag & RESEND_JOB != 0
    }
}

/// The queue buffer, mapped from `fifodir/queue_buffer`.
#[derive(Debug)]
pub struct QueueBuffer {
    records: MappedRecords<QueueEntry>,
}

impl QueueBuffer {
    pub fn open(path: &Path) -> Result<Self> {
        let records = MappedRecords::open(path, 64)?;
        Ok(QueueBuffer { records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, index: usize) -> &QueueEntry {
        self.records.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> &mut QueueEntry {
        self.records.get_mut(index)
    }

    pub fn entries(&self) -> &[QueueEntry] {
        self.records.records()
    }

    /// Insert keeping `msg_number` order. Returns the entry's index.
    ///
    /// Head and tail are special-cased, everything else is an
    /// iterative binary search for the gap: O(log n) comparisons and
    /// one tail shift.
    pub fn insert_ordered(&mut self, entry: QueueEntry) -> Result<usize> {
        let len = self.len();
        if len == 0 {
            self.records.push(entry)?;
            return Ok(0);
        }
        let key = entry.msg_number;
        if key < self.get(0).msg_number {
            self.records.insert(0, entry)?;
            return Ok(0);
        }
        if key > self.get(len - 1).msg_number {
            self.records.push(entry)?;
            return Ok(len);
        }
        let mut start = 0usize;
        let mut end = len - 1;
        loop {
            let center = (end - start) / 2;
            if center == 0 {
                self.records.insert(start + 1, entry)?;
                return Ok(start + 1);
            }
            if key < self.get(start + center).msg_number {
                end = start + center;
            } else {
                start += center;
            }
        }
    }

    /// Drop the entry at `index`, shifting the tail down.
    pub fn remove(&mut self, index: usize) {
        self.records.remove(index);
    }

    /// After an in-place key increase, walk the entry forward to its
    /// new position. Returns the new index.
    pub fn resort_forward(&mut self, index: usize) -> usize {
        let len = self.len();
        let key = self.get(index).msg_number;
        let mut target = index + 1;
        while target < len && key > self.get(target).msg_number {
            target += 1;
        }
        if target > index + 1 {
            self.records.records_mut()[index..target].rotate_left(1);
            target - 1
        } else {
            index
        }
    }

    /// Index of the entry owned by `pid`, if any.
    pub fn position_of_pid(&self, pid: i64) -> Option<usize> {
        self.entries().iter().position(|entry| entry.pid == pid)
    }

    /// True when every adjacent pair is in order. Debug aid.
    pub fn is_sorted(&self) -> bool {
        self.entries()
            .windows(2)
            .all(|pair| pair[0].msg_number <= pair[1].msg_number)
    }

    pub fn sync(&self) -> Result<()> {
        self.records.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dray_model::{msg_number, MsgName};

    fn name(job_id: u32) -> MsgName {
        MsgName {
            job_id,
            dir_no: 0,
            creation_time: 1000,
            unique_number: 7,
            split_counter: 0,
        }
    }

    fn push_entry(key: f64) -> QueueEntry {
        QueueEntry::new_push(&name(0x2a), key, 1000, 0, 3, 12288, false)
    }

    fn open_queue(dir: &tempfile::TempDir) -> QueueBuffer {
        QueueBuffer::open(&dir.path().join("queue_buffer")).unwrap()
    }

    #[test]
    fn stays_sorted_under_mixed_inserts() {
        let dir = tempfile::tempdir().unwrap();
        let mut qb = open_queue(&dir);
        for key in [50.0, 10.0, 90.0, 30.0, 70.0, 30.0, 5.0, 95.0] {
            qb.insert_ordered(push_entry(key)).unwrap();
            assert!(qb.is_sorted());
        }
        assert_eq!(qb.len(), 8);
        assert_eq!(qb.get(0).msg_number, 5.0);
        assert_eq!(qb.get(7).msg_number, 95.0);
    }

    #[test]
    fn push_key_from_intake_fields() {
        // The worked example: job 0x2a, priority '5', creation 1000,
        // unique 7, split 0.
        let key = msg_number(b'5', 1000, 7, 0);
        assert_eq!(key, 50_000_035.0);
        let entry = push_entry(key);
        assert_eq!(entry.msg_name_str(), "2a/0/3e8_7_0");
        assert_eq!(entry.slot(), QueueSlot::Pending);
    }

    #[test]
    fn resort_forward_moves_past_smaller_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut qb = open_queue(&dir);
        for key in [10.0, 20.0, 30.0, 40.0] {
            qb.insert_ordered(push_entry(key)).unwrap();
        }
        // Decay the head past the 30.0 entry.
        qb.get_mut(0).msg_number = 35.0;
        let new_index = qb.resort_forward(0);
        assert_eq!(new_index, 2);
        assert!(qb.is_sorted());
        assert_eq!(qb.get(2).msg_number, 35.0);
    }

    #[test]
    fn queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue_buffer");
        {
            let mut qb = QueueBuffer::open(&path).unwrap();
            qb.insert_ordered(push_entry(42.0)).unwrap();
            qb.sync().unwrap();
        }
        let qb = QueueBuffer::open(&path).unwrap();
        assert_eq!(qb.len(), 1);
        assert_eq!(qb.get(0).msg_number, 42.0);
        assert_eq!(qb.get(0).msg_name_str(), "2a/0/3e8_7_0");
    }

    #[test]
    fn pull_entries_have_no_message_name() {
        let entry = QueueEntry::new_retrieve(123.0, 1000, 4);
        assert!(!entry.is_push());
        assert_eq!(entry.msg_name(), None);
    }

    #[test]
    fn position_of_pid_finds_the_single_owner() {
        let dir = tempfile::tempdir().unwrap();
        let mut qb = open_queue(&dir);
        for key in [1.0, 2.0, 3.0] {
            qb.insert_ordered(push_entry(key)).unwrap();
        }
        qb.get_mut(1).pid = 4242;
        assert_eq!(qb.position_of_pid(4242), Some(1));
        assert_eq!(qb.position_of_pid(4243), None);
    }
}
