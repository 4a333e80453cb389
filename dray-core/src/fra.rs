//! The retrieve-directory status area.
//!
//! One record per watched directory, maintained by the job generator
//! and read by the scheduler's retrieve poller. The `queued` byte is
//! the mutual exclusion between poller rounds: a directory with a
//! queue entry is never enqueued twice.

use std::path::Path;

use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::error::Result;
use crate::mapped::MappedRecords;

pub const MAX_DIR_ALIAS_LENGTH: usize = 40;
pub const MAX_TIMETABLE_LENGTH: usize = 64;

/// One watched directory.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
#[repr(C)]
pub struct RetrieveDir {
    /// Next timetable fire, meaningful when `time_option` is set.
    pub next_check_time: i64,
    /// Index of the gateway host in the host table.
    pub fsa_pos: i32,
    pub dir_id: u32,
    /// Ascii digit, same scale as push priorities.
    pub priority: u8,
    /// Set while a pull job for this directory sits in the queue.
    pub queued: u8,
    pub dir_status: u8,
    /// When set, polls follow `timetable` instead of every interval.
    pub time_option: u8,
    pub protocol: u8,
    /// Directory fetches from a remote host (pull candidates only).
    pub remote: u8,
    pub dir_alias: [u8; MAX_DIR_ALIAS_LENGTH],
    pub host_alias: [u8; MAX_DIR_ALIAS_LENGTH],
    pub timetable: [u8; MAX_TIMETABLE_LENGTH],
    _pad: [u8; 2],
}

impl RetrieveDir {
    pub fn dir_alias_str(&self) -> &str {
        field_str(&self.dir_alias)
    }

    pub fn host_alias_str(&self) -> &str {
        field_str(&self.host_alias)
    }

    pub fn timetable_str(&self) -> &str {
        field_str(&self.timetable)
    }
}

fn field_str(field: &[u8]) -> &str {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    std::str::from_utf8(&field[..end]).unwrap_or("")
}

/// The mapped directory table.
#[derive(Debug)]
pub struct RetrieveArea {
    records: MappedRecords<RetrieveDir>,
}

impl RetrieveArea {
    pub fn open(path: &Path, dir_hint: usize) -> Result<Self> {
        Ok(RetrieveArea {
            records: MappedRecords::open(path, dir_hint.max(4))?,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, pos: usize) -> &RetrieveDir {
        self.records.get(pos)
    }

    pub fn get_mut(&mut self, pos: usize) -> &mut RetrieveDir {
        self.records.get_mut(pos)
    }

    pub fn dirs(&self) -> &[RetrieveDir] {
        self.records.records()
    }

    pub fn dirs_mut(&mut self) -> &mut [RetrieveDir] {
        self.records.records_mut()
    }

    /// Indices of the directories the retrieve poller considers.
    pub fn retrieve_positions(&self) -> Vec<usize> {
        self.records
            .records()
            .iter()
            .enumerate()
            .filter(|(_, dir)| dir.remote != 0)
            .map(|(pos, _)| pos)
            .collect()
    }

    /// Clear any queued marks left over from a previous run.
    pub fn clear_queued_flags(&mut self) {
        for dir in self.records.records_mut() {
            dir.queued = 0;
        }
    }

    /// Append a directory record. Attach-time and test scaffolding.
    #[allow(clippy::too_many_arguments)]
    pub fn add_dir(
        &mut self,
        dir_alias: &str,
        host_alias: &str,
        fsa_pos: i32,
        protocol: u8,
        priority: u8,
        remote: bool,
        timetable: Option<&str>,
    ) -> Result<usize> {
        let mut dir = RetrieveDir::new_zeroed();
        copy_field(&mut dir.dir_alias, dir_alias);
        copy_field(&mut dir.host_alias, host_alias);
        dir.fsa_pos = fsa_pos;
        dir.protocol = protocol;
        dir.priority = priority;
        dir.remote = u8::from(remote);
        if let Some(expr) = timetable {
            dir.time_option = 1;
            copy_field(&mut dir.timetable, expr);
        }
        Ok(self.records.push(dir)?)
    }

    pub fn sync(&self) -> Result<()> {
        self.records.sync()
    }
}

fn copy_field(field: &mut [u8], value: &str) {
    let len = value.len().min(field.len() - 1);
    field[..len].copy_from_slice(&value.as_bytes()[..len]);
}
