//! The host status area.
//!
//! One record per destination host, shared (as a mapped file) with the
//! job generator, the transfer workers and the operator UI. The
//! scheduler owns the transfer counters; workers update the per-slot
//! progress fields; the UI reads everything. Field offsets are a
//! binary contract - additions go at the end of the record.

use std::path::Path;

use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use dray_model::ConnectStatus;

use crate::error::Result;
use crate::mapped::{lock_region, MappedRecords, RegionGuard, WORD_OFFSET};

pub const ERROR_HISTORY_LENGTH: usize = 5;
pub const MAX_NO_PARALLEL_JOBS: usize = 5;
pub const MAX_HOST_ALIAS_LENGTH: usize = 40;
pub const MAX_HOST_DSP_LENGTH: usize = 42;

/// `job_id` value of a vacant job slot.
pub const NO_ID: u32 = u32::MAX;

/// `original_toggle_pos` value when no failover is recorded.
pub const TOGGLE_NONE: u8 = 0;
pub const HOST_ONE: u8 = 1;
pub const HOST_TWO: u8 = 2;

/// Progress of one parallel transfer to a host.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
#[repr(C)]
pub struct JobSlot {
    pub proc_id: i64,
    pub file_size: u64,
    pub file_size_done: u64,
    pub file_size_in_use: u64,
    pub file_size_in_use_done: u64,
    pub job_id: u32,
    pub no_of_files: u32,
    pub no_of_files_done: u32,
    pub connect_status: u8,
    pub special_flag: u8,
    pub unique_name: [u8; 48],
    pub file_name_in_use: [u8; 40],
    _pad: [u8; 2],
}

impl JobSlot {
    /// Clear progress after a broken worker. The slot shows
    /// `NotWorking` until something else claims it.
    pub fn reset_broken(&mut self) {
        self.connect_status = ConnectStatus::NotWorking as u8;
        self.no_of_files = 0;
        self.no_of_files_done = 0;
        self.file_size = 0;
        self.file_size_done = 0;
        self.file_size_in_use = 0;
        self.file_size_in_use_done = 0;
        self.file_name_in_use = [0; 40];
    }

    /// Return the slot to its vacant state.
    pub fn reset_disconnect(&mut self) {
        self.proc_id = -1;
        self.job_id = NO_ID;
        self.connect_status = ConnectStatus::Disconnect as u8;
        self.no_of_files = 0;
        self.file_name_in_use = [0; 40];
        self.unique_name = [0; 48];
    }
}

/// One destination host.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
#[repr(C)]
pub struct HostStatus {
    pub last_retry_time: i64,
    pub last_connection: i64,
    pub first_error_time: i64,
    pub total_file_size: u64,
    pub transfer_rate_limit: u64,
    pub trl_per_process: u64,
    pub retry_interval: u32,
    pub error_counter: u32,
    pub jobs_queued: u32,
    pub total_file_counter: u32,
    pub active_transfers: u32,
    pub allowed_transfers: u32,
    pub max_successful_retries: u32,
    pub successful_retries: u32,
    pub host_status: u8,
    pub special_flag: u8,
    pub auto_toggle: u8,
    pub debug: u8,
    pub host_toggle: u8,
    pub original_toggle_pos: u8,
    /// Index in `host_dsp_name` of the toggle character.
    pub toggle_pos: u8,
    /// Ring of the most recent worker exit codes, newest first.
    pub error_history: [u8; ERROR_HISTORY_LENGTH],
    pub host_toggle_str: [u8; 4],
    pub host_alias: [u8; MAX_HOST_ALIAS_LENGTH],
    pub host_dsp_name: [u8; MAX_HOST_DSP_LENGTH],
    _pad: [u8; 6],
    pub job_status: [JobSlot; MAX_NO_PARALLEL_JOBS],
}

impl HostStatus {
    pub fn host_alias_str(&self) -> &str {
        field_str(&self.host_alias)
    }

    pub fn host_dsp_name_str(&self) -> &str {
        field_str(&self.host_dsp_name)
    }

    /// Record an exit code: shift the history right, newest at 0.
    pub fn push_error_history(&mut self, exit_code: u8) {
        self.error_history
            .copy_within(0..ERROR_HISTORY_LENGTH - 1, 1);
        self.error_history[0] = exit_code;
    }

    /// Rewrite the display name's toggle character to match
    /// `host_toggle`.
    pub fn refresh_toggle_char(&mut self) {
        let pos = self.toggle_pos as usize;
        if pos < self.host_dsp_name.len() {
            self.host_dsp_name[pos] =
                self.host_toggle_str[self.host_toggle as usize & 3];
        }
    }
}

fn field_str(field: &[u8]) -> &str {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    std::str::from_utf8(&field[..end]).unwrap_or("")
}

/// The mapped host table.
///
/// Header bytes: 0 = host-config generation counter, 1 = feature
/// flags.
#[derive(Debug)]
pub struct HostStatusArea {
    records: MappedRecords<HostStatus>,
}

const HDR_CONFIG_COUNTER: usize = 0;
const HDR_FEATURE_FLAGS: usize = 1;

impl HostStatusArea {
    pub fn open(path: &Path, host_hint: usize) -> Result<Self> {
        Ok(HostStatusArea {
            records: MappedRecords::open(path, host_hint.max(4))?,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, pos: usize) -> &HostStatus {
        self.records.get(pos)
    }

    pub fn get_mut(&mut self, pos: usize) -> &mut HostStatus {
        self.records.get_mut(pos)
    }

    pub fn hosts(&self) -> &[HostStatus] {
        self.records.records()
    }

    pub fn hosts_mut(&mut self) -> &mut [HostStatus] {
        self.records.records_mut()
    }

    pub fn position_of_alias(&self, alias: &str) -> Option<usize> {
        self.records
            .records()
            .iter()
            .position(|host| host.host_alias_str() == alias)
    }

    pub fn config_counter(&self) -> u8 {
        self.records.header_byte(HDR_CONFIG_COUNTER)
    }

    pub fn feature_flags(&self) -> u8 {
        self.records.header_byte(HDR_FEATURE_FLAGS)
    }

    pub fn set_feature_flag(&mut self, flag: u8, on: bool) {
        let mut flags = self.records.header_byte(HDR_FEATURE_FLAGS);
        if on {
            flags |= flag;
        } else {
            flags &= !flag;
        }
        self.records.set_header_byte(HDR_FEATURE_FLAGS, flags);
    }

    /// Take the cross-process lock covering `error_counter` of the
    /// host at `pos`. Held while auto-pause recovery zeroes the error
    /// state.
    pub fn lock_error_counter(&self, pos: usize) -> Result<RegionGuard> {
        let offset = WORD_OFFSET
            + pos * size_of::<HostStatus>()
            + core::mem::offset_of!(HostStatus, error_counter);
        lock_region(self.records.raw_fd(), offset as i64, 4)
    }

    /// Append a host record. Used at attach time by the controller and
    /// by test setups; the scheduler itself never adds hosts.
    pub fn add_host(&mut self, alias: &str) -> Result<usize> {
        let mut host = HostStatus::new_zeroed();
        let len = alias.len().min(MAX_HOST_ALIAS_LENGTH - 1);
        host.host_alias[..len].copy_from_slice(&alias.as_bytes()[..len]);
        host.host_dsp_name[..len].copy_from_slice(&alias.as_bytes()[..len]);
        host.allowed_transfers = 2;
        host.retry_interval = 120;
        host.host_toggle = HOST_ONE;
        host.host_toggle_str = [0, b'1', b'2', 0];
        for slot in &mut host.job_status {
            slot.reset_disconnect();
        }
        Ok(self.records.push(host)?)
    }

    pub fn sync(&self) -> Result<()> {
        self.records.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dray_model::STOP_TRANSFER_STAT;

    #[test]
    fn alias_lookup_and_counters() {
        let dir = tempfile::tempdir().unwrap();
        let mut fsa =
            HostStatusArea::open(&dir.path().join("fsa_status"), 0).unwrap();
        fsa.add_host("wx-alpha").unwrap();
        fsa.add_host("wx-beta").unwrap();
        assert_eq!(fsa.position_of_alias("wx-beta"), Some(1));
        assert_eq!(fsa.position_of_alias("missing"), None);
        fsa.get_mut(0).host_status |= STOP_TRANSFER_STAT;
        assert_ne!(fsa.get(0).host_status & STOP_TRANSFER_STAT, 0);
    }

    #[test]
    fn error_history_shifts_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut fsa =
            HostStatusArea::open(&dir.path().join("fsa_status"), 0).unwrap();
        fsa.add_host("wx-alpha").unwrap();
        let host = fsa.get_mut(0);
        for code in 1..=7u8 {
            host.push_error_history(code);
        }
        assert_eq!(host.error_history, [7, 6, 5, 4, 3]);
    }

    #[test]
    fn error_counter_lock_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut fsa =
            HostStatusArea::open(&dir.path().join("fsa_status"), 0).unwrap();
        fsa.add_host("wx-alpha").unwrap();
        let guard = fsa.lock_error_counter(0).unwrap();
        fsa.get_mut(0).error_counter = 0;
        drop(guard);
        // Locking again after release must not dead-wait.
        let again = fsa.lock_error_counter(0).unwrap();
        drop(again);
    }

    #[test]
    fn toggle_char_tracks_host_toggle() {
        let dir = tempfile::tempdir().unwrap();
        let mut fsa =
            HostStatusArea::open(&dir.path().join("fsa_status"), 0).unwrap();
        fsa.add_host("wx").unwrap();
        let host = fsa.get_mut(0);
        host.toggle_pos = 2;
        host.host_toggle = HOST_TWO;
        host.refresh_toggle_char();
        assert_eq!(host.host_dsp_name[2], b'2');
    }
}
