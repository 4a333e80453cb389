//! The message cache: per-job metadata resolved once per job id.
//!
//! The upstream job generator maintains the authoritative job-id table
//! (`fifodir/jid_data`); the cache (`fifodir/msg_cache_buf`) is the
//! scheduler's persistent, index-stable view of it. Queue entries for
//! push jobs refer to cache slots by index, so slots are appended and
//! rewritten in place, never reshuffled.

use std::path::Path;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{CoreError, Result};
use crate::fsa::HostStatusArea;
use crate::mapped::MappedRecords;

pub const MAX_HOST_ALIAS_LENGTH: usize = 40;

/// One record of the job-id master table, owned by the job generator.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
#[repr(C)]
pub struct JobIdRecord {
    pub job_id: u32,
    pub port: i32,
    pub age_limit: u32,
    pub protocol: u8,
    pub priority: u8,
    pub host_alias: [u8; MAX_HOST_ALIAS_LENGTH],
    _pad: [u8; 2],
}

impl JobIdRecord {
    pub fn host_alias_str(&self) -> &str {
        field_str(&self.host_alias)
    }
}

/// One message-cache slot.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
#[repr(C)]
pub struct CacheEntry {
    pub last_transfer_time: i64,
    pub job_id: u32,
    /// Index of the destination host, refreshed on every re-attach.
    pub fsa_pos: i32,
    pub port: i32,
    pub age_limit: u32,
    pub protocol: u8,
    /// Cleared when the host vanished from the current host table.
    pub in_current_fsa: u8,
    pub host_name: [u8; MAX_HOST_ALIAS_LENGTH],
    _pad: [u8; 6],
}

impl CacheEntry {
    pub fn host_name_str(&self) -> &str {
        field_str(&self.host_name)
    }
}

fn field_str(field: &[u8]) -> &str {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    std::str::from_utf8(&field[..end]).unwrap_or("")
}

/// The job-id master table. Read-only from the scheduler's side.
#[derive(Debug)]
pub struct JobIdTable {
    records: MappedRecords<JobIdRecord>,
}

impl JobIdTable {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(JobIdTable {
            records: MappedRecords::open(path, 16)?,
        })
    }

    pub fn find(&self, job_id: u32) -> Option<&JobIdRecord> {
        self.records
            .records()
            .iter()
            .find(|record| record.job_id == job_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Test scaffolding: append a record the way the generator does.
    pub fn push(
        &mut self,
        job_id: u32,
        host_alias: &str,
        protocol: u8,
        port: i32,
        age_limit: u32,
        priority: u8,
    ) -> Result<usize> {
        let mut alias = [0u8; MAX_HOST_ALIAS_LENGTH];
        let len = host_alias.len().min(MAX_HOST_ALIAS_LENGTH - 1);
        alias[..len].copy_from_slice(&host_alias.as_bytes()[..len]);
        self.records.push(JobIdRecord {
            job_id,
            port,
            age_limit,
            protocol,
            priority,
            host_alias: alias,
            _pad: [0; 2],
        })
    }
}

/// The message cache, mapped from `fifodir/msg_cache_buf`.
#[derive(Debug)]
pub struct MsgCache {
    records: MappedRecords<CacheEntry>,
}

impl MsgCache {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(MsgCache {
            records: MappedRecords::open(path, 32)?,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, index: usize) -> &CacheEntry {
        self.records.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> &mut CacheEntry {
        self.records.get_mut(index)
    }

    /// Cache slot for `job_id`, appending one from the master table on
    /// a miss. An id unknown to the master table is an error; the
    /// caller drops the message and its spool directory.
    pub fn lookup_job_id(
        &mut self,
        job_id: u32,
        jid: &JobIdTable,
        fsa: &HostStatusArea,
    ) -> Result<usize> {
        if let Some(index) = self
            .records
            .records()
            .iter()
            .position(|entry| entry.job_id == job_id)
        {
            return Ok(index);
        }
        let record = jid
            .find(job_id)
            .ok_or(CoreError::UnknownJobId(job_id))?;
        let alias = record.host_alias_str();
        let fsa_pos = fsa
            .position_of_alias(alias)
            .ok_or_else(|| CoreError::UnknownHost(alias.to_string()))?;
        let entry = CacheEntry {
            last_transfer_time: 0,
            job_id,
            fsa_pos: fsa_pos as i32,
            port: record.port,
            age_limit: record.age_limit,
            protocol: record.protocol,
            in_current_fsa: 1,
            host_name: record.host_alias,
            _pad: [0; 6],
        };
        Ok(self.records.push(entry)?)
    }

    /// Revalidate every slot against the master table. Jobs whose
    /// definition changed get their binding, port and age limit
    /// rewritten; jobs that vanished are flagged so the age sweep can
    /// retire them.
    pub fn check_msg_time(&mut self, jid: &JobIdTable, fsa: &HostStatusArea) {
        for index in 0..self.records.len() {
            let job_id = self.records.get(index).job_id;
            match jid.find(job_id) {
                Some(record) => {
                    let record = *record;
                    let fsa_pos = fsa
                        .position_of_alias(record.host_alias_str())
                        .map(|pos| pos as i32)
                        .unwrap_or(-1);
                    let entry = self.records.get_mut(index);
                    if entry.age_limit != record.age_limit
                        || entry.port != record.port
                        || entry.protocol != record.protocol
                        || entry.fsa_pos != fsa_pos
                        || entry.host_name != record.host_alias
                    {
                        tracing::debug!(
                            job_id = format_args!("{job_id:#x}"),
                            "job definition changed, rewriting cache slot"
                        );
                        entry.age_limit = record.age_limit;
                        entry.port = record.port;
                        entry.protocol = record.protocol;
                        entry.fsa_pos = fsa_pos;
                        entry.host_name = record.host_alias;
                    }
                    entry.in_current_fsa = u8::from(fsa_pos >= 0);
                }
                None => {
                    self.records.get_mut(index).in_current_fsa = 0;
                }
            }
        }
    }

    /// Rebind every slot's host index after the host table was
    /// re-attached.
    pub fn recompute_host_bindings(&mut self, fsa: &HostStatusArea) {
        for index in 0..self.records.len() {
            let alias_field = self.records.get(index).host_name;
            let fsa_pos = fsa
                .position_of_alias(field_str(&alias_field))
                .map(|pos| pos as i32)
                .unwrap_or(-1);
            let entry = self.records.get_mut(index);
            entry.fsa_pos = fsa_pos;
            entry.in_current_fsa = u8::from(fsa_pos >= 0);
        }
    }

    pub fn sync(&self) -> Result<()> {
        self.records.sync()
    }
}
