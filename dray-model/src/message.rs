//! Intake wire format and spool message names.
//!
//! The job generator announces every new transfer job as one fixed-size
//! binary block on the message fifo. Fields are little-endian and
//! packed; the block length is a wire contract shared with the
//! generator, so any change here is a protocol change.

use std::fmt;
use std::str::FromStr;

use zerocopy::little_endian::{I64, U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{ModelError, Result};

/// Size in bytes of one intake message block.
pub const MSG_BLOCK_LENGTH: usize = std::mem::size_of::<TransferMessage>();

/// Longest rendered message name, including the terminating NUL of the
/// fixed on-disk field.
pub const MAX_MSG_NAME_LENGTH: usize = 48;

/// Who pushed this message onto the intake fifo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Originator {
    /// The upstream job generator.
    Generator = 0,
    /// An operator resending from the output log browser.
    Resend = 1,
}

impl Originator {
    pub fn from_u8(byte: u8) -> Self {
        if byte == 1 {
            Originator::Resend
        } else {
            Originator::Generator
        }
    }
}

/// One job descriptor as read off the message fifo.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
pub struct TransferMessage {
    pub creation_time: I64,
    pub job_id: U32,
    pub split_counter: U32,
    pub files_to_send: U32,
    pub file_size_to_send: U64,
    pub dir_no: U16,
    pub unique_number: U16,
    /// Ascii digit `'0'..='9'`; `'0'` is the most urgent.
    pub priority: u8,
    pub originator: u8,
}

impl TransferMessage {
    /// Parse one block from the front of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let (msg, _) = Self::read_from_prefix(buf)
            .map_err(|_| ModelError::ShortMessageBlock(buf.len()))?;
        if !msg.priority.is_ascii_digit() {
            return Err(ModelError::InvalidPriority(msg.priority));
        }
        Ok(msg)
    }

    pub fn msg_name(&self) -> MsgName {
        MsgName {
            job_id: self.job_id.get(),
            dir_no: self.dir_no.get(),
            creation_time: self.creation_time.get(),
            unique_number: self.unique_number.get(),
            split_counter: self.split_counter.get(),
        }
    }

    pub fn originator(&self) -> Originator {
        Originator::from_u8(self.originator)
    }
}

/// The identity of a queued push job.
///
/// Rendered as `<jobId>/<dirNo>/<creationTime>_<unique>_<split>` in
/// lower-case hex, which doubles as the job's spool directory relative
/// to the outgoing file directory. Pull jobs have no message name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MsgName {
    pub job_id: u32,
    pub dir_no: u16,
    pub creation_time: i64,
    pub unique_number: u16,
    pub split_counter: u32,
}

impl fmt::Display for MsgName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:x}/{:x}/{:x}_{:x}_{:x}",
            self.job_id,
            self.dir_no,
            self.creation_time,
            self.unique_number,
            self.split_counter
        )
    }
}

impl FromStr for MsgName {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || ModelError::InvalidMsgName(s.to_string());
        let mut parts = s.splitn(3, '/');
        let job_id = u32::from_str_radix(parts.next().ok_or_else(bad)?, 16)
            .map_err(|_| bad())?;
        let dir_no = u16::from_str_radix(parts.next().ok_or_else(bad)?, 16)
            .map_err(|_| bad())?;
        let tail = parts.next().ok_or_else(bad)?;
        let mut fields = tail.splitn(3, '_');
        let creation_time =
            i64::from_str_radix(fields.next().ok_or_else(bad)?, 16)
                .map_err(|_| bad())?;
        let unique_number =
            u16::from_str_radix(fields.next().ok_or_else(bad)?, 16)
                .map_err(|_| bad())?;
        let split_counter =
            u32::from_str_radix(fields.next().ok_or_else(bad)?, 16)
                .map_err(|_| bad())?;
        Ok(MsgName {
            job_id,
            dir_no,
            creation_time,
            unique_number,
            split_counter,
        })
    }
}

impl MsgName {
    /// Encode into a fixed NUL-padded field for the persistent queue.
    pub fn to_field(&self) -> [u8; MAX_MSG_NAME_LENGTH] {
        let mut field = [0u8; MAX_MSG_NAME_LENGTH];
        let rendered = self.to_string();
        field[..rendered.len()].copy_from_slice(rendered.as_bytes());
        field
    }

    /// Decode a fixed field; `None` when the field is empty (pull job).
    pub fn from_field(field: &[u8]) -> Result<Option<Self>> {
        if field.first() == Some(&0) {
            return Ok(None);
        }
        let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        let s = std::str::from_utf8(&field[..end])
            .map_err(|_| ModelError::InvalidMsgName(String::from("<non-utf8>")))?;
        s.parse().map(Some)
    }
}
