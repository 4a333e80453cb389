//! The closed set of transfer protocols a job can be carried over.
//!
//! Each variant knows the worker program that services it (push and
//! fetch side, with the `_trace` debug builds where one exists) and its
//! default port. The numeric discriminant is part of the on-disk cache
//! format and must not be reordered.

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Protocol {
    Ftp = 0,
    Sftp = 1,
    Http = 2,
    Smtp = 3,
    Scp = 4,
    Wmo = 5,
    Map = 6,
    Local = 7,
    /// Legacy alias for [`Protocol::Local`] still emitted by old
    /// job-generator builds. Kept as a distinct wire value.
    Loc = 8,
}

impl Protocol {
    pub fn from_u8(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Protocol::Ftp),
            1 => Ok(Protocol::Sftp),
            2 => Ok(Protocol::Http),
            3 => Ok(Protocol::Smtp),
            4 => Ok(Protocol::Scp),
            5 => Ok(Protocol::Wmo),
            6 => Ok(Protocol::Map),
            7 => Ok(Protocol::Local),
            8 => Ok(Protocol::Loc),
            other => Err(ModelError::UnknownProtocol(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether this protocol has a pull-side (`gf_*`) worker.
    pub fn supports_retrieve(self) -> bool {
        matches!(self, Protocol::Ftp | Protocol::Sftp | Protocol::Http)
    }

    /// Name of the worker program servicing this protocol.
    ///
    /// `fetch` selects the pull-side program, `debug` the `_trace`
    /// build where one exists. Protocols without a trace build fall
    /// back to the plain program.
    pub fn worker_program(self, fetch: bool, debug: bool) -> &'static str {
        match (self, fetch, debug) {
            (Protocol::Ftp, false, false) => "sf_ftp",
            (Protocol::Ftp, false, true) => "sf_ftp_trace",
            (Protocol::Ftp, true, false) => "gf_ftp",
            (Protocol::Ftp, true, true) => "gf_ftp_trace",
            (Protocol::Sftp, false, false) => "sf_sftp",
            (Protocol::Sftp, false, true) => "sf_sftp_trace",
            (Protocol::Sftp, true, false) => "gf_sftp",
            (Protocol::Sftp, true, true) => "gf_sftp_trace",
            (Protocol::Http, false, false) => "sf_http",
            (Protocol::Http, false, true) => "sf_http_trace",
            (Protocol::Http, true, false) => "gf_http",
            (Protocol::Http, true, true) => "gf_http_trace",
            (Protocol::Smtp, _, false) => "sf_smtp",
            (Protocol::Smtp, _, true) => "sf_smtp_trace",
            (Protocol::Scp, _, false) => "sf_scp",
            (Protocol::Scp, _, true) => "sf_scp_trace",
            (Protocol::Wmo, _, false) => "sf_wmo",
            (Protocol::Wmo, _, true) => "sf_wmo_trace",
            // No trace builds exist for these.
            (Protocol::Map, _, _) => "sf_map",
            (Protocol::Local, _, _) | (Protocol::Loc, _, _) => "sf_loc",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Ftp => 21,
            Protocol::Sftp | Protocol::Scp => 22,
            Protocol::Http => 80,
            Protocol::Smtp => 25,
            // Socket-level and local protocols carry their port (or
            // none) in the job definition.
            Protocol::Wmo | Protocol::Map | Protocol::Local | Protocol::Loc => 0,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Protocol::Ftp => "ftp",
            Protocol::Sftp => "sftp",
            Protocol::Http => "http",
            Protocol::Smtp => "smtp",
            Protocol::Scp => "scp",
            Protocol::Wmo => "wmo",
            Protocol::Map => "map",
            Protocol::Local => "local",
            Protocol::Loc => "loc",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_round_trip() {
        for code in 0..=8u8 {
            let p = Protocol::from_u8(code).unwrap();
            assert_eq!(p.as_u8(), code);
        }
        assert!(Protocol::from_u8(9).is_err());
    }

    #[test]
    fn trace_builds_only_where_they_exist() {
        assert_eq!(Protocol::Ftp.worker_program(false, true), "sf_ftp_trace");
        assert_eq!(Protocol::Sftp.worker_program(true, false), "gf_sftp");
        assert_eq!(Protocol::Map.worker_program(false, true), "sf_map");
        assert_eq!(Protocol::Loc.worker_program(false, true), "sf_loc");
    }

    #[test]
    fn only_ftp_sftp_http_retrieve() {
        assert!(Protocol::Ftp.supports_retrieve());
        assert!(Protocol::Sftp.supports_retrieve());
        assert!(Protocol::Http.supports_retrieve());
        assert!(!Protocol::Smtp.supports_retrieve());
        assert!(!Protocol::Local.supports_retrieve());
    }
}
