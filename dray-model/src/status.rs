//! Status bits shared between the scheduler, the status areas and the
//! operator tooling. The numeric values are part of the shared-memory
//! contract.

/// `host_status`: operator stopped all transfers to this host.
pub const STOP_TRANSFER_STAT: u8 = 0x01;
/// `host_status`: ingestion paused because the host keeps failing.
pub const AUTO_PAUSE_QUEUE_STAT: u8 = 0x02;
/// `host_status`: ingestion paused because the error spool is close to
/// the directory link limit.
pub const AUTO_PAUSE_QUEUE_LOCK_STAT: u8 = 0x04;

/// `special_flag`: host removed from scheduling by the operator.
pub const HOST_DISABLED: u8 = 0x01;

/// FSA feature flags (byte in front of the host array).
pub const DISABLE_RETRIEVE: u8 = 0x01;
pub const DISABLE_ARCHIVE: u8 = 0x02;
pub const ENABLE_CREATE_TARGET_DIR: u8 = 0x04;

/// Directory status value: retrieve directory disabled.
pub const DIR_DISABLED: u8 = 0x01;

/// `amg_jobs` bits in the daemon status area, used for the spool-sweep
/// handshake with the job generator.
pub const DIR_CHECK_ACTIVE: u8 = 0x01;
pub const FD_DIR_CHECK_ACTIVE: u8 = 0x02;
pub const DIR_CHECK_MSG_QUEUED: u8 = 0x04;

/// State of one job-status display slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectStatus {
    Disconnect = 0,
    Connecting = 1,
    Transferring = 2,
    NotWorking = 3,
}

impl ConnectStatus {
    pub fn from_u8(byte: u8) -> Self {
        match byte {
            1 => ConnectStatus::Connecting,
            2 => ConnectStatus::Transferring,
            3 => ConnectStatus::NotWorking,
            _ => ConnectStatus::Disconnect,
        }
    }
}
