//! Worker exit-status contract and its scheduling classification.
//!
//! The numeric codes are shared with every `sf_*`/`gf_*` worker build;
//! the table below is append-only. [`classify_exit`] turns a raw exit
//! into the policy the lifecycle manager applies, keeping the code
//! table out of the scheduling logic.

/// Exit codes reported by transfer workers.
pub mod code {
    pub const TRANSFER_SUCCESS: i32 = 0;
    pub const CONNECT_ERROR: i32 = 1;
    pub const USER_ERROR: i32 = 2;
    pub const PASSWORD_ERROR: i32 = 3;
    pub const TYPE_ERROR: i32 = 4;
    pub const LIST_ERROR: i32 = 5;
    pub const MAIL_ERROR: i32 = 6;
    pub const JID_NUMBER_ERROR: i32 = 7;
    pub const GOT_KILLED: i32 = 8;
    pub const NO_MESSAGE_FILE: i32 = 9;
    pub const OPEN_REMOTE_ERROR: i32 = 10;
    pub const WRITE_REMOTE_ERROR: i32 = 11;
    pub const CLOSE_REMOTE_ERROR: i32 = 12;
    pub const MOVE_REMOTE_ERROR: i32 = 13;
    pub const CHDIR_ERROR: i32 = 14;
    pub const WRITE_LOCK_ERROR: i32 = 15;
    pub const REMOVE_LOCKFILE_ERROR: i32 = 16;
    pub const STAT_ERROR: i32 = 17;
    pub const MKDIR_ERROR: i32 = 18;
    pub const MOVE_ERROR: i32 = 19;
    pub const RENAME_ERROR: i32 = 20;
    pub const OPEN_LOCAL_ERROR: i32 = 21;
    pub const READ_LOCAL_ERROR: i32 = 22;
    pub const LOCK_REGION_ERROR: i32 = 23;
    pub const UNLOCK_REGION_ERROR: i32 = 24;
    pub const ALLOC_ERROR: i32 = 25;
    pub const SELECT_ERROR: i32 = 26;
    pub const WRITE_LOCAL_ERROR: i32 = 27;
    pub const READ_REMOTE_ERROR: i32 = 28;
    pub const SIZE_ERROR: i32 = 29;
    pub const DATE_ERROR: i32 = 30;
    pub const QUIT_ERROR: i32 = 31;
    pub const TIMEOUT_ERROR: i32 = 32;
    pub const CHOWN_ERROR: i32 = 33;
    pub const CONNECTION_RESET_ERROR: i32 = 34;
    pub const DATA_ERROR: i32 = 35;
    pub const REMOTE_USER_ERROR: i32 = 36;
    pub const CHECK_REPLY_ERROR: i32 = 37;
    pub const SIG_PIPE_ERROR: i32 = 38;
    pub const MAP_FUNCTION_ERROR: i32 = 39;
    pub const AUTH_ERROR: i32 = 40;
    pub const OPEN_FILE_DIR_ERROR: i32 = 41;
    pub const SYNTAX_ERROR: i32 = 60;
    pub const NO_FILES_TO_SEND: i32 = 61;
    pub const STILL_FILES_TO_SEND: i32 = 62;
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Normal exit with the given status code.
    Exited(i32),
    /// Terminated by the given signal.
    Signaled(i32),
}

impl WorkerExit {
    /// The exit code recorded in the per-host error history. Signal
    /// terminations are not recorded there.
    pub fn history_code(self) -> Option<u8> {
        match self {
            WorkerExit::Exited(status) => Some(status as u8),
            WorkerExit::Signaled(_) => None,
        }
    }
}

/// What the lifecycle manager does with a finished worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDisposition {
    /// Transfer done; drop the queue entry and reset error state.
    Success,
    /// Worker ran out of its file-list slice but the spool still holds
    /// files; requeue without error bookkeeping.
    StillFiles,
    /// Requeue and retry in place.
    Retryable {
        /// Whether this code stamps the host's first-error time.
        sets_first_error: bool,
        /// Transfer-log line for codes the worker does not report
        /// itself.
        warn: Option<&'static str>,
    },
    /// Requeue, but decay the entry's priority first so jobs for other
    /// hosts move ahead.
    DecayRetryable,
    /// The message file vanished; delete the spool directory so the
    /// entry cannot loop forever.
    MissingMessage,
    /// Worker is broken (bad argv, unknown code, killed by signal):
    /// requeue and zero the job-status slot.
    Broken { warn: &'static str },
    /// Killed, almost certainly by us; requeue without error marks.
    Killed,
    /// Nothing left to send; drop the entry and run auto-pause
    /// recovery.
    Empty,
    /// Worker already reported the problem; drop the entry quietly.
    QuietDrop,
}

/// Classify a worker exit into its scheduling disposition.
pub fn classify_exit(exit: WorkerExit) -> ExitDisposition {
    use code::*;

    let status = match exit {
        WorkerExit::Signaled(_) => {
            return ExitDisposition::Broken {
                warn: "Abnormal termination of transfer job",
            }
        }
        WorkerExit::Exited(status) => status,
    };
    match status {
        TRANSFER_SUCCESS => ExitDisposition::Success,
        STILL_FILES_TO_SEND => ExitDisposition::StillFiles,

        TIMEOUT_ERROR | CONNECTION_RESET_ERROR | CONNECT_ERROR | AUTH_ERROR
        | USER_ERROR | TYPE_ERROR | LIST_ERROR | REMOTE_USER_ERROR
        | DATA_ERROR | READ_LOCAL_ERROR | WRITE_REMOTE_ERROR
        | WRITE_LOCAL_ERROR | READ_REMOTE_ERROR | SIZE_ERROR | DATE_ERROR
        | OPEN_LOCAL_ERROR | WRITE_LOCK_ERROR | CHOWN_ERROR
        | CHECK_REPLY_ERROR | REMOVE_LOCKFILE_ERROR | QUIT_ERROR
        | RENAME_ERROR | SELECT_ERROR | SIG_PIPE_ERROR
        | MAP_FUNCTION_ERROR => ExitDisposition::Retryable {
            sets_first_error: true,
            warn: None,
        },

        STAT_ERROR => ExitDisposition::Retryable {
            sets_first_error: true,
            warn: Some("Disconnected. Could not stat() local file."),
        },
        MAIL_ERROR => ExitDisposition::Retryable {
            sets_first_error: false,
            warn: Some("Failed to send mail."),
        },
        LOCK_REGION_ERROR => ExitDisposition::Retryable {
            sets_first_error: false,
            warn: Some("Disconnected. Failed to lock region."),
        },
        UNLOCK_REGION_ERROR => ExitDisposition::Retryable {
            sets_first_error: false,
            warn: Some("Disconnected. Failed to unlock region."),
        },
        ALLOC_ERROR => ExitDisposition::Retryable {
            sets_first_error: false,
            warn: Some("Failed to allocate memory."),
        },

        PASSWORD_ERROR | CHDIR_ERROR | CLOSE_REMOTE_ERROR | MKDIR_ERROR
        | MOVE_ERROR | MOVE_REMOTE_ERROR | OPEN_REMOTE_ERROR => {
            ExitDisposition::DecayRetryable
        }

        NO_MESSAGE_FILE => ExitDisposition::MissingMessage,
        GOT_KILLED => ExitDisposition::Killed,
        NO_FILES_TO_SEND => ExitDisposition::Empty,
        JID_NUMBER_ERROR | OPEN_FILE_DIR_ERROR => ExitDisposition::QuietDrop,

        SYNTAX_ERROR => ExitDisposition::Broken {
            warn: "Syntax for calling program wrong.",
        },
        _ => ExitDisposition::Broken {
            warn: "Disconnected due to an unknown error.",
        },
    }
}
