//! Writers for the fifos drained by the external log daemons.
//!
//! The scheduler never writes log files itself; it feeds one-line
//! records to the transfer and delete log daemons. A failing host can
//! emit the same line many times per second, so consecutive duplicates
//! within a second are folded into a single "repeated N times"
//! summary.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use dray_config::paths;

use crate::fifos::ensure_fifo;

/// Width of the host column in transfer-log lines.
const HOST_COLUMN: usize = 12;

/// Reasons recorded with a deleted spool directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteReason {
    /// Job exceeded its age limit before a worker picked it up.
    AgeOutput,
    /// Operator removed the job.
    UserDel,
    /// Anything else: unresolvable job id, vanished message file.
    OtherDel,
}

impl DeleteReason {
    fn as_str(self) -> &'static str {
        match self {
            DeleteReason::AgeOutput => "AGE_OUTPUT",
            DeleteReason::UserDel => "USER_DEL",
            DeleteReason::OtherDel => "OTHER_DEL",
        }
    }
}

fn open_log_fifo(path: &Path) -> std::io::Result<File> {
    ensure_fifo(path)?;
    // Read-write keeps the fifo writable while the log daemon is down.
    std::fs::OpenOptions::new().read(true).write(true).open(path)
}

/// Transfer-log writer with duplicate folding.
#[derive(Debug)]
pub struct TransferLog {
    fifo: File,
    last_line: String,
    last_time: i64,
    repeats: u32,
}

impl TransferLog {
    pub fn open(workdir: &Path) -> std::io::Result<Self> {
        Ok(TransferLog {
            fifo: open_log_fifo(&paths::transfer_log_fifo(workdir))?,
            last_line: String::new(),
            last_time: 0,
            repeats: 0,
        })
    }

    /// Log one event for `host` at job slot `job_no`.
    pub fn warn(&mut self, now: i64, host: &str, job_no: i32, message: &str) {
        let line = format!("{host:<HOST_COLUMN$}[{job_no}]: {message}");
        if line == self.last_line && now - self.last_time <= 1 {
            self.repeats += 1;
            self.last_time = now;
            return;
        }
        self.flush_repeats();
        if self.fifo.write_all(line.as_bytes()).is_ok() {
            let _ = self.fifo.write_all(b"\n");
        }
        self.last_line = line;
        self.last_time = now;
    }

    /// Emit the pending "repeated" summary, if any.
    pub fn flush_repeats(&mut self) {
        if self.repeats > 0 {
            let summary =
                format!("last message repeated {} times\n", self.repeats);
            let _ = self.fifo.write_all(summary.as_bytes());
            self.repeats = 0;
        }
    }
}

/// Delete-log writer; one line per removed spool directory.
#[derive(Debug)]
pub struct DeleteLog {
    fifo: File,
}

impl DeleteLog {
    pub fn open(workdir: &Path) -> std::io::Result<Self> {
        Ok(DeleteLog {
            fifo: open_log_fifo(&paths::delete_log_fifo(workdir))?,
        })
    }

    pub fn record(&mut self, reason: DeleteReason, msg_name: &str, job_id: u32) {
        let line =
            format!("{} {:x} {}\n", reason.as_str(), job_id, msg_name);
        let _ = self.fifo.write_all(line.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn setup(dir: &tempfile::TempDir) -> (TransferLog, File) {
        std::fs::create_dir_all(paths::fifo_dir(dir.path())).unwrap();
        let log = TransferLog::open(dir.path()).unwrap();
        let reader = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(paths::transfer_log_fifo(dir.path()))
            .unwrap();
        (log, reader)
    }

    fn read_available(reader: &mut File) -> String {
        use std::os::unix::io::AsRawFd;
        let mut out = String::new();
        let mut buf = [0u8; 4096];
        // Nonblocking drain.
        unsafe {
            nix::libc::fcntl(
                reader.as_raw_fd(),
                nix::libc::F_SETFL,
                nix::libc::O_NONBLOCK,
            );
        }
        while let Ok(n) = reader.read(&mut buf) {
            if n == 0 {
                break;
            }
            out.push_str(std::str::from_utf8(&buf[..n]).unwrap());
        }
        out
    }

    #[test]
    fn duplicate_lines_fold_into_a_summary() {
        let dir = tempfile::tempdir().unwrap();
        let (mut log, mut reader) = setup(&dir);
        log.warn(100, "wx-alpha", 0, "Failed to send mail.");
        log.warn(100, "wx-alpha", 0, "Failed to send mail.");
        log.warn(101, "wx-alpha", 0, "Failed to send mail.");
        log.warn(103, "wx-alpha", 0, "Disconnected.");
        let output = read_available(&mut reader);
        assert_eq!(
            output.matches("Failed to send mail.").count(),
            1,
            "{output:?}"
        );
        assert!(output.contains("last message repeated 2 times"));
        assert!(output.contains("Disconnected."));
    }

    #[test]
    fn distinct_lines_pass_straight_through() {
        let dir = tempfile::tempdir().unwrap();
        let (mut log, mut reader) = setup(&dir);
        log.warn(100, "wx-alpha", 0, "one");
        log.warn(100, "wx-beta", 1, "two");
        let output = read_available(&mut reader);
        assert!(output.contains("wx-alpha    [0]: one"));
        assert!(output.contains("wx-beta     [1]: two"));
    }
}
