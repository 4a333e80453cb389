//! Spawning and tracking transfer worker processes.
//!
//! Workers are separate programs picked by protocol (`sf_ftp`,
//! `gf_sftp`, ...) and handed everything they need on argv. The
//! scheduler keeps one handle per live child so exits can be reaped by
//! pid, the way the fin fifo reports them.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use dray_core::Connection;
use dray_model::{Protocol, WorkerExit};

/// Everything beyond the connection slot that goes on a worker's argv.
#[derive(Debug, Clone)]
pub struct WorkerArgs {
    pub workdir: PathBuf,
    pub fsa_id: u32,
    pub archive_disabled: bool,
    pub default_age_limit: u32,
    pub default_smtp_server: Option<String>,
    pub default_smtp_from: Option<String>,
    pub debug: bool,
}

/// Build the argv for `conn`, mirroring what the workers parse.
pub fn build_argv(
    conn: &Connection,
    args: &WorkerArgs,
    retries: u32,
) -> (String, Vec<String>) {
    let protocol = conn.protocol.unwrap_or(Protocol::Local);
    let fetch = conn.msg_name.is_none();
    let program = protocol.worker_program(fetch, args.debug).to_string();

    let mut argv = vec![
        args.workdir.display().to_string(),
        conn.job_no.to_string(),
        args.fsa_id.to_string(),
        conn.fsa_pos.to_string(),
        match conn.msg_name {
            Some(name) => name.to_string(),
            None => conn.dir_alias.clone(),
        },
    ];
    if args.archive_disabled && conn.msg_name.is_some() {
        argv.push("-A".into());
    }
    if conn.resend && conn.msg_name.is_some() {
        argv.push("-r".into());
    }
    if conn.temp_toggle {
        argv.push("-t".into());
    }
    if args.default_age_limit > 0 && conn.msg_name.is_some() {
        argv.push("-a".into());
        argv.push(args.default_age_limit.to_string());
    }
    if protocol == Protocol::Smtp {
        if let Some(from) = &args.default_smtp_from {
            argv.push("-f".into());
            argv.push(from.clone());
        }
        if let Some(server) = &args.default_smtp_server {
            argv.push("-s".into());
            argv.push(server.clone());
        }
    }
    if retries > 0 {
        argv.push("-o".into());
        argv.push(retries.to_string());
    }
    (program, argv)
}

/// Live children by pid.
#[derive(Debug, Default)]
pub struct WorkerTable {
    children: HashMap<i64, Child>,
}

impl WorkerTable {
    /// Spawn the worker for `conn`. Returns its pid.
    pub fn spawn(
        &mut self,
        conn: &Connection,
        args: &WorkerArgs,
        retries: u32,
    ) -> std::io::Result<i64> {
        let (program, argv) = build_argv(conn, args, retries);
        let child = Command::new(&program)
            .args(&argv)
            .stdin(Stdio::null())
            .spawn()?;
        let pid = i64::from(child.id().ok_or_else(|| {
            std::io::Error::other("spawned worker has no pid")
        })?);
        self.children.insert(pid, child);
        Ok(pid)
    }

    pub fn contains(&self, pid: i64) -> bool {
        self.children.contains_key(&pid)
    }

    pub fn live_pids(&self) -> Vec<i64> {
        self.children.keys().copied().collect()
    }

    /// Reap `pid` without blocking. `Ok(None)` means still running.
    pub fn try_reap(&mut self, pid: i64) -> std::io::Result<Option<WorkerExit>> {
        let Some(child) = self.children.get_mut(&pid) else {
            return Err(std::io::Error::from_raw_os_error(
                nix::libc::ECHILD,
            ));
        };
        match child.try_wait()? {
            Some(status) => {
                self.children.remove(&pid);
                Ok(Some(exit_from_status(status)))
            }
            None => Ok(None),
        }
    }

    /// Reap `pid`, waiting for it to finish.
    pub async fn reap(&mut self, pid: i64) -> std::io::Result<WorkerExit> {
        let Some(child) = self.children.get_mut(&pid) else {
            return Err(std::io::Error::from_raw_os_error(
                nix::libc::ECHILD,
            ));
        };
        let status = child.wait().await?;
        self.children.remove(&pid);
        Ok(exit_from_status(status))
    }

    /// Deliver `signal` to `pid`; ESRCH (already gone) is not an
    /// error.
    pub fn signal(&self, pid: i64, signal: Signal) -> nix::Result<()> {
        match kill(Pid::from_raw(pid as i32), signal) {
            Err(nix::errno::Errno::ESRCH) | Ok(()) => Ok(()),
            Err(errno) => Err(errno),
        }
    }
}

fn exit_from_status(status: std::process::ExitStatus) -> WorkerExit {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => WorkerExit::Exited(code),
        None => WorkerExit::Signaled(status.signal().unwrap_or(0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dray_model::MsgName;

    fn connection() -> Connection {
        Connection {
            hostname: "wx-alpha".into(),
            dir_alias: String::new(),
            msg_name: Some(MsgName {
                job_id: 0x2a,
                dir_no: 0,
                creation_time: 1000,
                unique_number: 7,
                split_counter: 0,
            }),
            protocol: Some(Protocol::Ftp),
            fsa_pos: 3,
            fra_pos: -1,
            job_no: 1,
            pid: 0,
            temp_toggle: false,
            resend: false,
        }
    }

    fn args() -> WorkerArgs {
        WorkerArgs {
            workdir: PathBuf::from("/var/dray"),
            fsa_id: 9,
            archive_disabled: false,
            default_age_limit: 0,
            default_smtp_server: None,
            default_smtp_from: None,
            debug: false,
        }
    }

    #[test]
    fn push_argv_has_the_fixed_prefix() {
        let (program, argv) = build_argv(&connection(), &args(), 0);
        assert_eq!(program, "sf_ftp");
        assert_eq!(
            argv,
            vec!["/var/dray", "1", "9", "3", "2a/0/3e8_7_0"]
        );
    }

    #[test]
    fn flags_are_appended_in_order() {
        let mut conn = connection();
        conn.resend = true;
        conn.temp_toggle = true;
        let mut worker_args = args();
        worker_args.archive_disabled = true;
        worker_args.default_age_limit = 3600;
        let (_, argv) = build_argv(&conn, &worker_args, 2);
        assert_eq!(
            argv[5..],
            ["-A", "-r", "-t", "-a", "3600", "-o", "2"]
                .map(String::from)
        );
    }

    #[test]
    fn pull_jobs_use_the_fetch_program_and_dir_alias() {
        let mut conn = connection();
        conn.msg_name = None;
        conn.dir_alias = "inbox".into();
        conn.protocol = Some(Protocol::Sftp);
        let (program, argv) = build_argv(&conn, &args(), 0);
        assert_eq!(program, "gf_sftp");
        assert_eq!(argv[4], "inbox");
        // Push-only flags never apply to pulls.
        let mut worker_args = args();
        worker_args.archive_disabled = true;
        worker_args.default_age_limit = 60;
        let (_, argv) = build_argv(&conn, &worker_args, 0);
        assert_eq!(argv.len(), 5);
    }

    #[test]
    fn smtp_jobs_carry_the_mail_defaults() {
        let mut conn = connection();
        conn.protocol = Some(Protocol::Smtp);
        let mut worker_args = args();
        worker_args.default_smtp_server = Some("mail.example.org".into());
        worker_args.default_smtp_from = Some("dray@example.org".into());
        let (program, argv) = build_argv(&conn, &worker_args, 0);
        assert_eq!(program, "sf_smtp");
        assert_eq!(
            argv[5..],
            ["-f", "dray@example.org", "-s", "mail.example.org"]
                .map(String::from)
        );
    }
}
