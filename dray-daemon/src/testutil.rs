//! Shared scaffolding for the daemon's unit tests: a working
//! directory with one host, one job definition and an attached [`Fd`].

use dray_config::{FdConfig, WorkDir};
use dray_core::{queue, HostStatusArea, QueueEntry};
use dray_model::{msg_number, MsgName};

use crate::context::{now, Fd};

pub struct TestFd {
    pub fd: Fd,
    pub now: i64,
    _dir: tempfile::TempDir,
}

impl TestFd {
    /// One host `wx-alpha` with job id 0x2a bound to it.
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let workdir = WorkDir::init(dir.path()).unwrap();
        {
            let mut fsa = HostStatusArea::open(
                &dray_config::paths::fsa_status(workdir.root()),
                0,
            )
            .unwrap();
            fsa.add_host("wx-alpha").unwrap();
            let mut jid = dray_core::JobIdTable::open(
                &dray_config::paths::job_id_table(workdir.root()),
            )
            .unwrap();
            jid.push(0x2a, "wx-alpha", 0, 21, 0, b'5').unwrap();
        }
        let mut fd = Fd::new(workdir.root(), FdConfig::default()).unwrap();
        fd.mdb.lookup_job_id(0x2a, &fd.jid, &fd.fsa).unwrap();
        TestFd {
            fd,
            now: now(),
            _dir: dir,
        }
    }

    /// Enqueue a push for `job_id` the way the intake path does.
    pub fn queue_push(
        &mut self,
        job_id: u32,
        priority: u8,
        creation_time: i64,
        _enqueued_at: i64,
        resend: bool,
    ) -> usize {
        let key = msg_number(priority, creation_time, 7, 0);
        self.queue_push_entry(job_id, key, creation_time, resend)
    }

    pub fn queue_push_with_key(
        &mut self,
        job_id: u32,
        key: f64,
        creation_time: i64,
    ) -> usize {
        self.queue_push_entry(job_id, key, creation_time, false)
    }

    fn queue_push_entry(
        &mut self,
        job_id: u32,
        key: f64,
        creation_time: i64,
        resend: bool,
    ) -> usize {
        let name = MsgName {
            job_id,
            dir_no: 0,
            creation_time,
            unique_number: (key as u64 % 97) as u16,
            split_counter: 0,
        };
        let entry = QueueEntry::new_push(
            &name,
            key,
            creation_time,
            0,
            1,
            1024,
            resend,
        );
        let pos = self.fd.qb.insert_ordered(entry).unwrap();
        self.fd.fsa.get_mut(0).jobs_queued += 1;
        pos
    }

    /// Wire up a connection slot for the entry at `qb_pos` as if
    /// `start_process` had succeeded with worker `pid`.
    pub fn claim_connection(&mut self, qb_pos: usize, pid: i64) {
        let entry = *self.fd.qb.get(qb_pos);
        let conn_pos = self.fd.connections.free_slot().unwrap();
        {
            let conn = self.fd.connections.get_mut(conn_pos);
            conn.hostname = "wx-alpha".into();
            conn.msg_name = entry.msg_name();
            conn.protocol = Some(dray_model::Protocol::Ftp);
            conn.fsa_pos = 0;
            conn.fra_pos = -1;
            conn.job_no = 0;
            conn.pid = pid;
        }
        {
            let host = self.fd.fsa.get_mut(0);
            host.active_transfers += 1;
            host.job_status[0].proc_id = pid;
            host.job_status[0].unique_name = entry.msg_name;
        }
        let entry = self.fd.qb.get_mut(qb_pos);
        entry.pid = pid;
        entry.connect_pos = conn_pos as i32;
        self.fd.status.get_mut().no_of_transfers += 1;
        self.fd.abs_reduce(0);
    }
}

#[test]
fn harness_invariants_hold() {
    let mut harness = TestFd::new();
    assert_eq!(harness.fd.fsa.len(), 1);
    assert_eq!(harness.fd.mdb.len(), 1);
    let pos = harness.queue_push_with_key(0x2a, 100.0, 1000);
    assert_eq!(harness.fd.qb.get(pos).slot(), queue::QueueSlot::Pending);
    assert_eq!(harness.fd.fsa.get(0).jobs_queued, 1);
    harness.claim_connection(pos, 999);
    assert_eq!(harness.fd.status.get().no_of_transfers, 1);
    assert_eq!(harness.fd.fsa.get(0).jobs_queued, 0);
}
