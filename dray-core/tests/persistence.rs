//! Cross-module persistence behavior: what survives a daemon restart
//! and what an insert/remove cycle leaves behind.

use dray_core::{
    HostStatusArea, JobIdTable, MsgCache, QueueBuffer, QueueEntry, QueueSlot,
};
use dray_model::{msg_number, MsgName};

fn sample_name(unique: u16) -> MsgName {
    MsgName {
        job_id: 0x2a,
        dir_no: 0,
        creation_time: 1000,
        unique_number: unique,
        split_counter: 0,
    }
}

#[test]
fn insert_then_remove_restores_the_previous_queue() {
    let dir = tempfile::tempdir().unwrap();
    let mut qb = QueueBuffer::open(&dir.path().join("queue_buffer")).unwrap();
    for unique in [3u16, 1, 2] {
        let key = msg_number(b'5', 1000, unique, 0);
        let entry = QueueEntry::new_push(
            &sample_name(unique),
            key,
            1000,
            0,
            1,
            512,
            false,
        );
        qb.insert_ordered(entry).unwrap();
    }
    let before: Vec<(f64, String)> = qb
        .entries()
        .iter()
        .map(|entry| (entry.msg_number, entry.msg_name_str().to_string()))
        .collect();

    // One more message in the middle, then gone again.
    let key = msg_number(b'5', 1000, 2, 1);
    let extra = QueueEntry::new_push(
        &MsgName {
            split_counter: 1,
            ..sample_name(2)
        },
        key,
        1000,
        0,
        1,
        512,
        false,
    );
    let pos = qb.insert_ordered(extra).unwrap();
    assert!(qb.is_sorted());
    qb.remove(pos);

    let after: Vec<(f64, String)> = qb
        .entries()
        .iter()
        .map(|entry| (entry.msg_number, entry.msg_name_str().to_string()))
        .collect();
    assert_eq!(before, after);
}

#[test]
fn queue_and_cache_survive_a_restart_together() {
    let dir = tempfile::tempdir().unwrap();
    let qb_path = dir.path().join("queue_buffer");
    let mdb_path = dir.path().join("msg_cache_buf");
    let fsa_path = dir.path().join("fsa_status");
    let jid_path = dir.path().join("jid_data");

    {
        let mut fsa = HostStatusArea::open(&fsa_path, 0).unwrap();
        fsa.add_host("wx-alpha").unwrap();
        let mut jid = JobIdTable::open(&jid_path).unwrap();
        jid.push(0x2a, "wx-alpha", 0, 21, 600, b'5').unwrap();

        let mut mdb = MsgCache::open(&mdb_path).unwrap();
        let cache_pos = mdb.lookup_job_id(0x2a, &jid, &fsa).unwrap();

        let mut qb = QueueBuffer::open(&qb_path).unwrap();
        let key = msg_number(b'5', 1000, 7, 0);
        let entry = QueueEntry::new_push(
            &sample_name(7),
            key,
            1000,
            cache_pos as u32,
            3,
            12288,
            false,
        );
        qb.insert_ordered(entry).unwrap();
        qb.sync().unwrap();
        mdb.sync().unwrap();
        fsa.sync().unwrap();
    }

    // The restarted daemon sees the same world.
    let fsa = HostStatusArea::open(&fsa_path, 0).unwrap();
    let mdb = MsgCache::open(&mdb_path).unwrap();
    let qb = QueueBuffer::open(&qb_path).unwrap();

    assert_eq!(qb.len(), 1);
    let entry = qb.get(0);
    assert_eq!(entry.slot(), QueueSlot::Pending);
    assert_eq!(entry.msg_name_str(), "2a/0/3e8_7_0");
    let cache = mdb.get(entry.pos as usize);
    assert_eq!(cache.job_id, 0x2a);
    assert_eq!(cache.age_limit, 600);
    assert_eq!(
        fsa.get(cache.fsa_pos as usize).host_alias_str(),
        "wx-alpha"
    );
}

#[test]
fn pending_entries_never_hold_a_connection() {
    let dir = tempfile::tempdir().unwrap();
    let mut qb = QueueBuffer::open(&dir.path().join("queue_buffer")).unwrap();
    for unique in 0..5u16 {
        let key = msg_number(b'5', 1000, unique, 0);
        let entry = QueueEntry::new_push(
            &sample_name(unique),
            key,
            1000,
            0,
            1,
            512,
            false,
        );
        qb.insert_ordered(entry).unwrap();
    }
    for entry in qb.entries() {
        match entry.slot() {
            QueueSlot::Pending | QueueSlot::Removed => {
                assert_eq!(entry.connect_pos, -1)
            }
            QueueSlot::Running(_) => {}
        }
    }
}
