//! The connection table: one slot per potential worker process.
//!
//! A slot is claimed when the scheduler decides to start a worker and
//! released by the lifecycle manager once the worker is reaped. Only
//! the scheduler thread touches it, so this is plain memory - the
//! persistent twin of each running slot is the host's job-status
//! entry.

use dray_model::{MsgName, Protocol};

/// One worker slot.
#[derive(Debug, Clone, Default)]
pub struct Connection {
    /// Empty when the slot is free.
    pub hostname: String,
    pub dir_alias: String,
    pub msg_name: Option<MsgName>,
    pub protocol: Option<Protocol>,
    pub fsa_pos: i32,
    /// Retrieve-directory index for pull jobs, -1 otherwise.
    pub fra_pos: i32,
    /// Job-status subindex on the host, 0..allowed_transfers.
    pub job_no: i32,
    pub pid: i64,
    pub temp_toggle: bool,
    pub resend: bool,
}

impl Connection {
    pub fn is_free(&self) -> bool {
        self.hostname.is_empty()
    }

    pub fn clear(&mut self) {
        *self = Connection {
            fsa_pos: -1,
            fra_pos: -1,
            job_no: -1,
            ..Connection::default()
        };
    }
}

/// Fixed-size table sized by `max_connections`.
#[derive(Debug)]
pub struct ConnectionTable {
    slots: Vec<Connection>,
}

impl ConnectionTable {
    pub fn new(max_connections: usize) -> Self {
        let mut slots = vec![Connection::default(); max_connections];
        for slot in &mut slots {
            slot.clear();
        }
        ConnectionTable { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, pos: usize) -> &Connection {
        &self.slots[pos]
    }

    pub fn get_mut(&mut self, pos: usize) -> &mut Connection {
        &mut self.slots[pos]
    }

    /// First free slot, if any.
    pub fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(Connection::is_free)
    }

    /// Slots with a live worker.
    pub fn live(&self) -> impl Iterator<Item = (usize, &Connection)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.pid > 0)
    }

    pub fn live_count(&self) -> usize {
        self.live().count()
    }

    /// Slot index owned by `pid`.
    pub fn position_of_pid(&self, pid: i64) -> Option<usize> {
        self.slots.iter().position(|slot| slot.pid == pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_start_free_and_claim_in_order() {
        let mut table = ConnectionTable::new(3);
        assert_eq!(table.free_slot(), Some(0));
        table.get_mut(0).hostname = "wx-alpha".into();
        table.get_mut(0).pid = 101;
        assert_eq!(table.free_slot(), Some(1));
        assert_eq!(table.position_of_pid(101), Some(0));
        assert_eq!(table.live_count(), 1);
        table.get_mut(0).clear();
        assert_eq!(table.free_slot(), Some(0));
        assert_eq!(table.live_count(), 0);
    }
}
