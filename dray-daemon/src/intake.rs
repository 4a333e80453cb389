//! The intake path: job descriptors arriving on the message fifo.
//!
//! The generator writes fixed-size binary blocks; fifo reads can split
//! them, so a carry buffer reassembles block boundaries before
//! anything is parsed.

use dray_core::QueueEntry;
use dray_model::{
    msg_number, ModelError, Originator, TransferMessage,
    AUTO_PAUSE_QUEUE_LOCK_STAT, MSG_BLOCK_LENGTH,
};

use crate::context::Fd;
use crate::logs::DeleteReason;

/// Reassembles fifo reads into whole message blocks.
#[derive(Debug, Default)]
pub struct IntakeBuffer {
    carry: Vec<u8>,
}

impl IntakeBuffer {
    /// Append raw fifo bytes and pop every complete block.
    pub fn push_bytes(&mut self, data: &[u8]) -> Vec<TransferMessage> {
        self.carry.extend_from_slice(data);
        let mut messages = Vec::new();
        let mut offset = 0;
        while self.carry.len() - offset >= MSG_BLOCK_LENGTH {
            match TransferMessage::parse(&self.carry[offset..]) {
                Ok(msg) => messages.push(msg),
                Err(ModelError::InvalidPriority(byte)) => {
                    tracing::debug!(
                        priority = byte,
                        "priority byte is garbage, dropping message block"
                    );
                }
                Err(err) => {
                    tracing::warn!(%err, "unreadable message block");
                }
            }
            offset += MSG_BLOCK_LENGTH;
        }
        self.carry.drain(..offset);
        messages
    }
}

impl Fd {
    /// Queue one intake message.
    pub fn handle_msg_block(&mut self, msg: &TransferMessage, now: i64) {
        let name = msg.msg_name();
        let job_id = msg.job_id.get();
        let cache_pos =
            match self.mdb.lookup_job_id(job_id, &self.jid, &self.fsa) {
                Ok(pos) => pos,
                Err(err) => {
                    tracing::error!(
                        job_id = format_args!("{job_id:#x}"),
                        %err,
                        "could not locate job, dropping its files"
                    );
                    self.remove_job_files(
                        &name.to_string(),
                        job_id,
                        DeleteReason::OtherDel,
                    );
                    return;
                }
            };

        let key = msg_number(
            msg.priority,
            msg.creation_time.get(),
            msg.unique_number.get(),
            msg.split_counter.get(),
        );
        let entry = QueueEntry::new_push(
            &name,
            key,
            msg.creation_time.get(),
            cache_pos as u32,
            msg.files_to_send.get(),
            msg.file_size_to_send.get(),
            msg.originator() == Originator::Resend,
        );
        if let Err(err) = self.qb.insert_ordered(entry) {
            tracing::error!(%err, "failed to grow the queue");
            return;
        }
        let fsa_pos = self.mdb.get(cache_pos).fsa_pos;
        if fsa_pos >= 0 && (fsa_pos as usize) < self.fsa.len() {
            self.fsa.get_mut(fsa_pos as usize).jobs_queued += 1;
            self.check_spool_pressure(fsa_pos as usize);
        }
        let _ = now;
    }

    /// A host whose error spool is about to hit the filesystem's link
    /// ceiling gets its input queue locked until a transfer succeeds.
    fn check_spool_pressure(&mut self, fsa_pos: usize) {
        if self.fsa.get(fsa_pos).host_status & AUTO_PAUSE_QUEUE_LOCK_STAT != 0
        {
            return;
        }
        let alias = self.fsa.get(fsa_pos).host_alias_str().to_string();
        match dray_core::spool::error_dir_pressure(
            &self.workdir,
            &alias,
            self.link_max,
        ) {
            Ok(true) => {
                self.fsa.get_mut(fsa_pos).host_status |=
                    AUTO_PAUSE_QUEUE_LOCK_STAT;
                tracing::warn!(
                    "Stopped input queue for host <{alias}>, too many jobs \
                     in the error directory."
                );
            }
            Ok(false) => {}
            Err(err) => {
                tracing::debug!(%err, host = %alias, "error spool unreadable")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestFd;
    use zerocopy::little_endian::{I64, U16, U32, U64};
    use zerocopy::IntoBytes;

    fn block(job_id: u32, priority: u8, unique: u16) -> TransferMessage {
        TransferMessage {
            creation_time: I64::new(1000),
            job_id: U32::new(job_id),
            split_counter: U32::new(0),
            files_to_send: U32::new(3),
            file_size_to_send: U64::new(12288),
            dir_no: U16::new(0),
            unique_number: U16::new(unique),
            priority,
            originator: 0,
        }
    }

    #[test]
    fn split_reads_reassemble() {
        let mut buffer = IntakeBuffer::default();
        let msg = block(0x2a, b'5', 7);
        let bytes = msg.as_bytes();
        assert!(buffer.push_bytes(&bytes[..10]).is_empty());
        let messages = buffer.push_bytes(&bytes[10..]);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].job_id.get(), 0x2a);
    }

    #[test]
    fn two_blocks_in_one_read() {
        let mut buffer = IntakeBuffer::default();
        let mut bytes = block(0x2a, b'5', 1).as_bytes().to_vec();
        bytes.extend_from_slice(block(0x2a, b'4', 2).as_bytes());
        let messages = buffer.push_bytes(&bytes);
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn queued_message_lands_sorted_and_counted() {
        let mut harness = TestFd::new();
        harness.fd.handle_msg_block(&block(0x2a, b'5', 7), harness.now);
        assert_eq!(harness.fd.qb.len(), 1);
        let entry = harness.fd.qb.get(0);
        assert_eq!(entry.msg_number, 50_000_035.0);
        assert_eq!(entry.msg_name_str(), "2a/0/3e8_7_0");
        assert_eq!(entry.files_to_send, 3);
        assert_eq!(entry.file_size_to_send, 12288);
        assert_eq!(harness.fd.fsa.get(0).jobs_queued, 1);

        // A more urgent message goes ahead of it.
        harness.fd.handle_msg_block(&block(0x2a, b'1', 8), harness.now);
        assert!(harness.fd.qb.is_sorted());
        assert_eq!(harness.fd.qb.get(0).msg_number, 10_000_008.0);
        assert_eq!(harness.fd.fsa.get(0).jobs_queued, 2);
    }

    #[test]
    fn unknown_job_id_is_dropped_with_its_spool() {
        let mut harness = TestFd::new();
        let msg = block(0xdead, b'5', 7);
        let spool = dray_core::spool::msg_spool_dir(
            &harness.fd.workdir,
            &msg.msg_name().to_string(),
        );
        std::fs::create_dir_all(&spool).unwrap();
        harness.fd.handle_msg_block(&msg, harness.now);
        assert_eq!(harness.fd.qb.len(), 0);
        assert!(!spool.exists());
    }

    #[test]
    fn resend_originator_sets_the_resend_flag() {
        let mut harness = TestFd::new();
        let mut msg = block(0x2a, b'5', 7);
        msg.originator = 1;
        harness.fd.handle_msg_block(&msg, harness.now);
        assert!(harness.fd.qb.get(0).is_resend());
    }

    #[test]
    fn crowded_error_spool_locks_the_input_queue() {
        let mut harness = TestFd::new();
        harness.fd.link_max = 10;
        let error_dir = dray_core::spool::host_error_dir(
            &harness.fd.workdir,
            "wx-alpha",
        );
        for i in 0..8 {
            std::fs::create_dir_all(error_dir.join(format!("job{i}")))
                .unwrap();
        }
        harness.fd.handle_msg_block(&block(0x2a, b'5', 7), harness.now);
        assert_ne!(
            harness.fd.fsa.get(0).host_status & AUTO_PAUSE_QUEUE_LOCK_STAT,
            0
        );
        // Messages keep queueing; only the upstream gate is closed.
        assert_eq!(harness.fd.qb.len(), 1);
    }
}
