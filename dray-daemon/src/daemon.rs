//! The event loop.
//!
//! Single-threaded: every mutation of the queue, the cache and the
//! connection table happens here, between fifo reads. Workers run as
//! separate processes and only ever talk back through the fin fifo
//! and the shared status areas.

use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::signal::unix::{signal, SignalKind};

use crate::context::{now, Fd, StopMode, FD_RESCAN_TIME};
use crate::fifos::{ack_ready, opcode, FifoSet};
use crate::intake::IntakeBuffer;

/// Run the scheduler until shutdown. Returns the process exit code.
pub async fn run(mut fd: Fd, mut fifos: FifoSet) -> anyhow::Result<i32> {
    let mut intake = IntakeBuffer::default();
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;
    // Registered so a controlling terminal going away does not kill
    // us; events are discarded.
    let mut sighup = signal(SignalKind::hangup())?;

    let mut cmd_buf = [0u8; 256];
    let mut fin_buf = [0u8; 4096];
    let mut msg_buf = [0u8; 4096];
    let mut retry_buf = [0u8; 1024];
    let mut delete_buf = [0u8; 4096];
    let mut wake_buf = [0u8; 1024];

    loop {
        let current = now();
        if fd.qb.len() as u32 > fd.status.get().max_queue_length {
            fd.status.get_mut().max_queue_length = fd.qb.len() as u32;
        }
        fd.periodic_maintenance(current).await;
        fd.host_config_check();
        if !fd.stop.is_stopping() {
            fd.check_retrieve_dirs(current);
        }
        if fd.stop.is_stopping() {
            if fd.status.get().no_of_transfers == 0 {
                break;
            }
            if current > fd.stop_deadline {
                // One of the senders is wedged; stop waiting and let
                // the sequencer kill it.
                break;
            }
        }
        fd.check_file_dir(current);

        let timeout = if fd.force_check {
            Duration::from_millis(100)
        } else {
            let seconds = FD_RESCAN_TIME - current.rem_euclid(FD_RESCAN_TIME);
            Duration::from_secs(seconds.max(1) as u64)
        };

        tokio::select! {
            result = fifos.cmd.read(&mut cmd_buf) => {
                let n = result?;
                for &byte in &cmd_buf[..n] {
                    if handle_command(&mut fd, byte).await? {
                        return Ok(0);
                    }
                }
            }
            result = fifos.fin.read(&mut fin_buf) => {
                let n = result?;
                fd.handle_fin_data(&fin_buf[..n], now()).await;
            }
            result = fifos.msg.read(&mut msg_buf) => {
                let n = result?;
                let blocks = intake.push_bytes(&msg_buf[..n]);
                let current = now();
                for block in &blocks {
                    fd.handle_msg_block(block, current);
                }
                if !blocks.is_empty() {
                    fd.try_handle_queue(current);
                }
            }
            result = fifos.retry.read(&mut retry_buf) => {
                let n = result?;
                let current = now();
                for chunk in retry_buf[..n].chunks_exact(4) {
                    let fsa_pos =
                        i32::from_ne_bytes(chunk.try_into().unwrap());
                    fd.handle_retry(fsa_pos, current);
                }
                if n % 4 != 0 {
                    tracing::debug!("reading garbage from retry fifo");
                }
            }
            result = fifos.delete.read(&mut delete_buf) => {
                let n = result?;
                fd.handle_delete_data(&delete_buf[..n], now()).await;
            }
            result = fifos.wake_up.read(&mut wake_buf) => {
                let _ = result?;
                if !fd.stop.is_stopping() {
                    fd.scan_queue(now());
                }
            }
            () = tokio::time::sleep(timeout) => {
                if !fd.stop.is_stopping() {
                    fd.scan_queue(now());
                }
            }
            _ = sigint.recv() => return on_signal(&mut fd, "SIGINT").await,
            _ = sigterm.recv() => return on_signal(&mut fd, "SIGTERM").await,
            _ = sigquit.recv() => return on_signal(&mut fd, "SIGQUIT").await,
            _ = sighup.recv() => {}
        }
    }

    fd.fd_exit().await;
    Ok(0)
}

async fn on_signal(fd: &mut Fd, name: &str) -> anyhow::Result<i32> {
    tracing::info!("Received {name}, shutting down.");
    fd.fd_exit().await;
    Ok(1)
}

/// Apply one command-fifo opcode. Returns `true` when the daemon must
/// exit immediately.
async fn handle_command(fd: &mut Fd, byte: u8) -> anyhow::Result<bool> {
    match byte {
        opcode::CHECK_FILE_DIR => {
            fd.next_dir_check_time = 0;
            fd.force_check = true;
        }
        opcode::FSA_ABOUT_TO_CHANGE => {
            if let Err(err) = ack_ready(&fd.workdir) {
                tracing::warn!(%err, "could not ack on the ready fifo");
            }
            fd.reattach_status_areas()?;
        }
        opcode::FORCE_REMOTE_DIR_CHECK => {
            fd.remote_file_check_time = 0;
        }
        opcode::SAVE_STOP => {
            if fd.stop.is_stopping() {
                tracing::info!(
                    "FD is already shutting down. Please be patient."
                );
                tracing::info!(
                    "Maximum shutdown time for FD is {} seconds.",
                    fd.stop.timeout()
                );
            } else {
                tracing::info!("FD shutting down ...");
                fd.stop = StopMode::Save;
                fd.stop_deadline = now() + fd.stop.timeout();
            }
        }
        opcode::STOP | opcode::QUICK_STOP => {
            fd.stop = if byte == opcode::STOP {
                StopMode::Stop
            } else {
                StopMode::Quick
            };
            tracing::info!("FD shutting down ...");
            fd.fd_exit().await;
            return Ok(true);
        }
        other => {
            tracing::warn!(opcode = other, "Reading garbage on command fifo.");
        }
    }
    Ok(false)
}
