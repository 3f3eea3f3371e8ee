//! Master Session
//!
//! Per-slave push driver: locate the segment containing the requested
//! transaction id, replay the schema records the tail will not carry,
//! then stream the tail, polling for new data on a short delay and
//! rotating to the next segment when the current one is exhausted.
//! Nothing survives the connection; resumption is entirely slave
//! driven.

use std::sync::Arc;
use std::time::Instant;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::watch;

use super::master::ReplicationMaster;
use super::protocol::{Message, Request, TimeMessage};
use crate::error::{Error, Result};
use crate::network::write_frame;
use crate::txlog::transaction::decode_record_header;
use crate::txlog::LogFileHandle;

/// Releases the acquired handle when the session leaves a segment,
/// including on error and disconnect paths.
struct AcquiredFile(Arc<LogFileHandle>);

impl Drop for AcquiredFile {
    fn drop(&mut self) {
        self.0.release();
    }
}

pub struct MasterSession {
    master: Arc<ReplicationMaster>,
}

impl MasterSession {
    pub fn new(master: Arc<ReplicationMaster>) -> Self {
        Self { master }
    }

    /// Drive one connection until the peer disconnects or the master
    /// shuts down.
    pub async fn run(
        self,
        mut reader: OwnedReadHalf,
        mut writer: OwnedWriteHalf,
        req: Request,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let cfg = self.master.config();
        let tail_poll = cfg.tail_poll_interval();
        let future_poll = cfg.future_tx_poll();
        let time_freq = cfg.time_msg_freq();

        let mut start_tx_id = req.start_tx_id.unwrap_or(0);
        let mut last_time_sent = Instant::now();
        tracing::info!(
            "Starting replication session for {} from tx id {}",
            req.instance,
            start_tx_id
        );

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let (handle, file) = match self.master.get_file(start_tx_id)? {
                Some(found) => found,
                None => {
                    // requested id is in the future; check back shortly
                    tokio::select! {
                        _ = tokio::time::sleep(future_poll) => continue,
                        _ = shutdown.changed() => continue,
                    }
                }
            };
            let _acquired = AcquiredFile(handle);

            if start_tx_id < file.first_tx_id() {
                tracing::warn!(
                    "Transaction {} is no longer available, continuing from {}",
                    start_tx_id,
                    file.first_tx_id()
                );
                start_tx_id = file.first_tx_id();
            }

            // schema records below the start point will not appear in
            // the tail; replay them so the slave can self-configure
            for record in file.metadata_records()? {
                let hdr = decode_record_header(&record)?;
                if hdr.tx_id < start_tx_id {
                    write_frame(&mut writer, &record).await?;
                }
            }

            let mut tail = file.tail(start_tx_id)?.ok_or_else(|| {
                Error::Replication(format!(
                    "segment {} no longer covers tx id {}",
                    file.path().display(),
                    start_tx_id
                ))
            })?;

            loop {
                if last_time_sent.elapsed() >= time_freq {
                    let time = Message::Time(TimeMessage {
                        unix_ms: chrono::Utc::now().timestamp_millis(),
                    });
                    write_frame(&mut writer, &time.encode()?).await?;
                    last_time_sent = Instant::now();
                }

                let bytes = file.read_tail(&mut tail)?;
                if !bytes.is_empty() {
                    write_frame(&mut writer, &bytes).await?;
                } else if tail.eof {
                    // segment exhausted; move on to the next one
                    break;
                } else {
                    let mut probe = [0u8; 32];
                    tokio::select! {
                        _ = tokio::time::sleep(tail_poll) => {}
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return Ok(());
                            }
                        }
                        read = reader.read(&mut probe) => match read {
                            // nothing further is expected from the
                            // slave; data means a protocol violation,
                            // zero means it hung up
                            Ok(0) => {
                                tracing::debug!("Replication session closed by peer");
                                return Ok(());
                            }
                            Ok(_) => {
                                tracing::warn!("Unexpected data from slave, closing session");
                                return Ok(());
                            }
                            Err(e) => return Err(e.into()),
                        },
                    }
                }
                file.get_new_data(&mut tail)?;
            }

            tracing::debug!(
                "Segment {} exhausted, rotating to tx id {}",
                file.path().display(),
                tail.next_tx_id
            );
            start_tx_id = tail.next_tx_id;
        }
    }
}
