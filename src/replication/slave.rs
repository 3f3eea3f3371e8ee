//! Replication Slave
//!
//! Obtains a gap-free suffix of the master's log starting at
//! `last applied tx id + 1`, applies DATA records to local streams and
//! persists its progress after every applied record. Reconnection is
//! slave-driven: after any disconnect it asks again from where it left
//! off, so a record may be re-received but never skipped.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::TcpStream;
use tokio::sync::watch;

use super::protocol::{Message, Request, TransactionFrame};
use crate::config::{SlaveConfig, TcpRole};
use crate::error::{Error, Result};
use crate::network::{read_frame, write_frame, ReplicationClient};
use crate::stream::{deserialize_tuple, ColumnDefinition, Stream, StreamRegistry, TupleDefinition};
use crate::txlog::StreamSchema;

const PROGRESS_FILE: &str = "slave-lastid.txt";

/// Last applied transaction id, persisted as one decimal line and
/// rewritten in place after each applied record. -1 means nothing has
/// been applied yet.
struct Progress {
    file: File,
    last_tx_id: i64,
}

impl Progress {
    fn open(path: &Path) -> Result<Progress> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let mut line = String::new();
        BufReader::new(&file).read_line(&mut line)?;
        let line = line.trim();
        let last_tx_id = if line.is_empty() {
            -1
        } else {
            line.parse::<i64>().map_err(|e| {
                Error::Config(format!("cannot parse number from {}: {}", path.display(), e))
            })?
        };
        Ok(Progress { file, last_tx_id })
    }

    fn store(&mut self, tx_id: i64) -> Result<()> {
        self.last_tx_id = tx_id;
        self.file.seek(SeekFrom::Start(0))?;
        writeln!(self.file, "{}", tx_id)?;
        Ok(())
    }
}

/// Slave side of the replication
pub struct ReplicationSlave {
    instance: String,
    local_instance_id: u32,
    cfg: SlaveConfig,
    /// remote stream name -> local stream name
    mappings: HashMap<String, String>,
    registry: Arc<StreamRegistry>,
    progress: Mutex<Progress>,
    session_active: Mutex<bool>,
    request_seq: AtomicU32,
    shutdown: watch::Sender<bool>,
}

impl ReplicationSlave {
    pub fn new(
        instance: String,
        local_instance_id: u32,
        cfg: SlaveConfig,
        data_dir: &Path,
        registry: Arc<StreamRegistry>,
    ) -> Result<Arc<Self>> {
        let dir = data_dir.join("replication");
        std::fs::create_dir_all(&dir)?;
        let progress = Progress::open(&dir.join(PROGRESS_FILE))?;
        tracing::info!(
            "Replication slave {} starting with last applied tx id {}",
            instance,
            progress.last_tx_id
        );

        let mappings = cfg
            .streams
            .iter()
            .map(|m| (m.remote.clone(), m.local.clone()))
            .collect();
        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            instance,
            local_instance_id,
            cfg,
            mappings,
            registry,
            progress: Mutex::new(progress),
            session_active: Mutex::new(false),
            request_seq: AtomicU32::new(0),
            shutdown,
        }))
    }

    /// In TCP-client role, start the reconnecting connection to the
    /// master. In server role the slave waits for a WAKEUP routed by
    /// the replication server.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.cfg.tcp_role == TcpRole::Client {
            let host = self.cfg.master_host.clone().ok_or_else(|| {
                Error::Config("slave in client role requires master_host".into())
            })?;
            let port = self.cfg.master_port.ok_or_else(|| {
                Error::Config("slave in client role requires master_port".into())
            })?;
            let client = ReplicationClient::new(
                format!("{}:{}", host, port),
                self.cfg.reconnection_interval(),
            );
            let slave = self.clone();
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                client
                    .run(shutdown, move |socket| {
                        let slave = slave.clone();
                        async move { slave.handle_connection(socket).await }
                    })
                    .await;
            });
        }
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Last applied transaction id, -1 before anything was applied
    pub fn last_tx_id(&self) -> i64 {
        self.progress.lock().unwrap().last_tx_id
    }

    /// Run one replication session over an established connection. Only
    /// one session may be active at a time; a second concurrent
    /// connection is refused.
    pub async fn handle_connection(self: Arc<Self>, socket: TcpStream) -> Result<()> {
        {
            let mut active = self.session_active.lock().unwrap();
            if *active {
                return Err(Error::Replication(
                    "there is already a connection open to this slave".into(),
                ));
            }
            *active = true;
        }
        let result = self.run_session(socket).await;
        *self.session_active.lock().unwrap() = false;
        result
    }

    async fn run_session(&self, socket: TcpStream) -> Result<()> {
        let (mut reader, mut writer) = socket.into_split();
        let receive_timeout = self.cfg.receive_timeout();
        let mut shutdown = self.shutdown.subscribe();

        let last = self.last_tx_id();
        let request = Request {
            instance: self.cfg.master_instance.clone().unwrap_or_else(|| self.instance.clone()),
            request_seq: self.request_seq.fetch_add(1, Ordering::Relaxed),
            start_tx_id: if last >= 0 { Some(last as u64 + 1) } else { None },
        };
        tracing::debug!("Sending replication request {:?}", request);
        write_frame(&mut writer, &Message::Request(request).encode()?).await?;

        // remote stream id -> local stream writer, scoped per connection
        let mut stream_writers: HashMap<u32, StreamWriter> = HashMap::new();

        loop {
            let frame = tokio::select! {
                read = tokio::time::timeout(
                    receive_timeout,
                    read_frame(&mut reader, self.cfg.max_tuple_size),
                ) => match read {
                    Ok(Ok(frame)) => frame,
                    Ok(Err(e)) => return Err(e),
                    Err(_) => {
                        tracing::warn!(
                            "No message from the master within {:?}, closing connection",
                            receive_timeout
                        );
                        return Err(Error::ReceiveTimeout(receive_timeout));
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                    continue;
                }
            };

            let message = match Message::decode(&frame) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!("TX{} failed to decode message, closing connection: {}",
                        self.last_tx_id(), e);
                    return Err(e);
                }
            };

            match message {
                Message::Data(tmsg) => self.handle_data(tmsg, &stream_writers)?,
                Message::StreamInfo(tmsg) => self.handle_stream_info(tmsg, &mut stream_writers)?,
                Message::Response(resp) => {
                    if resp.result != 0 {
                        return Err(Error::Replication(format!(
                            "received negative response: {}",
                            resp.error_msg.unwrap_or_default()
                        )));
                    }
                    tracing::info!("Received response {:?}", resp);
                }
                Message::Time(time) => {
                    tracing::trace!("Master time {}", time.unix_ms);
                }
                other => {
                    return Err(Error::Replication(format!(
                        "unexpected message type {} received from the master",
                        other.type_name()
                    )));
                }
            }
        }
    }

    fn handle_data(
        &self,
        tmsg: TransactionFrame,
        stream_writers: &HashMap<u32, StreamWriter>,
    ) -> Result<()> {
        let mut progress = self.progress.lock().unwrap();
        if (tmsg.tx_id as i64) <= progress.last_tx_id {
            tracing::warn!(
                "Received data from the past: tx id {}, last applied {}",
                tmsg.tx_id,
                progress.last_tx_id
            );
            return Ok(());
        }
        check_missing(&progress, tmsg.tx_id);

        if tmsg.origin_id == self.local_instance_id {
            tracing::trace!(
                "TX{} skipping data originating from this instance ({})",
                tmsg.tx_id,
                tmsg.origin_id
            );
            return progress.store(tmsg.tx_id as i64);
        }

        let mut payload = tmsg.payload.clone();
        if payload.len() < 4 {
            tracing::warn!("TX{} data payload without a stream id", tmsg.tx_id);
            return progress.store(tmsg.tx_id as i64);
        }
        let stream_id = u32::from_be_bytes(payload[0..4].try_into().unwrap());
        bytes::Buf::advance(&mut payload, 4);

        match stream_writers.get(&stream_id) {
            Some(writer) => {
                tracing::trace!(
                    "TX{} received data for stream {}, {} bytes",
                    tmsg.tx_id,
                    writer.stream.name(),
                    payload.len()
                );
                writer.process_data(tmsg.tx_id, payload);
            }
            None => {
                tracing::trace!("TX{} skipping data for unknown stream {}", tmsg.tx_id, stream_id);
            }
        }
        progress.store(tmsg.tx_id as i64)
    }

    fn handle_stream_info(
        &self,
        tmsg: TransactionFrame,
        stream_writers: &mut HashMap<u32, StreamWriter>,
    ) -> Result<()> {
        {
            let mut progress = self.progress.lock().unwrap();
            // schema records below the start point are expected replays
            if (tmsg.tx_id as i64) > progress.last_tx_id {
                check_missing(&progress, tmsg.tx_id);
                progress.store(tmsg.tx_id as i64)?;
            }
        }

        let schema = tmsg.schema()?;
        if schema.name.is_empty() {
            return Err(Error::Replication(format!(
                "TX{}: received invalid stream info without a name",
                tmsg.tx_id
            )));
        }
        tracing::debug!(
            "TX{}: received stream info for {} ({} columns)",
            tmsg.tx_id,
            schema.name,
            schema.columns.len()
        );

        let local_name = match self.mappings.get(&schema.name) {
            Some(n) => n,
            None => {
                tracing::debug!(
                    "TX{}: ignoring stream {} because it is not configured",
                    tmsg.tx_id,
                    schema.name
                );
                return Ok(());
            }
        };
        let stream = match self.registry.get(local_name) {
            Some(s) => s,
            None => {
                tracing::warn!(
                    "TX{}: received data for stream {} which does not exist locally",
                    tmsg.tx_id,
                    local_name
                );
                return Ok(());
            }
        };
        match StreamWriter::new(stream, &schema) {
            Some(writer) => {
                stream_writers.insert(schema.id, writer);
            }
            None => {
                tracing::warn!("TX{}: corrupted stream info for {}", tmsg.tx_id, schema.name);
            }
        }
        Ok(())
    }
}

/// Warn (but continue) when the incoming id leaves a hole; no
/// retransmission is requested.
fn check_missing(progress: &Progress, tx_id: u64) {
    if progress.last_tx_id >= 0 && tx_id as i64 != progress.last_tx_id + 1 {
        tracing::warn!(
            "Transactions {} to {} are missing",
            progress.last_tx_id + 1,
            tx_id as i64 - 1
        );
    }
}

/// Per-connection mapping of one remote stream to a local stream plus
/// the column schema for deserialization
struct StreamWriter {
    stream: Arc<Stream>,
    complete: TupleDefinition,
}

impl StreamWriter {
    fn new(stream: Arc<Stream>, schema: &StreamSchema) -> Option<StreamWriter> {
        let mut complete = TupleDefinition::new();
        for (i, cinfo) in schema.columns.iter().enumerate() {
            if cinfo.id != i as u32 {
                tracing::warn!(
                    "Corrupted metadata? column[{}].id = {} (should be {})",
                    i,
                    cinfo.id,
                    i
                );
                return None;
            }
            complete.add_column(ColumnDefinition::new(cinfo.name.clone(), cinfo.dtype));
        }
        Some(StreamWriter { stream, complete })
    }

    /// Deserialize one DATA payload and emit it to the local stream.
    /// Deserialization failures are logged and skipped; they do not
    /// affect the connection.
    fn process_data(&self, tx_id: u64, mut payload: bytes::Bytes) {
        match deserialize_tuple(&mut payload, &self.complete) {
            Ok(tuple) => self.stream.emit(tuple),
            Err(e) => {
                tracing::warn!(
                    "TX{}: cannot deserialize data for stream {}: {}",
                    tx_id,
                    self.stream.name(),
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_slave_config;
    use crate::stream::{serialize_tuple, DataType, Tuple, Value};
    use crate::txlog::transaction::TX_DATA;
    use bytes::{BufMut, Bytes, BytesMut};
    use tempfile::tempdir;

    fn build_slave(dir: &Path) -> (Arc<ReplicationSlave>, Arc<StreamRegistry>) {
        let registry = Arc::new(StreamRegistry::new());
        registry.create("tm_local");
        let slave = ReplicationSlave::new(
            "backup".to_string(),
            2,
            test_slave_config(),
            dir,
            registry.clone(),
        )
        .unwrap();
        (slave, registry)
    }

    fn tm_schema() -> StreamSchema {
        StreamSchema {
            id: 0,
            name: "tm_realtime".to_string(),
            columns: vec![
                crate::txlog::ColumnInfo {
                    id: 0,
                    name: "gentime".to_string(),
                    dtype: DataType::Long,
                },
                crate::txlog::ColumnInfo {
                    id: 1,
                    name: "seq_num".to_string(),
                    dtype: DataType::Int,
                },
            ],
        }
    }

    fn data_frame(origin_id: u32, tx_id: u64, gentime: i64, seq: i32) -> TransactionFrame {
        let mut def = TupleDefinition::new();
        def.add_column(ColumnDefinition::new("gentime", DataType::Long));
        def.add_column(ColumnDefinition::new("seq_num", DataType::Int));
        let tuple = Tuple::new(def.clone(), vec![Some(Value::Long(gentime)), Some(Value::Int(seq))]);
        TransactionFrame {
            ttype: TX_DATA,
            origin_id,
            tx_id,
            payload: serialize_tuple(0, &tuple, &def).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_progress_file_round_trip() {
        let dir = tempdir().unwrap();
        {
            let (slave, _registry) = build_slave(dir.path());
            assert_eq!(slave.last_tx_id(), -1);
            slave.progress.lock().unwrap().store(41).unwrap();
            slave.progress.lock().unwrap().store(12345).unwrap();
        }
        let (slave, _registry) = build_slave(dir.path());
        assert_eq!(slave.last_tx_id(), 12345);
    }

    #[tokio::test]
    async fn test_progress_file_garbage_is_an_error() {
        let dir = tempdir().unwrap();
        let repl = dir.path().join("replication");
        std::fs::create_dir_all(&repl).unwrap();
        std::fs::write(repl.join(PROGRESS_FILE), "not a number\n").unwrap();
        let registry = Arc::new(StreamRegistry::new());
        let result = ReplicationSlave::new(
            "backup".to_string(),
            2,
            test_slave_config(),
            dir.path(),
            registry,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_apply_data_in_order() {
        let dir = tempdir().unwrap();
        let (slave, registry) = build_slave(dir.path());
        let mut rx = registry.get("tm_local").unwrap().subscribe();

        let mut writers = HashMap::new();
        let info = TransactionFrame {
            ttype: crate::txlog::transaction::TX_STREAM_INFO,
            origin_id: 1,
            tx_id: 0,
            payload: Bytes::from(bincode::serialize(&tm_schema()).unwrap()),
        };
        slave.handle_stream_info(info, &mut writers).unwrap();
        assert_eq!(writers.len(), 1);
        assert_eq!(slave.last_tx_id(), 0);

        slave.handle_data(data_frame(1, 1, 1000, 1), &writers).unwrap();
        slave.handle_data(data_frame(1, 2, 2000, 2), &writers).unwrap();

        let t1 = rx.try_recv().unwrap();
        assert_eq!(t1.value("gentime"), Some(&Value::Long(1000)));
        let t2 = rx.try_recv().unwrap();
        assert_eq!(t2.value("seq_num"), Some(&Value::Int(2)));
        assert_eq!(slave.last_tx_id(), 2);
    }

    #[tokio::test]
    async fn test_self_origin_records_are_skipped_but_acknowledged() {
        let dir = tempdir().unwrap();
        let (slave, registry) = build_slave(dir.path());
        let mut rx = registry.get("tm_local").unwrap().subscribe();

        let mut writers = HashMap::new();
        let info = TransactionFrame {
            ttype: crate::txlog::transaction::TX_STREAM_INFO,
            origin_id: 1,
            tx_id: 0,
            payload: Bytes::from(bincode::serialize(&tm_schema()).unwrap()),
        };
        slave.handle_stream_info(info, &mut writers).unwrap();

        // origin 2 is this slave's own instance id
        slave.handle_data(data_frame(2, 1, 1000, 1), &writers).unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(slave.last_tx_id(), 1);
    }

    #[tokio::test]
    async fn test_stale_and_gapped_records() {
        let dir = tempdir().unwrap();
        let (slave, _registry) = build_slave(dir.path());
        slave.progress.lock().unwrap().store(10).unwrap();

        let writers = HashMap::new();
        // from the past: ignored, progress untouched
        slave.handle_data(data_frame(1, 5, 1, 1), &writers).unwrap();
        assert_eq!(slave.last_tx_id(), 10);

        // a gap is logged but processing continues
        slave.handle_data(data_frame(1, 15, 1, 1), &writers).unwrap();
        assert_eq!(slave.last_tx_id(), 15);
    }

    #[tokio::test]
    async fn test_unconfigured_streams_are_ignored() {
        let dir = tempdir().unwrap();
        let (slave, _registry) = build_slave(dir.path());

        let mut schema = tm_schema();
        schema.name = "tc_uplink".to_string();
        let mut writers = HashMap::new();
        let info = TransactionFrame {
            ttype: crate::txlog::transaction::TX_STREAM_INFO,
            origin_id: 1,
            tx_id: 0,
            payload: Bytes::from(bincode::serialize(&schema).unwrap()),
        };
        slave.handle_stream_info(info, &mut writers).unwrap();
        assert!(writers.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_payload_does_not_advance_past_progress() {
        let dir = tempdir().unwrap();
        let (slave, registry) = build_slave(dir.path());
        let mut rx = registry.get("tm_local").unwrap().subscribe();

        let mut writers = HashMap::new();
        let info = TransactionFrame {
            ttype: crate::txlog::transaction::TX_STREAM_INFO,
            origin_id: 1,
            tx_id: 0,
            payload: Bytes::from(bincode::serialize(&tm_schema()).unwrap()),
        };
        slave.handle_stream_info(info, &mut writers).unwrap();

        // truncated column data: logged and skipped, progress advances
        let mut payload = BytesMut::new();
        payload.put_u32(0); // stream id
        payload.put_u32((DataType::Long.type_id() as u32) << 24); // tag, no value
        let frame = TransactionFrame {
            ttype: TX_DATA,
            origin_id: 1,
            tx_id: 1,
            payload: payload.freeze(),
        };
        slave.handle_data(frame, &writers).unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(slave.last_tx_id(), 1);
    }
}
