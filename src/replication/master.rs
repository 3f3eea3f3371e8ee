//! Replication Master
//!
//! Owns the single currently-writable replication file, translates
//! live stream tuples into transactions, rotates files on fullness and
//! serves the log to connected slaves.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::watch;

use super::protocol::{Message, Request, Wakeup};
use super::session::MasterSession;
use crate::config::{MasterConfig, TcpRole};
use crate::error::{Error, Result};
use crate::network::{read_frame, write_frame, ReplicationClient};
use crate::stream::{serialize_tuple, StreamRegistry, Tuple, TupleDefinition};
use crate::txlog::{
    header_size, scan_segments, segment_path, ColumnInfo, LogFileHandle, ReplicationFile,
    StreamSchema, Transaction,
};

/// Master side of the replication: one writable file, a map of sealed
/// segments and one subscriber per configured stream.
pub struct ReplicationMaster {
    instance: String,
    instance_id: u32,
    cfg: MasterConfig,
    dir: PathBuf,
    files: Mutex<BTreeMap<u64, Arc<LogFileHandle>>>,
    current: Mutex<Arc<ReplicationFile>>,
    translators: Mutex<Vec<Arc<StreamToLog>>>,
    registry: Arc<StreamRegistry>,
    shutdown: watch::Sender<bool>,
}

impl ReplicationMaster {
    /// Scan the replication directory and open (or create) the current
    /// append file. Stream subscriptions and background tasks start
    /// with [`start`](Self::start).
    pub fn new(
        instance: String,
        instance_id: u32,
        cfg: MasterConfig,
        data_dir: &std::path::Path,
        registry: Arc<StreamRegistry>,
    ) -> Result<Arc<Self>> {
        let dir = data_dir.join("replication");
        std::fs::create_dir_all(&dir)?;

        let max_file_size = cfg.max_file_size();
        let hdr = header_size(cfg.max_pages);
        if max_file_size <= hdr as u64 {
            return Err(Error::Config(format!(
                "max_file_size_kb too small: the header alone takes {} bytes for max_pages={}",
                hdr, cfg.max_pages
            )));
        }

        let mut files = BTreeMap::new();
        for (first_tx_id, path) in scan_segments(&dir)? {
            tracing::debug!("Found replication file starting with tx id {}", first_tx_id);
            files.insert(first_tx_id, Arc::new(LogFileHandle::new(path, first_tx_id)));
        }

        let (shutdown, _) = watch::channel(false);
        let current = Self::init_current_file(&instance, &cfg, &dir, &mut files)?;
        Ok(Arc::new(Self {
            instance,
            instance_id,
            cfg,
            dir,
            files: Mutex::new(files),
            current: Mutex::new(current),
            translators: Mutex::new(Vec::new()),
            registry,
            shutdown,
        }))
    }

    fn init_current_file(
        instance: &str,
        cfg: &MasterConfig,
        dir: &std::path::Path,
        files: &mut BTreeMap<u64, Arc<LogFileHandle>>,
    ) -> Result<Arc<ReplicationFile>> {
        let max_file_size = cfg.max_file_size();
        let last = files.iter().next_back().map(|(id, h)| (*id, h.clone()));
        let current = match last {
            None => {
                let file = Arc::new(ReplicationFile::create(
                    &segment_path(dir, 0),
                    0,
                    cfg.page_size,
                    cfg.max_pages,
                    max_file_size,
                )?);
                files.insert(0, Arc::new(LogFileHandle::new_open(file.clone())));
                file
            }
            Some((first_tx_id, handle)) => {
                let path = handle.path().to_path_buf();
                let on_disk = std::fs::metadata(&path)?.len();
                let file = if on_disk > max_file_size {
                    // the newest file was written with a larger max size;
                    // keep it read-only and continue in a fresh segment
                    let file = Arc::new(ReplicationFile::open_read_only(&path, first_tx_id)?);
                    if file.num_tx() == 0 {
                        return Err(Error::Config(format!(
                            "{} is larger than max_file_size but holds no transactions; \
                             is max_file_size_kb too small for max_pages={}?",
                            path.display(),
                            cfg.max_pages
                        )));
                    }
                    file
                } else {
                    Arc::new(ReplicationFile::open_read_write(
                        &path,
                        first_tx_id,
                        max_file_size,
                    )?)
                };
                files.insert(first_tx_id, Arc::new(LogFileHandle::new_open(file.clone())));

                if file.is_full() {
                    let next = file.next_tx_id();
                    let fresh = Arc::new(ReplicationFile::create(
                        &segment_path(dir, next),
                        next,
                        cfg.page_size,
                        cfg.max_pages,
                        max_file_size,
                    )?);
                    files.insert(next, Arc::new(LogFileHandle::new_open(fresh.clone())));
                    fresh
                } else {
                    file
                }
            }
        };
        tracing::info!(
            "Replication master {} writing to {} (next tx id {})",
            instance,
            current.path().display(),
            current.next_tx_id()
        );
        Ok(current)
    }

    /// Subscribe to the configured streams and start the housekeeping
    /// and (in TCP-client role) outbound connection tasks.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        for (i, name) in self.cfg.streams.iter().enumerate() {
            let stream = self.registry.get(name).ok_or_else(|| {
                Error::Config(format!("cannot find stream '{}'", name))
            })?;
            let translator = Arc::new(StreamToLog {
                stream_id: i as u32,
                stream_name: stream.name().to_string(),
                complete: Mutex::new(TupleDefinition::new()),
                master: Arc::downgrade(self),
            });
            self.translators.lock().unwrap().push(translator.clone());

            let mut rx = stream.subscribe();
            let mut shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        tuple = rx.recv() => match tuple {
                            Some(tuple) => translator.on_tuple(tuple),
                            None => break,
                        },
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            });
        }

        let master = self.clone();
        tokio::spawn(async move { master.housekeeping().await });

        if self.cfg.tcp_role == TcpRole::Client {
            for slave in &self.cfg.slaves {
                let address = format!("{}:{}", slave.host, slave.port);
                let client = ReplicationClient::new(address, self.cfg.reconnection_interval());
                let master = self.clone();
                let slave_instance = slave.instance.clone();
                let shutdown = self.shutdown.subscribe();
                tokio::spawn(async move {
                    client
                        .run(shutdown, move |socket| {
                            serve_outbound(master.clone(), slave_instance.clone(), socket)
                        })
                        .await;
                });
            }
        }
        Ok(())
    }

    /// Stop background tasks and close all files
    pub fn stop(&self) -> Result<()> {
        let _ = self.shutdown.send(true);
        let current = self.current.lock().unwrap().clone();
        current.close()?;
        for handle in self.files.lock().unwrap().values() {
            if handle.first_tx_id() != current.first_tx_id() {
                let _ = handle.sync_or_close(Instant::now() + Duration::from_secs(1));
            }
        }
        Ok(())
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn instance_id(&self) -> u32 {
        self.instance_id
    }

    pub fn config(&self) -> &MasterConfig {
        &self.cfg
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Id of the last written transaction, or None if the log is empty
    pub fn last_tx_id(&self) -> Option<u64> {
        let current = self.current.lock().unwrap().clone();
        current.next_tx_id().checked_sub(1)
    }

    #[cfg(test)]
    pub(crate) fn translators(&self) -> Vec<Arc<StreamToLog>> {
        self.translators.lock().unwrap().clone()
    }

    #[cfg(test)]
    pub(crate) fn segment_ids(&self) -> Vec<u64> {
        self.files.lock().unwrap().keys().copied().collect()
    }

    /// Append a transaction to the current file, rotating and retrying
    /// exactly once when it reports full.
    pub fn write_tx(&self, tx: &Transaction) -> Result<u64> {
        let cf = self.current.lock().unwrap().clone();
        if let Some(tx_id) = cf.append(tx)? {
            return Ok(tx_id);
        }
        self.open_new_file(&cf)?;
        let cf = self.current.lock().unwrap().clone();
        match cf.append(tx)? {
            Some(tx_id) => Ok(tx_id),
            None => Err(Error::Config(
                "a new replication file cannot accommodate a single transaction; \
                 increase max_file_size_kb"
                    .into(),
            )),
        }
    }

    /// Rotate to a new segment. Idempotent: a no-op when another writer
    /// already rotated away from `prev`. The new segment immediately
    /// receives one STREAM_INFO per known stream so it is
    /// self-describing from its first byte.
    fn open_new_file(&self, prev: &Arc<ReplicationFile>) -> Result<()> {
        let mut current = self.current.lock().unwrap();
        if !Arc::ptr_eq(&current, prev) {
            return Ok(());
        }

        let first_tx_id = current.next_tx_id();
        if let Some(handle) = self.files.lock().unwrap().get(&current.first_tx_id()) {
            handle.mark_sync_required();
        }

        let file = Arc::new(ReplicationFile::create(
            &segment_path(&self.dir, first_tx_id),
            first_tx_id,
            self.cfg.page_size,
            self.cfg.max_pages,
            self.cfg.max_file_size(),
        )?);

        // the schema records go in before any writer can reach the new
        // file, so every segment is self-describing from its first byte
        for translator in self.translators.lock().unwrap().iter() {
            let tx = Transaction::StreamInfo {
                origin_id: self.instance_id,
                schema: translator.schema(),
            };
            if file.append(&tx)?.is_none() {
                return Err(Error::Config(
                    "failed to write stream info at the beginning of a new replication file; \
                     is max_file_size_kb too small?"
                        .into(),
                ));
            }
        }

        self.files
            .lock()
            .unwrap()
            .insert(first_tx_id, Arc::new(LogFileHandle::new_open(file.clone())));
        *current = file;
        Ok(())
    }

    /// Locate (and pin) the segment serving `start_tx_id`.
    ///
    /// Falls back to the earliest segment when the id predates
    /// retention; skips over a gap between segments (logged); returns
    /// `None` when the id is beyond all known data, in which case the
    /// caller polls again later.
    pub fn get_file(
        &self,
        start_tx_id: u64,
    ) -> Result<Option<(Arc<LogFileHandle>, Arc<ReplicationFile>)>> {
        let mut start_tx_id = start_tx_id;
        loop {
            let handle = {
                let files = self.files.lock().unwrap();
                let found = files
                    .range(..=start_tx_id)
                    .next_back()
                    .or_else(|| files.iter().next())
                    .map(|(_, h)| h.clone());
                match found {
                    Some(h) => h,
                    None => return Ok(None),
                }
            };
            let file = match handle.acquire()? {
                Some(f) => f,
                None => {
                    // deleted since the lookup; drop it and retry
                    self.files.lock().unwrap().remove(&handle.first_tx_id());
                    continue;
                }
            };

            let next_tx_id = file.next_tx_id();
            if next_tx_id < start_tx_id {
                handle.release();
                let ceiling = {
                    let files = self.files.lock().unwrap();
                    files.range(next_tx_id..).next().map(|(id, _)| *id)
                };
                match ceiling {
                    Some(k) if k != next_tx_id => {
                        tracing::error!(
                            "Gap in the replication files: transactions {} to {} are missing",
                            next_tx_id,
                            k - 1
                        );
                        start_tx_id = k;
                        continue;
                    }
                    // the id is still in the future
                    _ => return Ok(None),
                }
            }
            return Ok(Some((handle, file)));
        }
    }

    /// Periodic sync of the current file plus the idle-close and
    /// expired-file sweeps over all other segments
    async fn housekeeping(&self) {
        let close_time = self.cfg.file_close_time();
        let mut close_tick = tokio::time::interval(close_time);
        let mut sync_tick = tokio::time::interval(self.cfg.file_sync_time());
        close_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        sync_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = sync_tick.tick() => {
                    let current = self.current.lock().unwrap().clone();
                    if let Err(e) = current.sync() {
                        tracing::error!("Error syncing current replication file: {}", e);
                    }
                }
                _ = close_tick.tick() => {
                    self.close_unused_files(close_time);
                    self.delete_expired_files();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    fn close_unused_files(&self, close_time: Duration) {
        let current_first = self.current.lock().unwrap().first_tx_id();
        let older_than = match Instant::now().checked_sub(close_time) {
            Some(t) => t,
            // the process is younger than the idle threshold
            None => return,
        };
        let handles: Vec<_> = self.files.lock().unwrap().values().cloned().collect();
        for handle in handles {
            if handle.first_tx_id() == current_first {
                continue;
            }
            if let Err(e) = handle.sync_or_close(older_than) {
                tracing::warn!(
                    "Error closing or syncing {}: {}",
                    handle.path().display(),
                    e
                );
            }
        }
    }

    fn delete_expired_files(&self) {
        let expiration = self.cfg.expiration();
        let current_first = self.current.lock().unwrap().first_tx_id();
        let handles: Vec<_> = self
            .files
            .lock()
            .unwrap()
            .iter()
            .map(|(id, h)| (*id, h.clone()))
            .collect();

        for (first_tx_id, handle) in handles {
            if first_tx_id == current_first {
                continue;
            }
            let age = std::fs::metadata(handle.path())
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| SystemTime::now().duration_since(t).ok());
            let expired = matches!(age, Some(age) if age > expiration);
            if !expired {
                continue;
            }
            match handle.delete() {
                Ok(true) => {
                    self.files.lock().unwrap().remove(&first_tx_id);
                    tracing::info!("Deleted expired replication file {}", handle.path().display());
                }
                // still referenced by a replay; retried on the next sweep
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!("Failed to delete {}: {}", handle.path().display(), e);
                }
            }
        }
    }
}

/// Subscriber translating one stream's tuples into log transactions.
///
/// Tracks the union of all columns seen on the stream; a tuple shape
/// with previously unseen columns triggers a STREAM_INFO record before
/// the next DATA record so receivers never need an external catalog.
pub(crate) struct StreamToLog {
    stream_id: u32,
    stream_name: String,
    complete: Mutex<TupleDefinition>,
    master: Weak<ReplicationMaster>,
}

impl StreamToLog {
    pub(crate) fn on_tuple(&self, tuple: Tuple) {
        let master = match self.master.upgrade() {
            Some(m) => m,
            None => return,
        };
        if let Err(e) = self.write_tuple(&master, &tuple) {
            tracing::error!(
                "Failed to write tuple from stream {} to the replication log: {}",
                self.stream_name,
                e
            );
        }
    }

    fn write_tuple(&self, master: &ReplicationMaster, tuple: &Tuple) -> Result<()> {
        let added = {
            let mut complete = self.complete.lock().unwrap();
            let mut added = false;
            for cd in tuple.definition.columns() {
                if complete.column_index(&cd.name).is_none() {
                    complete.add_column(cd.clone());
                    added = true;
                }
            }
            added
        };
        if added {
            let schema = self.schema();
            tracing::debug!(
                "Writing stream info for {}: {} columns",
                self.stream_name,
                schema.columns.len()
            );
            master.write_tx(&Transaction::StreamInfo {
                origin_id: master.instance_id,
                schema,
            })?;
        }

        let payload = {
            let complete = self.complete.lock().unwrap();
            serialize_tuple(self.stream_id, tuple, &complete)?
        };
        master.write_tx(&Transaction::Data {
            origin_id: master.instance_id,
            payload,
        })?;
        Ok(())
    }

    fn schema(&self) -> StreamSchema {
        let complete = self.complete.lock().unwrap();
        StreamSchema {
            id: self.stream_id,
            name: self.stream_name.clone(),
            columns: complete
                .columns()
                .iter()
                .enumerate()
                .map(|(i, cd)| ColumnInfo {
                    id: i as u32,
                    name: cd.name.clone(),
                    dtype: cd.dtype,
                })
                .collect(),
        }
    }
}

/// Master in TCP-client role: wake the slave's server side, wait for
/// its REQUEST, then push the log to it.
async fn serve_outbound(
    master: Arc<ReplicationMaster>,
    slave_instance: String,
    socket: tokio::net::TcpStream,
) -> Result<()> {
    let (mut reader, mut writer) = socket.into_split();
    let wakeup = Message::Wakeup(Wakeup {
        instance: slave_instance.clone(),
    });
    write_frame(&mut writer, &wakeup.encode()?).await?;

    let frame = read_frame(&mut reader, master.config().max_tuple_size).await?;
    let req: Request = match Message::decode(&frame)? {
        Message::Request(req) => req,
        Message::Response(resp) if resp.result != 0 => {
            return Err(Error::Replication(format!(
                "slave {} refused the wakeup: {}",
                slave_instance,
                resp.error_msg.unwrap_or_default()
            )));
        }
        other => {
            return Err(Error::Replication(format!(
                "expected REQUEST after wakeup, got {}",
                other.type_name()
            )));
        }
    };
    tracing::debug!(
        "Slave {} requested replication starting at {:?}",
        slave_instance,
        req.start_tx_id
    );

    let shutdown = master.shutdown_signal();
    MasterSession::new(master).run(reader, writer, req, shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_master_config;
    use crate::stream::{ColumnDefinition, DataType, Value};
    use crate::txlog::transaction::decode_record_header;
    use bytes::Bytes;
    use tempfile::tempdir;

    fn tm_tuple(gentime: i64, seq: i32) -> Tuple {
        let mut def = TupleDefinition::new();
        def.add_column(ColumnDefinition::new("gentime", DataType::Long));
        def.add_column(ColumnDefinition::new("seq_num", DataType::Int));
        Tuple::new(
            def,
            vec![Some(Value::Long(gentime)), Some(Value::Int(seq))],
        )
    }

    fn build_master(
        dir: &std::path::Path,
        cfg: MasterConfig,
    ) -> (Arc<ReplicationMaster>, Arc<StreamRegistry>) {
        let registry = Arc::new(StreamRegistry::new());
        registry.create("tm_realtime");
        let master =
            ReplicationMaster::new("ops".to_string(), 1, cfg, dir, registry.clone()).unwrap();
        (master, registry)
    }

    #[tokio::test]
    async fn test_scan_reopens_latest_segment() {
        let dir = tempdir().unwrap();
        let cfg = test_master_config();

        let (master, _registry) = build_master(dir.path(), cfg.clone());
        master.start().unwrap();
        let id = master
            .write_tx(&Transaction::Data {
                origin_id: 1,
                payload: Bytes::from_static(b"abc"),
            })
            .unwrap();
        assert_eq!(id, 0);
        master.stop().unwrap();

        let (master, _registry) = build_master(dir.path(), cfg);
        assert_eq!(master.last_tx_id(), Some(0));
        let id = master
            .write_tx(&Transaction::Data {
                origin_id: 1,
                payload: Bytes::from_static(b"def"),
            })
            .unwrap();
        assert_eq!(id, 1);
        master.stop().unwrap();
    }

    #[tokio::test]
    async fn test_rotation_creates_self_describing_segment() {
        let dir = tempdir().unwrap();
        let mut cfg = test_master_config();
        // two transactions per segment
        cfg.page_size = 1;
        cfg.max_pages = 2;

        let (master, _registry) = build_master(dir.path(), cfg);
        master.start().unwrap();
        let translator = master.translators().into_iter().next().unwrap();

        // first tuple: STREAM_INFO (tx 0) + DATA (tx 1) fill segment 0
        translator.on_tuple(tm_tuple(1000, 1));
        assert_eq!(master.segment_ids(), vec![0]);

        // second tuple rotates; the new segment re-describes the stream
        translator.on_tuple(tm_tuple(2000, 2));
        assert_eq!(master.segment_ids(), vec![0, 2]);
        assert_eq!(master.last_tx_id(), Some(3));

        let (handle, file) = master.get_file(2).unwrap().unwrap();
        assert_eq!(file.first_tx_id(), 2);
        let mut tail = file.tail(2).unwrap().unwrap();
        let bytes = file.read_tail(&mut tail).unwrap();
        let first = decode_record_header(&bytes).unwrap();
        assert_eq!(first.ttype, crate::txlog::transaction::TX_STREAM_INFO);
        assert_eq!(first.tx_id, 2);
        let second = decode_record_header(&bytes[first.total_len()..]).unwrap();
        assert_eq!(second.ttype, crate::txlog::transaction::TX_DATA);
        assert_eq!(second.tx_id, 3);
        handle.release();
        master.stop().unwrap();
    }

    #[tokio::test]
    async fn test_schema_written_once_until_columns_change() {
        let dir = tempdir().unwrap();
        let (master, _registry) = build_master(dir.path(), test_master_config());
        master.start().unwrap();
        let translator = master.translators().into_iter().next().unwrap();

        translator.on_tuple(tm_tuple(1, 1)); // STREAM_INFO + DATA
        translator.on_tuple(tm_tuple(2, 2)); // DATA only
        assert_eq!(master.last_tx_id(), Some(2));

        // a tuple with a new column forces a fresh STREAM_INFO
        let mut def = TupleDefinition::new();
        def.add_column(ColumnDefinition::new("gentime", DataType::Long));
        def.add_column(ColumnDefinition::new("status", DataType::String));
        translator.on_tuple(Tuple::new(
            def,
            vec![Some(Value::Long(3)), Some(Value::String("ok".into()))],
        ));
        assert_eq!(master.last_tx_id(), Some(4));

        let (handle, file) = master.get_file(0).unwrap().unwrap();
        let meta = file.metadata_records().unwrap();
        assert_eq!(meta.len(), 2);
        handle.release();
        master.stop().unwrap();
    }

    #[tokio::test]
    async fn test_get_file_future_and_floor() {
        let dir = tempdir().unwrap();
        let (master, _registry) = build_master(dir.path(), test_master_config());
        master.start().unwrap();
        let translator = master.translators().into_iter().next().unwrap();
        translator.on_tuple(tm_tuple(1, 1)); // tx 0 + 1

        // a future transaction is not yet available
        assert!(master.get_file(100).unwrap().is_none());

        // the append position itself is a valid (empty-tail) target
        let (handle, file) = master.get_file(2).unwrap().unwrap();
        assert_eq!(file.first_tx_id(), 0);
        handle.release();
        master.stop().unwrap();
    }
}
