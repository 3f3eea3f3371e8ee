//! Managed File Handle
//!
//! Reference-counted lifecycle wrapper around one replication file:
//! lazy read-only open on first acquire, idle close from the master's
//! housekeeping sweep, and deletion that never evicts active readers.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use super::file::ReplicationFile;
use crate::error::{Error, Result};

struct HandleState {
    file: Option<Arc<ReplicationFile>>,
    ref_count: u32,
    last_access: Instant,
    deleted: bool,
    sync_required: bool,
}

/// Shareable handle to one replication file.
///
/// The underlying file may only be closed or deleted while
/// `ref_count == 0`; every `acquire` must be paired with a `release`.
/// Acquire hands out an `Arc` to the open file, so a reader that is
/// still holding it when the file gets closed keeps a valid (merely
/// stale) mapping instead of a dangling one.
pub struct LogFileHandle {
    path: PathBuf,
    first_tx_id: u64,
    state: Mutex<HandleState>,
}

impl LogFileHandle {
    /// Handle for a file known only by path; opened lazily on acquire
    pub fn new(path: PathBuf, first_tx_id: u64) -> Self {
        Self {
            path,
            first_tx_id,
            state: Mutex::new(HandleState {
                file: None,
                ref_count: 0,
                last_access: Instant::now(),
                deleted: false,
                sync_required: false,
            }),
        }
    }

    /// Handle wrapping an already-open file (the master's current
    /// append file)
    pub fn new_open(file: Arc<ReplicationFile>) -> Self {
        Self {
            path: file.path().to_path_buf(),
            first_tx_id: file.first_tx_id(),
            state: Mutex::new(HandleState {
                file: Some(file),
                ref_count: 0,
                last_access: Instant::now(),
                deleted: false,
                sync_required: false,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn first_tx_id(&self) -> u64 {
        self.first_tx_id
    }

    /// Open (lazily, read-only) and pin the file. Returns `None` when
    /// the file has been deleted. The caller must `release` when done.
    pub fn acquire(&self) -> Result<Option<Arc<ReplicationFile>>> {
        let mut state = self.state.lock().unwrap();
        if state.deleted {
            return Ok(None);
        }
        if state.file.is_none() {
            let file = ReplicationFile::open_read_only(&self.path, self.first_tx_id)?;
            state.file = Some(Arc::new(file));
        }
        state.ref_count += 1;
        state.last_access = Instant::now();
        Ok(state.file.clone())
    }

    /// Drop one acquisition
    pub fn release(&self) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.ref_count > 0, "release without matching acquire");
        state.ref_count = state.ref_count.saturating_sub(1);
        state.last_access = Instant::now();
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().unwrap().file.is_some()
    }

    pub fn is_deleted(&self) -> bool {
        self.state.lock().unwrap().deleted
    }

    pub fn ref_count(&self) -> u32 {
        self.state.lock().unwrap().ref_count
    }

    /// Ask the housekeeping sweep to sync this file on its next pass
    /// (set when the master rotates away from it)
    pub fn mark_sync_required(&self) {
        self.state.lock().unwrap().sync_required = true;
    }

    /// Housekeeping: close the file if it has been idle since before
    /// `older_than` with no readers; otherwise sync it if requested.
    pub fn sync_or_close(&self, older_than: Instant) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let file = match &state.file {
            Some(f) => f.clone(),
            None => return Ok(()),
        };
        if state.ref_count == 0 && state.last_access < older_than {
            tracing::debug!("Closing idle replication file {}", self.path.display());
            file.close()?;
            state.file = None;
            state.sync_required = false;
        } else if state.sync_required {
            file.sync()?;
            state.sync_required = false;
        }
        Ok(())
    }

    /// Delete the underlying file. Returns `false` while readers still
    /// hold it (the caller retries later); once it returns `true` the
    /// handle is permanently dead and future acquires fail.
    pub fn delete(&self) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if state.deleted {
            return Ok(true);
        }
        if state.ref_count > 0 {
            return Ok(false);
        }
        if let Some(file) = state.file.take() {
            file.close()?;
        }
        std::fs::remove_file(&self.path)?;
        state.deleted = true;
        tracing::debug!("Deleted replication file {}", self.path.display());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txlog::transaction::Transaction;
    use bytes::Bytes;
    use std::time::Duration;
    use tempfile::tempdir;

    fn make_file(dir: &Path, first_tx_id: u64) -> PathBuf {
        let path = dir.join(format!("RPL_{:016x}.dat", first_tx_id));
        let rf = ReplicationFile::create(&path, first_tx_id, 2, 2, 64 * 1024).unwrap();
        rf.append(&Transaction::Data {
            origin_id: 1,
            payload: Bytes::from_static(b"x"),
        })
        .unwrap();
        rf.close().unwrap();
        path
    }

    #[test]
    fn test_acquire_release_cycle() {
        let dir = tempdir().unwrap();
        let path = make_file(dir.path(), 0);
        let handle = LogFileHandle::new(path, 0);

        assert!(!handle.is_open());
        let file = handle.acquire().unwrap().unwrap();
        assert!(handle.is_open());
        assert_eq!(handle.ref_count(), 1);
        assert_eq!(file.num_tx(), 1);

        let file2 = handle.acquire().unwrap().unwrap();
        assert!(Arc::ptr_eq(&file, &file2));
        assert_eq!(handle.ref_count(), 2);

        handle.release();
        handle.release();
        assert_eq!(handle.ref_count(), 0);
        assert!(handle.is_open());
    }

    #[test]
    fn test_sync_or_close_respects_refcount_and_age() {
        let dir = tempdir().unwrap();
        let path = make_file(dir.path(), 0);
        let handle = LogFileHandle::new(path, 0);

        let _file = handle.acquire().unwrap().unwrap();
        // referenced: never closed, regardless of age
        handle.sync_or_close(Instant::now() + Duration::from_secs(60)).unwrap();
        assert!(handle.is_open());

        handle.release();
        // unreferenced but recently accessed: stays open
        handle.sync_or_close(Instant::now() - Duration::from_secs(60)).unwrap();
        assert!(handle.is_open());
        // unreferenced and idle: closed
        handle.sync_or_close(Instant::now() + Duration::from_secs(60)).unwrap();
        assert!(!handle.is_open());

        // closed handles reopen on the next acquire
        let file = handle.acquire().unwrap().unwrap();
        assert_eq!(file.num_tx(), 1);
        handle.release();
    }

    #[test]
    fn test_delete_while_referenced_fails() {
        let dir = tempdir().unwrap();
        let path = make_file(dir.path(), 0);
        let handle = LogFileHandle::new(path.clone(), 0);

        let _file = handle.acquire().unwrap().unwrap();
        assert!(!handle.delete().unwrap());
        assert!(path.exists());

        // the file is still fully usable
        handle.release();
        let file = handle.acquire().unwrap().unwrap();
        assert_eq!(file.num_tx(), 1);
        handle.release();
    }

    #[test]
    fn test_acquire_after_delete_fails() {
        let dir = tempdir().unwrap();
        let path = make_file(dir.path(), 0);
        let handle = LogFileHandle::new(path.clone(), 0);

        assert!(handle.delete().unwrap());
        assert!(!path.exists());
        assert!(handle.acquire().unwrap().is_none());
        // deletion is permanent and idempotent
        assert!(handle.delete().unwrap());
    }
}
