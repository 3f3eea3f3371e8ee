//! Replication File
//!
//! Stores transactions in a memory-mapped file. The data is split into
//! pages, each holding a fixed number of transactions; an index at the
//! start of the file points to the beginning of each page so readers
//! can jump close to a given transaction number. STREAM_INFO records
//! form a linked list so all schema records can be replayed to a newly
//! connecting slave.
//!
//! Layout:
//!
//! ```text
//! Header1 (32 B, fixed):
//!   [magic: 8]["TIDELOGS"] [version: u32] [first_tx_id: u64]
//!   [page_size: u32] [max_pages: u32] [spare: u32]
//! Header2 (mutable):
//!   [last_modified: u64] [num_full_pages: u32] [last_page_num_tx: u32]
//!   [first_meta: u32] [index: (max_pages+1) x u32]
//! Records (see txlog::transaction), back to back
//! ```
//!
//! All integers are big-endian: record bytes are replayed to the
//! network verbatim, so the file uses network byte order throughout.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use bytes::Bytes;
use memmap2::{Mmap, MmapMut};

use super::transaction::{
    decode_record_header, encode_record, verify_record, Transaction, META_PTR_OFFSET,
    MIN_RECORD_LEN, TX_DATA, TX_STREAM_INFO,
};
use crate::error::{Error, Result};

const SEGMENT_MAGIC: &[u8; 8] = b"TIDELOGS";
const SEGMENT_VERSION: u32 = 1;

const LAST_MOD_OFF: usize = 32;
const NUM_FULL_PAGES_OFF: usize = 40;
const LAST_PAGE_NUM_TX_OFF: usize = 44;
const FIRST_META_OFF: usize = 48;
const IDX_OFF: usize = 52;

/// Appends between periodic durability syncs
const SYNC_EVERY_N_TX: u32 = 500;

/// Total header size (both headers plus the page index) for a given
/// index capacity. Data records start at this offset.
pub fn header_size(max_pages: u32) -> usize {
    IDX_OFF + 4 * (max_pages as usize + 1)
}

/// An incremental read cursor over a byte range of one file.
///
/// The tail carries offsets rather than a borrowed view; bytes are
/// copied out through [`ReplicationFile::read_tail`] under the file's
/// read lock, so a tail can never observe an unmapped file.
#[derive(Debug, Clone)]
pub struct ReplicationTail {
    position: usize,
    limit: usize,
    /// The transaction id that would follow the last one in the range
    pub next_tx_id: u64,
    /// True once the owning file is full: no more data will ever arrive
    pub eof: bool,
}

impl ReplicationTail {
    /// True when all currently known data has been consumed
    pub fn is_drained(&self) -> bool {
        self.position >= self.limit
    }
}

enum Map {
    ReadWrite(MmapMut),
    ReadOnly(Mmap),
}

impl Map {
    fn as_slice(&self) -> &[u8] {
        match self {
            Map::ReadWrite(m) => m,
            Map::ReadOnly(m) => m,
        }
    }

    fn flush(&self) -> std::io::Result<()> {
        match self {
            Map::ReadWrite(m) => m.flush(),
            Map::ReadOnly(_) => Ok(()),
        }
    }
}

struct Inner {
    map: Option<Map>,
    file: File,
    /// Current append position (end of the last valid record)
    position: usize,
    num_full_pages: u32,
    last_page_num_tx: u32,
    last_modified: u64,
    /// Offset of the u32 field to patch when the next STREAM_INFO lands
    last_meta_ptr: usize,
    full: bool,
    sync_countdown: u32,
}

impl Inner {
    fn slice(&self) -> Result<&[u8]> {
        self.map
            .as_ref()
            .map(Map::as_slice)
            .ok_or_else(|| Error::Log("replication file is closed".into()))
    }

    fn slice_mut(&mut self) -> Result<&mut [u8]> {
        match self.map.as_mut() {
            Some(Map::ReadWrite(m)) => Ok(&mut m[..]),
            Some(Map::ReadOnly(_)) => Err(Error::Log("read-only replication file".into())),
            None => Err(Error::Log("replication file is closed".into())),
        }
    }

    fn read_u32(&self, off: usize) -> u32 {
        let buf = self.map.as_ref().unwrap().as_slice();
        u32::from_be_bytes(buf[off..off + 4].try_into().unwrap())
    }

    fn write_u32(&mut self, off: usize, value: u32) {
        if let Some(Map::ReadWrite(m)) = self.map.as_mut() {
            m[off..off + 4].copy_from_slice(&value.to_be_bytes());
        }
    }

    fn write_u64(&mut self, off: usize, value: u64) {
        if let Some(Map::ReadWrite(m)) = self.map.as_mut() {
            m[off..off + 8].copy_from_slice(&value.to_be_bytes());
        }
    }

    fn write_header2(&mut self) {
        self.write_u64(LAST_MOD_OFF, self.last_modified);
        self.write_u32(NUM_FULL_PAGES_OFF, self.num_full_pages);
        self.write_u32(LAST_PAGE_NUM_TX_OFF, self.last_page_num_tx);
    }
}

/// One contiguous append-only segment of the replication log
pub struct ReplicationFile {
    path: PathBuf,
    read_only: bool,
    first_tx_id: u64,
    page_size: u32,
    max_pages: u32,
    inner: RwLock<Inner>,
}

impl ReplicationFile {
    /// Create a new empty segment, preallocated to `max_file_size`.
    ///
    /// Refuses to overwrite an existing file. `max_file_size` must at
    /// least fit the header and one minimal record.
    pub fn create(
        path: &Path,
        first_tx_id: u64,
        page_size: u32,
        max_pages: u32,
        max_file_size: u64,
    ) -> Result<Self> {
        if page_size == 0 || max_pages == 0 {
            return Err(Error::Config(
                "page_size and max_pages must be positive".into(),
            ));
        }
        let data_start = header_size(max_pages);
        if (max_file_size as usize) < data_start + MIN_RECORD_LEN {
            return Err(Error::Config(format!(
                "max_file_size {} cannot fit the header ({} bytes for max_pages={}) plus one record",
                max_file_size, data_start, max_pages
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(max_file_size)?;
        let mut map = unsafe { MmapMut::map_mut(&file)? };

        map[0..8].copy_from_slice(SEGMENT_MAGIC);
        map[8..12].copy_from_slice(&SEGMENT_VERSION.to_be_bytes());
        map[12..20].copy_from_slice(&first_tx_id.to_be_bytes());
        map[20..24].copy_from_slice(&page_size.to_be_bytes());
        map[24..28].copy_from_slice(&max_pages.to_be_bytes());

        let mut inner = Inner {
            map: Some(Map::ReadWrite(map)),
            file,
            position: data_start,
            num_full_pages: 0,
            last_page_num_tx: 0,
            last_modified: chrono::Utc::now().timestamp_millis() as u64,
            last_meta_ptr: FIRST_META_OFF,
            full: false,
            sync_countdown: SYNC_EVERY_N_TX,
        };
        inner.write_header2();
        inner.write_u32(FIRST_META_OFF, 0);
        inner.write_u32(IDX_OFF, data_start as u32);
        for i in 1..=max_pages as usize {
            inner.write_u32(IDX_OFF + 4 * i, 0);
        }

        tracing::info!(
            "Created replication file {} page_size={} max_pages={}",
            path.display(),
            page_size,
            max_pages
        );
        Ok(Self {
            path: path.to_path_buf(),
            read_only: false,
            first_tx_id,
            page_size,
            max_pages,
            inner: RwLock::new(inner),
        })
    }

    /// Open an existing segment for append, recovering from an unclean
    /// shutdown: starting at the header's transaction count, records
    /// are re-adopted while their tx id sequence and CRC hold; the
    /// first failure marks the torn tail and the append position is
    /// reset there (the torn bytes are left in place).
    pub fn open_read_write(path: &Path, first_tx_id: u64, max_file_size: u64) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        if file.metadata()?.len() < max_file_size {
            file.set_len(max_file_size)?;
        }
        let map = unsafe { MmapMut::map_mut(&file)? };

        let (page_size, max_pages) = check_header1(path, &map, first_tx_id)?;
        let inner = Inner {
            position: 0,
            num_full_pages: u32::from_be_bytes(
                map[NUM_FULL_PAGES_OFF..NUM_FULL_PAGES_OFF + 4].try_into().unwrap(),
            ),
            last_page_num_tx: u32::from_be_bytes(
                map[LAST_PAGE_NUM_TX_OFF..LAST_PAGE_NUM_TX_OFF + 4].try_into().unwrap(),
            ),
            last_modified: u64::from_be_bytes(map[LAST_MOD_OFF..LAST_MOD_OFF + 8].try_into().unwrap()),
            last_meta_ptr: FIRST_META_OFF,
            full: false,
            sync_countdown: SYNC_EVERY_N_TX,
            map: Some(Map::ReadWrite(map)),
            file,
        };

        let rf = Self {
            path: path.to_path_buf(),
            read_only: false,
            first_tx_id,
            page_size,
            max_pages,
            inner: RwLock::new(inner.sanity_checked(path, page_size, max_pages)?),
        };
        rf.recover()?;

        let num_tx = rf.num_tx();
        tracing::info!(
            "Opened for append {} page_size={} max_pages={} num_tx={}",
            path.display(),
            page_size,
            max_pages,
            num_tx
        );
        Ok(rf)
    }

    /// Open an existing segment read-only. The file is reported as full
    /// so that tails built on it carry eof.
    pub fn open_read_only(path: &Path, first_tx_id: u64) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        let map = unsafe { Mmap::map(&file)? };

        let (page_size, max_pages) = check_header1(path, &map, first_tx_id)?;
        let inner = Inner {
            position: 0,
            num_full_pages: u32::from_be_bytes(
                map[NUM_FULL_PAGES_OFF..NUM_FULL_PAGES_OFF + 4].try_into().unwrap(),
            ),
            last_page_num_tx: u32::from_be_bytes(
                map[LAST_PAGE_NUM_TX_OFF..LAST_PAGE_NUM_TX_OFF + 4].try_into().unwrap(),
            ),
            last_modified: u64::from_be_bytes(map[LAST_MOD_OFF..LAST_MOD_OFF + 8].try_into().unwrap()),
            last_meta_ptr: FIRST_META_OFF,
            full: true,
            sync_countdown: SYNC_EVERY_N_TX,
            map: Some(Map::ReadOnly(map)),
            file,
        };

        let rf = Self {
            path: path.to_path_buf(),
            read_only: true,
            first_tx_id,
            page_size,
            max_pages,
            inner: RwLock::new(inner.sanity_checked(path, page_size, max_pages)?),
        };
        {
            // locate the append position from the recorded counts
            let mut inner = rf.inner.write().unwrap();
            let num_tx = inner.num_full_pages as u64 * page_size as u64 + inner.last_page_num_tx as u64;
            let pos = rf
                .position_of_locked(&inner, num_tx)?
                .ok_or_else(|| corrupted(path, "header counts beyond end of file"))?;
            inner.position = pos;
        }
        let num_tx = rf.num_tx();
        tracing::info!(
            "Opened read-only {} page_size={} max_pages={} num_tx={}",
            path.display(),
            page_size,
            max_pages,
            num_tx
        );
        Ok(rf)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn first_tx_id(&self) -> u64 {
        self.first_tx_id
    }

    /// Number of transactions currently in the file
    pub fn num_tx(&self) -> u64 {
        let inner = self.inner.read().unwrap();
        inner.num_full_pages as u64 * self.page_size as u64 + inner.last_page_num_tx as u64
    }

    /// The id the next appended transaction would get; equals
    /// `first_tx_id` for an empty file.
    pub fn next_tx_id(&self) -> u64 {
        self.first_tx_id + self.num_tx()
    }

    pub fn is_full(&self) -> bool {
        self.inner.read().unwrap().full
    }

    /// Append a transaction, returning its assigned id, or `None` once
    /// the file is full. A full file permanently rejects writes; the
    /// caller rotates to a new segment.
    pub fn append(&self, tx: &Transaction) -> Result<Option<u64>> {
        if self.read_only {
            return Err(Error::Log("cannot append to a read-only file".into()));
        }
        let mut inner = self.inner.write().unwrap();
        inner.slice()?; // closed check
        if inner.full {
            return Ok(None);
        }
        if inner.num_full_pages == self.max_pages {
            inner.full = true;
            self.do_sync(&mut inner)?;
            return Ok(None);
        }

        let num_tx =
            inner.num_full_pages as u64 * self.page_size as u64 + inner.last_page_num_tx as u64;
        let tx_id = self.first_tx_id + num_tx;
        let record = encode_record(tx, tx_id)?;

        let pos = inner.position;
        if pos + record.len() > inner.slice()?.len() {
            inner.full = true;
            self.do_sync(&mut inner)?;
            return Ok(None);
        }

        inner.slice_mut()?[pos..pos + record.len()].copy_from_slice(&record);
        if tx.is_metadata() {
            tracing::trace!(
                "Patching metadata pointer at {} to record at {}",
                inner.last_meta_ptr,
                pos
            );
            let ptr = inner.last_meta_ptr;
            inner.write_u32(ptr, pos as u32);
            inner.last_meta_ptr = pos + META_PTR_OFFSET;
        }

        inner.position = pos + record.len();
        inner.last_modified = chrono::Utc::now().timestamp_millis() as u64;
        inner.last_page_num_tx += 1;
        if inner.last_page_num_tx == self.page_size {
            inner.num_full_pages += 1;
            inner.last_page_num_tx = 0;
            let (n, end) = (inner.num_full_pages, inner.position);
            inner.write_u32(IDX_OFF + 4 * n as usize, end as u32);
            if inner.num_full_pages == self.max_pages {
                inner.full = true;
            }
        }

        tracing::trace!("Wrote transaction {} at position {}", tx_id, pos);
        inner.sync_countdown -= 1;
        if inner.sync_countdown == 0 || inner.full {
            self.do_sync(&mut inner)?;
        }
        Ok(Some(tx_id))
    }

    /// Build a read cursor starting exactly at `tx_id`, limited to the
    /// current append position.
    ///
    /// Errors if `tx_id` is below this file's first transaction;
    /// returns `None` if it is beyond the current append position. A
    /// returned tail may span zero transactions and still be used with
    /// [`get_new_data`](Self::get_new_data) later.
    pub fn tail(&self, tx_id: u64) -> Result<Option<ReplicationTail>> {
        if tx_id < self.first_tx_id {
            return Err(Error::InvalidTxId {
                tx_id,
                first_tx_id: self.first_tx_id,
            });
        }
        let inner = self.inner.read().unwrap();
        inner.slice()?;
        let pos = match self.position_of_locked(&inner, tx_id - self.first_tx_id)? {
            Some(p) => p,
            None => return Ok(None),
        };
        let num_tx =
            inner.num_full_pages as u64 * self.page_size as u64 + inner.last_page_num_tx as u64;
        Ok(Some(ReplicationTail {
            position: pos,
            limit: inner.position,
            next_tx_id: self.first_tx_id + num_tx,
            eof: inner.full,
        }))
    }

    /// Advance the tail's limit to the current append position and
    /// refresh `next_tx_id` and `eof` in place.
    pub fn get_new_data(&self, tail: &mut ReplicationTail) -> Result<()> {
        let inner = self.inner.read().unwrap();
        inner.slice()?;
        tail.limit = inner.position;
        let num_tx =
            inner.num_full_pages as u64 * self.page_size as u64 + inner.last_page_num_tx as u64;
        tail.next_tx_id = self.first_tx_id + num_tx;
        if inner.full {
            tail.eof = true;
        }
        Ok(())
    }

    /// Copy the unread bytes of the tail out of the mapping and advance
    /// the tail past them. Returns an empty buffer when drained.
    pub fn read_tail(&self, tail: &mut ReplicationTail) -> Result<Bytes> {
        let inner = self.inner.read().unwrap();
        let buf = inner.slice()?;
        if tail.is_drained() {
            return Ok(Bytes::new());
        }
        let bytes = Bytes::copy_from_slice(&buf[tail.position..tail.limit]);
        tail.position = tail.limit;
        Ok(bytes)
    }

    /// All STREAM_INFO records currently in the file, in write order,
    /// each a complete wire-ready record.
    pub fn metadata_records(&self) -> Result<Vec<Bytes>> {
        let inner = self.inner.read().unwrap();
        let buf = inner.slice()?;
        let mut records = Vec::new();
        let mut ptr = inner.read_u32(FIRST_META_OFF) as usize;
        while ptr != 0 {
            if ptr + MIN_RECORD_LEN > inner.position {
                return Err(corrupted(&self.path, "metadata pointer beyond append position"));
            }
            let hdr = decode_record_header(&buf[ptr..])?;
            if hdr.ttype != TX_STREAM_INFO || ptr + hdr.total_len() > inner.position {
                return Err(corrupted(&self.path, "metadata chain points at a non-metadata record"));
            }
            records.push(Bytes::copy_from_slice(&buf[ptr..ptr + hdr.total_len()]));
            ptr = inner.read_u32(ptr + META_PTR_OFFSET) as usize;
        }
        Ok(records)
    }

    /// Force file content to stable storage: data pages first, then the
    /// header, so the header never claims more than is persisted.
    pub fn sync(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let mut inner = self.inner.write().unwrap();
        if inner.map.is_none() {
            return Ok(());
        }
        self.do_sync(&mut inner)
    }

    /// Flush, release the mapping and shrink the file to its used size.
    /// Further operations on this instance fail.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if inner.map.is_none() {
            return Ok(());
        }
        if !self.read_only {
            inner.write_header2();
            if let Some(map) = &inner.map {
                map.flush()?;
            }
        }
        let position = inner.position;
        inner.map = None; // unmap before truncating
        if !self.read_only {
            inner.file.set_len(position as u64)?;
        }
        tracing::debug!("Closed replication file {}", self.path.display());
        Ok(())
    }

    fn do_sync(&self, inner: &mut Inner) -> Result<()> {
        if let Some(map) = &inner.map {
            map.flush()?;
        }
        inner.write_header2();
        if let Some(map) = &inner.map {
            map.flush()?;
        }
        inner.sync_countdown = SYNC_EVERY_N_TX;
        Ok(())
    }

    /// Byte offset of the `tx_num`th transaction, or `None` if it is
    /// beyond the current append position. Each skipped record is
    /// re-validated against the expected transaction id.
    pub fn position_of(&self, tx_num: u64) -> Result<Option<usize>> {
        let inner = self.inner.read().unwrap();
        inner.slice()?;
        self.position_of_locked(&inner, tx_num)
    }

    fn position_of_locked(&self, inner: &Inner, tx_num: u64) -> Result<Option<usize>> {
        let nfp = (tx_num / self.page_size as u64) as u32;
        let m = (tx_num % self.page_size as u64) as u32;
        if nfp > inner.num_full_pages || (nfp == inner.num_full_pages && m > inner.last_page_num_tx)
        {
            return Ok(None);
        }

        let mut pos = inner.read_u32(IDX_OFF + 4 * nfp as usize) as usize;
        let mut expected = self.first_tx_id + nfp as u64 * self.page_size as u64;
        for _ in 0..m {
            pos = self.skip_record(inner, pos, expected)?;
            expected += 1;
        }
        Ok(Some(pos))
    }

    fn skip_record(&self, inner: &Inner, pos: usize, expected_tx_id: u64) -> Result<usize> {
        let buf = inner.slice()?;
        if pos + MIN_RECORD_LEN > buf.len() {
            return Err(corrupted(&self.path, format!("record at offset {} truncated", pos)));
        }
        let hdr = decode_record_header(&buf[pos..])?;
        if hdr.tx_id != expected_tx_id {
            return Err(corrupted(
                &self.path,
                format!(
                    "at offset {} expected tx id {} but found {}",
                    pos, expected_tx_id, hdr.tx_id
                ),
            ));
        }
        Ok(pos + hdr.total_len())
    }

    /// Forward scan from the header's transaction count, adopting every
    /// record whose id sequence and CRC hold, rebuilding the page index
    /// and the metadata chain tail along the way.
    fn recover(&self) -> Result<()> {
        let mut inner = self.inner.write().unwrap();

        let num_tx =
            inner.num_full_pages as u64 * self.page_size as u64 + inner.last_page_num_tx as u64;
        inner.position = self
            .position_of_locked(&inner, num_tx)?
            .ok_or_else(|| corrupted(&self.path, "header counts beyond end of file"))?;
        if inner.num_full_pages == self.max_pages {
            inner.full = true;
        }

        let mut recovered = 0u64;
        while !inner.full {
            let pos = inner.position;
            let buf = inner.slice()?;
            if pos + MIN_RECORD_LEN > buf.len() {
                break;
            }
            let hdr = match decode_record_header(&buf[pos..]) {
                Ok(h) => h,
                Err(_) => break,
            };
            if hdr.ttype != TX_DATA && hdr.ttype != TX_STREAM_INFO {
                break;
            }
            let total = hdr.total_len();
            if total < MIN_RECORD_LEN || pos + total > buf.len() {
                break;
            }
            let expected = self.first_tx_id
                + inner.num_full_pages as u64 * self.page_size as u64
                + inner.last_page_num_tx as u64;
            if hdr.tx_id != expected || !verify_record(&buf[pos..pos + total]) {
                break;
            }

            inner.position = pos + total;
            inner.last_page_num_tx += 1;
            if inner.last_page_num_tx == self.page_size {
                inner.num_full_pages += 1;
                inner.last_page_num_tx = 0;
                let (n, end) = (inner.num_full_pages, inner.position);
                inner.write_u32(IDX_OFF + 4 * n as usize, end as u32);
                if inner.num_full_pages == self.max_pages {
                    inner.full = true;
                }
            }
            recovered += 1;
        }

        if recovered > 0 {
            tracing::warn!(
                "Recovered {} transactions past the last header flush in {}",
                recovered,
                self.path.display()
            );
        }

        // Re-locate the metadata chain tail; a pointer into the
        // abandoned region past the append position is dangling from a
        // torn metadata write and is zeroed.
        let mut ptr_field = FIRST_META_OFF;
        loop {
            let next = inner.read_u32(ptr_field) as usize;
            if next == 0 {
                break;
            }
            if next >= inner.position {
                tracing::warn!(
                    "Zeroing dangling metadata pointer into the abandoned tail of {}",
                    self.path.display()
                );
                inner.write_u32(ptr_field, 0);
                break;
            }
            ptr_field = next + META_PTR_OFFSET;
        }
        inner.last_meta_ptr = ptr_field;

        inner.write_header2();
        Ok(())
    }
}

impl Inner {
    fn sanity_checked(self, path: &Path, page_size: u32, max_pages: u32) -> Result<Inner> {
        if self.num_full_pages > max_pages || self.last_page_num_tx >= page_size {
            return Err(corrupted(
                path,
                format!(
                    "implausible header counts: num_full_pages={} last_page_num_tx={}",
                    self.num_full_pages, self.last_page_num_tx
                ),
            ));
        }
        Ok(self)
    }
}

fn check_header1(path: &Path, map: &[u8], first_tx_id: u64) -> Result<(u32, u32)> {
    if map.len() < IDX_OFF + 4 {
        return Err(corrupted(path, "file smaller than the fixed header"));
    }
    if &map[0..8] != SEGMENT_MAGIC {
        return Err(corrupted(
            path,
            format!("bad magic {:02x?}, expected {:02x?}", &map[0..8], SEGMENT_MAGIC),
        ));
    }
    let version = u32::from_be_bytes(map[8..12].try_into().unwrap());
    if version != SEGMENT_VERSION {
        return Err(corrupted(
            path,
            format!("unsupported version {}, expected {}", version, SEGMENT_VERSION),
        ));
    }
    let id = u64::from_be_bytes(map[12..20].try_into().unwrap());
    if id != first_tx_id {
        return Err(corrupted(
            path,
            format!("first tx id {} does not match the file name ({})", id, first_tx_id),
        ));
    }
    let page_size = u32::from_be_bytes(map[20..24].try_into().unwrap());
    let max_pages = u32::from_be_bytes(map[24..28].try_into().unwrap());
    if page_size == 0 || max_pages == 0 || map.len() < header_size(max_pages) {
        return Err(corrupted(
            path,
            format!("implausible page_size={} max_pages={}", page_size, max_pages),
        ));
    }
    Ok((page_size, max_pages))
}

fn corrupted(path: &Path, reason: impl Into<String>) -> Error {
    Error::Corrupted {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::DataType;
    use crate::txlog::transaction::{ColumnInfo, StreamSchema};
    use std::io::{Seek, SeekFrom, Write};
    use tempfile::tempdir;

    const TEST_FILE_SIZE: u64 = 64 * 1024;

    fn data_tx(n: u8) -> Transaction {
        Transaction::Data {
            origin_id: 1,
            payload: Bytes::from(vec![n; 16]),
        }
    }

    fn schema_tx() -> Transaction {
        Transaction::StreamInfo {
            origin_id: 1,
            schema: StreamSchema {
                id: 0,
                name: "tm_realtime".to_string(),
                columns: vec![ColumnInfo {
                    id: 0,
                    name: "gentime".to_string(),
                    dtype: DataType::Long,
                }],
            },
        }
    }

    /// Overwrite the mutable header counts, as if the process died
    /// before the last header flush.
    fn set_header_counts(path: &Path, num_full_pages: u32, last_page_num_tx: u32) {
        let mut f = OpenOptions::new().write(true).open(path).unwrap();
        f.seek(SeekFrom::Start(NUM_FULL_PAGES_OFF as u64)).unwrap();
        f.write_all(&num_full_pages.to_be_bytes()).unwrap();
        f.write_all(&last_page_num_tx.to_be_bytes()).unwrap();
    }

    fn flip_bit(path: &Path, offset: u64) {
        let mut f = OpenOptions::new().read(true).write(true).open(path).unwrap();
        let mut b = [0u8; 1];
        f.seek(SeekFrom::Start(offset)).unwrap();
        std::io::Read::read_exact(&mut f, &mut b).unwrap();
        f.seek(SeekFrom::Start(offset)).unwrap();
        f.write_all(&[b[0] ^ 0x01]).unwrap();
    }

    #[test]
    fn test_sequential_ids_until_full() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.dat");
        // capacity = page_size * max_pages = 6
        let rf = ReplicationFile::create(&path, 100, 2, 3, TEST_FILE_SIZE).unwrap();

        for i in 0..6u64 {
            assert_eq!(rf.append(&data_tx(i as u8)).unwrap(), Some(100 + i));
        }
        assert!(rf.is_full());
        assert_eq!(rf.append(&data_tx(99)).unwrap(), None);
        assert_eq!(rf.append(&data_tx(99)).unwrap(), None);
        assert_eq!(rf.num_tx(), 6);
        assert_eq!(rf.next_tx_id(), 106);
    }

    #[test]
    fn test_create_rejects_tiny_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.dat");
        let result = ReplicationFile::create(&path, 0, 500, 500, 64);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_create_refuses_overwrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.dat");
        ReplicationFile::create(&path, 0, 2, 2, TEST_FILE_SIZE).unwrap();
        assert!(ReplicationFile::create(&path, 0, 2, 2, TEST_FILE_SIZE).is_err());
    }

    #[test]
    fn test_round_trip_via_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.dat");
        let rf = ReplicationFile::create(&path, 0, 3, 10, TEST_FILE_SIZE).unwrap();

        let mut expected = Vec::new();
        for i in 0..5u8 {
            let tx = data_tx(i);
            expected.push(encode_record(&tx, i as u64).unwrap());
            rf.append(&tx).unwrap();
        }

        let mut tail = rf.tail(0).unwrap().unwrap();
        assert!(!tail.eof);
        let bytes = rf.read_tail(&mut tail).unwrap();

        let mut off = 0;
        for rec in &expected {
            assert_eq!(&bytes[off..off + rec.len()], &rec[..]);
            off += rec.len();
        }
        assert_eq!(off, bytes.len());
        assert!(tail.is_drained());

        // more data arrives; the same tail picks it up in place
        rf.append(&data_tx(5)).unwrap();
        rf.get_new_data(&mut tail).unwrap();
        assert!(!tail.is_drained());
        assert_eq!(tail.next_tx_id, 6);
        let more = rf.read_tail(&mut tail).unwrap();
        let hdr = decode_record_header(&more).unwrap();
        assert_eq!(hdr.tx_id, 5);
    }

    #[test]
    fn test_empty_tail_is_valid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.dat");
        let rf = ReplicationFile::create(&path, 10, 2, 2, TEST_FILE_SIZE).unwrap();

        let tail = rf.tail(10).unwrap().unwrap();
        assert!(tail.is_drained());
        assert!(!tail.eof);
        assert_eq!(tail.next_tx_id, 10);

        // a tx id beyond the append position is not available
        assert!(rf.tail(11).unwrap().is_none());
        // below the first tx id is an error
        assert!(rf.tail(9).is_err());
    }

    #[test]
    fn test_position_of_decodes_expected_ids() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.dat");
        let rf = ReplicationFile::create(&path, 50, 3, 5, TEST_FILE_SIZE).unwrap();
        for i in 0..10u8 {
            rf.append(&data_tx(i)).unwrap();
        }

        let mut tail = rf.tail(50).unwrap().unwrap();
        let all = rf.read_tail(&mut tail).unwrap();
        for tx_num in 0..10u64 {
            let pos = rf.position_of(tx_num).unwrap().unwrap();
            let data_start = header_size(5);
            let hdr = decode_record_header(&all[pos - data_start..]).unwrap();
            assert_eq!(hdr.tx_id, 50 + tx_num);
        }
        assert!(rf.position_of(11).unwrap().is_none());
    }

    #[test]
    fn test_zero_transaction_file_reopens() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.dat");
        let rf = ReplicationFile::create(&path, 0, 2, 2, TEST_FILE_SIZE).unwrap();
        rf.close().unwrap();

        let rf = ReplicationFile::open_read_write(&path, 0, TEST_FILE_SIZE).unwrap();
        assert_eq!(rf.num_tx(), 0);
        assert_eq!(rf.append(&data_tx(0)).unwrap(), Some(0));
    }

    #[test]
    fn test_open_detects_bad_magic_and_wrong_id() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.dat");
        let rf = ReplicationFile::create(&path, 7, 2, 2, TEST_FILE_SIZE).unwrap();
        rf.close().unwrap();

        assert!(matches!(
            ReplicationFile::open_read_write(&path, 8, TEST_FILE_SIZE),
            Err(Error::Corrupted { .. })
        ));

        flip_bit(&path, 0);
        assert!(matches!(
            ReplicationFile::open_read_write(&path, 7, TEST_FILE_SIZE),
            Err(Error::Corrupted { .. })
        ));
    }

    #[test]
    fn test_recovery_adopts_records_past_header_flush() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.dat");
        let rf = ReplicationFile::create(&path, 0, 100, 4, TEST_FILE_SIZE).unwrap();
        for i in 0..5u8 {
            rf.append(&data_tx(i)).unwrap();
        }
        rf.close().unwrap();

        // pretend the header was last flushed after 2 transactions
        set_header_counts(&path, 0, 2);
        let rf = ReplicationFile::open_read_write(&path, 0, TEST_FILE_SIZE).unwrap();
        assert_eq!(rf.num_tx(), 5);
        assert_eq!(rf.append(&data_tx(5)).unwrap(), Some(5));
    }

    #[test]
    fn test_recovery_truncates_at_torn_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.dat");
        let rf = ReplicationFile::create(&path, 0, 100, 4, TEST_FILE_SIZE).unwrap();
        let mut offsets = Vec::new();
        for i in 0..5u8 {
            offsets.push(rf.position_of(i as u64).unwrap().unwrap());
            rf.append(&data_tx(i)).unwrap();
        }
        rf.close().unwrap();

        // header never flushed after the first write; record 3 torn
        set_header_counts(&path, 0, 1);
        flip_bit(&path, offsets[3] as u64 + RECORD_HEADER_LEN_PLUS_2);
        let rf = ReplicationFile::open_read_write(&path, 0, TEST_FILE_SIZE).unwrap();
        assert_eq!(rf.num_tx(), 3);

        // the torn tail is logically gone; appends continue from tx 3
        assert_eq!(rf.append(&data_tx(42)).unwrap(), Some(3));
    }

    const RECORD_HEADER_LEN_PLUS_2: u64 = (MIN_RECORD_LEN + 2) as u64;

    #[test]
    fn test_crc_flip_truncates_exactly_at_flipped_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.dat");
        let rf = ReplicationFile::create(&path, 0, 100, 4, TEST_FILE_SIZE).unwrap();
        let mut offsets = Vec::new();
        for i in 0..4u8 {
            offsets.push(rf.position_of(i as u64).unwrap().unwrap());
            rf.append(&data_tx(i)).unwrap();
        }
        rf.close().unwrap();

        set_header_counts(&path, 0, 0);
        // flip one payload bit of record 2
        flip_bit(&path, offsets[2] as u64 + RECORD_HEADER_LEN_PLUS_2);

        let rf = ReplicationFile::open_read_write(&path, 0, TEST_FILE_SIZE).unwrap();
        assert_eq!(rf.num_tx(), 2);
        let mut tail = rf.tail(0).unwrap().unwrap();
        let bytes = rf.read_tail(&mut tail).unwrap();
        let hdr = decode_record_header(&bytes).unwrap();
        assert_eq!(hdr.tx_id, 0);
        assert!(verify_record(&bytes[..hdr.total_len()]));
    }

    #[test]
    fn test_metadata_chain() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.dat");
        let rf = ReplicationFile::create(&path, 0, 3, 10, TEST_FILE_SIZE).unwrap();

        rf.append(&schema_tx()).unwrap(); // tx 0
        rf.append(&data_tx(1)).unwrap(); // tx 1
        rf.append(&schema_tx()).unwrap(); // tx 2
        rf.append(&data_tx(3)).unwrap(); // tx 3

        let meta = rf.metadata_records().unwrap();
        assert_eq!(meta.len(), 2);
        assert_eq!(decode_record_header(&meta[0]).unwrap().tx_id, 0);
        assert_eq!(decode_record_header(&meta[1]).unwrap().tx_id, 2);
        for m in &meta {
            assert!(verify_record(m));
        }
        rf.close().unwrap();

        // the chain survives reopen, and new metadata extends it
        let rf = ReplicationFile::open_read_write(&path, 0, TEST_FILE_SIZE).unwrap();
        rf.append(&schema_tx()).unwrap(); // tx 4
        let meta = rf.metadata_records().unwrap();
        assert_eq!(meta.len(), 3);
        assert_eq!(decode_record_header(&meta[2]).unwrap().tx_id, 4);
    }

    #[test]
    fn test_read_only_open_reports_eof() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.dat");
        let rf = ReplicationFile::create(&path, 0, 2, 2, TEST_FILE_SIZE).unwrap();
        rf.append(&data_tx(0)).unwrap();
        rf.append(&data_tx(1)).unwrap();
        rf.close().unwrap();

        let rf = ReplicationFile::open_read_only(&path, 0).unwrap();
        assert_eq!(rf.num_tx(), 2);
        assert!(rf.is_full());
        let tail = rf.tail(0).unwrap().unwrap();
        assert!(tail.eof);
        assert!(rf.append(&data_tx(2)).is_err());
    }

    #[test]
    fn test_closed_file_rejects_operations() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.dat");
        let rf = ReplicationFile::create(&path, 0, 2, 2, TEST_FILE_SIZE).unwrap();
        rf.append(&data_tx(0)).unwrap();
        rf.close().unwrap();
        assert!(rf.append(&data_tx(1)).is_err());
        assert!(rf.tail(0).is_err());
        // file was truncated to its used size on close
        let len = std::fs::metadata(&path).unwrap().len();
        assert!(len < TEST_FILE_SIZE);
    }
}
