//! Replication Transaction Log
//!
//! Append-only, memory-mapped, paged segment files plus the
//! reference-counted handles that manage their lifecycle.

pub mod transaction;
mod file;
mod handle;

pub use file::{header_size, ReplicationFile, ReplicationTail};
pub use handle::LogFileHandle;
pub use transaction::{ColumnInfo, StreamSchema, Transaction};

use std::io;
use std::path::{Path, PathBuf};

/// Segment file name prefix; full name is `RPL_<first_tx_id:16 hex>.dat`
pub const RPL_FILENAME_PREFIX: &str = "RPL";

/// Path of the segment starting at `first_tx_id`
pub fn segment_path(dir: &Path, first_tx_id: u64) -> PathBuf {
    dir.join(format!("{}_{:016x}.dat", RPL_FILENAME_PREFIX, first_tx_id))
}

/// Parse a segment file name back into its first transaction id
pub fn parse_segment_name(name: &str) -> Option<u64> {
    let hex = name
        .strip_prefix(RPL_FILENAME_PREFIX)?
        .strip_prefix('_')?
        .strip_suffix(".dat")?;
    if hex.len() != 16 {
        return None;
    }
    u64::from_str_radix(hex, 16).ok()
}

/// List all segment files in a directory, ordered by first transaction id
pub fn scan_segments(dir: &Path) -> io::Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    if !dir.exists() {
        return Ok(segments);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if let Some(first_tx_id) = parse_segment_name(name) {
                segments.push((first_tx_id, path));
            }
        }
    }
    segments.sort_by_key(|(id, _)| *id);
    Ok(segments)
}
