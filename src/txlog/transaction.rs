//! Transaction Records
//!
//! The in-memory representation of one log entry and its binary record
//! contract. Record bytes in the file are identical to DATA/STREAM_INFO
//! frames on the wire, so the master can replay file ranges to the
//! network without re-encoding.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::stream::DataType;

/// Record/message type byte for stream schema records
pub const TX_STREAM_INFO: u8 = 3;
/// Record/message type byte for data records
pub const TX_DATA: u8 = 4;

/// Fixed bytes before the payload: tag(4) + origin_id(4) + tx_id(8)
pub const RECORD_HEADER_LEN: usize = 16;
/// Smallest possible record: header + trailing CRC
pub const MIN_RECORD_LEN: usize = RECORD_HEADER_LEN + 4;
/// Offset of the next-metadata pointer within a STREAM_INFO record
pub const META_PTR_OFFSET: usize = RECORD_HEADER_LEN;

/// Schema description of one column in a replicated stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub id: u32,
    pub name: String,
    pub dtype: DataType,
}

/// Self-describing schema of one replicated stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSchema {
    pub id: u32,
    pub name: String,
    pub columns: Vec<ColumnInfo>,
}

/// One append unit of the replication log
#[derive(Debug, Clone)]
pub enum Transaction {
    Data { origin_id: u32, payload: Bytes },
    StreamInfo { origin_id: u32, schema: StreamSchema },
}

impl Transaction {
    pub fn type_byte(&self) -> u8 {
        match self {
            Transaction::Data { .. } => TX_DATA,
            Transaction::StreamInfo { .. } => TX_STREAM_INFO,
        }
    }

    pub fn origin_id(&self) -> u32 {
        match self {
            Transaction::Data { origin_id, .. } | Transaction::StreamInfo { origin_id, .. } => {
                *origin_id
            }
        }
    }

    /// STREAM_INFO records are linked into the per-file metadata chain
    pub fn is_metadata(&self) -> bool {
        matches!(self, Transaction::StreamInfo { .. })
    }

    /// Marshal the variant payload (the bytes after the record header)
    pub fn marshal_payload(&self) -> Result<Bytes> {
        match self {
            Transaction::Data { payload, .. } => Ok(payload.clone()),
            Transaction::StreamInfo { schema, .. } => {
                Ok(Bytes::from(bincode::serialize(schema)?))
            }
        }
    }
}

/// Decoded fixed header of a stored record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub ttype: u8,
    /// Size of everything after the tag (3-byte field)
    pub size: u32,
    pub origin_id: u32,
    pub tx_id: u64,
}

impl RecordHeader {
    /// Total record length including the tag
    pub fn total_len(&self) -> usize {
        4 + self.size as usize
    }

    pub fn is_metadata(&self) -> bool {
        self.ttype == TX_STREAM_INFO
    }
}

/// Encode a full record. The next-metadata pointer of a STREAM_INFO
/// record is written as 0; the file patches it in place when a later
/// STREAM_INFO arrives. Returns an error if the payload exceeds the
/// 3-byte size field.
pub fn encode_record(tx: &Transaction, tx_id: u64) -> Result<Bytes> {
    let payload = tx.marshal_payload()?;
    let meta_len = if tx.is_metadata() { 4 } else { 0 };
    // origin + tx_id + optional meta pointer + payload + crc
    let size = 4 + 8 + meta_len + payload.len() + 4;
    if size > 0x00FF_FFFF {
        return Err(Error::Log(format!(
            "transaction payload of {} bytes exceeds the record size field",
            payload.len()
        )));
    }

    let mut buf = BytesMut::with_capacity(4 + size);
    buf.put_u32(((tx.type_byte() as u32) << 24) | size as u32);
    buf.put_u32(tx.origin_id());
    buf.put_u64(tx_id);
    if tx.is_metadata() {
        buf.put_u32(0);
    }
    buf.put_slice(&payload);
    buf.put_u32(record_crc(&buf, tx.is_metadata()));
    Ok(buf.freeze())
}

/// CRC32 over tag + origin_id + tx_id + payload.
///
/// The next-metadata pointer of STREAM_INFO records is excluded because
/// it is patched after the record is written; the trailing CRC field
/// itself is excluded as well. `record` may or may not already carry
/// the 4 CRC bytes; they are ignored when present.
pub fn record_crc(record: &[u8], is_metadata: bool) -> u32 {
    let size = (u32::from_be_bytes(record[0..4].try_into().unwrap()) & 0x00FF_FFFF) as usize;
    let end = 4 + size - 4; // payload end, before the crc field
    let payload_start = RECORD_HEADER_LEN + if is_metadata { 4 } else { 0 };
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&record[..RECORD_HEADER_LEN]);
    hasher.update(&record[payload_start..end.min(record.len())]);
    hasher.finalize()
}

/// Decode the fixed record header from the start of `buf`
pub fn decode_record_header(buf: &[u8]) -> Result<RecordHeader> {
    if buf.len() < RECORD_HEADER_LEN {
        return Err(Error::Decode("record header truncated".into()));
    }
    let tag = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    Ok(RecordHeader {
        ttype: (tag >> 24) as u8,
        size: tag & 0x00FF_FFFF,
        origin_id: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
        tx_id: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
    })
}

/// Verify a complete record: plausible type and size, CRC match
pub fn verify_record(record: &[u8]) -> bool {
    if record.len() < MIN_RECORD_LEN {
        return false;
    }
    let hdr = match decode_record_header(record) {
        Ok(h) => h,
        Err(_) => return false,
    };
    if hdr.ttype != TX_DATA && hdr.ttype != TX_STREAM_INFO {
        return false;
    }
    if hdr.total_len() > record.len()
        || hdr.total_len() < MIN_RECORD_LEN + if hdr.is_metadata() { 4 } else { 0 }
    {
        return false;
    }
    let record = &record[..hdr.total_len()];
    let stored = u32::from_be_bytes(record[record.len() - 4..].try_into().unwrap());
    stored == record_crc(record, hdr.is_metadata())
}

/// Decode a STREAM_INFO payload back into a schema
pub fn decode_schema(mut payload: impl Buf) -> Result<StreamSchema> {
    let mut data = vec![0u8; payload.remaining()];
    payload.copy_to_slice(&mut data);
    Ok(bincode::deserialize(&data)?)
}
