//! Replication Protocol
//!
//! Message types exchanged between master and slave, sharing one
//! envelope with the on-disk record format:
//!
//! ```text
//! [type: u8][length: u24 BE][body][crc32: u32 BE]
//! ```
//!
//! `length` counts everything after itself, including the CRC. DATA and
//! STREAM_INFO bodies carry the origin id and transaction id up front
//! because those frames are stored verbatim in the replication file and
//! replayed to the network without re-encoding; control bodies
//! (WAKEUP/REQUEST/RESPONSE/TIME) are bincode-encoded structs.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::txlog::transaction::{decode_schema, record_crc, StreamSchema, TX_DATA, TX_STREAM_INFO};

pub const MSG_WAKEUP: u8 = 0;
pub const MSG_REQUEST: u8 = 1;
pub const MSG_RESPONSE: u8 = 2;
pub const MSG_STREAM_INFO: u8 = TX_STREAM_INFO;
pub const MSG_DATA: u8 = TX_DATA;
pub const MSG_TIME: u8 = 5;

/// Envelope bytes before the body: type + 3-byte length
pub const FRAME_HEADER_LEN: usize = 4;

/// Sent by a slave (or relayed after a WAKEUP) to start streaming
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub instance: String,
    pub request_seq: u32,
    /// Absent means "from the beginning"
    pub start_tx_id: Option<u64>,
}

/// Result of a request; non-zero `result` carries an error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub request_seq: u32,
    pub result: i32,
    pub error_msg: Option<String>,
}

/// Sent by a master in TCP-client role to wake the slave's server side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wakeup {
    pub instance: String,
}

/// Periodic master time, doubling as a liveness signal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeMessage {
    pub unix_ms: i64,
}

/// A decoded DATA or STREAM_INFO frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionFrame {
    pub ttype: u8,
    pub origin_id: u32,
    pub tx_id: u64,
    pub payload: Bytes,
}

impl TransactionFrame {
    /// Decode the payload of a STREAM_INFO frame into a schema
    pub fn schema(&self) -> Result<StreamSchema> {
        decode_schema(self.payload.clone())
    }
}

/// One wire message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Wakeup(Wakeup),
    Request(Request),
    Response(Response),
    StreamInfo(TransactionFrame),
    Data(TransactionFrame),
    Time(TimeMessage),
}

impl Message {
    pub fn type_byte(&self) -> u8 {
        match self {
            Message::Wakeup(_) => MSG_WAKEUP,
            Message::Request(_) => MSG_REQUEST,
            Message::Response(_) => MSG_RESPONSE,
            Message::StreamInfo(_) => MSG_STREAM_INFO,
            Message::Data(_) => MSG_DATA,
            Message::Time(_) => MSG_TIME,
        }
    }

    /// Message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Wakeup(_) => "WAKEUP",
            Message::Request(_) => "REQUEST",
            Message::Response(_) => "RESPONSE",
            Message::StreamInfo(_) => "STREAM_INFO",
            Message::Data(_) => "DATA",
            Message::Time(_) => "TIME",
        }
    }

    /// Encode into a complete frame, CRC included
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(64);
        match self {
            Message::Wakeup(m) => encode_control(&mut buf, MSG_WAKEUP, m)?,
            Message::Request(m) => encode_control(&mut buf, MSG_REQUEST, m)?,
            Message::Response(m) => encode_control(&mut buf, MSG_RESPONSE, m)?,
            Message::Time(m) => encode_control(&mut buf, MSG_TIME, m)?,
            Message::Data(f) | Message::StreamInfo(f) => {
                let meta_len = if f.ttype == MSG_STREAM_INFO { 4 } else { 0 };
                let size = 4 + 8 + meta_len + f.payload.len() + 4;
                if size > 0x00FF_FFFF {
                    return Err(Error::Decode("frame exceeds the 3-byte length field".into()));
                }
                buf.put_u32(((f.ttype as u32) << 24) | size as u32);
                buf.put_u32(f.origin_id);
                buf.put_u64(f.tx_id);
                if meta_len > 0 {
                    buf.put_u32(0);
                }
                buf.put_slice(&f.payload);
                let crc = record_crc(&buf, f.ttype == MSG_STREAM_INFO);
                buf.put_u32(crc);
            }
        }
        Ok(buf.freeze())
    }

    /// Decode and CRC-check a complete frame
    pub fn decode(frame: &[u8]) -> Result<Message> {
        if frame.len() < FRAME_HEADER_LEN + 4 {
            return Err(Error::Decode(format!("frame of {} bytes too short", frame.len())));
        }
        let tag = u32::from_be_bytes(frame[0..4].try_into().unwrap());
        let ttype = (tag >> 24) as u8;
        let size = (tag & 0x00FF_FFFF) as usize;
        if 4 + size != frame.len() {
            return Err(Error::Decode(format!(
                "declared length {} does not match frame of {} bytes",
                size,
                frame.len()
            )));
        }

        let stored = u32::from_be_bytes(frame[frame.len() - 4..].try_into().unwrap());
        let computed = if ttype == MSG_STREAM_INFO {
            if frame.len() < 24 {
                return Err(Error::Decode("STREAM_INFO frame too short".into()));
            }
            record_crc(frame, true)
        } else {
            crc32fast::hash(&frame[..frame.len() - 4])
        };
        if stored != computed {
            return Err(Error::Decode(format!(
                "CRC mismatch: stored {:08x}, computed {:08x}",
                stored, computed
            )));
        }

        let body = &frame[FRAME_HEADER_LEN..frame.len() - 4];
        match ttype {
            MSG_WAKEUP => Ok(Message::Wakeup(bincode::deserialize(body)?)),
            MSG_REQUEST => Ok(Message::Request(bincode::deserialize(body)?)),
            MSG_RESPONSE => Ok(Message::Response(bincode::deserialize(body)?)),
            MSG_TIME => Ok(Message::Time(bincode::deserialize(body)?)),
            MSG_DATA | MSG_STREAM_INFO => {
                let fixed = 4 + 8 + if ttype == MSG_STREAM_INFO { 4 } else { 0 };
                if body.len() < fixed {
                    return Err(Error::Decode("transaction frame body too short".into()));
                }
                let frame = TransactionFrame {
                    ttype,
                    origin_id: u32::from_be_bytes(body[0..4].try_into().unwrap()),
                    tx_id: u64::from_be_bytes(body[4..12].try_into().unwrap()),
                    payload: Bytes::copy_from_slice(&body[fixed..]),
                };
                if ttype == MSG_DATA {
                    Ok(Message::Data(frame))
                } else {
                    Ok(Message::StreamInfo(frame))
                }
            }
            other => Err(Error::Decode(format!("unknown message type {}", other))),
        }
    }
}

fn encode_control<T: Serialize>(buf: &mut BytesMut, ttype: u8, body: &T) -> Result<()> {
    let encoded = bincode::serialize(body)?;
    let size = encoded.len() + 4;
    if size > 0x00FF_FFFF {
        return Err(Error::Decode("frame exceeds the 3-byte length field".into()));
    }
    buf.put_u32(((ttype as u32) << 24) | size as u32);
    buf.put_slice(&encoded);
    let crc = crc32fast::hash(buf);
    buf.put_u32(crc);
    Ok(())
}
