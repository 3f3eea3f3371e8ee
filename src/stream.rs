//! Stream and Tuple Model
//!
//! The narrow data-plane interface the replication core works against:
//! typed column values, tuple definitions, and named streams that fan
//! tuples out to subscribers. The column codec here defines the byte
//! layout of DATA transaction payloads.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Marks the end of the column list in a DATA payload
pub const COLUMN_EOF: u32 = 0xFFFF_FFFF;

/// Column data types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Int,
    Long,
    Double,
    String,
    Binary,
    Timestamp,
}

impl DataType {
    /// Stable numeric id used in column tags and stream schemas
    pub fn type_id(&self) -> u8 {
        match self {
            DataType::Boolean => 1,
            DataType::Int => 2,
            DataType::Long => 3,
            DataType::Double => 4,
            DataType::String => 5,
            DataType::Binary => 6,
            DataType::Timestamp => 7,
        }
    }

    /// Look up a type by its numeric id
    pub fn from_type_id(id: u8) -> Option<DataType> {
        match id {
            1 => Some(DataType::Boolean),
            2 => Some(DataType::Int),
            3 => Some(DataType::Long),
            4 => Some(DataType::Double),
            5 => Some(DataType::String),
            6 => Some(DataType::Binary),
            7 => Some(DataType::Timestamp),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A single column value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Boolean(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    String(String),
    Binary(Vec<u8>),
    /// Milliseconds since the Unix epoch
    Timestamp(i64),
}

impl Value {
    /// The data type this value serializes as
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Boolean(_) => DataType::Boolean,
            Value::Int(_) => DataType::Int,
            Value::Long(_) => DataType::Long,
            Value::Double(_) => DataType::Double,
            Value::String(_) => DataType::String,
            Value::Binary(_) => DataType::Binary,
            Value::Timestamp(_) => DataType::Timestamp,
        }
    }
}

/// Encode one value in network byte order
pub fn encode_value(buf: &mut BytesMut, value: &Value) {
    match value {
        Value::Boolean(b) => buf.put_u8(*b as u8),
        Value::Int(v) => buf.put_i32(*v),
        Value::Long(v) => buf.put_i64(*v),
        Value::Double(v) => buf.put_f64(*v),
        Value::String(s) => {
            buf.put_u32(s.len() as u32);
            buf.put_slice(s.as_bytes());
        }
        Value::Binary(b) => {
            buf.put_u32(b.len() as u32);
            buf.put_slice(b);
        }
        Value::Timestamp(v) => buf.put_i64(*v),
    }
}

/// Decode one value of the given type
pub fn decode_value(buf: &mut impl Buf, dtype: DataType) -> Result<Value> {
    let need = match dtype {
        DataType::Boolean => 1,
        DataType::Int => 4,
        DataType::Long | DataType::Double | DataType::Timestamp => 8,
        DataType::String | DataType::Binary => 4,
    };
    if buf.remaining() < need {
        return Err(Error::Decode(format!(
            "truncated {} value: {} bytes remaining",
            dtype,
            buf.remaining()
        )));
    }
    let value = match dtype {
        DataType::Boolean => Value::Boolean(buf.get_u8() != 0),
        DataType::Int => Value::Int(buf.get_i32()),
        DataType::Long => Value::Long(buf.get_i64()),
        DataType::Double => Value::Double(buf.get_f64()),
        DataType::Timestamp => Value::Timestamp(buf.get_i64()),
        DataType::String | DataType::Binary => {
            let len = buf.get_u32() as usize;
            if buf.remaining() < len {
                return Err(Error::Decode(format!(
                    "truncated {} value: need {} bytes, {} remaining",
                    dtype,
                    len,
                    buf.remaining()
                )));
            }
            let mut data = vec![0u8; len];
            buf.copy_to_slice(&mut data);
            if dtype == DataType::String {
                Value::String(String::from_utf8(data).map_err(|e| Error::Decode(e.to_string()))?)
            } else {
                Value::Binary(data)
            }
        }
    };
    Ok(value)
}

/// Definition of a single column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    pub dtype: DataType,
}

impl ColumnDefinition {
    pub fn new(name: impl Into<String>, dtype: DataType) -> Self {
        Self {
            name: name.into(),
            dtype,
        }
    }
}

/// Ordered list of column definitions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TupleDefinition {
    columns: Vec<ColumnDefinition>,
}

impl TupleDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_column(&mut self, cd: ColumnDefinition) {
        self.columns.push(cd);
    }

    /// Index of a column by name, or None if not present
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column(&self, idx: usize) -> Option<&ColumnDefinition> {
        self.columns.get(idx)
    }

    pub fn columns(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// One tuple: a definition plus a value per column
///
/// A value may be absent; absent columns are not serialized.
#[derive(Debug, Clone, PartialEq)]
pub struct Tuple {
    pub definition: TupleDefinition,
    pub values: Vec<Option<Value>>,
}

impl Tuple {
    pub fn new(definition: TupleDefinition, values: Vec<Option<Value>>) -> Self {
        debug_assert_eq!(definition.len(), values.len());
        Self { definition, values }
    }

    /// Look up a value by column name
    pub fn value(&self, name: &str) -> Option<&Value> {
        let idx = self.definition.column_index(name)?;
        self.values.get(idx)?.as_ref()
    }
}

/// Serialize a tuple into a DATA transaction payload.
///
/// Column indices refer to `complete`, the union of all columns seen on
/// the stream so far, so that the receiver can resolve them against the
/// matching STREAM_INFO schema.
pub fn serialize_tuple(stream_id: u32, tuple: &Tuple, complete: &TupleDefinition) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u32(stream_id);
    for (i, value) in tuple.values.iter().enumerate() {
        let value = match value {
            Some(v) => v,
            None => continue,
        };
        let cd = tuple
            .definition
            .column(i)
            .ok_or_else(|| Error::Log("tuple value without column definition".into()))?;
        let cidx = complete.column_index(&cd.name).ok_or_else(|| {
            Error::Log(format!("column {} missing from complete definition", cd.name))
        })?;
        buf.put_u32(((cd.dtype.type_id() as u32) << 24) | cidx as u32);
        encode_value(&mut buf, value);
    }
    buf.put_u32(COLUMN_EOF);
    Ok(buf.freeze())
}

/// Deserialize a DATA payload (after the stream id) against a known schema
pub fn deserialize_tuple(buf: &mut impl Buf, complete: &TupleDefinition) -> Result<Tuple> {
    let mut definition = TupleDefinition::new();
    let mut values = Vec::new();
    loop {
        if buf.remaining() < 4 {
            return Err(Error::Decode("truncated column tag".into()));
        }
        let tag = buf.get_u32();
        if tag == COLUMN_EOF {
            break;
        }
        let cidx = (tag & 0xFFFF) as usize;
        let type_id = (tag >> 24) as u8;
        let cd = complete
            .column(cidx)
            .ok_or_else(|| Error::Decode(format!("reference to unknown column index {}", cidx)))?;
        if cd.dtype.type_id() != type_id {
            return Err(Error::Decode(format!(
                "type id {} for column {} does not match schema type {}",
                type_id, cd.name, cd.dtype
            )));
        }
        let value = decode_value(buf, cd.dtype)?;
        definition.add_column(cd.clone());
        values.push(Some(value));
    }
    Ok(Tuple::new(definition, values))
}

/// A named stream fanning tuples out to subscribers
pub struct Stream {
    name: String,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Tuple>>>,
}

impl Stream {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscribe to all tuples emitted on this stream
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Tuple> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Emit a tuple to all subscribers, dropping closed ones
    pub fn emit(&self, tuple: Tuple) {
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|tx| tx.send(tuple.clone()).is_ok());
    }
}

/// Registry of local streams by name
#[derive(Default)]
pub struct StreamRegistry {
    streams: RwLock<HashMap<String, Arc<Stream>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a stream, or return the existing one with that name
    pub fn create(&self, name: &str) -> Arc<Stream> {
        let mut streams = self.streams.write().unwrap();
        streams
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Stream::new(name)))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Stream>> {
        self.streams.read().unwrap().get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_definition() -> TupleDefinition {
        let mut def = TupleDefinition::new();
        def.add_column(ColumnDefinition::new("gentime", DataType::Long));
        def.add_column(ColumnDefinition::new("seq_num", DataType::Int));
        def.add_column(ColumnDefinition::new("name", DataType::String));
        def
    }

    #[test]
    fn test_value_round_trip() {
        let values = vec![
            Value::Boolean(true),
            Value::Int(-42),
            Value::Long(1 << 40),
            Value::Double(3.25),
            Value::String("hello".to_string()),
            Value::Binary(vec![0xDE, 0xAD, 0xBE, 0xEF]),
            Value::Timestamp(1_700_000_000_000),
        ];
        for v in values {
            let mut buf = BytesMut::new();
            encode_value(&mut buf, &v);
            let mut bytes = buf.freeze();
            let back = decode_value(&mut bytes, v.data_type()).unwrap();
            assert_eq!(back, v);
        }
    }

    #[test]
    fn test_tuple_round_trip() {
        let def = sample_definition();
        let tuple = Tuple::new(
            def.clone(),
            vec![
                Some(Value::Long(1000)),
                Some(Value::Int(1)),
                Some(Value::String("tm".to_string())),
            ],
        );

        let payload = serialize_tuple(3, &tuple, &def).unwrap();
        let mut buf = payload;
        assert_eq!(buf.get_u32(), 3);
        let back = deserialize_tuple(&mut buf, &def).unwrap();
        assert_eq!(back.values.len(), 3);
        assert_eq!(back.value("gentime"), Some(&Value::Long(1000)));
        assert_eq!(back.value("seq_num"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_tuple_skips_absent_columns() {
        let def = sample_definition();
        let tuple = Tuple::new(
            def.clone(),
            vec![Some(Value::Long(5)), None, Some(Value::String("x".into()))],
        );

        let payload = serialize_tuple(0, &tuple, &def).unwrap();
        let mut buf = payload;
        buf.get_u32();
        let back = deserialize_tuple(&mut buf, &def).unwrap();
        assert_eq!(back.values.len(), 2);
        assert_eq!(back.value("seq_num"), None);
    }

    #[test]
    fn test_deserialize_rejects_type_mismatch() {
        let def = sample_definition();
        let mut buf = BytesMut::new();
        // claim column 0 (a Long) is an Int
        buf.put_u32(((DataType::Int.type_id() as u32) << 24) | 0);
        buf.put_i32(7);
        buf.put_u32(COLUMN_EOF);
        let mut bytes = buf.freeze();
        assert!(deserialize_tuple(&mut bytes, &def).is_err());
    }

    #[test]
    fn test_stream_fan_out() {
        let stream = Stream::new("tm_local");
        let mut rx1 = stream.subscribe();
        let mut rx2 = stream.subscribe();

        let def = sample_definition();
        let tuple = Tuple::new(
            def,
            vec![Some(Value::Long(1)), Some(Value::Int(2)), None],
        );
        stream.emit(tuple.clone());

        assert_eq!(rx1.try_recv().unwrap(), tuple);
        assert_eq!(rx2.try_recv().unwrap(), tuple);
    }

    #[test]
    fn test_registry_create_is_idempotent() {
        let registry = StreamRegistry::new();
        let a = registry.create("tm");
        let b = registry.create("tm");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.get("other").is_none());
    }
}
