//! Runtime message schemas and the dynamic value carrier.
//!
//! Schemas are supplied by the host (parsed from whatever configuration
//! format it uses) and compiled by [`crate::codec::Codec`] into a codec tree.
//! Records are carried as ordered, optionally-absent [`FieldValue`]s parallel
//! to the schema's field list; the explicit variant tags replace the runtime
//! casts a dynamically-typed carrier would need.

use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Largest schema id that fits the 9-bit id field of the frame head.
pub const MAX_DCCL_ID: u32 = 511;

#[derive(Clone, Debug)]
pub struct MessageSchema {
    pub id: u32,
    pub name: String,
    pub fields: Vec<FieldSchema>,
}

#[derive(Clone, Debug)]
pub struct FieldSchema {
    pub name: String,
    pub required: bool,
    /// Codec selector; `None` picks the default codec for the wire type.
    pub codec: Option<String>,
    pub wire_type: WireType,
}

#[derive(Clone, Debug)]
pub enum WireType {
    /// Bounded numeric value. `precision` is the number of decimal digits
    /// preserved on the wire (may be negative to round to tens, hundreds, ...).
    Numeric {
        min: Option<f64>,
        max: Option<f64>,
        precision: i32,
    },
    Bool,
    /// Length-prefixed string of at most `max_length` (<= 255) bytes.
    String { max_length: usize },
    /// Fixed-length byte blob.
    Bytes { len: usize },
    /// Closed set of named values, encoded by ordinal.
    Enum { values: Vec<String> },
    /// Nested message.
    Message { schema: Arc<MessageSchema> },
    /// Schema-supplied constant occupying zero wire bits.
    Static { value: Option<String> },
    /// Timestamp reduced to seconds since UTC midnight.
    TimeOfDay,
    /// Platform name mapped through the registry's name <-> modem id table.
    PlatformName,
}

impl WireType {
    pub fn tag(&self) -> WireTypeTag {
        match self {
            WireType::Numeric { .. } => WireTypeTag::Numeric,
            WireType::Bool => WireTypeTag::Bool,
            WireType::String { .. } => WireTypeTag::String,
            WireType::Bytes { .. } => WireTypeTag::Bytes,
            WireType::Enum { .. } => WireTypeTag::Enum,
            WireType::Message { .. } => WireTypeTag::Message,
            WireType::Static { .. } => WireTypeTag::Static,
            WireType::TimeOfDay => WireTypeTag::TimeOfDay,
            WireType::PlatformName => WireTypeTag::PlatformName,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WireTypeTag {
    Numeric,
    Bool,
    String,
    Bytes,
    Enum,
    Message,
    Static,
    TimeOfDay,
    PlatformName,
}

impl WireTypeTag {
    pub fn name(&self) -> &'static str {
        match self {
            WireTypeTag::Numeric => "numeric",
            WireTypeTag::Bool => "bool",
            WireTypeTag::String => "string",
            WireTypeTag::Bytes => "bytes",
            WireTypeTag::Enum => "enum",
            WireTypeTag::Message => "message",
            WireTypeTag::Static => "static",
            WireTypeTag::TimeOfDay => "time_of_day",
            WireTypeTag::PlatformName => "platform_name",
        }
    }
}

/// Tagged union of everything a field can carry.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Double(f64),
    Bool(bool),
    Text(String),
    Bytes(Vec<u8>),
    /// Enum ordinal.
    Enum(u32),
    Message(Record),
    Timestamp(DateTime<Utc>),
}

/// A decoded (or to-be-encoded) message: one optional value per schema field,
/// in schema order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Record {
    values: Vec<Option<FieldValue>>,
}

impl Record {
    pub fn new(num_fields: usize) -> Record {
        Record {
            values: vec![None; num_fields],
        }
    }

    pub fn from_values(values: Vec<Option<FieldValue>>) -> Record {
        Record { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn set(&mut self, index: usize, value: FieldValue) {
        self.values[index] = Some(value);
    }

    pub fn clear(&mut self, index: usize) {
        self.values[index] = None;
    }

    pub fn get(&self, index: usize) -> Option<&FieldValue> {
        self.values.get(index).and_then(|v| v.as_ref())
    }

    pub fn values(&self) -> &[Option<FieldValue>] {
        &self.values
    }
}
