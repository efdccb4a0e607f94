//! Default codecs for the basic wire types.
//!
//! The arithmetic codec is the workhorse: a value `x` with declared
//! `(min, max, precision)` is carried as `round((x - min) * 10^precision) + 1`
//! in `ceil(log2((max - min) * 10^precision + 2))` bits. The integer 0 is
//! reserved for "absent", and out-of-range values encode as absent rather
//! than wrapping. Bool, enum, time-of-day and platform-name are thin layers
//! over the same scheme.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Duration, Timelike, Utc};
use tracing::debug;

use crate::codec::field_codec::{CodecRegistry, FieldCodec, PlatformTable};
use crate::codec::schema::{FieldSchema, FieldValue, Record, WireType};
use crate::error::CodecError;
use crate::util::bitset::Bitset;
use crate::ModemId;

const MAX_STRING_LENGTH: usize = 255;
const SECONDS_IN_DAY: f64 = 86400.0;
const MAX_PLATFORM_ID: f64 = 30.0;

/// Width in bits of the arithmetic wire integer, including the reserved
/// absent value.
fn arithmetic_width(min: f64, max: f64, precision: i32) -> usize {
    (((max - min) * 10f64.powi(precision) + 2.0).log2()).ceil() as usize
}

/// Round to `precision` decimal digits, ties to even.
fn unbiased_round(value: f64, precision: i32) -> f64 {
    let scale = 10f64.powi(precision);
    (value * scale).round_ties_even() / scale
}

fn arithmetic_encode(value: f64, min: f64, max: f64, precision: i32) -> Bitset {
    let width = arithmetic_width(min, max, precision);
    if !value.is_finite() || value < min || value > max {
        return Bitset::zeros(width);
    }
    let rounded = unbiased_round(value, precision);
    let wire = ((rounded - min) * 10f64.powi(precision)).round() as u64 + 1;
    Bitset::from_unsigned(wire, width)
}

fn arithmetic_decode(
    field: &FieldSchema,
    bits: &mut Bitset,
    min: f64,
    max: f64,
    precision: i32,
) -> Result<Option<f64>, CodecError> {
    let width = arithmetic_width(min, max, precision);
    let run = bits.take_front(width).ok_or_else(|| {
        CodecError::BadPacket(format!("frame ends inside field {:?}", field.name))
    })?;
    let wire = run.to_unsigned();
    if wire == 0 {
        return Ok(None);
    }
    let value = unbiased_round((wire - 1) as f64 / 10f64.powi(precision) + min, precision);
    Ok(Some(value))
}

fn wrong_variant(field: &FieldSchema, expected: &'static str) -> CodecError {
    CodecError::BadFieldValue {
        field: field.name.clone(),
        reason: format!("expected a {expected} value"),
    }
}

/// Default codec for bounded numeric fields.
pub struct NumericCodec;

impl NumericCodec {
    fn bounds(field: &FieldSchema) -> Result<(f64, f64, i32), CodecError> {
        match &field.wire_type {
            WireType::Numeric {
                min: Some(min),
                max: Some(max),
                precision,
            } => Ok((*min, *max, *precision)),
            WireType::Numeric { .. } => Err(CodecError::Schema(format!(
                "numeric field {:?} requires both min and max",
                field.name
            ))),
            _ => Err(CodecError::Schema(format!(
                "field {:?} is not numeric",
                field.name
            ))),
        }
    }
}

impl FieldCodec for NumericCodec {
    fn validate(&self, field: &FieldSchema) -> Result<(), CodecError> {
        let (min, max, _) = Self::bounds(field)?;
        if min > max {
            return Err(CodecError::Schema(format!(
                "numeric field {:?} has min {} > max {}",
                field.name, min, max
            )));
        }
        Ok(())
    }

    fn encode(&self, field: &FieldSchema, value: &FieldValue) -> Result<Bitset, CodecError> {
        let (min, max, precision) = Self::bounds(field)?;
        let x = match value {
            FieldValue::Double(x) => *x,
            _ => return Err(wrong_variant(field, "numeric")),
        };
        Ok(arithmetic_encode(x, min, max, precision))
    }

    fn encode_absent(&self, field: &FieldSchema) -> Result<Bitset, CodecError> {
        let (min, max, precision) = Self::bounds(field)?;
        Ok(Bitset::zeros(arithmetic_width(min, max, precision)))
    }

    fn decode(
        &self,
        field: &FieldSchema,
        bits: &mut Bitset,
    ) -> Result<Option<FieldValue>, CodecError> {
        let (min, max, precision) = Self::bounds(field)?;
        Ok(arithmetic_decode(field, bits, min, max, precision)?.map(FieldValue::Double))
    }

    fn size(&self, field: &FieldSchema, _value: Option<&FieldValue>) -> Result<usize, CodecError> {
        self.min_size(field)
    }

    fn min_size(&self, field: &FieldSchema) -> Result<usize, CodecError> {
        let (min, max, precision) = Self::bounds(field)?;
        Ok(arithmetic_width(min, max, precision))
    }

    fn max_size(&self, field: &FieldSchema) -> Result<usize, CodecError> {
        self.min_size(field)
    }
}

/// 1 bit for required fields, 2 bits (absent / false / true) for optional.
pub struct BoolCodec;

impl BoolCodec {
    fn width(field: &FieldSchema) -> usize {
        if field.required {
            1
        } else {
            2
        }
    }
}

impl FieldCodec for BoolCodec {
    fn validate(&self, _field: &FieldSchema) -> Result<(), CodecError> {
        Ok(())
    }

    fn encode(&self, field: &FieldSchema, value: &FieldValue) -> Result<Bitset, CodecError> {
        let b = match value {
            FieldValue::Bool(b) => *b,
            _ => return Err(wrong_variant(field, "bool")),
        };
        if field.required {
            Ok(Bitset::from_unsigned(u64::from(b), 1))
        } else {
            Ok(Bitset::from_unsigned(u64::from(b) + 1, 2))
        }
    }

    fn encode_absent(&self, field: &FieldSchema) -> Result<Bitset, CodecError> {
        Ok(Bitset::zeros(Self::width(field)))
    }

    fn decode(
        &self,
        field: &FieldSchema,
        bits: &mut Bitset,
    ) -> Result<Option<FieldValue>, CodecError> {
        let run = bits.take_front(Self::width(field)).ok_or_else(|| {
            CodecError::BadPacket(format!("frame ends inside field {:?}", field.name))
        })?;
        if field.required {
            Ok(Some(FieldValue::Bool(run.to_unsigned() == 1)))
        } else {
            match run.to_unsigned() {
                0 => Ok(None),
                1 => Ok(Some(FieldValue::Bool(false))),
                2 => Ok(Some(FieldValue::Bool(true))),
                other => Err(CodecError::BadPacket(format!(
                    "invalid bool wire value {} in field {:?}",
                    other, field.name
                ))),
            }
        }
    }

    fn size(&self, field: &FieldSchema, _value: Option<&FieldValue>) -> Result<usize, CodecError> {
        Ok(Self::width(field))
    }

    fn min_size(&self, field: &FieldSchema) -> Result<usize, CodecError> {
        Ok(Self::width(field))
    }

    fn max_size(&self, field: &FieldSchema) -> Result<usize, CodecError> {
        Ok(Self::width(field))
    }
}

/// One length byte followed by the raw bytes. An empty wire string decodes as
/// absent; values longer than the declared maximum are truncated.
pub struct StringCodec;

impl StringCodec {
    fn max_length(field: &FieldSchema) -> Result<usize, CodecError> {
        match &field.wire_type {
            WireType::String { max_length } => Ok(*max_length),
            _ => Err(CodecError::Schema(format!(
                "field {:?} is not a string",
                field.name
            ))),
        }
    }
}

impl FieldCodec for StringCodec {
    fn validate(&self, field: &FieldSchema) -> Result<(), CodecError> {
        let max_length = Self::max_length(field)?;
        if max_length == 0 || max_length > MAX_STRING_LENGTH {
            return Err(CodecError::Schema(format!(
                "string field {:?} max_length {} outside [1, {}]",
                field.name, max_length, MAX_STRING_LENGTH
            )));
        }
        Ok(())
    }

    fn encode(&self, field: &FieldSchema, value: &FieldValue) -> Result<Bitset, CodecError> {
        let max_length = Self::max_length(field)?;
        let s = match value {
            FieldValue::Text(s) => s,
            _ => return Err(wrong_variant(field, "string")),
        };
        let mut bytes = s.as_bytes();
        if bytes.len() > max_length {
            debug!(field = %field.name, len = bytes.len(), max_length, "truncating over-long string");
            bytes = &bytes[..max_length];
        }

        let mut bits = Bitset::from_unsigned(bytes.len() as u64, 8);
        for b in bytes {
            bits.push_back_unsigned(u64::from(*b), 8);
        }
        Ok(bits)
    }

    fn encode_absent(&self, _field: &FieldSchema) -> Result<Bitset, CodecError> {
        Ok(Bitset::zeros(8))
    }

    fn decode(
        &self,
        field: &FieldSchema,
        bits: &mut Bitset,
    ) -> Result<Option<FieldValue>, CodecError> {
        let max_length = Self::max_length(field)?;
        let short = || CodecError::BadPacket(format!("frame ends inside field {:?}", field.name));

        let len = bits.take_front(8).ok_or_else(short)?.to_unsigned() as usize;
        if len == 0 {
            return Ok(None);
        }
        if len > max_length {
            return Err(CodecError::BadPacket(format!(
                "string field {:?} claims {} bytes, maximum is {}",
                field.name, len, max_length
            )));
        }
        let mut bytes = Vec::with_capacity(len);
        for _ in 0..len {
            bytes.push(bits.take_front(8).ok_or_else(short)?.to_unsigned() as u8);
        }
        Ok(Some(FieldValue::Text(
            String::from_utf8_lossy(&bytes).into_owned(),
        )))
    }

    fn size(&self, field: &FieldSchema, value: Option<&FieldValue>) -> Result<usize, CodecError> {
        let max_length = Self::max_length(field)?;
        match value {
            Some(FieldValue::Text(s)) => Ok(8 + 8 * s.len().min(max_length)),
            Some(_) => Err(wrong_variant(field, "string")),
            None => Ok(8),
        }
    }

    fn min_size(&self, _field: &FieldSchema) -> Result<usize, CodecError> {
        Ok(8)
    }

    fn max_size(&self, field: &FieldSchema) -> Result<usize, CodecError> {
        Ok(8 + 8 * Self::max_length(field)?)
    }

    fn is_variable_size(&self) -> bool {
        true
    }
}

/// Fixed-length blob. Absence is indistinguishable from the all-zero blob on
/// the wire, so decode always yields a value.
pub struct BytesCodec;

impl BytesCodec {
    fn blob_len(field: &FieldSchema) -> Result<usize, CodecError> {
        match &field.wire_type {
            WireType::Bytes { len } => Ok(*len),
            _ => Err(CodecError::Schema(format!(
                "field {:?} is not a bytes blob",
                field.name
            ))),
        }
    }
}

impl FieldCodec for BytesCodec {
    fn validate(&self, field: &FieldSchema) -> Result<(), CodecError> {
        if Self::blob_len(field)? == 0 {
            return Err(CodecError::Schema(format!(
                "bytes field {:?} has zero length",
                field.name
            )));
        }
        Ok(())
    }

    fn encode(&self, field: &FieldSchema, value: &FieldValue) -> Result<Bitset, CodecError> {
        let len = Self::blob_len(field)?;
        let bytes = match value {
            FieldValue::Bytes(b) => b,
            _ => return Err(wrong_variant(field, "bytes")),
        };
        if bytes.len() != len {
            return Err(CodecError::BadFieldValue {
                field: field.name.clone(),
                reason: format!("blob is {} bytes, schema declares {}", bytes.len(), len),
            });
        }
        let mut bits = Bitset::new();
        for b in bytes {
            bits.push_back_unsigned(u64::from(*b), 8);
        }
        Ok(bits)
    }

    fn encode_absent(&self, field: &FieldSchema) -> Result<Bitset, CodecError> {
        Ok(Bitset::zeros(8 * Self::blob_len(field)?))
    }

    fn decode(
        &self,
        field: &FieldSchema,
        bits: &mut Bitset,
    ) -> Result<Option<FieldValue>, CodecError> {
        let len = Self::blob_len(field)?;
        let short = || CodecError::BadPacket(format!("frame ends inside field {:?}", field.name));
        let mut bytes = Vec::with_capacity(len);
        for _ in 0..len {
            bytes.push(bits.take_front(8).ok_or_else(short)?.to_unsigned() as u8);
        }
        Ok(Some(FieldValue::Bytes(bytes)))
    }

    fn size(&self, field: &FieldSchema, _value: Option<&FieldValue>) -> Result<usize, CodecError> {
        Ok(8 * Self::blob_len(field)?)
    }

    fn min_size(&self, field: &FieldSchema) -> Result<usize, CodecError> {
        self.size(field, None)
    }

    fn max_size(&self, field: &FieldSchema) -> Result<usize, CodecError> {
        self.size(field, None)
    }
}

/// Arithmetic codec over `[0, value_count - 1]` carrying the ordinal.
pub struct EnumCodec;

impl EnumCodec {
    fn value_count(field: &FieldSchema) -> Result<usize, CodecError> {
        match &field.wire_type {
            WireType::Enum { values } => Ok(values.len()),
            _ => Err(CodecError::Schema(format!(
                "field {:?} is not an enum",
                field.name
            ))),
        }
    }

    fn width(field: &FieldSchema) -> Result<usize, CodecError> {
        let n = Self::value_count(field)?;
        Ok(arithmetic_width(0.0, (n - 1) as f64, 0))
    }
}

impl FieldCodec for EnumCodec {
    fn validate(&self, field: &FieldSchema) -> Result<(), CodecError> {
        if Self::value_count(field)? == 0 {
            return Err(CodecError::Schema(format!(
                "enum field {:?} has no values",
                field.name
            )));
        }
        Ok(())
    }

    fn encode(&self, field: &FieldSchema, value: &FieldValue) -> Result<Bitset, CodecError> {
        let n = Self::value_count(field)?;
        let ordinal = match value {
            FieldValue::Enum(ordinal) => *ordinal,
            _ => return Err(wrong_variant(field, "enum")),
        };
        Ok(arithmetic_encode(
            f64::from(ordinal),
            0.0,
            (n - 1) as f64,
            0,
        ))
    }

    fn encode_absent(&self, field: &FieldSchema) -> Result<Bitset, CodecError> {
        Ok(Bitset::zeros(Self::width(field)?))
    }

    fn decode(
        &self,
        field: &FieldSchema,
        bits: &mut Bitset,
    ) -> Result<Option<FieldValue>, CodecError> {
        let n = Self::value_count(field)?;
        match arithmetic_decode(field, bits, 0.0, (n - 1) as f64, 0)? {
            None => Ok(None),
            Some(ordinal) if (ordinal as usize) < n => Ok(Some(FieldValue::Enum(ordinal as u32))),
            Some(ordinal) => Err(CodecError::BadPacket(format!(
                "enum field {:?} ordinal {} out of range",
                field.name, ordinal
            ))),
        }
    }

    fn size(&self, field: &FieldSchema, _value: Option<&FieldValue>) -> Result<usize, CodecError> {
        Self::width(field)
    }

    fn min_size(&self, field: &FieldSchema) -> Result<usize, CodecError> {
        Self::width(field)
    }

    fn max_size(&self, field: &FieldSchema) -> Result<usize, CodecError> {
        Self::width(field)
    }
}

/// Arithmetic codec over `[0, 86400]`: a timestamp is reduced to seconds
/// since UTC midnight on encode and re-anchored near "now" on decode.
pub struct TimeOfDayCodec;

/// Re-attach a seconds-since-midnight value to a date so that the result lies
/// within +-12 h of `now`. Ties prefer the same UTC day as `now`.
pub fn anchor_time_of_day(secs: u32, now: DateTime<Utc>) -> DateTime<Utc> {
    let midnight = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always valid")
        .and_utc();

    [0i64, -1, 1]
        .into_iter()
        .map(|days| midnight + Duration::days(days) + Duration::seconds(i64::from(secs)))
        .min_by_key(|candidate| (*candidate - now).num_seconds().abs())
        .expect("three candidates")
}

impl FieldCodec for TimeOfDayCodec {
    fn validate(&self, _field: &FieldSchema) -> Result<(), CodecError> {
        Ok(())
    }

    fn encode(&self, field: &FieldSchema, value: &FieldValue) -> Result<Bitset, CodecError> {
        let ts = match value {
            FieldValue::Timestamp(ts) => ts,
            _ => return Err(wrong_variant(field, "timestamp")),
        };
        let secs = f64::from(ts.time().num_seconds_from_midnight());
        Ok(arithmetic_encode(secs, 0.0, SECONDS_IN_DAY, 0))
    }

    fn encode_absent(&self, _field: &FieldSchema) -> Result<Bitset, CodecError> {
        Ok(Bitset::zeros(arithmetic_width(0.0, SECONDS_IN_DAY, 0)))
    }

    fn decode(
        &self,
        field: &FieldSchema,
        bits: &mut Bitset,
    ) -> Result<Option<FieldValue>, CodecError> {
        match arithmetic_decode(field, bits, 0.0, SECONDS_IN_DAY, 0)? {
            None => Ok(None),
            Some(secs) => Ok(Some(FieldValue::Timestamp(anchor_time_of_day(
                secs as u32,
                Utc::now(),
            )))),
        }
    }

    fn size(&self, _field: &FieldSchema, _value: Option<&FieldValue>) -> Result<usize, CodecError> {
        Ok(arithmetic_width(0.0, SECONDS_IN_DAY, 0))
    }

    fn min_size(&self, field: &FieldSchema) -> Result<usize, CodecError> {
        self.size(field, None)
    }

    fn max_size(&self, field: &FieldSchema) -> Result<usize, CodecError> {
        self.size(field, None)
    }
}

/// Occupies zero wire bits; decode reproduces the schema's constant.
pub struct StaticCodec;

impl StaticCodec {
    fn value(field: &FieldSchema) -> Result<&str, CodecError> {
        match &field.wire_type {
            WireType::Static { value: Some(value) } => Ok(value),
            WireType::Static { value: None } => Err(CodecError::Schema(format!(
                "static field {:?} requires a value",
                field.name
            ))),
            _ => Err(CodecError::Schema(format!(
                "field {:?} is not static",
                field.name
            ))),
        }
    }
}

impl FieldCodec for StaticCodec {
    fn validate(&self, field: &FieldSchema) -> Result<(), CodecError> {
        Self::value(field).map(|_| ())
    }

    fn encode(&self, field: &FieldSchema, _value: &FieldValue) -> Result<Bitset, CodecError> {
        Self::value(field)?;
        Ok(Bitset::new())
    }

    fn encode_absent(&self, field: &FieldSchema) -> Result<Bitset, CodecError> {
        Self::value(field)?;
        Ok(Bitset::new())
    }

    fn decode(
        &self,
        field: &FieldSchema,
        _bits: &mut Bitset,
    ) -> Result<Option<FieldValue>, CodecError> {
        Ok(Some(FieldValue::Text(Self::value(field)?.to_string())))
    }

    fn size(&self, _field: &FieldSchema, _value: Option<&FieldValue>) -> Result<usize, CodecError> {
        Ok(0)
    }

    fn min_size(&self, _field: &FieldSchema) -> Result<usize, CodecError> {
        Ok(0)
    }

    fn max_size(&self, _field: &FieldSchema) -> Result<usize, CodecError> {
        Ok(0)
    }
}

/// Arithmetic codec over `[0, 30]` mapping platform names through the
/// registry's bijection.
pub struct PlatformNameCodec {
    platforms: Arc<PlatformTable>,
}

impl PlatformNameCodec {
    pub fn new(platforms: Arc<PlatformTable>) -> PlatformNameCodec {
        PlatformNameCodec { platforms }
    }

    fn width() -> usize {
        arithmetic_width(0.0, MAX_PLATFORM_ID, 0)
    }
}

impl FieldCodec for PlatformNameCodec {
    fn validate(&self, _field: &FieldSchema) -> Result<(), CodecError> {
        Ok(())
    }

    fn encode(&self, field: &FieldSchema, value: &FieldValue) -> Result<Bitset, CodecError> {
        let name = match value {
            FieldValue::Text(name) => name,
            _ => return Err(wrong_variant(field, "platform name")),
        };
        let id = self
            .platforms
            .id_of(name)
            .ok_or_else(|| CodecError::BadFieldValue {
                field: field.name.clone(),
                reason: format!("platform {name:?} has no modem id mapping"),
            })?;
        Ok(arithmetic_encode(f64::from(id), 0.0, MAX_PLATFORM_ID, 0))
    }

    fn encode_absent(&self, _field: &FieldSchema) -> Result<Bitset, CodecError> {
        Ok(Bitset::zeros(Self::width()))
    }

    fn decode(
        &self,
        field: &FieldSchema,
        bits: &mut Bitset,
    ) -> Result<Option<FieldValue>, CodecError> {
        match arithmetic_decode(field, bits, 0.0, MAX_PLATFORM_ID, 0)? {
            None => Ok(None),
            Some(id) => {
                let id = id as ModemId;
                // an unmapped id is still routable, so keep it as its decimal form
                let name = self
                    .platforms
                    .name_of(id)
                    .unwrap_or_else(|| id.to_string());
                Ok(Some(FieldValue::Text(name)))
            }
        }
    }

    fn size(&self, _field: &FieldSchema, _value: Option<&FieldValue>) -> Result<usize, CodecError> {
        Ok(Self::width())
    }

    fn min_size(&self, _field: &FieldSchema) -> Result<usize, CodecError> {
        Ok(Self::width())
    }

    fn max_size(&self, _field: &FieldSchema) -> Result<usize, CodecError> {
        Ok(Self::width())
    }
}

/// Nested message. Optional sub-messages spend one presence bit; required
/// ones are just their fields' runs concatenated.
pub struct SubMessageCodec {
    registry: Weak<CodecRegistry>,
}

impl SubMessageCodec {
    pub fn new(registry: Weak<CodecRegistry>) -> SubMessageCodec {
        SubMessageCodec { registry }
    }

    fn registry(&self) -> Result<Arc<CodecRegistry>, CodecError> {
        self.registry
            .upgrade()
            .ok_or_else(|| CodecError::Schema("codec registry dropped".to_string()))
    }

    fn sub_schema(field: &FieldSchema) -> Result<&Arc<crate::codec::schema::MessageSchema>, CodecError> {
        match &field.wire_type {
            WireType::Message { schema } => Ok(schema),
            _ => Err(CodecError::Schema(format!(
                "field {:?} is not a sub-message",
                field.name
            ))),
        }
    }
}

impl FieldCodec for SubMessageCodec {
    fn validate(&self, field: &FieldSchema) -> Result<(), CodecError> {
        let registry = self.registry()?;
        for sub_field in &Self::sub_schema(field)?.fields {
            registry.resolve(sub_field)?.validate(sub_field)?;
        }
        Ok(())
    }

    fn encode(&self, field: &FieldSchema, value: &FieldValue) -> Result<Bitset, CodecError> {
        let registry = self.registry()?;
        let schema = Self::sub_schema(field)?;
        let record = match value {
            FieldValue::Message(record) => record,
            _ => return Err(wrong_variant(field, "sub-message")),
        };

        let mut bits = Bitset::new();
        if !field.required {
            bits.push_back(true);
        }
        for (index, sub_field) in schema.fields.iter().enumerate() {
            let codec = registry.resolve(sub_field)?;
            match record.get(index) {
                Some(sub_value) => bits.append(codec.encode(sub_field, sub_value)?),
                None if sub_field.required => {
                    return Err(CodecError::BadFieldValue {
                        field: format!("{}.{}", field.name, sub_field.name),
                        reason: "required field is absent".to_string(),
                    })
                }
                None => bits.append(codec.encode_absent(sub_field)?),
            }
        }
        Ok(bits)
    }

    fn encode_absent(&self, field: &FieldSchema) -> Result<Bitset, CodecError> {
        if field.required {
            return Err(CodecError::BadFieldValue {
                field: field.name.clone(),
                reason: "required sub-message is absent".to_string(),
            });
        }
        Ok(Bitset::zeros(1))
    }

    fn decode(
        &self,
        field: &FieldSchema,
        bits: &mut Bitset,
    ) -> Result<Option<FieldValue>, CodecError> {
        let registry = self.registry()?;
        let schema = Self::sub_schema(field)?;

        if !field.required {
            let present = bits.take_front(1).ok_or_else(|| {
                CodecError::BadPacket(format!("frame ends inside field {:?}", field.name))
            })?;
            if present.to_unsigned() == 0 {
                return Ok(None);
            }
        }

        let mut record = Record::new(schema.fields.len());
        for (index, sub_field) in schema.fields.iter().enumerate() {
            let codec = registry.resolve(sub_field)?;
            if let Some(sub_value) = codec.decode(sub_field, bits)? {
                record.set(index, sub_value);
            }
        }
        Ok(Some(FieldValue::Message(record)))
    }

    fn size(&self, field: &FieldSchema, value: Option<&FieldValue>) -> Result<usize, CodecError> {
        let registry = self.registry()?;
        let schema = Self::sub_schema(field)?;
        let presence = usize::from(!field.required);
        match value {
            None => Ok(presence),
            Some(FieldValue::Message(record)) => {
                let mut total = presence;
                for (index, sub_field) in schema.fields.iter().enumerate() {
                    let codec = registry.resolve(sub_field)?;
                    total += codec.size(sub_field, record.get(index))?;
                }
                Ok(total)
            }
            Some(_) => Err(wrong_variant(field, "sub-message")),
        }
    }

    fn min_size(&self, field: &FieldSchema) -> Result<usize, CodecError> {
        if !field.required {
            return Ok(1);
        }
        let registry = self.registry()?;
        let mut total = 0;
        for sub_field in &Self::sub_schema(field)?.fields {
            total += registry.resolve(sub_field)?.min_size(sub_field)?;
        }
        Ok(total)
    }

    fn max_size(&self, field: &FieldSchema) -> Result<usize, CodecError> {
        let registry = self.registry()?;
        let mut total = usize::from(!field.required);
        for sub_field in &Self::sub_schema(field)?.fields {
            total += registry.resolve(sub_field)?.max_size(sub_field)?;
        }
        Ok(total)
    }

    fn is_variable_size(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::schema::MessageSchema;
    use chrono::TimeZone;
    use rstest::rstest;

    fn numeric_field(min: f64, max: f64, precision: i32, required: bool) -> FieldSchema {
        FieldSchema {
            name: "x".to_string(),
            required,
            codec: None,
            wire_type: WireType::Numeric {
                min: Some(min),
                max: Some(max),
                precision,
            },
        }
    }

    #[rstest]
    #[case::percent(0.0, 100.0, 0, 7)] // 102 values
    #[case::symmetric(-31.0, 31.0, 0, 6)] // 64 values exactly
    #[case::one_decimal(0.0, 10.0, 1, 7)] // 102 values
    #[case::day_seconds(0.0, 86400.0, 0, 17)]
    #[case::negative_precision(0.0, 1000.0, -1, 7)] // 102 values
    #[case::single(5.0, 5.0, 0, 1)] // absent or 5
    fn test_arithmetic_width(
        #[case] min: f64,
        #[case] max: f64,
        #[case] precision: i32,
        #[case] expected: usize,
    ) {
        assert_eq!(arithmetic_width(min, max, precision), expected);
    }

    #[rstest]
    #[case::min(-100.0, -100.0)]
    #[case::max(-100.0, 100.0)]
    #[case::zero(0.0, 0.0)]
    #[case::rounded(45.27, 45.3)]
    #[case::rounded_down(45.24, 45.2)]
    fn test_numeric_roundtrip(#[case] value: f64, #[case] expected: f64) {
        let field = numeric_field(-100.0, 100.0, 1, true);
        let codec = NumericCodec;
        let mut bits = codec.encode(&field, &FieldValue::Double(value)).unwrap();
        assert_eq!(bits.len(), codec.size(&field, None).unwrap());
        let decoded = codec.decode(&field, &mut bits).unwrap();
        match decoded {
            Some(FieldValue::Double(x)) => assert!((x - expected).abs() < 1e-9),
            other => panic!("unexpected decode result {other:?}"),
        }
    }

    #[rstest]
    #[case::above(100.1)]
    #[case::below(-100.1)]
    #[case::nan(f64::NAN)]
    #[case::infinite(f64::INFINITY)]
    fn test_numeric_saturates_to_absent(#[case] value: f64) {
        let field = numeric_field(-100.0, 100.0, 1, false);
        let codec = NumericCodec;
        let mut bits = codec.encode(&field, &FieldValue::Double(value)).unwrap();
        assert_eq!(bits.to_unsigned(), 0);
        assert_eq!(codec.decode(&field, &mut bits).unwrap(), None);
    }

    #[test]
    fn test_numeric_absent_roundtrip() {
        let field = numeric_field(0.0, 1000.0, 2, false);
        let codec = NumericCodec;
        let mut bits = codec.encode_absent(&field).unwrap();
        assert_eq!(codec.decode(&field, &mut bits).unwrap(), None);
        assert!(bits.is_empty());
    }

    #[test]
    fn test_numeric_missing_bounds() {
        let field = FieldSchema {
            name: "x".to_string(),
            required: true,
            codec: None,
            wire_type: WireType::Numeric {
                min: Some(0.0),
                max: None,
                precision: 0,
            },
        };
        assert!(matches!(
            NumericCodec.validate(&field),
            Err(CodecError::Schema(_))
        ));
    }

    fn bool_field(required: bool) -> FieldSchema {
        FieldSchema {
            name: "flag".to_string(),
            required,
            codec: None,
            wire_type: WireType::Bool,
        }
    }

    #[rstest]
    #[case::required_true(true, true, 1)]
    #[case::required_false(true, false, 1)]
    #[case::optional_true(false, true, 2)]
    #[case::optional_false(false, false, 2)]
    fn test_bool_roundtrip(#[case] required: bool, #[case] value: bool, #[case] width: usize) {
        let field = bool_field(required);
        let codec = BoolCodec;
        let mut bits = codec.encode(&field, &FieldValue::Bool(value)).unwrap();
        assert_eq!(bits.len(), width);
        assert_eq!(
            codec.decode(&field, &mut bits).unwrap(),
            Some(FieldValue::Bool(value))
        );
    }

    #[test]
    fn test_bool_optional_absent() {
        let field = bool_field(false);
        let codec = BoolCodec;
        let mut bits = codec.encode_absent(&field).unwrap();
        assert_eq!(bits.len(), 2);
        assert_eq!(codec.decode(&field, &mut bits).unwrap(), None);
    }

    fn string_field(max_length: usize) -> FieldSchema {
        FieldSchema {
            name: "note".to_string(),
            required: false,
            codec: None,
            wire_type: WireType::String { max_length },
        }
    }

    #[rstest]
    #[case::short("hi")]
    #[case::full("0123456789")]
    fn test_string_roundtrip(#[case] value: &str) {
        let field = string_field(10);
        let codec = StringCodec;
        let mut bits = codec
            .encode(&field, &FieldValue::Text(value.to_string()))
            .unwrap();
        assert_eq!(bits.len(), 8 + 8 * value.len());
        assert_eq!(
            codec.decode(&field, &mut bits).unwrap(),
            Some(FieldValue::Text(value.to_string()))
        );
    }

    #[test]
    fn test_string_truncates() {
        let field = string_field(4);
        let codec = StringCodec;
        let mut bits = codec
            .encode(&field, &FieldValue::Text("overboard".to_string()))
            .unwrap();
        assert_eq!(
            codec.decode(&field, &mut bits).unwrap(),
            Some(FieldValue::Text("over".to_string()))
        );
    }

    #[test]
    fn test_string_empty_decodes_absent() {
        let field = string_field(4);
        let codec = StringCodec;
        let mut bits = codec
            .encode(&field, &FieldValue::Text(String::new()))
            .unwrap();
        assert_eq!(codec.decode(&field, &mut bits).unwrap(), None);
    }

    #[test]
    fn test_string_max_length_validation() {
        assert!(StringCodec.validate(&string_field(255)).is_ok());
        assert!(StringCodec.validate(&string_field(256)).is_err());
        assert!(StringCodec.validate(&string_field(0)).is_err());
    }

    #[test]
    fn test_bytes_roundtrip() {
        let field = FieldSchema {
            name: "blob".to_string(),
            required: true,
            codec: None,
            wire_type: WireType::Bytes { len: 3 },
        };
        let codec = BytesCodec;
        let mut bits = codec
            .encode(&field, &FieldValue::Bytes(vec![1, 2, 3]))
            .unwrap();
        assert_eq!(bits.len(), 24);
        assert_eq!(
            codec.decode(&field, &mut bits).unwrap(),
            Some(FieldValue::Bytes(vec![1, 2, 3]))
        );

        assert!(codec
            .encode(&field, &FieldValue::Bytes(vec![1, 2]))
            .is_err());
    }

    fn enum_field(n: usize) -> FieldSchema {
        FieldSchema {
            name: "mode".to_string(),
            required: false,
            codec: None,
            wire_type: WireType::Enum {
                values: (0..n).map(|i| format!("V{i}")).collect(),
            },
        }
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(4)]
    fn test_enum_roundtrip(#[case] ordinal: u32) {
        let field = enum_field(5);
        let codec = EnumCodec;
        let mut bits = codec.encode(&field, &FieldValue::Enum(ordinal)).unwrap();
        assert_eq!(
            codec.decode(&field, &mut bits).unwrap(),
            Some(FieldValue::Enum(ordinal))
        );
    }

    #[test]
    fn test_enum_out_of_range_is_absent() {
        let field = enum_field(5);
        let codec = EnumCodec;
        let mut bits = codec.encode(&field, &FieldValue::Enum(5)).unwrap();
        assert_eq!(codec.decode(&field, &mut bits).unwrap(), None);
    }

    #[rstest]
    #[case::noon_now("2026-08-02T12:00:00Z", 43200, "2026-08-02T12:00:00Z")]
    #[case::just_before_midnight("2026-08-02T23:59:00Z", 60, "2026-08-03T00:01:00Z")]
    #[case::just_after_midnight("2026-08-03T00:01:00Z", 86340, "2026-08-02T23:59:00Z")]
    #[case::same_day_morning("2026-08-02T08:00:00Z", 3600, "2026-08-02T01:00:00Z")]
    fn test_anchor_time_of_day(#[case] now: &str, #[case] secs: u32, #[case] expected: &str) {
        let now = now.parse::<DateTime<Utc>>().unwrap();
        let expected = expected.parse::<DateTime<Utc>>().unwrap();
        assert_eq!(anchor_time_of_day(secs, now), expected);
    }

    #[test]
    fn test_time_of_day_encode_width() {
        let field = FieldSchema {
            name: "t".to_string(),
            required: true,
            codec: None,
            wire_type: WireType::TimeOfDay,
        };
        let codec = TimeOfDayCodec;
        let ts = Utc.with_ymd_and_hms(2026, 8, 2, 13, 30, 5).unwrap();
        let bits = codec.encode(&field, &FieldValue::Timestamp(ts)).unwrap();
        assert_eq!(bits.len(), 17);
        // 13:30:05 -> 48605 seconds, +1 on the wire
        assert_eq!(bits.to_unsigned(), 48606);
    }

    #[test]
    fn test_static_codec() {
        let field = FieldSchema {
            name: "kind".to_string(),
            required: true,
            codec: None,
            wire_type: WireType::Static {
                value: Some("STATUS".to_string()),
            },
        };
        let codec = StaticCodec;
        let bits = codec
            .encode(&field, &FieldValue::Text("ignored".to_string()))
            .unwrap();
        assert!(bits.is_empty());
        assert_eq!(
            codec.decode(&field, &mut Bitset::new()).unwrap(),
            Some(FieldValue::Text("STATUS".to_string()))
        );

        let missing = FieldSchema {
            wire_type: WireType::Static { value: None },
            ..field
        };
        assert!(matches!(
            codec.validate(&missing),
            Err(CodecError::Schema(_))
        ));
    }

    #[test]
    fn test_platform_codec() {
        let platforms = Arc::new(PlatformTable::default());
        platforms.insert("auv-1", 4).unwrap();
        let codec = PlatformNameCodec::new(platforms);
        let field = FieldSchema {
            name: "platform".to_string(),
            required: true,
            codec: None,
            wire_type: WireType::PlatformName,
        };

        let mut bits = codec
            .encode(&field, &FieldValue::Text("auv-1".to_string()))
            .unwrap();
        assert_eq!(bits.len(), 5);
        assert_eq!(
            codec.decode(&field, &mut bits).unwrap(),
            Some(FieldValue::Text("auv-1".to_string()))
        );

        assert!(matches!(
            codec.encode(&field, &FieldValue::Text("stranger".to_string())),
            Err(CodecError::BadFieldValue { .. })
        ));
    }

    #[test]
    fn test_sub_message_roundtrip() {
        let registry = CodecRegistry::new();
        let sub_schema = Arc::new(MessageSchema {
            id: 0,
            name: "position".to_string(),
            fields: vec![
                numeric_field(-90.0, 90.0, 2, true),
                FieldSchema {
                    name: "valid".to_string(),
                    required: false,
                    codec: None,
                    wire_type: WireType::Bool,
                },
            ],
        });
        let field = FieldSchema {
            name: "pos".to_string(),
            required: false,
            codec: None,
            wire_type: WireType::Message { schema: sub_schema },
        };
        let codec = registry.resolve(&field).unwrap();

        let mut record = Record::new(2);
        record.set(0, FieldValue::Double(42.42));
        record.set(1, FieldValue::Bool(true));

        let mut bits = codec
            .encode(&field, &FieldValue::Message(record.clone()))
            .unwrap();
        assert_eq!(
            codec.decode(&field, &mut bits).unwrap(),
            Some(FieldValue::Message(record))
        );

        let mut absent = codec.encode_absent(&field).unwrap();
        assert_eq!(absent.len(), 1);
        assert_eq!(codec.decode(&field, &mut absent).unwrap(), None);
    }
}
