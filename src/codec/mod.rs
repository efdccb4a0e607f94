//! Schema-driven bit-level codec.
//!
//! The codec compiles schemas into per-field codec strategies up front, so
//! that encode/decode are straight walks over the field list. Frames are
//! assembled as one continuous bit run behind the fixed head and packed to
//! bytes at the end; the head occupies exactly [`header::HEAD_BYTES`] bytes,
//! so field bits always start on a byte boundary.

pub mod default_codecs;
pub mod field_codec;
pub mod header;
pub mod schema;

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::codec::field_codec::{CodecRegistry, FieldCodec};
use crate::codec::header::{DcclHead, DCCL_CCL_ID, HEAD_BYTES};
use crate::codec::schema::{MessageSchema, Record, MAX_DCCL_ID};
use crate::error::CodecError;
use crate::util::bitset::Bitset;

struct CompiledSchema {
    schema: Arc<MessageSchema>,
    field_codecs: Vec<Arc<dyn FieldCodec>>,
    min_body_bits: usize,
    max_body_bits: usize,
}

pub struct Codec {
    registry: Arc<CodecRegistry>,
    max_frame_bytes: usize,
    schemas: FxHashMap<u32, CompiledSchema>,
}

impl Codec {
    pub fn new(registry: Arc<CodecRegistry>, max_frame_bytes: usize) -> Codec {
        Codec {
            registry,
            max_frame_bytes,
            schemas: FxHashMap::default(),
        }
    }

    pub fn registry(&self) -> &Arc<CodecRegistry> {
        &self.registry
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Compiles and registers a schema.
    pub fn load(&mut self, schema: MessageSchema) -> Result<(), CodecError> {
        if schema.id > MAX_DCCL_ID {
            return Err(CodecError::Schema(format!(
                "schema {:?} id {} exceeds the maximum of {}",
                schema.name, schema.id, MAX_DCCL_ID
            )));
        }
        if self.schemas.contains_key(&schema.id) {
            return Err(CodecError::Schema(format!(
                "schema id {} is already loaded",
                schema.id
            )));
        }

        let mut field_codecs = Vec::with_capacity(schema.fields.len());
        let mut min_body_bits = 0;
        let mut max_body_bits = 0;
        for field in &schema.fields {
            let codec = self.registry.resolve(field)?;
            codec.validate(field)?;
            min_body_bits += codec.min_size(field)?;
            max_body_bits += codec.max_size(field)?;
            field_codecs.push(codec);
        }

        let min_frame = HEAD_BYTES + min_body_bits.div_ceil(8);
        if min_frame > self.max_frame_bytes {
            return Err(CodecError::Schema(format!(
                "schema {:?} needs at least {} bytes, frame limit is {}",
                schema.name, min_frame, self.max_frame_bytes
            )));
        }

        debug!(
            id = schema.id,
            name = %schema.name,
            min_body_bits,
            max_body_bits,
            "loaded message schema"
        );

        self.schemas.insert(
            schema.id,
            CompiledSchema {
                schema: Arc::new(schema),
                field_codecs,
                min_body_bits,
                max_body_bits,
            },
        );
        Ok(())
    }

    pub fn schema(&self, id: u32) -> Option<&Arc<MessageSchema>> {
        self.schemas.get(&id).map(|c| &c.schema)
    }

    pub fn is_loaded(&self, id: u32) -> bool {
        self.schemas.contains_key(&id)
    }

    /// Encodes `record` behind `head` into a complete frame.
    pub fn encode(&self, head: &DcclHead, record: &Record) -> Result<Vec<u8>, CodecError> {
        let compiled = self.compiled(head.dccl_id)?;

        let mut body = Bitset::new();
        for (index, field) in compiled.schema.fields.iter().enumerate() {
            let codec = &compiled.field_codecs[index];
            match record.get(index) {
                Some(value) => body.append(codec.encode(field, value)?),
                None if field.required => {
                    return Err(CodecError::BadFieldValue {
                        field: field.name.clone(),
                        reason: "required field is absent".to_string(),
                    })
                }
                None => body.append(codec.encode_absent(field)?),
            }
        }

        let mut frame = head.ser().to_vec();
        frame.extend_from_slice(&body.to_bytes());
        if frame.len() > self.max_frame_bytes {
            return Err(CodecError::FrameTooLong {
                got: frame.len(),
                limit: self.max_frame_bytes,
            });
        }
        Ok(frame)
    }

    /// Decodes a complete frame into its head and record.
    pub fn decode(&self, frame: &[u8]) -> Result<(DcclHead, Record), CodecError> {
        let head = DcclHead::deser(frame)?;
        if head.ccl_id != DCCL_CCL_ID {
            return Err(CodecError::BadPacket(format!(
                "CCL id {:#04x} is not the DCCL marker {:#04x}",
                head.ccl_id, DCCL_CCL_ID
            )));
        }
        let compiled = self.compiled(head.dccl_id)?;

        let body_bits = (frame.len() - HEAD_BYTES) * 8;
        let mut bits = Bitset::from_bytes(&frame[HEAD_BYTES..], body_bits)
            .expect("length computed from the slice itself");

        let mut record = Record::new(compiled.schema.fields.len());
        for (index, field) in compiled.schema.fields.iter().enumerate() {
            if let Some(value) = compiled.field_codecs[index].decode(field, &mut bits)? {
                record.set(index, value);
            }
        }
        Ok((head, record))
    }

    /// Encoded size in bits of `record`'s body (head excluded).
    pub fn size_bits(&self, dccl_id: u32, record: &Record) -> Result<usize, CodecError> {
        let compiled = self.compiled(dccl_id)?;
        let mut total = 0;
        for (index, field) in compiled.schema.fields.iter().enumerate() {
            total += compiled.field_codecs[index].size(field, record.get(index))?;
        }
        Ok(total)
    }

    /// Largest possible frame for this schema, in bytes, head included.
    pub fn max_bytes(&self, dccl_id: u32) -> Result<usize, CodecError> {
        let compiled = self.compiled(dccl_id)?;
        Ok(HEAD_BYTES + compiled.max_body_bits.div_ceil(8))
    }

    /// Smallest possible frame for this schema, in bytes, head included.
    pub fn min_bytes(&self, dccl_id: u32) -> Result<usize, CodecError> {
        let compiled = self.compiled(dccl_id)?;
        Ok(HEAD_BYTES + compiled.min_body_bits.div_ceil(8))
    }

    fn compiled(&self, dccl_id: u32) -> Result<&CompiledSchema, CodecError> {
        self.schemas.get(&dccl_id).ok_or_else(|| {
            CodecError::BadPacket(format!("no schema loaded for id {dccl_id}"))
        })
    }
}
