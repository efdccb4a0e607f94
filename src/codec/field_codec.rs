//! Field codec strategies and their registry.
//!
//! A codec is selected per field by `(wire type, codec name)`; schemas that
//! don't name a codec get the default for their wire type. The registry also
//! owns the platform name <-> modem id bijection, so everything a codec needs
//! beyond the field schema itself travels through one handle that the host
//! constructs at startup and passes into every [`crate::codec::Codec`].
//! Mutating the registry after the first encode/decode is outside the
//! supported contract.

use std::sync::{Arc, RwLock, Weak};

use rustc_hash::FxHashMap;

use crate::codec::default_codecs::{
    BoolCodec, BytesCodec, EnumCodec, NumericCodec, PlatformNameCodec, StaticCodec, StringCodec,
    SubMessageCodec, TimeOfDayCodec,
};
use crate::codec::schema::{FieldSchema, FieldValue, WireTypeTag};
use crate::error::CodecError;
use crate::util::bitset::Bitset;
use crate::ModemId;

/// Well-known selector resolving to the default codec of a wire type.
pub const DEFAULT_CODEC: &str = "_default";

pub trait FieldCodec: Send + Sync {
    /// Checks that the schema carries every option this codec requires.
    fn validate(&self, field: &FieldSchema) -> Result<(), CodecError>;

    fn encode(&self, field: &FieldSchema, value: &FieldValue) -> Result<Bitset, CodecError>;

    /// The run an absent optional field occupies on the wire.
    fn encode_absent(&self, field: &FieldSchema) -> Result<Bitset, CodecError>;

    /// Consumes this field's run from the front of `bits`. `Ok(None)` means
    /// the field was encoded as absent.
    fn decode(&self, field: &FieldSchema, bits: &mut Bitset)
        -> Result<Option<FieldValue>, CodecError>;

    /// Size in bits of `value` (or of an absent field when `None`).
    fn size(&self, field: &FieldSchema, value: Option<&FieldValue>) -> Result<usize, CodecError>;

    fn min_size(&self, field: &FieldSchema) -> Result<usize, CodecError>;

    fn max_size(&self, field: &FieldSchema) -> Result<usize, CodecError>;

    fn is_variable_size(&self) -> bool {
        false
    }
}

/// Bijection between platform names and modem ids, registered from
/// configuration before the first encode.
#[derive(Default)]
pub struct PlatformTable {
    inner: RwLock<PlatformTableInner>,
}

#[derive(Default)]
struct PlatformTableInner {
    by_name: FxHashMap<String, ModemId>,
    by_id: FxHashMap<ModemId, String>,
}

impl PlatformTable {
    pub fn insert(&self, name: &str, id: ModemId) -> Result<(), CodecError> {
        let mut inner = self.inner.write().expect("platform table poisoned");
        if inner.by_name.contains_key(name) || inner.by_id.contains_key(&id) {
            return Err(CodecError::Schema(format!(
                "platform mapping {name:?} <-> {id} collides with an existing entry"
            )));
        }
        inner.by_name.insert(name.to_string(), id);
        inner.by_id.insert(id, name.to_string());
        Ok(())
    }

    pub fn id_of(&self, name: &str) -> Option<ModemId> {
        self.inner
            .read()
            .expect("platform table poisoned")
            .by_name
            .get(name)
            .copied()
    }

    pub fn name_of(&self, id: ModemId) -> Option<String> {
        self.inner
            .read()
            .expect("platform table poisoned")
            .by_id
            .get(&id)
            .cloned()
    }
}

pub struct CodecRegistry {
    codecs: RwLock<FxHashMap<(WireTypeTag, String), Arc<dyn FieldCodec>>>,
    platforms: Arc<PlatformTable>,
}

impl CodecRegistry {
    /// A registry with the default codec bound for every wire type.
    pub fn new() -> Arc<CodecRegistry> {
        Arc::new_cyclic(|registry: &Weak<CodecRegistry>| {
            let platforms = Arc::new(PlatformTable::default());

            let mut codecs: FxHashMap<(WireTypeTag, String), Arc<dyn FieldCodec>> =
                FxHashMap::default();
            let mut add = |tag, codec: Arc<dyn FieldCodec>| {
                codecs.insert((tag, DEFAULT_CODEC.to_string()), codec);
            };
            add(WireTypeTag::Numeric, Arc::new(NumericCodec));
            add(WireTypeTag::Bool, Arc::new(BoolCodec));
            add(WireTypeTag::String, Arc::new(StringCodec));
            add(WireTypeTag::Bytes, Arc::new(BytesCodec));
            add(WireTypeTag::Enum, Arc::new(EnumCodec));
            add(
                WireTypeTag::Message,
                Arc::new(SubMessageCodec::new(registry.clone())),
            );
            add(WireTypeTag::Static, Arc::new(StaticCodec));
            add(WireTypeTag::TimeOfDay, Arc::new(TimeOfDayCodec));
            add(
                WireTypeTag::PlatformName,
                Arc::new(PlatformNameCodec::new(platforms.clone())),
            );

            CodecRegistry {
                codecs: RwLock::new(codecs),
                platforms,
            }
        })
    }

    /// Binds a codec under `(tag, name)`, replacing any previous binding.
    pub fn register(&self, tag: WireTypeTag, name: &str, codec: Arc<dyn FieldCodec>) {
        self.codecs
            .write()
            .expect("codec registry poisoned")
            .insert((tag, name.to_string()), codec);
    }

    pub fn resolve(&self, field: &FieldSchema) -> Result<Arc<dyn FieldCodec>, CodecError> {
        let tag = field.wire_type.tag();
        let name = field.codec.as_deref().unwrap_or(DEFAULT_CODEC);
        self.codecs
            .read()
            .expect("codec registry poisoned")
            .get(&(tag, name.to_string()))
            .cloned()
            .ok_or_else(|| CodecError::CodecNotFound {
                wire_type: tag.name(),
                name: name.to_string(),
            })
    }

    /// Registers a platform name <-> modem id pair from configuration.
    pub fn add_platform(&self, name: &str, id: ModemId) -> Result<(), CodecError> {
        self.platforms.insert(name, id)
    }

    pub fn platforms(&self) -> &PlatformTable {
        &self.platforms
    }
}
