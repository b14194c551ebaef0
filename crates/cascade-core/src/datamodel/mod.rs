//! # Data-model value types
//!
//! Composite payload types used on streams, plus the pluggable,
//! type-tagged binary codec surface. The engine core treats payloads as
//! opaque; these types exist so multi-input joins and aggregations have a
//! common vocabulary, and so deployments can plug their own wire format in
//! behind [`ValueCodec`] — the bit layout itself is not the core's
//! concern, only that encode/decode are symmetric.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use fxhash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::item::Item;

/// Errors raised by payload codecs.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// No codec is registered under the frame's type tag.
    #[error("unknown codec tag: {0}")]
    UnknownTag(u32),

    /// The item's payload is not the type the codec handles.
    #[error("payload type mismatch for codec tag {0}")]
    TypeMismatch(u32),

    /// The frame is too short to carry a type tag.
    #[error("truncated frame: {0} bytes")]
    TruncatedFrame(usize),

    /// Encoding failed.
    #[error("encode failed: {0}")]
    Encode(String),

    /// Decoding failed.
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Identifies one slot of an [`ItemsByTag`] bag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag(pub u16);

/// A keyed bag of items assembled from multiple streams.
///
/// Distinguishes "tag present with no value" (`Some(None)` from
/// [`get`](ItemsByTag::get)) from "tag absent" (`None`), so no reserved
/// sentinel value is ever needed.
#[derive(Debug, Default, Clone)]
pub struct ItemsByTag {
    slots: FxHashMap<u16, Option<Item>>,
}

impl ItemsByTag {
    /// Creates an empty bag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a slot: `Some(item)` for a value, `None` for an explicit
    /// "present with no value" marker.
    pub fn put(&mut self, tag: Tag, value: Option<Item>) {
        self.slots.insert(tag.0, value);
    }

    /// Looks up a slot.
    ///
    /// Returns `None` when the tag was never stored, `Some(None)` when it
    /// was stored with no value, and `Some(Some(item))` otherwise.
    #[must_use]
    pub fn get(&self, tag: Tag) -> Option<&Option<Item>> {
        self.slots.get(&tag.0)
    }

    /// Returns whether the tag was stored at all.
    #[must_use]
    pub fn contains(&self, tag: Tag) -> bool {
        self.slots.contains_key(&tag.0)
    }

    /// Returns the number of stored slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns whether no slot is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// A key/value pair stamped with an event timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampedEntry<K, V> {
    /// Event timestamp in milliseconds.
    pub timestamp: i64,
    /// Entry key.
    pub key: K,
    /// Entry value.
    pub value: V,
}

impl<K, V> TimestampedEntry<K, V> {
    /// Creates a timestamped entry.
    pub fn new(timestamp: i64, key: K, value: V) -> Self {
        Self {
            timestamp,
            key,
            value,
        }
    }
}

/// Pluggable, type-tagged payload codec.
///
/// Implementations encode one concrete payload type symmetrically:
/// `decode(encode(item))` observes the same payload. The tag identifies
/// the codec inside a frame so heterogeneous streams stay self-describing.
pub trait ValueCodec: Send + Sync {
    /// The tag written into frames this codec produces.
    fn type_tag(&self) -> u32;

    /// Encodes the item's payload.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::TypeMismatch`] when the payload is not the
    /// codec's type, or [`CodecError::Encode`] on serialization failure.
    fn encode(&self, item: &Item) -> Result<Vec<u8>, CodecError>;

    /// Decodes a payload previously produced by [`encode`](Self::encode).
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] on malformed input.
    fn decode(&self, bytes: &[u8]) -> Result<Item, CodecError>;
}

/// Serde-JSON backed codec for any serializable payload type.
pub struct JsonCodec<T> {
    tag: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    /// Creates a codec writing frames under `tag`.
    #[must_use]
    pub fn new(tag: u32) -> Self {
        Self {
            tag,
            _marker: PhantomData,
        }
    }
}

impl<T> ValueCodec for JsonCodec<T>
where
    T: Any + Send + Sync + Serialize + DeserializeOwned,
{
    fn type_tag(&self) -> u32 {
        self.tag
    }

    fn encode(&self, item: &Item) -> Result<Vec<u8>, CodecError> {
        let payload = item
            .downcast_ref::<T>()
            .ok_or(CodecError::TypeMismatch(self.tag))?;
        serde_json::to_vec(payload).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Item, CodecError> {
        let payload: T =
            serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))?;
        Ok(Item::new(payload))
    }
}

/// Registry dispatching frames to codecs by type tag.
#[derive(Default)]
pub struct CodecRegistry {
    by_tag: FxHashMap<u32, Arc<dyn ValueCodec>>,
}

impl CodecRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a codec under its own tag, replacing any previous one.
    pub fn register(&mut self, codec: Arc<dyn ValueCodec>) {
        self.by_tag.insert(codec.type_tag(), codec);
    }

    /// Encodes an item into a self-describing frame: 4-byte little-endian
    /// tag followed by the codec's payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnknownTag`] for an unregistered tag, plus
    /// any codec error.
    pub fn encode_tagged(&self, tag: u32, item: &Item) -> Result<Vec<u8>, CodecError> {
        let codec = self.by_tag.get(&tag).ok_or(CodecError::UnknownTag(tag))?;
        let mut frame = tag.to_le_bytes().to_vec();
        frame.extend(codec.encode(item)?);
        Ok(frame)
    }

    /// Decodes a frame produced by [`encode_tagged`](Self::encode_tagged).
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::TruncatedFrame`] for frames shorter than a
    /// tag, [`CodecError::UnknownTag`] for unregistered tags, plus any
    /// codec error.
    pub fn decode_tagged(&self, frame: &[u8]) -> Result<Item, CodecError> {
        if frame.len() < 4 {
            return Err(CodecError::TruncatedFrame(frame.len()));
        }
        let (tag_bytes, payload) = frame.split_at(4);
        let tag = u32::from_le_bytes(tag_bytes.try_into().unwrap_or([0; 4]));
        let codec = self.by_tag.get(&tag).ok_or(CodecError::UnknownTag(tag))?;
        codec.decode(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_items_by_tag_absent_vs_empty() {
        let mut bag = ItemsByTag::new();
        bag.put(Tag(0), Some(Item::new(5u32)));
        bag.put(Tag(1), None);

        // Present with a value.
        let slot0 = bag.get(Tag(0)).unwrap();
        assert_eq!(slot0.as_ref().unwrap().downcast_ref::<u32>(), Some(&5));
        // Present with no value: distinct from absent.
        assert!(bag.get(Tag(1)).unwrap().is_none());
        assert!(bag.contains(Tag(1)));
        // Absent entirely.
        assert!(bag.get(Tag(2)).is_none());
        assert!(!bag.contains(Tag(2)));
        assert_eq!(bag.len(), 2);
    }

    #[test]
    fn test_timestamped_entry_serde() {
        let entry = TimestampedEntry::new(1000, "k".to_string(), 7u64);
        let json = serde_json::to_string(&entry).unwrap();
        let back: TimestampedEntry<String, u64> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_json_codec_symmetric() {
        let codec = JsonCodec::<TimestampedEntry<String, u64>>::new(17);
        let item = Item::new(TimestampedEntry::new(5, "a".to_string(), 9u64));
        let bytes = codec.encode(&item).unwrap();
        let back = codec.decode(&bytes).unwrap();
        assert_eq!(
            back.downcast_ref::<TimestampedEntry<String, u64>>(),
            item.downcast_ref::<TimestampedEntry<String, u64>>()
        );
    }

    #[test]
    fn test_json_codec_type_mismatch() {
        let codec = JsonCodec::<u64>::new(1);
        let item = Item::new("not a u64".to_string());
        assert!(matches!(
            codec.encode(&item),
            Err(CodecError::TypeMismatch(1))
        ));
    }

    #[test]
    fn test_registry_round_trip_and_unknown_tag() {
        let mut registry = CodecRegistry::new();
        registry.register(Arc::new(JsonCodec::<u64>::new(3)));

        let frame = registry.encode_tagged(3, &Item::new(42u64)).unwrap();
        let back = registry.decode_tagged(&frame).unwrap();
        assert_eq!(back.downcast_ref::<u64>(), Some(&42));

        assert!(matches!(
            registry.encode_tagged(9, &Item::new(1u64)),
            Err(CodecError::UnknownTag(9))
        ));
        assert!(matches!(
            registry.decode_tagged(&[1, 2]),
            Err(CodecError::TruncatedFrame(2))
        ));
    }
}
