//! Core types for the project store.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Current schema version written by this build.
pub const SCHEMA_VERSION: u32 = 3;

/// Unique identifier for a persistent item.
///
/// Assigned at creation, immutable for the item's lifetime, never reused.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemId(pub Uuid);

impl ItemId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        ItemId(Uuid::new_v4())
    }

    /// Derive a deterministic identifier from an existing one.
    ///
    /// Used when a migration step needs to mint a companion item (e.g. a
    /// display item split out of a combined record) and repeated runs must
    /// agree on the result.
    pub fn derived(&self, tag: &str) -> Self {
        ItemId(Uuid::new_v5(&self.0, tag.as_bytes()))
    }

    /// Parse from a hyphenated string.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(ItemId(Uuid::parse_str(s)?))
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ItemId({})", self.0)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards");
        Timestamp(duration.as_micros() as i64)
    }

    /// Return a timestamp strictly after `self`, no earlier than now.
    ///
    /// Modification timestamps must only move forward even when the clock
    /// resolution makes two writes land on the same microsecond.
    pub fn advanced(self) -> Self {
        let now = Self::now();
        if now.0 > self.0 {
            now
        } else {
            Timestamp(self.0 + 1)
        }
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// The closed set of persisted item types.
///
/// Serialized into the index document using the snake_case tags below.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    DataItem,
    DisplayItem,
    Computation,
    Connection,
    DataStructure,
    DataGroup,
}

impl ItemType {
    /// Stable type tag used in the index document.
    pub fn tag(&self) -> &'static str {
        match self {
            ItemType::DataItem => "data_item",
            ItemType::DisplayItem => "display_item",
            ItemType::Computation => "computation",
            ItemType::Connection => "connection",
            ItemType::DataStructure => "data_structure",
            ItemType::DataGroup => "data_group",
        }
    }

    /// Parse a type tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "data_item" => Some(ItemType::DataItem),
            "display_item" => Some(ItemType::DisplayItem),
            "computation" => Some(ItemType::Computation),
            "connection" => Some(ItemType::Connection),
            "data_structure" => Some(ItemType::DataStructure),
            "data_group" => Some(ItemType::DataGroup),
            _ => None,
        }
    }

    /// All item types, in index order.
    pub fn all() -> &'static [ItemType] {
        &[
            ItemType::DataItem,
            ItemType::DisplayItem,
            ItemType::Computation,
            ItemType::Connection,
            ItemType::DataStructure,
            ItemType::DataGroup,
        ]
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// A property value.
///
/// The set is closed so that every backend can serialize every value without
/// per-backend special cases.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
    Uuid(ItemId),
    Timestamp(Timestamp),
    Record(BTreeMap<String, PropertyValue>),
    List(Vec<PropertyValue>),
}

impl PropertyValue {
    /// Human-readable name of the value's type, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            PropertyValue::Integer(_) => "integer",
            PropertyValue::Float(_) => "float",
            PropertyValue::String(_) => "string",
            PropertyValue::Boolean(_) => "boolean",
            PropertyValue::Uuid(_) => "uuid",
            PropertyValue::Timestamp(_) => "timestamp",
            PropertyValue::Record(_) => "record",
            PropertyValue::List(_) => "list",
        }
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Integer(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Float(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::String(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::String(v)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Boolean(v)
    }
}

/// Element type of a bulk array payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size(&self) -> usize {
        match self {
            DType::U8 | DType::I8 => 1,
            DType::U16 | DType::I16 => 2,
            DType::U32 | DType::I32 | DType::F32 => 4,
            DType::U64 | DType::I64 | DType::F64 => 8,
        }
    }

    /// Stable on-disk tag.
    pub fn tag(&self) -> u8 {
        match self {
            DType::U8 => 0,
            DType::I8 => 1,
            DType::U16 => 2,
            DType::I16 => 3,
            DType::U32 => 4,
            DType::I32 => 5,
            DType::U64 => 6,
            DType::I64 => 7,
            DType::F32 => 8,
            DType::F64 => 9,
        }
    }

    /// Parse an on-disk tag.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(DType::U8),
            1 => Some(DType::I8),
            2 => Some(DType::U16),
            3 => Some(DType::I16),
            4 => Some(DType::U32),
            5 => Some(DType::I32),
            6 => Some(DType::U64),
            7 => Some(DType::I64),
            8 => Some(DType::F32),
            9 => Some(DType::F64),
            _ => None,
        }
    }
}

/// A bulk array payload: dtype, shape, and row-major bytes.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayData {
    pub dtype: DType,
    pub shape: Vec<u64>,
    pub bytes: Vec<u8>,
}

impl ArrayData {
    /// Build from parts, checking that the byte length matches the shape.
    pub fn new(dtype: DType, shape: Vec<u64>, bytes: Vec<u8>) -> crate::error::Result<Self> {
        let expected = shape.iter().product::<u64>() as usize * dtype.size();
        if bytes.len() != expected {
            return Err(crate::error::StoreError::ShapeMismatch(format!(
                "shape {:?} needs {} bytes, got {}",
                shape,
                expected,
                bytes.len()
            )));
        }
        Ok(Self { dtype, shape, bytes })
    }

    /// Zero-filled array of the given shape.
    pub fn zeros(dtype: DType, shape: Vec<u64>) -> Self {
        let len = shape.iter().product::<u64>() as usize * dtype.size();
        Self {
            dtype,
            shape,
            bytes: vec![0u8; len],
        }
    }

    /// Number of elements.
    pub fn element_count(&self) -> u64 {
        self.shape.iter().product()
    }

    /// Total payload size in bytes.
    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }
}

impl fmt::Debug for ArrayData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ArrayData({:?}, shape {:?}, {} bytes)",
            self.dtype,
            self.shape,
            self.bytes.len()
        )
    }
}

/// A rectangular sub-region of an array, for partial writes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Region {
    /// Starting index along each axis.
    pub offset: Vec<u64>,
    /// Extent along each axis.
    pub shape: Vec<u64>,
}

impl Region {
    pub fn new(offset: Vec<u64>, shape: Vec<u64>) -> Self {
        Self { offset, shape }
    }

    /// Number of elements covered by the region.
    pub fn element_count(&self) -> u64 {
        self.shape.iter().product()
    }

    /// Check the region fits inside an array of shape `outer`.
    pub fn check_within(&self, outer: &[u64]) -> crate::error::Result<()> {
        if self.offset.len() != outer.len() || self.shape.len() != outer.len() {
            return Err(crate::error::StoreError::RegionOutOfBounds(format!(
                "region rank {} does not match array rank {}",
                self.offset.len(),
                outer.len()
            )));
        }
        for axis in 0..outer.len() {
            if self.offset[axis] + self.shape[axis] > outer[axis] {
                return Err(crate::error::StoreError::RegionOutOfBounds(format!(
                    "axis {}: {}+{} exceeds {}",
                    axis, self.offset[axis], self.shape[axis], outer[axis]
                )));
            }
        }
        Ok(())
    }
}

/// Which backend owns a payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    /// Self-contained single-file archive; small payloads, easy transport.
    Archive,
    /// Dataset file with a fixed data region; large arrays, partial writes.
    Dataset,
}

/// Locator for a payload: owning backend plus a path relative to the
/// project's data directory.
///
/// Exactly one handler reference exists per item payload at any time;
/// switching backends goes through an explicit migrate-handler operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerRef {
    pub kind: HandlerKind,
    pub locator: String,
}

/// One persisted item: identity, type tag, bookkeeping counters, properties,
/// relationship references, and an optional payload locator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    /// Stable identity.
    pub id: ItemId,

    /// Schema type tag.
    pub item_type: ItemType,

    /// Creation time, immutable.
    pub created: Timestamp,

    /// Last committed mutation time.
    pub modified: Timestamp,

    /// Monotonically increasing count of committed mutations.
    pub modification_count: u64,

    /// Streaming acquisition target; forces the dataset handler.
    #[serde(default)]
    pub is_live: bool,

    /// Named properties.
    pub properties: BTreeMap<String, PropertyValue>,

    /// UUID references to source items. Not ownership: deleting a source
    /// orphans dependents, it never cascades.
    #[serde(default)]
    pub source_uuids: Vec<ItemId>,

    /// Payload locator, present once the item has a persisted array.
    #[serde(default)]
    pub handler_ref: Option<HandlerRef>,
}

impl ItemRecord {
    /// Create a new in-memory item. No handler is assigned until the first
    /// write with a payload.
    pub fn new(item_type: ItemType) -> Self {
        let now = Timestamp::now();
        Self {
            id: ItemId::new(),
            item_type,
            created: now,
            modified: now,
            modification_count: 0,
            is_live: false,
            properties: BTreeMap::new(),
            source_uuids: Vec::new(),
            handler_ref: None,
        }
    }

    /// Builder: set a property.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Builder: mark as a live (streaming) item.
    pub fn live(mut self) -> Self {
        self.is_live = true;
        self
    }

    /// Builder: add a source reference.
    pub fn with_source(mut self, source: ItemId) -> Self {
        self.source_uuids.push(source);
        self
    }
}

/// Project-level statistics.
#[derive(Clone, Debug, Default)]
pub struct ProjectStats {
    pub item_count: u64,
    pub data_item_count: u64,
    pub archive_payload_count: u64,
    pub dataset_payload_count: u64,
    pub archive_bytes: u64,
    pub dataset_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_id_roundtrip() {
        let id = ItemId::new();
        let parsed = ItemId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_derived_id_deterministic() {
        let id = ItemId::new();
        assert_eq!(id.derived("display"), id.derived("display"));
        assert_ne!(id.derived("display"), id.derived("other"));
    }

    #[test]
    fn test_timestamp_advanced_monotonic() {
        let t = Timestamp::now();
        let later = t.advanced();
        assert!(later > t);
        // Advancing a far-future timestamp still moves forward.
        let future = Timestamp(i64::MAX - 10);
        assert!(future.advanced() > future);
    }

    #[test]
    fn test_array_data_shape_check() {
        let ok = ArrayData::new(DType::F64, vec![10, 10], vec![0u8; 800]);
        assert!(ok.is_ok());

        let bad = ArrayData::new(DType::F64, vec![10, 10], vec![0u8; 10]);
        assert!(bad.is_err());
    }

    #[test]
    fn test_region_bounds() {
        let region = Region::new(vec![2, 2], vec![4, 4]);
        assert!(region.check_within(&[10, 10]).is_ok());
        assert!(region.check_within(&[5, 5]).is_err());
        assert!(region.check_within(&[10]).is_err());
    }

    #[test]
    fn test_item_type_tags() {
        for &t in ItemType::all() {
            assert_eq!(ItemType::from_tag(t.tag()), Some(t));
        }
        assert_eq!(ItemType::from_tag("bogus"), None);
    }

    #[test]
    fn test_dtype_tags() {
        for tag in 0u8..=9 {
            let dtype = DType::from_tag(tag).unwrap();
            assert_eq!(dtype.tag(), tag);
        }
        assert!(DType::from_tag(42).is_none());
    }

    #[test]
    fn test_property_value_json_roundtrip() {
        let mut record = BTreeMap::new();
        record.insert("count".to_string(), PropertyValue::Integer(7));
        let value = PropertyValue::List(vec![
            PropertyValue::Float(1.5),
            PropertyValue::Record(record),
            PropertyValue::Uuid(ItemId::new()),
        ]);

        let encoded = serde_json::to_vec(&value).unwrap();
        let decoded: PropertyValue = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(value, decoded);
    }
}
