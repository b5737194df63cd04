//! Field definitions for each item type.

use crate::error::{Result, StoreError};
use crate::types::{ItemRecord, ItemType, PropertyValue};

/// The closed set of field value types.
///
/// Every backend can serialize every one of these; nothing else is allowed
/// through the serialization boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldType {
    Integer,
    Float,
    String,
    Boolean,
    Uuid,
    Timestamp,
    /// Nested record of named values.
    Record,
    /// List whose elements are all records.
    RecordList,
    /// Opaque reference to a bulk array payload. Never carried as a
    /// property value; it marks item types that may own a payload.
    ArrayRef,
}

impl FieldType {
    /// Whether a property value is acceptable for this field type.
    pub fn accepts(&self, value: &PropertyValue) -> bool {
        match (self, value) {
            (FieldType::Integer, PropertyValue::Integer(_)) => true,
            (FieldType::Float, PropertyValue::Float(_)) => true,
            // Integer literals are fine where a float is expected.
            (FieldType::Float, PropertyValue::Integer(_)) => true,
            (FieldType::String, PropertyValue::String(_)) => true,
            (FieldType::Boolean, PropertyValue::Boolean(_)) => true,
            (FieldType::Uuid, PropertyValue::Uuid(_)) => true,
            (FieldType::Timestamp, PropertyValue::Timestamp(_)) => true,
            (FieldType::Record, PropertyValue::Record(_)) => true,
            (FieldType::RecordList, PropertyValue::List(items)) => {
                items.iter().all(|i| matches!(i, PropertyValue::Record(_)))
            }
            (FieldType::ArrayRef, _) => false,
            _ => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::String => "string",
            FieldType::Boolean => "boolean",
            FieldType::Uuid => "uuid",
            FieldType::Timestamp => "timestamp",
            FieldType::Record => "record",
            FieldType::RecordList => "record list",
            FieldType::ArrayRef => "array reference",
        }
    }
}

/// One named field of an item type.
#[derive(Clone, Debug)]
pub struct FieldDescriptor {
    pub name: &'static str,
    pub field_type: FieldType,
    /// Filled in at validation time when the property is absent.
    pub default: Option<PropertyValue>,
}

impl FieldDescriptor {
    fn new(name: &'static str, field_type: FieldType) -> Self {
        Self {
            name,
            field_type,
            default: None,
        }
    }

    fn with_default(mut self, default: PropertyValue) -> Self {
        self.default = Some(default);
        self
    }
}

/// Current field definitions for an item type.
///
/// Used by the serialization boundary and by the migration engine to know
/// the target shape.
pub fn describe(item_type: ItemType) -> Vec<FieldDescriptor> {
    use FieldType::*;

    match item_type {
        ItemType::DataItem => vec![
            FieldDescriptor::new("title", String).with_default(PropertyValue::String("".into())),
            FieldDescriptor::new("caption", String),
            FieldDescriptor::new("session_id", String),
            FieldDescriptor::new("category", String)
                .with_default(PropertyValue::String("persistent".into())),
            FieldDescriptor::new("timezone", String),
            FieldDescriptor::new("metadata", Record),
            FieldDescriptor::new("intensity_calibration", Record),
            FieldDescriptor::new("dimensional_calibrations", RecordList),
            FieldDescriptor::new("data", ArrayRef),
        ],
        ItemType::DisplayItem => vec![
            FieldDescriptor::new("title", String).with_default(PropertyValue::String("".into())),
            FieldDescriptor::new("display_type", String),
            FieldDescriptor::new("calibration_style", String),
            FieldDescriptor::new("graphics", RecordList),
        ],
        ItemType::Computation => vec![
            FieldDescriptor::new("label", String),
            FieldDescriptor::new("expression", String),
            FieldDescriptor::new("inputs", RecordList),
            FieldDescriptor::new("outputs", RecordList),
            FieldDescriptor::new("enabled", Boolean).with_default(PropertyValue::Boolean(true)),
        ],
        ItemType::Connection => vec![
            FieldDescriptor::new("connection_type", String),
            FieldDescriptor::new("source_property", String),
            FieldDescriptor::new("target_property", String),
        ],
        ItemType::DataStructure => vec![
            FieldDescriptor::new("structure_type", String),
            FieldDescriptor::new("fields", Record),
        ],
        ItemType::DataGroup => vec![
            FieldDescriptor::new("title", String).with_default(PropertyValue::String("".into())),
        ],
    }
}

/// Whether an item type declares a bulk array payload field.
pub fn has_array_field(item_type: ItemType) -> bool {
    describe(item_type)
        .iter()
        .any(|f| f.field_type == FieldType::ArrayRef)
}

/// Check an item's properties against the current field definitions and fill
/// in defaults for absent fields.
///
/// Unknown fields and type mismatches are schema errors, fatal for the
/// affected item but never for the project.
pub fn validate(item: &mut ItemRecord) -> Result<()> {
    let descriptors = describe(item.item_type);

    for (name, value) in &item.properties {
        let descriptor = descriptors
            .iter()
            .find(|d| d.name == name.as_str())
            .ok_or_else(|| StoreError::UnknownField {
                item_type: item.item_type.tag().to_string(),
                field: name.clone(),
            })?;

        if !descriptor.field_type.accepts(value) {
            return Err(StoreError::TypeMismatch {
                field: name.clone(),
                expected: descriptor.field_type.name().to_string(),
            });
        }
    }

    for descriptor in &descriptors {
        if let Some(default) = &descriptor.default {
            item.properties
                .entry(descriptor.name.to_string())
                .or_insert_with(|| default.clone());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_type_has_fields() {
        for &item_type in ItemType::all() {
            assert!(!describe(item_type).is_empty());
        }
    }

    #[test]
    fn test_validate_fills_defaults() {
        let mut item = ItemRecord::new(ItemType::DataItem);
        validate(&mut item).unwrap();

        assert_eq!(
            item.properties.get("title"),
            Some(&PropertyValue::String("".into()))
        );
        assert_eq!(
            item.properties.get("category"),
            Some(&PropertyValue::String("persistent".into()))
        );
    }

    #[test]
    fn test_validate_rejects_unknown_field() {
        let mut item = ItemRecord::new(ItemType::Connection).with_property("bogus", 1i64);
        let err = validate(&mut item).unwrap_err();
        assert!(matches!(err, StoreError::UnknownField { .. }));
    }

    #[test]
    fn test_validate_rejects_type_mismatch() {
        let mut item = ItemRecord::new(ItemType::Computation).with_property("enabled", "yes");
        let err = validate(&mut item).unwrap_err();
        assert!(matches!(err, StoreError::TypeMismatch { .. }));
    }

    #[test]
    fn test_float_accepts_integer() {
        assert!(FieldType::Float.accepts(&PropertyValue::Integer(3)));
        assert!(!FieldType::Integer.accepts(&PropertyValue::Float(3.0)));
    }

    #[test]
    fn test_record_list_elements_checked() {
        let good = PropertyValue::List(vec![PropertyValue::Record(Default::default())]);
        let bad = PropertyValue::List(vec![PropertyValue::Integer(1)]);
        assert!(FieldType::RecordList.accepts(&good));
        assert!(!FieldType::RecordList.accepts(&bad));
    }

    #[test]
    fn test_array_ref_never_a_property() {
        assert!(!FieldType::ArrayRef.accepts(&PropertyValue::Integer(0)));
        assert!(has_array_field(ItemType::DataItem));
        assert!(!has_array_field(ItemType::Connection));
    }
}
