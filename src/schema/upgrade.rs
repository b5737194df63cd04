//! Schema upgrade transforms.
//!
//! Each step is a pure transform on a raw (JSON) record, applied in order to
//! bring a record from an older schema version to the current one. Steps
//! never touch the disk; the migration engine decides where upgraded records
//! are written.

use crate::error::{Result, StoreError};
use crate::types::SCHEMA_VERSION;
use serde_json::{Map, Value};

/// A raw index entry as read from an older project, before typed parsing.
#[derive(Clone, Debug, PartialEq)]
pub struct RawRecord {
    pub entry: Map<String, Value>,
}

impl RawRecord {
    pub fn new(entry: Map<String, Value>) -> Self {
        Self { entry }
    }

    /// Rename a top-level key if present.
    fn rename(&mut self, from: &str, to: &str) {
        if let Some(value) = self.entry.remove(from) {
            self.entry.insert(to.to_string(), value);
        }
    }

    /// The properties map, created if absent.
    fn properties_mut(&mut self) -> &mut Map<String, Value> {
        let props = self
            .entry
            .entry("properties".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !props.is_object() {
            *props = Value::Object(Map::new());
        }
        props.as_object_mut().expect("properties is an object")
    }
}

/// One version-to-version transform.
pub struct UpgradeStep {
    pub from: u32,
    pub to: u32,
    pub name: &'static str,
    pub apply: fn(&mut RawRecord) -> Result<()>,
}

/// The ordered upgrade chain. Contiguous: step N's `to` is step N+1's `from`.
pub fn upgrade_steps() -> &'static [UpgradeStep] {
    &[
        UpgradeStep {
            from: 1,
            to: 2,
            name: "hoist_bookkeeping",
            apply: hoist_bookkeeping,
        },
        UpgradeStep {
            from: 2,
            to: 3,
            name: "rename_calibrations",
            apply: rename_calibrations,
        },
    ]
}

/// Apply all intervening upgrade steps, in order.
///
/// Fails with a schema error when no path exists from `from_version`, which
/// is fatal for the affected item, not the project.
pub fn upgrade(record: RawRecord, from_version: u32) -> Result<RawRecord> {
    if from_version == SCHEMA_VERSION {
        return Ok(record);
    }
    if from_version > SCHEMA_VERSION {
        return Err(StoreError::NoUpgradePath {
            from: from_version,
            to: SCHEMA_VERSION,
        });
    }

    let mut record = record;
    let mut version = from_version;
    for step in upgrade_steps() {
        if step.from == version {
            (step.apply)(&mut record)?;
            version = step.to;
        }
    }

    if version != SCHEMA_VERSION {
        return Err(StoreError::NoUpgradePath {
            from: from_version,
            to: SCHEMA_VERSION,
        });
    }

    Ok(record)
}

/// v1 -> v2.
///
/// Version 1 kept the item identity under a `uuid` key and its timestamps
/// inside the properties map; version 2 moved bookkeeping to top-level
/// fields and introduced the modification counter.
fn hoist_bookkeeping(record: &mut RawRecord) -> Result<()> {
    record.rename("uuid", "id");

    let props = record.properties_mut();
    let created = props.remove("created");
    let modified = props.remove("modified");

    let extract = |value: Option<Value>| -> Option<Value> {
        match value {
            Some(Value::Object(mut tagged)) => tagged.remove("Timestamp"),
            Some(other) => Some(other),
            None => None,
        }
    };

    if let Some(created) = extract(created) {
        record.entry.insert("created".to_string(), created);
    }
    if let Some(modified) = extract(modified) {
        record.entry.insert("modified".to_string(), modified);
    }

    record
        .entry
        .entry("modification_count".to_string())
        .or_insert_with(|| Value::from(0u64));

    Ok(())
}

/// v2 -> v3.
///
/// Calibration properties were renamed when combined items were split into
/// separate data and display records (the split itself is a structural
/// transform owned by the migration engine).
fn rename_calibrations(record: &mut RawRecord) -> Result<()> {
    let props = record.properties_mut();
    if let Some(value) = props.remove("intensity_calibration_dict") {
        props.insert("intensity_calibration".to_string(), value);
    }
    if let Some(value) = props.remove("spatial_calibrations") {
        props.insert("dimensional_calibrations".to_string(), value);
    }
    Ok(())
}
