//! Versioned record model.
//!
//! Defines, per item type, the named fields and their value types, plus the
//! ordered upgrade transforms that bring records written by older builds up
//! to the current schema version.

mod fields;
mod upgrade;

pub use fields::{describe, has_array_field, validate, FieldDescriptor, FieldType};
pub use upgrade::{upgrade, upgrade_steps, RawRecord, UpgradeStep};
