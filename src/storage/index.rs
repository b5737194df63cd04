//! Project index document.
//!
//! A JSON document holding the project schema version and one entry per
//! persistent item. Written via temp-file-then-rename so a crash mid-write
//! leaves the previous index intact.

use crate::error::{Result, StoreError};
use crate::types::ItemRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Well-known name of the index document inside a project directory.
pub const INDEX_FILE_NAME: &str = "project.pstore";

/// Sibling directory holding payload files.
pub const DATA_DIR_NAME: &str = "data";

/// Advisory lock file emitted on open.
pub const LOCK_FILE_NAME: &str = "LOCK";

#[derive(Serialize, Deserialize)]
struct IndexDocument {
    version: u32,
    items: Vec<Value>,
}

/// Read just the version stamp of an index document.
pub fn read_version(path: &Path) -> Result<u32> {
    let bytes = fs::read(path)?;
    let document: IndexDocument =
        serde_json::from_slice(&bytes).map_err(|e| StoreError::InvalidFormat(e.to_string()))?;
    Ok(document.version)
}

/// Load the index document: version stamp plus raw item entries.
///
/// Entries are returned unparsed so that per-item failures can be collected
/// instead of aborting the whole load.
pub fn load_document(path: &Path) -> Result<(u32, Vec<Value>)> {
    let bytes = fs::read(path)?;
    let document: IndexDocument =
        serde_json::from_slice(&bytes).map_err(|e| StoreError::InvalidFormat(e.to_string()))?;
    Ok((document.version, document.items))
}

/// Write the index document atomically.
///
/// The document is written to a temporary file in the same directory,
/// synced, then renamed over the target. The previous index is only
/// replaced once the rename succeeds.
pub fn write_document_atomic(path: &Path, version: u32, items: Vec<Value>) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::InvalidFormat("index path has no parent".into()))?;

    let document = IndexDocument { version, items };
    let bytes = serde_json::to_vec_pretty(&document)?;

    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(&bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;

    Ok(())
}

/// Parse a raw index entry into a typed item record.
pub fn entry_to_item(entry: Value) -> Result<ItemRecord> {
    serde_json::from_value(entry).map_err(|e| StoreError::Deserialization(e.to_string()))
}

/// Serialize an item record into a raw index entry.
pub fn item_to_entry(item: &ItemRecord) -> Result<Value> {
    serde_json::to_value(item).map_err(|e| StoreError::Serialization(e.to_string()))
}
