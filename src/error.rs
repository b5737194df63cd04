//! Error types for the project store.

use crate::types::{HandlerKind, ItemId};
use thiserror::Error;

/// Main error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Item not found: {0}")]
    ItemNotFound(ItemId),

    #[error("No schema upgrade path from version {from} to {to}")]
    NoUpgradePath { from: u32, to: u32 },

    #[error("Unknown field '{field}' for item type {item_type}")]
    UnknownField { item_type: String, field: String },

    #[error("Type mismatch for field '{field}': expected {expected}")]
    TypeMismatch { field: String, expected: String },

    #[error("Payload missing: {0}")]
    PayloadMissing(String),

    #[error("Payload corrupt: {0}")]
    PayloadCorrupt(String),

    #[error("Migration failed at step '{step}': {reason}")]
    Migration {
        step: String,
        item: Option<ItemId>,
        reason: String,
    },

    #[error("Project is locked by another process")]
    Locked,

    #[error("Project is read-only")]
    ReadOnly,

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Handler mismatch: payload is owned by the {0:?} handler")]
    HandlerMismatch(HandlerKind),

    #[error("Project version {found} is newer than supported version {supported}")]
    VersionTooNew { found: u32, supported: u32 },

    #[error("Project requires migration from version {found} to {current}")]
    MigrationRequired { found: u32, current: u32 },

    #[error("Region out of bounds: {0}")]
    RegionOutOfBounds(String),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Project not initialized")]
    NotInitialized,
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// A per-item failure collected during project load.
///
/// Load never aborts on a single damaged item; the failure is surfaced here
/// and the rest of the project opens normally.
#[derive(Debug)]
pub struct ItemLoadError {
    /// The item that failed to load, when its identity could be parsed.
    pub item: Option<ItemId>,
    /// What went wrong.
    pub error: StoreError,
}

impl std::fmt::Display for ItemLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.item {
            Some(id) => write!(f, "item {}: {}", id, self.error),
            None => write!(f, "unidentified item: {}", self.error),
        }
    }
}
