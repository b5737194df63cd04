//! Payload storage backends.
//!
//! Two backends persist bulk array payloads behind one capability interface:
//! a self-contained archive file per item for small payloads, and a dataset
//! file with a fixed data region for large arrays, which supports writing a
//! sub-region in place during streaming acquisition.

mod archive;
mod dataset;

pub use archive::ArchiveHandler;
pub use dataset::DatasetHandler;

use crate::error::{Result, StoreError};
use crate::types::{ArrayData, HandlerKind, HandlerRef, ItemId, Region};

/// Capability interface implemented by payload backends.
///
/// Callers branch on `supports_partial_write`, never on the concrete type.
pub trait StorageHandler: Send + Sync {
    /// Which backend this is.
    fn kind(&self) -> HandlerKind;

    /// Persist a payload for `id`, returning the locator to store in the
    /// index. Safe to call repeatedly for the same id (overwrite semantics).
    fn write(&self, id: ItemId, array: &ArrayData) -> Result<HandlerRef>;

    /// Read a payload back. A missing or corrupt payload is a per-item
    /// recoverable error; callers flag the item rather than abort the load.
    fn read(&self, handler_ref: &HandlerRef) -> Result<ArrayData>;

    /// Remove the underlying storage. Idempotent: already-missing storage
    /// is not an error.
    fn delete(&self, handler_ref: &HandlerRef) -> Result<()>;

    /// Size of the stored payload in bytes, zero if missing.
    fn payload_size(&self, handler_ref: &HandlerRef) -> Result<u64>;

    /// Whether `write_partial` is available.
    fn supports_partial_write(&self) -> bool {
        false
    }

    /// Write a sub-region of an existing array in place.
    ///
    /// `bytes` holds the region's elements in row-major order. Backends
    /// without the capability fail with an unsupported-operation error.
    fn write_partial(&self, handler_ref: &HandlerRef, region: &Region, bytes: &[u8]) -> Result<()> {
        let _ = (handler_ref, region, bytes);
        Err(StoreError::UnsupportedOperation(format!(
            "partial writes are not supported by the {:?} handler",
            self.kind()
        )))
    }
}

/// Check that a handler reference belongs to this backend.
pub(crate) fn check_kind(handler_ref: &HandlerRef, expected: HandlerKind) -> Result<()> {
    if handler_ref.kind != expected {
        return Err(StoreError::HandlerMismatch(handler_ref.kind));
    }
    Ok(())
}
