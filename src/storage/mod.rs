//! On-disk project layout and the file storage system.
//!
//! A project is an index document plus a sibling data directory of payload
//! files. The index is never partially written; it is always replaced by an
//! atomic rename.

mod index;
mod system;

pub use index::{
    entry_to_item, item_to_entry, load_document, read_version, write_document_atomic,
    DATA_DIR_NAME, INDEX_FILE_NAME, LOCK_FILE_NAME,
};
pub use system::{FileStorageSystem, ProjectConfig, DEFAULT_DATASET_THRESHOLD};
