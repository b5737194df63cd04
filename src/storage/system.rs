//! File storage system.
//!
//! Owns the project layout, maps item identities to payload handlers,
//! translates item-level read/write/delete calls into handler calls plus
//! atomic index updates, and holds the advisory single-writer lock.

use super::index::{
    entry_to_item, item_to_entry, load_document, write_document_atomic, DATA_DIR_NAME,
    INDEX_FILE_NAME, LOCK_FILE_NAME,
};
use crate::error::{ItemLoadError, Result, StoreError};
use crate::handlers::{ArchiveHandler, DatasetHandler, StorageHandler};
use crate::schema;
use crate::types::{
    ArrayData, HandlerKind, ItemId, ItemRecord, ProjectStats, Region, SCHEMA_VERSION,
};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Payloads at or above this size go to the dataset handler by default.
pub const DEFAULT_DATASET_THRESHOLD: usize = 2 * 1024 * 1024;

/// Project configuration.
#[derive(Clone, Debug)]
pub struct ProjectConfig {
    /// Project directory (index document plus data directory live here).
    pub path: PathBuf,

    /// Size threshold selecting the dataset handler for new payloads.
    pub dataset_threshold: usize,

    /// Archive payload cache size (number of payloads).
    pub archive_cache_size: usize,

    /// Whether to create the project if it doesn't exist.
    pub create_if_missing: bool,

    /// Open without the writer lock; all mutating calls fail.
    pub read_only: bool,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./project"),
            dataset_threshold: DEFAULT_DATASET_THRESHOLD,
            archive_cache_size: 32,
            create_if_missing: true,
            read_only: false,
        }
    }
}

/// The file storage system for one project.
pub struct FileStorageSystem {
    /// Configuration.
    config: ProjectConfig,

    /// Lock file for exclusive access. Absent in read-only mode.
    _lock_file: Option<File>,

    /// In-memory index: all loaded item records.
    items: RwLock<HashMap<ItemId, ItemRecord>>,

    /// Archive payload backend.
    archive: ArchiveHandler,

    /// Dataset payload backend.
    dataset: DatasetHandler,

    /// Lock for write operations to keep index updates atomic.
    write_lock: Mutex<()>,
}

impl FileStorageSystem {
    /// Open an existing project or create a new one.
    ///
    /// A missing index at a fresh location is the normal initialization
    /// branch, not an error. Per-item failures (unparseable entries, missing
    /// payload files) are collected and returned alongside the system; one
    /// damaged item never aborts the load.
    pub fn open(config: ProjectConfig) -> Result<(Self, Vec<ItemLoadError>)> {
        let index_path = config.path.join(INDEX_FILE_NAME);

        if !index_path.exists() {
            if !config.create_if_missing {
                return Err(StoreError::NotInitialized);
            }
            fs::create_dir_all(&config.path)?;
            fs::create_dir_all(config.path.join(DATA_DIR_NAME))?;
            write_document_atomic(&index_path, SCHEMA_VERSION, Vec::new())?;
            debug!(path = %config.path.display(), "initialized new project");
        }

        let lock_file = if config.read_only {
            None
        } else {
            Some(Self::acquire_lock(&config.path)?)
        };

        let (version, entries) = load_document(&index_path)?;

        if version > SCHEMA_VERSION {
            return Err(StoreError::VersionTooNew {
                found: version,
                supported: SCHEMA_VERSION,
            });
        }
        if version < SCHEMA_VERSION {
            // Old layouts are never written silently; the migration engine
            // must produce a current-version project first.
            return Err(StoreError::MigrationRequired {
                found: version,
                current: SCHEMA_VERSION,
            });
        }

        let data_dir = config.path.join(DATA_DIR_NAME);
        let archive = ArchiveHandler::new(&data_dir, config.archive_cache_size)?;
        let dataset = DatasetHandler::new(&data_dir)?;

        let mut items = HashMap::with_capacity(entries.len());
        let mut errors = Vec::new();

        for entry in entries {
            let id_hint = entry
                .get("id")
                .and_then(|v| v.as_str())
                .and_then(|s| ItemId::parse(s).ok());

            let mut item = match entry_to_item(entry) {
                Ok(item) => item,
                Err(error) => {
                    warn!(item = ?id_hint, %error, "skipping unparseable index entry");
                    errors.push(ItemLoadError {
                        item: id_hint,
                        error,
                    });
                    continue;
                }
            };

            if let Err(error) = schema::validate(&mut item) {
                errors.push(ItemLoadError {
                    item: Some(item.id),
                    error,
                });
                continue;
            }

            items.insert(item.id, item);
        }

        let system = Self {
            config,
            _lock_file: lock_file,
            items: RwLock::new(items),
            archive,
            dataset,
            write_lock: Mutex::new(()),
        };

        // Flag items whose payload went missing out-of-band. The item stays
        // loaded; only its array read will fail.
        for item in system.items.read().values() {
            if let Some(handler_ref) = &item.handler_ref {
                match system.handler(handler_ref.kind).payload_size(handler_ref) {
                    Ok(0) => errors.push(ItemLoadError {
                        item: Some(item.id),
                        error: StoreError::PayloadMissing(handler_ref.locator.clone()),
                    }),
                    Ok(_) => {}
                    Err(error) => errors.push(ItemLoadError {
                        item: Some(item.id),
                        error,
                    }),
                }
            }
        }

        Ok((system, errors))
    }

    /// Write an item, with an optional bulk payload.
    ///
    /// The payload is written first and the index update is the final step,
    /// so a payload write failure never leaves a dangling index reference.
    /// On success the caller's record reflects the bumped modification
    /// counter, timestamp, and handler reference.
    pub fn write_item(&self, item: &mut ItemRecord, array: Option<&ArrayData>) -> Result<()> {
        if self.config.read_only {
            return Err(StoreError::ReadOnly);
        }
        let _guard = self.write_lock.lock();

        let mut updated = item.clone();
        schema::validate(&mut updated)?;

        if let Some(array) = array {
            if !schema::has_array_field(updated.item_type) {
                return Err(StoreError::UnsupportedOperation(format!(
                    "item type {} has no array field",
                    updated.item_type
                )));
            }

            // An existing payload stays with its owner; switching backends
            // goes through migrate_handler only.
            let kind = match &updated.handler_ref {
                Some(existing) => existing.kind,
                None => self.select_handler_kind(&updated, array),
            };

            let handler_ref = self.handler(kind).write(updated.id, array)?;
            updated.handler_ref = Some(handler_ref);
        }

        updated.modification_count += 1;
        updated.modified = updated.modified.advanced();

        let previous = self.items.write().insert(updated.id, updated.clone());
        match self.save_index() {
            Ok(()) => {
                *item = updated;
                Ok(())
            }
            Err(e) => {
                // Disk index unchanged; roll the in-memory index back too.
                let mut items = self.items.write();
                match previous {
                    Some(previous) => items.insert(updated.id, previous),
                    None => items.remove(&updated.id),
                };
                Err(e)
            }
        }
    }

    /// Read an item record.
    pub fn read_item(&self, id: ItemId) -> Result<ItemRecord> {
        self.items
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::ItemNotFound(id))
    }

    /// Read an item's bulk payload, if it has one.
    pub fn read_array(&self, id: ItemId) -> Result<Option<ArrayData>> {
        let handler_ref = match self.read_item(id)?.handler_ref {
            Some(handler_ref) => handler_ref,
            None => return Ok(None),
        };
        Ok(Some(self.handler(handler_ref.kind).read(&handler_ref)?))
    }

    /// Delete an item: index entry first, then the handler-owned payload.
    /// Tolerant of the item or its payload already being absent.
    pub fn delete_item(&self, id: ItemId) -> Result<()> {
        if self.config.read_only {
            return Err(StoreError::ReadOnly);
        }
        let _guard = self.write_lock.lock();

        let previous = self.items.write().remove(&id);
        let previous = match previous {
            Some(previous) => previous,
            None => return Ok(()),
        };

        if let Err(e) = self.save_index() {
            self.items.write().insert(id, previous);
            return Err(e);
        }

        if let Some(handler_ref) = &previous.handler_ref {
            self.handler(handler_ref.kind).delete(handler_ref)?;
        }

        Ok(())
    }

    /// Write a sub-region of an item's existing payload in place.
    ///
    /// Does not touch the index: partial writes change array bytes only, and
    /// streaming acquisition must not rewrite the index once per frame.
    pub fn write_partial(&self, id: ItemId, region: &Region, bytes: &[u8]) -> Result<()> {
        if self.config.read_only {
            return Err(StoreError::ReadOnly);
        }

        let handler_ref = self
            .read_item(id)?
            .handler_ref
            .ok_or_else(|| StoreError::PayloadMissing(format!("item {} has no payload", id)))?;

        self.handler(handler_ref.kind)
            .write_partial(&handler_ref, region, bytes)
    }

    /// Move an item's payload to a different backend.
    ///
    /// This is the only way a handler reference changes owner. The index is
    /// updated to point at the new payload before the old one is removed.
    pub fn migrate_handler(&self, id: ItemId, kind: HandlerKind) -> Result<()> {
        if self.config.read_only {
            return Err(StoreError::ReadOnly);
        }
        let _guard = self.write_lock.lock();

        let item = self.read_item(id)?;
        let old_ref = item
            .handler_ref
            .clone()
            .ok_or_else(|| StoreError::PayloadMissing(format!("item {} has no payload", id)))?;

        if old_ref.kind == kind {
            return Ok(());
        }

        let array = self.handler(old_ref.kind).read(&old_ref)?;
        let new_ref = self.handler(kind).write(id, &array)?;

        let previous = {
            let mut items = self.items.write();
            let record = items.get_mut(&id).ok_or(StoreError::ItemNotFound(id))?;
            let previous = record.clone();
            record.handler_ref = Some(new_ref.clone());
            previous
        };

        if let Err(e) = self.save_index() {
            self.items.write().insert(id, previous);
            self.handler(kind).delete(&new_ref)?;
            return Err(e);
        }

        self.handler(old_ref.kind).delete(&old_ref)?;
        Ok(())
    }

    /// All item identities.
    pub fn item_ids(&self) -> Vec<ItemId> {
        self.items.read().keys().copied().collect()
    }

    /// All item records.
    pub fn items(&self) -> Vec<ItemRecord> {
        self.items.read().values().cloned().collect()
    }

    /// Whether an item exists.
    pub fn contains(&self, id: ItemId) -> bool {
        self.items.read().contains_key(&id)
    }

    /// Number of items.
    pub fn count(&self) -> usize {
        self.items.read().len()
    }

    /// Project statistics.
    pub fn stats(&self) -> Result<ProjectStats> {
        let items = self.items.read();
        let mut stats = ProjectStats {
            item_count: items.len() as u64,
            ..Default::default()
        };

        for item in items.values() {
            if item.item_type == crate::types::ItemType::DataItem {
                stats.data_item_count += 1;
            }
            if let Some(handler_ref) = &item.handler_ref {
                let size = self.handler(handler_ref.kind).payload_size(handler_ref)?;
                match handler_ref.kind {
                    HandlerKind::Archive => {
                        stats.archive_payload_count += 1;
                        stats.archive_bytes += size;
                    }
                    HandlerKind::Dataset => {
                        stats.dataset_payload_count += 1;
                        stats.dataset_bytes += size;
                    }
                }
            }
        }

        Ok(stats)
    }

    /// Release idle dataset file handles.
    pub fn close_idle_handles(&self, max_idle: Duration) -> usize {
        self.dataset.close_idle(max_idle)
    }

    /// Release all payload file handles (project close).
    pub fn close(&self) {
        self.dataset.close_all();
    }

    /// The project directory.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// The data directory.
    pub fn data_dir(&self) -> PathBuf {
        self.config.path.join(DATA_DIR_NAME)
    }

    /// Whether the project was opened read-only.
    pub fn is_read_only(&self) -> bool {
        self.config.read_only
    }

    // --- Private Helpers ---

    fn handler(&self, kind: HandlerKind) -> &dyn StorageHandler {
        match kind {
            HandlerKind::Archive => &self.archive,
            HandlerKind::Dataset => &self.dataset,
        }
    }

    /// Backend for a brand-new payload: dataset for live items and anything
    /// at or above the size threshold, archive otherwise.
    fn select_handler_kind(&self, item: &ItemRecord, array: &ArrayData) -> HandlerKind {
        if item.is_live || array.byte_len() >= self.config.dataset_threshold {
            HandlerKind::Dataset
        } else {
            HandlerKind::Archive
        }
    }

    /// Persist the in-memory index atomically. Entries are sorted by item
    /// identity so repeated saves of the same state are byte-identical.
    fn save_index(&self) -> Result<()> {
        let items = self.items.read();
        let mut records: Vec<&ItemRecord> = items.values().collect();
        records.sort_by_key(|r| r.id);

        let entries = records
            .into_iter()
            .map(item_to_entry)
            .collect::<Result<Vec<_>>>()?;
        drop(items);

        write_document_atomic(
            &self.config.path.join(INDEX_FILE_NAME),
            SCHEMA_VERSION,
            entries,
        )
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_path = path.join(LOCK_FILE_NAME);
        fs::create_dir_all(path)?;
        let lock_file = File::create(lock_path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;

        Ok(lock_file)
    }
}
