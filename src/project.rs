//! Project handle tying all components together.
//!
//! This is the only surface the GUI, scripting, and acquisition layers are
//! expected to use: open a project, read and write items, batch mutations
//! in transactions, and subscribe to change events. The handle is explicit;
//! there is no process-wide current project.

use crate::context::{PersistentObjectContext, TransactionScope};
use crate::error::{ItemLoadError, Result};
use crate::migration;
use crate::storage::{FileStorageSystem, ProjectConfig};
use crate::subscriptions::{SubscriptionConfig, SubscriptionHandle, SubscriptionId, SubscriptionManager};
use crate::types::{
    ArrayData, HandlerKind, ItemId, ItemRecord, ProjectStats, PropertyValue, Region,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// An open project.
///
/// Lifecycle: open, operate, close (drop). Disk calls are blocking; callers
/// on a UI-responsive thread dispatch them to a worker.
pub struct Project {
    storage: Arc<FileStorageSystem>,
    context: PersistentObjectContext,
    subscriptions: Arc<SubscriptionManager>,
    load_errors: Vec<ItemLoadError>,
}

impl Project {
    /// Open a project, creating it when the configuration allows.
    ///
    /// Per-item load failures do not abort the open; they are collected and
    /// available via `load_errors`.
    pub fn open(config: ProjectConfig) -> Result<Self> {
        let (storage, load_errors) = FileStorageSystem::open(config)?;
        let storage = Arc::new(storage);
        let subscriptions = Arc::new(SubscriptionManager::new());
        let context = PersistentObjectContext::new(Arc::clone(&storage))
            .with_subscriptions(Arc::clone(&subscriptions));

        Ok(Self {
            storage,
            context,
            subscriptions,
            load_errors,
        })
    }

    /// Open the project at a path with default configuration.
    pub fn open_path(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open(ProjectConfig {
            path: path.into(),
            ..Default::default()
        })
    }

    /// Migrate the project at `path` to the current schema version if its
    /// on-disk version is older. Returns whether a migration ran. The
    /// original project is preserved as a versioned backup next to the
    /// upgraded one.
    pub fn migrate_if_needed(path: &Path) -> Result<bool> {
        migration::migrate_if_needed(path)
    }

    /// Failures collected while loading the project, one per damaged item.
    pub fn load_errors(&self) -> &[ItemLoadError] {
        &self.load_errors
    }

    // --- Item Operations ---

    /// Read an item record.
    pub fn read_item(&self, id: ItemId) -> Result<ItemRecord> {
        self.storage.read_item(id)
    }

    /// Read an item's bulk payload, if it has one.
    pub fn read_array(&self, id: ItemId) -> Result<Option<ArrayData>> {
        self.storage.read_array(id)
    }

    /// Write an item, optionally with a bulk payload.
    pub fn write_item(&self, item: &mut ItemRecord, array: Option<&ArrayData>) -> Result<()> {
        self.storage.write_item(item, array)?;
        self.subscriptions.notify_item_written(item.id, item.item_type);
        Ok(())
    }

    /// Delete an item and its payload. Tolerant of the item already being
    /// absent.
    pub fn delete_item(&self, id: ItemId) -> Result<()> {
        self.storage.delete_item(id)?;
        self.subscriptions.notify_item_deleted(id);
        Ok(())
    }

    /// All item records.
    pub fn items(&self) -> Vec<ItemRecord> {
        self.storage.items()
    }

    /// All item identities.
    pub fn item_ids(&self) -> Vec<ItemId> {
        self.storage.item_ids()
    }

    // --- Transactions ---

    /// Open a transaction scope. Buffered writes flush when the outermost
    /// scope ends; use `discard` to abandon them.
    pub fn begin_transaction(&self) -> TransactionScope<'_> {
        self.context.begin_transaction()
    }

    /// Set a property on an item: immediate outside a transaction, buffered
    /// and coalesced inside one.
    pub fn set_property(
        &self,
        id: ItemId,
        name: impl Into<String>,
        value: impl Into<PropertyValue>,
    ) -> Result<()> {
        self.context.set_property(id, name, value)
    }

    /// Set an item's bulk payload through the transaction machinery.
    pub fn set_array(&self, id: ItemId, array: ArrayData) -> Result<()> {
        self.context.set_array(id, array)
    }

    // --- Payload Operations ---

    /// Write a sub-region of an item's payload in place. Requires the
    /// owning handler to support partial writes.
    pub fn write_partial(&self, id: ItemId, region: &Region, bytes: &[u8]) -> Result<()> {
        self.storage.write_partial(id, region, bytes)
    }

    /// Move an item's payload to a different backend.
    pub fn migrate_handler(&self, id: ItemId, kind: HandlerKind) -> Result<()> {
        self.storage.migrate_handler(id, kind)
    }

    // --- Subscriptions ---

    /// Subscribe to project events.
    pub fn subscribe(&self, config: SubscriptionConfig) -> SubscriptionHandle {
        self.subscriptions.subscribe(config)
    }

    /// Remove a subscription.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions.unsubscribe(id)
    }

    // --- Project Operations ---

    /// Project statistics.
    pub fn stats(&self) -> Result<ProjectStats> {
        self.storage.stats()
    }

    /// Release payload file handles idle for at least `max_idle`.
    pub fn close_idle_handles(&self, max_idle: Duration) -> usize {
        self.storage.close_idle_handles(max_idle)
    }

    /// The project directory.
    pub fn path(&self) -> &Path {
        self.storage.path()
    }

    /// Whether the project was opened read-only.
    pub fn is_read_only(&self) -> bool {
        self.storage.is_read_only()
    }
}

impl Drop for Project {
    fn drop(&mut self) {
        // Best-effort handle release on close.
        self.storage.close();
    }
}
