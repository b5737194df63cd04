//! Persistent object context.
//!
//! The mutation-batching boundary between in-memory objects and the file
//! storage system. Outside a transaction, property sets flush immediately.
//! Inside one, writes are buffered and coalesced so a high-frequency
//! acquisition loop pays one disk write per item per flush instead of one
//! per property set.

use crate::error::{ItemLoadError, Result};
use crate::storage::FileStorageSystem;
use crate::subscriptions::SubscriptionManager;
use crate::types::{ArrayData, ItemId, PropertyValue};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Buffered writes for one item within a transaction.
#[derive(Default)]
struct PendingWrite {
    /// Last-writer-wins per property.
    properties: HashMap<String, PropertyValue>,
    /// Only the last array survives.
    array: Option<ArrayData>,
}

struct ContextState {
    /// Nesting depth of open transaction scopes.
    depth: u32,
    /// Buffered writes, per item.
    pending: HashMap<ItemId, PendingWrite>,
}

/// Tracks dirty state and batches mutations into the storage system.
pub struct PersistentObjectContext {
    storage: Arc<FileStorageSystem>,
    subscriptions: Option<Arc<SubscriptionManager>>,
    state: Mutex<ContextState>,
}

impl PersistentObjectContext {
    pub fn new(storage: Arc<FileStorageSystem>) -> Self {
        Self {
            storage,
            subscriptions: None,
            state: Mutex::new(ContextState {
                depth: 0,
                pending: HashMap::new(),
            }),
        }
    }

    /// Attach a subscription manager notified on flushed writes.
    pub fn with_subscriptions(mut self, subscriptions: Arc<SubscriptionManager>) -> Self {
        self.subscriptions = Some(subscriptions);
        self
    }

    /// Open a transaction scope.
    ///
    /// Scopes nest; buffered writes flush when the outermost scope ends.
    /// Every exit path flushes or discards: dropping the scope without an
    /// explicit `end` flushes too.
    pub fn begin_transaction(&self) -> TransactionScope<'_> {
        self.state.lock().depth += 1;
        TransactionScope {
            context: self,
            done: false,
        }
    }

    /// Whether a transaction is currently open.
    pub fn in_transaction(&self) -> bool {
        self.state.lock().depth > 0
    }

    /// Set a property on a tracked item.
    ///
    /// Immediate read-modify-write when no transaction is open; buffered
    /// and coalesced otherwise.
    pub fn set_property(
        &self,
        id: ItemId,
        name: impl Into<String>,
        value: impl Into<PropertyValue>,
    ) -> Result<()> {
        let name = name.into();
        let value = value.into();

        {
            let mut state = self.state.lock();
            if state.depth > 0 {
                state
                    .pending
                    .entry(id)
                    .or_default()
                    .properties
                    .insert(name, value);
                return Ok(());
            }
        }

        let mut pending = PendingWrite::default();
        pending.properties.insert(name, value);
        self.flush_item(id, pending)
    }

    /// Set an item's bulk payload.
    pub fn set_array(&self, id: ItemId, array: ArrayData) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.depth > 0 {
                state.pending.entry(id).or_default().array = Some(array);
                return Ok(());
            }
        }

        let pending = PendingWrite {
            properties: HashMap::new(),
            array: Some(array),
        };
        self.flush_item(id, pending)
    }

    /// Number of items with buffered writes.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Write one item's buffered changes through the storage system.
    fn flush_item(&self, id: ItemId, pending: PendingWrite) -> Result<()> {
        let mut item = self.storage.read_item(id)?;
        for (name, value) in pending.properties {
            item.properties.insert(name, value);
        }
        self.storage.write_item(&mut item, pending.array.as_ref())?;

        if let Some(subscriptions) = &self.subscriptions {
            subscriptions.notify_item_written(item.id, item.item_type);
        }
        Ok(())
    }

    /// Flush all buffered writes.
    ///
    /// A failing item's buffered writes are discarded and the failure
    /// collected; the other items still flush. Transactions batch unrelated
    /// items for throughput, not atomicity across items.
    fn flush_all(&self) -> Vec<ItemLoadError> {
        let pending = std::mem::take(&mut self.state.lock().pending);
        let flushed = pending.len();
        let mut errors = Vec::new();

        for (id, write) in pending {
            if let Err(error) = self.flush_item(id, write) {
                errors.push(ItemLoadError {
                    item: Some(id),
                    error,
                });
            }
        }

        if flushed > 0 {
            if let Some(subscriptions) = &self.subscriptions {
                subscriptions.notify_transaction_flushed(flushed);
            }
        }

        errors
    }

    fn close_scope(&self, discard: bool) -> Vec<ItemLoadError> {
        let flush = {
            let mut state = self.state.lock();
            debug_assert!(state.depth > 0, "closing a scope with none open");
            state.depth = state.depth.saturating_sub(1);

            if discard {
                state.pending.clear();
                false
            } else {
                state.depth == 0
            }
        };

        if flush {
            self.flush_all()
        } else {
            Vec::new()
        }
    }
}

/// RAII transaction scope.
///
/// `end` flushes, `discard` drops the buffered writes. Dropping the scope
/// without either flushes, so an early return or panic path still commits
/// what was buffered.
#[must_use = "dropping the scope flushes immediately"]
pub struct TransactionScope<'a> {
    context: &'a PersistentObjectContext,
    done: bool,
}

impl TransactionScope<'_> {
    /// Close the scope, flushing buffered writes when this is the outermost
    /// scope. Per-item failures are returned; the remaining items flushed.
    pub fn end(mut self) -> Vec<ItemLoadError> {
        self.done = true;
        self.context.close_scope(false)
    }

    /// Close the scope, discarding all buffered writes.
    pub fn discard(mut self) {
        self.done = true;
        self.context.close_scope(true);
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        if !self.done {
            for failure in self.context.close_scope(false) {
                warn!(%failure, "buffered write lost on implicit transaction end");
            }
        }
    }
}
