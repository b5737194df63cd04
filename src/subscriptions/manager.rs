//! Subscription manager for broadcasting storage events.

use crossbeam_channel::{bounded, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::types::{
    DropReason, ProjectEvent, SubscriptionConfig, SubscriptionFilter, SubscriptionHandle,
    SubscriptionId,
};
use crate::types::{ItemId, ItemType};

/// Internal subscription state.
struct Subscription {
    config: SubscriptionConfig,
    sender: Sender<ProjectEvent>,
}

impl Subscription {
    /// Try to send an event. Returns false if the buffer is full or the
    /// receiver is gone (the subscriber will be dropped).
    fn try_send(&self, event: ProjectEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(crossbeam_channel::TrySendError::Full(_)) => false,
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => false,
        }
    }

    fn matches_type(filter: &SubscriptionFilter, item_type: ItemType) -> bool {
        match &filter.item_types {
            Some(types) => types.contains(&item_type),
            None => true,
        }
    }

    fn matches(&self, event: &ProjectEvent) -> bool {
        let filter = &self.config.filter;
        match event {
            ProjectEvent::ItemWritten { item_type, .. } => {
                filter.include_writes && Self::matches_type(filter, *item_type)
            }
            ProjectEvent::ItemDeleted { .. } => filter.include_deletes,
            ProjectEvent::TransactionFlushed { .. } => filter.include_flushes,
            ProjectEvent::Dropped { .. } => true,
        }
    }
}

/// Manages subscriptions and broadcasts events.
pub struct SubscriptionManager {
    /// Active subscriptions by ID.
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Create a new subscription, returning a handle for receiving events.
    pub fn subscribe(&self, config: SubscriptionConfig) -> SubscriptionHandle {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(config.buffer_size);

        self.subscriptions
            .write()
            .insert(id, Subscription { config, sender });

        SubscriptionHandle { id, receiver }
    }

    /// Unsubscribe and clean up.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        if let Some(subscription) = self.subscriptions.write().remove(&id) {
            let _ = subscription.sender.try_send(ProjectEvent::Dropped {
                reason: DropReason::Unsubscribed,
            });
        }
    }

    /// Number of active subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    // --- Broadcasting ---

    pub fn notify_item_written(&self, id: ItemId, item_type: ItemType) {
        self.broadcast(ProjectEvent::ItemWritten { id, item_type });
    }

    pub fn notify_item_deleted(&self, id: ItemId) {
        self.broadcast(ProjectEvent::ItemDeleted { id });
    }

    pub fn notify_transaction_flushed(&self, items: usize) {
        self.broadcast(ProjectEvent::TransactionFlushed { items });
    }

    /// Send an event to all matching subscriptions, dropping any whose
    /// buffer is full or whose receiver is gone.
    fn broadcast(&self, event: ProjectEvent) {
        let mut dropped = Vec::new();

        {
            let subscriptions = self.subscriptions.read();
            for (id, subscription) in subscriptions.iter() {
                if !subscription.matches(&event) {
                    continue;
                }
                if !subscription.try_send(event.clone()) {
                    dropped.push(*id);
                }
            }
        }

        if !dropped.is_empty() {
            let mut subscriptions = self.subscriptions.write();
            for id in dropped {
                if let Some(subscription) = subscriptions.remove(&id) {
                    let _ = subscription.sender.try_send(ProjectEvent::Dropped {
                        reason: DropReason::BufferFull,
                    });
                }
            }
        }
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}
