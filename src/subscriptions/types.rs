//! Subscription types for live project updates.

use crate::types::{ItemId, ItemType};

/// Configuration for a subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    /// Max buffered events before the subscriber is dropped.
    /// Default: 1000
    pub buffer_size: usize,

    /// Filter criteria.
    pub filter: SubscriptionFilter,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            filter: SubscriptionFilter::default(),
        }
    }
}

/// Filter criteria for subscriptions.
#[derive(Clone, Debug)]
pub struct SubscriptionFilter {
    /// Filter by item types (None = all types).
    pub item_types: Option<Vec<ItemType>>,

    /// Include item write events.
    pub include_writes: bool,

    /// Include item delete events.
    pub include_deletes: bool,

    /// Include transaction flush events.
    pub include_flushes: bool,
}

impl Default for SubscriptionFilter {
    fn default() -> Self {
        Self {
            item_types: None,
            include_writes: true,
            include_deletes: true,
            include_flushes: false,
        }
    }
}

impl SubscriptionFilter {
    /// Subscribe to writes of specific item types only.
    pub fn item_types(types: Vec<ItemType>) -> Self {
        Self {
            item_types: Some(types),
            ..Default::default()
        }
    }
}

/// Why a subscription was dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// The subscriber's buffer filled up.
    BufferFull,
    /// The subscriber unsubscribed.
    Unsubscribed,
}

/// Events broadcast to subscribers.
#[derive(Clone, Debug)]
pub enum ProjectEvent {
    /// An item was written (created or updated).
    ItemWritten { id: ItemId, item_type: ItemType },

    /// An item was deleted.
    ItemDeleted { id: ItemId },

    /// A transaction flushed this many items.
    TransactionFlushed { items: usize },

    /// This subscription is being dropped.
    Dropped { reason: DropReason },
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Handle for receiving subscribed events.
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    pub receiver: crossbeam_channel::Receiver<ProjectEvent>,
}

impl SubscriptionHandle {
    /// Block until the next event.
    pub fn recv(&self) -> Result<ProjectEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Result<ProjectEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with a timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<ProjectEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}
