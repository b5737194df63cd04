//! Subscription system for live project updates.
//!
//! In-process subscriptions to storage events: item writes, item deletes,
//! and transaction flushes. Subscriptions filter by item type and event
//! class, and use bounded buffers; a subscriber that stops draining its
//! channel is dropped rather than blocking the writer.

mod manager;
mod types;

pub use manager::SubscriptionManager;
pub use types::{
    DropReason, ProjectEvent, SubscriptionConfig, SubscriptionFilter, SubscriptionHandle,
    SubscriptionId,
};
