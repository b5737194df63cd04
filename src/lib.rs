//! # Project Store
//!
//! A persistent project storage engine for scientific acquisition data:
//! an index document plus a data directory of per-item payloads, with
//! pluggable payload backends, schema migration, crash-resilient index
//! writes, and transactional batching of in-memory mutations.
//!
//! ## Core Concepts
//!
//! - **Items**: UUID-keyed persistent records with typed properties
//! - **Handlers**: archive files for small payloads, dataset files with
//!   in-place partial writes for large arrays
//! - **Transactions**: coalesce high-frequency updates into one flush
//! - **Migration**: ordered upgrades of old projects to a new location
//!
//! ## Example
//!
//! ```ignore
//! use proj_store::{ArrayData, DType, ItemRecord, ItemType, Project, ProjectConfig};
//!
//! let project = Project::open(ProjectConfig {
//!     path: "./my-project".into(),
//!     ..Default::default()
//! })?;
//!
//! // Write a data item with a payload
//! let mut item = ItemRecord::new(ItemType::DataItem).with_property("title", "scan");
//! let array = ArrayData::zeros(DType::F64, vec![512, 512]);
//! project.write_item(&mut item, Some(&array))?;
//!
//! // Batch a burst of property updates
//! let scope = project.begin_transaction();
//! project.set_property(item.id, "title", "scan 2")?;
//! scope.end();
//! ```

pub mod context;
pub mod error;
pub mod handlers;
pub mod migration;
pub mod schema;
pub mod storage;
pub mod subscriptions;
pub mod types;

mod project;

// Re-exports
pub use context::{PersistentObjectContext, TransactionScope};
pub use error::{ItemLoadError, Result, StoreError};
pub use handlers::{ArchiveHandler, DatasetHandler, StorageHandler};
pub use migration::{migrate, migrate_if_needed, MigrationPlan, MigrationReport};
pub use project::Project;
pub use storage::{FileStorageSystem, ProjectConfig, DEFAULT_DATASET_THRESHOLD};
pub use subscriptions::{
    ProjectEvent, SubscriptionConfig, SubscriptionFilter, SubscriptionHandle, SubscriptionId,
    SubscriptionManager,
};
pub use types::*;
