//! Intent persistence
//!
//! Handles:
//! - Intent records with a unique source transaction
//! - The consumed nonce set
//! - The append-only rate history log

mod manager;
mod memory;

pub use manager::StateManager;
pub use memory::MemoryIntentStore;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::SettlerResult;
use crate::intent::IntentStore;

use std::sync::Arc;
use tracing::info;

/// Open the configured store and run its migrations
pub async fn connect(config: &StorageConfig) -> SettlerResult<Arc<dyn IntentStore>> {
    match config.backend {
        StorageBackend::Postgres => {
            let manager = StateManager::new(config).await?;
            manager.run_migrations().await?;
            info!("Connected to PostgreSQL intent store");
            Ok(Arc::new(manager))
        }
        StorageBackend::Memory => {
            info!("Using in-memory intent store");
            Ok(Arc::new(MemoryIntentStore::new()))
        }
    }
}
