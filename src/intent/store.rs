//! Storage contract consumed by the settlement engine

use super::{Intent, IntentUpdate, NonceRecord};
use crate::error::SettlerResult;
use crate::oracle::PriceRecord;

use async_trait::async_trait;

/// Durable intent table, nonce set and rate history.
///
/// Implementations must enforce two invariants at the storage layer:
/// `source_tx_hash` is unique across intents, and a nonce can be inserted at
/// most once.
#[async_trait]
pub trait IntentStore: Send + Sync {
    /// Persist a new intent. Fails with `DuplicateDeposit` if the source
    /// transaction already has one.
    async fn create(&self, intent: &Intent) -> SettlerResult<()>;

    async fn get_by_id(&self, id: &str) -> SettlerResult<Option<Intent>>;

    async fn get_by_source_reference(&self, source_tx_hash: &str)
        -> SettlerResult<Option<Intent>>;

    /// Apply a partial update. Fails with `InvalidStateTransition` when the
    /// stored intent is already terminal.
    async fn update(&self, id: &str, update: IntentUpdate) -> SettlerResult<Intent>;

    /// Atomically mark a live intent `Open` for a payout broadcast. Returns
    /// the stored intent, or `None` when it is terminal or already carries a
    /// `payout_reference`.
    async fn claim_for_dispatch(&self, id: &str, now: i64) -> SettlerResult<Option<Intent>>;

    async fn list_open(&self) -> SettlerResult<Vec<Intent>>;

    async fn list_pending(&self) -> SettlerResult<Vec<Intent>>;

    async fn nonce_exists(&self, nonce: &str) -> SettlerResult<bool>;

    /// Atomically consume a nonce for `record.source_tx_hash`. Returns
    /// `false` if a different deposit already consumed it; re-consuming for
    /// the same deposit succeeds.
    async fn insert_nonce(&self, record: &NonceRecord) -> SettlerResult<bool>;

    async fn append_rate(&self, record: &PriceRecord) -> SettlerResult<()>;

    /// Most recent rate records, newest first
    async fn rate_tail(&self, limit: usize) -> SettlerResult<Vec<PriceRecord>>;

    async fn health_check(&self) -> SettlerResult<()>;
}
