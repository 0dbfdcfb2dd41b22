//! In-process intent store for development and tests

use crate::error::{SettlerError, SettlerResult};
use crate::intent::{Intent, IntentStatus, IntentStore, IntentUpdate, NonceRecord};
use crate::oracle::PriceRecord;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Mutex;

/// Intent store held entirely in memory. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryIntentStore {
    intents: DashMap<String, Intent>,
    /// source_tx_hash -> intent id
    by_source: DashMap<String, String>,
    nonces: DashMap<String, NonceRecord>,
    rates: Mutex<Vec<PriceRecord>>,
}

impl MemoryIntentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_status(&self, status: IntentStatus) -> Vec<Intent> {
        let mut intents: Vec<Intent> = self
            .intents
            .iter()
            .filter(|entry| entry.status == status)
            .map(|entry| entry.value().clone())
            .collect();
        intents.sort_by_key(|intent| intent.created_at);
        intents
    }
}

#[async_trait]
impl IntentStore for MemoryIntentStore {
    async fn create(&self, intent: &Intent) -> SettlerResult<()> {
        match self.by_source.entry(intent.source_tx_hash.clone()) {
            Entry::Occupied(_) => Err(SettlerError::DuplicateDeposit {
                source_tx_hash: intent.source_tx_hash.clone(),
            }),
            Entry::Vacant(slot) => {
                // The source entry stays locked until the intent is visible
                self.intents.insert(intent.id.clone(), intent.clone());
                slot.insert(intent.id.clone());
                Ok(())
            }
        }
    }

    async fn get_by_id(&self, id: &str) -> SettlerResult<Option<Intent>> {
        Ok(self.intents.get(id).map(|entry| entry.value().clone()))
    }

    async fn get_by_source_reference(
        &self,
        source_tx_hash: &str,
    ) -> SettlerResult<Option<Intent>> {
        let Some(id) = self.by_source.get(source_tx_hash).map(|id| id.value().clone()) else {
            return Ok(None);
        };
        self.get_by_id(&id).await
    }

    async fn update(&self, id: &str, update: IntentUpdate) -> SettlerResult<Intent> {
        let mut entry = self
            .intents
            .get_mut(id)
            .ok_or_else(|| SettlerError::IntentNotFound { id: id.to_string() })?;

        let next = update.status.unwrap_or(entry.status);
        if !entry.status.can_transition_to(next) {
            return Err(SettlerError::InvalidStateTransition {
                from: entry.status.to_string(),
                to: next.to_string(),
            });
        }

        update.apply_to(entry.value_mut());
        Ok(entry.value().clone())
    }

    async fn claim_for_dispatch(&self, id: &str, now: i64) -> SettlerResult<Option<Intent>> {
        let Some(mut entry) = self.intents.get_mut(id) else {
            return Err(SettlerError::IntentNotFound { id: id.to_string() });
        };
        if entry.status.is_terminal() || entry.payout_reference.is_some() {
            return Ok(None);
        }
        entry.status = IntentStatus::Open;
        entry.updated_at = now;
        Ok(Some(entry.value().clone()))
    }

    async fn list_open(&self) -> SettlerResult<Vec<Intent>> {
        Ok(self.with_status(IntentStatus::Open))
    }

    async fn list_pending(&self) -> SettlerResult<Vec<Intent>> {
        Ok(self.with_status(IntentStatus::Pending))
    }

    async fn nonce_exists(&self, nonce: &str) -> SettlerResult<bool> {
        Ok(self.nonces.contains_key(nonce))
    }

    async fn insert_nonce(&self, record: &NonceRecord) -> SettlerResult<bool> {
        match self.nonces.entry(record.nonce.clone()) {
            Entry::Occupied(existing) => {
                Ok(existing.get().source_tx_hash == record.source_tx_hash)
            }
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(true)
            }
        }
    }

    async fn append_rate(&self, record: &PriceRecord) -> SettlerResult<()> {
        self.rates.lock().await.push(record.clone());
        Ok(())
    }

    async fn rate_tail(&self, limit: usize) -> SettlerResult<Vec<PriceRecord>> {
        let rates = self.rates.lock().await;
        Ok(rates.iter().rev().take(limit).cloned().collect())
    }

    async fn health_check(&self) -> SettlerResult<()> {
        Ok(())
    }
}
