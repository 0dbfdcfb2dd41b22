//! Settlement engine: deposit intake, dispatch and the periodic sweep

use super::validation;
use crate::chain::{ChainManager, ConfirmationState};
use crate::clock::Clock;
use crate::config::SettlerConfig;
use crate::envelope::EnvelopeVerifier;
use crate::error::{Rejection, SettlerError, SettlerResult, SubmitError};
use crate::intent::{Direction, Intent, IntentStatus, IntentStore, IntentUpdate, NonceRecord};
use crate::oracle::{PriceImpact, PriceOracle, PriceRecord};
use crate::tx::{DispatchOutcome, PayoutDispatcher};

use dashmap::DashSet;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Answer to a settlement submission that produced or found an intent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitOutcome {
    pub intent_id: String,
    pub status: IntentStatus,
    /// The deposit had already been submitted
    pub existing: bool,
    pub quoted_amount_out: f64,
}

/// Side-effect free preview of a trade
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotePreview {
    pub direction: Direction,
    pub amount_in: f64,
    pub amount_out: f64,
    pub fee_bps: u32,
    pub price_impact: PriceImpact,
    /// Cached payout-side custody balance, if it could be read
    pub available_liquidity: Option<f64>,
    pub sufficient_liquidity: Option<bool>,
}

/// What one sweep cycle did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: usize,
    pub retried: usize,
    pub reconciled: usize,
    pub skipped_in_flight: usize,
}

pub struct SettlementEngine {
    store: Arc<dyn IntentStore>,
    chains: Arc<ChainManager>,
    oracle: Arc<PriceOracle>,
    dispatcher: Arc<PayoutDispatcher>,
    verifier: EnvelopeVerifier,
    config: SettlerConfig,
    clock: Arc<dyn Clock>,
    /// Intents with a dispatch or reconciliation running
    in_flight: DashSet<String>,
    /// Shutdown flag
    shutdown: Arc<RwLock<bool>>,
}

impl SettlementEngine {
    pub fn new(
        store: Arc<dyn IntentStore>,
        chains: Arc<ChainManager>,
        oracle: Arc<PriceOracle>,
        config: SettlerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let dispatcher = Arc::new(PayoutDispatcher::new(
            chains.clone(),
            store.clone(),
            clock.clone(),
            config.liquidity_buffer,
            Duration::from_secs(config.confirmation_timeout_secs),
            Duration::from_millis(config.confirmation_poll_interval_ms),
        ));

        Self {
            store,
            chains,
            oracle,
            dispatcher,
            verifier: EnvelopeVerifier::new(config.allow_legacy_envelopes),
            config,
            clock,
            in_flight: DashSet::new(),
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    pub fn oracle(&self) -> &Arc<PriceOracle> {
        &self.oracle
    }

    pub fn store(&self) -> &Arc<dyn IntentStore> {
        &self.store
    }

    pub fn chains(&self) -> &Arc<ChainManager> {
        &self.chains
    }

    /// Validate a deposit and persist its intent. Idempotent by deposit
    /// reference: a repeat returns the existing intent untouched.
    pub async fn submit_deposit(
        self: &Arc<Self>,
        direction: Direction,
        reference: &str,
    ) -> Result<SubmitOutcome, SubmitError> {
        let reference = reference.trim();
        match self.accept(direction, reference).await {
            Ok((outcome, Some(intent))) => {
                if intent.status == IntentStatus::Open {
                    let engine = Arc::clone(self);
                    tokio::spawn(async move {
                        engine.attempt(intent).await;
                    });
                }
                Ok(outcome)
            }
            Ok((outcome, None)) => Ok(outcome),
            Err(SubmitError::Rejected(rejection)) => {
                warn!(
                    "Rejected {} deposit {}: {}",
                    direction, reference, rejection
                );
                crate::metrics::record_rejection(rejection.label());
                Err(SubmitError::Rejected(rejection))
            }
            Err(e) => {
                error!("Failed to process deposit {}: {}", reference, e);
                Err(e)
            }
        }
    }

    /// Returns the new intent alongside the outcome when one was created
    async fn accept(
        &self,
        direction: Direction,
        reference: &str,
    ) -> Result<(SubmitOutcome, Option<Intent>), SubmitError> {
        if let Some(existing) = self.store.get_by_source_reference(reference).await? {
            debug!("Deposit {} already settled as {}", reference, existing.id);
            return Ok((existing_outcome(&existing), None));
        }

        let source = self.chains.endpoint(direction.source())?;
        let target = self.chains.endpoint(direction.target())?;

        let deposit = self.chains.fetch_deposit(source.side, reference).await?;
        let deposit = validation::check_deposit(deposit, reference, &source)?;

        let envelope = self.verifier.verify(&deposit.memo).map_err(Rejection::from)?;
        let payload = envelope.payload;
        validation::check_route(&payload, &source, &target)?;
        validation::check_amount(payload.amount, deposit.amount, self.config.amount_tolerance)?;

        let now = self.clock.now_millis();
        validation::check_expiry(payload.expiry, now)?;

        let quoted = self
            .oracle
            .quote(deposit.amount, direction, self.config.fee_bps)
            .await;
        validation::check_min_output(quoted, payload.min_amount_out)?;

        let nonce = NonceRecord {
            nonce: payload.nonce.clone(),
            source_tx_hash: reference.to_string(),
            consumed_at: now,
        };
        if !self.store.insert_nonce(&nonce).await? {
            return Err(Rejection::NonceReplay {
                nonce: payload.nonce,
            }
            .into());
        }

        let probe = self.dispatcher.probe(target.side, quoted).await?;
        let status = if probe.sufficient() {
            IntentStatus::Open
        } else {
            info!(
                "Insufficient liquidity on {} for deposit {}: have {}, need {}",
                target.name, reference, probe.have, probe.need
            );
            IntentStatus::Pending
        };

        let intent = Intent {
            id: uuid::Uuid::new_v4().to_string(),
            direction,
            source_address: deposit.from,
            source_tx_hash: reference.to_string(),
            amount_in: deposit.amount,
            target_address: payload.destination.clone(),
            target_tx_hash: None,
            amount_out: None,
            quoted_amount_out: quoted,
            min_amount_out: payload.min_amount_out,
            status,
            expiry: payload.expiry,
            created_at: now,
            updated_at: now,
            fulfilled_at: None,
            error: None,
            payout_reference: None,
            dispatch_attempts: 0,
            payload: payload.raw,
        };

        match self.store.create(&intent).await {
            Ok(()) => {}
            Err(SettlerError::DuplicateDeposit { .. }) => {
                // A concurrent submission of the same deposit won the insert
                let existing = self
                    .store
                    .get_by_source_reference(reference)
                    .await?
                    .ok_or_else(|| SettlerError::Storage(format!(
                        "Intent for deposit {} vanished after a duplicate insert",
                        reference
                    )))?;
                return Ok((existing_outcome(&existing), None));
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            "Intent {} created {} for {} deposit {} ({} in, {} quoted out, {:?} envelope)",
            intent.id,
            intent.status,
            direction,
            reference,
            intent.amount_in,
            quoted,
            envelope.trust
        );
        crate::metrics::record_intent_created(intent.status.as_str());

        let outcome = SubmitOutcome {
            intent_id: intent.id.clone(),
            status: intent.status,
            existing: false,
            quoted_amount_out: quoted,
        };
        Ok((outcome, Some(intent)))
    }

    pub async fn get_intent(&self, id: &str) -> SettlerResult<Option<Intent>> {
        self.store.get_by_id(id).await
    }

    /// Quote without side effects. Uses the cached custody balance.
    pub async fn quote(&self, direction: Direction, amount_in: f64) -> QuotePreview {
        let fee_bps = self.config.fee_bps;
        let amount_out = self.oracle.quote(amount_in, direction, fee_bps).await;
        let price_impact = self.oracle.price_impact(direction, amount_in).await;

        let available = match self.chains.fetch_balance(direction.target(), false).await {
            Ok(balance) => Some(balance),
            Err(e) => {
                warn!("Could not read {} liquidity for quote: {}", direction.target(), e);
                None
            }
        };

        QuotePreview {
            direction,
            amount_in,
            amount_out,
            fee_bps,
            price_impact,
            available_liquidity: available,
            sufficient_liquidity: available
                .map(|have| have >= amount_out * self.config.liquidity_buffer),
        }
    }

    /// Run one dispatch for `intent` unless another is already running
    async fn attempt(&self, intent: Intent) {
        if !self.in_flight.insert(intent.id.clone()) {
            debug!("Intent {} already in flight", intent.id);
            return;
        }

        let result = self.dispatcher.dispatch(&intent).await;
        self.handle_dispatch(&intent, result).await;

        self.in_flight.remove(&intent.id);
    }

    async fn handle_dispatch(&self, intent: &Intent, result: SettlerResult<DispatchOutcome>) {
        match result {
            Ok(DispatchOutcome::Confirmed { tx_reference }) => {
                self.finalize(intent, tx_reference).await;
            }
            Ok(DispatchOutcome::Unconfirmed { tx_reference }) => {
                warn!(
                    "Payout {} for intent {} not confirmed yet, will reconcile",
                    tx_reference, intent.id
                );
                let update = IntentUpdate {
                    payout_reference: Some(Some(tx_reference)),
                    updated_at: self.clock.now_millis(),
                    ..Default::default()
                };
                if let Err(e) = self.store.update(&intent.id, update).await {
                    error!("Failed to record unconfirmed payout for {}: {}", intent.id, e);
                }
            }
            Ok(DispatchOutcome::Reverted {
                tx_reference,
                reason,
            }) => {
                let message = format!("payout {} reverted: {}", tx_reference, reason);
                self.record_dispatch_failure(intent, message).await;
            }
            Ok(DispatchOutcome::InsufficientLiquidity { have, need }) => {
                if intent.status == IntentStatus::Open {
                    info!(
                        "Intent {} open -> pending: liquidity drained (have {}, need {})",
                        intent.id, have, need
                    );
                }
                // The dispatcher may have claimed it open before the send was refused
                let update = IntentUpdate::status(IntentStatus::Pending, self.clock.now_millis());
                match self.store.update(&intent.id, update).await {
                    Ok(_) => {}
                    Err(SettlerError::InvalidStateTransition { from, .. }) => {
                        debug!("Intent {} already {}, not queueing", intent.id, from);
                    }
                    Err(e) => error!("Failed to queue intent {}: {}", intent.id, e),
                }
            }
            Ok(DispatchOutcome::Deferred { reason }) => {
                // nothing was sent, so the intent is left exactly as stored
                warn!("Intent {} stays {}: {}", intent.id, intent.status, reason);
            }
            Ok(DispatchOutcome::Superseded) => {
                debug!("Intent {} settled or broadcast by another attempt", intent.id);
            }
            Err(e) => {
                if e.should_alert() {
                    error!("Dispatch for intent {} needs attention: {}", intent.id, e);
                }
                self.record_dispatch_failure(intent, e.to_string()).await;
            }
        }
    }

    /// The only path into `Fulfilled`. The swap is recorded only when this
    /// call made the transition.
    async fn finalize(&self, intent: &Intent, tx_reference: String) {
        let now = self.clock.now_millis();
        let update = IntentUpdate::fulfilled(tx_reference.clone(), intent.quoted_amount_out, now);

        match self.store.update(&intent.id, update).await {
            Ok(fulfilled) => {
                let records = self
                    .oracle
                    .record_swap(fulfilled.direction, fulfilled.amount_in)
                    .await;
                self.persist_rates(&records).await;

                let latency = (now - fulfilled.created_at).max(0) as f64 / 1000.0;
                crate::metrics::record_intent_fulfilled(fulfilled.direction.as_str(), latency);
                info!(
                    "Intent {} fulfilled: paid {} via {}",
                    fulfilled.id, intent.quoted_amount_out, tx_reference
                );
            }
            Err(SettlerError::InvalidStateTransition { from, .. }) => {
                warn!(
                    "Intent {} was already {} when payout {} confirmed",
                    intent.id, from, tx_reference
                );
            }
            Err(e) => {
                // payout_reference stays set, so the sweep will retry this
                error!(
                    "Failed to mark intent {} fulfilled after payout {}: {}",
                    intent.id, tx_reference, e
                );
            }
        }
    }

    async fn record_dispatch_failure(&self, intent: &Intent, message: String) {
        let recorded = match self.store.get_by_id(&intent.id).await {
            Ok(Some(current)) => current.dispatch_attempts,
            _ => intent.dispatch_attempts,
        };
        let attempts = recorded.max(intent.dispatch_attempts) + 1;
        let now = self.clock.now_millis();
        crate::metrics::record_dispatch_error(intent.direction.target().as_str());

        let mut update = IntentUpdate {
            error: Some(message.clone()),
            dispatch_attempts: Some(attempts),
            payout_reference: Some(None),
            updated_at: now,
            ..Default::default()
        };

        if attempts >= self.config.max_dispatch_attempts {
            update.status = Some(IntentStatus::Failed);
            error!(
                "Intent {} failed after {} dispatch attempts, operator action required: {}",
                intent.id, attempts, message
            );
            crate::metrics::record_intent_failed();
        } else {
            warn!(
                "Dispatch attempt {}/{} for intent {} failed: {}",
                attempts, self.config.max_dispatch_attempts, intent.id, message
            );
        }

        if let Err(e) = self.store.update(&intent.id, update).await {
            error!("Failed to record dispatch failure for {}: {}", intent.id, e);
        }
    }

    /// Poll an unconfirmed payout once and settle the intent if it resolved
    async fn reconcile(&self, intent: Intent) {
        let Some(reference) = intent.payout_reference.clone() else {
            return;
        };
        if !self.in_flight.insert(intent.id.clone()) {
            return;
        }

        let side = intent.direction.target();
        match self.chains.payout_status(side, &reference).await {
            Ok(ConfirmationState::Confirmed) => self.finalize(&intent, reference).await,
            Ok(ConfirmationState::Failed(reason)) => {
                let message = format!("payout {} reverted: {}", reference, reason);
                self.record_dispatch_failure(&intent, message).await;
            }
            Ok(state) => {
                debug!("Payout {} for intent {} still {}", reference, intent.id, state);
            }
            Err(e) => {
                warn!("Failed to reconcile payout {} for {}: {}", reference, intent.id, e);
            }
        }

        self.in_flight.remove(&intent.id);
    }

    async fn expire(&self, intent: &Intent, now: i64) -> bool {
        let update = IntentUpdate {
            status: Some(IntentStatus::Expired),
            error: Some(format!("expired at {} before settlement", intent.expiry)),
            updated_at: now,
            ..Default::default()
        };

        match self.store.update(&intent.id, update).await {
            Ok(_) => {
                info!("Intent {} {} -> expired", intent.id, intent.status);
                crate::metrics::record_intent_expired();
                true
            }
            Err(e) => {
                warn!("Failed to expire intent {}: {}", intent.id, e);
                false
            }
        }
    }

    /// One sweep cycle: expire overdue intents, then retry or reconcile the
    /// rest, then tick the oracle.
    pub async fn sweep(&self) -> SettlerResult<SweepReport> {
        let mut report = SweepReport::default();
        let now = self.clock.now_millis();

        let mut live = self.store.list_pending().await?;
        live.extend(self.store.list_open().await?);

        let mut retry = Vec::new();
        for intent in live {
            if self.in_flight.contains(&intent.id) {
                report.skipped_in_flight += 1;
                continue;
            }
            if intent.awaiting_reconciliation() {
                self.reconcile(intent).await;
                report.reconciled += 1;
                continue;
            }
            if intent.is_expired_at(now) {
                if self.expire(&intent, now).await {
                    report.expired += 1;
                }
                continue;
            }
            retry.push(intent);
        }

        for intent in retry {
            self.attempt(intent).await;
            report.retried += 1;
        }

        if let Some(record) = self.oracle.refresh().await {
            self.persist_rates(&[record]).await;
        }

        if report != SweepReport::default() {
            info!(
                "Sweep: {} expired, {} retried, {} reconciled, {} in flight",
                report.expired, report.retried, report.reconciled, report.skipped_in_flight
            );
        }
        Ok(report)
    }

    async fn persist_rates(&self, records: &[PriceRecord]) {
        for record in records {
            if let Err(e) = self.store.append_rate(record).await {
                warn!("Failed to persist {} rate record: {}", record.reason, e);
            }
        }
    }

    /// Main loop: sweep and health checks until stopped
    pub async fn run(&self) -> SettlerResult<()> {
        let mut sweep_interval = interval(Duration::from_secs(self.config.sweep_interval_secs));
        let mut health_interval =
            interval(Duration::from_secs(self.config.health_check_interval_secs));

        info!("Settlement engine started ({})", self.config.instance_id);

        loop {
            if *self.shutdown.read().await {
                break;
            }

            tokio::select! {
                _ = sweep_interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!("Sweep failed: {}", e);
                    }
                }

                _ = health_interval.tick() => {
                    self.health_check().await;
                }
            }
        }

        info!("Settlement engine stopped");
        Ok(())
    }

    /// Store and chain health; true when everything answered
    pub async fn health_check(&self) -> bool {
        let store_ok = match self.store.health_check().await {
            Ok(()) => true,
            Err(e) => {
                error!("Intent store health check failed: {}", e);
                false
            }
        };
        let chains = self.chains.health_check().await;
        store_ok && chains.iter().all(|(_, healthy)| *healthy)
    }

    /// Stop the engine
    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
    }
}

fn existing_outcome(intent: &Intent) -> SubmitOutcome {
    SubmitOutcome {
        intent_id: intent.id.clone(),
        status: intent.status,
        existing: true,
        quoted_amount_out: intent.quoted_amount_out,
    }
}
