//! Market-making price oracle
//!
//! Prices trades against a virtual constant-product pool and publishes a
//! manipulation-resistant effective rate:
//! - spot comes straight from the virtual reserves
//! - an EMA and a sliding-window TWAP smooth the spot
//! - a circuit breaker freezes spot at the pre-trade EMA when one trade
//!   moves it too far, and the effective rate falls back to TWAP alone
//! - spot and EMA are clamped into a configured band

mod history;
mod reserves;
mod twap;

pub use history::{PriceChangeReason, PriceHistory, PriceRecord};
pub use reserves::VirtualReserves;
pub use twap::TwapWindow;

use crate::clock::Clock;
use crate::config::OracleConfig;
use crate::intent::Direction;

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const EMA_WEIGHT: f64 = 0.7;
const TWAP_WEIGHT: f64 = 0.3;

/// Relative EMA movement below which a smoothing tick is not logged
const SMOOTHING_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateSnapshot {
    pub rate: f64,
    pub as_of: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PriceImpact {
    pub impact_percent: f64,
    pub effective_price: f64,
    pub spot_price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct VolumeTotals {
    pub a_to_b: f64,
    pub b_to_a: f64,
    pub swaps: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OracleStats {
    pub spot: f64,
    pub ema: f64,
    pub twap: f64,
    pub effective: f64,
    pub reserves: VirtualReserves,
    pub volume: VolumeTotals,
    pub price_deviation: f64,
    pub circuit_breaker_active: bool,
    pub circuit_breaker_until: Option<i64>,
    pub as_of: i64,
}

struct OracleState {
    reserves: VirtualReserves,
    spot: f64,
    ema: f64,
    twap: TwapWindow,
    breaker_until: Option<i64>,
    history: PriceHistory,
    volume: VecDeque<(i64, Direction, f64)>,
}

impl OracleState {
    fn breaker_active(&self, now: i64) -> bool {
        self.breaker_until.map(|until| now < until).unwrap_or(false)
    }

    fn effective(&self, now: i64) -> f64 {
        let twap = self.twap.value(now);
        if self.breaker_active(now) {
            twap
        } else {
            EMA_WEIGHT * self.ema + TWAP_WEIGHT * twap
        }
    }

    /// Move the pool to `price`, keeping `k`
    fn reprice(&mut self, price: f64) {
        self.reserves = VirtualReserves::at_price(self.reserves.k, price);
        self.spot = price;
    }

    fn volume_totals(&self, now: i64, window_ms: i64) -> VolumeTotals {
        let start = now - window_ms;
        self.volume
            .iter()
            .filter(|(ts, _, _)| *ts >= start)
            .fold(VolumeTotals::default(), |mut totals, (_, direction, amount)| {
                match direction {
                    Direction::AToB => totals.a_to_b += amount,
                    Direction::BToA => totals.b_to_a += amount,
                }
                totals.swaps += 1;
                totals
            })
    }

    fn prune_volume(&mut self, now: i64, window_ms: i64) {
        let start = now - window_ms;
        while matches!(self.volume.front(), Some((ts, _, _)) if *ts < start) {
            self.volume.pop_front();
        }
    }
}

/// Price oracle owning the virtual market. Constructed once by the
/// composition root and shared with the engine.
pub struct PriceOracle {
    config: OracleConfig,
    clock: Arc<dyn Clock>,
    state: RwLock<OracleState>,
}

impl PriceOracle {
    /// Create a fresh oracle seeded at the configured initial rate
    pub fn new(config: OracleConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_millis();
        let rate = config.initial_rate;
        let mut history = PriceHistory::new(config.history_capacity);
        history.push(PriceRecord {
            rate,
            timestamp: now,
            reason: PriceChangeReason::Initial,
            volume: None,
            direction: None,
        });

        let state = OracleState {
            reserves: VirtualReserves::seeded(config.initial_reserve_a, rate),
            spot: rate,
            ema: rate,
            twap: TwapWindow::new(secs_to_ms(config.twap_window_secs), rate, now),
            breaker_until: None,
            history,
            volume: VecDeque::new(),
        };

        info!("Price oracle seeded at rate {}", rate);

        Self {
            config,
            clock,
            state: RwLock::new(state),
        }
    }

    /// Rebuild the oracle from a persisted history tail (newest first).
    /// Reserves are reseeded at the last recorded rate with the configured `k`.
    pub fn resume(config: OracleConfig, clock: Arc<dyn Clock>, tail: Vec<PriceRecord>) -> Self {
        let Some(latest) = tail.first().cloned() else {
            return Self::new(config, clock);
        };

        let now = clock.now_millis();
        let rate = latest.rate.clamp(config.min_rate, config.max_rate);
        let k = VirtualReserves::seeded(config.initial_reserve_a, config.initial_rate).k;

        let mut history = PriceHistory::new(config.history_capacity);
        for record in tail.into_iter().rev() {
            history.push(record);
        }

        let state = OracleState {
            reserves: VirtualReserves::at_price(k, rate),
            spot: rate,
            ema: rate,
            twap: TwapWindow::new(secs_to_ms(config.twap_window_secs), rate, now),
            breaker_until: None,
            history,
            volume: VecDeque::new(),
        };

        info!(
            "Price oracle resumed at rate {} (last recorded {} at {})",
            rate, latest.reason, latest.timestamp
        );

        Self {
            config,
            clock,
            state: RwLock::new(state),
        }
    }

    /// Output for `amount_in` against the current reserves, net of fee
    pub async fn quote(&self, amount_in: f64, direction: Direction, fee_bps: u32) -> f64 {
        self.state.read().await.reserves.quote(amount_in, direction, fee_bps)
    }

    /// Fee-free execution price versus spot, in the direction's own terms
    pub async fn price_impact(&self, direction: Direction, amount: f64) -> PriceImpact {
        let state = self.state.read().await;
        let spot_price = state.reserves.directional_spot(direction);
        let amount_out = state.reserves.quote(amount, direction, 0);

        if amount_out <= 0.0 {
            return PriceImpact {
                impact_percent: 0.0,
                effective_price: spot_price,
                spot_price,
            };
        }

        let effective_price = amount_out / amount;
        PriceImpact {
            impact_percent: (spot_price - effective_price) / spot_price * 100.0,
            effective_price,
            spot_price,
        }
    }

    /// Effective rate: 70% EMA / 30% TWAP, or TWAP alone while the breaker is on
    pub async fn current_rate(&self) -> RateSnapshot {
        let now = self.clock.now_millis();
        let state = self.state.read().await;
        RateSnapshot {
            rate: state.effective(now),
            as_of: now,
        }
    }

    /// Reflect a fulfilled trade in the market. Returns the records that were
    /// appended so the caller can persist them.
    pub async fn record_swap(&self, direction: Direction, amount_in: f64) -> Vec<PriceRecord> {
        let now = self.clock.now_millis();
        let mut state = self.state.write().await;
        let mut records = Vec::new();

        let old_spot = state.spot;
        let pre_trade_ema = state.ema;

        state.reserves.apply_swap(direction, amount_in);
        state.spot = state.reserves.spot();

        let change = (state.spot - old_spot).abs() / old_spot;
        let tripped = change > self.config.circuit_breaker_threshold;
        if tripped {
            let until = now + secs_to_ms(self.config.circuit_breaker_cooldown_secs);
            warn!(
                "Circuit breaker tripped: spot moved {:.2}% ({} -> {}), freezing at EMA {} until {}",
                change * 100.0,
                old_spot,
                state.spot,
                pre_trade_ema,
                until
            );
            state.reprice(pre_trade_ema);
            state.breaker_until = Some(until);
            crate::metrics::record_circuit_breaker();
        }

        let spot = state.spot;
        let clamped = spot.clamp(self.config.min_rate, self.config.max_rate);
        if clamped != spot {
            warn!(
                "Spot {} outside band [{}, {}], clamping to {}",
                spot, self.config.min_rate, self.config.max_rate, clamped
            );
            state.reprice(clamped);
        }

        // Smoothing windows only ever see in-band prices
        let alpha = self.config.ema_alpha;
        state.ema = alpha * state.spot + (1.0 - alpha) * state.ema;
        state.ema = state.ema.clamp(self.config.min_rate, self.config.max_rate);
        let spot = state.spot;
        state.twap.record(spot, now);

        state.volume.push_back((now, direction, amount_in));
        let volume_window = secs_to_ms(self.config.volume_window_secs);
        state.prune_volume(now, volume_window);

        records.push(PriceRecord {
            rate: state.spot,
            timestamp: now,
            reason: PriceChangeReason::Swap,
            volume: Some(amount_in),
            direction: Some(direction),
        });
        if tripped {
            records.push(PriceRecord {
                rate: state.spot,
                timestamp: now,
                reason: PriceChangeReason::CircuitBreaker,
                volume: Some(amount_in),
                direction: Some(direction),
            });
        }
        for record in &records {
            state.history.push(record.clone());
        }

        let effective = state.effective(now);
        crate::metrics::record_rate(state.spot, effective);
        debug!(
            "Recorded {} swap of {}: spot {} ema {} effective {}",
            direction, amount_in, state.spot, state.ema, effective
        );

        records
    }

    /// Periodic smoothing tick. Rolls the windows forward, clears an expired
    /// breaker and steps the EMA toward spot.
    pub async fn refresh(&self) -> Option<PriceRecord> {
        let now = self.clock.now_millis();
        let mut state = self.state.write().await;

        if let Some(until) = state.breaker_until {
            if now >= until {
                info!("Circuit breaker cleared");
                state.breaker_until = None;
            }
        }

        state.twap.prune(now);
        let volume_window = secs_to_ms(self.config.volume_window_secs);
        state.prune_volume(now, volume_window);

        let previous = state.ema;
        let alpha = self.config.ema_alpha;
        state.ema = (alpha * state.spot + (1.0 - alpha) * state.ema)
            .clamp(self.config.min_rate, self.config.max_rate);

        if (state.ema - previous).abs() / previous <= SMOOTHING_EPSILON {
            return None;
        }

        let effective = state.effective(now);
        let record = PriceRecord {
            rate: effective,
            timestamp: now,
            reason: PriceChangeReason::SmoothingUpdate,
            volume: None,
            direction: None,
        };
        state.history.push(record.clone());
        crate::metrics::record_rate(state.spot, effective);
        Some(record)
    }

    /// Recent price records, newest first
    pub async fn history(&self, limit: usize) -> Vec<PriceRecord> {
        self.state.read().await.history.latest(limit)
    }

    pub async fn stats(&self) -> OracleStats {
        let now = self.clock.now_millis();
        let state = self.state.read().await;
        let twap = state.twap.value(now);
        let active = state.breaker_active(now);

        OracleStats {
            spot: state.spot,
            ema: state.ema,
            twap,
            effective: state.effective(now),
            reserves: state.reserves,
            volume: state.volume_totals(now, secs_to_ms(self.config.volume_window_secs)),
            price_deviation: if twap > 0.0 {
                (state.spot - twap).abs() / twap
            } else {
                0.0
            },
            circuit_breaker_active: active,
            circuit_breaker_until: if active { state.breaker_until } else { None },
            as_of: now,
        }
    }
}

fn secs_to_ms(secs: u64) -> i64 {
    i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::ManualClock;

    pub(crate) fn test_config() -> OracleConfig {
        OracleConfig {
            initial_rate: 0.001,
            initial_reserve_a: 1_000_000.0,
            ema_alpha: 0.2,
            twap_window_secs: 3600,
            circuit_breaker_threshold: 0.1,
            circuit_breaker_cooldown_secs: 300,
            min_rate: 0.0001,
            max_rate: 0.01,
            history_capacity: 1000,
            volume_window_secs: 86_400,
        }
    }

    fn oracle() -> (PriceOracle, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        (PriceOracle::new(test_config(), clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_initial_rate_and_history() {
        let (oracle, _) = oracle();
        let rate = oracle.current_rate().await;
        assert!((rate.rate - 0.001).abs() < 1e-15);

        let history = oracle.history(10).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].reason, PriceChangeReason::Initial);
    }

    #[tokio::test]
    async fn test_record_swap_moves_spot_and_keeps_k() {
        let (oracle, clock) = oracle();
        clock.advance_secs(10);
        let records = oracle.record_swap(Direction::AToB, 1_000.0).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reason, PriceChangeReason::Swap);

        let stats = oracle.stats().await;
        // Selling A makes A cheaper in B terms
        assert!(stats.spot < 0.001);
        assert!(stats.reserves.invariant_drift() < 1e-9);
        assert!(!stats.circuit_breaker_active);
        assert_eq!(stats.volume.a_to_b, 1_000.0);
        assert_eq!(stats.volume.swaps, 1);
    }

    #[tokio::test]
    async fn test_circuit_breaker_freezes_then_reverts() {
        let (oracle, clock) = oracle();
        let pre_trade_ema = oracle.stats().await.ema;

        clock.advance_secs(5);
        // 50% of the A reserve moves spot far beyond the 10% threshold
        let records = oracle.record_swap(Direction::AToB, 500_000.0).await;
        assert!(records
            .iter()
            .any(|r| r.reason == PriceChangeReason::CircuitBreaker));

        let stats = oracle.stats().await;
        assert!(stats.circuit_breaker_active);
        assert!((stats.spot - pre_trade_ema).abs() < 1e-15);
        assert!((stats.reserves.spot() - pre_trade_ema).abs() < 1e-12);
        assert!(stats.reserves.invariant_drift() < 1e-9);

        for _ in 0..4 {
            clock.advance_secs(60);
            let rate = oracle.current_rate().await;
            assert!((rate.rate - pre_trade_ema).abs() < 1e-15);
        }

        clock.advance_secs(61);
        let stats = oracle.stats().await;
        assert!(!stats.circuit_breaker_active);
        let blended = EMA_WEIGHT * stats.ema + TWAP_WEIGHT * stats.twap;
        assert!((stats.effective - blended).abs() < 1e-15);
    }

    #[tokio::test]
    async fn test_effective_rate_blends_ema_and_twap() {
        let (oracle, clock) = oracle();
        clock.advance_secs(60);
        oracle.record_swap(Direction::BToA, 20.0).await;
        clock.advance_secs(60);

        let stats = oracle.stats().await;
        assert!(!stats.circuit_breaker_active);
        assert!(stats.spot > 0.001);
        let blended = 0.7 * stats.ema + 0.3 * stats.twap;
        assert!((stats.effective - blended).abs() < 1e-15);
        assert!(stats.price_deviation > 0.0);
    }

    #[tokio::test]
    async fn test_clamp_resynthesizes_reserves() {
        let mut config = test_config();
        config.circuit_breaker_threshold = 100.0;
        config.max_rate = 0.0012;
        let clock = Arc::new(ManualClock::new(0));
        let oracle = PriceOracle::new(config, clock.clone());

        clock.advance_secs(1);
        oracle.record_swap(Direction::BToA, 500.0).await;

        let stats = oracle.stats().await;
        assert!((stats.spot - 0.0012).abs() < 1e-15);
        assert!((stats.reserves.spot() - 0.0012).abs() < 1e-12);
        assert!(stats.ema <= 0.0012);
        assert!(stats.reserves.invariant_drift() < 1e-9);

        clock.advance_secs(600);
        let later = oracle.stats().await;
        assert!(later.twap <= 0.0012 + 1e-15);
        assert!(later.effective <= 0.0012 + 1e-15);
        assert!(oracle.current_rate().await.rate <= 0.0012 + 1e-15);
    }

    #[tokio::test]
    async fn test_price_impact_against_trader() {
        let (oracle, _) = oracle();
        let impact = oracle.price_impact(Direction::AToB, 10_000.0).await;
        assert!(impact.impact_percent > 0.0);
        assert!(impact.effective_price < impact.spot_price);
        assert!((impact.spot_price - 0.001).abs() < 1e-15);

        let reverse = oracle.price_impact(Direction::BToA, 1.0).await;
        assert!((reverse.spot_price - 1000.0).abs() < 1e-9);
        assert!(reverse.impact_percent > 0.0);
    }

    #[tokio::test]
    async fn test_refresh_converges_ema_and_records() {
        let (oracle, clock) = oracle();
        clock.advance_secs(1);
        oracle.record_swap(Direction::AToB, 20_000.0).await;
        let before = oracle.stats().await;
        assert!(before.ema > before.spot);

        clock.advance_secs(30);
        let record = oracle.refresh().await.expect("ema moved");
        assert_eq!(record.reason, PriceChangeReason::SmoothingUpdate);
        let after = oracle.stats().await;
        assert!(after.ema < before.ema);
        assert!(after.ema >= after.spot);
    }

    #[tokio::test]
    async fn test_resume_from_persisted_tail() {
        let clock = Arc::new(ManualClock::new(5_000));
        let tail = vec![
            PriceRecord {
                rate: 0.0011,
                timestamp: 4_000,
                reason: PriceChangeReason::Swap,
                volume: Some(10.0),
                direction: Some(Direction::BToA),
            },
            PriceRecord {
                rate: 0.001,
                timestamp: 1_000,
                reason: PriceChangeReason::Initial,
                volume: None,
                direction: None,
            },
        ];
        let oracle = PriceOracle::resume(test_config(), clock, tail);
        let stats = oracle.stats().await;
        assert!((stats.spot - 0.0011).abs() < 1e-15);
        assert!((stats.reserves.spot() - 0.0011).abs() < 1e-12);
        let history = oracle.history(5).await;
        assert_eq!(history[0].timestamp, 4_000);
        assert_eq!(history[1].reason, PriceChangeReason::Initial);
    }
}
