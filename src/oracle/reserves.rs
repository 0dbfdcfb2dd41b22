//! Virtual constant-product reserves used purely for pricing

use crate::intent::Direction;

use serde::Serialize;

const BPS_DENOMINATOR: f64 = 10_000.0;

/// Simulated pool. `rate = reserve_b / reserve_a` (units of B per unit of A).
/// `k` is held constant across trades.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VirtualReserves {
    pub reserve_a: f64,
    pub reserve_b: f64,
    pub k: f64,
}

impl VirtualReserves {
    /// Seed a pool holding `reserve_a` of A at the given rate
    pub fn seeded(reserve_a: f64, rate: f64) -> Self {
        let reserve_b = reserve_a * rate;
        Self {
            reserve_a,
            reserve_b,
            k: reserve_a * reserve_b,
        }
    }

    /// Rebuild reserves for `price` while preserving `k`
    pub fn at_price(k: f64, price: f64) -> Self {
        Self {
            reserve_a: (k / price).sqrt(),
            reserve_b: (k * price).sqrt(),
            k,
        }
    }

    pub fn spot(&self) -> f64 {
        self.reserve_b / self.reserve_a
    }

    /// `(reserve_in, reserve_out)` as seen by a trader in `direction`
    pub fn oriented(&self, direction: Direction) -> (f64, f64) {
        match direction {
            Direction::AToB => (self.reserve_a, self.reserve_b),
            Direction::BToA => (self.reserve_b, self.reserve_a),
        }
    }

    /// Spot price in the direction's own terms (output per unit input)
    pub fn directional_spot(&self, direction: Direction) -> f64 {
        let (reserve_in, reserve_out) = self.oriented(direction);
        reserve_out / reserve_in
    }

    /// Constant-product output for `amount_in`, net of `fee_bps`. Never negative.
    pub fn quote(&self, amount_in: f64, direction: Direction, fee_bps: u32) -> f64 {
        if !(amount_in.is_finite() && amount_in > 0.0) {
            return 0.0;
        }

        let (reserve_in, reserve_out) = self.oriented(direction);
        let gross = reserve_out - self.k / (reserve_in + amount_in);
        if !(gross.is_finite() && gross > 0.0) {
            return 0.0;
        }

        let fee_fraction = f64::from(fee_bps) / BPS_DENOMINATOR;
        (gross * (1.0 - fee_fraction)).max(0.0)
    }

    /// Move the pool by a realized trade. Returns the fee-free amount out.
    pub fn apply_swap(&mut self, direction: Direction, amount_in: f64) -> f64 {
        if !(amount_in.is_finite() && amount_in > 0.0) {
            return 0.0;
        }

        match direction {
            Direction::AToB => {
                let before = self.reserve_b;
                self.reserve_a += amount_in;
                self.reserve_b = self.k / self.reserve_a;
                before - self.reserve_b
            }
            Direction::BToA => {
                let before = self.reserve_a;
                self.reserve_b += amount_in;
                self.reserve_a = self.k / self.reserve_b;
                before - self.reserve_a
            }
        }
    }

    /// Relative divergence of `reserve_a * reserve_b` from `k`
    pub fn invariant_drift(&self) -> f64 {
        ((self.reserve_a * self.reserve_b) - self.k).abs() / self.k
    }
}
