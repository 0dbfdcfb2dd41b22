//! Price change records and the bounded in-memory tail

use crate::intent::Direction;

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceChangeReason {
    Initial,
    Swap,
    SmoothingUpdate,
    CircuitBreaker,
}

impl PriceChangeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceChangeReason::Initial => "initial",
            PriceChangeReason::Swap => "swap",
            PriceChangeReason::SmoothingUpdate => "smoothing_update",
            PriceChangeReason::CircuitBreaker => "circuit_breaker",
        }
    }
}

impl fmt::Display for PriceChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PriceChangeReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initial" => Ok(PriceChangeReason::Initial),
            "swap" => Ok(PriceChangeReason::Swap),
            "smoothing_update" => Ok(PriceChangeReason::SmoothingUpdate),
            "circuit_breaker" => Ok(PriceChangeReason::CircuitBreaker),
            other => Err(format!("unknown price change reason: {}", other)),
        }
    }
}

/// Immutable price log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub rate: f64,
    pub timestamp: i64,
    pub reason: PriceChangeReason,
    pub volume: Option<f64>,
    pub direction: Option<Direction>,
}

/// Ring buffer cache of recent records. The store's append-only log is the
/// system of record.
#[derive(Debug, Clone)]
pub struct PriceHistory {
    capacity: usize,
    entries: VecDeque<PriceRecord>,
}

impl PriceHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, record: PriceRecord) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(record);
    }

    /// Newest first, at most `limit` entries
    pub fn latest(&self, limit: usize) -> Vec<PriceRecord> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
