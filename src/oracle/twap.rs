//! Time-weighted average price over a sliding window

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq)]
struct PriceSample {
    price: f64,
    timestamp: i64,
    /// How long this price was active; 0 while it is still the latest
    duration: i64,
}

/// Sliding window of price samples. The newest sample is never dropped.
#[derive(Debug, Clone)]
pub struct TwapWindow {
    window_ms: i64,
    samples: VecDeque<PriceSample>,
}

impl TwapWindow {
    pub fn new(window_ms: i64, price: f64, now: i64) -> Self {
        let mut samples = VecDeque::new();
        samples.push_back(PriceSample {
            price,
            timestamp: now,
            duration: 0,
        });
        Self { window_ms, samples }
    }

    /// Close out the previous sample and start a new one at `price`
    pub fn record(&mut self, price: f64, now: i64) {
        if let Some(last) = self.samples.back_mut() {
            last.duration = (now - last.timestamp).max(0);
        }
        self.samples.push_back(PriceSample {
            price,
            timestamp: now,
            duration: 0,
        });
        self.prune(now);
    }

    /// Drop samples that ended before the window start
    pub fn prune(&mut self, now: i64) {
        let window_start = now - self.window_ms;
        while self.samples.len() > 1 {
            match self.samples.front() {
                Some(front) if front.timestamp + front.duration < window_start => {
                    self.samples.pop_front();
                }
                _ => break,
            }
        }
    }

    /// Average of active prices weighted by their overlap with the window
    pub fn value(&self, now: i64) -> f64 {
        let window_start = now - self.window_ms;
        let last_index = self.samples.len().saturating_sub(1);

        let mut weighted = 0.0;
        let mut total = 0i64;
        for (idx, sample) in self.samples.iter().enumerate() {
            let end = if idx == last_index {
                now
            } else {
                sample.timestamp + sample.duration
            };
            let start = sample.timestamp.max(window_start);
            let weight = (end - start).max(0);
            weighted += sample.price * weight as f64;
            total += weight;
        }

        if total == 0 {
            return self.latest();
        }
        weighted / total as f64
    }

    pub fn latest(&self) -> f64 {
        self.samples.back().map(|s| s.price).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }
}
