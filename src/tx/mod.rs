//! Payout dispatch with per-chain serialization and bounded confirmation

mod confirm;
mod dispatcher;

pub use confirm::ConfirmationWaiter;
pub use dispatcher::{DispatchOutcome, LiquidityProbe, PayoutDispatcher};
