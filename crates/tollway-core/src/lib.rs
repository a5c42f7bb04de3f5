//! Shared types for the Tollway gateway
//!
//! Identity, clock, and token-usage types used across the ledger,
//! account manager, and relay crates

#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

mod clock;
mod context;
mod error;
mod usage;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use context::CallerIdentity;
pub use error::HttpError;
pub use usage::TokenUsage;
