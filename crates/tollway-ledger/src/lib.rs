//! Tiered quota ledger
//!
//! Requests are paid for by a time plan, a usage plan, or a cash balance,
//! in that order of preference. [`Ledger::check_quota`] answers whether a
//! user could pay without touching state; [`Ledger::process_deduction`]
//! charges exactly one source inside a store transaction and journals a
//! [`ConsumptionRecord`].

#![allow(clippy::missing_errors_doc, clippy::must_use_candidate)]

mod error;
pub mod funding;
mod ledger;
pub mod model;
mod outcome;
pub mod store;

pub use error::LedgerError;
pub use funding::{FundingPolicy, FundingSnapshot, FundingSource, reset_if_stale, select_funding};
pub use ledger::{Ledger, LedgerSettings, MONEY_SCALE, NewCard};
pub use model::*;
pub use outcome::*;
pub use store::{ConsumptionSummary, LedgerStore, LedgerTx, MemoryLedgerStore};
#[cfg(feature = "postgres")]
pub use store::PostgresLedgerStore;
