//! Metered pass-through to the upstream messages API
//!
//! Each request is admitted against the quota ledger, sent upstream on a
//! pooled OAuth account, and streamed back unchanged. The usage reported
//! at the end of the stream is charged by a background [`BillingQueue`].

#![allow(clippy::missing_errors_doc, clippy::must_use_candidate)]

pub mod billing;
mod error;
mod handler;
mod state;
pub mod usage;

pub use billing::{BillingJob, BillingQueue, Biller};
pub use error::{RelayError, error_response};
pub use handler::relay_router;
pub use state::{RelaySettings, RelayState};
