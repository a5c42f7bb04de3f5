//! Metric names and recording helpers
//!
//! Instruments are created from the global meter on first use, so
//! [`crate::init`] must run before any request is served for them to
//! reach the configured exporter.

use std::sync::LazyLock;

use opentelemetry::{KeyValue, global, metrics::Counter};

pub const LEDGER_DEDUCTION_COUNT: &str = "ledger.deduction.count";
pub const LEDGER_UNBILLED_COUNT: &str = "ledger.unbilled.count";
pub const RELAY_REQUEST_COUNT: &str = "relay.request.count";
pub const UPSTREAM_ACCOUNT_TRANSITION_COUNT: &str = "upstream.account.transition.count";

/// Log target for usage that was relayed but could not be billed
pub const UNBILLED_TARGET: &str = "tollway::unbilled";

struct Instruments {
    deductions: Counter<u64>,
    unbilled: Counter<u64>,
    relay_requests: Counter<u64>,
    account_transitions: Counter<u64>,
}

static INSTRUMENTS: LazyLock<Instruments> = LazyLock::new(|| {
    let meter = global::meter("tollway");
    Instruments {
        deductions: meter
            .u64_counter(LEDGER_DEDUCTION_COUNT)
            .with_description("Deductions attempted, by funding source and outcome")
            .build(),
        unbilled: meter
            .u64_counter(LEDGER_UNBILLED_COUNT)
            .with_description("Relayed requests whose usage could not be billed")
            .build(),
        relay_requests: meter
            .u64_counter(RELAY_REQUEST_COUNT)
            .with_description("Relayed requests by response status")
            .build(),
        account_transitions: meter
            .u64_counter(UPSTREAM_ACCOUNT_TRANSITION_COUNT)
            .with_description("Upstream account status changes")
            .build(),
    }
});

pub fn record_deduction(deduction_type: &str, outcome: &str) {
    INSTRUMENTS.deductions.add(
        1,
        &[
            KeyValue::new("deduction_type", deduction_type.to_string()),
            KeyValue::new("outcome", outcome.to_string()),
        ],
    );
}

pub fn record_unbilled() {
    INSTRUMENTS.unbilled.add(1, &[]);
}

pub fn record_relay_request(status: u16) {
    INSTRUMENTS
        .relay_requests
        .add(1, &[KeyValue::new("status", i64::from(status))]);
}

pub fn record_account_transition(to: &str) {
    INSTRUMENTS
        .account_transitions
        .add(1, &[KeyValue::new("to", to.to_string())]);
}
