#![allow(dead_code)]

pub mod config;
pub mod mock_upstream;
pub mod server;

use std::{future::Future, time::Duration};

/// Poll `check` until it returns true or five seconds pass
///
/// Billing runs after the response completes, so ledger assertions have
/// to wait for the queue.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);

    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    check().await
}
