#![allow(dead_code)]

pub mod seed;
pub mod server;
pub mod world;

use std::time::Duration;

/// Poll `check` until it holds or two seconds pass
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
