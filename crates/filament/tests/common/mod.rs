#![allow(dead_code)]

use {
    filament::{Config, Runtime},
    std::{
        thread,
        time::{Duration, Instant},
    },
    tracing_subscriber::EnvFilter,
};

/// A runtime with `managers` threads and a short idle timeout. Set `RUST_LOG=filament=trace`
/// to see what the managers do.
pub fn runtime(managers: usize) -> Runtime {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    Runtime::with_config(
        Config::default()
            .managers(managers)
            .time_resolution(Duration::from_millis(1)),
    )
    .unwrap()
}

pub fn wait_until(mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(
            start.elapsed() < Duration::from_secs(10),
            "condition not reached in time"
        );
        thread::sleep(Duration::from_millis(1));
    }
}
