use once_cell::sync::Lazy;
use prometheus_client::metrics::counter::Counter;

/// Counts accusations created locally.
pub static ACCUSATIONS_CREATED: Lazy<Counter> = Lazy::new(Counter::default);

/// Counts accusations accepted from upstream peers.
pub static ACCUSATIONS_RECEIVED: Lazy<Counter> = Lazy::new(Counter::default);

/// Counts analyses ending in an applied penalty.
pub static ACCUSATIONS_VERIFIED: Lazy<Counter> = Lazy::new(Counter::default);

/// Counts analyses ending in rejection.
pub static ACCUSATIONS_REJECTED: Lazy<Counter> = Lazy::new(Counter::default);
