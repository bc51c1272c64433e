use once_cell::sync::Lazy;
use prometheus_client::metrics::counter::Counter;

/// Counts kernel gain applications across stores.
pub static GAIN_APPLICATIONS: Lazy<Counter> = Lazy::new(Counter::default);

/// Counts kernel loss applications across stores.
pub static LOSS_APPLICATIONS: Lazy<Counter> = Lazy::new(Counter::default);

/// Counts nodes touched by natural-decay sweeps.
pub static DECAY_EVENTS: Lazy<Counter> = Lazy::new(Counter::default);

/// Counts tolerance charges refused with Exceeded.
pub static TOLERANCE_EXCEEDED: Lazy<Counter> = Lazy::new(Counter::default);
