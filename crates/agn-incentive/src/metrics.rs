use once_cell::sync::Lazy;
use prometheus_client::metrics::counter::Counter;

/// Counts rewards created (confirmed or pending).
pub static REWARDS_CREATED: Lazy<Counter> = Lazy::new(Counter::default);

/// Counts accepted propagation hops.
pub static PROPAGATIONS_ACCEPTED: Lazy<Counter> = Lazy::new(Counter::default);

/// Counts propagation hops refused for any reason.
pub static PROPAGATIONS_REFUSED: Lazy<Counter> = Lazy::new(Counter::default);
