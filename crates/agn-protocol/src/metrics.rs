use once_cell::sync::Lazy;
use prometheus_client::metrics::counter::Counter;

/// Counts envelopes that passed full verification.
pub static ENVELOPES_ACCEPTED: Lazy<Counter> = Lazy::new(Counter::default);

/// Counts envelopes rejected for any reason.
pub static ENVELOPES_REJECTED: Lazy<Counter> = Lazy::new(Counter::default);

/// Counts envelopes rejected specifically as replays.
pub static REPLAYS_BLOCKED: Lazy<Counter> = Lazy::new(Counter::default);
