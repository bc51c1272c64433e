use once_cell::sync::Lazy;
use prometheus_client::metrics::counter::Counter;

/// Counts proposals created.
pub static PROPOSALS_CREATED: Lazy<Counter> = Lazy::new(Counter::default);

/// Counts ballots recorded (local and remote).
pub static VOTES_CAST: Lazy<Counter> = Lazy::new(Counter::default);

/// Counts proposals finalized in any terminal status.
pub static PROPOSALS_FINALIZED: Lazy<Counter> = Lazy::new(Counter::default);
