//! Telemetry metric name constants.
//!
//! Centralised metric names for bifrost lifecycle events. Consumers install
//! their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops.
//!
//! All metrics are prefixed with `bifrost_`; counters end in `_total`.

/// Total state transitions applied by the state machine.
///
/// Labels: `state` (the state entered).
pub const STATE_TRANSITIONS_TOTAL: &str = "bifrost_state_transitions_total";

/// Total serve-loop failures recorded in the diagnostics log.
///
/// Labels: `transport` ("rpc" | "http").
pub const SERVE_FAILURES_TOTAL: &str = "bifrost_serve_failures_total";

/// Total state notifications dropped because a subscriber channel was full.
pub const NOTIFICATIONS_MISSED_TOTAL: &str = "bifrost_notifications_missed_total";
