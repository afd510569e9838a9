//! Bifrost error types

use std::io;
use std::sync::Arc;

use crate::state::State;

/// Bifrost error types
///
/// Construction problems are aggregated into [`Setup`](BifrostError::Setup)
/// so every misconfiguration is reported at once. Failures in background
/// serve loops are never propagated across task boundaries; they are
/// recorded in the diagnostics log (see [`Server::errors`]) and reflected
/// through the state machine.
///
/// [`Server::errors`]: crate::Server::errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum BifrostError {
    // Construction errors
    #[error("error during server setup: [{}]", .0.join("; "))]
    Setup(Vec<String>),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("failed to bind {role} listener on port {port}: {source}")]
    Bind {
        role: &'static str,
        port: u16,
        #[source]
        source: Arc<io::Error>,
    },

    // Runtime errors
    /// An accept loop failed after the service started serving.
    #[error("serve loop failed: {0}")]
    Serve(#[source] Arc<io::Error>),

    /// A lifecycle operation was invoked in the wrong state.
    #[error("server is not in a valid state, want: {expected} have: {actual}")]
    InvalidState { expected: State, actual: State },

    #[error("gateway registration failed: {0}")]
    Registration(String),
}

/// Result type alias for bifrost operations
pub type Result<T> = std::result::Result<T, BifrostError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_lists_every_problem() {
        let err = BifrostError::Setup(vec!["no port".to_string(), "no certs".to_string()]);
        let rendered = err.to_string();
        assert!(rendered.contains("no port"), "{rendered}");
        assert!(rendered.contains("no certs"), "{rendered}");
    }

    #[test]
    fn invalid_state_names_both_states() {
        let err = BifrostError::InvalidState {
            expected: State::Init,
            actual: State::Stopped,
        };
        assert_eq!(
            err.to_string(),
            "server is not in a valid state, want: INIT have: STOPPED"
        );
    }
}
