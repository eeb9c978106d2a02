//! Error types for stream negotiation.
//!
//! Three layers of taxonomy:
//!
//! - [`GraphError`]: state graph construction problems. These are
//!   programming errors in descriptor declarations and surface the first
//!   time a connection class builds its graph, never mid-walk.
//! - [`SaslError`]: authentication failures reported by a mechanism or by
//!   mechanism selection.
//! - [`C2sError`]: everything a walk can surface to the caller, wrapping
//!   the two above plus I/O, timeout and protocol failures.
//!
//! Recoverable per-edge conditions (a state being impossible or failing)
//! are *not* errors; they are recorded as transition reasons and the walk
//! tries the next sibling edge. Only conditions that end the whole walk
//! become a `C2sError`.

use thiserror::Error;

use crate::fsm::descriptor::StateId;

/// Errors raised while constructing the state descriptor graph.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// A non-final descriptor declares no successors and none were inferred.
    #[error("state {0} is not final but has no successor")]
    NoSuccessors(StateId),

    /// A referenced state has no registered descriptor.
    #[error("no descriptor registered for state {0}")]
    MissingDescriptor(StateId),

    /// Two edges between the same pair of vertices.
    #[error("duplicate edge from {from} to {to}")]
    DuplicateEdge {
        /// Source state of the offending edge.
        from: StateId,
        /// Target state of the offending edge.
        to: StateId,
    },

    /// A precedence declaration points outside the sibling successor set.
    #[error("{declarer} declares precedence against {referenced}, which is not part of the successor set")]
    UnknownPrecedenceReference {
        /// State declaring the relationship.
        declarer: StateId,
        /// State referenced by the declaration.
        referenced: StateId,
    },

    /// The sibling precedence declarations form a cycle.
    #[error("cyclic precedence among successor states {among:?}")]
    PrecedenceCycle {
        /// States participating in the cycle.
        among: Vec<StateId>,
    },
}

/// SASL authentication errors.
///
/// Mechanism internals are opaque to the state machine; everything a
/// mechanism reports funnels into one of these.
#[derive(Error, Debug)]
pub enum SaslError {
    /// The server rejected the authentication exchange.
    #[error("SASL authentication failed: {condition}")]
    Failed {
        /// Failure condition reported by the server (e.g. `not-authorized`).
        condition: String,
    },

    /// No locally registered mechanism matches the server's offer.
    #[error("no mutually supported SASL mechanism, server offers {offered:?}")]
    NoCommonMechanism {
        /// Mechanisms advertised by the server.
        offered: Vec<String>,
    },

    /// The exchange violated the mechanism's own protocol.
    #[error("SASL mechanism {mechanism} protocol error: {detail}")]
    Protocol {
        /// Name of the mechanism in use.
        mechanism: String,
        /// What went wrong.
        detail: String,
    },
}

/// Errors surfaced by connection operations.
#[derive(Error, Debug)]
pub enum C2sError {
    /// The server did not answer within the configured reply timeout.
    #[error("no response from server while waiting for {waiting_for}")]
    NoResponse {
        /// What the walk thread was blocked on.
        waiting_for: String,
    },

    /// Every outgoing edge of the current position was tried and none
    /// succeeded. Carries the walked path and the per-state reasons for
    /// diagnosis.
    #[error("state graph dead end after {path:?}; attempted states: {}", format_failures(.failures))]
    StateGraphDeadEnd {
        /// States visited during the walk, in order.
        path: Vec<StateId>,
        /// Failed candidate states with the reason each was not entered.
        failures: Vec<(StateId, String)>,
    },

    /// A mandatory intermediate state could not be entered. No sibling
    /// fallback is permitted for mandatory states.
    #[error("mandatory intermediate state {state} could not be entered: {reason}")]
    MandatoryStateFailed {
        /// The mandatory state.
        state: StateId,
        /// Why entry did not happen.
        reason: String,
    },

    /// The state machine was driven in a way its graph forbids. Indicates
    /// a bug in the caller or in a state implementation.
    #[error("state machine violation: {0}")]
    StateMachineViolation(String),

    /// The stream terminated while a walk was blocked on it.
    #[error("connection unexpectedly terminated: {0}")]
    UnexpectedTermination(String),

    /// The server reported a stream-level error condition.
    #[error("stream error: {0}")]
    Stream(String),

    /// Operation requires an established connection.
    #[error("connection not connected")]
    NotConnected,

    /// Authentication failed.
    #[error(transparent)]
    Sasl(#[from] SaslError),

    /// State graph construction failed.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Stream compression could not be negotiated or operated.
    #[error("compression error: {0}")]
    Compression(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for connection operations.
pub type Result<T> = std::result::Result<T, C2sError>;

fn format_failures(failures: &[(StateId, String)]) -> String {
    let parts: Vec<String> = failures
        .iter()
        .map(|(state, reason)| format!("{state}: {reason}"))
        .collect();
    parts.join(", ")
}

impl From<toml::de::Error> for C2sError {
    fn from(err: toml::de::Error) -> Self {
        C2sError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dead_end_display_lists_reasons() {
        let err = C2sError::StateGraphDeadEnd {
            path: vec![StateId::Disconnected, StateId::ResolvingEndpoints],
            failures: vec![
                (
                    StateId::DirectTlsConnection,
                    "DirectTlsConnection is not implemented".to_string(),
                ),
                (StateId::ConnectingToHost, "no route to host".to_string()),
            ],
        };
        let text = err.to_string();
        assert!(text.contains("dead end"));
        assert!(text.contains("DirectTlsConnection is not implemented"));
        assert!(text.contains("no route to host"));
    }

    #[test]
    fn test_sasl_error_into_c2s() {
        let err: C2sError = SaslError::Failed {
            condition: "not-authorized".to_string(),
        }
        .into();
        assert!(err.to_string().contains("not-authorized"));
    }
}
