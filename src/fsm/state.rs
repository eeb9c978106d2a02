//! Runtime negotiation states and the transition result taxonomy.
//!
//! A [`State`] is one instantiated negotiation behavior bound to a live
//! connection for that connection's whole lifetime. It can check whether
//! entry is currently possible (cheap, feature-dependent), attempt the
//! transition (may perform blocking I/O), and reset its transition-local
//! fields when the walk abandons or reverts through it.
//!
//! Outcomes form a three-way taxonomy. Only success advances the
//! connection's position:
//!
//! - [`TransitionImpossible`]: the precondition is not met. Recorded, next
//!   sibling edge is tried.
//! - [`TransitionOutcome::Failure`]: the transition was attempted and
//!   failed without killing the stream. Recorded, next sibling tried.
//! - [`TransitionOutcome::Success`]: entered; carries a human-readable
//!   detail such as the negotiated mechanism or the bound resource.
//!
//! Errors returned from a state method are different from failures: they
//! end the entire walk and trigger rollback at the walk engine.

use std::fmt;

use crate::connection::internal::ConnectionInternal;
use crate::error::Result;
use crate::fsm::descriptor::StateDescriptor;
use crate::fsm::graph::VertexId;
use crate::fsm::walk::WalkContext;

/// Why a transition cannot currently be attempted.
#[derive(Debug, Clone)]
pub struct TransitionImpossible {
    reason: String,
    not_implemented: bool,
}

impl TransitionImpossible {
    /// Precondition not met.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            not_implemented: false,
        }
    }

    /// The descriptor is declared but carries no implementation.
    pub fn not_implemented(descriptor: &StateDescriptor) -> Self {
        Self {
            reason: format!("{} is not implemented", descriptor.full_name(false)),
            not_implemented: true,
        }
    }

    /// Human-readable reason.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Whether this is the not-implemented sub-case.
    pub fn is_not_implemented(&self) -> bool {
        self.not_implemented
    }
}

impl fmt::Display for TransitionImpossible {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

/// A successfully entered state, with negotiation detail for diagnostics.
#[derive(Debug, Clone)]
pub struct TransitionSuccess {
    detail: String,
}

impl TransitionSuccess {
    /// Success without further detail.
    pub fn empty() -> Self {
        Self {
            detail: String::new(),
        }
    }

    /// Success with a detail message.
    pub fn with_detail(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }

    /// Success of a SASL authentication, naming the mechanism used.
    pub fn sasl_authenticated(mechanism: &str) -> Self {
        Self::with_detail(format!("SASL authentication successful using {mechanism}"))
    }

    /// Success of resource binding, naming the server-assigned resource.
    pub fn resource_bound(bound: &str, requested: Option<&str>) -> Self {
        match requested {
            Some(requested) => Self::with_detail(format!(
                "resource '{bound}' bound (requested '{requested}')"
            )),
            None => Self::with_detail(format!("resource '{bound}' bound")),
        }
    }

    /// Success of compression negotiation, naming the method.
    pub fn compression_enabled(method: &str) -> Self {
        Self::with_detail(format!("{method} compression enabled"))
    }

    /// Negotiation detail, possibly empty.
    pub fn detail(&self) -> &str {
        &self.detail
    }
}

/// An attempted transition that failed without ending the walk.
#[derive(Debug, Clone)]
pub struct TransitionFailure {
    cause: String,
    source: Option<String>,
}

impl TransitionFailure {
    /// Failure with a cause description.
    pub fn new(cause: impl Into<String>) -> Self {
        Self {
            cause: cause.into(),
            source: None,
        }
    }

    /// Failure wrapping an underlying error.
    pub fn caused_by(cause: impl Into<String>, source: &dyn fmt::Display) -> Self {
        Self {
            cause: cause.into(),
            source: Some(source.to_string()),
        }
    }

    /// Cause description.
    pub fn cause(&self) -> &str {
        &self.cause
    }

    /// Underlying error, if one was preserved.
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }
}

impl fmt::Display for TransitionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{} ({source})", self.cause),
            None => f.write_str(&self.cause),
        }
    }
}

/// Result of [`State::transition_into`].
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    /// The state was entered; the position advances.
    Success(TransitionSuccess),
    /// The attempt failed; the walk records it and tries the next sibling.
    Failure(TransitionFailure),
}

/// Why a candidate state was not entered, as recorded in the walk context.
#[derive(Debug, Clone)]
pub enum TransitionReason {
    /// Entry was impossible.
    Impossible(TransitionImpossible),
    /// Entry was attempted and failed.
    Failed(TransitionFailure),
}

impl fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Impossible(impossible) => impossible.fmt(f),
            Self::Failed(failure) => failure.fmt(f),
        }
    }
}

/// One instantiated negotiation behavior bound to a live connection.
///
/// All state methods take the shared connection internals as an explicit
/// parameter; states own only their transition-local fields.
pub trait State: Send {
    /// The descriptor this state was instantiated from.
    fn descriptor(&self) -> &'static StateDescriptor;

    /// Check whether the transition is currently possible. `Ok(None)`
    /// means entry may be attempted; `Ok(Some(_))` records why not. May
    /// depend on server-advertised features. An `Err` ends the walk.
    fn is_transition_possible(
        &mut self,
        _ctx: &WalkContext,
        _conn: &mut ConnectionInternal,
    ) -> Result<Option<TransitionImpossible>> {
        Ok(None)
    }

    /// Attempt the transition. May block for network round trips.
    fn transition_into(
        &mut self,
        ctx: &WalkContext,
        conn: &mut ConnectionInternal,
    ) -> Result<TransitionOutcome>;

    /// Clear transition-local fields. Called whenever the walk abandons or
    /// reverts through this state, and when the connection drops.
    fn reset(&mut self, _conn: &mut ConnectionInternal) {}
}

/// Placeholder state: always possible, always succeeds instantly.
///
/// Used for descriptors that carry no behavior of their own, such as pure
/// anchor states. Distinct from `not_implemented` descriptors, which the
/// walk skips without entering.
pub struct NoOpState {
    descriptor: &'static StateDescriptor,
}

impl NoOpState {
    /// Create a no-op state for the given descriptor.
    pub fn new(descriptor: &'static StateDescriptor) -> Self {
        Self { descriptor }
    }
}

impl State for NoOpState {
    fn descriptor(&self) -> &'static StateDescriptor {
        self.descriptor
    }

    fn transition_into(
        &mut self,
        _ctx: &WalkContext,
        _conn: &mut ConnectionInternal,
    ) -> Result<TransitionOutcome> {
        Ok(TransitionOutcome::Success(TransitionSuccess::empty()))
    }
}

/// Vertex-indexed table of the runtime states of one connection.
///
/// The table is the 1:1 binding between graph vertices and state
/// instances. A state is temporarily taken out of its slot while one of
/// its methods runs, so the method can receive the connection internals
/// (which own this table) without aliasing.
pub struct StateTable {
    slots: Vec<Option<Box<dyn State>>>,
}

impl StateTable {
    /// Build the table from states constructed per vertex, in vertex order.
    pub fn new(states: Vec<Box<dyn State>>) -> Self {
        Self {
            slots: states.into_iter().map(Some).collect(),
        }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Take the state out of its slot. `None` if it is currently in use.
    pub(crate) fn take(&mut self, vertex: VertexId) -> Option<Box<dyn State>> {
        self.slots.get_mut(vertex.index()).and_then(Option::take)
    }

    /// Return a taken state to its slot.
    pub(crate) fn put_back(&mut self, vertex: VertexId, state: Box<dyn State>) {
        self.slots[vertex.index()] = Some(state);
    }
}
