//! The state graph walk engine.
//!
//! A walk attempts to move the connection from its current vertex to a
//! requested final state, depth-first: try the highest-priority outgoing
//! edge, record the reason when a candidate is impossible or fails, fall
//! through to the next sibling, and stop when the final state is reached.
//!
//! Per visited vertex the checks run in this order:
//!
//! 1. Final state reached? Emit the event and stop.
//! 2. Mandatory intermediate state requested and not yet handled? If it
//!    is among the outgoing edges, attempt it immediately, out of
//!    priority order. Anything but success ends the walk with
//!    [`C2sError::MandatoryStateFailed`]; there is no sibling fallback
//!    for mandatory states, and a mandatory candidate the cycle guard
//!    would skip counts as failed rather than being skipped silently.
//! 3. Iterate edges in priority order. Already-visited non-multi-visit
//!    targets are skipped silently (loop edges, e.g. compression
//!    returning to its anchor). Not-implemented targets are recorded as
//!    impossible. Otherwise the candidate decides.
//!
//! Any error ends the whole walk: every state visited during the failed
//! attempt is reset in reverse order, the pre-walk position is restored,
//! and the error is returned to the caller unchanged. A walk that
//! exhausts every edge of a vertex fails with a dead-end error carrying
//! the walked path and the per-candidate reasons.

use std::fmt;

use tracing::{debug, trace};

use crate::connection::internal::ConnectionInternal;
use crate::error::{C2sError, Result};
use crate::events::ConnectionStateEvent;
use crate::fsm::descriptor::StateId;
use crate::fsm::graph::{StateGraph, VertexId};
use crate::fsm::state::{TransitionFailure, TransitionImpossible, TransitionOutcome, TransitionReason};

/// Login credentials attached to an authentication walk.
#[derive(Clone)]
pub struct Credentials {
    /// Account localpart or full authentication id.
    pub username: String,
    /// Account password.
    pub password: String,
}

impl Credentials {
    /// Create credentials.
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Per-walk-attempt context.
///
/// Created fresh for every walk and discarded when the walk completes,
/// successfully or not. Never persisted.
pub struct WalkContext {
    final_state: StateId,
    mandatory_intermediate: Option<StateId>,
    mandatory_handled: bool,
    credentials: Option<Credentials>,
    walked_path: Vec<(VertexId, StateId)>,
    failed: Vec<(StateId, TransitionReason)>,
}

impl WalkContext {
    /// Start building a context targeting the given final state.
    pub fn to(final_state: StateId) -> WalkContextBuilder {
        WalkContextBuilder {
            final_state,
            mandatory_intermediate: None,
            credentials: None,
        }
    }

    /// The requested final state.
    pub fn final_state(&self) -> StateId {
        self.final_state
    }

    /// Does this walk target the authenticated and resource bound state?
    pub fn targets_login(&self) -> bool {
        self.final_state == StateId::AuthenticatedAndResourceBound
    }

    /// Credentials attached to this walk, if any.
    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// States visited so far, in order.
    pub fn walked_path(&self) -> impl Iterator<Item = StateId> + '_ {
        self.walked_path.iter().map(|&(_, id)| id)
    }

    /// Vertices visited so far, in order.
    pub(crate) fn walked_vertices(&self) -> &[(VertexId, StateId)] {
        &self.walked_path
    }

    fn push_path(&mut self, vertex: VertexId, id: StateId) {
        self.walked_path.push((vertex, id));
    }

    fn has_visited(&self, vertex: VertexId) -> bool {
        self.walked_path.iter().any(|&(v, _)| v == vertex)
    }

    fn record(&mut self, id: StateId, reason: TransitionReason) {
        self.failed.push((id, reason));
    }

    fn path_ids(&self) -> Vec<StateId> {
        self.walked_path.iter().map(|&(_, id)| id).collect()
    }

    fn failure_strings(&self) -> Vec<(StateId, String)> {
        self.failed
            .iter()
            .map(|(id, reason)| (*id, reason.to_string()))
            .collect()
    }
}

/// Builder for [`WalkContext`].
pub struct WalkContextBuilder {
    final_state: StateId,
    mandatory_intermediate: Option<StateId>,
    credentials: Option<Credentials>,
}

impl WalkContextBuilder {
    /// Require the walk to pass through the given state, with no fallback
    /// if entering it fails.
    pub fn mandatory_intermediate(mut self, state: StateId) -> Self {
        self.mandatory_intermediate = Some(state);
        self
    }

    /// Attach login credentials.
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Finish the context.
    pub fn build(self) -> WalkContext {
        WalkContext {
            final_state: self.final_state,
            mandatory_intermediate: self.mandatory_intermediate,
            mandatory_handled: false,
            credentials: self.credentials,
            walked_path: Vec::new(),
            failed: Vec::new(),
        }
    }
}

/// Outcome of one attempt to enter a candidate state.
enum Attempt {
    /// Cycle guard: candidate already visited and not multi-visit.
    Skipped,
    /// Precondition unmet; recorded by the caller.
    NotPossible(TransitionImpossible),
    /// Attempted and failed; recorded by the caller.
    Failed(TransitionFailure),
    /// Entered; the position advanced to the candidate.
    Entered,
}

impl Attempt {
    fn describe(&self) -> String {
        match self {
            Self::Skipped => "state was already visited in this walk".to_string(),
            Self::NotPossible(impossible) => impossible.to_string(),
            Self::Failed(failure) => failure.to_string(),
            Self::Entered => "entered".to_string(),
        }
    }
}

/// Walk the state graph toward the context's final state.
///
/// On error the pre-walk position is restored and every state visited
/// during the failed attempt has been reset; the connection is left
/// exactly as before the call.
pub(crate) fn walk_state_graph(
    graph: &StateGraph,
    current: &mut VertexId,
    internal: &mut ConnectionInternal,
    ctx: &mut WalkContext,
) -> Result<()> {
    let previous = *current;
    match walk_internal(graph, current, internal, ctx) {
        Ok(()) => Ok(()),
        Err(err) => {
            debug!(error = %err, "walk failed, rolling back");
            for &(vertex, id) in ctx.walked_vertices().iter().rev() {
                internal.emit(ConnectionStateEvent::StateRevertBackwardsWalk { state: id });
                internal.reset_state(vertex);
            }
            *current = previous;
            Err(err)
        }
    }
}

fn walk_internal(
    graph: &StateGraph,
    current: &mut VertexId,
    internal: &mut ConnectionInternal,
    ctx: &mut WalkContext,
) -> Result<()> {
    loop {
        let vertex = *current;
        let descriptor = graph.descriptor(vertex);
        ctx.push_path(vertex, descriptor.id());
        trace!(state = %descriptor.id(), "visiting");

        if descriptor.id() == ctx.final_state() {
            // A state used as a walk target must be marked final.
            debug_assert!(descriptor.is_final(), "walk target {} is not final", descriptor.id());
            internal.emit(ConnectionStateEvent::FinalStateReached {
                state: descriptor.id(),
            });
            debug!(state = %descriptor.id(), "final state reached");
            return Ok(());
        }

        let edges = graph.edges(vertex);

        if let Some(mandatory) = ctx.mandatory_intermediate {
            if !ctx.mandatory_handled {
                let mandatory_vertex = edges
                    .iter()
                    .copied()
                    .find(|&v| graph.descriptor(v).id() == mandatory);
                if let Some(mandatory_vertex) = mandatory_vertex {
                    ctx.mandatory_handled = true;
                    let attempt =
                        attempt_enter_state(graph, current, internal, ctx, mandatory_vertex)?;
                    match attempt {
                        Attempt::Entered => continue,
                        other => {
                            return Err(C2sError::MandatoryStateFailed {
                                state: mandatory,
                                reason: other.describe(),
                            })
                        }
                    }
                }
            }
        }

        let mut entered = false;
        for candidate in edges.iter().copied() {
            let candidate_id = graph.descriptor(candidate).id();
            match attempt_enter_state(graph, current, internal, ctx, candidate)? {
                Attempt::Entered => {
                    entered = true;
                    break;
                }
                Attempt::Skipped => {}
                Attempt::NotPossible(impossible) => {
                    ctx.record(candidate_id, TransitionReason::Impossible(impossible));
                }
                Attempt::Failed(failure) => {
                    ctx.record(candidate_id, TransitionReason::Failed(failure));
                }
            }
        }

        if !entered {
            return Err(C2sError::StateGraphDeadEnd {
                path: ctx.path_ids(),
                failures: ctx.failure_strings(),
            });
        }
    }
}

fn attempt_enter_state(
    graph: &StateGraph,
    current: &mut VertexId,
    internal: &mut ConnectionInternal,
    ctx: &mut WalkContext,
    candidate: VertexId,
) -> Result<Attempt> {
    let descriptor = graph.descriptor(candidate);
    let id = descriptor.id();

    if !descriptor.is_multi_visit() && ctx.has_visited(candidate) {
        // A loop edge back to where it originated from, e.g. compression
        // returning to the unbound-authenticated anchor. Skipped without
        // recording a reason.
        return Ok(Attempt::Skipped);
    }

    if descriptor.is_not_implemented() {
        let impossible = TransitionImpossible::not_implemented(descriptor);
        internal.emit(ConnectionStateEvent::TransitionNotPossible {
            state: id,
            reason: impossible.reason().to_string(),
        });
        return Ok(Attempt::NotPossible(impossible));
    }

    let mut state = internal.take_state(candidate).ok_or_else(|| {
        C2sError::StateMachineViolation(format!("state {id} is already active"))
    })?;

    let possible = match state.is_transition_possible(ctx, internal) {
        Ok(possible) => possible,
        Err(err) => {
            internal.emit(ConnectionStateEvent::StateRevertBackwardsWalk { state: id });
            state.reset(internal);
            internal.put_back_state(candidate, state);
            return Err(err);
        }
    };
    if let Some(impossible) = possible {
        internal.emit(ConnectionStateEvent::TransitionNotPossible {
            state: id,
            reason: impossible.reason().to_string(),
        });
        internal.put_back_state(candidate, state);
        return Ok(Attempt::NotPossible(impossible));
    }

    internal.emit(ConnectionStateEvent::AboutToTransitionInto { state: id });
    trace!(state = %id, "attempting transition");

    match state.transition_into(ctx, internal) {
        Err(err) => {
            internal.emit(ConnectionStateEvent::StateRevertBackwardsWalk { state: id });
            state.reset(internal);
            internal.put_back_state(candidate, state);
            Err(err)
        }
        Ok(TransitionOutcome::Failure(failure)) => {
            internal.emit(ConnectionStateEvent::TransitionFailed {
                state: id,
                cause: failure.to_string(),
            });
            // Abandoned siblings must not retain partial negotiation
            // state when the walk moves on to the next edge.
            state.reset(internal);
            internal.put_back_state(candidate, state);
            Ok(Attempt::Failed(failure))
        }
        Ok(TransitionOutcome::Success(success)) => {
            *current = candidate;
            internal.emit(ConnectionStateEvent::SuccessfullyTransitionedInto {
                state: id,
                detail: success.detail().to_string(),
            });
            debug!(state = %id, detail = success.detail(), "transitioned");
            internal.put_back_state(candidate, state);
            Ok(Attempt::Entered)
        }
    }
}
