//! Finite state machine for stream negotiation.
//!
//! Negotiating an XMPP stream is not a linear handshake: which steps run,
//! and in which order, depends on configuration and on what the server
//! advertises after each stream open. This module models the negotiation
//! as a directed graph of states and walks it:
//!
//! - [`descriptor`]: static per-state metadata — identity, properties,
//!   successor and precedence declarations. Pure data.
//! - [`graph`]: builds the connected state graph from a descriptor
//!   registry, resolving inferred back-edges and ordering multi-successor
//!   fan-outs by a topological sort of their precedence declarations.
//! - [`state`]: the runtime [`State`](state::State) trait bound to a live
//!   connection, plus the transition result taxonomy.
//! - [`walk`]: the depth-first walk engine — try edges in priority order,
//!   record why candidates were rejected, backtrack on dead ends, unwind
//!   and reset on errors.
//!
//! The graph shape is static per connection class; the runtime states are
//! instantiated once per connection and reset, never recreated, when a
//! walk is abandoned or the connection drops.

pub mod descriptor;
pub mod graph;
pub mod state;
pub mod walk;

pub use descriptor::{DescriptorRegistry, ExternalReference, StateDescriptor, StateId};
pub use graph::{StateGraph, VertexId};
pub use state::{
    NoOpState, State, TransitionFailure, TransitionImpossible, TransitionOutcome,
    TransitionSuccess,
};
pub use walk::{Credentials, WalkContext, WalkContextBuilder};
