//! # c2s-core - XMPP Client-to-Server Stream Negotiation
//!
//! Client-side connection state machine negotiating an XMPP stream: from
//! raw connect through feature discovery, optional TLS and stream
//! compression, SASL authentication and resource binding, to an
//! authenticated, resource-bound session — and safely back down to
//! disconnected on error.
//!
//! ## Why a graph
//!
//! Stream negotiation is not a linear handshake. Which steps run, and in
//! which order, depends on configuration and on what the server
//! advertises after each stream open; some steps loop back (compression
//! re-opens the stream and re-enters feature discovery) and some walks
//! must pass through a specific state with no fallback. The crate models
//! this as a directed graph of states walked depth-first:
//!
//! ```text
//! Disconnected
//!   └→ ResolvingEndpoints ─┬→ DirectTlsConnection (not impl.)
//!                          └→ ConnectingToHost ─┬→ EstablishingTls ─┐
//!                                               └───────────────────┴→ ConnectedButUnauthenticated
//!        ┌───────────────────────────────────────────────────────────────┘
//!        ├→ InstantStreamResumption / Bind2 (not impl.)
//!        ├→ SaslAuthentication → AuthenticatedButUnbound (multi-visit)
//!        │      ┌→ Compression ──┘ (loops back after re-opening the stream)
//!        │      ├→ StreamResumption (not impl.)
//!        │      └→ ResourceBinding → AuthenticatedAndResourceBound
//!        └→ Shutdown / InstantShutdown → CloseConnection → Disconnected
//! ```
//!
//! Edge order is the attempt order, resolved at graph build time from the
//! descriptors' precedence declarations. Candidates that are impossible
//! (feature not advertised, disabled in config) or that fail are recorded
//! and the walk falls through to the next sibling; a walk that cannot
//! reach its target fails with the full path and per-candidate reasons
//! attached.
//!
//! ## Outcome semantics
//!
//! | Outcome      | Effect                                               |
//! |--------------|------------------------------------------------------|
//! | `Success`    | Position advances; detail recorded for diagnostics   |
//! | `Impossible` | Recorded, next sibling edge tried                    |
//! | `Failure`    | Recorded, candidate reset, next sibling edge tried   |
//! | `Err(_)`     | Whole walk unwinds: visited states reset in reverse, |
//! |              | pre-walk position restored, error returned verbatim  |
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use c2s::{Connection, ConnectionConfig, MemoryServer, MemoryTransport};
//!
//! let server = MemoryServer::new().with_credentials("alice", "secret");
//! let mut connection = Connection::builder(ConnectionConfig::new("example.org"))
//!     .transport(Box::new(MemoryTransport::new(server)))
//!     .build()?;
//!
//! connection.login("alice", "secret")?;
//! assert!(connection.is_authenticated());
//! println!("bound as {:?}", connection.bound_resource());
//!
//! connection.disconnect()?;
//! ```
//!
//! ## Observability
//!
//! Every attempted transition emits a timestamped event
//! ([`ConnectionStateEvent`]) through a per-connection ordered async
//! dispatcher; the graph exports to Graphviz via
//! [`StateGraph::to_dot`](fsm::graph::StateGraph::to_dot) for debugging
//! stuck negotiations.
//!
//! ## Modules
//!
//! - [`fsm`]: descriptors, graph construction, walk engine
//! - [`connection`]: the façade and the concrete negotiation states
//! - [`transport`]: wire contract, filter chain, in-memory loopback
//! - [`sasl`]: mechanism contract, PLAIN
//! - [`compression`]: compression factories, zlib
//! - [`features`]: stream feature advertisements and the feature latch
//! - [`events`]: state machine events and listeners
//! - [`config`]: connection configuration
//! - [`error`]: error taxonomy
//!
//! ## Scope
//!
//! Stanza parsing and routing, roster and presence, mechanism
//! cryptography and socket transports are external collaborators behind
//! the [`transport::Transport`], [`sasl::SaslMechanism`] and
//! [`compression::CompressionFactory`] seams. This crate is the path to
//! the authenticated state, and safely back.

pub mod compression;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod features;
pub mod fsm;
pub mod sasl;
pub mod transport;

// Re-exports for convenience
pub use compression::{CompressionFactory, ZlibCompressionFactory, ZlibFilter};
pub use config::{ConnectionConfig, SecurityMode};
pub use connection::{client_state_graph, Connection, ConnectionBuilder};
pub use error::{C2sError, GraphError, Result, SaslError};
pub use events::{ConnectionStateEvent, ConnectionStateListener, ListenerId, StampedEvent};
pub use features::{StreamFeatures, StartTlsFeature};
pub use fsm::{Credentials, StateGraph, StateId};
pub use sasl::{PlainMechanismFactory, SaslMechanism, SaslMechanismFactory};
pub use transport::{
    Endpoint, FilterStats, IoFilter, MemoryServer, MemoryTransport, Request, Response, Transport,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
