//! The connection façade.
//!
//! [`Connection`] owns the current graph position and exposes the
//! high-level operations in terms of walks: [`Connection::connect`] walks
//! to the connected-but-unauthenticated state, [`Connection::login`] to
//! authenticated-and-resource-bound, the disconnect variants back to
//! disconnected through a mandatory shutdown state.
//!
//! Operations take `&mut self`, which serializes walks per connection;
//! concurrent walks on one connection are not a thing. Every operation is
//! all-or-nothing: on failure the position and all visited states are
//! exactly as before the call.

pub mod internal;
mod states;

use std::sync::{Arc, OnceLock};

use tracing::debug;
use uuid::Uuid;

use crate::compression::{CompressionFactory, ZlibCompressionFactory};
use crate::config::ConnectionConfig;
use crate::error::{C2sError, GraphError, Result};
use crate::events::{ConnectionStateListener, EventDispatcher, ListenerId};
use crate::features::{FeatureLatch, FeatureSink};
use crate::fsm::descriptor::StateId;
use crate::fsm::graph::{StateGraph, VertexId};
use crate::fsm::state::StateTable;
use crate::fsm::walk::{walk_state_graph, Credentials, WalkContext};
use crate::sasl::{PlainMechanismFactory, SaslMechanismFactory};
use crate::transport::{FilterStats, Transport};

use internal::ConnectionInternal;

/// The state graph of the client-to-server connection class. Built once;
/// every connection materializes its own runtime states over it.
pub fn client_state_graph() -> Result<&'static StateGraph> {
    static GRAPH: OnceLock<std::result::Result<StateGraph, GraphError>> = OnceLock::new();
    let graph = GRAPH.get_or_init(|| {
        StateGraph::build(
            states::client_registry(),
            StateId::Disconnected,
            states::BACKWARD_EDGE_STATES,
            true,
        )
    });
    graph.as_ref().map_err(|err| C2sError::Graph(err.clone()))
}

/// Builder for [`Connection`].
pub struct ConnectionBuilder {
    config: ConnectionConfig,
    transport: Option<Box<dyn Transport>>,
    sasl_factories: Vec<Box<dyn SaslMechanismFactory>>,
    compression_factories: Vec<Box<dyn CompressionFactory>>,
}

impl ConnectionBuilder {
    /// Set the wire backend. Required.
    pub fn transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Register a SASL mechanism factory. Earlier registrations win the
    /// mechanism selection. PLAIN is registered by default when nothing
    /// else is.
    pub fn add_sasl_mechanism(mut self, factory: Box<dyn SaslMechanismFactory>) -> Self {
        self.sasl_factories.push(factory);
        self
    }

    /// Register a compression method factory. `zlib` is registered by
    /// default when nothing else is.
    pub fn add_compression_factory(mut self, factory: Box<dyn CompressionFactory>) -> Self {
        self.compression_factories.push(factory);
        self
    }

    /// Build the connection: materializes the runtime states over the
    /// shared graph and starts the event worker.
    pub fn build(self) -> Result<Connection> {
        let graph = client_state_graph()?;
        let mut transport = self
            .transport
            .ok_or_else(|| C2sError::Config("a transport is required".to_string()))?;

        let id = Uuid::new_v4();
        let latch = Arc::new(FeatureLatch::new());
        transport.bind_feature_sink(FeatureSink::new(Arc::clone(&latch)));

        let states = StateTable::new(
            graph
                .vertex_ids()
                .map(|vertex| states::construct_state(graph.descriptor(vertex), vertex))
                .collect(),
        );

        let mut sasl_factories = self.sasl_factories;
        if sasl_factories.is_empty() {
            sasl_factories.push(Box::new(PlainMechanismFactory));
        }
        let mut compression_factories = self.compression_factories;
        if compression_factories.is_empty() {
            compression_factories.push(Box::new(ZlibCompressionFactory));
        }

        let events = EventDispatcher::new(id, self.config.event_queue_capacity)?;
        let internal = ConnectionInternal::new(
            id,
            self.config,
            transport,
            latch,
            states,
            events,
            sasl_factories,
            compression_factories,
        );

        debug!(connection = %id, states = graph.vertex_count(), "connection created");
        Ok(Connection {
            graph,
            current: graph.initial(),
            internal,
        })
    }
}

/// A client-to-server connection driven by the negotiation state graph.
pub struct Connection {
    graph: &'static StateGraph,
    current: VertexId,
    internal: ConnectionInternal,
}

impl Connection {
    /// Start building a connection for the given configuration.
    pub fn builder(config: ConnectionConfig) -> ConnectionBuilder {
        ConnectionBuilder {
            config,
            transport: None,
            sasl_factories: Vec::new(),
            compression_factories: Vec::new(),
        }
    }

    /// Connection id used in events and logs.
    pub fn id(&self) -> Uuid {
        self.internal.id()
    }

    /// The state the connection currently rests in.
    pub fn current_state(&self) -> StateId {
        self.graph.descriptor(self.current).id()
    }

    /// Walk to the connected-but-unauthenticated state.
    pub fn connect(&mut self) -> Result<()> {
        let mut ctx = WalkContext::to(StateId::ConnectedButUnauthenticated).build();
        self.walk(&mut ctx)
    }

    /// Walk to the authenticated-and-resource-bound state.
    ///
    /// All-or-nothing: on error the connection is exactly as before the
    /// call, with every state visited by the failed attempt reset.
    pub fn login(&mut self, username: &str, password: &str) -> Result<()> {
        let mut builder = WalkContext::to(StateId::AuthenticatedAndResourceBound)
            .credentials(Credentials::new(username, password));
        if self.internal.config.compression_required {
            // Compression has to happen before resource binding is legal.
            builder = builder.mandatory_intermediate(StateId::Compression);
        }
        let mut ctx = builder.build();
        self.walk(&mut ctx)
    }

    /// Walk back to disconnected through a graceful stream close.
    pub fn disconnect(&mut self) -> Result<()> {
        self.shutdown(StateId::Shutdown)
    }

    /// Walk back to disconnected, dropping the stream without the closing
    /// handshake.
    pub fn instant_disconnect(&mut self) -> Result<()> {
        self.shutdown(StateId::InstantShutdown)
    }

    fn shutdown(&mut self, shutdown_state: StateId) -> Result<()> {
        let mut ctx = WalkContext::to(StateId::Disconnected)
            .mandatory_intermediate(shutdown_state)
            .build();
        self.walk(&mut ctx)
    }

    fn walk(&mut self, ctx: &mut WalkContext) -> Result<()> {
        let graph = self.graph;
        walk_state_graph(graph, &mut self.current, &mut self.internal, ctx)
    }

    /// Whether the connection is network-connected.
    pub fn is_connected(&self) -> bool {
        self.internal.connected
    }

    /// Whether login completed.
    pub fn is_authenticated(&self) -> bool {
        self.internal.authenticated
    }

    /// Whether TLS was established on the current stream.
    pub fn is_secure(&self) -> bool {
        self.internal.tls_established
    }

    /// Whether stream compression is active.
    pub fn is_using_compression(&self) -> bool {
        self.internal.compression_enabled
    }

    /// The resourcepart the server assigned, once bound.
    pub fn bound_resource(&self) -> Option<String> {
        self.internal.bound_resource.clone()
    }

    /// Name of the SASL mechanism the current session authenticated with.
    pub fn sasl_mechanism_used(&self) -> Option<String> {
        self.internal.sasl_mechanism_used.clone()
    }

    /// Statistics of the filter chain. After a disconnect this reports the
    /// chain that was active before teardown.
    pub fn filter_stats(&self) -> Vec<FilterStats> {
        self.internal.filters.stats()
    }

    /// Register a state machine event listener.
    pub fn add_listener(&self, listener: Box<dyn ConnectionStateListener>) -> ListenerId {
        self.internal.events().add_listener(listener)
    }

    /// Remove a previously registered listener.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.internal.events().remove_listener(id)
    }

    /// Block until every event emitted so far was delivered to listeners.
    pub fn flush_events(&self) {
        self.internal.events().flush();
    }

    /// The shared state graph, e.g. for exporting to `dot`.
    pub fn graph(&self) -> &'static StateGraph {
        self.graph
    }
}
