//! Shared connection-internal state.
//!
//! Everything the negotiation states operate on lives here and is passed
//! to them explicitly: configuration, the transport handle, the filter
//! chain, the feature latch, negotiated flags, and the vertex-indexed
//! table of runtime states. The walk engine and the states mutate this
//! struct only from within a walk; readers of the flags tolerate
//! point-in-time staleness.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::compression::CompressionFactory;
use crate::config::ConnectionConfig;
use crate::error::Result;
use crate::events::{ConnectionStateEvent, EventDispatcher, StampedEvent};
use crate::features::{FeatureLatch, StreamFeatures};
use crate::fsm::descriptor::StateId;
use crate::fsm::graph::VertexId;
use crate::fsm::state::{State, StateTable};
use crate::sasl::SaslMechanismFactory;
use crate::transport::{Endpoint, FilterChain, Transport};

/// Connection-internal state shared across the negotiation states.
pub struct ConnectionInternal {
    /// Connection configuration.
    pub config: ConnectionConfig,
    /// The wire backend.
    pub transport: Box<dyn Transport>,
    /// Active input/output filter chain.
    pub filters: FilterChain,

    /// Network connection is up.
    pub connected: bool,
    /// Login completed.
    pub authenticated: bool,
    /// TLS was established on this stream.
    pub tls_established: bool,
    /// Stream compression is active.
    pub compression_enabled: bool,
    /// The previous stream was resumed rather than freshly negotiated.
    pub stream_resumed: bool,
    /// Resourcepart assigned by the server.
    pub bound_resource: Option<String>,
    /// Name of the SASL mechanism used for the current session.
    pub sasl_mechanism_used: Option<String>,
    /// Endpoints resolved for the current connection attempt.
    pub resolved_endpoints: Vec<Endpoint>,

    /// The path walked from disconnect to the authenticated state, kept
    /// for reset-on-disconnect and diagnostics.
    pub(crate) walk_from_disconnect: Option<Vec<(VertexId, StateId)>>,

    pub(crate) sasl_factories: Vec<Box<dyn SaslMechanismFactory>>,
    pub(crate) compression_factories: Vec<Box<dyn CompressionFactory>>,

    latch: Arc<FeatureLatch>,
    states: StateTable,
    events: EventDispatcher,
    id: Uuid,
}

impl ConnectionInternal {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: Uuid,
        config: ConnectionConfig,
        transport: Box<dyn Transport>,
        latch: Arc<FeatureLatch>,
        states: StateTable,
        events: EventDispatcher,
        sasl_factories: Vec<Box<dyn SaslMechanismFactory>>,
        compression_factories: Vec<Box<dyn CompressionFactory>>,
    ) -> Self {
        Self {
            config,
            transport,
            filters: FilterChain::new(),
            connected: false,
            authenticated: false,
            tls_established: false,
            compression_enabled: false,
            stream_resumed: false,
            bound_resource: None,
            sasl_mechanism_used: None,
            resolved_endpoints: Vec::new(),
            walk_from_disconnect: None,
            sasl_factories,
            compression_factories,
            latch,
            states,
            events,
            id,
        }
    }

    /// Connection id used in events and spans.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Emit a diagnostic event through the ordered dispatcher.
    pub(crate) fn emit(&self, event: ConnectionStateEvent) {
        self.events.emit(StampedEvent {
            connection: self.id,
            timestamp: Utc::now(),
            event,
        });
    }

    pub(crate) fn events(&self) -> &EventDispatcher {
        &self.events
    }

    pub(crate) fn take_state(&mut self, vertex: VertexId) -> Option<Box<dyn State>> {
        self.states.take(vertex)
    }

    pub(crate) fn put_back_state(&mut self, vertex: VertexId, state: Box<dyn State>) {
        self.states.put_back(vertex, state);
    }

    /// Reset the state bound to a vertex. A missing slot means the state
    /// is currently active and resets itself on its own error path.
    pub(crate) fn reset_state(&mut self, vertex: VertexId) {
        if let Some(mut state) = self.states.take(vertex) {
            state.reset(self);
            self.states.put_back(vertex, state);
        }
    }

    pub(crate) fn take_walk_from_disconnect(&mut self) -> Option<Vec<(VertexId, StateId)>> {
        self.walk_from_disconnect.take()
    }

    /// Arm the feature latch for the next advertisement round.
    pub fn prepare_feature_wait(&self) {
        self.latch.prepare();
    }

    /// Block until the next feature advertisement, the reply timeout, or
    /// stream termination.
    pub fn wait_for_features(&self, waiting_for: &str) -> Result<StreamFeatures> {
        self.latch.wait(self.config.reply_timeout(), waiting_for)
    }

    /// Arm the latch, send a fresh stream open, and wait for the feature
    /// round it triggers.
    pub fn new_stream_open_and_wait(&mut self, waiting_for: &str) -> Result<StreamFeatures> {
        self.latch.prepare();
        let domain = self.config.domain.clone();
        self.transport.send_stream_open(&domain)?;
        self.latch.wait(self.config.reply_timeout(), waiting_for)
    }

    /// Most recently advertised feature set. Empty before the first round.
    pub fn latest_features(&self) -> StreamFeatures {
        self.latch.latest().unwrap_or_default()
    }
}
