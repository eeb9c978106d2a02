//! The client-to-server negotiation states and their descriptors.
//!
//! Descriptor declarations define the graph shape; the state structs
//! implement the behavior. States that exist in the graph but carry no
//! behavior yet (the not-implemented XEPs, the unbound-authenticated
//! anchor) are backed by [`NoOpState`].
//!
//! Graph shape, edges ordered by declared precedence:
//!
//! ```text
//! Disconnected
//!  └─ ResolvingEndpoints ─┬─ DirectTlsConnection (not impl.) ──┐
//!                         └─ ConnectingToHost ─┬─ EstablishingTls ─┐
//!                                              └───────────────────┴─ ConnectedButUnauthenticated
//!     ┌────────────────────────────────────────────────────────────────────┘
//!     ├─ InstantStreamResumption (not impl.) ── AuthenticatedAndResourceBound
//!     ├─ Bind2 (not impl.) ─────────────────────┘
//!     └─ SaslAuthentication ── AuthenticatedButUnbound
//!         ┌───────────────────────┤ (multi-visit)
//!         │   ┌─ Compression ─────┘ (loops back)
//!         │   ├─ StreamResumption (not impl.)
//!         │   └─ ResourceBinding ─┬─ EnableStreamManagement (not impl.) ─┐
//!         │                       └──────────────────────────────────────┴─ AuthenticatedAndResourceBound
//!         └─ Shutdown / InstantShutdown ── CloseConnection ── Disconnected
//! ```

use std::sync::OnceLock;

use tracing::{info, warn};

use crate::compression::best_factory;
use crate::connection::internal::ConnectionInternal;
use crate::error::{C2sError, Result, SaslError};
use crate::config::SecurityMode;
use crate::fsm::descriptor::{DescriptorRegistry, StateDescriptor, StateId};
use crate::fsm::graph::VertexId;
use crate::fsm::state::{
    NoOpState, State, TransitionFailure, TransitionImpossible, TransitionOutcome,
    TransitionSuccess,
};
use crate::fsm::walk::WalkContext;
use crate::sasl::select_mechanism;
use crate::transport::{IoFilter, Request, Response};

/// States reachable only through their predecessor declarations.
pub(crate) const BACKWARD_EDGE_STATES: &[StateId] = &[
    StateId::ResolvingEndpoints,
    StateId::InstantStreamResumption,
    StateId::Bind2,
    StateId::StreamResumption,
    StateId::EnableStreamManagement,
    StateId::InstantShutdown,
    StateId::Shutdown,
];

/// Descriptor set of the client-to-server connection class.
pub(crate) fn client_registry() -> &'static DescriptorRegistry {
    static REGISTRY: OnceLock<DescriptorRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut registry = DescriptorRegistry::new();

        registry.register(
            StateDescriptor::builder(StateId::Disconnected)
                .final_state()
                .build(),
        );
        registry.register(
            StateDescriptor::builder(StateId::ResolvingEndpoints)
                .predecessor(StateId::Disconnected)
                .successor(StateId::ConnectingToHost)
                .successor(StateId::DirectTlsConnection)
                .build(),
        );
        registry.register(
            StateDescriptor::builder(StateId::DirectTlsConnection)
                .xep(368)
                .not_implemented()
                .successor(StateId::ConnectedButUnauthenticated)
                .precedence_over(StateId::ConnectingToHost)
                .build(),
        );
        registry.register(
            StateDescriptor::builder(StateId::ConnectingToHost)
                .successor(StateId::EstablishingTls)
                .successor(StateId::ConnectedButUnauthenticated)
                .build(),
        );
        registry.register(
            StateDescriptor::builder(StateId::EstablishingTls)
                .rfc("RFC 6120 § 5")
                .successor(StateId::ConnectedButUnauthenticated)
                .precedence_over(StateId::ConnectedButUnauthenticated)
                .build(),
        );
        registry.register(
            StateDescriptor::builder(StateId::ConnectedButUnauthenticated)
                .final_state()
                .successor(StateId::SaslAuthentication)
                .build(),
        );
        registry.register(
            StateDescriptor::builder(StateId::InstantStreamResumption)
                .xep(397)
                .not_implemented()
                .predecessor(StateId::ConnectedButUnauthenticated)
                .successor(StateId::AuthenticatedAndResourceBound)
                .precedence_over(StateId::SaslAuthentication)
                .build(),
        );
        registry.register(
            StateDescriptor::builder(StateId::Bind2)
                .xep(386)
                .not_implemented()
                .predecessor(StateId::ConnectedButUnauthenticated)
                .successor(StateId::AuthenticatedAndResourceBound)
                .precedence_over(StateId::SaslAuthentication)
                .build(),
        );
        registry.register(
            StateDescriptor::builder(StateId::SaslAuthentication)
                .rfc("RFC 6120 § 6")
                .successor(StateId::AuthenticatedButUnbound)
                .build(),
        );
        registry.register(
            StateDescriptor::builder(StateId::AuthenticatedButUnbound)
                .multi_visit()
                .successor(StateId::ResourceBinding)
                .successor(StateId::Compression)
                .build(),
        );
        registry.register(
            StateDescriptor::builder(StateId::StreamResumption)
                .xep(198)
                .not_implemented()
                .predecessor(StateId::AuthenticatedButUnbound)
                .successor(StateId::AuthenticatedAndResourceBound)
                .precedence_over(StateId::ResourceBinding)
                .inferior_to(StateId::Compression)
                .build(),
        );
        registry.register(
            StateDescriptor::builder(StateId::Compression)
                .xep(138)
                .successor(StateId::AuthenticatedButUnbound)
                .precedence_over(StateId::ResourceBinding)
                .build(),
        );
        registry.register(
            StateDescriptor::builder(StateId::ResourceBinding)
                .rfc("RFC 6120 § 7")
                .successor(StateId::AuthenticatedAndResourceBound)
                .build(),
        );
        registry.register(
            StateDescriptor::builder(StateId::EnableStreamManagement)
                .xep(198)
                .not_implemented()
                .predecessor(StateId::ResourceBinding)
                .successor(StateId::AuthenticatedAndResourceBound)
                .precedence_over(StateId::AuthenticatedAndResourceBound)
                .build(),
        );
        registry.register(
            StateDescriptor::builder(StateId::AuthenticatedAndResourceBound)
                .final_state()
                .build(),
        );
        registry.register(
            StateDescriptor::builder(StateId::InstantShutdown)
                .predecessor(StateId::ConnectedButUnauthenticated)
                .predecessor(StateId::AuthenticatedAndResourceBound)
                .successor(StateId::CloseConnection)
                .build(),
        );
        registry.register(
            StateDescriptor::builder(StateId::Shutdown)
                .predecessor(StateId::ConnectedButUnauthenticated)
                .predecessor(StateId::AuthenticatedAndResourceBound)
                .successor(StateId::CloseConnection)
                .build(),
        );
        registry.register(
            StateDescriptor::builder(StateId::CloseConnection)
                .successor(StateId::Disconnected)
                .build(),
        );

        registry
    })
}

/// Construct the runtime state for a descriptor. The explicit per-id
/// factory is the only place behavior is bound to identity.
pub(crate) fn construct_state(
    descriptor: &'static StateDescriptor,
    vertex: VertexId,
) -> Box<dyn State> {
    match descriptor.id() {
        StateId::Disconnected => Box::new(DisconnectedState { descriptor }),
        StateId::ResolvingEndpoints => Box::new(ResolvingEndpointsState { descriptor }),
        StateId::ConnectingToHost => Box::new(ConnectingToHostState { descriptor }),
        StateId::EstablishingTls => Box::new(EstablishingTlsState { descriptor }),
        StateId::ConnectedButUnauthenticated => {
            Box::new(ConnectedButUnauthenticatedState { descriptor, vertex })
        }
        StateId::SaslAuthentication => Box::new(SaslAuthenticationState { descriptor }),
        StateId::Compression => Box::new(CompressionState {
            descriptor,
            selected_method: None,
            fabricated: None,
            installed: None,
        }),
        StateId::ResourceBinding => Box::new(ResourceBindingState { descriptor }),
        StateId::AuthenticatedAndResourceBound => {
            Box::new(AuthenticatedAndResourceBoundState { descriptor, vertex })
        }
        StateId::Shutdown => Box::new(ShutdownState { descriptor }),
        StateId::InstantShutdown => Box::new(InstantShutdownState { descriptor }),
        StateId::CloseConnection => Box::new(CloseConnectionState { descriptor }),
        // Anchor and not-implemented descriptors carry no behavior.
        StateId::AuthenticatedButUnbound
        | StateId::DirectTlsConnection
        | StateId::InstantStreamResumption
        | StateId::Bind2
        | StateId::StreamResumption
        | StateId::EnableStreamManagement => Box::new(NoOpState::new(descriptor)),
    }
}

fn shutdown_guard(descriptor: &StateDescriptor, ctx: &WalkContext) -> Result<()> {
    if ctx.targets_login() {
        return Err(C2sError::StateMachineViolation(format!(
            "{} must never be on the way to the authenticated and resource bound state",
            descriptor.id()
        )));
    }
    Ok(())
}

/// Initial and final: tears everything down.
struct DisconnectedState {
    descriptor: &'static StateDescriptor,
}

impl State for DisconnectedState {
    fn descriptor(&self) -> &'static StateDescriptor {
        self.descriptor
    }

    fn transition_into(
        &mut self,
        _ctx: &WalkContext,
        conn: &mut ConnectionInternal,
    ) -> Result<TransitionOutcome> {
        // Keep the detached chain around for stats queries.
        conn.filters.detach();

        if let Some(walk) = conn.take_walk_from_disconnect() {
            for &(vertex, _) in walk.iter().rev() {
                conn.reset_state(vertex);
            }
        }

        Ok(TransitionOutcome::Success(TransitionSuccess::empty()))
    }
}

/// Resolves candidate endpoints for the configured service.
struct ResolvingEndpointsState {
    descriptor: &'static StateDescriptor,
}

impl State for ResolvingEndpointsState {
    fn descriptor(&self) -> &'static StateDescriptor {
        self.descriptor
    }

    fn transition_into(
        &mut self,
        _ctx: &WalkContext,
        conn: &mut ConnectionInternal,
    ) -> Result<TransitionOutcome> {
        let endpoints = conn.transport.lookup_endpoints(&conn.config)?;
        if endpoints.is_empty() {
            return Ok(TransitionOutcome::Failure(TransitionFailure::new(
                "endpoint lookup yielded no results",
            )));
        }

        let listed: Vec<String> = endpoints.iter().map(ToString::to_string).collect();
        conn.resolved_endpoints = endpoints;
        Ok(TransitionOutcome::Success(TransitionSuccess::with_detail(
            format!("resolved endpoints: {}", listed.join(", ")),
        )))
    }

    fn reset(&mut self, conn: &mut ConnectionInternal) {
        conn.resolved_endpoints.clear();
    }
}

/// Opens the TCP connection, trying resolved endpoints in order.
struct ConnectingToHostState {
    descriptor: &'static StateDescriptor,
}

impl State for ConnectingToHostState {
    fn descriptor(&self) -> &'static StateDescriptor {
        self.descriptor
    }

    fn transition_into(
        &mut self,
        _ctx: &WalkContext,
        conn: &mut ConnectionInternal,
    ) -> Result<TransitionOutcome> {
        if conn.resolved_endpoints.is_empty() {
            return Ok(TransitionOutcome::Failure(TransitionFailure::new(
                "no endpoints to connect to",
            )));
        }

        let endpoints = conn.resolved_endpoints.clone();
        let mut attempts = Vec::new();
        for endpoint in &endpoints {
            match conn.transport.connect(endpoint) {
                Ok(()) => {
                    conn.new_stream_open_and_wait("stream features after connect")?;
                    return Ok(TransitionOutcome::Success(TransitionSuccess::with_detail(
                        format!("connection established to {endpoint}"),
                    )));
                }
                Err(err) => attempts.push(format!("{endpoint}: {err}")),
            }
        }

        Ok(TransitionOutcome::Failure(TransitionFailure::new(format!(
            "could not connect to any endpoint: {}",
            attempts.join("; ")
        ))))
    }
}

/// STARTTLS upgrade.
struct EstablishingTlsState {
    descriptor: &'static StateDescriptor,
}

impl State for EstablishingTlsState {
    fn descriptor(&self) -> &'static StateDescriptor {
        self.descriptor
    }

    fn is_transition_possible(
        &mut self,
        _ctx: &WalkContext,
        conn: &mut ConnectionInternal,
    ) -> Result<Option<TransitionImpossible>> {
        if conn.config.security == SecurityMode::Disabled {
            return Ok(Some(TransitionImpossible::new(
                "TLS disabled in configuration",
            )));
        }
        if conn.latest_features().starttls.is_none() {
            return Ok(Some(TransitionImpossible::new(
                "STARTTLS not advertised by server",
            )));
        }
        Ok(None)
    }

    fn transition_into(
        &mut self,
        _ctx: &WalkContext,
        conn: &mut ConnectionInternal,
    ) -> Result<TransitionOutcome> {
        let timeout = conn.config.reply_timeout();
        match conn.transport.send_request(Request::StartTls, timeout)? {
            Response::TlsProceed => {}
            Response::StreamError { condition } => return Err(C2sError::Stream(condition)),
            other => {
                return Err(C2sError::Stream(format!(
                    "unexpected response to STARTTLS: {other:?}"
                )))
            }
        }

        conn.transport.upgrade_tls()?;
        conn.new_stream_open_and_wait("stream features after TLS establishment")?;
        conn.tls_established = true;

        Ok(TransitionOutcome::Success(TransitionSuccess::with_detail(
            "TLS established",
        )))
    }

    fn reset(&mut self, conn: &mut ConnectionInternal) {
        conn.tls_established = false;
    }
}

/// Network-connected anchor, also a valid walk target.
struct ConnectedButUnauthenticatedState {
    descriptor: &'static StateDescriptor,
    vertex: VertexId,
}

impl State for ConnectedButUnauthenticatedState {
    fn descriptor(&self) -> &'static StateDescriptor {
        self.descriptor
    }

    fn is_transition_possible(
        &mut self,
        _ctx: &WalkContext,
        conn: &mut ConnectionInternal,
    ) -> Result<Option<TransitionImpossible>> {
        // Entering this state means carrying on without TLS.
        if conn.config.security == SecurityMode::Required && !conn.tls_established {
            return Ok(Some(TransitionImpossible::new(
                "STARTTLS required but not established",
            )));
        }
        Ok(None)
    }

    fn transition_into(
        &mut self,
        ctx: &WalkContext,
        conn: &mut ConnectionInternal,
    ) -> Result<TransitionOutcome> {
        if ctx.final_state() == self.descriptor.id() {
            // This walk ends here; record the path for the teardown pass.
            debug_assert!(conn.walk_from_disconnect.is_none());
            let mut path = ctx.walked_vertices().to_vec();
            path.push((self.vertex, self.descriptor.id()));
            conn.walk_from_disconnect = Some(path);
        }

        conn.connected = true;
        Ok(TransitionOutcome::Success(TransitionSuccess::empty()))
    }

    fn reset(&mut self, conn: &mut ConnectionInternal) {
        conn.connected = false;
    }
}

/// Delegates to the selected SASL mechanism and waits out the post-auth
/// feature round.
struct SaslAuthenticationState {
    descriptor: &'static StateDescriptor,
}

impl State for SaslAuthenticationState {
    fn descriptor(&self) -> &'static StateDescriptor {
        self.descriptor
    }

    fn transition_into(
        &mut self,
        ctx: &WalkContext,
        conn: &mut ConnectionInternal,
    ) -> Result<TransitionOutcome> {
        let credentials = ctx
            .credentials()
            .ok_or_else(|| {
                C2sError::StateMachineViolation(
                    "authentication walk carries no credentials".to_string(),
                )
            })?
            .clone();

        let offered = conn.latest_features().sasl_mechanisms;
        let factory = select_mechanism(&conn.sasl_factories, &offered).ok_or(
            C2sError::Sasl(SaslError::NoCommonMechanism {
                offered: offered.clone(),
            }),
        )?;
        let mechanism_name = factory.name();
        let mut mechanism = factory.create();

        let authzid = conn.config.authzid.clone();
        let timeout = conn.config.reply_timeout();
        mechanism.authenticate(
            conn.transport.as_mut(),
            &credentials,
            authzid.as_deref(),
            timeout,
        )?;

        // The mechanism only returns on success; the server now advertises
        // the post-authentication features on a fresh stream.
        conn.new_stream_open_and_wait("server stream features after SASL authentication")?;
        conn.sasl_mechanism_used = Some(mechanism_name.to_string());

        Ok(TransitionOutcome::Success(
            TransitionSuccess::sasl_authenticated(mechanism_name),
        ))
    }

    fn reset(&mut self, conn: &mut ConnectionInternal) {
        conn.sasl_mechanism_used = None;
    }
}

/// Stream compression (XEP-0138).
struct CompressionState {
    descriptor: &'static StateDescriptor,
    selected_method: Option<String>,
    fabricated: Option<Box<dyn IoFilter>>,
    installed: Option<String>,
}

impl State for CompressionState {
    fn descriptor(&self) -> &'static StateDescriptor {
        self.descriptor
    }

    fn is_transition_possible(
        &mut self,
        _ctx: &WalkContext,
        conn: &mut ConnectionInternal,
    ) -> Result<Option<TransitionImpossible>> {
        if !conn.config.compression_enabled {
            return Ok(Some(TransitionImpossible::new(
                "Stream compression disabled",
            )));
        }

        let features = conn.latest_features();
        if !features.supports_compression() {
            return Ok(Some(TransitionImpossible::new(
                "Stream compression not supported",
            )));
        }

        let Some(factory) =
            best_factory(&conn.compression_factories, &features.compression_methods)
        else {
            return Ok(Some(TransitionImpossible::new(
                "No matching compression factory",
            )));
        };

        self.selected_method = Some(factory.method().to_string());
        self.fabricated = Some(factory.fabricate());
        Ok(None)
    }

    fn transition_into(
        &mut self,
        _ctx: &WalkContext,
        conn: &mut ConnectionInternal,
    ) -> Result<TransitionOutcome> {
        let method = self.selected_method.clone().ok_or_else(|| {
            C2sError::StateMachineViolation(
                "compression attempted without a selected method".to_string(),
            )
        })?;

        let timeout = conn.config.reply_timeout();
        let request = Request::Compress {
            method: method.clone(),
        };
        match conn.transport.send_request(request, timeout)? {
            Response::Compressed => {}
            Response::CompressFailed { condition } => {
                return Ok(TransitionOutcome::Failure(TransitionFailure::new(format!(
                    "compression negotiation failed: {condition}"
                ))))
            }
            Response::StreamError { condition } => return Err(C2sError::Stream(condition)),
            other => {
                return Err(C2sError::Stream(format!(
                    "unexpected response to compress request: {other:?}"
                )))
            }
        }

        let filter = self.fabricated.take().ok_or_else(|| {
            C2sError::StateMachineViolation(
                "compression attempted without a fabricated filter".to_string(),
            )
        })?;
        conn.filters.add_front(filter);
        self.installed = Some(method.clone());

        conn.new_stream_open_and_wait("server stream features after compression enabled")?;
        conn.compression_enabled = true;

        Ok(TransitionOutcome::Success(
            TransitionSuccess::compression_enabled(&method),
        ))
    }

    fn reset(&mut self, conn: &mut ConnectionInternal) {
        if let Some(method) = self.installed.take() {
            conn.filters.remove(&method);
        }
        self.selected_method = None;
        self.fabricated = None;
        conn.compression_enabled = false;
    }
}

/// Resource binding and legacy session establishment.
struct ResourceBindingState {
    descriptor: &'static StateDescriptor,
}

impl State for ResourceBindingState {
    fn descriptor(&self) -> &'static StateDescriptor {
        self.descriptor
    }

    fn transition_into(
        &mut self,
        _ctx: &WalkContext,
        conn: &mut ConnectionInternal,
    ) -> Result<TransitionOutcome> {
        let timeout = conn.config.reply_timeout();
        let requested = conn.config.resource.clone();
        let request = Request::BindResource {
            resource: requested.clone(),
        };

        let resource = match conn.transport.send_request(request, timeout)? {
            Response::Bound { resource } => resource,
            Response::StreamError { condition } => return Err(C2sError::Stream(condition)),
            other => {
                return Err(C2sError::Stream(format!(
                    "unexpected response to bind request: {other:?}"
                )))
            }
        };

        if conn.latest_features().session {
            match conn.transport.send_request(Request::EstablishSession, timeout)? {
                Response::SessionEstablished => {}
                Response::StreamError { condition } => return Err(C2sError::Stream(condition)),
                other => {
                    return Err(C2sError::Stream(format!(
                        "unexpected response to session request: {other:?}"
                    )))
                }
            }
        }

        conn.bound_resource = Some(resource.clone());
        conn.stream_resumed = false;

        Ok(TransitionOutcome::Success(TransitionSuccess::resource_bound(
            &resource,
            requested.as_deref(),
        )))
    }

    fn reset(&mut self, conn: &mut ConnectionInternal) {
        conn.bound_resource = None;
    }
}

/// Login complete: records the full walk and flips the authenticated flag.
struct AuthenticatedAndResourceBoundState {
    descriptor: &'static StateDescriptor,
    vertex: VertexId,
}

impl State for AuthenticatedAndResourceBoundState {
    fn descriptor(&self) -> &'static StateDescriptor {
        self.descriptor
    }

    fn transition_into(
        &mut self,
        ctx: &WalkContext,
        conn: &mut ConnectionInternal,
    ) -> Result<TransitionOutcome> {
        let mut path = ctx.walked_vertices().to_vec();
        path.push((self.vertex, self.descriptor.id()));

        match conn.walk_from_disconnect.as_mut() {
            Some(existing) => {
                // A previous walk already reached the connected anchor;
                // this walk continued from there, not from disconnect.
                debug_assert!(
                    path.first().map(|&(_, id)| id) != Some(StateId::Disconnected),
                    "login walk restarted from disconnect with a recorded walk present"
                );
                existing.extend(path);
            }
            None => conn.walk_from_disconnect = Some(path),
        }

        conn.authenticated = true;
        info!(
            connection = %conn.id(),
            resource = conn.bound_resource.as_deref().unwrap_or(""),
            resumed = conn.stream_resumed,
            "login complete"
        );

        Ok(TransitionOutcome::Success(TransitionSuccess::empty()))
    }

    fn reset(&mut self, conn: &mut ConnectionInternal) {
        conn.authenticated = false;
    }
}

/// Graceful stream close.
struct ShutdownState {
    descriptor: &'static StateDescriptor,
}

impl State for ShutdownState {
    fn descriptor(&self) -> &'static StateDescriptor {
        self.descriptor
    }

    fn is_transition_possible(
        &mut self,
        ctx: &WalkContext,
        _conn: &mut ConnectionInternal,
    ) -> Result<Option<TransitionImpossible>> {
        shutdown_guard(self.descriptor, ctx)?;
        Ok(None)
    }

    fn transition_into(
        &mut self,
        _ctx: &WalkContext,
        conn: &mut ConnectionInternal,
    ) -> Result<TransitionOutcome> {
        // A walk to disconnected must not fail; close problems are logged
        // and the teardown continues.
        match conn.transport.send_stream_close(conn.config.reply_timeout()) {
            Ok(true) => conn.filters.finish_all(),
            Ok(false) => warn!("server closing stream tag not received"),
            Err(err) => warn!(error = %err, "closing the stream failed"),
        }

        Ok(TransitionOutcome::Success(TransitionSuccess::empty()))
    }
}

/// Immediate teardown without the closing handshake.
struct InstantShutdownState {
    descriptor: &'static StateDescriptor,
}

impl State for InstantShutdownState {
    fn descriptor(&self) -> &'static StateDescriptor {
        self.descriptor
    }

    fn is_transition_possible(
        &mut self,
        ctx: &WalkContext,
        _conn: &mut ConnectionInternal,
    ) -> Result<Option<TransitionImpossible>> {
        shutdown_guard(self.descriptor, ctx)?;
        Ok(None)
    }

    fn transition_into(
        &mut self,
        _ctx: &WalkContext,
        _conn: &mut ConnectionInternal,
    ) -> Result<TransitionOutcome> {
        Ok(TransitionOutcome::Success(TransitionSuccess::empty()))
    }
}

/// Drops the underlying socket.
struct CloseConnectionState {
    descriptor: &'static StateDescriptor,
}

impl State for CloseConnectionState {
    fn descriptor(&self) -> &'static StateDescriptor {
        self.descriptor
    }

    fn transition_into(
        &mut self,
        _ctx: &WalkContext,
        conn: &mut ConnectionInternal,
    ) -> Result<TransitionOutcome> {
        conn.transport.disconnect();
        Ok(TransitionOutcome::Success(TransitionSuccess::empty()))
    }
}
