//! Static per-state metadata.
//!
//! A [`StateDescriptor`] describes one negotiation state without any
//! runtime behavior: its identity, the document defining it, its
//! properties, and how it relates to other states. The descriptor set of
//! a connection class is registered once in a [`DescriptorRegistry`] and
//! the graph is built from it.
//!
//! Successor declarations point forward. States that are only reachable
//! by looping back to an earlier point of the graph (shutdown states,
//! resumption states) instead declare *predecessors*; the graph builder
//! turns those into inferred forward edges. Precedence declarations
//! (`precedence_over` / `inferior_to`) only matter when a state has more
//! than one successor and decide the order in which the walk attempts
//! them.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a negotiation state.
///
/// The graph, the walk context and all diagnostics key on this identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateId {
    /// No transport, nothing negotiated. Initial and final.
    Disconnected,
    /// Resolving candidate endpoints for the configured service.
    ResolvingEndpoints,
    /// Opening a TCP connection to one of the resolved endpoints.
    ConnectingToHost,
    /// Direct TLS connection (XEP-0368).
    DirectTlsConnection,
    /// STARTTLS upgrade of an established connection (RFC 6120 § 5).
    EstablishingTls,
    /// Network-connected, stream open, nothing authenticated. Final.
    ConnectedButUnauthenticated,
    /// Instant stream resumption (XEP-0397).
    InstantStreamResumption,
    /// Bind 2.0 (XEP-0386).
    Bind2,
    /// SASL authentication (RFC 6120 § 6).
    SaslAuthentication,
    /// Authenticated, no resource bound yet. Multi-visit anchor.
    AuthenticatedButUnbound,
    /// Stream resumption (XEP-0198).
    StreamResumption,
    /// Stream compression (XEP-0138).
    Compression,
    /// Resource binding (RFC 6120 § 7).
    ResourceBinding,
    /// Stream management enablement (XEP-0198).
    EnableStreamManagement,
    /// Authenticated and resource bound: login complete. Final.
    AuthenticatedAndResourceBound,
    /// Graceful stream close.
    Shutdown,
    /// Immediate teardown without the closing handshake.
    InstantShutdown,
    /// Dropping the underlying socket.
    CloseConnection,
}

impl StateId {
    /// State name as used in logs and graph exports.
    pub fn name(self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::ResolvingEndpoints => "ResolvingEndpoints",
            Self::ConnectingToHost => "ConnectingToHost",
            Self::DirectTlsConnection => "DirectTlsConnection",
            Self::EstablishingTls => "EstablishingTls",
            Self::ConnectedButUnauthenticated => "ConnectedButUnauthenticated",
            Self::InstantStreamResumption => "InstantStreamResumption",
            Self::Bind2 => "Bind2",
            Self::SaslAuthentication => "SaslAuthentication",
            Self::AuthenticatedButUnbound => "AuthenticatedButUnbound",
            Self::StreamResumption => "StreamResumption",
            Self::Compression => "Compression",
            Self::ResourceBinding => "ResourceBinding",
            Self::EnableStreamManagement => "EnableStreamManagement",
            Self::AuthenticatedAndResourceBound => "AuthenticatedAndResourceBound",
            Self::Shutdown => "Shutdown",
            Self::InstantShutdown => "InstantShutdown",
            Self::CloseConnection => "CloseConnection",
        }
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reference to the document specifying a state.
///
/// A state is defined either by an RFC section or by a XEP, never both.
/// Display-only; never used as an ordering key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalReference {
    /// RFC section, e.g. `RFC 6120 § 6`.
    Rfc(&'static str),
    /// XEP number, e.g. `138` for XEP-0138.
    Xep(u16),
}

impl fmt::Display for ExternalReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rfc(section) => f.write_str(section),
            Self::Xep(number) => write!(f, "XEP-{number:04}"),
        }
    }
}

/// Static metadata of one negotiation state.
#[derive(Debug, Clone)]
pub struct StateDescriptor {
    id: StateId,
    reference: Option<ExternalReference>,
    multi_visit: bool,
    final_state: bool,
    not_implemented: bool,
    successors: Vec<StateId>,
    predecessors: Vec<StateId>,
    precedence_over: Vec<StateId>,
    inferior_to: Vec<StateId>,
}

impl StateDescriptor {
    /// Start building a descriptor for the given state.
    pub fn builder(id: StateId) -> StateDescriptorBuilder {
        StateDescriptorBuilder {
            descriptor: StateDescriptor {
                id,
                reference: None,
                multi_visit: false,
                final_state: false,
                not_implemented: false,
                successors: Vec::new(),
                predecessors: Vec::new(),
                precedence_over: Vec::new(),
                inferior_to: Vec::new(),
            },
        }
    }

    /// State identity.
    pub fn id(&self) -> StateId {
        self.id
    }

    /// Specifying document, if declared.
    pub fn reference(&self) -> Option<ExternalReference> {
        self.reference
    }

    /// May this state be entered more than once within a single walk?
    pub fn is_multi_visit(&self) -> bool {
        self.multi_visit
    }

    /// May this state be the target of a walk?
    pub fn is_final(&self) -> bool {
        self.final_state
    }

    /// Is this state declared but not behaviorally implemented? The walk
    /// skips such states with a recorded reason instead of entering them.
    pub fn is_not_implemented(&self) -> bool {
        self.not_implemented
    }

    /// Declared forward successors, in declaration order.
    pub fn successors(&self) -> &[StateId] {
        &self.successors
    }

    /// Declared predecessors, used to infer forward edges for states only
    /// reachable via back-references.
    pub fn predecessors(&self) -> &[StateId] {
        &self.predecessors
    }

    /// Sibling states this one takes precedence over.
    pub fn precedence_over(&self) -> &[StateId] {
        &self.precedence_over
    }

    /// Sibling states that take precedence over this one.
    pub fn inferior_to(&self) -> &[StateId] {
        &self.inferior_to
    }

    /// Full display name, optionally with the reference on a second line
    /// (used by the DOT export to keep node labels narrow).
    pub fn full_name(&self, break_name: bool) -> String {
        match self.reference {
            Some(reference) => {
                let separator = if break_name { "\\n" } else { " " };
                format!("{}{separator}({reference})", self.id)
            }
            None => self.id.to_string(),
        }
    }
}

impl fmt::Display for StateDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_name(false))
    }
}

/// Builder for [`StateDescriptor`].
///
/// Panics on contradictory declarations (a second external reference).
/// Descriptor declarations are static per connection class, so a mistake
/// here is a programming error caught by the first test that touches the
/// graph.
pub struct StateDescriptorBuilder {
    descriptor: StateDescriptor,
}

impl StateDescriptorBuilder {
    /// Declare the RFC section specifying this state.
    ///
    /// # Panics
    /// If an RFC or XEP reference was already declared.
    pub fn rfc(mut self, section: &'static str) -> Self {
        assert!(
            self.descriptor.reference.is_none(),
            "state {} already declares an external reference",
            self.descriptor.id
        );
        self.descriptor.reference = Some(ExternalReference::Rfc(section));
        self
    }

    /// Declare the XEP specifying this state.
    ///
    /// # Panics
    /// If an RFC or XEP reference was already declared.
    pub fn xep(mut self, number: u16) -> Self {
        assert!(
            self.descriptor.reference.is_none(),
            "state {} already declares an external reference",
            self.descriptor.id
        );
        self.descriptor.reference = Some(ExternalReference::Xep(number));
        self
    }

    /// Mark the state as legally enterable more than once per walk.
    pub fn multi_visit(mut self) -> Self {
        self.descriptor.multi_visit = true;
        self
    }

    /// Mark the state as a valid walk target.
    pub fn final_state(mut self) -> Self {
        self.descriptor.final_state = true;
        self
    }

    /// Mark the state as declared but not implemented.
    pub fn not_implemented(mut self) -> Self {
        self.descriptor.not_implemented = true;
        self
    }

    /// Declare a forward successor.
    pub fn successor(mut self, id: StateId) -> Self {
        self.descriptor.successors.push(id);
        self
    }

    /// Declare a predecessor, from which a forward edge to this state is
    /// inferred at graph build time.
    pub fn predecessor(mut self, id: StateId) -> Self {
        self.descriptor.predecessors.push(id);
        self
    }

    /// Declare precedence over a sibling successor.
    pub fn precedence_over(mut self, id: StateId) -> Self {
        self.descriptor.precedence_over.push(id);
        self
    }

    /// Declare inferiority to a sibling successor.
    pub fn inferior_to(mut self, id: StateId) -> Self {
        self.descriptor.inferior_to.push(id);
        self
    }

    /// Finish the descriptor.
    pub fn build(self) -> StateDescriptor {
        self.descriptor
    }
}

/// The descriptor set of one connection class.
#[derive(Debug, Default)]
pub struct DescriptorRegistry {
    descriptors: HashMap<StateId, StateDescriptor>,
}

impl DescriptorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor.
    ///
    /// # Panics
    /// If a descriptor for the same state was already registered.
    pub fn register(&mut self, descriptor: StateDescriptor) {
        let id = descriptor.id();
        let previous = self.descriptors.insert(id, descriptor);
        assert!(previous.is_none(), "descriptor for {id} registered twice");
    }

    /// Look up the descriptor for a state.
    pub fn get(&self, id: StateId) -> Option<&StateDescriptor> {
        self.descriptors.get(&id)
    }

    /// Number of registered descriptors.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
