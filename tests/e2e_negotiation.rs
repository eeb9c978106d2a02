//! End-to-end negotiation walks against the in-memory loopback transport.
//!
//! These tests verify full login paths, feature-dependent reordering,
//! compression, and teardown beyond the unit test level.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use c2s::{
    C2sError, Connection, ConnectionConfig, ConnectionStateEvent, MemoryServer, MemoryTransport,
    Request, Response, SaslMechanism, SaslMechanismFactory, StampedEvent, StateId, Transport,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Collects every event a connection emits.
#[derive(Clone, Default)]
struct Recorder {
    events: Arc<Mutex<Vec<ConnectionStateEvent>>>,
}

impl Recorder {
    fn attach(&self, connection: &Connection) {
        let sink = Arc::clone(&self.events);
        connection.add_listener(Box::new(move |event: &StampedEvent| {
            sink.lock().unwrap().push(event.event.clone());
        }));
    }

    fn entered_states(&self) -> Vec<StateId> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                ConnectionStateEvent::SuccessfullyTransitionedInto { state, .. } => Some(*state),
                _ => None,
            })
            .collect()
    }

    fn count(&self, predicate: impl Fn(&ConnectionStateEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| predicate(e)).count()
    }

    fn find_detail(&self, state: StateId) -> Option<String> {
        self.events.lock().unwrap().iter().find_map(|event| match event {
            ConnectionStateEvent::SuccessfullyTransitionedInto { state: s, detail }
                if *s == state =>
            {
                Some(detail.clone())
            }
            _ => None,
        })
    }
}

fn connection_for(server: MemoryServer, config: ConnectionConfig) -> Connection {
    Connection::builder(config)
        .transport(Box::new(MemoryTransport::new(server)))
        .build()
        .unwrap()
}

/// Scripted multi-round mechanism matching the loopback server's
/// challenge exchange. Stands in for a real SCRAM implementation.
struct ScriptedScramFactory;

impl SaslMechanismFactory for ScriptedScramFactory {
    fn name(&self) -> &'static str {
        "SCRAM-SHA-1"
    }

    fn create(&self) -> Box<dyn SaslMechanism> {
        Box::new(ScriptedScram)
    }
}

struct ScriptedScram;

impl SaslMechanism for ScriptedScram {
    fn name(&self) -> &'static str {
        "SCRAM-SHA-1"
    }

    fn authenticate(
        &mut self,
        transport: &mut dyn Transport,
        credentials: &c2s::Credentials,
        _authzid: Option<&str>,
        timeout: Duration,
    ) -> c2s::Result<()> {
        let first = Request::SaslAuth {
            mechanism: self.name().to_string(),
            initial_response: Some(format!("n,,n={}", credentials.username).into_bytes()),
        };
        let nonce = match transport.send_request(first, timeout)? {
            Response::SaslChallenge { payload } => payload,
            Response::SaslFailure { condition } => {
                return Err(C2sError::Sasl(c2s::SaslError::Failed { condition }))
            }
            other => {
                return Err(C2sError::Sasl(c2s::SaslError::Protocol {
                    mechanism: self.name().to_string(),
                    detail: format!("unexpected response {other:?}"),
                }))
            }
        };

        let mut proof = Vec::new();
        proof.extend_from_slice(credentials.username.as_bytes());
        proof.push(0);
        proof.extend_from_slice(credentials.password.as_bytes());
        proof.push(0);
        proof.extend_from_slice(&nonce);

        match transport.send_request(Request::SaslResponse { payload: proof }, timeout)? {
            Response::SaslSuccess => Ok(()),
            Response::SaslFailure { condition } => {
                Err(C2sError::Sasl(c2s::SaslError::Failed { condition }))
            }
            other => Err(C2sError::Sasl(c2s::SaslError::Protocol {
                mechanism: self.name().to_string(),
                detail: format!("unexpected response {other:?}"),
            })),
        }
    }
}

#[test]
fn test_full_login_walk_with_challenge_mechanism() {
    init_tracing();
    let server = MemoryServer::new()
        .with_mechanisms(&["SCRAM-SHA-1"])
        .with_credentials("alice", "secret")
        .with_assigned_resource("resourceA");
    let config = ConnectionConfig::new("example.org").with_resource("resourceA");

    let mut connection = Connection::builder(config)
        .transport(Box::new(MemoryTransport::new(server)))
        .add_sasl_mechanism(Box::new(ScriptedScramFactory))
        .build()
        .unwrap();

    let recorder = Recorder::default();
    recorder.attach(&connection);

    connection.login("alice", "secret").unwrap();

    assert!(connection.is_connected());
    assert!(connection.is_authenticated());
    assert!(connection.is_secure());
    assert_eq!(
        connection.current_state(),
        StateId::AuthenticatedAndResourceBound
    );
    assert_eq!(connection.bound_resource().as_deref(), Some("resourceA"));
    assert_eq!(
        connection.sasl_mechanism_used().as_deref(),
        Some("SCRAM-SHA-1")
    );

    connection.flush_events();
    assert_eq!(
        recorder.entered_states(),
        [
            StateId::ResolvingEndpoints,
            StateId::ConnectingToHost,
            StateId::EstablishingTls,
            StateId::ConnectedButUnauthenticated,
            StateId::SaslAuthentication,
            StateId::AuthenticatedButUnbound,
            StateId::ResourceBinding,
            StateId::AuthenticatedAndResourceBound,
        ]
    );
    assert_eq!(
        recorder.count(|e| matches!(e, ConnectionStateEvent::FinalStateReached { .. })),
        1
    );
    let sasl_detail = recorder.find_detail(StateId::SaslAuthentication).unwrap();
    assert!(sasl_detail.contains("SCRAM-SHA-1"));
    let bind_detail = recorder.find_detail(StateId::ResourceBinding).unwrap();
    assert!(bind_detail.contains("resourceA"));
}

#[test]
fn test_compression_negotiated_and_anchor_revisited() {
    init_tracing();
    let server = MemoryServer::new().with_credentials("alice", "secret");
    let config = ConnectionConfig::new("example.org").with_compression(true);
    let mut connection = connection_for(server, config);

    let recorder = Recorder::default();
    recorder.attach(&connection);

    connection.login("alice", "secret").unwrap();

    assert!(connection.is_authenticated());
    assert!(connection.is_using_compression());

    let stats = connection.filter_stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].name, "zlib");

    connection.flush_events();
    let entered = recorder.entered_states();
    // Compression loops back into the anchor: visited twice, compression
    // itself entered exactly once.
    assert_eq!(
        entered
            .iter()
            .filter(|&&s| s == StateId::AuthenticatedButUnbound)
            .count(),
        2
    );
    assert_eq!(
        entered.iter().filter(|&&s| s == StateId::Compression).count(),
        1
    );
    let detail = recorder.find_detail(StateId::Compression).unwrap();
    assert!(detail.contains("zlib"));
}

#[test]
fn test_compression_not_supported_walks_on() {
    let server = MemoryServer::new().with_compression_methods(&[]);
    let config = ConnectionConfig::new("example.org").with_compression(true);
    let mut connection = connection_for(server, config);

    let recorder = Recorder::default();
    recorder.attach(&connection);

    connection.login("alice", "secret").unwrap();

    assert!(connection.is_authenticated());
    assert!(!connection.is_using_compression());

    connection.flush_events();
    let not_possible = recorder.count(|e| {
        matches!(
            e,
            ConnectionStateEvent::TransitionNotPossible { state: StateId::Compression, reason }
                if reason == "Stream compression not supported"
        )
    });
    assert_eq!(not_possible, 1);
}

#[test]
fn test_compression_without_matching_factory_walks_on() {
    let server = MemoryServer::new().with_compression_methods(&["lzw"]);
    let config = ConnectionConfig::new("example.org").with_compression(true);
    let mut connection = connection_for(server, config);

    let recorder = Recorder::default();
    recorder.attach(&connection);

    connection.login("alice", "secret").unwrap();
    assert!(!connection.is_using_compression());

    connection.flush_events();
    let not_possible = recorder.count(|e| {
        matches!(
            e,
            ConnectionStateEvent::TransitionNotPossible { state: StateId::Compression, reason }
                if reason == "No matching compression factory"
        )
    });
    assert_eq!(not_possible, 1);
}

#[test]
fn test_connect_then_login_continues_from_anchor() {
    let server = MemoryServer::new();
    let config = ConnectionConfig::new("example.org");
    let mut connection = connection_for(server, config);

    connection.connect().unwrap();
    assert!(connection.is_connected());
    assert!(!connection.is_authenticated());
    assert_eq!(
        connection.current_state(),
        StateId::ConnectedButUnauthenticated
    );

    let recorder = Recorder::default();
    recorder.attach(&connection);

    connection.login("alice", "secret").unwrap();
    assert!(connection.is_authenticated());

    connection.flush_events();
    let entered = recorder.entered_states();
    // The login walk starts at the connected anchor; connection
    // establishment does not run again.
    assert!(!entered.contains(&StateId::ResolvingEndpoints));
    assert!(!entered.contains(&StateId::ConnectingToHost));
    assert_eq!(entered.first(), Some(&StateId::SaslAuthentication));
}

#[test]
fn test_disconnect_resets_everything() {
    let server = MemoryServer::new();
    let config = ConnectionConfig::new("example.org").with_compression(true);
    let mut connection = connection_for(server, config);

    connection.login("alice", "secret").unwrap();
    assert!(connection.is_using_compression());

    connection.disconnect().unwrap();

    assert_eq!(connection.current_state(), StateId::Disconnected);
    assert!(!connection.is_connected());
    assert!(!connection.is_authenticated());
    assert!(!connection.is_using_compression());
    assert!(!connection.is_secure());
    assert_eq!(connection.bound_resource(), None);
    assert_eq!(connection.sasl_mechanism_used(), None);

    // The chain detached at disconnect still answers stats queries.
    let stats = connection.filter_stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].name, "zlib");
}

#[test]
fn test_reconnect_after_disconnect() {
    let server = MemoryServer::new().with_credentials("alice", "secret");
    let config = ConnectionConfig::new("example.org");
    let mut connection = connection_for(server, config);

    connection.login("alice", "secret").unwrap();
    connection.instant_disconnect().unwrap();
    assert_eq!(connection.current_state(), StateId::Disconnected);

    connection.login("alice", "secret").unwrap();
    assert!(connection.is_authenticated());
    assert_eq!(
        connection.current_state(),
        StateId::AuthenticatedAndResourceBound
    );
}

#[test]
fn test_login_when_already_authenticated_is_a_noop() {
    let server = MemoryServer::new();
    let config = ConnectionConfig::new("example.org");
    let mut connection = connection_for(server, config);

    connection.login("alice", "secret").unwrap();

    let recorder = Recorder::default();
    recorder.attach(&connection);

    connection.login("alice", "secret").unwrap();
    connection.flush_events();

    // Already at the final state: no transitions, one final-state signal.
    assert!(recorder.entered_states().is_empty());
    assert_eq!(
        recorder.count(|e| matches!(e, ConnectionStateEvent::FinalStateReached { .. })),
        1
    );
}

#[test]
fn test_disconnect_when_disconnected_is_a_noop() {
    let server = MemoryServer::new();
    let config = ConnectionConfig::new("example.org");
    let mut connection = connection_for(server, config);

    connection.disconnect().unwrap();
    assert_eq!(connection.current_state(), StateId::Disconnected);
}
