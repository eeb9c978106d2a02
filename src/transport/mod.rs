//! Wire/transport contract consumed by the negotiation states.
//!
//! The state machine never touches XML or sockets itself. It talks to a
//! [`Transport`] in terms of negotiation elements: open a stream, send a
//! request and block for its correlated response (or a timeout), upgrade
//! to TLS, close. Feature advertisements flow back asynchronously through
//! the connection's [`FeatureSink`], delivered from whatever context the
//! transport reads in.
//!
//! The crate ships [`memory::MemoryTransport`], an in-process loopback
//! against a scriptable server, which is also what the test suite drives
//! the state machine with. Socket-based transports implement the same
//! trait out of tree; the stanza codec they need is outside this crate's
//! scope.

pub mod filter;
pub mod memory;

use std::fmt;
use std::time::Duration;

use crate::config::ConnectionConfig;
use crate::error::Result;
use crate::features::FeatureSink;

pub use filter::{FilterChain, FilterStats, IoFilter};
pub use memory::{MemoryServer, MemoryTransport};

/// One resolved connection endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host name or address literal.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint.
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A negotiation element sent to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `<starttls/>`: request the TLS upgrade.
    StartTls,
    /// `<auth/>`: begin a SASL exchange.
    SaslAuth {
        /// Mechanism name.
        mechanism: String,
        /// Initial response, if the mechanism sends one.
        initial_response: Option<Vec<u8>>,
    },
    /// `<response/>`: continue a SASL exchange after a challenge.
    SaslResponse {
        /// Response payload.
        payload: Vec<u8>,
    },
    /// `<compress/>`: request stream compression (XEP-0138).
    Compress {
        /// Method name, e.g. `zlib`.
        method: String,
    },
    /// Resource binding IQ.
    BindResource {
        /// Requested resourcepart; the server assigns one when absent.
        resource: Option<String>,
    },
    /// Legacy session establishment IQ.
    EstablishSession,
}

/// The server's correlated answer to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// `<proceed/>`: TLS may start.
    TlsProceed,
    /// `<challenge/>`: SASL continues.
    SaslChallenge {
        /// Challenge payload.
        payload: Vec<u8>,
    },
    /// `<success/>`: SASL completed.
    SaslSuccess,
    /// `<failure/>` in the SASL namespace.
    SaslFailure {
        /// Failure condition, e.g. `not-authorized`.
        condition: String,
    },
    /// `<compressed/>`: compression accepted, switch the stream.
    Compressed,
    /// `<failure/>` in the compress namespace.
    CompressFailed {
        /// Failure condition, e.g. `unsupported-method`.
        condition: String,
    },
    /// Bind result carrying the assigned resource.
    Bound {
        /// Server-assigned resourcepart.
        resource: String,
    },
    /// Session establishment result.
    SessionEstablished,
    /// Stream-level error.
    StreamError {
        /// Error condition.
        condition: String,
    },
}

/// Pluggable wire backend.
///
/// Implementations own framing, parsing and encryption; the negotiation
/// layer only sees structured elements. All blocking methods must respect
/// the passed timeout and surface expiry as an error rather than hanging.
pub trait Transport: Send {
    /// Hand over the sink for asynchronous feature advertisements. Called
    /// once when the connection is created.
    fn bind_feature_sink(&mut self, sink: FeatureSink);

    /// Resolve candidate endpoints for the configured service.
    fn lookup_endpoints(&mut self, config: &ConnectionConfig) -> Result<Vec<Endpoint>>;

    /// Open the underlying connection to one endpoint.
    fn connect(&mut self, endpoint: &Endpoint) -> Result<()>;

    /// Upgrade the established connection to TLS. Only called after the
    /// server answered a [`Request::StartTls`] with [`Response::TlsProceed`].
    fn upgrade_tls(&mut self) -> Result<()>;

    /// Send a stream open for the given domain. The resulting feature
    /// advertisement arrives through the bound [`FeatureSink`].
    fn send_stream_open(&mut self, domain: &str) -> Result<()>;

    /// Send a request and block for its correlated response.
    fn send_request(&mut self, request: Request, timeout: Duration) -> Result<Response>;

    /// Send the closing stream tag. Returns whether the server's closing
    /// tag was observed within the timeout.
    fn send_stream_close(&mut self, timeout: Duration) -> Result<bool>;

    /// Drop the underlying connection unconditionally.
    fn disconnect(&mut self);
}
