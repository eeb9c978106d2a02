//! In-process loopback transport.
//!
//! [`MemoryTransport`] implements the wire contract against a scriptable
//! [`MemoryServer`] living in the same process: no sockets, no XML, fully
//! deterministic. It drives every negotiation path the state machine has
//! (STARTTLS, SASL with single- and multi-round mechanisms, compression,
//! binding, shutdown), which makes it the reference implementation of the
//! [`Transport`](super::Transport) trait and the backend the test suite
//! runs against.
//!
//! The multi-round `SCRAM-SHA-1` exchange is a scripted stand-in: the
//! server issues a fixed nonce and expects `user\0pass\0nonce` back.
//! Real mechanism cryptography is a mechanism concern, not a transport
//! concern.

use std::time::Duration;

use tracing::debug;
use uuid::Uuid;

use super::{Endpoint, Request, Response, Transport};
use crate::config::ConnectionConfig;
use crate::error::{C2sError, Result};
use crate::features::{FeatureSink, StartTlsFeature, StreamFeatures};

const SCRAM_NONCE: &[u8] = b"srv-nonce";

/// Scriptable in-process server.
///
/// Public fields describe the server's behavior; `with_*` methods exist
/// for the common ones. Runtime negotiation state (TLS active,
/// authenticated, compression active) is internal and resets on
/// disconnect.
#[derive(Debug, Clone)]
pub struct MemoryServer {
    /// Endpoints returned by lookup. `None` falls back to the configured
    /// host and port; `Some(vec![])` simulates a lookup with no results.
    pub endpoints: Option<Vec<Endpoint>>,
    /// SASL mechanisms advertised pre-authentication.
    pub sasl_mechanisms: Vec<String>,
    /// Advertise STARTTLS before it is established.
    pub offer_starttls: bool,
    /// Compression methods advertised post-authentication.
    pub compression_methods: Vec<String>,
    /// Answer compress requests with `<compressed/>`.
    pub accept_compression: bool,
    /// Expected credentials. `None` accepts anything.
    pub credentials: Option<(String, String)>,
    /// Resourcepart to assign on bind, overriding the requested one.
    pub assigned_resource: Option<String>,
    /// Refuse TCP connections.
    pub refuse_tcp: bool,

    tls_active: bool,
    authenticated: bool,
    compression_active: bool,
    scram_pending: bool,
}

impl Default for MemoryServer {
    fn default() -> Self {
        Self {
            endpoints: None,
            sasl_mechanisms: vec!["PLAIN".to_string()],
            offer_starttls: true,
            compression_methods: vec!["zlib".to_string()],
            accept_compression: true,
            credentials: None,
            assigned_resource: None,
            refuse_tcp: false,
            tls_active: false,
            authenticated: false,
            compression_active: false,
            scram_pending: false,
        }
    }
}

impl MemoryServer {
    /// Server with default behavior: PLAIN auth, STARTTLS and zlib offered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require the given credentials.
    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some((username.to_string(), password.to_string()));
        self
    }

    /// Advertise the given SASL mechanisms.
    pub fn with_mechanisms(mut self, mechanisms: &[&str]) -> Self {
        self.sasl_mechanisms = mechanisms.iter().map(|m| (*m).to_string()).collect();
        self
    }

    /// Advertise the given compression methods.
    pub fn with_compression_methods(mut self, methods: &[&str]) -> Self {
        self.compression_methods = methods.iter().map(|m| (*m).to_string()).collect();
        self
    }

    /// Assign a fixed resourcepart on bind.
    pub fn with_assigned_resource(mut self, resource: &str) -> Self {
        self.assigned_resource = Some(resource.to_string());
        self
    }

    fn current_features(&self) -> StreamFeatures {
        if self.authenticated {
            let methods = if self.compression_active {
                Vec::new()
            } else {
                self.compression_methods.clone()
            };
            StreamFeatures::post_auth(methods)
        } else {
            let starttls = if self.offer_starttls && !self.tls_active {
                Some(StartTlsFeature { required: false })
            } else {
                None
            };
            StreamFeatures::pre_auth(self.sasl_mechanisms.clone(), starttls)
        }
    }

    fn credentials_match(&self, username: &[u8], password: &[u8]) -> bool {
        match &self.credentials {
            Some((expected_user, expected_pass)) => {
                expected_user.as_bytes() == username && expected_pass.as_bytes() == password
            }
            None => true,
        }
    }

    fn handle_sasl_auth(
        &mut self,
        mechanism: &str,
        initial_response: Option<&[u8]>,
    ) -> Response {
        if !self.sasl_mechanisms.iter().any(|m| m == mechanism) {
            return Response::SaslFailure {
                condition: "invalid-mechanism".to_string(),
            };
        }

        match mechanism {
            "PLAIN" => {
                let Some(payload) = initial_response else {
                    return Response::SaslFailure {
                        condition: "malformed-request".to_string(),
                    };
                };
                let parts: Vec<&[u8]> = payload.split(|&b| b == 0).collect();
                if parts.len() != 3 {
                    return Response::SaslFailure {
                        condition: "malformed-request".to_string(),
                    };
                }
                if self.credentials_match(parts[1], parts[2]) {
                    self.authenticated = true;
                    Response::SaslSuccess
                } else {
                    Response::SaslFailure {
                        condition: "not-authorized".to_string(),
                    }
                }
            }
            "SCRAM-SHA-1" => {
                self.scram_pending = true;
                Response::SaslChallenge {
                    payload: SCRAM_NONCE.to_vec(),
                }
            }
            // Unknown but advertised mechanisms succeed unconditionally,
            // which keeps custom test mechanisms cheap to script.
            _ => {
                self.authenticated = true;
                Response::SaslSuccess
            }
        }
    }

    fn handle_sasl_response(&mut self, payload: &[u8]) -> Response {
        if !self.scram_pending {
            return Response::SaslFailure {
                condition: "malformed-request".to_string(),
            };
        }
        self.scram_pending = false;

        let parts: Vec<&[u8]> = payload.split(|&b| b == 0).collect();
        let proof_ok = parts.len() == 3
            && parts[2] == SCRAM_NONCE
            && self.credentials_match(parts[0], parts[1]);
        if proof_ok {
            self.authenticated = true;
            Response::SaslSuccess
        } else {
            Response::SaslFailure {
                condition: "not-authorized".to_string(),
            }
        }
    }

    fn handle_request(&mut self, request: Request) -> Response {
        match request {
            Request::StartTls => Response::TlsProceed,
            Request::SaslAuth {
                mechanism,
                initial_response,
            } => self.handle_sasl_auth(&mechanism, initial_response.as_deref()),
            Request::SaslResponse { payload } => self.handle_sasl_response(&payload),
            Request::Compress { method } => {
                let supported = self.compression_methods.iter().any(|m| *m == method);
                if !supported {
                    Response::CompressFailed {
                        condition: "unsupported-method".to_string(),
                    }
                } else if !self.accept_compression || self.compression_active {
                    Response::CompressFailed {
                        condition: "setup-failed".to_string(),
                    }
                } else {
                    self.compression_active = true;
                    Response::Compressed
                }
            }
            Request::BindResource { resource } => {
                if !self.authenticated {
                    return Response::StreamError {
                        condition: "not-authorized".to_string(),
                    };
                }
                let resource = self
                    .assigned_resource
                    .clone()
                    .or(resource)
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                Response::Bound { resource }
            }
            Request::EstablishSession => Response::SessionEstablished,
        }
    }

    fn reset_runtime(&mut self) {
        self.tls_active = false;
        self.authenticated = false;
        self.compression_active = false;
        self.scram_pending = false;
    }
}

/// Loopback transport talking to a [`MemoryServer`].
pub struct MemoryTransport {
    server: MemoryServer,
    sink: Option<FeatureSink>,
    connected: bool,
}

impl MemoryTransport {
    /// Create a transport backed by the given server script.
    pub fn new(server: MemoryServer) -> Self {
        Self {
            server,
            sink: None,
            connected: false,
        }
    }

    fn sink(&self) -> Result<&FeatureSink> {
        self.sink.as_ref().ok_or_else(|| {
            C2sError::StateMachineViolation("transport has no feature sink bound".to_string())
        })
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(C2sError::NotConnected)
        }
    }
}

impl Transport for MemoryTransport {
    fn bind_feature_sink(&mut self, sink: FeatureSink) {
        self.sink = Some(sink);
    }

    fn lookup_endpoints(&mut self, config: &ConnectionConfig) -> Result<Vec<Endpoint>> {
        match &self.server.endpoints {
            Some(endpoints) => Ok(endpoints.clone()),
            None => Ok(vec![Endpoint::new(config.effective_host(), config.port)]),
        }
    }

    fn connect(&mut self, endpoint: &Endpoint) -> Result<()> {
        if self.server.refuse_tcp {
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("connection refused: {endpoint}"),
            )
            .into());
        }
        debug!(%endpoint, "loopback connection established");
        self.connected = true;
        Ok(())
    }

    fn upgrade_tls(&mut self) -> Result<()> {
        self.ensure_connected()?;
        self.server.tls_active = true;
        Ok(())
    }

    fn send_stream_open(&mut self, _domain: &str) -> Result<()> {
        self.ensure_connected()?;
        let features = self.server.current_features();
        self.sink()?.features_received(features);
        Ok(())
    }

    fn send_request(&mut self, request: Request, _timeout: Duration) -> Result<Response> {
        self.ensure_connected()?;
        Ok(self.server.handle_request(request))
    }

    fn send_stream_close(&mut self, _timeout: Duration) -> Result<bool> {
        Ok(self.connected)
    }

    fn disconnect(&mut self) {
        self.connected = false;
        self.server.reset_runtime();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_falls_back_to_config() {
        let mut transport = MemoryTransport::new(MemoryServer::new());
        let config = ConnectionConfig::new("example.org").with_port(5223);
        let endpoints = transport.lookup_endpoints(&config).unwrap();
        assert_eq!(endpoints, vec![Endpoint::new("example.org", 5223)]);
    }

    #[test]
    fn test_feature_rounds_track_negotiation_progress() {
        let mut server = MemoryServer::new();
        let pre = server.current_features();
        assert!(pre.starttls.is_some());
        assert!(pre.offers_mechanism("PLAIN"));
        assert!(!pre.bind);

        server.tls_active = true;
        assert!(server.current_features().starttls.is_none());

        server.authenticated = true;
        let post = server.current_features();
        assert!(post.bind);
        assert_eq!(post.compression_methods, ["zlib"]);

        server.compression_active = true;
        assert!(!server.current_features().supports_compression());
    }

    #[test]
    fn test_plain_auth_checks_credentials() {
        let mut server = MemoryServer::new().with_credentials("alice", "secret");

        let response = server.handle_request(Request::SaslAuth {
            mechanism: "PLAIN".to_string(),
            initial_response: Some(b"\0alice\0secret".to_vec()),
        });
        assert_eq!(response, Response::SaslSuccess);

        let mut server = MemoryServer::new().with_credentials("alice", "secret");
        let response = server.handle_request(Request::SaslAuth {
            mechanism: "PLAIN".to_string(),
            initial_response: Some(b"\0alice\0wrong".to_vec()),
        });
        assert_eq!(
            response,
            Response::SaslFailure {
                condition: "not-authorized".to_string()
            }
        );
    }

    #[test]
    fn test_scripted_scram_round_trip() {
        let mut server = MemoryServer::new()
            .with_mechanisms(&["SCRAM-SHA-1"])
            .with_credentials("bob", "hunter2");

        let challenge = server.handle_request(Request::SaslAuth {
            mechanism: "SCRAM-SHA-1".to_string(),
            initial_response: Some(b"n,,n=bob".to_vec()),
        });
        assert_eq!(
            challenge,
            Response::SaslChallenge {
                payload: SCRAM_NONCE.to_vec()
            }
        );

        let response = server.handle_request(Request::SaslResponse {
            payload: b"bob\0hunter2\0srv-nonce".to_vec(),
        });
        assert_eq!(response, Response::SaslSuccess);
    }

    #[test]
    fn test_compress_respects_script() {
        let mut server = MemoryServer::new();
        server.accept_compression = false;
        let response = server.handle_request(Request::Compress {
            method: "zlib".to_string(),
        });
        assert_eq!(
            response,
            Response::CompressFailed {
                condition: "setup-failed".to_string()
            }
        );

        let mut server = MemoryServer::new();
        let response = server.handle_request(Request::Compress {
            method: "lzw".to_string(),
        });
        assert_eq!(
            response,
            Response::CompressFailed {
                condition: "unsupported-method".to_string()
            }
        );
    }

    #[test]
    fn test_bind_prefers_assigned_resource() {
        let mut server = MemoryServer::new().with_assigned_resource("server-pick");
        server.authenticated = true;
        let response = server.handle_request(Request::BindResource {
            resource: Some("mine".to_string()),
        });
        assert_eq!(
            response,
            Response::Bound {
                resource: "server-pick".to_string()
            }
        );
    }
}
