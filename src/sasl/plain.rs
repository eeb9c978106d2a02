//! The PLAIN mechanism (RFC 4616).
//!
//! Single round trip: `[authzid] NUL authcid NUL passwd` as the initial
//! response. Only acceptable over a protected stream; servers typically
//! advertise it after STARTTLS.

use std::time::Duration;

use super::{SaslMechanism, SaslMechanismFactory};
use crate::error::{C2sError, Result, SaslError};
use crate::fsm::walk::Credentials;
use crate::transport::{Request, Response, Transport};

/// Factory for [`PlainMechanism`].
pub struct PlainMechanismFactory;

impl SaslMechanismFactory for PlainMechanismFactory {
    fn name(&self) -> &'static str {
        "PLAIN"
    }

    fn create(&self) -> Box<dyn SaslMechanism> {
        Box::new(PlainMechanism)
    }
}

/// PLAIN exchange.
pub struct PlainMechanism;

impl PlainMechanism {
    fn initial_response(credentials: &Credentials, authzid: Option<&str>) -> Vec<u8> {
        let mut payload = Vec::new();
        if let Some(authzid) = authzid {
            payload.extend_from_slice(authzid.as_bytes());
        }
        payload.push(0);
        payload.extend_from_slice(credentials.username.as_bytes());
        payload.push(0);
        payload.extend_from_slice(credentials.password.as_bytes());
        payload
    }
}

impl SaslMechanism for PlainMechanism {
    fn name(&self) -> &'static str {
        "PLAIN"
    }

    fn authenticate(
        &mut self,
        transport: &mut dyn Transport,
        credentials: &Credentials,
        authzid: Option<&str>,
        timeout: Duration,
    ) -> Result<()> {
        let request = Request::SaslAuth {
            mechanism: self.name().to_string(),
            initial_response: Some(Self::initial_response(credentials, authzid)),
        };

        match transport.send_request(request, timeout)? {
            Response::SaslSuccess => Ok(()),
            Response::SaslFailure { condition } => {
                Err(C2sError::Sasl(SaslError::Failed { condition }))
            }
            Response::SaslChallenge { .. } => Err(C2sError::Sasl(SaslError::Protocol {
                mechanism: self.name().to_string(),
                detail: "PLAIN expects no challenge".to_string(),
            })),
            other => Err(C2sError::Sasl(SaslError::Protocol {
                mechanism: self.name().to_string(),
                detail: format!("unexpected response {other:?}"),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_response_layout() {
        let credentials = Credentials::new("alice", "secret");
        let payload = PlainMechanism::initial_response(&credentials, None);
        assert_eq!(payload, b"\0alice\0secret");

        let payload = PlainMechanism::initial_response(&credentials, Some("admin"));
        assert_eq!(payload, b"admin\0alice\0secret");
    }

    #[test]
    fn test_plain_against_memory_server() {
        use crate::config::ConnectionConfig;
        use crate::transport::{MemoryServer, MemoryTransport};

        let server = MemoryServer::new().with_credentials("alice", "secret");
        let mut transport = MemoryTransport::new(server);
        let config = ConnectionConfig::new("example.org");
        let endpoint = transport.lookup_endpoints(&config).unwrap()[0].clone();
        transport.connect(&endpoint).unwrap();

        let mut mechanism = PlainMechanismFactory.create();
        let ok = mechanism.authenticate(
            &mut transport,
            &Credentials::new("alice", "secret"),
            None,
            Duration::from_secs(1),
        );
        assert!(ok.is_ok());

        let mut mechanism = PlainMechanismFactory.create();
        let err = mechanism
            .authenticate(
                &mut transport,
                &Credentials::new("alice", "wrong"),
                None,
                Duration::from_secs(1),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            C2sError::Sasl(SaslError::Failed { .. })
        ));
    }
}
