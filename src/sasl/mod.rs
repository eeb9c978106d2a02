//! SASL mechanism contract.
//!
//! Mechanisms are pluggable and opaque to the state machine: given
//! credentials and a transport, a mechanism runs its challenge-response
//! exchange and reports success or failure. The authentication state only
//! learns the mechanism's name for diagnostics.
//!
//! Selection is by registration order: the first registered factory whose
//! mechanism the server advertises wins. [`plain::PlainMechanismFactory`]
//! is registered by default; anything stronger is supplied by the caller.

pub mod plain;

use std::time::Duration;

use crate::error::Result;
use crate::fsm::walk::Credentials;
use crate::transport::Transport;

pub use plain::{PlainMechanism, PlainMechanismFactory};

/// Factory producing fresh mechanism instances per authentication attempt.
pub trait SaslMechanismFactory: Send + Sync {
    /// Mechanism name as advertised by servers, e.g. `PLAIN`.
    fn name(&self) -> &'static str;

    /// Create a mechanism instance for one exchange.
    fn create(&self) -> Box<dyn SaslMechanism>;
}

/// One SASL exchange.
pub trait SaslMechanism: Send {
    /// Mechanism name.
    fn name(&self) -> &'static str;

    /// Run the exchange to completion. Returns `Ok` only on success;
    /// authentication failures surface as [`crate::error::SaslError`]
    /// wrapped in the crate error.
    fn authenticate(
        &mut self,
        transport: &mut dyn Transport,
        credentials: &Credentials,
        authzid: Option<&str>,
        timeout: Duration,
    ) -> Result<()>;
}

/// Pick the first registered mechanism the server offers.
pub fn select_mechanism<'a>(
    factories: &'a [Box<dyn SaslMechanismFactory>],
    offered: &[String],
) -> Option<&'a dyn SaslMechanismFactory> {
    factories
        .iter()
        .find(|factory| offered.iter().any(|name| name == factory.name()))
        .map(Box::as_ref)
}
