//! Server-advertised stream features.
//!
//! After every stream (re)open the server announces what the next
//! negotiation round may do: STARTTLS, SASL mechanisms, stream
//! compression methods, resource binding. The transport parses the
//! announcement and publishes a [`StreamFeatures`] value through the
//! connection's feature latch; states consult it in their
//! `is_transition_possible` checks.
//!
//! The advertised set changes between rounds: a pre-authentication open
//! typically carries STARTTLS and SASL mechanisms, a post-authentication
//! open carries bind and compression.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{C2sError, Result};

/// STARTTLS advertisement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartTlsFeature {
    /// Server demands TLS before anything else.
    pub required: bool,
}

/// One round of server-advertised stream features.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFeatures {
    /// STARTTLS offer, if any.
    pub starttls: Option<StartTlsFeature>,

    /// SASL mechanism names in server preference order.
    #[serde(default)]
    pub sasl_mechanisms: Vec<String>,

    /// Stream compression method names (XEP-0138), e.g. `zlib`.
    #[serde(default)]
    pub compression_methods: Vec<String>,

    /// Resource binding is available.
    #[serde(default)]
    pub bind: bool,

    /// Legacy session establishment is available.
    #[serde(default)]
    pub session: bool,

    /// Stream management (XEP-0198) is available.
    #[serde(default)]
    pub stream_management: bool,
}

impl StreamFeatures {
    /// Features for a pre-authentication stream open.
    pub fn pre_auth(mechanisms: Vec<String>, starttls: Option<StartTlsFeature>) -> Self {
        Self {
            starttls,
            sasl_mechanisms: mechanisms,
            ..Self::default()
        }
    }

    /// Features for a post-authentication stream open.
    pub fn post_auth(compression_methods: Vec<String>) -> Self {
        Self {
            compression_methods,
            bind: true,
            session: true,
            ..Self::default()
        }
    }

    /// Whether the server advertises any stream compression.
    pub fn supports_compression(&self) -> bool {
        !self.compression_methods.is_empty()
    }

    /// Whether the server advertises the given SASL mechanism.
    pub fn offers_mechanism(&self, name: &str) -> bool {
        self.sasl_mechanisms.iter().any(|m| m == name)
    }
}

/// Synchronization point between the I/O side and a blocked walk thread.
///
/// The walk thread arms the latch, sends a stream open, and waits. The
/// transport's reading context reports the next feature set (or stream
/// termination) and wakes it. Waiting is bounded by the configured reply
/// timeout; expiry surfaces as a no-response failure, never a silent hang.
#[derive(Debug, Default)]
pub struct FeatureLatch {
    inner: Mutex<LatchInner>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct LatchInner {
    received: bool,
    latest: Option<StreamFeatures>,
    terminated: Option<String>,
}

impl FeatureLatch {
    /// Create an unarmed latch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the latch for the next feature round. Clears any previous
    /// termination so a fresh connection attempt starts clean.
    pub fn prepare(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.received = false;
        inner.terminated = None;
    }

    /// Report a received feature set and wake the waiting walk thread.
    pub fn report(&self, features: StreamFeatures) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.latest = Some(features);
        inner.received = true;
        self.cond.notify_all();
    }

    /// Report stream termination and wake the waiting walk thread.
    pub fn report_termination(&self, reason: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.terminated = Some(reason.to_string());
        self.cond.notify_all();
    }

    /// Wait until features are reported, the stream terminates, or the
    /// timeout expires.
    pub fn wait(&self, timeout: Duration, waiting_for: &str) -> Result<StreamFeatures> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(reason) = &inner.terminated {
                return Err(C2sError::UnexpectedTermination(reason.clone()));
            }
            if inner.received {
                return Ok(inner.latest.clone().unwrap_or_default());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(C2sError::NoResponse {
                    waiting_for: waiting_for.to_string(),
                });
            }
            let (guard, _) = self
                .cond
                .wait_timeout(inner, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            inner = guard;
        }
    }

    /// Most recently reported feature set, if any. Point-in-time snapshot.
    pub fn latest(&self) -> Option<StreamFeatures> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .latest
            .clone()
    }
}

/// Transport-side handle for reporting into a connection's feature latch.
#[derive(Clone)]
pub struct FeatureSink {
    latch: Arc<FeatureLatch>,
}

impl FeatureSink {
    /// Create a sink reporting into the given latch.
    pub fn new(latch: Arc<FeatureLatch>) -> Self {
        Self { latch }
    }

    /// Report a parsed feature advertisement.
    pub fn features_received(&self, features: StreamFeatures) {
        self.latch.report(features);
    }

    /// Report that the stream terminated.
    pub fn stream_terminated(&self, reason: &str) {
        self.latch.report_termination(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pre_auth_features() {
        let features = StreamFeatures::pre_auth(
            vec!["SCRAM-SHA-1".to_string(), "PLAIN".to_string()],
            Some(StartTlsFeature { required: false }),
        );
        assert!(features.offers_mechanism("PLAIN"));
        assert!(!features.offers_mechanism("EXTERNAL"));
        assert!(!features.bind);
        assert!(!features.supports_compression());
    }

    #[test]
    fn test_post_auth_features() {
        let features = StreamFeatures::post_auth(vec!["zlib".to_string()]);
        assert!(features.bind);
        assert!(features.session);
        assert!(features.supports_compression());
        assert!(features.sasl_mechanisms.is_empty());
    }

    #[test]
    fn test_latch_report_before_wait() {
        let latch = FeatureLatch::new();
        latch.prepare();
        latch.report(StreamFeatures::post_auth(vec![]));
        let features = latch.wait(Duration::from_millis(10), "features").unwrap();
        assert!(features.bind);
    }

    #[test]
    fn test_latch_wakes_waiting_thread() {
        let latch = Arc::new(FeatureLatch::new());
        latch.prepare();

        let reporter = Arc::clone(&latch);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            reporter.report(StreamFeatures::pre_auth(vec!["PLAIN".to_string()], None));
        });

        let features = latch.wait(Duration::from_secs(5), "features").unwrap();
        assert!(features.offers_mechanism("PLAIN"));
        handle.join().unwrap();
    }

    #[test]
    fn test_latch_timeout_is_no_response() {
        let latch = FeatureLatch::new();
        latch.prepare();
        let err = latch
            .wait(Duration::from_millis(10), "post-auth features")
            .unwrap_err();
        match err {
            C2sError::NoResponse { waiting_for } => {
                assert_eq!(waiting_for, "post-auth features");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_latch_termination_unblocks() {
        let latch = Arc::new(FeatureLatch::new());
        latch.prepare();

        let reporter = Arc::clone(&latch);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            reporter.report_termination("connection reset by peer");
        });

        let err = latch.wait(Duration::from_secs(5), "features").unwrap_err();
        assert!(matches!(err, C2sError::UnexpectedTermination(_)));
        handle.join().unwrap();

        // A new connection attempt arms the latch afresh.
        latch.prepare();
        latch.report(StreamFeatures::default());
        assert!(latch.wait(Duration::from_millis(10), "features").is_ok());
    }
}
