//! Input/output filter chain.
//!
//! Filters transform the byte stream between the negotiation layer and
//! the socket; stream compression is the canonical example. The chain is
//! ordered: new filters are installed at the front, so the most recently
//! negotiated transform is applied first on output and last on input.
//!
//! The chain is owned by the connection internals and mutated only from
//! within a walk. When the connection drops, the chain is detached but
//! remembered so statistics stay queryable; readers tolerate point-in-time
//! staleness.

use bytes::BytesMut;

use crate::error::Result;

/// One byte-stream transform in the chain.
pub trait IoFilter: Send {
    /// Filter name, e.g. the negotiated compression method.
    fn name(&self) -> &str;

    /// Transform outgoing bytes.
    fn filter_output(&mut self, input: &[u8], output: &mut BytesMut) -> Result<()>;

    /// Transform incoming bytes.
    fn filter_input(&mut self, input: &[u8], output: &mut BytesMut) -> Result<()>;

    /// Flush any buffered data at stream shutdown.
    fn finish(&mut self, _output: &mut BytesMut) -> Result<()> {
        Ok(())
    }

    /// Point-in-time statistics, if the filter keeps any.
    fn stats(&self) -> Option<FilterStats> {
        None
    }
}

/// Byte counters of one filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterStats {
    /// Filter name.
    pub name: String,
    /// Bytes handed to the filter on the outgoing side.
    pub outbound_bytes_in: u64,
    /// Bytes the filter produced on the outgoing side.
    pub outbound_bytes_out: u64,
    /// Bytes handed to the filter on the incoming side.
    pub inbound_bytes_in: u64,
    /// Bytes the filter produced on the incoming side.
    pub inbound_bytes_out: u64,
}

impl FilterStats {
    /// Outgoing compression ratio: input bytes per produced byte.
    pub fn outbound_ratio(&self) -> f64 {
        if self.outbound_bytes_out == 0 {
            1.0
        } else {
            self.outbound_bytes_in as f64 / self.outbound_bytes_out as f64
        }
    }
}

/// Ordered filter chain with a detached-chain fallback for statistics.
#[derive(Default)]
pub struct FilterChain {
    active: Vec<Box<dyn IoFilter>>,
    previous: Option<Vec<Box<dyn IoFilter>>>,
}

impl FilterChain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a filter at the front of the chain.
    pub fn add_front(&mut self, filter: Box<dyn IoFilter>) {
        self.active.insert(0, filter);
    }

    /// Remove the first filter with the given name.
    pub fn remove(&mut self, name: &str) -> Option<Box<dyn IoFilter>> {
        let index = self.active.iter().position(|f| f.name() == name)?;
        Some(self.active.remove(index))
    }

    /// Number of active filters.
    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// Whether no filter is active.
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Detach the active chain, keeping it for later stats queries.
    pub fn detach(&mut self) {
        if self.active.is_empty() {
            self.previous = None;
        } else {
            self.previous = Some(std::mem::take(&mut self.active));
        }
    }

    /// Flush every active filter. Failures are logged, not propagated; a
    /// closing stream has nowhere to report them.
    pub fn finish_all(&mut self) {
        let mut sink = BytesMut::new();
        for filter in &mut self.active {
            if let Err(err) = filter.finish(&mut sink) {
                tracing::warn!(filter = filter.name(), error = %err, "filter finish failed");
            }
        }
    }

    /// Statistics of the active chain, falling back to the chain detached
    /// at disconnect.
    pub fn stats(&self) -> Vec<FilterStats> {
        let filters = if self.active.is_empty() {
            match &self.previous {
                Some(previous) => previous,
                None => &self.active,
            }
        } else {
            &self.active
        };
        filters.iter().filter_map(|f| f.stats()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingFilter {
        name: &'static str,
        seen: u64,
    }

    impl IoFilter for CountingFilter {
        fn name(&self) -> &str {
            self.name
        }

        fn filter_output(&mut self, input: &[u8], output: &mut BytesMut) -> Result<()> {
            self.seen += input.len() as u64;
            output.extend_from_slice(input);
            Ok(())
        }

        fn filter_input(&mut self, input: &[u8], output: &mut BytesMut) -> Result<()> {
            output.extend_from_slice(input);
            Ok(())
        }

        fn stats(&self) -> Option<FilterStats> {
            Some(FilterStats {
                name: self.name.to_string(),
                outbound_bytes_in: self.seen,
                outbound_bytes_out: self.seen,
                inbound_bytes_in: 0,
                inbound_bytes_out: 0,
            })
        }
    }

    #[test]
    fn test_add_front_orders_chain() {
        let mut chain = FilterChain::new();
        chain.add_front(Box::new(CountingFilter { name: "a", seen: 0 }));
        chain.add_front(Box::new(CountingFilter { name: "b", seen: 0 }));
        assert_eq!(chain.len(), 2);
        // "b" was installed later and sits at the front.
        assert!(chain.remove("b").is_some());
        assert_eq!(chain.len(), 1);
        assert!(chain.remove("b").is_none());
    }

    #[test]
    fn test_stats_fall_back_to_detached_chain() {
        let mut chain = FilterChain::new();
        let mut filter = CountingFilter { name: "zlib", seen: 0 };
        let mut out = BytesMut::new();
        filter.filter_output(b"hello", &mut out).unwrap();
        chain.add_front(Box::new(filter));

        chain.detach();
        assert!(chain.is_empty());
        let stats = chain.stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].name, "zlib");
        assert_eq!(stats[0].outbound_bytes_in, 5);

        // A second detach with no active filters clears the memory.
        chain.detach();
        assert!(chain.stats().is_empty());
    }
}
