//! Stream compression factories (XEP-0138).
//!
//! A factory pairs a method name with the ability to fabricate the
//! input/output filter implementing it. The compression state picks the
//! first registered factory whose method the server advertises and
//! installs the fabricated filter at the front of the chain once the
//! server acknowledges the compress request.
//!
//! `zlib` is the method every implementation is required to support and
//! the one registered by default.

pub mod zlib;

use crate::transport::IoFilter;

pub use zlib::{ZlibCompressionFactory, ZlibFilter};

/// Factory for one compression method.
pub trait CompressionFactory: Send + Sync {
    /// Method name as used in feature advertisements, e.g. `zlib`.
    fn method(&self) -> &'static str;

    /// Fabricate a fresh filter for one compressed stream.
    fn fabricate(&self) -> Box<dyn IoFilter>;
}

/// Pick the first registered factory whose method the server advertises.
pub fn best_factory<'a>(
    factories: &'a [Box<dyn CompressionFactory>],
    advertised: &[String],
) -> Option<&'a dyn CompressionFactory> {
    factories
        .iter()
        .find(|factory| advertised.iter().any(|method| method == factory.method()))
        .map(Box::as_ref)
}
