//! The `zlib` compression method.
//!
//! Streaming deflate with a sync flush after every output call, so each
//! negotiation element or stanza becomes decodable by the peer as soon as
//! it is written. State is kept across calls; the deflate dictionary
//! spans the whole stream, which is where the compression win on
//! repetitive stanza traffic comes from.

use bytes::BytesMut;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};

use super::CompressionFactory;
use crate::error::{C2sError, Result};
use crate::transport::{FilterStats, IoFilter};

const CHUNK_SIZE: usize = 4096;

/// Factory for [`ZlibFilter`].
pub struct ZlibCompressionFactory;

impl CompressionFactory for ZlibCompressionFactory {
    fn method(&self) -> &'static str {
        "zlib"
    }

    fn fabricate(&self) -> Box<dyn IoFilter> {
        Box::new(ZlibFilter::new())
    }
}

/// Deflate filter for one compressed stream.
pub struct ZlibFilter {
    compressor: Compress,
    decompressor: Decompress,
}

impl ZlibFilter {
    /// Create a filter with default compression level.
    pub fn new() -> Self {
        Self {
            compressor: Compress::new(Compression::default(), true),
            decompressor: Decompress::new(true),
        }
    }
}

impl Default for ZlibFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl IoFilter for ZlibFilter {
    fn name(&self) -> &str {
        "zlib"
    }

    fn filter_output(&mut self, input: &[u8], output: &mut BytesMut) -> Result<()> {
        let mut consumed = 0;
        loop {
            let before_in = self.compressor.total_in();
            let before_out = self.compressor.total_out();
            let mut chunk = [0u8; CHUNK_SIZE];

            self.compressor
                .compress(&input[consumed..], &mut chunk, FlushCompress::Sync)
                .map_err(|e| C2sError::Compression(e.to_string()))?;

            let consumed_now = (self.compressor.total_in() - before_in) as usize;
            let produced = (self.compressor.total_out() - before_out) as usize;
            consumed += consumed_now;
            output.extend_from_slice(&chunk[..produced]);

            if consumed >= input.len() && produced < CHUNK_SIZE {
                return Ok(());
            }
            if consumed_now == 0 && produced == 0 {
                return Err(C2sError::Compression(
                    "deflate made no progress".to_string(),
                ));
            }
        }
    }

    fn filter_input(&mut self, input: &[u8], output: &mut BytesMut) -> Result<()> {
        let mut consumed = 0;
        loop {
            let before_in = self.decompressor.total_in();
            let before_out = self.decompressor.total_out();
            let mut chunk = [0u8; CHUNK_SIZE];

            self.decompressor
                .decompress(&input[consumed..], &mut chunk, FlushDecompress::Sync)
                .map_err(|e| C2sError::Compression(e.to_string()))?;

            let consumed_now = (self.decompressor.total_in() - before_in) as usize;
            let produced = (self.decompressor.total_out() - before_out) as usize;
            consumed += consumed_now;
            output.extend_from_slice(&chunk[..produced]);

            if consumed >= input.len() && produced < CHUNK_SIZE {
                return Ok(());
            }
            if consumed_now == 0 && produced == 0 {
                return Err(C2sError::Compression(
                    "inflate made no progress".to_string(),
                ));
            }
        }
    }

    fn finish(&mut self, output: &mut BytesMut) -> Result<()> {
        loop {
            let before_out = self.compressor.total_out();
            let mut chunk = [0u8; CHUNK_SIZE];

            let status = self
                .compressor
                .compress(&[], &mut chunk, FlushCompress::Finish)
                .map_err(|e| C2sError::Compression(e.to_string()))?;

            let produced = (self.compressor.total_out() - before_out) as usize;
            output.extend_from_slice(&chunk[..produced]);

            if matches!(status, flate2::Status::StreamEnd) || produced < CHUNK_SIZE {
                return Ok(());
            }
        }
    }

    fn stats(&self) -> Option<FilterStats> {
        Some(FilterStats {
            name: "zlib".to_string(),
            outbound_bytes_in: self.compressor.total_in(),
            outbound_bytes_out: self.compressor.total_out(),
            inbound_bytes_in: self.decompressor.total_in(),
            inbound_bytes_out: self.decompressor.total_out(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mut sender = ZlibFilter::new();
        let mut receiver = ZlibFilter::new();

        let element = b"<message to='alice@example.org'><body>ping</body></message>";
        let mut compressed = BytesMut::new();
        sender.filter_output(element, &mut compressed).unwrap();
        assert!(!compressed.is_empty());

        let mut decompressed = BytesMut::new();
        receiver
            .filter_input(&compressed, &mut decompressed)
            .unwrap();
        assert_eq!(&decompressed[..], element);
    }

    #[test]
    fn test_dictionary_spans_stream() {
        let mut sender = ZlibFilter::new();
        let mut receiver = ZlibFilter::new();
        let element = b"<presence from='bob@example.org/laptop'/>";

        let mut sizes = Vec::new();
        for _ in 0..3 {
            let mut compressed = BytesMut::new();
            sender.filter_output(element, &mut compressed).unwrap();
            sizes.push(compressed.len());

            let mut decompressed = BytesMut::new();
            receiver
                .filter_input(&compressed, &mut decompressed)
                .unwrap();
            assert_eq!(&decompressed[..], element);
        }

        // Repeats compress better than the first occurrence.
        assert!(sizes[2] < sizes[0]);
    }

    #[test]
    fn test_stats_track_byte_counts() {
        let mut filter = ZlibFilter::new();
        let mut out = BytesMut::new();
        filter.filter_output(b"aaaaaaaaaaaaaaaa", &mut out).unwrap();

        let stats = filter.stats().unwrap();
        assert_eq!(stats.name, "zlib");
        assert_eq!(stats.outbound_bytes_in, 16);
        assert_eq!(stats.outbound_bytes_out, out.len() as u64);
        assert_eq!(stats.inbound_bytes_in, 0);
    }

    #[test]
    fn test_garbage_input_is_an_error() {
        let mut filter = ZlibFilter::new();
        let mut out = BytesMut::new();
        let err = filter
            .filter_input(b"definitely not deflate data", &mut out)
            .unwrap_err();
        assert!(matches!(err, C2sError::Compression(_)));
    }
}
