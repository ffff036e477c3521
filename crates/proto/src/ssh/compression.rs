//! Payload compression (RFC 4253 Section 6.2).
//!
//! Compression is an opaque, stateful transform applied to packet payloads
//! before encryption. Each direction keeps one compression stream for the
//! lifetime of its keys, and every packet is flushed so the peer can
//! decompress it on its own.
//!
//! `zlib@openssh.com` behaves like `zlib` but is only switched on after
//! user authentication succeeds.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use skiff_platform::{SkiffError, SkiffResult};

/// Default zlib level, matching OpenSSH.
pub const DEFAULT_LEVEL: u32 = 6;

/// Factory for a named compression method.
pub trait CompressionProvider: Send + Sync {
    /// Algorithm name as negotiated in KEXINIT.
    fn name(&self) -> &'static str;

    /// Returns true for methods that activate only after authentication.
    fn is_delayed(&self) -> bool {
        false
    }

    /// Returns true for the identity transform.
    fn is_none(&self) -> bool {
        false
    }

    /// Creates the outgoing stream.
    fn compressor(&self, level: u32) -> Box<dyn Compressor>;

    /// Creates the incoming stream.
    fn decompressor(&self) -> Box<dyn Decompressor>;
}

/// Outgoing compression stream.
pub trait Compressor: Send {
    /// Compresses one payload. Always returns the complete output for the
    /// given input.
    fn compress(&mut self, data: &[u8]) -> SkiffResult<Vec<u8>>;
}

/// Incoming decompression stream.
pub trait Decompressor: Send {
    /// Decompresses one payload. Always returns the complete output for the
    /// given input or an error.
    fn decompress(&mut self, data: &[u8]) -> SkiffResult<Vec<u8>>;
}

/// The `none` method.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCompression;

struct Passthrough;

impl Compressor for Passthrough {
    fn compress(&mut self, data: &[u8]) -> SkiffResult<Vec<u8>> {
        Ok(data.to_vec())
    }
}

impl Decompressor for Passthrough {
    fn decompress(&mut self, data: &[u8]) -> SkiffResult<Vec<u8>> {
        Ok(data.to_vec())
    }
}

impl CompressionProvider for NoCompression {
    fn name(&self) -> &'static str {
        "none"
    }
    fn is_none(&self) -> bool {
        true
    }
    fn compressor(&self, _level: u32) -> Box<dyn Compressor> {
        Box::new(Passthrough)
    }
    fn decompressor(&self) -> Box<dyn Decompressor> {
        Box::new(Passthrough)
    }
}

/// `zlib` and `zlib@openssh.com`.
#[derive(Debug, Clone, Copy)]
pub struct Zlib {
    delayed: bool,
}

impl Zlib {
    /// Compression from the first packet after NEWKEYS.
    pub const IMMEDIATE: Zlib = Zlib { delayed: false };
    /// Compression from the first packet after authentication.
    pub const DELAYED: Zlib = Zlib { delayed: true };
}

impl CompressionProvider for Zlib {
    fn name(&self) -> &'static str {
        if self.delayed {
            "zlib@openssh.com"
        } else {
            "zlib"
        }
    }

    fn is_delayed(&self) -> bool {
        self.delayed
    }

    fn compressor(&self, level: u32) -> Box<dyn Compressor> {
        Box::new(ZlibCompressor {
            inner: Compress::new(Compression::new(level.min(9)), true),
        })
    }

    fn decompressor(&self) -> Box<dyn Decompressor> {
        Box::new(ZlibDecompressor {
            inner: Decompress::new(true),
        })
    }
}

const CHUNK: usize = 4096;

/// Largest payload a single packet may inflate to.
pub const MAX_INFLATED_SIZE: usize = crate::ssh::packet::PACKET_MAX_SIZE;

struct ZlibCompressor {
    inner: Compress,
}

impl Compressor for ZlibCompressor {
    fn compress(&mut self, data: &[u8]) -> SkiffResult<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() + 64);
        let mut consumed = 0usize;

        loop {
            if out.capacity() - out.len() < 64 {
                out.reserve(CHUNK);
            }
            let in_before = self.inner.total_in();
            let out_before = self.inner.total_out();

            self.inner
                .compress_vec(&data[consumed..], &mut out, FlushCompress::Partial)
                .map_err(|e| SkiffError::Protocol(format!("zlib compression failed: {}", e)))?;

            let used = (self.inner.total_in() - in_before) as usize;
            let produced = self.inner.total_out() - out_before;
            consumed += used;

            // The flush is complete once all input is consumed and zlib
            // stopped short of filling the output buffer.
            if consumed >= data.len() && out.len() < out.capacity() {
                break;
            }
            if used == 0 && produced == 0 && consumed >= data.len() {
                break;
            }
        }

        Ok(out)
    }
}

struct ZlibDecompressor {
    inner: Decompress,
}

impl Decompressor for ZlibDecompressor {
    fn decompress(&mut self, data: &[u8]) -> SkiffResult<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len().saturating_mul(2).max(CHUNK));
        let mut consumed = 0usize;

        loop {
            if out.capacity() - out.len() < CHUNK / 4 {
                // One byte past the limit is enough to detect an overrun.
                let room = MAX_INFLATED_SIZE + 1 - out.len();
                out.reserve_exact(out.capacity().max(CHUNK).min(room));
            }
            let in_before = self.inner.total_in();
            let out_before = self.inner.total_out();

            let status = self
                .inner
                .decompress_vec(&data[consumed..], &mut out, FlushDecompress::Sync)
                .map_err(|e| SkiffError::Protocol(format!("zlib decompression failed: {}", e)))?;
            if out.len() > MAX_INFLATED_SIZE {
                return Err(SkiffError::Protocol(format!(
                    "Decompressed payload exceeds {} bytes",
                    MAX_INFLATED_SIZE
                )));
            }

            let used = (self.inner.total_in() - in_before) as usize;
            let produced = self.inner.total_out() - out_before;
            consumed += used;

            if status == Status::StreamEnd {
                break;
            }
            if consumed >= data.len() && out.len() < out.capacity() {
                break;
            }
            if used == 0 && produced == 0 {
                if consumed >= data.len() {
                    break;
                }
                return Err(SkiffError::Protocol(
                    "zlib decompression made no progress".to_string(),
                ));
            }
        }

        Ok(out)
    }
}
