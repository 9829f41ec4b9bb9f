//! Compression registry for the wire codec.
//!
//! Every artifact names its compression algorithm and quality in its header.
//! Everything after the header flows through the matching compressor.

use std::io::{self, BufReader, Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SuturaError};

const BROTLI_BUFFER_SIZE: usize = 64 * 1024;
const BROTLI_WINDOW_BITS: u32 = 22;

/// Compression algorithms known to this build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CompressionAlgorithm {
    /// Bytes pass through unchanged.
    None = 0,
    /// Brotli, quality 0 to 11.
    Brotli = 1,
    /// Zstandard, quality 1 to 22.
    Zstd = 2,
    /// Gzip, quality 0 to 9.
    Gzip = 3,
}

impl CompressionAlgorithm {
    /// Convert from the wire identifier.
    ///
    /// # Errors
    ///
    /// Returns `UnknownCompression` if the identifier is not registered.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Brotli),
            2 => Ok(Self::Zstd),
            3 => Ok(Self::Gzip),
            other => Err(SuturaError::UnknownCompression(other)),
        }
    }

    /// Short lowercase name, as accepted by [`from_name`](Self::from_name).
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Brotli => "brotli",
            Self::Zstd => "zstd",
            Self::Gzip => "gzip",
        }
    }

    /// Parse a name such as `"zstd"`.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "none" => Some(Self::None),
            "brotli" => Some(Self::Brotli),
            "zstd" => Some(Self::Zstd),
            "gzip" => Some(Self::Gzip),
            _ => None,
        }
    }

    /// Valid quality range, inclusive.
    #[must_use]
    pub const fn quality_range(self) -> (i32, i32) {
        match self {
            Self::None => (0, 0),
            Self::Brotli => (0, 11),
            Self::Zstd => (1, 22),
            Self::Gzip => (0, 9),
        }
    }
}

/// Compression algorithm plus quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionSettings {
    /// Algorithm.
    pub algorithm: CompressionAlgorithm,
    /// Algorithm-specific quality, clamped into range when used.
    pub quality: i32,
}

impl CompressionSettings {
    /// Create settings for `algorithm` at `quality`.
    #[must_use]
    pub const fn new(algorithm: CompressionAlgorithm, quality: i32) -> Self {
        Self { algorithm, quality }
    }

    /// No compression.
    #[must_use]
    pub const fn none() -> Self {
        Self::new(CompressionAlgorithm::None, 0)
    }

    fn clamped_quality(self) -> i32 {
        let (low, high) = self.algorithm.quality_range();
        self.quality.clamp(low, high)
    }
}

impl Default for CompressionSettings {
    /// Fast brotli: patches are written once per build and are dominated by
    /// incompressible fresh data.
    fn default() -> Self {
        Self::new(CompressionAlgorithm::Brotli, 1)
    }
}

impl std::fmt::Display for CompressionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-q{}", self.algorithm.name(), self.quality)
    }
}

/// Compressing writer for one of the registered algorithms.
pub enum Encoder<W: Write> {
    /// Pass-through.
    None(W),
    /// Brotli stream.
    Brotli(Box<brotli::CompressorWriter<W>>),
    /// Zstandard stream.
    Zstd(zstd::stream::write::Encoder<'static, W>),
    /// Gzip stream.
    Gzip(flate2::write::GzEncoder<W>),
}

impl<W: Write> Encoder<W> {
    /// Wrap `inner` with the compressor selected by `settings`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the compressor cannot be initialized.
    #[allow(clippy::cast_sign_loss)]
    pub fn new(inner: W, settings: CompressionSettings) -> Result<Self> {
        let quality = settings.clamped_quality();
        Ok(match settings.algorithm {
            CompressionAlgorithm::None => Self::None(inner),
            CompressionAlgorithm::Brotli => Self::Brotli(Box::new(brotli::CompressorWriter::new(
                inner,
                BROTLI_BUFFER_SIZE,
                quality as u32,
                BROTLI_WINDOW_BITS,
            ))),
            CompressionAlgorithm::Zstd => {
                Self::Zstd(zstd::stream::write::Encoder::new(inner, quality)?)
            }
            CompressionAlgorithm::Gzip => Self::Gzip(flate2::write::GzEncoder::new(
                inner,
                flate2::Compression::new(quality as u32),
            )),
        })
    }

    /// Terminate the compressed stream and return the inner writer.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the trailing compressed bytes cannot be written.
    pub fn finish(self) -> Result<W> {
        Ok(match self {
            Self::None(mut inner) => {
                inner.flush()?;
                inner
            }
            Self::Brotli(mut writer) => {
                writer.flush()?;
                writer.into_inner()
            }
            Self::Zstd(encoder) => encoder.finish()?,
            Self::Gzip(encoder) => encoder.finish()?,
        })
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::None(w) => w.write(buf),
            Self::Brotli(w) => w.write(buf),
            Self::Zstd(w) => w.write(buf),
            Self::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::None(w) => w.flush(),
            Self::Brotli(w) => w.flush(),
            Self::Zstd(w) => w.flush(),
            Self::Gzip(w) => w.flush(),
        }
    }
}

/// Decompressing reader for one of the registered algorithms.
pub enum Decoder<R: Read> {
    /// Pass-through, buffered.
    None(BufReader<R>),
    /// Brotli stream.
    Brotli(Box<brotli::Decompressor<R>>),
    /// Zstandard stream.
    Zstd(zstd::stream::read::Decoder<'static, BufReader<R>>),
    /// Gzip stream.
    Gzip(flate2::read::GzDecoder<R>),
}

impl<R: Read> Decoder<R> {
    /// Wrap `inner` with the decompressor for `algorithm`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the decompressor cannot be initialized.
    pub fn new(inner: R, algorithm: CompressionAlgorithm) -> Result<Self> {
        Ok(match algorithm {
            CompressionAlgorithm::None => Self::None(BufReader::new(inner)),
            CompressionAlgorithm::Brotli => Self::Brotli(Box::new(brotli::Decompressor::new(
                inner,
                BROTLI_BUFFER_SIZE,
            ))),
            CompressionAlgorithm::Zstd => Self::Zstd(zstd::stream::read::Decoder::new(inner)?),
            CompressionAlgorithm::Gzip => Self::Gzip(flate2::read::GzDecoder::new(inner)),
        })
    }
}

impl<R: Read> Read for Decoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::None(r) => r.read(buf),
            Self::Brotli(r) => r.read(buf),
            Self::Zstd(r) => r.read(buf),
            Self::Gzip(r) => r.read(buf),
        }
    }
}
