//! Wire codec shared by every persisted artifact.
//!
//! ```text
//! ┌─────────┬────────────────────┬───────────────────────────────────────┐
//! │  MAGIC  │ HEADER (framed)    │ BODY (compressed, framed messages)    │
//! │ u32 LE  │ algorithm, quality │ LEN u32 LE │ bincode │ LEN │ ... │   │
//! └─────────┴────────────────────┴───────────────────────────────────────┘
//! ```
//!
//! The magic is checked before anything else. The header is never
//! compressed; it names the decompressor for the rest of the stream. Readers
//! only ever move forward.

use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::compression::{CompressionAlgorithm, CompressionSettings, Decoder, Encoder};
use crate::error::{Result, SuturaError};

/// Magic number of patch artifacts.
pub const PATCH_MAGIC: u32 = 0x0FEF_5F00;

/// Magic number of signature artifacts.
pub const SIGNATURE_MAGIC: u32 = PATCH_MAGIC + 1;

/// Magic number of manifest artifacts.
pub const MANIFEST_MAGIC: u32 = PATCH_MAGIC + 2;

/// Magic number of wounds artifacts.
pub const WOUNDS_MAGIC: u32 = PATCH_MAGIC + 3;

/// Maximum serialized size of one message (16 MB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Uncompressed header following the magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct WireHeader {
    algorithm: u8,
    quality: i32,
}

/// Header variant for artifacts keyed by content hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct HashedHeader {
    algorithm: u8,
    quality: i32,
    hash_algorithm: u8,
}

fn write_frame<W: Write, T: Serialize>(
    writer: &mut W,
    scratch: &mut Vec<u8>,
    message: &T,
) -> Result<()> {
    scratch.clear();
    bincode::serialize_into(&mut *scratch, message)?;
    let len = u32::try_from(scratch.len())
        .ok()
        .filter(|len| *len <= MAX_MESSAGE_SIZE)
        .ok_or_else(|| {
            SuturaError::Encoding(format!(
                "message exceeds maximum size: {} > {MAX_MESSAGE_SIZE}",
                scratch.len()
            ))
        })?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(scratch)?;
    Ok(())
}

/// Read a length prefix. `None` means the stream ended cleanly before it.
fn read_len<R: Read>(reader: &mut R) -> Result<Option<u32>> {
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            // some decoders report a cut stream as an error rather than an early end
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(SuturaError::Truncated("compressed stream".to_string()))
            }
            Err(err) => return Err(err.into()),
        }
    }
    match filled {
        0 => Ok(None),
        4 => Ok(Some(u32::from_le_bytes(buf))),
        _ => Err(SuturaError::Truncated("partial message length".to_string())),
    }
}

fn read_frame<R: Read, T: DeserializeOwned>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> Result<Option<T>> {
    let Some(len) = read_len(reader)? else {
        return Ok(None);
    };
    if len > MAX_MESSAGE_SIZE {
        return Err(SuturaError::Malformed(format!(
            "message length {len} exceeds maximum {MAX_MESSAGE_SIZE}"
        )));
    }
    buf.resize(len as usize, 0);
    reader
        .read_exact(buf.as_mut_slice())
        .map_err(|err| match err.kind() {
            io::ErrorKind::UnexpectedEof => {
                SuturaError::Truncated(format!("message of {len} bytes"))
            }
            _ => SuturaError::Io(err),
        })?;
    Ok(Some(bincode::deserialize(buf.as_slice())?))
}

/// Writes one artifact: magic, header, then compressed messages.
pub struct WireWriter<W: Write> {
    inner: Encoder<W>,
    scratch: Vec<u8>,
}

impl<W: Write> WireWriter<W> {
    /// Start an artifact identified by `magic`.
    ///
    /// # Errors
    ///
    /// Returns an error if the preamble cannot be written or the compressor
    /// cannot be initialized.
    pub fn new(inner: W, magic: u32, compression: CompressionSettings) -> Result<Self> {
        Self::start(inner, magic, compression, None)
    }

    /// Start an artifact whose header also names the content hash
    /// algorithm.
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    pub fn with_hash_algorithm(
        inner: W,
        magic: u32,
        compression: CompressionSettings,
        hash_algorithm: u8,
    ) -> Result<Self> {
        Self::start(inner, magic, compression, Some(hash_algorithm))
    }

    fn start(
        mut inner: W,
        magic: u32,
        compression: CompressionSettings,
        hash_algorithm: Option<u8>,
    ) -> Result<Self> {
        let mut scratch = Vec::with_capacity(4096);
        inner.write_all(&magic.to_le_bytes())?;
        let algorithm = compression.algorithm as u8;
        match hash_algorithm {
            None => write_frame(
                &mut inner,
                &mut scratch,
                &WireHeader {
                    algorithm,
                    quality: compression.quality,
                },
            )?,
            Some(hash_algorithm) => write_frame(
                &mut inner,
                &mut scratch,
                &HashedHeader {
                    algorithm,
                    quality: compression.quality,
                    hash_algorithm,
                },
            )?,
        }
        trace!(magic, %compression, "opened artifact for writing");
        Ok(Self {
            inner: Encoder::new(inner, compression)?,
            scratch,
        })
    }

    /// Append one message.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the underlying write fails.
    pub fn write_message<T: Serialize>(&mut self, message: &T) -> Result<()> {
        write_frame(&mut self.inner, &mut self.scratch, message)
    }

    /// Terminate compression and return the underlying writer.
    ///
    /// # Errors
    ///
    /// Returns an error if the compressed trailer cannot be written.
    pub fn finish(self) -> Result<W> {
        self.inner.finish()
    }
}

/// Reads one artifact written by [`WireWriter`].
pub struct WireReader<R: Read> {
    inner: Decoder<R>,
    buf: Vec<u8>,
    compression: CompressionSettings,
}

impl<R: Read> WireReader<R> {
    /// Open an artifact, checking that it starts with `magic`.
    ///
    /// # Errors
    ///
    /// Returns `UnrecognizedFormat` on a magic mismatch, `UnknownCompression`
    /// if the header names an unregistered algorithm, and `Truncated` if the
    /// preamble is incomplete.
    pub fn open(inner: R, magic: u32) -> Result<Self> {
        Ok(Self::start(inner, magic, false)?.0)
    }

    /// Open an artifact written by [`WireWriter::with_hash_algorithm`],
    /// returning the hash algorithm id as well.
    ///
    /// # Errors
    ///
    /// Same as [`open`](Self::open).
    pub fn open_hashed(inner: R, magic: u32) -> Result<(Self, u8)> {
        let (reader, hash_algorithm) = Self::start(inner, magic, true)?;
        Ok((reader, hash_algorithm.unwrap_or_default()))
    }

    fn start(mut inner: R, magic: u32, hashed: bool) -> Result<(Self, Option<u8>)> {
        let mut raw = [0u8; 4];
        inner.read_exact(&mut raw).map_err(|err| match err.kind() {
            io::ErrorKind::UnexpectedEof => SuturaError::Truncated("magic number".to_string()),
            _ => SuturaError::Io(err),
        })?;
        let actual = u32::from_le_bytes(raw);
        if actual != magic {
            return Err(SuturaError::UnrecognizedFormat {
                expected: magic,
                actual,
            });
        }

        let mut buf = Vec::with_capacity(4096);
        let (algorithm, quality, hash_algorithm) = if hashed {
            let header: HashedHeader = read_frame(&mut inner, &mut buf)?
                .ok_or_else(|| SuturaError::Truncated("artifact header".to_string()))?;
            (header.algorithm, header.quality, Some(header.hash_algorithm))
        } else {
            let header: WireHeader = read_frame(&mut inner, &mut buf)?
                .ok_or_else(|| SuturaError::Truncated("artifact header".to_string()))?;
            (header.algorithm, header.quality, None)
        };
        let compression =
            CompressionSettings::new(CompressionAlgorithm::from_u8(algorithm)?, quality);

        let reader = Self {
            inner: Decoder::new(inner, compression.algorithm)?,
            buf,
            compression,
        };
        Ok((reader, hash_algorithm))
    }

    /// Compression the artifact was written with.
    #[must_use]
    pub const fn compression(&self) -> CompressionSettings {
        self.compression
    }

    /// Read the next message, which must exist.
    ///
    /// # Errors
    ///
    /// Returns `Truncated` (mentioning `what`) if the stream ends first.
    pub fn read_message<T: DeserializeOwned>(&mut self, what: &str) -> Result<T> {
        self.try_read_message()?
            .ok_or_else(|| SuturaError::Truncated(format!("expected {what}")))
    }

    /// Read the next message, or `None` if the stream ended cleanly.
    ///
    /// # Errors
    ///
    /// Returns an error on partial or undecodable messages.
    pub fn try_read_message<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        read_frame(&mut self.inner, &mut self.buf)
    }
}
