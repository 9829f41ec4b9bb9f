//! Remote block-sync: trees stored as content-addressed big blocks.
//!
//! Files are cut into big blocks (megabytes, a multiple of
//! [`BLOCK_SIZE`]). A [`BlockSource`] hands out big blocks of an old tree, a
//! [`BlockSink`] receives big blocks of a new one. Decorators stack on
//! either side: filtering, latency, fan-out, validation. [`BlockPool`] and
//! [`BlockWritePool`] adapt them to the regular pool interfaces so the
//! apply engine can run against a block store without a local tree.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::container::Container;
use crate::error::{Result, SuturaError};
use crate::pool::{Pool, PoolWriter, ReadSeek, WritablePool};
use crate::signature::{BlockHash, Signature, BLOCK_SIZE};

pub mod compose;
pub mod fanout;
pub mod filter;
pub mod latency;
pub mod manifest;
pub mod remote;
pub mod store;

pub use compose::{compose, BlockPlan, Composition, Origin};
pub use fanout::FanOutSink;
pub use filter::{BlockFilter, FilteringSink, FilteringSource};
pub use latency::{LatencySink, LatencySource};
pub use manifest::{read_manifest, write_manifest, BlockHashMap, Manifest};
pub use remote::{apply_remote, upload_tree, RemoteOptions, RemoteOutcome, RemoteStats};
pub use store::{BlockAddress, BlockTransport, DiskStore, MemoryStore, StoreSink, StoreSource};

/// Default big block size (4 MiB).
pub const DEFAULT_BIG_BLOCK_SIZE: u64 = 4 * 1024 * 1024;

/// A big block: file index plus big block index within that file.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct BlockLocation {
    /// File index in the container.
    pub file_index: u64,
    /// Big block index within the file.
    pub block_index: u64,
}

impl BlockLocation {
    /// Location of big block `block_index` of file `file_index`.
    #[must_use]
    pub const fn new(file_index: u64, block_index: u64) -> Self {
        Self {
            file_index,
            block_index,
        }
    }
}

/// Number of big blocks of a file of `size` bytes.
#[must_use]
pub const fn num_big_blocks(size: u64, big_block_size: u64) -> u64 {
    size.div_ceil(big_block_size)
}

/// Length of big block `index` of a file of `size` bytes. Zero past the end.
#[must_use]
pub const fn big_block_len(size: u64, index: u64, big_block_size: u64) -> u64 {
    let start = index * big_block_size;
    if start >= size {
        0
    } else if size - start < big_block_size {
        size - start
    } else {
        big_block_size
    }
}

/// Check that `big_block_size` is a non-zero multiple of [`BLOCK_SIZE`].
///
/// # Errors
///
/// Returns a `Usage` error otherwise.
pub fn check_big_block_size(big_block_size: u64) -> Result<()> {
    if big_block_size == 0 || big_block_size % BLOCK_SIZE as u64 != 0 {
        return Err(SuturaError::Usage(format!(
            "big block size {big_block_size} is not a multiple of {BLOCK_SIZE}"
        )));
    }
    Ok(())
}

/// Length a stored block at `location` must have.
pub(crate) fn expected_len(
    container: &Container,
    location: BlockLocation,
    big_block_size: u64,
) -> Result<u64> {
    let file = usize::try_from(location.file_index)
        .ok()
        .and_then(|i| container.files.get(i))
        .ok_or_else(|| {
            SuturaError::Malformed(format!("block {location:?} refers to a missing file"))
        })?;
    match big_block_len(file.size, location.block_index, big_block_size) {
        0 => Err(SuturaError::Malformed(format!(
            "block {location:?} is past the end of {}",
            file.path
        ))),
        len => Ok(len),
    }
}

/// Provides big blocks of a container.
pub trait BlockSource: Send {
    /// Fetch the big block at `location`.
    ///
    /// # Errors
    ///
    /// Returns an error if the block cannot be obtained.
    fn fetch(&mut self, location: BlockLocation) -> Result<Vec<u8>>;

    /// The container the blocks belong to.
    fn container(&self) -> &Container;

    /// Big block size of this source.
    fn big_block_size(&self) -> u64;
}

/// Receives big blocks of a container.
pub trait BlockSink: Send {
    /// Store the big block at `location`.
    ///
    /// # Errors
    ///
    /// Returns an error if the block cannot be stored.
    fn store(&mut self, location: BlockLocation, data: &[u8]) -> Result<()>;

    /// The container the blocks belong to.
    fn container(&self) -> &Container;

    /// Big block size of this sink.
    fn big_block_size(&self) -> u64;

    /// An independent sink writing to the same place, for parallel workers.
    fn clone_sink(&self) -> Box<dyn BlockSink>;

    /// Wait until everything stored so far has landed.
    ///
    /// # Errors
    ///
    /// Returns the first error of a deferred store.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

fn into_io(err: SuturaError) -> io::Error {
    match err {
        SuturaError::Io(err) => err,
        other => io::Error::other(other),
    }
}

// =============================================================================
// READ SIDE
// =============================================================================

struct BlockFileReader {
    source: Box<dyn BlockSource>,
    file_index: Option<usize>,
    size: u64,
    pos: u64,
    cached: Option<(u64, Vec<u8>)>,
}

impl BlockFileReader {
    fn select(&mut self, file_index: usize) -> Result<()> {
        let size = self
            .source
            .container()
            .files
            .get(file_index)
            .map(|f| f.size)
            .ok_or_else(|| {
                SuturaError::Malformed(format!("block pool has no file {file_index}"))
            })?;
        if self.file_index != Some(file_index) {
            self.cached = None;
        }
        self.file_index = Some(file_index);
        self.size = size;
        self.pos = 0;
        Ok(())
    }

    fn block(&mut self, file_index: usize, block_index: u64) -> Result<&[u8]> {
        let hit = matches!(&self.cached, Some((index, _)) if *index == block_index);
        if !hit {
            let big = self.source.big_block_size();
            let location = BlockLocation::new(file_index as u64, block_index);
            trace!(?location, "fetching block");
            let data = self.source.fetch(location)?;
            let want = big_block_len(self.size, block_index, big);
            if data.len() as u64 != want {
                return Err(SuturaError::Malformed(format!(
                    "block {location:?} has {} bytes, expected {want}",
                    data.len()
                )));
            }
            self.cached = Some((block_index, data));
        }
        Ok(self.cached.as_ref().map_or(&[], |(_, data)| data.as_slice()))
    }
}

impl Read for BlockFileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(file_index) = self.file_index else {
            return Ok(0);
        };
        if self.pos >= self.size || buf.is_empty() {
            return Ok(0);
        }
        let big = self.source.big_block_size();
        let block_index = self.pos / big;
        #[allow(clippy::cast_possible_truncation)]
        let within = (self.pos - block_index * big) as usize;
        let block = self.block(file_index, block_index).map_err(into_io)?;
        let n = buf.len().min(block.len() - within);
        buf[..n].copy_from_slice(&block[within..within + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for BlockFileReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.size.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of block file")
        })?;
        self.pos = target;
        Ok(target)
    }
}

/// Read-only [`Pool`] over a [`BlockSource`].
pub struct BlockPool {
    reader: BlockFileReader,
}

impl BlockPool {
    /// Serve the files of `source`'s container from its blocks.
    #[must_use]
    pub fn new(source: Box<dyn BlockSource>) -> Self {
        Self {
            reader: BlockFileReader {
                source,
                file_index: None,
                size: 0,
                pos: 0,
                cached: None,
            },
        }
    }
}

impl Pool for BlockPool {
    fn reader(&mut self, file_index: usize) -> Result<&mut dyn Read> {
        self.reader.select(file_index)?;
        Ok(&mut self.reader)
    }

    fn seekable_reader(&mut self, file_index: usize) -> Result<&mut dyn ReadSeek> {
        if self.reader.file_index != Some(file_index) {
            self.reader.select(file_index)?;
        }
        Ok(&mut self.reader)
    }

    fn size(&self, file_index: usize) -> u64 {
        self.reader
            .source
            .container()
            .files
            .get(file_index)
            .map_or(0, |f| f.size)
    }

    fn close(&mut self) -> Result<()> {
        self.reader.cached = None;
        self.reader.file_index = None;
        Ok(())
    }
}

// =============================================================================
// WRITE SIDE
// =============================================================================

/// [`WritablePool`] that cuts every file into big blocks for a [`BlockSink`].
pub struct BlockWritePool {
    sink: Box<dyn BlockSink>,
}

impl BlockWritePool {
    /// Write into `sink`.
    #[must_use]
    pub fn new(sink: Box<dyn BlockSink>) -> Self {
        Self { sink }
    }

    /// Flush the sink and hand it back.
    ///
    /// # Errors
    ///
    /// Returns the first deferred store error.
    pub fn finish(mut self) -> Result<Box<dyn BlockSink>> {
        self.sink.flush()?;
        Ok(self.sink)
    }
}

impl WritablePool for BlockWritePool {
    fn writer(&mut self, file_index: usize) -> Result<Box<dyn PoolWriter + '_>> {
        if file_index >= self.sink.container().files.len() {
            return Err(SuturaError::Malformed(format!(
                "block sink has no file {file_index}"
            )));
        }
        let big = usize::try_from(self.sink.big_block_size()).unwrap_or(usize::MAX);
        Ok(Box::new(BlockWriter {
            sink: self.sink.as_mut(),
            file_index: file_index as u64,
            block_index: 0,
            buf: Vec::with_capacity(big.min(DEFAULT_BIG_BLOCK_SIZE as usize)),
            big,
        }))
    }
}

struct BlockWriter<'a> {
    sink: &'a mut dyn BlockSink,
    file_index: u64,
    block_index: u64,
    buf: Vec<u8>,
    big: usize,
}

impl BlockWriter<'_> {
    fn store_front(&mut self, len: usize) -> Result<()> {
        let location = BlockLocation::new(self.file_index, self.block_index);
        self.sink.store(location, &self.buf[..len])?;
        self.buf.drain(..len);
        self.block_index += 1;
        Ok(())
    }
}

impl Write for BlockWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        while self.buf.len() >= self.big {
            self.store_front(self.big).map_err(into_io)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl PoolWriter for BlockWriter<'_> {
    fn finish(mut self: Box<Self>) -> Result<()> {
        if !self.buf.is_empty() {
            let len = self.buf.len();
            self.store_front(len)?;
        }
        Ok(())
    }
}

// =============================================================================
// VALIDATION
// =============================================================================

/// Sink that checks every big block against the fine block hashes of a
/// signature before passing it on.
pub struct ValidatingSink {
    inner: Box<dyn BlockSink>,
    signature: Arc<Signature>,
    files: Arc<Vec<Option<usize>>>,
}

impl ValidatingSink {
    /// Check blocks stored into `inner` against `signature`. Files are
    /// matched by path and size.
    #[must_use]
    pub fn new(inner: Box<dyn BlockSink>, signature: Arc<Signature>) -> Self {
        let by_path = signature.container.file_index_by_path();
        let files = inner
            .container()
            .files
            .iter()
            .map(|file| {
                by_path
                    .get(file.path.as_str())
                    .copied()
                    .filter(|&i| signature.container.files[i].size == file.size)
            })
            .collect();
        Self {
            inner,
            signature,
            files: Arc::new(files),
        }
    }
}

impl BlockSink for ValidatingSink {
    fn store(&mut self, location: BlockLocation, data: &[u8]) -> Result<()> {
        let big = self.inner.big_block_size();
        let container = self.inner.container();
        let want = expected_len(container, location, big)?;
        #[allow(clippy::cast_possible_truncation)]
        let file = &container.files[location.file_index as usize];
        let hashes = usize::try_from(location.file_index)
            .ok()
            .and_then(|i| self.files.get(i).copied().flatten())
            .map(|i| self.signature.file_hashes(i))
            .ok_or_else(|| {
                SuturaError::Malformed(format!("{} is not covered by the signature", file.path))
            })?;

        let per_big = big / BLOCK_SIZE as u64;
        let first = location.block_index * per_big;
        let base = location.block_index * big;
        let corrupt = |offset: u64, len: usize| SuturaError::Integrity {
            path: file.path.clone(),
            start: base + offset,
            end: base + offset + len as u64,
        };
        if data.len() as u64 != want {
            return Err(corrupt(0, data.len()));
        }
        for (k, chunk) in data.chunks(BLOCK_SIZE).enumerate() {
            let expected = usize::try_from(first + k as u64)
                .ok()
                .and_then(|i| hashes.get(i));
            if expected != Some(&BlockHash::compute(chunk)) {
                return Err(corrupt((k * BLOCK_SIZE) as u64, chunk.len()));
            }
        }
        self.inner.store(location, data)
    }

    fn container(&self) -> &Container {
        self.inner.container()
    }

    fn big_block_size(&self) -> u64 {
        self.inner.big_block_size()
    }

    fn clone_sink(&self) -> Box<dyn BlockSink> {
        Box::new(Self {
            inner: self.inner.clone_sink(),
            signature: Arc::clone(&self.signature),
            files: Arc::clone(&self.files),
        })
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }
}
