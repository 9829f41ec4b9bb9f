//! Pools: byte access to a container's files, by index.
//!
//! A pool keeps at most one reader open. Asking again for the same index
//! reuses it, asking for another index closes it first. This matches how
//! every engine in this crate walks files: in container order, one at a time.

use std::fs;
use std::io::{self, BufReader, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::archive::Archive;
use crate::container::{native_path, normalize_archive_name, set_mode, Container};
use crate::error::{Result, SuturaError};

const READ_BUFFER_SIZE: usize = 256 * 1024;

/// Most bytes reserved up front for a file read whole into memory.
const MAX_PRESIZE: u64 = 64 * 1024 * 1024;

/// A seekable byte stream.
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// Read access to the files of one container.
pub trait Pool: Send {
    /// Reader positioned at the start of file `file_index`.
    ///
    /// # Errors
    ///
    /// Returns an error if the index is out of range or the file cannot be
    /// opened.
    fn reader(&mut self, file_index: usize) -> Result<&mut dyn Read>;

    /// Seekable reader for file `file_index`. Its position is unspecified;
    /// callers seek before reading.
    ///
    /// # Errors
    ///
    /// Returns an error if the index is out of range or the file cannot be
    /// opened.
    fn seekable_reader(&mut self, file_index: usize) -> Result<&mut dyn ReadSeek>;

    /// Size of file `file_index` according to the container.
    fn size(&self, file_index: usize) -> u64;

    /// Release the cached reader. Calling it twice is harmless.
    ///
    /// # Errors
    ///
    /// Implementations backed by remote resources may fail to release them.
    fn close(&mut self) -> Result<()>;
}

/// Output side of a file being written into a pool.
pub trait PoolWriter: Write + Send {
    /// Flush and commit the file.
    ///
    /// # Errors
    ///
    /// Returns an error if buffered data cannot be written out.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Write access to the files of one container.
pub trait WritablePool {
    /// Create (or truncate) file `file_index` and return a writer for it.
    ///
    /// # Errors
    ///
    /// Returns an error if the index is out of range or the file cannot be
    /// created.
    fn writer(&mut self, file_index: usize) -> Result<Box<dyn PoolWriter + '_>>;
}

/// Capacity to reserve for a file whose recorded size is `size`. Recorded
/// sizes may come from an untrusted artifact.
pub(crate) fn presize(size: u64) -> usize {
    usize::try_from(size.min(MAX_PRESIZE)).unwrap_or(0)
}

/// Fill `buf` from `reader`, stopping early only at end of stream.
pub(crate) fn read_full(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

fn out_of_range(file_index: usize, len: usize) -> SuturaError {
    SuturaError::Malformed(format!(
        "file index {file_index} out of range (container has {len} files)"
    ))
}

// =============================================================================
// DIRECTORY-BACKED POOL
// =============================================================================

/// Pool backed by a directory on the local filesystem.
///
/// # Example
///
/// ```rust,no_run
/// use std::io::Read;
/// use std::path::Path;
/// use sutura::{accept_all, Container, FsPool, Pool};
///
/// let root = Path::new("build/v1");
/// let container = Container::walk_directory(root, &accept_all).unwrap();
/// let mut pool = FsPool::new(&container, root);
/// let mut first = Vec::new();
/// pool.reader(0).unwrap().read_to_end(&mut first).unwrap();
/// ```
#[derive(Debug)]
pub struct FsPool {
    base: PathBuf,
    paths: Vec<String>,
    sizes: Vec<u64>,
    modes: Vec<u32>,
    current: Option<(usize, BufReader<fs::File>)>,
}

impl FsPool {
    /// Create a pool for `container` rooted at `base`.
    #[must_use]
    pub fn new(container: &Container, base: &Path) -> Self {
        Self {
            base: base.to_path_buf(),
            paths: container.files.iter().map(|f| f.path.clone()).collect(),
            sizes: container.files.iter().map(|f| f.size).collect(),
            modes: container.files.iter().map(|f| f.mode).collect(),
            current: None,
        }
    }

    /// Native path of file `file_index`.
    ///
    /// # Errors
    ///
    /// Returns a `Malformed` error if the index is out of range.
    pub fn path(&self, file_index: usize) -> Result<PathBuf> {
        self.paths
            .get(file_index)
            .map(|rel| native_path(&self.base, rel))
            .ok_or_else(|| out_of_range(file_index, self.paths.len()))
    }

    /// Root directory of the pool.
    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    fn open(&mut self, file_index: usize) -> Result<&mut BufReader<fs::File>> {
        let reader = match self.current.take() {
            Some((index, reader)) if index == file_index => reader,
            _ => {
                let path = self.path(file_index)?;
                trace!(path = %path.display(), "opening pool file");
                BufReader::with_capacity(READ_BUFFER_SIZE, fs::File::open(path)?)
            }
        };
        Ok(&mut self.current.insert((file_index, reader)).1)
    }
}

impl Pool for FsPool {
    fn reader(&mut self, file_index: usize) -> Result<&mut dyn Read> {
        let reader = self.open(file_index)?;
        reader.seek(SeekFrom::Start(0))?;
        Ok(reader)
    }

    fn seekable_reader(&mut self, file_index: usize) -> Result<&mut dyn ReadSeek> {
        Ok(self.open(file_index)?)
    }

    fn size(&self, file_index: usize) -> u64 {
        self.sizes.get(file_index).copied().unwrap_or(0)
    }

    fn close(&mut self) -> Result<()> {
        self.current = None;
        Ok(())
    }
}

struct FsWriter {
    inner: BufWriter<fs::File>,
}

impl Write for FsWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl PoolWriter for FsWriter {
    fn finish(mut self: Box<Self>) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }
}

impl WritablePool for FsPool {
    fn writer(&mut self, file_index: usize) -> Result<Box<dyn PoolWriter + '_>> {
        let path = self.path(file_index)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        if matches!(&self.current, Some((index, _)) if *index == file_index) {
            self.current = None;
        }
        let file = fs::File::create(&path)?;
        set_mode(&path, self.modes[file_index])?;
        Ok(Box::new(FsWriter {
            inner: BufWriter::with_capacity(READ_BUFFER_SIZE, file),
        }))
    }
}

// =============================================================================
// DISCARDING POOL
// =============================================================================

/// Writable pool that throws every byte away. Used for dry runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullWritablePool;

struct NullWriter;

impl Write for NullWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl PoolWriter for NullWriter {
    fn finish(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

impl WritablePool for NullWritablePool {
    fn writer(&mut self, _file_index: usize) -> Result<Box<dyn PoolWriter + '_>> {
        Ok(Box::new(NullWriter))
    }
}

// =============================================================================
// ARCHIVE-BACKED POOL
// =============================================================================

/// Reader over one archive entry: streamed, or fully buffered once random
/// access was requested.
enum EntryReader {
    Stream(Box<dyn Read + Send>),
    Buffered(Cursor<Vec<u8>>),
}

impl Read for EntryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Stream(reader) => reader.read(buf),
            Self::Buffered(cursor) => cursor.read(buf),
        }
    }
}

impl Seek for EntryReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            Self::Stream(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "archive entry stream is not seekable",
            )),
            Self::Buffered(cursor) => cursor.seek(pos),
        }
    }
}

/// Pool backed by an [`Archive`].
///
/// Sequential readers stream entries straight from the archive. Seekable
/// readers decompress the whole entry into memory, so heavy random access on
/// large files is better served by an [`FsPool`] over an extracted copy.
pub struct ArchivePool {
    archive: Arc<dyn Archive>,
    entry_indices: Vec<usize>,
    sizes: Vec<u64>,
    current: Option<(usize, EntryReader)>,
}

impl ArchivePool {
    /// Create a pool for `container`, which must have been walked from
    /// `archive`.
    ///
    /// # Errors
    ///
    /// Returns a `Malformed` error if a container file has no archive entry.
    pub fn new(container: &Container, archive: Arc<dyn Archive>) -> Result<Self> {
        let by_name: FxHashMap<String, usize> = archive
            .entries()
            .iter()
            .enumerate()
            .map(|(index, entry)| (normalize_archive_name(&entry.name), index))
            .collect();

        let entry_indices = container
            .files
            .iter()
            .map(|file| {
                by_name.get(&file.path).copied().ok_or_else(|| {
                    SuturaError::Malformed(format!("{} is not in the archive", file.path))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            archive,
            entry_indices,
            sizes: container.files.iter().map(|f| f.size).collect(),
            current: None,
        })
    }

    fn entry_index(&self, file_index: usize) -> Result<usize> {
        self.entry_indices
            .get(file_index)
            .copied()
            .ok_or_else(|| out_of_range(file_index, self.entry_indices.len()))
    }
}

impl Pool for ArchivePool {
    fn reader(&mut self, file_index: usize) -> Result<&mut dyn Read> {
        let reader = match self.current.take() {
            Some((index, EntryReader::Buffered(mut cursor))) if index == file_index => {
                cursor.set_position(0);
                EntryReader::Buffered(cursor)
            }
            _ => EntryReader::Stream(self.archive.open(self.entry_index(file_index)?)?),
        };
        Ok(&mut self.current.insert((file_index, reader)).1)
    }

    fn seekable_reader(&mut self, file_index: usize) -> Result<&mut dyn ReadSeek> {
        let reader = match self.current.take() {
            Some((index, EntryReader::Buffered(cursor))) if index == file_index => {
                EntryReader::Buffered(cursor)
            }
            _ => {
                let mut stream = self.archive.open(self.entry_index(file_index)?)?;
                let mut data = Vec::with_capacity(presize(self.size(file_index)));
                stream.read_to_end(&mut data)?;
                trace!(file_index, bytes = data.len(), "buffered archive entry");
                EntryReader::Buffered(Cursor::new(data))
            }
        };
        Ok(&mut self.current.insert((file_index, reader)).1)
    }

    fn size(&self, file_index: usize) -> u64 {
        self.sizes.get(file_index).copied().unwrap_or(0)
    }

    fn close(&mut self) -> Result<()> {
        self.current = None;
        Ok(())
    }
}

impl std::fmt::Debug for ArchivePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchivePool")
            .field("files", &self.entry_indices.len())
            .field("current", &self.current.as_ref().map(|(index, _)| *index))
            .finish_non_exhaustive()
    }
}
