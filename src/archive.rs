//! Archive collaborator contract.
//!
//! Parsing real archive formats is left to callers. Anything that can list
//! its entries and open one of them as a byte stream can back a container
//! walk and an [`ArchivePool`](crate::pool::ArchivePool).

use std::io::{self, Cursor, Read};
use std::sync::Arc;

use crate::container::EntryKind;

/// One entry of an archive's central directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Entry name as stored in the archive, `/`-separated.
    pub name: String,
    /// What the entry describes.
    pub kind: EntryKind,
    /// Permission bits, possibly unreliable depending on the archiver.
    pub mode: u32,
    /// Uncompressed size. Zero for directories and symlinks.
    pub size: u64,
    /// Link target, for symlink entries.
    pub link_target: Option<String>,
}

/// A readable archive.
pub trait Archive: Send + Sync {
    /// All entries, in archive order.
    fn entries(&self) -> &[ArchiveEntry];

    /// Open the entry at `index` (into [`entries`](Self::entries)) as a
    /// forward-only stream of its uncompressed bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be opened or decompressed.
    fn open(&self, index: usize) -> io::Result<Box<dyn Read + Send>>;
}

/// An archive held entirely in memory.
///
/// Useful for tests and for callers that already extracted an archive's
/// central directory and contents by other means.
///
/// # Example
///
/// ```rust
/// use sutura::{Archive, MemoryArchive};
///
/// let archive = MemoryArchive::new()
///     .with_dir("bin", 0o755)
///     .with_file("bin/tool", 0o755, b"#!/bin/sh\n".to_vec())
///     .with_symlink("tool", "bin/tool");
/// assert_eq!(archive.entries().len(), 3);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryArchive {
    entries: Vec<ArchiveEntry>,
    contents: Vec<Arc<[u8]>>,
}

impl MemoryArchive {
    /// Create an empty archive.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a directory entry.
    #[must_use]
    pub fn with_dir(mut self, name: &str, mode: u32) -> Self {
        self.push(name, EntryKind::Dir, mode, None, Vec::new());
        self
    }

    /// Append a regular file entry.
    #[must_use]
    pub fn with_file(mut self, name: &str, mode: u32, data: Vec<u8>) -> Self {
        self.push(name, EntryKind::File, mode, None, data);
        self
    }

    /// Append a symlink entry.
    #[must_use]
    pub fn with_symlink(mut self, name: &str, target: &str) -> Self {
        self.push(
            name,
            EntryKind::Symlink,
            0o777,
            Some(target.to_string()),
            Vec::new(),
        );
        self
    }

    fn push(
        &mut self,
        name: &str,
        kind: EntryKind,
        mode: u32,
        link_target: Option<String>,
        data: Vec<u8>,
    ) {
        self.entries.push(ArchiveEntry {
            name: name.to_string(),
            kind,
            mode,
            size: data.len() as u64,
            link_target,
        });
        self.contents.push(Arc::from(data));
    }
}

impl Archive for MemoryArchive {
    fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    fn open(&self, index: usize) -> io::Result<Box<dyn Read + Send>> {
        let data = self.contents.get(index).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no archive entry at index {index}"),
            )
        })?;
        Ok(Box::new(Cursor::new(data)))
    }
}
