//! Content-addressed block storage.
//!
//! Blocks are addressed by their BLAKE3 hash and length. The same content is
//! stored once no matter how many trees or locations refer to it.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use super::manifest::{BlockHashMap, Manifest};
use super::{expected_len, BlockLocation, BlockSink, BlockSource};
use crate::container::{native_path, Container};
use crate::error::{Result, SuturaError};
use crate::hash::StrongHash;

/// Address of a stored block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockAddress {
    /// BLAKE3 hash of the content.
    pub hash: StrongHash,
    /// Content length.
    pub size: u64,
}

impl BlockAddress {
    /// Address of `data`.
    #[must_use]
    pub fn of(data: &[u8]) -> Self {
        Self {
            hash: StrongHash::compute(data),
            size: data.len() as u64,
        }
    }

    /// Relative storage path, `blake3/<hex>/<size>`.
    #[must_use]
    pub fn path(&self) -> String {
        format!("blake3/{}/{}", self.hash.to_hex(), self.size)
    }
}

/// Moves blocks to and from a store.
pub trait BlockTransport: Send + Sync {
    /// Fetch the block at `address`.
    ///
    /// # Errors
    ///
    /// Returns an error if the block is missing or cannot be read.
    fn get(&self, address: &BlockAddress) -> Result<Vec<u8>>;

    /// Store `data` at `address`. Storing an existing block is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the block cannot be written.
    fn put(&self, address: &BlockAddress, data: &[u8]) -> Result<()>;
}

/// Blocks as files under a directory.
#[derive(Debug, Clone)]
pub struct DiskStore {
    base: PathBuf,
}

impl DiskStore {
    /// Store blocks under `base`.
    #[must_use]
    pub fn new(base: &Path) -> Self {
        Self {
            base: base.to_path_buf(),
        }
    }

    fn block_path(&self, address: &BlockAddress) -> PathBuf {
        native_path(&self.base, &address.path())
    }
}

impl BlockTransport for DiskStore {
    fn get(&self, address: &BlockAddress) -> Result<Vec<u8>> {
        Ok(fs::read(self.block_path(address))?)
    }

    fn put(&self, address: &BlockAddress, data: &[u8]) -> Result<()> {
        let path = self.block_path(address);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                trace!(path = %path.display(), "block already stored");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        file.write_all(data)?;
        Ok(())
    }
}

/// Blocks in memory. Counts puts so tests can check deduplication.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blocks: Mutex<FxHashMap<BlockAddress, Vec<u8>>>,
    puts: AtomicUsize,
}

impl MemoryStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct blocks stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `address` is stored.
    #[must_use]
    pub fn contains(&self, address: &BlockAddress) -> bool {
        self.blocks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(address)
    }

    /// Number of `put` calls so far.
    #[must_use]
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::Relaxed)
    }
}

impl BlockTransport for MemoryStore {
    fn get(&self, address: &BlockAddress) -> Result<Vec<u8>> {
        self.blocks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("block {} not in store", address.path()),
                )
                .into()
            })
    }

    fn put(&self, address: &BlockAddress, data: &[u8]) -> Result<()> {
        self.puts.fetch_add(1, Ordering::Relaxed);
        self.blocks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(*address)
            .or_insert_with(|| data.to_vec());
        Ok(())
    }
}

/// Source that resolves locations through a manifest and fetches content
/// from a transport.
pub struct StoreSource {
    transport: Arc<dyn BlockTransport>,
    manifest: Arc<Manifest>,
}

impl StoreSource {
    /// Read the tree described by `manifest` from `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn BlockTransport>, manifest: Arc<Manifest>) -> Self {
        Self {
            transport,
            manifest,
        }
    }
}

impl BlockSource for StoreSource {
    fn fetch(&mut self, location: BlockLocation) -> Result<Vec<u8>> {
        let size = expected_len(&self.manifest.container, location, self.big_block_size())?;
        let address = BlockAddress {
            hash: self.manifest.hash(location)?,
            size,
        };
        let data = self.transport.get(&address)?;
        if BlockAddress::of(&data) != address {
            let path = self
                .manifest
                .container
                .files
                .get(usize::try_from(location.file_index).unwrap_or(usize::MAX))
                .map_or_else(String::new, |f| f.path.clone());
            let start = location.block_index * self.big_block_size();
            return Err(SuturaError::Integrity {
                path,
                start,
                end: start + size,
            });
        }
        Ok(data)
    }

    fn container(&self) -> &Container {
        &self.manifest.container
    }

    fn big_block_size(&self) -> u64 {
        self.manifest.big_block_size
    }
}

/// Sink that stores blocks by content and records their hashes.
#[derive(Clone)]
pub struct StoreSink {
    transport: Arc<dyn BlockTransport>,
    container: Arc<Container>,
    big_block_size: u64,
    hashes: Arc<Mutex<BlockHashMap>>,
}

impl StoreSink {
    /// Store blocks of `container` into `transport`.
    #[must_use]
    pub fn new(
        transport: Arc<dyn BlockTransport>,
        container: Arc<Container>,
        big_block_size: u64,
    ) -> Self {
        Self {
            transport,
            container,
            big_block_size,
            hashes: Arc::default(),
        }
    }

    /// Shared handle to the hashes recorded by this sink and its clones.
    #[must_use]
    pub fn recorded_hashes(&self) -> Arc<Mutex<BlockHashMap>> {
        Arc::clone(&self.hashes)
    }

    /// Manifest of everything stored so far.
    #[must_use]
    pub fn manifest(&self) -> Manifest {
        Manifest {
            container: (*self.container).clone(),
            hashes: self
                .hashes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            big_block_size: self.big_block_size,
        }
    }
}

impl BlockSink for StoreSink {
    fn store(&mut self, location: BlockLocation, data: &[u8]) -> Result<()> {
        let want = expected_len(&self.container, location, self.big_block_size)?;
        if data.len() as u64 != want {
            return Err(SuturaError::Malformed(format!(
                "block {location:?} has {} bytes, expected {want}",
                data.len()
            )));
        }
        let address = BlockAddress::of(data);
        self.transport.put(&address, data)?;
        debug!(?location, address = %address.path(), "stored block");
        self.hashes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set(location, address.hash);
        Ok(())
    }

    fn container(&self) -> &Container {
        &self.container
    }

    fn big_block_size(&self) -> u64 {
        self.big_block_size
    }

    fn clone_sink(&self) -> Box<dyn BlockSink> {
        Box::new(self.clone())
    }
}
