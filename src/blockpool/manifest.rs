//! Manifest artifact: a container plus the content hash of every big block.
//!
//! ```text
//! MAGIC  HEADER{algorithm, quality, hash_algorithm}
//!   Container  big_block_size
//!   file_index  StrongHash*      (one per big block, for every file)
//! ```

use std::io::{Read, Write};

use rustc_hash::FxHashMap;

use super::{num_big_blocks, BlockLocation};
use crate::compression::CompressionSettings;
use crate::container::Container;
use crate::error::{Result, SuturaError};
use crate::hash::StrongHash;
use crate::wire::{WireReader, WireWriter, MANIFEST_MAGIC};

/// Hash algorithm id of BLAKE3 block addresses.
pub const HASH_ALGORITHM_BLAKE3: u8 = 1;

/// Content hash of every stored big block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockHashMap {
    hashes: FxHashMap<BlockLocation, StrongHash>,
}

impl BlockHashMap {
    /// An empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the hash of the block at `location`.
    pub fn set(&mut self, location: BlockLocation, hash: StrongHash) {
        self.hashes.insert(location, hash);
    }

    /// Hash of the block at `location`.
    #[must_use]
    pub fn get(&self, location: BlockLocation) -> Option<StrongHash> {
        self.hashes.get(&location).copied()
    }

    /// Number of recorded blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    /// Whether nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

/// A tree stored as big blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// The tree's container.
    pub container: Container,
    /// Hash of every big block of every file.
    pub hashes: BlockHashMap,
    /// Big block size the tree was cut with.
    pub big_block_size: u64,
}

impl Manifest {
    /// Hash of the block at `location`.
    ///
    /// # Errors
    ///
    /// Returns `Malformed` if the manifest has no such block.
    pub fn hash(&self, location: BlockLocation) -> Result<StrongHash> {
        self.hashes.get(location).ok_or_else(|| {
            SuturaError::Malformed(format!("manifest has no hash for block {location:?}"))
        })
    }

    /// Every block location of the container, in order.
    pub fn locations(&self) -> impl Iterator<Item = BlockLocation> + '_ {
        self.container
            .files
            .iter()
            .enumerate()
            .flat_map(move |(i, file)| {
                (0..num_big_blocks(file.size, self.big_block_size))
                    .map(move |b| BlockLocation::new(i as u64, b))
            })
    }
}

/// Write `manifest` as a manifest artifact.
///
/// # Errors
///
/// Returns `Malformed` if some block of the container has no hash.
pub fn write_manifest<W: Write>(
    writer: W,
    compression: CompressionSettings,
    manifest: &Manifest,
) -> Result<W> {
    let mut wire = WireWriter::with_hash_algorithm(
        writer,
        MANIFEST_MAGIC,
        compression,
        HASH_ALGORITHM_BLAKE3,
    )?;
    wire.write_message(&manifest.container)?;
    wire.write_message(&manifest.big_block_size)?;
    for (index, file) in manifest.container.files.iter().enumerate() {
        wire.write_message(&(index as u64))?;
        for block in 0..num_big_blocks(file.size, manifest.big_block_size) {
            let hash = manifest.hash(BlockLocation::new(index as u64, block))?;
            wire.write_message(&hash)?;
        }
    }
    wire.finish()
}

/// Read a manifest artifact.
///
/// # Errors
///
/// Returns `UnrecognizedFormat` if this is not a manifest, `Malformed` for
/// an unsupported hash algorithm or out-of-order files, and `Truncated` if
/// hashes are missing.
pub fn read_manifest<R: Read>(reader: R) -> Result<Manifest> {
    let (mut wire, hash_algorithm) = WireReader::open_hashed(reader, MANIFEST_MAGIC)?;
    if hash_algorithm != HASH_ALGORITHM_BLAKE3 {
        return Err(SuturaError::Malformed(format!(
            "unsupported hash algorithm {hash_algorithm}, expected {HASH_ALGORITHM_BLAKE3}"
        )));
    }
    let container: Container = wire.read_message("manifest container")?;
    let big_block_size: u64 = wire.read_message("big block size")?;
    super::check_big_block_size(big_block_size)
        .map_err(|_| SuturaError::Malformed(format!("bad big block size {big_block_size}")))?;

    let mut hashes = BlockHashMap::new();
    for (index, file) in container.files.iter().enumerate() {
        let found: u64 = wire.read_message("manifest file index")?;
        if found != index as u64 {
            return Err(SuturaError::Malformed(format!(
                "manifest expected file {index}, found {found}"
            )));
        }
        for block in 0..num_big_blocks(file.size, big_block_size) {
            let hash: StrongHash = wire.read_message("block hash")?;
            hashes.set(BlockLocation::new(index as u64, block), hash);
        }
    }
    Ok(Manifest {
        container,
        hashes,
        big_block_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockpool::tests::container_of;
    use crate::signature::BLOCK_SIZE;

    const BIG: u64 = 2 * BLOCK_SIZE as u64;

    fn manifest() -> Manifest {
        let container = container_of(&[BIG * 2 + 1, 0, 7]);
        let mut hashes = BlockHashMap::new();
        for (i, location) in [(0, 0), (0, 1), (0, 2), (2, 0)].into_iter().enumerate() {
            hashes.set(
                BlockLocation::new(location.0, location.1),
                StrongHash::compute(&[i as u8]),
            );
        }
        Manifest {
            container,
            hashes,
            big_block_size: BIG,
        }
    }

    #[test]
    fn manifest_roundtrip() {
        let manifest = manifest();
        let bytes = write_manifest(Vec::new(), CompressionSettings::default(), &manifest).unwrap();
        assert_eq!(read_manifest(bytes.as_slice()).unwrap(), manifest);
        assert_eq!(manifest.locations().count(), 4);
    }

    #[test]
    fn missing_hash_is_refused() {
        let mut manifest = manifest();
        manifest.hashes = BlockHashMap::new();
        assert!(matches!(
            write_manifest(Vec::new(), CompressionSettings::none(), &manifest),
            Err(SuturaError::Malformed(_))
        ));
    }

    #[test]
    fn other_hash_algorithm_is_refused() {
        let manifest = manifest();
        let mut wire =
            WireWriter::with_hash_algorithm(Vec::new(), MANIFEST_MAGIC, CompressionSettings::none(), 9)
                .unwrap();
        wire.write_message(&manifest.container).unwrap();
        let bytes = wire.finish().unwrap();
        assert!(matches!(
            read_manifest(bytes.as_slice()),
            Err(SuturaError::Malformed(_))
        ));
    }

    #[test]
    fn patch_magic_is_not_a_manifest() {
        let bytes = WireWriter::new(Vec::new(), crate::wire::PATCH_MAGIC, CompressionSettings::none())
            .unwrap()
            .finish()
            .unwrap();
        assert!(matches!(
            read_manifest(bytes.as_slice()),
            Err(SuturaError::UnrecognizedFormat { .. })
        ));
    }
}
