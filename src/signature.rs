//! Block signatures of a container and the block library built from them.
//!
//! Every file is cut into fixed [`BLOCK_SIZE`] blocks (the last one may be
//! short, empty files have none) and each block gets a weak rolling checksum
//! plus a BLAKE3 hash. The signature of a container is those hashes in
//! container order.

use std::io::{self, Read, Write};

use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::checksum::weak_hash;
use crate::compression::CompressionSettings;
use crate::container::Container;
use crate::error::{Result, SuturaError};
use crate::hash::StrongHash;
use crate::ops::num_blocks;
use crate::pool::{read_full, Pool};
use crate::progress::{ByteCounter, Progress};
use crate::wire::{WireReader, WireWriter, SIGNATURE_MAGIC};

/// Fixed block size (64 KiB).
pub const BLOCK_SIZE: usize = 64 * 1024;

/// Blocks hashed in parallel per read.
pub(crate) const CHUNK_BLOCKS: usize = 64;

/// Most block hashes reserved up front when reading a signature.
const PRESIZED_HASHES: usize = 64 * 1024;

/// Hashes of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHash {
    /// Rolling checksum for fast filtering.
    pub weak: u32,
    /// BLAKE3 digest for confirmation.
    pub strong: StrongHash,
}

impl BlockHash {
    /// Hash one block of data.
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self {
            weak: weak_hash(data),
            strong: StrongHash::compute(data),
        }
    }
}

/// Signature of a whole container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// The container the hashes describe.
    pub container: Container,
    /// Block hashes of every file, in container order.
    pub hashes: Vec<BlockHash>,
    offsets: Vec<usize>,
}

impl Signature {
    /// Pair a container with its block hashes.
    ///
    /// # Errors
    ///
    /// Returns `Malformed` if the number of hashes does not match the number
    /// of blocks of the container.
    pub fn new(container: Container, hashes: Vec<BlockHash>) -> Result<Self> {
        let offsets = block_offsets(&container)?;
        let expected = offsets.last().copied().unwrap_or(0);
        if hashes.len() != expected {
            return Err(SuturaError::Malformed(format!(
                "signature has {} block hashes, container needs {expected}",
                hashes.len()
            )));
        }
        Ok(Self {
            container,
            hashes,
            offsets,
        })
    }

    /// Block hashes of file `file_index`. Empty for an unknown index.
    #[must_use]
    pub fn file_hashes(&self, file_index: usize) -> &[BlockHash] {
        match (self.offsets.get(file_index), self.offsets.get(file_index + 1)) {
            (Some(&start), Some(&end)) => &self.hashes[start..end],
            _ => &[],
        }
    }

    /// Total number of blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.hashes.len()
    }
}

/// `offsets[i]` is the first block of file `i`; the last entry is the total.
fn block_offsets(container: &Container) -> Result<Vec<usize>> {
    let mut offsets = Vec::with_capacity(container.files.len() + 1);
    let mut total = 0usize;
    offsets.push(0);
    for file in &container.files {
        total = usize::try_from(num_blocks(file.size))
            .ok()
            .and_then(|blocks| total.checked_add(blocks))
            .ok_or_else(|| {
                SuturaError::Malformed(format!(
                    "{}: block count of {} bytes overflows",
                    file.path, file.size
                ))
            })?;
        offsets.push(total);
    }
    Ok(offsets)
}

/// Hash a buffer of whole blocks in parallel.
pub(crate) fn hash_blocks(data: &[u8], out: &mut Vec<BlockHash>) {
    if data.len() > BLOCK_SIZE {
        out.par_extend(data.par_chunks(BLOCK_SIZE).map(BlockHash::compute));
    } else if !data.is_empty() {
        out.push(BlockHash::compute(data));
    }
}

/// Compute the signature of `container`, reading its files from `pool`.
///
/// # Errors
///
/// Returns an I/O error if a file cannot be read, and `Malformed` if a file
/// does not have the size the container records.
pub fn compute_signature(
    container: &Container,
    pool: &mut dyn Pool,
    progress: &dyn Progress,
) -> Result<Signature> {
    let mut counter = ByteCounter::new(progress, container.size);
    let mut hashes = Vec::new();
    let mut buf = vec![0u8; CHUNK_BLOCKS * BLOCK_SIZE];

    for (file_index, file) in container.files.iter().enumerate() {
        counter.label(&file.path);
        let reader = pool.reader(file_index)?;
        let mut read = 0u64;
        loop {
            let n = read_full(reader, &mut buf)?;
            hash_blocks(&buf[..n], &mut hashes);
            read += n as u64;
            counter.add(n as u64);
            if n < buf.len() {
                break;
            }
        }
        if read != file.size {
            return Err(SuturaError::Malformed(format!(
                "{}: expected {} bytes, read {read}",
                file.path, file.size
            )));
        }
        debug!(path = %file.path, bytes = read, "hashed file");
    }
    pool.close()?;
    counter.finish();

    info!(
        files = container.files.len(),
        blocks = hashes.len(),
        "computed signature"
    );
    Signature::new(container.clone(), hashes)
}

/// Write `signature` as a signature artifact.
///
/// # Errors
///
/// Returns an error if encoding or writing fails.
pub fn write_signature<W: Write>(
    writer: W,
    compression: CompressionSettings,
    signature: &Signature,
) -> Result<W> {
    let mut wire = WireWriter::new(writer, SIGNATURE_MAGIC, compression)?;
    wire.write_message(&signature.container)?;
    for hash in &signature.hashes {
        wire.write_message(hash)?;
    }
    wire.finish()
}

/// Read a signature artifact.
///
/// # Errors
///
/// Returns `UnrecognizedFormat` if this is not a signature, and `Malformed`
/// if the artifact holds more or fewer block hashes than its container needs.
pub fn read_signature<R: Read>(reader: R) -> Result<Signature> {
    let mut wire = WireReader::open(reader, SIGNATURE_MAGIC)?;
    let container: Container = wire.read_message("signature container")?;
    let expected = block_offsets(&container)?.last().copied().unwrap_or(0);
    // the container is untrusted until its hashes have actually arrived
    let mut hashes = Vec::with_capacity(expected.min(PRESIZED_HASHES));
    while hashes.len() < expected {
        match wire.try_read_message()? {
            Some(hash) => hashes.push(hash),
            None => {
                return Err(SuturaError::Malformed(format!(
                    "signature ends after {} of {expected} block hashes",
                    hashes.len()
                )))
            }
        }
    }
    if wire.try_read_message::<BlockHash>()?.is_some() {
        return Err(SuturaError::Malformed(format!(
            "signature has more than {expected} block hashes"
        )));
    }
    Signature::new(container, hashes)
}

// =============================================================================
// STREAMING HASHER
// =============================================================================

/// Reader adapter that hashes everything read through it, block by block.
///
/// Lets the diff engine produce the new version's signature without a second
/// pass over the source files.
pub struct HashingReader<R> {
    inner: R,
    block: Vec<u8>,
    hashes: Vec<BlockHash>,
}

impl<R: Read> HashingReader<R> {
    /// Wrap `inner`.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            block: Vec::with_capacity(BLOCK_SIZE),
            hashes: Vec::new(),
        }
    }

    /// Hash the trailing short block and return the file's block hashes.
    #[must_use]
    pub fn finish(mut self) -> Vec<BlockHash> {
        if !self.block.is_empty() {
            self.hashes.push(BlockHash::compute(&self.block));
        }
        self.hashes
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        let mut rest = &buf[..n];
        while !rest.is_empty() {
            let take = (BLOCK_SIZE - self.block.len()).min(rest.len());
            self.block.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.block.len() == BLOCK_SIZE {
                self.hashes.push(BlockHash::compute(&self.block));
                self.block.clear();
            }
        }
        Ok(n)
    }
}

// =============================================================================
// BLOCK LIBRARY
// =============================================================================

/// A block of the old container, as found by the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMatch {
    /// Target file index.
    pub file_index: usize,
    /// Block index within that file.
    pub block_index: u64,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    file_index: usize,
    block_index: u64,
    size: usize,
    strong: StrongHash,
}

/// Weak-hash index over every block of a signature.
///
/// Lookup is two-level: the weak checksum selects candidates, the strong hash
/// confirms them. Candidates must also have the same length as the data, so a
/// short trailing block never matches a full window.
#[derive(Debug, Default)]
pub struct BlockLibrary {
    weak_index: FxHashMap<u32, Vec<Candidate>>,
}

impl BlockLibrary {
    /// Index every block of `signature`.
    #[must_use]
    pub fn new(signature: &Signature) -> Self {
        let mut weak_index: FxHashMap<u32, Vec<Candidate>> = FxHashMap::with_capacity_and_hasher(
            signature.block_count(),
            rustc_hash::FxBuildHasher,
        );
        for (file_index, file) in signature.container.files.iter().enumerate() {
            for (block_index, hash) in signature.file_hashes(file_index).iter().enumerate() {
                let block_index = block_index as u64;
                let size = usize::try_from(crate::ops::block_len(file.size, block_index))
                    .unwrap_or(BLOCK_SIZE);
                weak_index.entry(hash.weak).or_default().push(Candidate {
                    file_index,
                    block_index,
                    size,
                    strong: hash.strong,
                });
            }
        }
        Self { weak_index }
    }

    /// Check whether any block has weak checksum `weak`.
    #[must_use]
    pub fn has_weak(&self, weak: u32) -> bool {
        self.weak_index.contains_key(&weak)
    }

    /// Check whether the library has no blocks at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.weak_index.is_empty()
    }

    /// Find an old block equal to `data`, whose weak checksum is `weak`.
    ///
    /// Among equal blocks, prefers `expected` (the block that would extend
    /// the current run), then any block of `preferred_file`, then the first
    /// one indexed.
    #[must_use]
    pub fn find(
        &self,
        weak: u32,
        data: &[u8],
        preferred_file: Option<usize>,
        expected: Option<(usize, u64)>,
    ) -> Option<BlockMatch> {
        let candidates = self.weak_index.get(&weak)?;
        if !candidates.iter().any(|c| c.size == data.len()) {
            return None;
        }
        let strong = StrongHash::compute(data);
        let rank = |c: &Candidate| {
            if expected == Some((c.file_index, c.block_index)) {
                0
            } else if preferred_file == Some(c.file_index) {
                1
            } else {
                2
            }
        };
        candidates
            .iter()
            .filter(|c| c.size == data.len() && c.strong == strong)
            .min_by_key(|c| rank(c))
            .map(|c| BlockMatch {
                file_index: c.file_index,
                block_index: c.block_index,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::accept_all;
    use crate::pool::FsPool;
    use crate::progress::NoProgress;
    use std::fs;
    use tempfile::TempDir;

    fn patterned(len: usize, seed: u8) -> Vec<u8> {
        (0..len)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect()
    }

    fn sign_dir(dir: &TempDir) -> Signature {
        let container = Container::walk_directory(dir.path(), &accept_all).unwrap();
        let mut pool = FsPool::new(&container, dir.path());
        compute_signature(&container, &mut pool, &NoProgress).unwrap()
    }

    // ==========================================================================
    // SIGNATURE COMPUTATION
    // ==========================================================================

    #[test]
    fn blocks_per_file_and_short_tail() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a"), patterned(BLOCK_SIZE * 2 + 10, 1)).unwrap();
        fs::write(dir.path().join("b"), b"").unwrap();
        fs::write(dir.path().join("c"), b"tiny").unwrap();
        let sig = sign_dir(&dir);

        assert_eq!(sig.block_count(), 4);
        assert_eq!(sig.file_hashes(0).len(), 3);
        assert!(sig.file_hashes(1).is_empty());
        assert_eq!(sig.file_hashes(2), &[BlockHash::compute(b"tiny")]);
        assert!(sig.file_hashes(9).is_empty());
    }

    #[test]
    fn signature_is_deterministic() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("f"), patterned(BLOCK_SIZE * CHUNK_BLOCKS + 7, 3)).unwrap();
        assert_eq!(sign_dir(&dir), sign_dir(&dir));
    }

    #[test]
    fn size_mismatch_is_malformed() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("f"), b"12345").unwrap();
        let mut container = Container::walk_directory(dir.path(), &accept_all).unwrap();
        container.files[0].size = 3;
        let mut pool = FsPool::new(&container, dir.path());
        assert!(matches!(
            compute_signature(&container, &mut pool, &NoProgress),
            Err(SuturaError::Malformed(_))
        ));
    }

    #[test]
    fn hash_count_must_match_container() {
        let mut container = Container::default();
        container.files.push(crate::container::File {
            path: "f".to_string(),
            mode: 0o644,
            size: 1,
            offset: 0,
        });
        assert!(Signature::new(container, Vec::new()).is_err());
    }

    // ==========================================================================
    // PERSISTENCE
    // ==========================================================================

    #[test]
    fn artifact_roundtrip() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("x"), patterned(BLOCK_SIZE + 1, 9)).unwrap();
        let sig = sign_dir(&dir);

        let bytes = write_signature(Vec::new(), CompressionSettings::default(), &sig).unwrap();
        let back = read_signature(bytes.as_slice()).unwrap();
        assert_eq!(back, sig);
        assert_eq!(back.file_hashes(0).len(), 2);
    }

    fn signature_bytes(container: &Container, hashes: &[BlockHash]) -> Vec<u8> {
        let mut wire =
            WireWriter::new(Vec::new(), SIGNATURE_MAGIC, CompressionSettings::none()).unwrap();
        wire.write_message(container).unwrap();
        for hash in hashes {
            wire.write_message(hash).unwrap();
        }
        wire.finish().unwrap()
    }

    #[test]
    fn missing_hashes_are_malformed() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("x"), patterned(BLOCK_SIZE * 3, 2)).unwrap();
        let sig = sign_dir(&dir);
        let bytes = signature_bytes(&sig.container, &sig.hashes[..2]);
        assert!(matches!(
            read_signature(bytes.as_slice()),
            Err(SuturaError::Malformed(_))
        ));
    }

    #[test]
    fn extra_hashes_are_malformed() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("x"), patterned(BLOCK_SIZE + 1, 3)).unwrap();
        let sig = sign_dir(&dir);
        let mut hashes = sig.hashes.clone();
        hashes.push(hashes[0]);
        let bytes = signature_bytes(&sig.container, &hashes);
        assert!(matches!(
            read_signature(bytes.as_slice()),
            Err(SuturaError::Malformed(_))
        ));
    }

    #[test]
    fn oversized_container_is_malformed() {
        let mut container = Container::default();
        container.files.push(crate::container::File {
            path: "huge".to_string(),
            mode: 0o644,
            size: u64::MAX,
            offset: 0,
        });
        container.size = u64::MAX;
        let bytes = signature_bytes(&container, &[]);
        let err = read_signature(bytes.as_slice()).unwrap_err();
        assert!(matches!(err, SuturaError::Malformed(_)), "{err:?}");
    }

    // ==========================================================================
    // HASHING READER
    // ==========================================================================

    #[test]
    fn hashing_reader_matches_block_hashes() {
        let data = patterned(BLOCK_SIZE * 2 + 333, 5);
        let mut reader = HashingReader::new(data.as_slice());
        let mut small = [0u8; 1000];
        while reader.read(&mut small).unwrap() > 0 {}
        let expected: Vec<BlockHash> = data.chunks(BLOCK_SIZE).map(BlockHash::compute).collect();
        assert_eq!(reader.finish(), expected);
    }

    #[test]
    fn hashing_reader_empty_input() {
        let reader = HashingReader::new(&[][..]);
        assert!(reader.finish().is_empty());
    }

    // ==========================================================================
    // BLOCK LIBRARY
    // ==========================================================================

    #[test]
    fn library_prefers_expected_then_same_file() {
        let block = patterned(BLOCK_SIZE, 7);
        let dir = TempDir::new().unwrap();
        // Both files consist of the same repeated block.
        fs::write(dir.path().join("a"), [block.clone(), block.clone()].concat()).unwrap();
        fs::write(dir.path().join("b"), [block.clone(), block.clone()].concat()).unwrap();
        let sig = sign_dir(&dir);
        let library = BlockLibrary::new(&sig);
        let weak = weak_hash(&block);

        let found = library.find(weak, &block, None, None).unwrap();
        assert_eq!(found, BlockMatch { file_index: 0, block_index: 0 });

        let found = library.find(weak, &block, Some(1), None).unwrap();
        assert_eq!(found.file_index, 1);

        let found = library.find(weak, &block, Some(1), Some((0, 1))).unwrap();
        assert_eq!(found, BlockMatch { file_index: 0, block_index: 1 });
    }

    #[test]
    fn library_requires_same_length_and_strong_hash() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("s"), b"short").unwrap();
        let sig = sign_dir(&dir);
        let library = BlockLibrary::new(&sig);

        assert!(library.has_weak(weak_hash(b"short")));
        assert!(library.find(weak_hash(b"short"), b"short", None, None).is_some());
        assert!(library.find(weak_hash(b"short"), b"shor", None, None).is_none());
        assert!(library.find(weak_hash(b"short"), b"other", None, None).is_none());
        assert!(library.find(12345, b"short", None, None).is_none());
    }

    #[test]
    fn empty_signature_library() {
        let sig = Signature::new(Container::default(), Vec::new()).unwrap();
        assert!(BlockLibrary::new(&sig).is_empty());
    }
}
