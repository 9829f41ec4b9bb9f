//! # Sutura
//!
//! Binary delta patching for whole file trees, with corruption detection and
//! healing.
//!
//! Sutura diffs an old tree (the *target*) against a new one (the *source*)
//! and writes a compact patch. Anyone holding only the old tree can rebuild
//! the new one from it. Applying is resilient: corrupt old blocks are found
//! by their hashes and either reported, recorded as *wounds*, or repaired
//! from a healthy copy.
//!
//! ## Features
//!
//! - **Block matching**: rsync-style rolling checksum over 64 KiB blocks,
//!   confirmed with BLAKE3
//! - **bsdiff**: whole-file binary diff when it beats block matching
//! - **Self-describing artifacts**: patches, signatures, wounds and manifests
//!   name their own format and compression (brotli, zstd, gzip)
//! - **Validate and heal**: find corrupt ranges of a tree and repair them
//! - **Block stores**: apply patches to trees kept as content-addressed big
//!   blocks, see [`blockpool`]
//!
//! ## Example
//!
//! ```rust
//! use std::fs;
//! use sutura::{ApplyBuilder, DiffBuilder, NoProgress};
//!
//! let scratch = tempfile::tempdir().unwrap();
//! let (old, new, out) = (
//!     scratch.path().join("old"),
//!     scratch.path().join("new"),
//!     scratch.path().join("out"),
//! );
//! fs::create_dir_all(&old).unwrap();
//! fs::create_dir_all(&new).unwrap();
//! fs::write(old.join("hello.txt"), b"hello world").unwrap();
//! fs::write(new.join("hello.txt"), b"hello, brave new world").unwrap();
//!
//! // Diff the two trees into an in-memory patch
//! let mut patch = Vec::new();
//! let outcome = DiffBuilder::new()
//!     .build()
//!     .unwrap()
//!     .diff_trees(&old, &new, &mut patch, &NoProgress)
//!     .unwrap();
//!
//! // Rebuild the new tree from the old one
//! ApplyBuilder::new()
//!     .output_dir(&out)
//!     .build()
//!     .unwrap()
//!     .apply_patch(patch.as_slice(), &old, &NoProgress)
//!     .unwrap();
//! assert_eq!(
//!     fs::read(out.join("hello.txt")).unwrap(),
//!     b"hello, brave new world"
//! );
//!
//! // The signature computed while diffing validates the result
//! sutura::validate(&out, &outcome.source_signature).unwrap();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

mod apply;
mod archive;
#[cfg(feature = "async")]
pub mod async_sync;
pub mod blockpool;
mod bsdiff;
mod checksum;
mod compression;
mod container;
mod diff;
mod error;
mod hash;
mod heal;
mod ops;
mod patch;
mod pool;
mod progress;
mod rsync;
mod signature;
mod validate;
mod wire;
mod wounds;

pub use apply::{ApplyBuilder, ApplyContext, ApplyMode, ApplyStats, STAGE_DIR};
pub use archive::{Archive, ArchiveEntry, MemoryArchive};
pub use bsdiff::{bsdiff, bspatch, BsPatcher, BsdiffControl, BsdiffStats};
pub use checksum::{weak_hash, RollingChecksum};
pub use compression::{CompressionAlgorithm, CompressionSettings};
pub use container::{
    accept_all, native_path, Container, Dir, EntryInfo, EntryKind, File, Filter, Symlink,
    MODE_MASK, NULL_PATH,
};
pub use diff::{BsdiffPolicy, DiffBuilder, DiffConfig, DiffContext, DiffOutcome, DiffStats};
pub use error::{ErrorCategory, Result, SuturaError};
pub use hash::StrongHash;
pub use heal::{heal_from_dir, heal_from_wounds, Healer};
pub use ops::{
    block_len, checked_block_range, num_blocks, range_len, SyncHeader, SyncKind, SyncOp, MAX_DATA_OP,
};
pub use patch::{PatchReader, PatchWriter};
pub use pool::{ArchivePool, FsPool, NullWritablePool, Pool, PoolWriter, ReadSeek, WritablePool};
pub use progress::{NoProgress, Progress};
pub use signature::{
    compute_signature, read_signature, write_signature, BlockHash, Signature, BLOCK_SIZE,
};
pub use validate::{find_wounds, validate, ValidateBuilder, Validator};
pub use wire::{MANIFEST_MAGIC, PATCH_MAGIC, SIGNATURE_MAGIC, WOUNDS_MAGIC};
pub use wounds::{
    Wound, WoundKind, WoundsCollector, WoundsConsumer, WoundsReader, WoundsSummary, WoundsWriter,
    MAX_WOUND_SIZE,
};
