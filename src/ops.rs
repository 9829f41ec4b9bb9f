//! Patch operations and the per-file op stream.
//!
//! A file is reconstructed from a sequence of [`SyncOp`]s: block ranges copied
//! from the old version and literal data, closed by
//! [`SyncOp::HeyYouDidIt`]. Adjacent matches are coalesced so a stream always
//! uses as few, as large, ranges as possible.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::signature::BLOCK_SIZE;

/// Largest payload of a single [`SyncOp::Data`] (4 MiB).
pub const MAX_DATA_OP: usize = 4 * 1024 * 1024;

/// One instruction of a file's op stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncOp {
    /// Copy `block_span` consecutive blocks of target file `file_index`,
    /// starting at `block_index`. The last block of a file may be short.
    BlockRange {
        /// Target container file index.
        file_index: u64,
        /// First block to copy.
        block_index: u64,
        /// Number of blocks.
        block_span: u64,
    },
    /// Fresh bytes.
    Data(Vec<u8>),
    /// End of this file's op stream.
    HeyYouDidIt,
}

impl SyncOp {
    /// Create a block range.
    #[must_use]
    pub const fn block_range(file_index: u64, block_index: u64, block_span: u64) -> Self {
        Self::BlockRange {
            file_index,
            block_index,
            block_span,
        }
    }

    /// Check if this is a block range.
    #[must_use]
    pub const fn is_block_range(&self) -> bool {
        matches!(self, Self::BlockRange { .. })
    }

    /// Check if this is fresh data.
    #[must_use]
    pub const fn is_data(&self) -> bool {
        matches!(self, Self::Data(_))
    }
}

/// How a source file's contents are encoded in the patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncKind {
    /// A stream of [`SyncOp`]s.
    Rsync,
    /// A stream of [`BsdiffControl`](crate::bsdiff::BsdiffControl)s against
    /// one target file, then [`SyncOp::HeyYouDidIt`].
    Bsdiff {
        /// Target container file index the controls apply to.
        target_index: u64,
    },
}

/// Precedes every file's section in a patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncHeader {
    /// Source container file index. Files appear in container order.
    pub file_index: u64,
    /// Encoding of the section.
    pub kind: SyncKind,
}

/// Number of blocks in a file of `size` bytes.
#[must_use]
pub const fn num_blocks(size: u64) -> u64 {
    size.div_ceil(BLOCK_SIZE as u64)
}

/// Size of block `block_index` of a file of `file_size` bytes.
#[must_use]
pub const fn block_len(file_size: u64, block_index: u64) -> u64 {
    let start = block_index.saturating_mul(BLOCK_SIZE as u64);
    if start >= file_size {
        0
    } else if file_size - start < BLOCK_SIZE as u64 {
        file_size - start
    } else {
        BLOCK_SIZE as u64
    }
}

/// Bytes covered by `block_span` blocks starting at `block_index` in a file of
/// `file_size` bytes.
#[must_use]
pub const fn range_len(file_size: u64, block_index: u64, block_span: u64) -> u64 {
    let start = block_index.saturating_mul(BLOCK_SIZE as u64);
    let end = block_index
        .saturating_add(block_span)
        .saturating_mul(BLOCK_SIZE as u64);
    let end = if end > file_size { file_size } else { end };
    end.saturating_sub(start)
}

/// End block of a non-empty `block_span` starting at `block_index`, if the
/// whole range lies inside a file of `file_size` bytes.
#[must_use]
pub fn checked_block_range(file_size: u64, block_index: u64, block_span: u64) -> Option<u64> {
    block_index
        .checked_add(block_span)
        .filter(|&end| block_span > 0 && end <= num_blocks(file_size))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Run {
    file_index: u64,
    block_index: u64,
    block_span: u64,
}

/// Builds one file's op stream, merging contiguous matches and splitting
/// fresh data into bounded chunks.
pub struct OpEmitter<'a> {
    emit: &'a mut dyn FnMut(SyncOp) -> Result<()>,
    pending: Option<Run>,
    reused_bytes: u64,
    fresh_bytes: u64,
}

impl<'a> OpEmitter<'a> {
    /// Create an emitter forwarding finished ops to `emit`.
    pub fn new(emit: &'a mut dyn FnMut(SyncOp) -> Result<()>) -> Self {
        Self {
            emit,
            pending: None,
            reused_bytes: 0,
            fresh_bytes: 0,
        }
    }

    /// Where a match would have to be to extend the pending range.
    #[must_use]
    pub fn next_expected(&self) -> Option<(u64, u64)> {
        self.pending
            .map(|run| (run.file_index, run.block_index + run.block_span))
    }

    /// Record a matched block of `len` bytes.
    ///
    /// # Errors
    ///
    /// Propagates errors from the output callback.
    pub fn push_block(&mut self, file_index: u64, block_index: u64, len: u64) -> Result<()> {
        self.reused_bytes += len;
        if let Some(run) = &mut self.pending {
            if run.file_index == file_index && run.block_index + run.block_span == block_index {
                run.block_span += 1;
                return Ok(());
            }
        }
        self.flush()?;
        self.pending = Some(Run {
            file_index,
            block_index,
            block_span: 1,
        });
        Ok(())
    }

    /// Record fresh bytes.
    ///
    /// # Errors
    ///
    /// Propagates errors from the output callback.
    pub fn push_data(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.flush()?;
        self.fresh_bytes += data.len() as u64;
        for chunk in data.chunks(MAX_DATA_OP) {
            (self.emit)(SyncOp::Data(chunk.to_vec()))?;
        }
        Ok(())
    }

    /// Emit the pending range, if any.
    ///
    /// # Errors
    ///
    /// Propagates errors from the output callback.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(run) = self.pending.take() {
            (self.emit)(SyncOp::block_range(
                run.file_index,
                run.block_index,
                run.block_span,
            ))?;
        }
        Ok(())
    }

    /// Flush and return `(reused_bytes, fresh_bytes)`.
    ///
    /// # Errors
    ///
    /// Propagates errors from the output callback.
    pub fn finish(mut self) -> Result<(u64, u64)> {
        self.flush()?;
        Ok((self.reused_bytes, self.fresh_bytes))
    }
}
