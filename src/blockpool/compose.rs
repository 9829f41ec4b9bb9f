//! Maps every big block of the new container to where its bytes come from.
//!
//! Reading a patch once without touching any file data tells which new big
//! blocks are verbatim copies of old big blocks (their hash is already
//! known), which old blocks must be fetched, and which new blocks must be
//! produced and uploaded.

use std::io::Read;

use rustc_hash::FxHashMap;

use super::{big_block_len, check_big_block_size, num_big_blocks, BlockFilter, BlockLocation};
use crate::container::Container;
use crate::error::{Result, SuturaError};
use crate::ops::{checked_block_range, range_len, SyncKind, SyncOp};
use crate::patch::PatchReader;
use crate::signature::BLOCK_SIZE;

/// Where a run of bytes of a new big block comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Bytes of an old file.
    Block {
        /// Old container file index.
        file_index: u64,
        /// Byte offset in the old file.
        offset: u64,
        /// Byte count.
        size: u64,
    },
    /// Bytes carried by the patch.
    Fresh {
        /// Byte count.
        size: u64,
    },
}

impl Origin {
    /// Bytes covered.
    #[must_use]
    pub const fn size(&self) -> u64 {
        match *self {
            Self::Block { size, .. } | Self::Fresh { size } => size,
        }
    }

    const fn split(self, at: u64) -> (Self, Self) {
        match self {
            Self::Block {
                file_index,
                offset,
                size,
            } => (
                Self::Block {
                    file_index,
                    offset,
                    size: at,
                },
                Self::Block {
                    file_index,
                    offset: offset + at,
                    size: size - at,
                },
            ),
            Self::Fresh { size } => (Self::Fresh { size: at }, Self::Fresh { size: size - at }),
        }
    }
}

/// Origins of one new big block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Composition {
    /// The new block.
    pub location: BlockLocation,
    /// Its bytes, in order.
    pub origins: Vec<Origin>,
    /// Old file the whole new file was diffed against with bsdiff. Every
    /// block of that file is needed to rebuild this one.
    pub derived_from: Option<u64>,
}

impl Composition {
    /// Bytes covered.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.origins.iter().map(Origin::size).sum()
    }

    /// The old big block this block is an exact copy of, if any.
    #[must_use]
    pub fn reused_block(&self, target: &Container, big_block_size: u64) -> Option<BlockLocation> {
        if self.derived_from.is_some() {
            return None;
        }
        let [Origin::Block {
            file_index,
            offset,
            size,
        }] = self.origins.as_slice()
        else {
            return None;
        };
        if offset % big_block_size != 0 {
            return None;
        }
        let old = target.files.get(usize::try_from(*file_index).ok()?)?;
        let block_index = offset / big_block_size;
        (*size > 0 && big_block_len(old.size, block_index, big_block_size) == *size)
            .then_some(BlockLocation::new(*file_index, block_index))
    }
}

/// Accumulates origins for one new file and cuts them at big block edges.
struct Composer<'a> {
    out: &'a mut Vec<Composition>,
    file_index: u64,
    file_size: u64,
    big_block_size: u64,
    written: u64,
    current: Composition,
}

impl<'a> Composer<'a> {
    fn new(
        out: &'a mut Vec<Composition>,
        file_index: u64,
        file_size: u64,
        big_block_size: u64,
        derived_from: Option<u64>,
    ) -> Self {
        Self {
            out,
            file_index,
            file_size,
            big_block_size,
            written: 0,
            current: Composition {
                location: BlockLocation::new(file_index, 0),
                origins: Vec::new(),
                derived_from,
            },
        }
    }

    fn push(&mut self, origin: Origin) -> Result<()> {
        if self.written + origin.size() > self.file_size {
            return Err(SuturaError::Malformed(format!(
                "patch writes past the end of new file {}",
                self.file_index
            )));
        }
        let mut rest = origin;
        while rest.size() > 0 {
            let block_len = big_block_len(
                self.file_size,
                self.current.location.block_index,
                self.big_block_size,
            );
            let room = block_len - self.current.size();
            let (head, tail) = rest.split(rest.size().min(room));
            self.append(head);
            self.written += head.size();
            rest = tail;
            if self.current.size() == block_len {
                let next = Composition {
                    location: BlockLocation::new(
                        self.file_index,
                        self.current.location.block_index + 1,
                    ),
                    origins: Vec::new(),
                    derived_from: self.current.derived_from,
                };
                let done = std::mem::replace(&mut self.current, next);
                self.out.push(done);
            }
        }
        Ok(())
    }

    fn append(&mut self, origin: Origin) {
        let merged = match (self.current.origins.last_mut(), origin) {
            (Some(Origin::Fresh { size }), Origin::Fresh { size: more }) => {
                *size += more;
                true
            }
            (
                Some(Origin::Block {
                    file_index,
                    offset,
                    size,
                }),
                Origin::Block {
                    file_index: next_file,
                    offset: next_offset,
                    size: more,
                },
            ) if *file_index == next_file && *offset + *size == next_offset => {
                *size += more;
                true
            }
            _ => false,
        };
        if !merged {
            self.current.origins.push(origin);
        }
    }

    fn finish(self) -> Result<()> {
        if self.written != self.file_size {
            return Err(SuturaError::Malformed(format!(
                "patch wrote {} bytes of new file {}, expected {}",
                self.written, self.file_index, self.file_size
            )));
        }
        Ok(())
    }
}

/// Read every section of `patch` and describe each new big block.
///
/// # Errors
///
/// Returns `Usage` for a bad big block size and `Malformed` or `Truncated`
/// for a broken patch.
pub fn compose<R: Read>(
    patch: &mut PatchReader<R>,
    big_block_size: u64,
) -> Result<Vec<Composition>> {
    check_big_block_size(big_block_size)?;
    let old_sizes: Vec<u64> = patch.target.files.iter().map(|f| f.size).collect();
    let new_sizes: Vec<u64> = patch.source.files.iter().map(|f| f.size).collect();
    let mut out = Vec::new();

    while let Some(header) = patch.next_file()? {
        let size = usize::try_from(header.file_index)
            .ok()
            .and_then(|i| new_sizes.get(i).copied())
            .unwrap_or(0);
        match header.kind {
            SyncKind::Rsync => {
                let mut composer =
                    Composer::new(&mut out, header.file_index, size, big_block_size, None);
                loop {
                    match patch.next_op()? {
                        SyncOp::BlockRange {
                            file_index,
                            block_index,
                            block_span,
                        } => {
                            let old_size = usize::try_from(file_index)
                                .ok()
                                .and_then(|i| old_sizes.get(i).copied())
                                .ok_or_else(|| {
                                    SuturaError::Malformed(format!(
                                        "block range refers to missing old file {file_index}"
                                    ))
                                })?;
                            if checked_block_range(old_size, block_index, block_span).is_none() {
                                return Err(SuturaError::Malformed(format!(
                                    "block range {block_index}+{block_span} outside old file {file_index}"
                                )));
                            }
                            composer.push(Origin::Block {
                                file_index,
                                offset: block_index * BLOCK_SIZE as u64,
                                size: range_len(old_size, block_index, block_span),
                            })?;
                        }
                        SyncOp::Data(data) => composer.push(Origin::Fresh {
                            size: data.len() as u64,
                        })?,
                        SyncOp::HeyYouDidIt => break,
                    }
                }
                composer.finish()?;
            }
            SyncKind::Bsdiff { target_index } => {
                if usize::try_from(target_index).map_or(true, |i| i >= old_sizes.len()) {
                    return Err(SuturaError::Malformed(format!(
                        "bsdiff section refers to missing old file {target_index}"
                    )));
                }
                while !patch.next_control()?.eof {}
                patch.end_bsdiff()?;
                let mut composer = Composer::new(
                    &mut out,
                    header.file_index,
                    size,
                    big_block_size,
                    Some(target_index),
                );
                composer.push(Origin::Fresh { size })?;
                composer.finish()?;
            }
        }
    }
    Ok(out)
}

/// What a remote apply has to move.
#[derive(Debug, Clone, Default)]
pub struct BlockPlan {
    /// New blocks that are exact copies of old blocks.
    pub reused: FxHashMap<BlockLocation, BlockLocation>,
    /// Old blocks that must be fetched.
    pub required_old: BlockFilter,
    /// New blocks that must be stored.
    pub fresh_new: BlockFilter,
}

impl BlockPlan {
    /// Plan from the compositions of a patch against `target`.
    #[must_use]
    pub fn from_compositions(
        compositions: &[Composition],
        target: &Container,
        big_block_size: u64,
    ) -> Self {
        let mut plan = Self::default();
        for composition in compositions {
            if let Some(old) = composition.reused_block(target, big_block_size) {
                plan.reused.insert(composition.location, old);
                continue;
            }
            plan.fresh_new.set(composition.location);
            if let Some(old_file) = composition.derived_from {
                let size = usize::try_from(old_file)
                    .ok()
                    .and_then(|i| target.files.get(i))
                    .map_or(0, |f| f.size);
                for block in 0..num_big_blocks(size, big_block_size) {
                    plan.required_old.set(BlockLocation::new(old_file, block));
                }
            }
            for origin in &composition.origins {
                if let Origin::Block {
                    file_index,
                    offset,
                    size,
                } = *origin
                {
                    if size == 0 {
                        continue;
                    }
                    let first = offset / big_block_size;
                    let last = (offset + size - 1) / big_block_size;
                    for block in first..=last {
                        plan.required_old.set(BlockLocation::new(file_index, block));
                    }
                }
            }
        }
        plan
    }
}
