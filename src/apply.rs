//! Applying patches: rebuild the source tree from the target tree and a
//! patch, checking every target block that gets reused.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::fs::File;
//! use std::path::Path;
//! use sutura::{ApplyBuilder, NoProgress};
//!
//! let mut context = ApplyBuilder::new()
//!     .output_dir(Path::new("build/v2"))
//!     .build()
//!     .unwrap();
//! let patch = File::open("v1-to-v2.patch").unwrap();
//! let stats = context
//!     .apply_patch(patch, Path::new("build/v1"), &NoProgress)
//!     .unwrap();
//! println!("{} files written", stats.touched_files);
//! ```

use std::cmp::Reverse;
use std::fs;
use std::io::{self, Read, SeekFrom, Write};
use std::path::{Path, PathBuf};

use rustc_hash::FxHashSet;
use tracing::{debug, info};

use crate::bsdiff::BsPatcher;
use crate::container::{native_path, Container};
use crate::error::{Result, SuturaError};
use crate::hash::StrongHash;
use crate::ops::{block_len, checked_block_range, num_blocks, SyncHeader, SyncKind, SyncOp};
use crate::patch::PatchReader;
use crate::pool::{presize, read_full, FsPool, NullWritablePool, Pool, PoolWriter, WritablePool};
use crate::progress::{ByteCounter, Progress};
use crate::signature::{BlockHash, Signature, BLOCK_SIZE};
use crate::wounds::{pipeline, Wound, WoundSender, WoundsCollector, WoundsConsumer, WoundsWriter};

/// Directory, inside the target, where in-place apply stages new files.
pub const STAGE_DIR: &str = ".sutura-stage";

/// Where the rebuilt tree goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyMode {
    /// Write the new tree to a separate directory.
    OutOfPlace(PathBuf),
    /// Replace the target tree. Needs an explicit opt-in.
    InPlace,
    /// Read and check everything, write nothing.
    DryRun,
}

/// Counters of one apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    /// Files written to the output.
    pub touched_files: usize,
    /// Files left alone because they did not change (in-place only).
    pub noop_files: usize,
    /// Staged files moved over the live tree (in-place only).
    pub moved_files: usize,
    /// Target files and symlinks removed (in-place only).
    pub deleted_files: usize,
    /// Bytes written to the stage directory (in-place only).
    pub stage_size: u64,
    /// Bytes replaced from the heal source.
    pub healed_bytes: u64,
    /// Corrupt target ranges found.
    pub wounds: usize,
}

enum WoundHandling {
    Fail,
    Write(PathBuf),
    Heal(Box<dyn Pool>),
}

/// Builder for an [`ApplyContext`].
#[derive(Default)]
pub struct ApplyBuilder {
    mode: Option<ApplyMode>,
    allow_in_place: bool,
    signature: Option<Signature>,
    wounds_path: Option<PathBuf>,
    heal_source: Option<Box<dyn Pool>>,
}

impl ApplyBuilder {
    /// Create a builder with no output chosen yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the mode directly.
    #[must_use]
    pub fn mode(mut self, mode: ApplyMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Write the new tree to `dir`.
    #[must_use]
    pub fn output_dir(self, dir: &Path) -> Self {
        self.mode(ApplyMode::OutOfPlace(dir.to_path_buf()))
    }

    /// Patch the target tree in place. Also needs
    /// [`allow_in_place`](Self::allow_in_place).
    #[must_use]
    pub fn in_place(self) -> Self {
        self.mode(ApplyMode::InPlace)
    }

    /// Check the patch against the target without writing anything.
    #[must_use]
    pub fn dry_run(self) -> Self {
        self.mode(ApplyMode::DryRun)
    }

    /// Allow [`ApplyMode::InPlace`].
    #[must_use]
    pub const fn allow_in_place(mut self, allow: bool) -> Self {
        self.allow_in_place = allow;
        self
    }

    /// Check reused target blocks against `signature`.
    #[must_use]
    pub fn signature(mut self, signature: Signature) -> Self {
        self.signature = Some(signature);
        self
    }

    /// Record corrupt target ranges to an artifact and keep going.
    #[must_use]
    pub fn wounds_path(mut self, path: &Path) -> Self {
        self.wounds_path = Some(path.to_path_buf());
        self
    }

    /// Replace corrupt target ranges with bytes from `source`, a pool over a
    /// healthy copy of the target.
    #[must_use]
    pub fn heal_source(mut self, source: Box<dyn Pool>) -> Self {
        self.heal_source = Some(source);
        self
    }

    /// Check the options and build the context.
    ///
    /// # Errors
    ///
    /// Returns a `Usage` error when no mode was chosen, when in-place mode
    /// was not allowed, or when both a wounds path and a heal source are set.
    pub fn build(self) -> Result<ApplyContext> {
        let mode = self
            .mode
            .ok_or_else(|| SuturaError::Usage("no output directory given".to_string()))?;
        if mode == ApplyMode::InPlace && !self.allow_in_place {
            return Err(SuturaError::Usage(
                "in-place apply must be allowed explicitly".to_string(),
            ));
        }
        let wounds = match (self.wounds_path, self.heal_source) {
            (Some(_), Some(_)) => {
                return Err(SuturaError::Usage(
                    "wounds path and heal source are mutually exclusive".to_string(),
                ))
            }
            (Some(path), None) => WoundHandling::Write(path),
            (None, Some(source)) => WoundHandling::Heal(source),
            (None, None) => WoundHandling::Fail,
        };
        Ok(ApplyContext {
            mode,
            signature: self.signature,
            wounds,
        })
    }
}

/// Applies patches.
pub struct ApplyContext {
    mode: ApplyMode,
    signature: Option<Signature>,
    wounds: WoundHandling,
}

/// Result of streaming every section of a patch.
struct Run {
    stats: ApplyStats,
    staged: Vec<bool>,
}

impl ApplyContext {
    /// The configured mode.
    #[must_use]
    pub const fn mode(&self) -> &ApplyMode {
        &self.mode
    }

    /// Apply `patch` to the tree at `target_dir`. Progress follows the bytes
    /// of the new tree.
    ///
    /// # Errors
    ///
    /// Returns a format error for a bad patch, `Integrity` for a corrupt
    /// target block when no wound policy is set, and `Usage` when an
    /// out-of-place output is the target itself.
    pub fn apply_patch<R: Read>(
        &mut self,
        patch: R,
        target_dir: &Path,
        progress: &dyn Progress,
    ) -> Result<ApplyStats> {
        let mut patch = PatchReader::open(patch)?;
        let mut target_pool = FsPool::new(&patch.target, target_dir);

        let stats = match self.mode.clone() {
            ApplyMode::OutOfPlace(out) => {
                if out == target_dir {
                    return Err(SuturaError::Usage(
                        "output directory is the target, use in-place mode".to_string(),
                    ));
                }
                patch.source.prepare(&out)?;
                let mut output = FsPool::new(&patch.source, &out);
                self.run(&mut patch, &mut target_pool, &mut output, false, progress)?
                    .stats
            }
            ApplyMode::DryRun => {
                self.run(
                    &mut patch,
                    &mut target_pool,
                    &mut NullWritablePool,
                    false,
                    progress,
                )?
                .stats
            }
            ApplyMode::InPlace => {
                self.apply_in_place(&mut patch, &mut target_pool, target_dir, progress)?
            }
        };

        info!(
            touched = stats.touched_files,
            noop = stats.noop_files,
            deleted = stats.deleted_files,
            healed = stats.healed_bytes,
            wounds = stats.wounds,
            "applied patch"
        );
        Ok(stats)
    }

    /// Apply an opened patch, reading the old files from `target_pool` and
    /// writing every new file to `output`.
    ///
    /// # Errors
    ///
    /// Same as [`apply_patch`](Self::apply_patch).
    pub fn apply_with_pools<R: Read>(
        &mut self,
        patch: &mut PatchReader<R>,
        target_pool: &mut dyn Pool,
        output: &mut dyn WritablePool,
        progress: &dyn Progress,
    ) -> Result<ApplyStats> {
        Ok(self.run(patch, target_pool, output, false, progress)?.stats)
    }

    fn apply_in_place<R: Read>(
        &mut self,
        patch: &mut PatchReader<R>,
        target_pool: &mut FsPool,
        target_dir: &Path,
        progress: &dyn Progress,
    ) -> Result<ApplyStats> {
        let stage = target_dir.join(STAGE_DIR);
        if stage.exists() {
            fs::remove_dir_all(&stage)?;
        }
        fs::create_dir_all(&stage)?;

        let mut output = FsPool::new(&patch.source, &stage);
        let Run { mut stats, staged } =
            self.run(patch, target_pool, &mut output, true, progress)?;
        target_pool.close()?;

        let source = &patch.source;
        stats.deleted_files = delete_removed(&patch.target, source, target_dir)?;

        for (file, _) in source.files.iter().zip(&staged).filter(|(_, s)| **s) {
            let from = native_path(&stage, &file.path);
            let to = native_path(target_dir, &file.path);
            if to.is_dir() {
                fs::remove_dir_all(&to)?;
            }
            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(&from, &to)?;
            stats.moved_files += 1;
            stats.stage_size += file.size;
        }
        fs::remove_dir_all(&stage)?;

        source.prepare(target_dir)?;
        Ok(stats)
    }

    fn run<R: Read>(
        &mut self,
        patch: &mut PatchReader<R>,
        target_pool: &mut dyn Pool,
        output: &mut dyn WritablePool,
        detect_noops: bool,
        progress: &dyn Progress,
    ) -> Result<Run> {
        let target = patch.target.clone();
        let source = patch.source.clone();
        let mut counter = ByteCounter::new(progress, source.size);
        let noop_targets = if detect_noops {
            noop_candidates(&target, &patch.source)
        } else {
            vec![None; patch.source.files.len()]
        };

        let Self {
            signature, wounds, ..
        } = self;
        let hashes = signature
            .as_ref()
            .map(|signature| hashes_by_path(signature, &target))
            .unwrap_or_default();
        let (mut consumer, repair): (Box<dyn WoundsConsumer>, Repair<'_>) = match wounds {
            WoundHandling::Fail => (Box::new(WoundsCollector::new()), Repair::Fail),
            WoundHandling::Write(path) => (Box::new(WoundsWriter::new(path)), Repair::Record),
            WoundHandling::Heal(source) => {
                (Box::new(WoundsCollector::new()), Repair::Heal(source.as_mut()))
            }
        };

        let mut blocks = BlockReader {
            target: &target,
            pool: target_pool,
            hashes,
            repair,
            cursor: None,
            missing: FxHashSet::default(),
            block: Vec::with_capacity(BLOCK_SIZE),
            healed_bytes: 0,
        };

        let mut stats = ApplyStats::default();
        let mut staged = vec![false; source.files.len()];
        pipeline(&target, consumer.as_mut(), |tx| {
            while let Some(header) = patch.next_file()? {
                let index = usize::try_from(header.file_index).unwrap_or(usize::MAX);
                let noop = noop_targets.get(index).copied().flatten();
                if let Some(file) = source.files.get(index) {
                    counter.label(&file.path);
                }
                match apply_file(patch, header, &mut blocks, output, noop, tx)? {
                    FileOutcome::Noop => stats.noop_files += 1,
                    FileOutcome::Written => {
                        stats.touched_files += 1;
                        staged[index] = true;
                    }
                }
                counter.add(source.files[index].size);
            }
            Ok(())
        })?;
        counter.finish();
        if let Repair::Heal(source) = &mut blocks.repair {
            source.close()?;
        }
        blocks.pool.close()?;

        stats.healed_bytes = blocks.healed_bytes;
        stats.wounds = consumer.summary().count;
        Ok(Run { stats, staged })
    }
}

/// For every source file, the same-path target file of equal size, if any.
fn noop_candidates(target: &Container, source: &Container) -> Vec<Option<usize>> {
    let by_path = target.file_index_by_path();
    source
        .files
        .iter()
        .map(|file| {
            by_path
                .get(file.path.as_str())
                .copied()
                .filter(|&t| target.files[t].size == file.size)
        })
        .collect()
}

/// Signature hashes for every target file, matched by path and size. Files
/// the signature does not describe get no hashes and are not checked.
fn hashes_by_path<'s>(signature: &'s Signature, target: &Container) -> Vec<&'s [BlockHash]> {
    let by_path = signature.container.file_index_by_path();
    target
        .files
        .iter()
        .map(|file| match by_path.get(file.path.as_str()) {
            Some(&i) if signature.container.files[i].size == file.size => {
                signature.file_hashes(i)
            }
            _ => {
                debug!(path = %file.path, "not covered by signature");
                &[]
            }
        })
        .collect()
}

/// Remove target files, symlinks and directories the source does not have.
/// Directories go longest path first and are kept if something else still
/// lives in them.
fn delete_removed(target: &Container, source: &Container, dir: &Path) -> Result<usize> {
    let kept: FxHashSet<&str> = source
        .files
        .iter()
        .map(|f| f.path.as_str())
        .chain(source.symlinks.iter().map(|s| s.path.as_str()))
        .collect();
    let kept_dirs: FxHashSet<&str> = source.dirs.iter().map(|d| d.path.as_str()).collect();

    let mut deleted = 0;
    let removed = target
        .files
        .iter()
        .map(|f| f.path.as_str())
        .chain(target.symlinks.iter().map(|s| s.path.as_str()))
        .filter(|path| !kept.contains(path));
    for path in removed {
        match fs::remove_file(native_path(dir, path)) {
            Ok(()) => {
                debug!(path, "deleted");
                deleted += 1;
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }

    let mut dirs: Vec<&str> = target
        .dirs
        .iter()
        .map(|d| d.path.as_str())
        .filter(|path| !kept_dirs.contains(path))
        .collect();
    dirs.sort_by_key(|path| Reverse(path.len()));
    for path in dirs {
        if let Err(err) = fs::remove_dir(native_path(dir, path)) {
            debug!(path, error = %err, "kept directory");
        }
    }
    Ok(deleted)
}

// =============================================================================
// FILE RECONSTRUCTION
// =============================================================================

enum Repair<'a> {
    Fail,
    Record,
    Heal(&'a mut dyn Pool),
}

/// Reads target blocks, checking each against the signature and routing
/// corrupt ones through the wound policy.
struct BlockReader<'a> {
    target: &'a Container,
    pool: &'a mut dyn Pool,
    hashes: Vec<&'a [BlockHash]>,
    repair: Repair<'a>,
    cursor: Option<(usize, u64)>,
    missing: FxHashSet<usize>,
    block: Vec<u8>,
    healed_bytes: u64,
}

impl BlockReader<'_> {
    fn file(&self, file_index: u64) -> Result<usize> {
        usize::try_from(file_index)
            .ok()
            .filter(|&i| i < self.target.files.len())
            .ok_or_else(|| {
                SuturaError::Malformed(format!("patch refers to missing target file {file_index}"))
            })
    }

    /// Read into `self.block` from `offset` of `file`. A missing file reads
    /// as empty.
    fn read_at(&mut self, file: usize, offset: u64) -> Result<usize> {
        if self.missing.contains(&file) {
            return Ok(0);
        }
        let reader = match self.pool.seekable_reader(file) {
            Ok(reader) => reader,
            Err(SuturaError::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.target.files[file].path, "target file missing");
                self.missing.insert(file);
                self.cursor = None;
                return Ok(0);
            }
            Err(err) => return Err(err),
        };
        if self.cursor != Some((file, offset)) {
            reader.seek(SeekFrom::Start(offset))?;
        }
        let n = read_full(reader, &mut self.block)?;
        self.cursor = Some((file, offset + n as u64));
        Ok(n)
    }

    fn expected(&self, file: usize, block: u64) -> Option<&BlockHash> {
        let block = usize::try_from(block).ok()?;
        self.hashes.get(file).and_then(|hashes| hashes.get(block))
    }

    /// Load one block of `file` into `self.block`, repairing it if needed.
    fn read_block(&mut self, file: usize, block: u64, tx: &mut WoundSender) -> Result<()> {
        let size = self.target.files[file].size;
        #[allow(clippy::cast_possible_truncation)]
        let len = block_len(size, block) as usize;
        let offset = block * BLOCK_SIZE as u64;
        self.block.clear();
        self.block.resize(len, 0);

        let got = self.read_at(file, offset)?;
        let intact = got == len
            && self
                .expected(file, block)
                .map_or(true, |hash| StrongHash::compute(&self.block) == hash.strong);
        if intact {
            return Ok(());
        }
        self.block[got..].fill(0);

        let wound = Wound::file(file as u64, offset, offset + len as u64);
        match &mut self.repair {
            Repair::Fail => return Err(wound.to_error(self.target)),
            Repair::Record => {}
            Repair::Heal(source) => {
                let reader = source.seekable_reader(file)?;
                reader.seek(SeekFrom::Start(offset))?;
                let healed = read_full(reader, &mut self.block)?;
                let verified = healed == len
                    && self
                        .hashes
                        .get(file)
                        .and_then(|hashes| usize::try_from(block).ok().and_then(|b| hashes.get(b)))
                        .map_or(true, |hash| StrongHash::compute(&self.block) == hash.strong);
                if !verified {
                    return Err(wound.to_error(self.target));
                }
                debug!(path = %self.target.files[file].path, offset, "healed block");
                self.healed_bytes += len as u64;
            }
        }
        tx.send(wound)
    }

    fn copy_range(
        &mut self,
        file_index: u64,
        block_index: u64,
        block_span: u64,
        out: &mut dyn Write,
        tx: &mut WoundSender,
    ) -> Result<()> {
        let file = self.file(file_index)?;
        let end = checked_block_range(self.target.files[file].size, block_index, block_span)
            .ok_or_else(|| {
                SuturaError::Malformed(format!(
                    "block range {block_index}+{block_span} outside {}",
                    self.target.files[file].path
                ))
            })?;
        for block in block_index..end {
            self.read_block(file, block, tx)?;
            out.write_all(&self.block)?;
        }
        Ok(())
    }

    fn read_file(&mut self, file_index: u64, tx: &mut WoundSender) -> Result<Vec<u8>> {
        let file = self.file(file_index)?;
        let size = self.target.files[file].size;
        let mut data = Vec::with_capacity(presize(size));
        for block in 0..num_blocks(size) {
            self.read_block(file, block, tx)?;
            data.extend_from_slice(&self.block);
        }
        Ok(data)
    }
}

enum FileOutcome {
    Written,
    Noop,
}

/// Counts what goes into a pool writer.
struct CountingWriter<'a> {
    inner: Box<dyn PoolWriter + 'a>,
    written: u64,
}

impl Write for CountingWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn apply_file<R: Read>(
    patch: &mut PatchReader<R>,
    header: SyncHeader,
    blocks: &mut BlockReader<'_>,
    output: &mut dyn WritablePool,
    noop_target: Option<usize>,
    tx: &mut WoundSender,
) -> Result<FileOutcome> {
    let index = usize::try_from(header.file_index).unwrap_or(usize::MAX);
    let (path, size) = match patch.source.files.get(index) {
        Some(file) => (file.path.clone(), file.size),
        None => {
            return Err(SuturaError::Malformed(format!(
                "section for unknown source file {index}"
            )))
        }
    };

    let mut writer = match header.kind {
        SyncKind::Rsync => {
            let mut pending = Vec::with_capacity(2);
            let first = patch.next_op()?;
            if let Some(target) = noop_target {
                if size == 0 && first == SyncOp::HeyYouDidIt {
                    debug!(path = %path, "unchanged");
                    return Ok(FileOutcome::Noop);
                }
                if first == SyncOp::block_range(target as u64, 0, num_blocks(size)) {
                    let second = patch.next_op()?;
                    if second == SyncOp::HeyYouDidIt {
                        debug!(path = %path, "unchanged");
                        return Ok(FileOutcome::Noop);
                    }
                    pending.push(second);
                }
            }
            pending.insert(0, first);

            let mut writer = CountingWriter {
                inner: output.writer(index)?,
                written: 0,
            };
            let mut pending = pending.into_iter();
            loop {
                let op = match pending.next() {
                    Some(op) => op,
                    None => patch.next_op()?,
                };
                match op {
                    SyncOp::BlockRange {
                        file_index,
                        block_index,
                        block_span,
                    } => blocks.copy_range(file_index, block_index, block_span, &mut writer, tx)?,
                    SyncOp::Data(data) => writer.write_all(&data)?,
                    SyncOp::HeyYouDidIt => break,
                }
            }
            writer
        }
        SyncKind::Bsdiff { target_index } => {
            let old = blocks.read_file(target_index, tx)?;
            let mut writer = CountingWriter {
                inner: output.writer(index)?,
                written: 0,
            };
            let mut patcher = BsPatcher::new(&old, size);
            while !patcher.apply(&patch.next_control()?, &mut writer)? {}
            patch.end_bsdiff()?;
            writer
        }
    };

    writer.flush()?;
    if writer.written != size {
        return Err(SuturaError::Malformed(format!(
            "{path}: rebuilt {} bytes, expected {size}",
            writer.written
        )));
    }
    writer.inner.finish()?;
    debug!(path = %path, bytes = size, "rebuilt");
    Ok(FileOutcome::Written)
}
