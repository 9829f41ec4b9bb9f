//! Diff engine: write a patch from an old container's signature to a new tree.
//!
//! Every source file is first matched block by block against the whole old
//! container. Files eligible for bsdiff are then re-diffed against the old
//! file they share the most with, and whichever encoding carries fewer fresh
//! bytes goes into the patch.

use std::io::{Read, Write};
use std::path::Path;

use tracing::{debug, info};

use crate::bsdiff::{bsdiff, BsdiffControl};
use crate::compression::CompressionSettings;
use crate::container::{accept_all, Container, File};
use crate::error::{Result, SuturaError};
use crate::ops::{num_blocks, OpEmitter, SyncHeader, SyncKind, SyncOp};
use crate::patch::PatchWriter;
use crate::pool::{presize, FsPool, Pool};
use crate::progress::{ByteCounter, NoProgress, Progress};
use crate::rsync::RsyncScanner;
use crate::signature::{compute_signature, BlockLibrary, HashingReader, Signature, BLOCK_SIZE};

/// When a file is worth a whole-file binary diff.
///
/// bsdiff holds both versions in memory and suffix-sorts the old one, so it
/// is bounded by file size. Files below one block gain nothing over block
/// matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BsdiffPolicy {
    /// Try bsdiff at all.
    pub enabled: bool,
    /// Smallest new file considered, in bytes.
    pub min_file_size: u64,
    /// Largest old or new file considered, in bytes.
    pub max_file_size: u64,
}

impl Default for BsdiffPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            min_file_size: BLOCK_SIZE as u64,
            max_file_size: 32 * 1024 * 1024,
        }
    }
}

impl BsdiffPolicy {
    /// Never use bsdiff.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    fn admits(&self, size: u64) -> bool {
        self.enabled && (self.min_file_size..=self.max_file_size).contains(&size)
    }
}

/// Configuration for [`DiffContext`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffConfig {
    /// Compression of the patch body.
    pub compression: CompressionSettings,
    /// bsdiff selection.
    pub bsdiff: BsdiffPolicy,
}

/// Builder for [`DiffContext`].
///
/// # Example
///
/// ```rust
/// use sutura::{BsdiffPolicy, CompressionSettings, DiffBuilder};
///
/// let ctx = DiffBuilder::new()
///     .compression(CompressionSettings::none())
///     .bsdiff(BsdiffPolicy::disabled())
///     .build()
///     .unwrap();
/// assert!(!ctx.config().bsdiff.enabled);
/// ```
#[derive(Debug, Default)]
pub struct DiffBuilder {
    config: DiffConfig,
}

impl DiffBuilder {
    /// Create a builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the patch compression.
    #[must_use]
    pub const fn compression(mut self, compression: CompressionSettings) -> Self {
        self.config.compression = compression;
        self
    }

    /// Set the bsdiff policy.
    #[must_use]
    pub const fn bsdiff(mut self, policy: BsdiffPolicy) -> Self {
        self.config.bsdiff = policy;
        self
    }

    /// Build the context.
    ///
    /// # Errors
    ///
    /// Returns a `Usage` error if the bsdiff size window is empty.
    pub fn build(self) -> Result<DiffContext> {
        let policy = self.config.bsdiff;
        if policy.enabled && policy.min_file_size > policy.max_file_size {
            return Err(SuturaError::Usage(format!(
                "bsdiff min size {} exceeds max size {}",
                policy.min_file_size, policy.max_file_size
            )));
        }
        Ok(DiffContext {
            config: self.config,
        })
    }
}

/// Byte accounting of a diff.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStats {
    /// Bytes the receiver must get from the patch.
    pub fresh_bytes: u64,
    /// Bytes the receiver already has.
    pub reused_bytes: u64,
    /// Size of the new container.
    pub source_bytes: u64,
    /// Files encoded as block ops.
    pub rsync_files: usize,
    /// Files encoded as bsdiff controls.
    pub bsdiff_files: usize,
}

impl DiffStats {
    /// Share of the new container that is reused, in `[0, 1]`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn reuse_ratio(&self) -> f64 {
        if self.source_bytes == 0 {
            1.0
        } else {
            self.reused_bytes as f64 / self.source_bytes as f64
        }
    }
}

/// Result of [`DiffContext::write_patch`].
#[derive(Debug, Clone)]
pub struct DiffOutcome {
    /// Byte accounting.
    pub stats: DiffStats,
    /// Signature of the new container, computed while diffing.
    pub source_signature: Signature,
}

/// Writes patches.
#[derive(Debug, Clone, Default)]
pub struct DiffContext {
    config: DiffConfig,
}

impl DiffContext {
    /// Create a context from a configuration.
    #[must_use]
    pub const fn new(config: DiffConfig) -> Self {
        Self { config }
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &DiffConfig {
        &self.config
    }

    /// Write a patch that turns the container described by
    /// `target_signature` into `source_container`.
    ///
    /// `target_pool` gives access to the old files themselves. Without it,
    /// only block matching is possible.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be read or the patch cannot be
    /// written.
    #[allow(clippy::too_many_lines)]
    pub fn write_patch<W: Write>(
        &self,
        target_signature: &Signature,
        source_container: &Container,
        source_pool: &mut dyn Pool,
        mut target_pool: Option<&mut dyn Pool>,
        writer: W,
        progress: &dyn Progress,
    ) -> Result<DiffOutcome> {
        let target = &target_signature.container;
        let target_by_path = target.file_index_by_path();
        let library = BlockLibrary::new(target_signature);
        let mut scanner = RsyncScanner::new(&library);
        let mut patch =
            PatchWriter::new(writer, self.config.compression, target, source_container)?;
        let mut counter = ByteCounter::new(progress, source_container.size);
        let mut stats = DiffStats {
            source_bytes: source_container.size,
            ..DiffStats::default()
        };
        let mut source_hashes = Vec::new();
        let policy = self.config.bsdiff;

        for (file_index, file) in source_container.files.iter().enumerate() {
            counter.label(&file.path);
            let same_path = target_by_path.get(file.path.as_str()).copied();
            let mut hashing = HashingReader::new(source_pool.reader(file_index)?);

            let buffered = target_pool.is_some() && policy.admits(file.size);
            if !buffered {
                patch.begin_file(&SyncHeader {
                    file_index: file_index as u64,
                    kind: SyncKind::Rsync,
                })?;
                let mut sink = |op: SyncOp| patch.write_op(&op);
                let mut emitter = OpEmitter::new(&mut sink);
                scanner.scan(&mut hashing, same_path, &mut emitter, &mut |n| counter.add(n))?;
                let (reused, fresh) = emitter.finish()?;
                check_size(file, reused + fresh)?;
                patch.end_file()?;
                source_hashes.extend(hashing.finish());

                stats.reused_bytes += reused;
                stats.fresh_bytes += fresh;
                stats.rsync_files += 1;
                debug!(path = %file.path, reused, fresh, "rsync");
                continue;
            }

            let mut new = Vec::with_capacity(presize(file.size));
            hashing.read_to_end(&mut new)?;
            check_size(file, new.len() as u64)?;
            source_hashes.extend(hashing.finish());
            counter.add(new.len() as u64);

            let mut ops = Vec::new();
            let mut sink = |op: SyncOp| {
                ops.push(op);
                Ok(())
            };
            let mut emitter = OpEmitter::new(&mut sink);
            let mut slice = new.as_slice();
            let scan = scanner.scan(&mut slice, same_path, &mut emitter, &mut |_| {})?;
            let (reused, fresh) = emitter.finish()?;

            let whole_reuse = match ops.as_slice() {
                [SyncOp::BlockRange {
                    file_index: t,
                    block_index: 0,
                    block_span,
                }] => usize::try_from(*t)
                    .ok()
                    .and_then(|t| target.files.get(t))
                    .is_some_and(|old| {
                        old.size == file.size && *block_span == num_blocks(old.size)
                    }),
                _ => false,
            };

            let candidate = if whole_reuse || fresh == 0 {
                None
            } else {
                scan.best_source(same_path)
                    .or(same_path)
                    .filter(|&t| {
                        let size = target.files[t].size;
                        size > 0 && size <= policy.max_file_size
                    })
            };

            let mut chosen_bsdiff = None;
            if let (Some(t), Some(pool)) = (candidate, target_pool.as_deref_mut()) {
                let mut old = Vec::with_capacity(presize(target.files[t].size));
                pool.reader(t)?.read_to_end(&mut old)?;
                let mut controls = Vec::new();
                let bs = bsdiff(&old, &new, &mut |control: BsdiffControl| {
                    controls.push(control);
                    Ok(())
                })?;
                debug!(
                    path = %file.path,
                    target = %target.files[t].path,
                    rsync_fresh = fresh,
                    bsdiff_fresh = bs.fresh_bytes,
                    "compared encodings"
                );
                if bs.fresh_bytes < fresh {
                    chosen_bsdiff = Some((t, controls, bs));
                }
            }

            match chosen_bsdiff {
                Some((t, controls, bs)) => {
                    patch.begin_file(&SyncHeader {
                        file_index: file_index as u64,
                        kind: SyncKind::Bsdiff {
                            target_index: t as u64,
                        },
                    })?;
                    for control in &controls {
                        patch.write_control(control)?;
                    }
                    patch.end_file()?;
                    stats.reused_bytes += bs.reused_bytes;
                    stats.fresh_bytes += bs.fresh_bytes;
                    stats.bsdiff_files += 1;
                }
                None => {
                    patch.begin_file(&SyncHeader {
                        file_index: file_index as u64,
                        kind: SyncKind::Rsync,
                    })?;
                    for op in &ops {
                        patch.write_op(op)?;
                    }
                    patch.end_file()?;
                    stats.reused_bytes += reused;
                    stats.fresh_bytes += fresh;
                    stats.rsync_files += 1;
                }
            }
        }

        source_pool.close()?;
        if let Some(pool) = target_pool {
            pool.close()?;
        }
        patch.finish()?;
        counter.finish();

        info!(
            files = source_container.files.len(),
            fresh = stats.fresh_bytes,
            reused = stats.reused_bytes,
            bsdiff_files = stats.bsdiff_files,
            "wrote patch"
        );
        Ok(DiffOutcome {
            stats,
            source_signature: Signature::new(source_container.clone(), source_hashes)?,
        })
    }

    /// Diff two directories on disk. Either may be
    /// [`NULL_PATH`](crate::container::NULL_PATH) for an empty tree.
    ///
    /// # Errors
    ///
    /// Returns an error if either tree cannot be walked or read, or the patch
    /// cannot be written.
    pub fn diff_trees<W: Write>(
        &self,
        target_dir: &Path,
        source_dir: &Path,
        writer: W,
        progress: &dyn Progress,
    ) -> Result<DiffOutcome> {
        let target = Container::walk_directory(target_dir, &accept_all)?;
        let mut target_pool = FsPool::new(&target, target_dir);
        let target_signature = compute_signature(&target, &mut target_pool, &NoProgress)?;

        let source = Container::walk_directory(source_dir, &accept_all)?;
        let mut source_pool = FsPool::new(&source, source_dir);
        self.write_patch(
            &target_signature,
            &source,
            &mut source_pool,
            Some(&mut target_pool),
            writer,
            progress,
        )
    }
}

/// A source file must yield exactly the bytes its container entry records.
fn check_size(file: &File, read: u64) -> Result<()> {
    if read == file.size {
        return Ok(());
    }
    Err(SuturaError::Integrity {
        path: file.path.clone(),
        start: read.min(file.size),
        end: read.max(file.size),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bsdiff::bspatch;
    use crate::patch::PatchReader;
    use crate::signature::BlockHash;
    use proptest::prelude::*;
    use std::io::{self, Cursor, Seek};

    /// Pool over in-memory file contents.
    struct VecPool {
        files: Vec<Vec<u8>>,
        current: Option<Cursor<Vec<u8>>>,
    }

    impl VecPool {
        fn new(files: &[Vec<u8>]) -> Self {
            Self {
                files: files.to_vec(),
                current: None,
            }
        }
    }

    impl Pool for VecPool {
        fn reader(&mut self, file_index: usize) -> Result<&mut dyn Read> {
            let data = self.files.get(file_index).cloned().ok_or_else(|| {
                SuturaError::Malformed(format!("no file {file_index}"))
            })?;
            Ok(self.current.insert(Cursor::new(data)))
        }

        fn seekable_reader(&mut self, file_index: usize) -> Result<&mut dyn crate::pool::ReadSeek> {
            let data = self.files[file_index].clone();
            Ok(self.current.insert(Cursor::new(data)))
        }

        fn size(&self, file_index: usize) -> u64 {
            self.files[file_index].len() as u64
        }

        fn close(&mut self) -> Result<()> {
            self.current = None;
            Ok(())
        }
    }

    fn container_of(names: &[&str], files: &[Vec<u8>]) -> Container {
        let mut container = Container::default();
        for (name, data) in names.iter().zip(files) {
            container.files.push(File {
                path: (*name).to_string(),
                mode: 0o644,
                size: data.len() as u64,
                offset: container.size,
            });
            container.size += data.len() as u64;
        }
        container
    }

    fn signature_of(container: &Container, files: &[Vec<u8>]) -> Signature {
        let hashes = files
            .iter()
            .flat_map(|f| f.chunks(BLOCK_SIZE).map(BlockHash::compute).collect::<Vec<_>>())
            .collect();
        Signature::new(container.clone(), hashes).unwrap()
    }

    struct Diffed {
        patch: Vec<u8>,
        outcome: DiffOutcome,
    }

    fn diff(
        ctx: &DiffContext,
        old_names: &[&str],
        old: &[Vec<u8>],
        new_names: &[&str],
        new: &[Vec<u8>],
    ) -> Diffed {
        let target = container_of(old_names, old);
        let source = container_of(new_names, new);
        let signature = signature_of(&target, old);
        let mut source_pool = VecPool::new(new);
        let mut target_pool = VecPool::new(old);
        let mut patch = Vec::new();
        let outcome = ctx
            .write_patch(
                &signature,
                &source,
                &mut source_pool,
                Some(&mut target_pool),
                &mut patch,
                &NoProgress,
            )
            .unwrap();
        Diffed { patch, outcome }
    }

    /// Rebuild every new file from the patch and the old files.
    fn rebuild(patch: &[u8], old: &[Vec<u8>]) -> Vec<Vec<u8>> {
        let mut reader = PatchReader::open(patch).unwrap();
        let sizes: Vec<u64> = reader.source.files.iter().map(|f| f.size).collect();
        let mut out = Vec::new();
        while let Some(header) = reader.next_file().unwrap() {
            let mut data = Vec::new();
            match header.kind {
                SyncKind::Rsync => loop {
                    match reader.next_op().unwrap() {
                        SyncOp::BlockRange {
                            file_index,
                            block_index,
                            block_span,
                        } => {
                            let src = &old[file_index as usize];
                            let start = block_index as usize * BLOCK_SIZE;
                            let end = (start + block_span as usize * BLOCK_SIZE).min(src.len());
                            data.extend_from_slice(&src[start..end]);
                        }
                        SyncOp::Data(bytes) => data.extend_from_slice(&bytes),
                        SyncOp::HeyYouDidIt => break,
                    }
                },
                SyncKind::Bsdiff { target_index } => {
                    let mut controls = Vec::new();
                    loop {
                        let control = reader.next_control().unwrap();
                        let eof = control.eof;
                        controls.push(control);
                        if eof {
                            break;
                        }
                    }
                    reader.end_bsdiff().unwrap();
                    bspatch(
                        &old[target_index as usize],
                        sizes[header.file_index as usize],
                        &controls,
                        &mut data,
                    )
                    .unwrap();
                }
            }
            out.push(data);
        }
        out
    }

    fn noise(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed ^ 0x9E37_79B9_7F4A_7C15;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect()
    }

    // ==========================================================================
    // BUILDER
    // ==========================================================================

    #[test]
    fn builder_rejects_empty_bsdiff_window() {
        let result = DiffBuilder::new()
            .bsdiff(BsdiffPolicy {
                enabled: true,
                min_file_size: 10,
                max_file_size: 5,
            })
            .build();
        assert!(matches!(result, Err(SuturaError::Usage(_))));
    }

    // ==========================================================================
    // ENCODING CHOICE
    // ==========================================================================

    #[test]
    fn identical_trees_reuse_everything() {
        let files = vec![noise(BLOCK_SIZE * 3 + 17, 1), noise(100, 2), Vec::new()];
        let names = ["a", "b", "c"];
        let d = diff(&DiffContext::default(), &names, &files, &names, &files);
        assert_eq!(d.outcome.stats.fresh_bytes, 0);
        assert_eq!(d.outcome.stats.bsdiff_files, 0);
        assert_eq!(rebuild(&d.patch, &files), files);

        let source = container_of(&names, &files);
        assert_eq!(d.outcome.source_signature, signature_of(&source, &files));
    }

    #[test]
    fn periodic_edit_prefers_bsdiff() {
        let old: Vec<u8> = [0x42u8, 0x69].iter().copied().cycle().take(200 * 1024).collect();
        let mut new = old.clone();
        for (i, b) in new[100 * 1024..100 * 1024 + 10].iter_mut().enumerate() {
            *b = i as u8;
        }
        let d = diff(&DiffContext::default(), &["f"], &[old.clone()], &["f"], &[new.clone()]);
        let stats = d.outcome.stats;
        assert_eq!(stats.bsdiff_files, 1);
        assert!(stats.fresh_bytes <= 10);
        assert!(stats.reused_bytes >= 195 * 1024);
        assert_eq!(rebuild(&d.patch, &[old]), vec![new]);
    }

    #[test]
    fn disabled_bsdiff_stays_rsync() {
        let ctx = DiffBuilder::new()
            .bsdiff(BsdiffPolicy::disabled())
            .build()
            .unwrap();
        let old = noise(BLOCK_SIZE * 2, 3);
        let mut new = old.clone();
        new[5] ^= 0xFF;
        let d = diff(&ctx, &["f"], &[old.clone()], &["f"], &[new.clone()]);
        assert_eq!(d.outcome.stats.bsdiff_files, 0);
        assert_eq!(rebuild(&d.patch, &[old]), vec![new]);
    }

    #[test]
    fn empty_target_is_all_data() {
        let new = vec![noise(BLOCK_SIZE + 3, 4), noise(10, 5)];
        let d = diff(&DiffContext::default(), &[], &[], &["x", "y"], &new);
        assert_eq!(d.outcome.stats.reused_bytes, 0);
        assert_eq!(d.outcome.stats.fresh_bytes, (BLOCK_SIZE + 13) as u64);

        let mut reader = PatchReader::open(d.patch.as_slice()).unwrap();
        while reader.next_file().unwrap().is_some() {
            loop {
                match reader.next_op().unwrap() {
                    SyncOp::HeyYouDidIt => break,
                    op => assert!(op.is_data()),
                }
            }
        }
    }

    #[test]
    fn renamed_file_is_one_range() {
        let data = noise(BLOCK_SIZE * 2 + 1, 6);
        let d = diff(
            &DiffContext::default(),
            &["old-name"],
            &[data.clone()],
            &["new-name"],
            &[data.clone()],
        );
        assert_eq!(d.outcome.stats.fresh_bytes, 0);
        let mut reader = PatchReader::open(d.patch.as_slice()).unwrap();
        let header = reader.next_file().unwrap().unwrap();
        assert_eq!(header.kind, SyncKind::Rsync);
        assert_eq!(reader.next_op().unwrap(), SyncOp::block_range(0, 0, 3));
    }

    #[test]
    fn without_target_pool_only_rsync() {
        let old = vec![noise(BLOCK_SIZE * 2, 7)];
        let mut new = old.clone();
        new[0][BLOCK_SIZE] ^= 1;
        let target = container_of(&["f"], &old);
        let source = container_of(&["f"], &new);
        let signature = signature_of(&target, &old);
        let mut source_pool = VecPool::new(&new);
        let mut patch = Vec::new();
        let outcome = DiffContext::default()
            .write_patch(&signature, &source, &mut source_pool, None, &mut patch, &NoProgress)
            .unwrap();
        assert_eq!(outcome.stats.bsdiff_files, 0);
        assert_eq!(outcome.stats.reused_bytes, BLOCK_SIZE as u64);
        assert_eq!(rebuild(&patch, &old), new);
    }

    #[test]
    fn source_file_changed_during_diff_is_integrity_error() {
        let old = vec![noise(BLOCK_SIZE * 2, 8)];
        let recorded = vec![noise(BLOCK_SIZE * 2 + 10, 9)];
        let target = container_of(&["f"], &old);
        let source = container_of(&["f"], &recorded);
        let signature = signature_of(&target, &old);

        // shrunk since the walk, streamed without the old files
        let mut shrunk = VecPool::new(&[recorded[0][..BLOCK_SIZE + 5].to_vec()]);
        let err = DiffContext::default()
            .write_patch(
                &signature,
                &source,
                &mut shrunk,
                None,
                Vec::<u8>::new(),
                &NoProgress,
            )
            .unwrap_err();
        match err {
            SuturaError::Integrity { path, start, end } => {
                assert_eq!(path, "f");
                let block = BLOCK_SIZE as u64;
                assert_eq!((start, end), (block + 5, block * 2 + 10));
            }
            other => panic!("unexpected {other:?}"),
        }

        // grown since the walk, buffered for bsdiff
        let mut grown = recorded[0].clone();
        grown.extend_from_slice(b"more");
        let mut grown = VecPool::new(&[grown]);
        let mut target_pool = VecPool::new(&old);
        let err = DiffContext::default()
            .write_patch(
                &signature,
                &source,
                &mut grown,
                Some(&mut target_pool),
                Vec::<u8>::new(),
                &NoProgress,
            )
            .unwrap_err();
        assert!(matches!(err, SuturaError::Integrity { .. }), "{err:?}");
    }

    #[test]
    fn reuse_ratio() {
        let stats = DiffStats {
            reused_bytes: 3,
            source_bytes: 4,
            ..DiffStats::default()
        };
        assert!((stats.reuse_ratio() - 0.75).abs() < f64::EPSILON);
        assert!((DiffStats::default().reuse_ratio() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn vec_pool_seeks() {
        let mut pool = VecPool::new(&[b"abc".to_vec()]);
        let reader = pool.seekable_reader(0).unwrap();
        reader.seek(io::SeekFrom::Start(1)).unwrap();
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"bc");
    }

    // ==========================================================================
    // PROPERTIES
    // ==========================================================================

    mod proptests {
        use super::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(16))]

            #[test]
            fn patch_rebuilds_source(
                seed in any::<u64>(),
                old_len in 0usize..(3 * BLOCK_SIZE),
                edits in proptest::collection::vec((any::<prop::sample::Index>(), any::<u8>()), 0..20),
                append in proptest::collection::vec(any::<u8>(), 0..500),
            ) {
                let old = noise(old_len, seed);
                let mut new = old.clone();
                for (at, byte) in &edits {
                    if !new.is_empty() {
                        let i = at.index(new.len());
                        new[i] = *byte;
                    }
                }
                new.extend_from_slice(&append);

                let d = diff(&DiffContext::default(), &["f"], &[old.clone()], &["f"], &[new.clone()]);
                let stats = d.outcome.stats;
                prop_assert_eq!(stats.fresh_bytes + stats.reused_bytes, new.len() as u64);
                prop_assert_eq!(rebuild(&d.patch, &[old]), vec![new]);
            }
        }
    }
}
