//! Patch application against trees that live in a block store.
//!
//! The old tree is read block by block through its manifest and the new tree
//! is cut into big blocks and uploaded. Only old blocks the patch actually
//! reads are fetched, and only new blocks that are not verbatim copies of old
//! blocks are uploaded. The new manifest combines both.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tracing::{debug, info};

use crate::pool::WritablePool;

use super::compose::{compose, BlockPlan};
use super::manifest::{BlockHashMap, Manifest};
use super::store::{BlockTransport, StoreSink, StoreSource};
use super::{
    check_big_block_size, BlockPool, BlockSink, BlockSource, BlockWritePool, FanOutSink,
    FilteringSink, FilteringSource, LatencySink, LatencySource, ValidatingSink,
    DEFAULT_BIG_BLOCK_SIZE,
};
use crate::apply::ApplyBuilder;
use crate::container::Container;
use crate::error::{Result, SuturaError};
use crate::patch::PatchReader;
use crate::pool::Pool;
use crate::progress::NoProgress;
use crate::signature::Signature;

/// Tuning of a remote apply.
#[derive(Debug, Clone)]
pub struct RemoteOptions {
    big_block_size: u64,
    latency: Option<Duration>,
    fan_out: usize,
    signature: Option<Arc<Signature>>,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self {
            big_block_size: DEFAULT_BIG_BLOCK_SIZE,
            latency: None,
            fan_out: 1,
            signature: None,
        }
    }
}

impl RemoteOptions {
    /// Default options: 4 MiB blocks, one upload worker, no validation.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Big block size. Must match the old manifest.
    #[must_use]
    pub const fn big_block_size(mut self, size: u64) -> Self {
        self.big_block_size = size;
        self
    }

    /// Simulated latency added to every block fetch and store.
    #[must_use]
    pub const fn latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Number of parallel upload workers.
    #[must_use]
    pub const fn fan_out(mut self, workers: usize) -> Self {
        self.fan_out = workers;
        self
    }

    /// Check every uploaded block against the signature of the new tree.
    #[must_use]
    pub fn validate_with(mut self, signature: Signature) -> Self {
        self.signature = Some(Arc::new(signature));
        self
    }

    fn check(&self) -> Result<()> {
        check_big_block_size(self.big_block_size)?;
        if self.fan_out == 0 {
            return Err(SuturaError::Usage("fan-out needs at least one worker".into()));
        }
        Ok(())
    }
}

/// Block accounting of a remote apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteStats {
    /// New blocks whose hash was taken from the old manifest.
    pub reused_blocks: usize,
    /// New blocks that were uploaded.
    pub fresh_blocks: usize,
    /// Old blocks that were fetched.
    pub fetched_blocks: usize,
}

/// Result of [`apply_remote`].
#[derive(Debug, Clone)]
pub struct RemoteOutcome {
    /// Manifest of the new tree.
    pub manifest: Manifest,
    /// Block accounting.
    pub stats: RemoteStats,
}

/// Apply `patch` to the tree described by `old`, reading and writing blocks
/// through `store`.
///
/// The patch is read twice, once to plan and once to apply.
///
/// # Errors
///
/// Returns `Usage` for bad options or a block size that differs from the
/// manifest's, `Malformed` if the patch was made against another tree, and
/// any fetch, store or validation error.
pub fn apply_remote<R: Read + Seek>(
    mut patch: R,
    old: &Manifest,
    store: &Arc<dyn BlockTransport>,
    options: &RemoteOptions,
) -> Result<RemoteOutcome> {
    options.check()?;
    let big = options.big_block_size;
    if old.big_block_size != big {
        return Err(SuturaError::Usage(format!(
            "manifest uses {} byte blocks, options ask for {big}",
            old.big_block_size
        )));
    }

    let plan = {
        let mut reader = PatchReader::open(&mut patch)?;
        if reader.target != old.container {
            return Err(SuturaError::Malformed(
                "patch was not made against the manifest's tree".into(),
            ));
        }
        let compositions = compose(&mut reader, big)?;
        BlockPlan::from_compositions(&compositions, &old.container, big)
    };
    let stats = RemoteStats {
        reused_blocks: plan.reused.len(),
        fresh_blocks: plan.fresh_new.len(),
        fetched_blocks: plan.required_old.len(),
    };
    info!(
        reused = stats.reused_blocks,
        fresh = stats.fresh_blocks,
        fetch = %plan.required_old.stats(&old.container, big),
        "planned remote apply"
    );

    patch.seek(SeekFrom::Start(0))?;
    let mut reader = PatchReader::open(&mut patch)?;
    let source = Arc::new(reader.source.clone());

    let mut fetch: Box<dyn BlockSource> =
        Box::new(StoreSource::new(Arc::clone(store), Arc::new(old.clone())));
    if let Some(latency) = options.latency {
        fetch = Box::new(LatencySource::new(fetch, latency));
    }
    let mut target_pool = BlockPool::new(Box::new(FilteringSource::new(
        fetch,
        Arc::new(plan.required_old.clone()),
    )));

    let store_sink = StoreSink::new(Arc::clone(store), Arc::clone(&source), big);
    let recorded = store_sink.recorded_hashes();
    let mut upload: Box<dyn BlockSink> = Box::new(store_sink);
    if let Some(latency) = options.latency {
        upload = Box::new(LatencySink::new(upload, latency));
    }
    if let Some(signature) = &options.signature {
        upload = Box::new(ValidatingSink::new(upload, Arc::clone(signature)));
    }
    if options.fan_out > 1 {
        upload = Box::new(FanOutSink::new(upload, options.fan_out));
    }
    let mut output = BlockWritePool::new(Box::new(FilteringSink::new(
        upload,
        Arc::new(plan.fresh_new.clone()),
    )));

    ApplyBuilder::new()
        .dry_run()
        .build()?
        .apply_with_pools(&mut reader, &mut target_pool, &mut output, &NoProgress)?;
    target_pool.close()?;
    output.finish()?;

    let fresh = recorded.lock().unwrap_or_else(PoisonError::into_inner).clone();
    let mut manifest = Manifest {
        container: (*source).clone(),
        hashes: BlockHashMap::new(),
        big_block_size: big,
    };
    let locations: Vec<_> = manifest.locations().collect();
    for location in locations {
        let hash = match plan.reused.get(&location) {
            Some(&old_location) => old.hash(old_location)?,
            None => fresh.get(location).ok_or_else(|| {
                SuturaError::Malformed(format!("block {location:?} was never produced"))
            })?,
        };
        manifest.hashes.set(location, hash);
    }
    debug!(blocks = manifest.hashes.len(), "remote apply done");
    Ok(RemoteOutcome { manifest, stats })
}

/// Upload every file of `container` from `pool` into `store` and return the
/// tree's manifest.
///
/// # Errors
///
/// Returns `Usage` for a bad block size and any read or store error.
pub fn upload_tree(
    container: &Container,
    pool: &mut dyn Pool,
    store: &Arc<dyn BlockTransport>,
    big_block_size: u64,
) -> Result<Manifest> {
    check_big_block_size(big_block_size)?;
    let sink = StoreSink::new(Arc::clone(store), Arc::new(container.clone()), big_block_size);
    let mut output = BlockWritePool::new(sink.clone_sink());
    for index in 0..container.files.len() {
        let mut writer = output.writer(index)?;
        io::copy(pool.reader(index)?, &mut writer)?;
        writer.finish()?;
    }
    output.finish()?;
    pool.close()?;
    Ok(sink.manifest())
}
