//! Block filters and the source/sink decorators that apply them.

use std::sync::Arc;

use rustc_hash::FxHashSet;

use super::{big_block_len, expected_len, num_big_blocks, BlockLocation, BlockSink, BlockSource};
use crate::container::Container;
use crate::error::Result;

/// Set of big blocks to keep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockFilter {
    blocks: FxHashSet<BlockLocation>,
}

impl BlockFilter {
    /// An empty filter, which keeps nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep `location`.
    pub fn set(&mut self, location: BlockLocation) {
        self.blocks.insert(location);
    }

    /// Whether `location` is kept.
    #[must_use]
    pub fn has(&self, location: BlockLocation) -> bool {
        self.blocks.contains(&location)
    }

    /// Number of kept blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether nothing is kept.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Kept bytes of `container`.
    #[must_use]
    pub fn kept_bytes(&self, container: &Container, big_block_size: u64) -> u64 {
        self.blocks
            .iter()
            .filter_map(|location| {
                let file = container.files.get(usize::try_from(location.file_index).ok()?)?;
                Some(big_block_len(file.size, location.block_index, big_block_size))
            })
            .sum()
    }

    /// One-line summary: kept blocks and bytes against the whole container.
    #[must_use]
    pub fn stats(&self, container: &Container, big_block_size: u64) -> String {
        let total_blocks: u64 = container
            .files
            .iter()
            .map(|f| num_big_blocks(f.size, big_block_size))
            .sum();
        let kept = self.kept_bytes(container, big_block_size);
        #[allow(clippy::cast_precision_loss)]
        let percent = if container.size == 0 {
            0.0
        } else {
            kept as f64 / container.size as f64 * 100.0
        };
        format!(
            "{} / {total_blocks} blocks, {kept} / {} bytes ({percent:.2}%)",
            self.len(),
            container.size
        )
    }
}

impl FromIterator<BlockLocation> for BlockFilter {
    fn from_iter<I: IntoIterator<Item = BlockLocation>>(iter: I) -> Self {
        Self {
            blocks: iter.into_iter().collect(),
        }
    }
}

/// Source that only fetches kept blocks. Other blocks read as zeroes of the
/// right length.
pub struct FilteringSource {
    inner: Box<dyn BlockSource>,
    filter: Arc<BlockFilter>,
}

impl FilteringSource {
    /// Fetch from `inner` only what `filter` keeps.
    #[must_use]
    pub fn new(inner: Box<dyn BlockSource>, filter: Arc<BlockFilter>) -> Self {
        Self { inner, filter }
    }
}

impl BlockSource for FilteringSource {
    fn fetch(&mut self, location: BlockLocation) -> Result<Vec<u8>> {
        if self.filter.has(location) {
            return self.inner.fetch(location);
        }
        let len = expected_len(self.inner.container(), location, self.big_block_size())?;
        Ok(vec![0; usize::try_from(len).unwrap_or(0)])
    }

    fn container(&self) -> &Container {
        self.inner.container()
    }

    fn big_block_size(&self) -> u64 {
        self.inner.big_block_size()
    }
}

/// Sink that drops every block the filter does not keep.
pub struct FilteringSink {
    inner: Box<dyn BlockSink>,
    filter: Arc<BlockFilter>,
}

impl FilteringSink {
    /// Store into `inner` only what `filter` keeps.
    #[must_use]
    pub fn new(inner: Box<dyn BlockSink>, filter: Arc<BlockFilter>) -> Self {
        Self { inner, filter }
    }
}

impl BlockSink for FilteringSink {
    fn store(&mut self, location: BlockLocation, data: &[u8]) -> Result<()> {
        if self.filter.has(location) {
            self.inner.store(location, data)
        } else {
            Ok(())
        }
    }

    fn container(&self) -> &Container {
        self.inner.container()
    }

    fn big_block_size(&self) -> u64 {
        self.inner.big_block_size()
    }

    fn clone_sink(&self) -> Box<dyn BlockSink> {
        Box::new(Self {
            inner: self.inner.clone_sink(),
            filter: Arc::clone(&self.filter),
        })
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }
}
