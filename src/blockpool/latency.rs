//! Latency simulation for block sources and sinks.

use std::thread;
use std::time::Duration;

use super::{BlockLocation, BlockSink, BlockSource};
use crate::container::Container;
use crate::error::Result;

/// Source that waits `latency` before every fetch.
pub struct LatencySource {
    inner: Box<dyn BlockSource>,
    latency: Duration,
}

impl LatencySource {
    /// Delay every fetch from `inner` by `latency`.
    #[must_use]
    pub fn new(inner: Box<dyn BlockSource>, latency: Duration) -> Self {
        Self { inner, latency }
    }
}

impl BlockSource for LatencySource {
    fn fetch(&mut self, location: BlockLocation) -> Result<Vec<u8>> {
        thread::sleep(self.latency);
        self.inner.fetch(location)
    }

    fn container(&self) -> &Container {
        self.inner.container()
    }

    fn big_block_size(&self) -> u64 {
        self.inner.big_block_size()
    }
}

/// Sink that waits `latency` before every store.
pub struct LatencySink {
    inner: Box<dyn BlockSink>,
    latency: Duration,
}

impl LatencySink {
    /// Delay every store into `inner` by `latency`.
    #[must_use]
    pub fn new(inner: Box<dyn BlockSink>, latency: Duration) -> Self {
        Self { inner, latency }
    }
}

impl BlockSink for LatencySink {
    fn store(&mut self, location: BlockLocation, data: &[u8]) -> Result<()> {
        thread::sleep(self.latency);
        self.inner.store(location, data)
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
            latency: self.latency,
        })
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }
}
