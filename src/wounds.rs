//! Wounds: ranges of a tree known to be corrupt, and what to do about them.
//!
//! A producer (validation or apply) finds wounds and hands them over a
//! rendezvous channel to one consumer running on its own scoped thread. The
//! consumer decides the policy: fail, record, collect, or heal.

use std::fs;
use std::io::{BufWriter, Read};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::thread;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::compression::CompressionSettings;
use crate::container::Container;
use crate::error::{Result, SuturaError};
use crate::wire::{WireReader, WireWriter, WOUNDS_MAGIC};

/// Largest aggregated file wound (4 MiB).
pub const MAX_WOUND_SIZE: u64 = 4 * 1024 * 1024;

/// What kind of entry a wound is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WoundKind {
    /// Byte range of a regular file.
    File,
    /// Missing or wrong directory.
    Dir,
    /// Missing or wrong symlink.
    Symlink,
}

/// A corrupt range. For files `[start, end)` is a byte range, for dirs and
/// symlinks it is unused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wound {
    /// Entry kind.
    pub kind: WoundKind,
    /// Index into the container's files, dirs, or symlinks.
    pub index: u64,
    /// First corrupt byte.
    pub start: u64,
    /// One past the last corrupt byte.
    pub end: u64,
}

impl Wound {
    /// A file wound over `[start, end)`.
    #[must_use]
    pub const fn file(index: u64, start: u64, end: u64) -> Self {
        Self {
            kind: WoundKind::File,
            index,
            start,
            end,
        }
    }

    /// A directory wound.
    #[must_use]
    pub const fn dir(index: u64) -> Self {
        Self {
            kind: WoundKind::Dir,
            index,
            start: 0,
            end: 0,
        }
    }

    /// A symlink wound.
    #[must_use]
    pub const fn symlink(index: u64) -> Self {
        Self {
            kind: WoundKind::Symlink,
            index,
            start: 0,
            end: 0,
        }
    }

    /// Number of corrupt bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// Path of the wounded entry in `container`.
    #[must_use]
    pub fn path<'c>(&self, container: &'c Container) -> &'c str {
        let index = usize::try_from(self.index).unwrap_or(usize::MAX);
        let path = match self.kind {
            WoundKind::File => container.files.get(index).map(|f| f.path.as_str()),
            WoundKind::Dir => container.dirs.get(index).map(|d| d.path.as_str()),
            WoundKind::Symlink => container.symlinks.get(index).map(|s| s.path.as_str()),
        };
        path.unwrap_or("<unknown>")
    }

    /// The integrity error this wound becomes when nothing handles it.
    #[must_use]
    pub fn to_error(&self, container: &Container) -> SuturaError {
        SuturaError::Integrity {
            path: self.path(container).to_string(),
            start: self.start,
            end: self.end,
        }
    }
}

/// What a consumer saw.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WoundsSummary {
    /// Wounds received.
    pub count: usize,
    /// Corrupt file bytes received.
    pub total_corrupted: u64,
    /// Bytes repaired.
    pub healed_bytes: u64,
    /// Wounds that could not be repaired.
    pub failed_wounds: usize,
}

impl WoundsSummary {
    /// Account for one received wound.
    pub fn record(&mut self, wound: &Wound) {
        self.count += 1;
        if wound.kind == WoundKind::File {
            self.total_corrupted += wound.size();
        }
    }
}

/// Receives wounds on the consumer side of a [`pipeline`].
pub trait WoundsConsumer: Send {
    /// Drain `wounds` until the producer hangs up.
    ///
    /// # Errors
    ///
    /// Returning an error cancels the producer.
    fn consume(&mut self, container: &Container, wounds: &Receiver<Wound>) -> Result<()>;

    /// Counters so far.
    fn summary(&self) -> WoundsSummary;

    /// Check whether any wound was received.
    fn has_wounds(&self) -> bool {
        self.summary().count > 0
    }

    /// Corrupt file bytes received.
    fn total_corrupted(&self) -> u64 {
        self.summary().total_corrupted
    }
}

// =============================================================================
// PIPELINE
// =============================================================================

/// Producer side of a [`pipeline`]. Merges adjacent file wounds before
/// sending them.
pub struct WoundSender {
    tx: SyncSender<Wound>,
    pending: Option<Wound>,
}

impl WoundSender {
    /// Report a wound.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if the consumer has stopped.
    pub fn send(&mut self, wound: Wound) -> Result<()> {
        if let Some(pending) = &mut self.pending {
            if pending.kind == WoundKind::File
                && wound.kind == WoundKind::File
                && pending.index == wound.index
                && pending.end == wound.start
                && wound.end - pending.start <= MAX_WOUND_SIZE
            {
                pending.end = wound.end;
                return Ok(());
            }
        }
        self.flush()?;
        self.pending = Some(wound);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(wound) = self.pending.take() {
            self.tx.send(wound).map_err(|_| SuturaError::Cancelled)?;
        }
        Ok(())
    }
}

/// Run `producer` on this thread and `consumer` on a scoped thread, joined
/// by a rendezvous channel.
///
/// A consumer error hangs up the channel, so the producer's next send fails
/// with `Cancelled`; the consumer's error is returned. A producer error is
/// returned as is.
///
/// # Errors
///
/// Returns whichever side failed first.
pub fn pipeline<T>(
    container: &Container,
    consumer: &mut dyn WoundsConsumer,
    producer: impl FnOnce(&mut WoundSender) -> Result<T>,
) -> Result<T> {
    let (tx, rx) = sync_channel::<Wound>(0);
    thread::scope(|scope| {
        let handle = scope.spawn(move || {
            let result = consumer.consume(container, &rx);
            drop(rx);
            result
        });

        let mut sender = WoundSender { tx, pending: None };
        let produced = producer(&mut sender).and_then(|value| {
            sender.flush()?;
            Ok(value)
        });
        drop(sender);

        let consumed = match handle.join() {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        };

        match (produced, consumed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_) | Err(SuturaError::Cancelled), Err(err)) => Err(err),
            (Err(err), _) => Err(err),
        }
    })
}

// =============================================================================
// CONSUMERS
// =============================================================================

/// Fails on the first wound.
#[derive(Debug, Default)]
pub struct WoundsGuardian {
    summary: WoundsSummary,
}

impl WoundsConsumer for WoundsGuardian {
    fn consume(&mut self, container: &Container, wounds: &Receiver<Wound>) -> Result<()> {
        if let Ok(wound) = wounds.recv() {
            self.summary.record(&wound);
            return Err(wound.to_error(container));
        }
        Ok(())
    }

    fn summary(&self) -> WoundsSummary {
        self.summary
    }
}

/// Keeps every wound in memory.
#[derive(Debug, Default)]
pub struct WoundsCollector {
    wounds: Vec<Wound>,
    summary: WoundsSummary,
}

impl WoundsCollector {
    /// Create an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wounds received so far.
    #[must_use]
    pub fn wounds(&self) -> &[Wound] {
        &self.wounds
    }

    /// Take the received wounds.
    #[must_use]
    pub fn into_wounds(self) -> Vec<Wound> {
        self.wounds
    }
}

impl WoundsConsumer for WoundsCollector {
    fn consume(&mut self, _container: &Container, wounds: &Receiver<Wound>) -> Result<()> {
        for wound in wounds {
            self.summary.record(&wound);
            self.wounds.push(wound);
        }
        Ok(())
    }

    fn summary(&self) -> WoundsSummary {
        self.summary
    }
}

/// Writes wounds to an artifact. The file is only created once the first
/// wound arrives.
#[derive(Debug)]
pub struct WoundsWriter {
    path: PathBuf,
    compression: CompressionSettings,
    summary: WoundsSummary,
}

impl WoundsWriter {
    /// Write wounds to `path`.
    #[must_use]
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            compression: CompressionSettings::default(),
            summary: WoundsSummary::default(),
        }
    }

    /// Set the artifact compression.
    #[must_use]
    pub const fn with_compression(mut self, compression: CompressionSettings) -> Self {
        self.compression = compression;
        self
    }

    /// Where the artifact goes.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl WoundsConsumer for WoundsWriter {
    fn consume(&mut self, container: &Container, wounds: &Receiver<Wound>) -> Result<()> {
        let mut wire = None;
        for wound in wounds {
            self.summary.record(&wound);
            if wire.is_none() {
                debug!(path = %self.path.display(), "creating wounds file");
                let file = BufWriter::new(fs::File::create(&self.path)?);
                let mut writer = WireWriter::new(file, WOUNDS_MAGIC, self.compression)?;
                writer.write_message(container)?;
                wire = Some(writer);
            }
            warn!(path = wound.path(container), start = wound.start, end = wound.end, "wound");
            if let Some(writer) = wire.as_mut() {
                writer.write_message(&wound)?;
            }
        }
        if let Some(writer) = wire {
            let mut file = writer.finish()?;
            std::io::Write::flush(&mut file)?;
        }
        Ok(())
    }

    fn summary(&self) -> WoundsSummary {
        self.summary
    }
}

/// Reads a wounds artifact.
pub struct WoundsReader<R: Read> {
    wire: WireReader<R>,
    /// Container the wounds refer to.
    pub container: Container,
}

impl<R: Read> WoundsReader<R> {
    /// Open an artifact written by [`WoundsWriter`].
    ///
    /// # Errors
    ///
    /// Returns `UnrecognizedFormat` if this is not a wounds artifact.
    pub fn open(inner: R) -> Result<Self> {
        let mut wire = WireReader::open(inner, WOUNDS_MAGIC)?;
        let container = wire.read_message("wounds container")?;
        Ok(Self { wire, container })
    }

    /// Next wound, or `None` at the end.
    ///
    /// # Errors
    ///
    /// Returns a format error on a damaged artifact.
    pub fn next_wound(&mut self) -> Result<Option<Wound>> {
        self.wire.try_read_message()
    }
}
