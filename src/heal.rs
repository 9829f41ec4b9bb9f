//! Healing: repair wounded ranges from a healthy copy of the same container.

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;

use tracing::{debug, info, warn};

use crate::container::{native_path, relink, set_mode, Container};
use crate::error::{Result, SuturaError};
use crate::pool::{FsPool, Pool};
use crate::progress::{ByteCounter, Progress};
use crate::wounds::{pipeline, Wound, WoundKind, WoundsConsumer, WoundsReader, WoundsSummary};

/// Wounds consumer that repairs each wound as it arrives.
///
/// Failures are logged and counted, never fatal: one unreadable range should
/// not stop the rest of the tree from being repaired.
pub struct Healer {
    target_dir: PathBuf,
    source: Box<dyn Pool>,
    summary: WoundsSummary,
}

impl Healer {
    /// Heal the tree at `target_dir` from `source`, a pool over a healthy
    /// copy of the same container.
    #[must_use]
    pub fn new(target_dir: &Path, source: Box<dyn Pool>) -> Self {
        Self {
            target_dir: target_dir.to_path_buf(),
            source,
            summary: WoundsSummary::default(),
        }
    }

    /// Repair one wound, returning the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns an error if the wound does not fit the container or the repair
    /// fails.
    pub fn heal_wound(&mut self, container: &Container, wound: &Wound) -> Result<u64> {
        let index = usize::try_from(wound.index).unwrap_or(usize::MAX);
        match wound.kind {
            WoundKind::Dir => {
                let dir = container
                    .dirs
                    .get(index)
                    .ok_or_else(|| out_of_range(wound))?;
                let path = native_path(&self.target_dir, &dir.path);
                if path.is_file() {
                    fs::remove_file(&path)?;
                }
                fs::create_dir_all(&path)?;
                set_mode(&path, dir.mode)?;
                Ok(0)
            }
            WoundKind::Symlink => {
                let link = container
                    .symlinks
                    .get(index)
                    .ok_or_else(|| out_of_range(wound))?;
                let path = native_path(&self.target_dir, &link.path);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                relink(&path, &link.dest)?;
                Ok(0)
            }
            WoundKind::File => {
                let file = container
                    .files
                    .get(index)
                    .ok_or_else(|| out_of_range(wound))?;
                if wound.end > file.size || wound.start > wound.end {
                    return Err(out_of_range(wound));
                }
                let path = native_path(&self.target_dir, &file.path);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut out = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)?;
                if out.metadata()?.len() != file.size {
                    out.set_len(file.size)?;
                    set_mode(&path, file.mode)?;
                }
                out.seek(SeekFrom::Start(wound.start))?;

                let reader = self.source.seekable_reader(index)?;
                reader.seek(SeekFrom::Start(wound.start))?;
                let copied = io::copy(&mut reader.take(wound.size()), &mut out)?;
                if copied != wound.size() {
                    return Err(SuturaError::Truncated(format!(
                        "heal source for {} ended after {copied} of {} bytes",
                        file.path,
                        wound.size()
                    )));
                }
                debug!(path = %file.path, start = wound.start, end = wound.end, "healed");
                Ok(copied)
            }
        }
    }
}

/// Offset just past `wound` in the container's blob view, for file wounds.
fn container_position(container: &Container, wound: &Wound) -> Option<u64> {
    if wound.kind != WoundKind::File {
        return None;
    }
    let file = container.files.get(usize::try_from(wound.index).ok()?)?;
    Some(file.offset.saturating_add(wound.end.min(file.size)))
}

fn out_of_range(wound: &Wound) -> SuturaError {
    SuturaError::Malformed(format!("wound {wound:?} does not fit the container"))
}

impl WoundsConsumer for Healer {
    fn consume(&mut self, container: &Container, wounds: &Receiver<Wound>) -> Result<()> {
        for wound in wounds {
            self.summary.record(&wound);
            match self.heal_wound(container, &wound) {
                Ok(bytes) => self.summary.healed_bytes += bytes,
                Err(err) => {
                    warn!(path = wound.path(container), error = %err, "could not heal wound");
                    self.summary.failed_wounds += 1;
                }
            }
        }
        self.source.close()?;
        if self.summary.failed_wounds > 0 {
            warn!(failed = self.summary.failed_wounds, "some wounds were not healed");
        }
        Ok(())
    }

    fn summary(&self) -> WoundsSummary {
        self.summary
    }
}

/// Heal `target_dir` from a wounds artifact, reading good bytes from
/// `source`. Progress follows the position of each wound in the container.
///
/// # Errors
///
/// Returns an error if the artifact cannot be read. Individual wounds that
/// cannot be healed are counted in [`WoundsSummary::failed_wounds`].
pub fn heal_from_wounds<R: Read>(
    wounds: R,
    target_dir: &Path,
    source: Box<dyn Pool>,
    progress: &dyn Progress,
) -> Result<WoundsSummary> {
    heal_all(WoundsReader::open(wounds)?, target_dir, source, progress)
}

/// Heal `target_dir` from a wounds artifact, reading good bytes from the
/// healthy tree at `source_dir`.
///
/// # Errors
///
/// Same as [`heal_from_wounds`].
pub fn heal_from_dir<R: Read>(
    wounds: R,
    target_dir: &Path,
    source_dir: &Path,
    progress: &dyn Progress,
) -> Result<WoundsSummary> {
    let reader = WoundsReader::open(wounds)?;
    let source = Box::new(FsPool::new(&reader.container, source_dir));
    heal_all(reader, target_dir, source, progress)
}

fn heal_all<R: Read>(
    mut reader: WoundsReader<R>,
    target_dir: &Path,
    source: Box<dyn Pool>,
    progress: &dyn Progress,
) -> Result<WoundsSummary> {
    let container = reader.container.clone();
    let mut counter = ByteCounter::new(progress, container.size);
    let mut reached = 0u64;
    let mut healer = Healer::new(target_dir, source);
    pipeline(&container, &mut healer, |tx| {
        while let Some(wound) = reader.next_wound()? {
            if let Some(position) = container_position(&container, &wound) {
                if position > reached {
                    counter.add(position - reached);
                    reached = position;
                }
            }
            tx.send(wound)?;
        }
        Ok(())
    })?;
    counter.finish();
    let summary = healer.summary();
    info!(
        wounds = summary.count,
        healed_bytes = summary.healed_bytes,
        failed = summary.failed_wounds,
        "healed"
    );
    Ok(summary)
}
