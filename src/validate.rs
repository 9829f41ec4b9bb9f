//! Check a tree on disk against a signature and report what is corrupt.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::container::native_path;
use crate::error::{Result, SuturaError};
use crate::heal::Healer;
use crate::ops::block_len;
use crate::pool::{read_full, Pool};
use crate::progress::{ByteCounter, NoProgress, Progress};
use crate::signature::{hash_blocks, Signature, BLOCK_SIZE, CHUNK_BLOCKS};
use crate::wounds::{
    pipeline, Wound, WoundSender, WoundsCollector, WoundsConsumer, WoundsGuardian, WoundsSummary,
    WoundsWriter, MAX_WOUND_SIZE,
};

/// What happens to the wounds validation finds.
enum WoundsPolicy {
    FailFast,
    Collect,
    Write(PathBuf),
    Heal(Box<dyn Pool>),
}

/// Builder for a [`Validator`].
///
/// # Example
///
/// ```rust,no_run
/// use std::path::Path;
/// use sutura::ValidateBuilder;
///
/// let validator = ValidateBuilder::new()
///     .wounds_path(Path::new("wounds.bin"))
///     .build()
///     .unwrap();
/// ```
#[derive(Default)]
pub struct ValidateBuilder {
    wounds_path: Option<PathBuf>,
    heal_source: Option<Box<dyn Pool>>,
    keep_going: bool,
}

impl ValidateBuilder {
    /// Create a builder that fails on the first wound.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record wounds to an artifact at `path` instead of failing.
    #[must_use]
    pub fn wounds_path(mut self, path: &Path) -> Self {
        self.wounds_path = Some(path.to_path_buf());
        self
    }

    /// Heal wounds from `source`, a pool over a healthy copy of the tree.
    #[must_use]
    pub fn heal_source(mut self, source: Box<dyn Pool>) -> Self {
        self.heal_source = Some(source);
        self
    }

    /// Fail on the first wound (the default) or count them all.
    #[must_use]
    pub const fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.keep_going = !fail_fast;
        self
    }

    /// Build the validator.
    ///
    /// # Errors
    ///
    /// Returns a `Usage` error if both a wounds path and a heal source are
    /// set.
    pub fn build(self) -> Result<Validator> {
        let policy = match (self.wounds_path, self.heal_source) {
            (Some(_), Some(_)) => {
                return Err(SuturaError::Usage(
                    "wounds path and heal source are mutually exclusive".to_string(),
                ))
            }
            (Some(path), None) => WoundsPolicy::Write(path),
            (None, Some(source)) => WoundsPolicy::Heal(source),
            (None, None) if self.keep_going => WoundsPolicy::Collect,
            (None, None) => WoundsPolicy::FailFast,
        };
        Ok(Validator { policy })
    }
}

/// Validates a tree against a signature.
pub struct Validator {
    policy: WoundsPolicy,
}

impl Validator {
    /// Validate `dir` against `signature`.
    ///
    /// # Errors
    ///
    /// In fail-fast mode the first wound becomes an `Integrity` error. I/O
    /// errors other than missing entries are returned as is.
    pub fn validate(
        self,
        dir: &Path,
        signature: &Signature,
        progress: &dyn Progress,
    ) -> Result<WoundsSummary> {
        let container = &signature.container;
        let mut consumer: Box<dyn WoundsConsumer> = match self.policy {
            WoundsPolicy::FailFast => Box::new(WoundsGuardian::default()),
            WoundsPolicy::Collect => Box::new(WoundsCollector::new()),
            WoundsPolicy::Write(path) => Box::new(WoundsWriter::new(&path)),
            WoundsPolicy::Heal(source) => Box::new(Healer::new(dir, source)),
        };
        let mut counter = ByteCounter::new(progress, container.size);
        pipeline(container, consumer.as_mut(), |tx| {
            check_tree(dir, signature, tx, &mut counter)
        })?;
        counter.finish();

        let summary = consumer.summary();
        info!(
            dir = %dir.display(),
            wounds = summary.count,
            corrupted = summary.total_corrupted,
            healed = summary.healed_bytes,
            "validated"
        );
        Ok(summary)
    }
}

/// Validate `dir` against `signature`, failing on the first wound.
///
/// # Errors
///
/// Returns an `Integrity` error naming the first corrupt range.
pub fn validate(dir: &Path, signature: &Signature) -> Result<WoundsSummary> {
    ValidateBuilder::new()
        .build()?
        .validate(dir, signature, &NoProgress)
}

/// Every wound of `dir` relative to `signature`.
///
/// # Errors
///
/// Returns an I/O error if the tree cannot be read.
pub fn find_wounds(dir: &Path, signature: &Signature) -> Result<Vec<Wound>> {
    let mut collector = WoundsCollector::new();
    let mut counter = ByteCounter::new(&NoProgress, signature.container.size);
    pipeline(&signature.container, &mut collector, |tx| {
        check_tree(dir, signature, tx, &mut counter)
    })?;
    Ok(collector.into_wounds())
}

fn check_tree(
    dir: &Path,
    signature: &Signature,
    tx: &mut WoundSender,
    counter: &mut ByteCounter<'_>,
) -> Result<()> {
    let container = &signature.container;
    for (index, entry) in container.dirs.iter().enumerate() {
        if !native_path(dir, &entry.path).is_dir() {
            debug!(path = %entry.path, "directory missing");
            tx.send(Wound::dir(index as u64))?;
        }
    }
    for (index, link) in container.symlinks.iter().enumerate() {
        if !symlink_matches(&native_path(dir, &link.path), &link.dest) {
            debug!(path = %link.path, "symlink wrong or missing");
            tx.send(Wound::symlink(index as u64))?;
        }
    }
    let mut buf = vec![0u8; CHUNK_BLOCKS * BLOCK_SIZE];
    for index in 0..container.files.len() {
        check_file(dir, signature, index, &mut buf, tx, counter)?;
    }
    Ok(())
}

fn check_file(
    dir: &Path,
    signature: &Signature,
    index: usize,
    buf: &mut [u8],
    tx: &mut WoundSender,
    counter: &mut ByteCounter<'_>,
) -> Result<()> {
    let file = &signature.container.files[index];
    let expected = signature.file_hashes(index);
    counter.label(&file.path);
    let path = native_path(dir, &file.path);

    let handle = match fs::File::open(&path) {
        Ok(handle) => handle,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!(path = %file.path, "file missing");
            send_range(tx, index, 0, file.size)?;
            counter.add(file.size);
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };
    let actual_size = handle.metadata()?.len();
    let mut reader = handle.take(file.size);

    let mut hashes = Vec::with_capacity(CHUNK_BLOCKS);
    let mut block = 0usize;
    let mut offset = 0u64;
    while offset < file.size {
        let n = read_full(&mut reader, buf)?;
        if n == 0 {
            break;
        }
        hashes.clear();
        hash_blocks(&buf[..n], &mut hashes);
        for hash in &hashes {
            let len = block_len(file.size, block as u64);
            if expected.get(block) != Some(hash) {
                tx.send(Wound::file(index as u64, offset, offset + len))?;
            }
            offset += len;
            block += 1;
        }
        counter.add(n as u64);
    }

    if offset < file.size {
        debug!(path = %file.path, have = offset, want = file.size, "file too short");
        send_range(tx, index, offset, file.size)?;
        counter.add(file.size - offset);
    } else if actual_size > file.size {
        debug!(path = %file.path, have = actual_size, want = file.size, "file too long");
        let last = file.size.saturating_sub(1) / BLOCK_SIZE as u64 * BLOCK_SIZE as u64;
        tx.send(Wound::file(index as u64, last, file.size))?;
    }
    Ok(())
}

/// Report `[start, end)` of a file as wounds no larger than
/// [`MAX_WOUND_SIZE`]. An empty range still yields one wound so the file
/// gets recreated.
fn send_range(tx: &mut WoundSender, index: usize, start: u64, end: u64) -> Result<()> {
    if start == end {
        return tx.send(Wound::file(index as u64, start, end));
    }
    let mut at = start;
    while at < end {
        let next = (at + MAX_WOUND_SIZE).min(end);
        tx.send(Wound::file(index as u64, at, next))?;
        at = next;
    }
    Ok(())
}

#[cfg(unix)]
fn symlink_matches(path: &Path, dest: &str) -> bool {
    fs::read_link(path).is_ok_and(|actual| actual == Path::new(dest))
}

#[cfg(not(unix))]
fn symlink_matches(_path: &Path, _dest: &str) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{accept_all, Container};
    use crate::pool::FsPool;
    use crate::signature::compute_signature;
    use crate::wounds::WoundsReader;
    use tempfile::TempDir;

    fn patterned(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    fn sample() -> (TempDir, Signature) {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("big"), patterned(3 * BLOCK_SIZE + 100, 1)).unwrap();
        fs::write(dir.path().join("nested/small"), b"small file").unwrap();
        fs::write(dir.path().join("nested/empty"), b"").unwrap();
        let container = Container::walk_directory(dir.path(), &accept_all).unwrap();
        let mut pool = FsPool::new(&container, dir.path());
        let signature = compute_signature(&container, &mut pool, &NoProgress).unwrap();
        (dir, signature)
    }

    fn index_of(signature: &Signature, path: &str) -> u64 {
        signature.container.file_index_by_path()[path] as u64
    }

    // ==========================================================================
    // DETECTION
    // ==========================================================================

    #[test]
    fn intact_tree_has_no_wounds() {
        let (dir, signature) = sample();
        assert!(find_wounds(dir.path(), &signature).unwrap().is_empty());
        let summary = validate(dir.path(), &signature).unwrap();
        assert_eq!(summary, WoundsSummary::default());
    }

    #[test]
    fn flipped_byte_wounds_its_block() {
        let (dir, signature) = sample();
        let path = dir.path().join("big");
        let mut data = fs::read(&path).unwrap();
        data[BLOCK_SIZE + 7] ^= 0xFF;
        fs::write(&path, data).unwrap();

        let big = index_of(&signature, "big");
        let wounds = find_wounds(dir.path(), &signature).unwrap();
        assert_eq!(
            wounds,
            vec![Wound::file(big, BLOCK_SIZE as u64, 2 * BLOCK_SIZE as u64)]
        );
    }

    #[test]
    fn short_file_wounds_the_tail() {
        let (dir, signature) = sample();
        let path = dir.path().join("big");
        let data = fs::read(&path).unwrap();
        fs::write(&path, &data[..2 * BLOCK_SIZE]).unwrap();

        let big = index_of(&signature, "big");
        let wounds = find_wounds(dir.path(), &signature).unwrap();
        assert_eq!(
            wounds,
            vec![Wound::file(big, 2 * BLOCK_SIZE as u64, data.len() as u64)]
        );
    }

    #[test]
    fn long_file_wounds_last_block() {
        let (dir, signature) = sample();
        let path = dir.path().join("nested/small");
        fs::write(&path, b"small file with a tail").unwrap();

        let small = index_of(&signature, "nested/small");
        let wounds = find_wounds(dir.path(), &signature).unwrap();
        assert_eq!(wounds, vec![Wound::file(small, 0, 10)]);
    }

    #[test]
    fn missing_entries() {
        let (dir, signature) = sample();
        fs::remove_file(dir.path().join("nested/small")).unwrap();
        fs::remove_file(dir.path().join("nested/empty")).unwrap();
        fs::remove_dir(dir.path().join("nested")).unwrap();

        let wounds = find_wounds(dir.path(), &signature).unwrap();
        assert!(wounds.contains(&Wound::dir(0)));
        assert!(wounds.contains(&Wound::file(
            index_of(&signature, "nested/small"),
            0,
            10
        )));
        assert!(wounds.contains(&Wound::file(
            index_of(&signature, "nested/empty"),
            0,
            0
        )));
    }

    #[cfg(unix)]
    #[test]
    fn wrong_symlink_is_wounded() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a"), b"a").unwrap();
        std::os::unix::fs::symlink("a", dir.path().join("link")).unwrap();
        let container = Container::walk_directory(dir.path(), &accept_all).unwrap();
        let mut pool = FsPool::new(&container, dir.path());
        let signature = compute_signature(&container, &mut pool, &NoProgress).unwrap();

        fs::remove_file(dir.path().join("link")).unwrap();
        std::os::unix::fs::symlink("elsewhere", dir.path().join("link")).unwrap();
        assert_eq!(
            find_wounds(dir.path(), &signature).unwrap(),
            vec![Wound::symlink(0)]
        );
    }

    // ==========================================================================
    // POLICIES
    // ==========================================================================

    #[test]
    fn fail_fast_is_integrity_error() {
        let (dir, signature) = sample();
        fs::write(dir.path().join("nested/small"), b"SMALL FILE").unwrap();
        match validate(dir.path(), &signature) {
            Err(SuturaError::Integrity { path, start, end }) => {
                assert_eq!(path, "nested/small");
                assert_eq!((start, end), (0, 10));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn keep_going_counts_everything() {
        let (dir, signature) = sample();
        fs::write(dir.path().join("nested/small"), b"SMALL FILE").unwrap();
        fs::remove_file(dir.path().join("big")).unwrap();
        let summary = ValidateBuilder::new()
            .fail_fast(false)
            .build()
            .unwrap()
            .validate(dir.path(), &signature, &NoProgress)
            .unwrap();
        assert_eq!(summary.total_corrupted, 3 * BLOCK_SIZE as u64 + 100 + 10);
    }

    #[test]
    fn wounds_are_written_to_artifact() {
        let (dir, signature) = sample();
        fs::write(dir.path().join("nested/small"), b"SMALL FILE").unwrap();
        let out = TempDir::new().unwrap();
        let artifact = out.path().join("wounds.bin");
        let summary = ValidateBuilder::new()
            .wounds_path(&artifact)
            .build()
            .unwrap()
            .validate(dir.path(), &signature, &NoProgress)
            .unwrap();
        assert_eq!(summary.count, 1);

        let mut reader = WoundsReader::open(fs::File::open(&artifact).unwrap()).unwrap();
        assert_eq!(reader.container, signature.container);
        let wound = reader.next_wound().unwrap().unwrap();
        assert_eq!(wound.path(&reader.container), "nested/small");
    }

    #[test]
    fn heal_source_repairs_tree() {
        let (good, signature) = sample();
        let broken = TempDir::new().unwrap();
        fs::write(broken.path().join("big"), b"garbage").unwrap();

        let source = FsPool::new(&signature.container, good.path());
        let summary = ValidateBuilder::new()
            .heal_source(Box::new(source))
            .build()
            .unwrap()
            .validate(broken.path(), &signature, &NoProgress)
            .unwrap();
        assert!(summary.count > 0);
        assert_eq!(summary.failed_wounds, 0);
        assert!(find_wounds(broken.path(), &signature).unwrap().is_empty());
    }

    #[test]
    fn wounds_path_and_heal_source_conflict() {
        let (dir, signature) = sample();
        let result = ValidateBuilder::new()
            .wounds_path(Path::new("w.bin"))
            .heal_source(Box::new(FsPool::new(&signature.container, dir.path())))
            .build();
        assert!(matches!(result, Err(SuturaError::Usage(_))));
    }
}
