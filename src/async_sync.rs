//! Async front end using tokio.
//!
//! The engine itself is synchronous: it hashes with rayon and pipes wounds
//! through threads. These wrappers run each operation on tokio's blocking
//! pool so it can be awaited from an async service, and move artifacts with
//! `tokio::fs`.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::panic;
use std::path::{Path, PathBuf};

use tokio::task;

use crate::apply::{ApplyBuilder, ApplyStats};
use crate::compression::CompressionSettings;
use crate::container::{accept_all, Container};
use crate::diff::{DiffConfig, DiffContext, DiffStats};
use crate::error::{Result, SuturaError};
use crate::heal::heal_from_dir;
use crate::pool::FsPool;
use crate::progress::NoProgress;
use crate::signature::{compute_signature, read_signature, write_signature, Signature};
use crate::validate::ValidateBuilder;
use crate::wounds::WoundsSummary;

/// Async engine.
///
/// # Example
///
/// ```rust,no_run
/// use sutura::async_sync::AsyncSutura;
///
/// # async fn example() -> sutura::Result<()> {
/// let engine = AsyncSutura::new();
/// let stats = engine.diff("old", "new", "update.patch").await?;
/// println!("{} fresh bytes", stats.fresh_bytes);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct AsyncSutura {
    config: DiffConfig,
}

impl AsyncSutura {
    /// Create an engine with the default diff configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an engine with a custom diff configuration.
    #[must_use]
    pub const fn with_config(config: DiffConfig) -> Self {
        Self { config }
    }

    /// Artifact compression used by this engine.
    #[must_use]
    pub const fn compression(&self) -> CompressionSettings {
        self.config.compression
    }

    /// Compute the signature of the tree at `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree cannot be walked or read.
    pub async fn sign(&self, dir: impl AsRef<Path>) -> Result<Signature> {
        let dir = dir.as_ref().to_path_buf();
        blocking(move || {
            let container = Container::walk_directory(&dir, &accept_all)?;
            let mut pool = FsPool::new(&container, &dir);
            compute_signature(&container, &mut pool, &NoProgress)
        })
        .await
    }

    /// Write `signature` to a signature artifact at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or writing fails.
    pub async fn save_signature(&self, signature: &Signature, path: impl AsRef<Path>) -> Result<()> {
        let bytes = write_signature(Vec::new(), self.config.compression, signature)?;
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    /// Read a signature artifact from `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a signature.
    pub async fn load_signature(&self, path: impl AsRef<Path>) -> Result<Signature> {
        let bytes = tokio::fs::read(path).await?;
        read_signature(bytes.as_slice())
    }

    /// Write a patch from the tree at `target_dir` to the tree at
    /// `source_dir` into `patch_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if either tree cannot be read or the patch cannot be
    /// written.
    pub async fn diff(
        &self,
        target_dir: impl AsRef<Path>,
        source_dir: impl AsRef<Path>,
        patch_path: impl AsRef<Path>,
    ) -> Result<DiffStats> {
        let target_dir = target_dir.as_ref().to_path_buf();
        let source_dir = source_dir.as_ref().to_path_buf();
        let patch_path = patch_path.as_ref().to_path_buf();
        let config = self.config;
        blocking(move || {
            let mut writer = BufWriter::new(File::create(&patch_path)?);
            let outcome = DiffContext::new(config).diff_trees(
                &target_dir,
                &source_dir,
                &mut writer,
                &NoProgress,
            )?;
            writer.flush()?;
            Ok(outcome.stats)
        })
        .await
    }

    /// Apply the patch at `patch_path` to `target_dir`, writing the new tree
    /// to `output_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the patch is broken or the old tree is corrupt.
    pub async fn apply(
        &self,
        patch_path: impl AsRef<Path>,
        target_dir: impl AsRef<Path>,
        output_dir: impl AsRef<Path>,
    ) -> Result<ApplyStats> {
        let patch_path = patch_path.as_ref().to_path_buf();
        let target_dir = target_dir.as_ref().to_path_buf();
        let output_dir = output_dir.as_ref().to_path_buf();
        blocking(move || {
            let patch = BufReader::new(File::open(&patch_path)?);
            ApplyBuilder::new()
                .output_dir(&output_dir)
                .build()?
                .apply_patch(patch, &target_dir, &NoProgress)
        })
        .await
    }

    /// Validate the tree at `dir` against `signature`, counting every wound.
    /// With a `wounds_path`, wounds are also written to an artifact there.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree cannot be read.
    pub async fn validate(
        &self,
        dir: impl AsRef<Path>,
        signature: Signature,
        wounds_path: Option<PathBuf>,
    ) -> Result<WoundsSummary> {
        let dir = dir.as_ref().to_path_buf();
        blocking(move || {
            let mut builder = ValidateBuilder::new().fail_fast(false);
            if let Some(path) = &wounds_path {
                builder = builder.wounds_path(path);
            }
            builder.build()?.validate(&dir, &signature, &NoProgress)
        })
        .await
    }

    /// Heal `target_dir` from the wounds artifact at `wounds_path`, reading
    /// good bytes from the tree at `source_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the artifact cannot be read.
    pub async fn heal(
        &self,
        wounds_path: impl AsRef<Path>,
        target_dir: impl AsRef<Path>,
        source_dir: impl AsRef<Path>,
    ) -> Result<WoundsSummary> {
        let wounds_path = wounds_path.as_ref().to_path_buf();
        let target_dir = target_dir.as_ref().to_path_buf();
        let source_dir = source_dir.as_ref().to_path_buf();
        blocking(move || {
            let wounds = BufReader::new(File::open(&wounds_path)?);
            heal_from_dir(wounds, &target_dir, &source_dir, &NoProgress)
        })
        .await
    }
}

/// Run `work` on the blocking pool. Panics are propagated to the caller.
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match task::spawn_blocking(work).await {
        Ok(result) => result,
        Err(err) if err.is_panic() => panic::resume_unwind(err.into_panic()),
        Err(_) => Err(SuturaError::Cancelled),
    }
}
