//! Container model: the ordered shape of a file tree.
//!
//! A [`Container`] lists every directory, file and symlink of a tree in a
//! deterministic order. File offsets are running sums, so a container also
//! describes the virtual concatenation of all file bytes. Indices are only
//! meaningful within one container; files are matched across containers by
//! path.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::archive::Archive;
use crate::error::{Result, SuturaError};
use crate::pool::Pool;

/// Path that walks to an empty container, standing for "no prior version".
pub const NULL_PATH: &str = "/dev/null";

/// Bits OR'd into every walked mode so patched files stay writable.
pub const MODE_MASK: u32 = 0o644;

const PERMISSION_BITS: u32 = 0o7777;
const DEFAULT_DIR_MODE: u32 = 0o755;

/// Kind of a tree entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// A directory.
    Dir,
    /// A regular file.
    File,
    /// A symbolic link.
    Symlink,
}

/// What a walk filter gets to see about an entry.
#[derive(Debug, Clone, Copy)]
pub struct EntryInfo<'a> {
    /// Path relative to the walk root, `/`-separated.
    pub path: &'a str,
    /// Entry kind.
    pub kind: EntryKind,
    /// Permission bits, before [`MODE_MASK`] is applied.
    pub mode: u32,
    /// Size in bytes, zero for non-files.
    pub size: u64,
}

/// Walk filter: return `false` to skip an entry (and a directory's subtree).
pub type Filter<'a> = &'a dyn Fn(&EntryInfo<'_>) -> bool;

/// Filter that keeps every entry.
#[must_use]
pub fn accept_all(_entry: &EntryInfo<'_>) -> bool {
    true
}

/// A directory in a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dir {
    /// Relative path.
    pub path: String,
    /// Permission bits.
    pub mode: u32,
}

/// A regular file in a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    /// Relative path.
    pub path: String,
    /// Permission bits.
    pub mode: u32,
    /// Size in bytes.
    pub size: u64,
    /// Offset of the file's first byte in the container's blob view.
    pub offset: u64,
}

/// A symbolic link in a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symlink {
    /// Relative path.
    pub path: String,
    /// Permission bits.
    pub mode: u32,
    /// Link target, exactly as stored.
    pub dest: String,
}

/// Ordered, immutable description of a file tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    /// Sum of all file sizes.
    pub size: u64,
    /// Directories, parents before children.
    pub dirs: Vec<Dir>,
    /// Regular files, in walk order.
    pub files: Vec<File>,
    /// Symbolic links, in walk order.
    pub symlinks: Vec<Symlink>,
}

impl Container {
    /// Walk a directory into a container.
    ///
    /// Siblings are visited in file-name order, so the same tree always yields
    /// the same container. Entries the walk is not permitted to read are
    /// logged and skipped. Walking [`NULL_PATH`] yields an empty container.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if `root` does not exist or is not a directory,
    /// and a `Malformed` error for paths that are not valid UTF-8.
    pub fn walk_directory(root: &Path, filter: Filter<'_>) -> Result<Self> {
        if root == Path::new(NULL_PATH) {
            return Ok(Self::default());
        }

        let meta = fs::metadata(root)?;
        if !meta.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a directory", root.display()),
            )
            .into());
        }

        let mut container = Self::default();
        let mut walker = WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();

        while let Some(next) = walker.next() {
            let entry = match next {
                Ok(entry) => entry,
                Err(err) if is_permission_denied(&err) => {
                    warn!(error = %err, "skipping unreadable entry");
                    continue;
                }
                Err(err) => return Err(io::Error::from(err).into()),
            };

            let rel = relative_slash_path(root, entry.path())?;
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(err) if is_permission_denied(&err) => {
                    warn!(path = %rel, error = %err, "skipping unreadable entry");
                    continue;
                }
                Err(err) => return Err(io::Error::from(err).into()),
            };

            let file_type = entry.file_type();
            let kind = if file_type.is_dir() {
                EntryKind::Dir
            } else if file_type.is_symlink() {
                EntryKind::Symlink
            } else if file_type.is_file() {
                EntryKind::File
            } else {
                debug!(path = %rel, "skipping special file");
                continue;
            };

            let info = EntryInfo {
                path: &rel,
                kind,
                mode: permission_bits(&meta),
                size: if kind == EntryKind::File { meta.len() } else { 0 },
            };
            if !filter(&info) {
                if kind == EntryKind::Dir {
                    walker.skip_current_dir();
                }
                continue;
            }

            let mode = info.mode | MODE_MASK;
            let size = info.size;
            match kind {
                EntryKind::Dir => container.dirs.push(Dir { path: rel, mode }),
                EntryKind::File => container.push_file(rel, mode, size),
                EntryKind::Symlink => {
                    let dest = fs::read_link(entry.path())?;
                    let dest = dest.to_string_lossy().replace('\\', "/");
                    container.symlinks.push(Symlink {
                        path: rel,
                        mode,
                        dest,
                    });
                }
            }
        }

        debug!(root = %root.display(), stats = %container.stats(), "walked directory");
        Ok(container)
    }

    /// Build a container from an archive's central directory.
    ///
    /// Entries keep archive order. Parent directories that the archive does
    /// not list are synthesized with mode `0o755`.
    ///
    /// # Errors
    ///
    /// Returns a `Malformed` error for entries with empty names.
    pub fn walk_archive(archive: &dyn Archive, filter: Filter<'_>) -> Result<Self> {
        let mut container = Self::default();
        let mut dirs: BTreeMap<String, u32> = BTreeMap::new();

        for entry in archive.entries() {
            let name = normalize_archive_name(&entry.name);
            if name.is_empty() {
                if entry.kind == EntryKind::Dir {
                    continue;
                }
                return Err(SuturaError::Malformed(format!(
                    "archive entry with empty name: {:?}",
                    entry.name
                )));
            }

            let info = EntryInfo {
                path: &name,
                kind: entry.kind,
                mode: entry.mode & PERMISSION_BITS,
                size: entry.size,
            };
            if !filter(&info) || is_pruned(&name, &dirs, filter) {
                continue;
            }

            let mode = info.mode | MODE_MASK;
            for parent in ancestors(&name) {
                dirs.entry(parent.to_string()).or_insert(DEFAULT_DIR_MODE);
            }

            match entry.kind {
                EntryKind::Dir => {
                    dirs.insert(name, mode);
                }
                EntryKind::File => container.push_file(name, mode, entry.size),
                EntryKind::Symlink => container.symlinks.push(Symlink {
                    path: name,
                    mode,
                    dest: entry.link_target.clone().unwrap_or_default(),
                }),
            }
        }

        container.dirs = dirs
            .into_iter()
            .map(|(path, mode)| Dir { path, mode })
            .collect();
        debug!(stats = %container.stats(), "walked archive");
        Ok(container)
    }

    fn push_file(&mut self, path: String, mode: u32, size: u64) {
        self.files.push(File {
            path,
            mode,
            size,
            offset: self.size,
        });
        self.size += size;
    }

    /// Lay the container out under `base`.
    ///
    /// Creates every directory, creates and resizes every file to its
    /// container size, applies modes and re-links every symlink. Existing file
    /// contents up to the new size are kept.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if any entry cannot be created.
    pub fn prepare(&self, base: &Path) -> Result<()> {
        fs::create_dir_all(base)?;

        for dir in &self.dirs {
            let path = native_path(base, &dir.path);
            fs::create_dir_all(&path)?;
            set_mode(&path, dir.mode)?;
        }

        for file in &self.files {
            let path = native_path(base, &file.path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let handle = fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)?;
            handle.set_len(file.size)?;
            set_mode(&path, file.mode)?;
        }

        for symlink in &self.symlinks {
            let path = native_path(base, &symlink.path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            relink(&path, &symlink.dest)?;
        }

        Ok(())
    }

    /// Set the executable bits on files whose first four bytes look like an
    /// executable (ELF, Mach-O thin or fat) or a `#!` script.
    ///
    /// Archive formats do not reliably carry the executable bit across
    /// platforms, so containers walked from archives are usually passed
    /// through this before being laid out.
    ///
    /// Returns the number of files that were marked executable.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a file cannot be read from `pool`.
    pub fn fix_permissions(&mut self, pool: &mut dyn Pool) -> Result<usize> {
        let mut fixed = 0;
        for (index, file) in self.files.iter_mut().enumerate() {
            if file.size < 4 {
                continue;
            }
            let mut magic = [0u8; 4];
            pool.reader(index)?.read_exact(&mut magic)?;
            if is_executable_magic(magic) && file.mode & 0o111 != 0o111 {
                debug!(path = %file.path, "marking executable");
                file.mode |= 0o111;
                fixed += 1;
            }
        }
        Ok(fixed)
    }

    /// Map from file path to file index.
    #[must_use]
    pub fn file_index_by_path(&self) -> FxHashMap<&str, usize> {
        self.files
            .iter()
            .enumerate()
            .map(|(index, file)| (file.path.as_str(), index))
            .collect()
    }

    /// Whether the container has no entries at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.dirs.is_empty() && self.symlinks.is_empty()
    }

    /// Whether the container is exactly one file at the root, as produced by
    /// signing a single file instead of a directory.
    #[must_use]
    pub fn is_single_file(&self) -> bool {
        self.dirs.is_empty()
            && self.symlinks.is_empty()
            && matches!(self.files.as_slice(), [file] if !file.path.contains('/'))
    }

    /// One-line human summary.
    #[must_use]
    pub fn stats(&self) -> String {
        format!(
            "{} files, {} dirs, {} symlinks, {} bytes",
            self.files.len(),
            self.dirs.len(),
            self.symlinks.len(),
            self.size
        )
    }
}

/// Whether four leading bytes identify an executable or script.
#[must_use]
pub fn is_executable_magic(magic: [u8; 4]) -> bool {
    const MAGICS: [u32; 6] = [
        0xFEED_FACE, // Mach-O 32-bit
        0xFEED_FACF, // Mach-O 64-bit
        0xCEFA_EDFE, // Mach-O 32-bit, reversed
        0xCFFA_EDFE, // Mach-O 64-bit, reversed
        0xCAFE_BABE, // Mach-O universal
        0x7F45_4C46, // ELF
    ];
    if magic[..2] == *b"#!" {
        return true;
    }
    MAGICS.contains(&u32::from_be_bytes(magic))
}

/// Resolve a container path under a native base directory.
#[must_use]
pub fn native_path(base: &Path, rel: &str) -> PathBuf {
    rel.split('/')
        .filter(|part| !part.is_empty())
        .fold(base.to_path_buf(), |path, part| path.join(part))
}

fn relative_slash_path(root: &Path, path: &Path) -> Result<String> {
    let rel = path
        .strip_prefix(root)
        .map_err(|_| SuturaError::Malformed(format!("{} escapes walk root", path.display())))?;
    let parts = rel
        .components()
        .map(|c| {
            c.as_os_str().to_str().ok_or_else(|| {
                SuturaError::Malformed(format!("non UTF-8 path: {}", path.display()))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(parts.join("/"))
}

pub(crate) fn normalize_archive_name(name: &str) -> String {
    let name = name.replace('\\', "/");
    name.trim_start_matches("./")
        .trim_start_matches('/')
        .trim_end_matches('/')
        .to_string()
}

fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('/').map(move |(i, _)| &path[..i])
}

// An archive lists entries flat, so a filtered-out directory has to prune its
// descendants explicitly.
fn is_pruned(name: &str, dirs: &BTreeMap<String, u32>, filter: Filter<'_>) -> bool {
    ancestors(name).any(|parent| {
        !dirs.contains_key(parent)
            && !filter(&EntryInfo {
                path: parent,
                kind: EntryKind::Dir,
                mode: DEFAULT_DIR_MODE,
                size: 0,
            })
    })
}

fn is_permission_denied(err: &walkdir::Error) -> bool {
    err.io_error()
        .is_some_and(|io| io.kind() == io::ErrorKind::PermissionDenied)
}

#[cfg(unix)]
fn permission_bits(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & PERMISSION_BITS
}

#[cfg(not(unix))]
fn permission_bits(meta: &fs::Metadata) -> u32 {
    if meta.is_dir() {
        DEFAULT_DIR_MODE
    } else if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// Apply permission bits to a path. No-op outside Unix.
///
/// # Errors
///
/// Returns an I/O error if the permissions cannot be changed.
#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & PERMISSION_BITS))
}

/// Apply permission bits to a path. No-op outside Unix.
///
/// # Errors
///
/// Never fails on this platform.
#[cfg(not(unix))]
pub fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// Replace whatever is at `path` with a symlink to `dest`.
///
/// # Errors
///
/// Returns an I/O error if the old entry cannot be removed or the link
/// cannot be created.
#[cfg(unix)]
pub fn relink(path: &Path, dest: &str) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    std::os::unix::fs::symlink(dest, path)
}

/// Replace whatever is at `path` with a symlink to `dest`.
///
/// # Errors
///
/// Never fails on this platform; symlinks are skipped.
#[cfg(not(unix))]
pub fn relink(path: &Path, dest: &str) -> io::Result<()> {
    debug!(path = %path.display(), dest, "symlinks unsupported, skipping");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::MemoryArchive;
    use crate::pool::FsPool;
    use tempfile::TempDir;

    fn write(base: &Path, rel: &str, data: &[u8]) {
        let path = native_path(base, rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, data).unwrap();
    }

    fn sample_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "b.txt", b"bravo");
        write(dir.path(), "a/one.bin", &[1u8; 100]);
        write(dir.path(), "a/two.bin", &[2u8; 50]);
        write(dir.path(), "c/deep/x", b"x");
        dir
    }

    // ==========================================================================
    // DIRECTORY WALK
    // ==========================================================================

    #[test]
    fn walk_is_sorted_and_offsets_are_running_sums() {
        let tree = sample_tree();
        let container = Container::walk_directory(tree.path(), &accept_all).unwrap();

        let paths: Vec<_> = container.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["a/one.bin", "a/two.bin", "b.txt", "c/deep/x"]);

        let dirs: Vec<_> = container.dirs.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(dirs, vec!["a", "c", "c/deep"]);

        assert_eq!(container.files[0].offset, 0);
        assert_eq!(container.files[1].offset, 100);
        assert_eq!(container.files[2].offset, 150);
        assert_eq!(container.files[3].offset, 155);
        assert_eq!(container.size, 156);
    }

    #[test]
    fn walk_twice_is_identical() {
        let tree = sample_tree();
        let first = Container::walk_directory(tree.path(), &accept_all).unwrap();
        let second = Container::walk_directory(tree.path(), &accept_all).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn filter_prunes_subtree() {
        let tree = sample_tree();
        let filter = |entry: &EntryInfo<'_>| entry.path != "c";
        let container = Container::walk_directory(tree.path(), &filter).unwrap();
        assert!(container.files.iter().all(|f| !f.path.starts_with("c/")));
        assert!(container.dirs.iter().all(|d| !d.path.starts_with('c')));
    }

    #[test]
    fn modes_are_masked() {
        let tree = sample_tree();
        let container = Container::walk_directory(tree.path(), &accept_all).unwrap();
        for file in &container.files {
            assert_eq!(file.mode & MODE_MASK, MODE_MASK);
        }
    }

    #[test]
    fn single_file_shape() {
        let mut container = Container::default();
        assert!(!container.is_single_file());
        container.push_file("game.exe".to_string(), 0o755, 10);
        assert!(container.is_single_file());
        container.push_file("data/level.pak".to_string(), 0o644, 5);
        assert!(!container.is_single_file());
    }

    #[test]
    fn null_path_is_empty() {
        let container = Container::walk_directory(Path::new(NULL_PATH), &accept_all).unwrap();
        assert!(container.is_empty());
        assert_eq!(container.size, 0);
    }

    #[test]
    fn missing_root_is_io_error() {
        let tree = TempDir::new().unwrap();
        let err = Container::walk_directory(&tree.path().join("nope"), &accept_all).unwrap_err();
        assert!(matches!(err, SuturaError::Io(_)));
    }

    #[test]
    fn file_root_is_io_error() {
        let tree = sample_tree();
        let err =
            Container::walk_directory(&tree.path().join("b.txt"), &accept_all).unwrap_err();
        assert!(matches!(err, SuturaError::Io(_)));
    }

    #[cfg(unix)]
    #[test]
    fn walk_records_symlinks() {
        let tree = sample_tree();
        std::os::unix::fs::symlink("b.txt", tree.path().join("link")).unwrap();
        let container = Container::walk_directory(tree.path(), &accept_all).unwrap();
        assert_eq!(container.symlinks.len(), 1);
        assert_eq!(container.symlinks[0].path, "link");
        assert_eq!(container.symlinks[0].dest, "b.txt");
    }

    // ==========================================================================
    // ARCHIVE WALK
    // ==========================================================================

    #[test]
    fn archive_walk_synthesizes_parents() {
        let archive = MemoryArchive::new()
            .with_file("game/data/level1.pak", 0o644, vec![0; 10])
            .with_file("./game/run.sh", 0o600, b"#!/bin/sh\n".to_vec())
            .with_symlink("game/latest", "data/level1.pak");

        let container = Container::walk_archive(&archive, &accept_all).unwrap();
        let dirs: Vec<_> = container.dirs.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(dirs, vec!["game", "game/data"]);
        assert!(container.dirs.iter().all(|d| d.mode == DEFAULT_DIR_MODE));
        assert_eq!(container.files[1].path, "game/run.sh");
        assert_eq!(container.files[1].mode, 0o644);
        assert_eq!(container.files[1].offset, 10);
        assert_eq!(container.symlinks[0].dest, "data/level1.pak");
    }

    #[test]
    fn archive_filter_prunes_unlisted_parent() {
        let archive = MemoryArchive::new()
            .with_file("keep/a", 0o644, vec![1])
            .with_file("skip/b", 0o644, vec![2]);
        let filter = |entry: &EntryInfo<'_>| entry.path != "skip";
        let container = Container::walk_archive(&archive, &filter).unwrap();
        assert_eq!(container.files.len(), 1);
        assert_eq!(container.files[0].path, "keep/a");
    }

    // ==========================================================================
    // PREPARE AND PERMISSIONS
    // ==========================================================================

    #[test]
    fn prepare_lays_out_skeleton() {
        let tree = sample_tree();
        let container = Container::walk_directory(tree.path(), &accept_all).unwrap();
        let out = TempDir::new().unwrap();
        container.prepare(out.path()).unwrap();

        let copy = Container::walk_directory(out.path(), &accept_all).unwrap();
        assert_eq!(copy.files.len(), container.files.len());
        for (a, b) in copy.files.iter().zip(&container.files) {
            assert_eq!(a.path, b.path);
            assert_eq!(a.size, b.size);
        }
    }

    #[test]
    fn executable_magics() {
        assert!(is_executable_magic(*b"#!/b"));
        assert!(is_executable_magic([0x7F, b'E', b'L', b'F']));
        assert!(is_executable_magic([0xCF, 0xFA, 0xED, 0xFE]));
        assert!(is_executable_magic([0xCA, 0xFE, 0xBA, 0xBE]));
        assert!(!is_executable_magic([0, 0, 0, 0]));
        assert!(!is_executable_magic(*b"PK\x03\x04"));
    }

    #[test]
    fn fix_permissions_marks_scripts() {
        let tree = TempDir::new().unwrap();
        write(tree.path(), "run.sh", b"#!/bin/sh\necho hi\n");
        write(tree.path(), "data.txt", b"plain text");
        write(tree.path(), "ab", b"#!");

        let mut container = Container::walk_directory(tree.path(), &accept_all).unwrap();
        let mut pool = FsPool::new(&container, tree.path());
        let fixed = container.fix_permissions(&mut pool).unwrap();

        assert_eq!(fixed, 1);
        let run = container.files.iter().find(|f| f.path == "run.sh").unwrap();
        assert_eq!(run.mode & 0o111, 0o111);
        let data = container.files.iter().find(|f| f.path == "data.txt").unwrap();
        assert_eq!(data.mode & 0o111, 0);
    }

    #[test]
    fn native_path_ignores_empty_segments() {
        let base = Path::new("/base");
        assert_eq!(native_path(base, "a//b/"), Path::new("/base/a/b"));
    }
}
