//! Filesystem capability consumed by the synchronizer.
//!
//! [`LocalFs`] talks to the real disk through `tokio::fs` and writes files
//! atomically. [`MemoryFs`] keeps everything in memory and can be told to
//! fail on specific paths.
use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    future::Future,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use log::{debug, error, trace};
use tempfile::NamedTempFile;
use walkdir::WalkDir;

/// One entry found while listing a directory tree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FsEntry {
    pub path: PathBuf,
    pub is_dir: bool,
}

/// The raw file operations the synchronizer needs.
pub trait FileSystem: Send + Sync + 'static {
    /// Every file and directory below `root` (excluding `root`).
    fn list_recursive(&self, root: &Path) -> impl Future<Output = io::Result<Vec<FsEntry>>> + Send;

    fn read_to_string(&self, path: &Path) -> impl Future<Output = io::Result<String>> + Send;

    /// Writes `contents` to `path`, creating parent directories.
    fn write(&self, path: &Path, contents: &str) -> impl Future<Output = io::Result<()>> + Send;

    fn rename(&self, from: &Path, to: &Path) -> impl Future<Output = io::Result<()>> + Send;

    fn remove_file(&self, path: &Path) -> impl Future<Output = io::Result<()>> + Send;

    fn remove_dir_all(&self, path: &Path) -> impl Future<Output = io::Result<()>> + Send;

    fn create_dir_all(&self, path: &Path) -> impl Future<Output = io::Result<()>> + Send;

    fn exists(&self, path: &Path) -> impl Future<Output = bool> + Send;

    fn is_dir(&self, path: &Path) -> impl Future<Output = bool> + Send;
}

/// The local disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

impl LocalFs {
    /// Temp file in the target directory, then an atomic rename over the
    /// destination.
    fn write_atomic(path: &Path, contents: &str) -> io::Result<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        if !dir.exists() {
            debug!("Creating parent directory: {}", dir.display());
            std::fs::create_dir_all(dir)?;
        }

        let mut temp_file = NamedTempFile::new_in(dir).map_err(|e| {
            error!("Failed to create temporary file: {}", e);
            e
        })?;
        trace!("Writing to temporary file");
        temp_file.write_all(contents.as_bytes())?;
        temp_file.flush()?;

        temp_file.persist(path).map_err(|e| {
            error!("Failed to persist file {}: {}", path.display(), e.error);
            e.error
        })?;
        Ok(())
    }
}

fn join_error(e: tokio::task::JoinError) -> io::Error {
    io::Error::other(format!("blocking task failed: {e}"))
}

impl FileSystem for LocalFs {
    async fn list_recursive(&self, root: &Path) -> io::Result<Vec<FsEntry>> {
        let root = root.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let mut entries = Vec::new();
            for entry in WalkDir::new(&root).min_depth(1) {
                match entry {
                    Ok(entry) => entries.push(FsEntry {
                        path: entry.path().to_path_buf(),
                        is_dir: entry.file_type().is_dir(),
                    }),
                    Err(e) => debug!("Skipping unreadable entry under {}: {}", root.display(), e),
                }
            }
            Ok(entries)
        })
        .await
        .map_err(join_error)?
    }

    async fn read_to_string(&self, path: &Path) -> io::Result<String> {
        tokio::fs::read_to_string(path).await
    }

    async fn write(&self, path: &Path, contents: &str) -> io::Result<()> {
        let path = path.to_path_buf();
        let contents = contents.to_string();
        tokio::task::spawn_blocking(move || Self::write_atomic(&path, &contents))
            .await
            .map_err(join_error)?
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(from, to).await
    }

    async fn remove_file(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_file(path).await
    }

    async fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_dir_all(path).await
    }

    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn is_dir(&self, path: &Path) -> bool {
        tokio::fs::metadata(path)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    files: BTreeMap<PathBuf, String>,
    dirs: BTreeSet<PathBuf>,
    failing: HashSet<PathBuf>,
    writes: Vec<(PathBuf, String)>,
}

impl MemoryState {
    fn check(&self, path: &Path) -> io::Result<()> {
        if self.failing.contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("injected failure for {}", path.display()),
            ));
        }
        Ok(())
    }

    fn add_dir(&mut self, path: &Path) {
        for ancestor in path.ancestors() {
            if ancestor.as_os_str().is_empty() {
                break;
            }
            self.dirs.insert(ancestor.to_path_buf());
        }
    }
}

/// In-memory filesystem with failure injection. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryFs {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds a file without recording it as a write.
    pub fn insert_file(&self, path: impl Into<PathBuf>, contents: impl Into<String>) {
        let path = path.into();
        let mut state = self.state();
        if let Some(parent) = path.parent() {
            state.add_dir(parent);
        }
        state.files.insert(path, contents.into());
    }

    /// Makes every operation on `path` fail.
    pub fn fail_on(&self, path: impl Into<PathBuf>) {
        self.state().failing.insert(path.into());
    }

    pub fn clear_failures(&self) {
        self.state().failing.clear();
    }

    pub fn file(&self, path: &Path) -> Option<String> {
        self.state().files.get(path).cloned()
    }

    pub fn files(&self) -> Vec<PathBuf> {
        self.state().files.keys().cloned().collect()
    }

    pub fn has_dir(&self, path: &Path) -> bool {
        self.state().dirs.contains(path)
    }

    /// Every write performed so far, in order.
    pub fn writes(&self) -> Vec<(PathBuf, String)> {
        self.state().writes.clone()
    }
}

impl FileSystem for MemoryFs {
    async fn list_recursive(&self, root: &Path) -> io::Result<Vec<FsEntry>> {
        let state = self.state();
        if !state.dirs.contains(root) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} does not exist", root.display()),
            ));
        }
        let dirs = state
            .dirs
            .iter()
            .filter(|d| d.starts_with(root) && d.as_path() != root)
            .map(|d| FsEntry {
                path: d.clone(),
                is_dir: true,
            });
        let files = state
            .files
            .keys()
            .filter(|f| f.starts_with(root))
            .map(|f| FsEntry {
                path: f.clone(),
                is_dir: false,
            });
        let mut entries: Vec<FsEntry> = dirs.chain(files).collect();
        entries.sort();
        Ok(entries)
    }

    async fn read_to_string(&self, path: &Path) -> io::Result<String> {
        let state = self.state();
        state.check(path)?;
        state.files.get(path).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} does not exist", path.display()),
            )
        })
    }

    async fn write(&self, path: &Path, contents: &str) -> io::Result<()> {
        let mut state = self.state();
        state.check(path)?;
        if let Some(parent) = path.parent() {
            state.add_dir(parent);
        }
        state.files.insert(path.to_path_buf(), contents.to_string());
        state.writes.push((path.to_path_buf(), contents.to_string()));
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let mut state = self.state();
        state.check(from)?;
        state.check(to)?;
        if let Some(parent) = to.parent() {
            state.add_dir(parent);
        }
        if let Some(contents) = state.files.remove(from) {
            state.files.insert(to.to_path_buf(), contents);
            return Ok(());
        }
        if !state.dirs.contains(from) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} does not exist", from.display()),
            ));
        }

        let moved_dirs: Vec<PathBuf> = state
            .dirs
            .iter()
            .filter(|d| d.starts_with(from))
            .cloned()
            .collect();
        for dir in moved_dirs {
            state.dirs.remove(&dir);
            if let Ok(rest) = dir.strip_prefix(from) {
                state.dirs.insert(to.join(rest));
            }
        }
        let moved_files: Vec<PathBuf> = state
            .files
            .keys()
            .filter(|f| f.starts_with(from))
            .cloned()
            .collect();
        for file in moved_files {
            if let (Some(contents), Ok(rest)) = (state.files.remove(&file), file.strip_prefix(from))
            {
                state.files.insert(to.join(rest), contents);
            }
        }
        Ok(())
    }

    async fn remove_file(&self, path: &Path) -> io::Result<()> {
        let mut state = self.state();
        state.check(path)?;
        state.files.remove(path).map(|_| ()).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} does not exist", path.display()),
            )
        })
    }

    async fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        let mut state = self.state();
        state.check(path)?;
        state.dirs.retain(|d| !d.starts_with(path));
        state.files.retain(|f, _| !f.starts_with(path));
        Ok(())
    }

    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        let mut state = self.state();
        state.check(path)?;
        state.add_dir(path);
        Ok(())
    }

    async fn exists(&self, path: &Path) -> bool {
        let state = self.state();
        state.files.contains_key(path) || state.dirs.contains(path)
    }

    async fn is_dir(&self, path: &Path) -> bool {
        self.has_dir(path)
    }
}
