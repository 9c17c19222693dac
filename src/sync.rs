//! Keeps a [`NoteGraph`] and a directory of note files in step.
//!
//! Reads happen off the graph lock and are applied in one step. Writes
//! are serialized through a single gate so a save never races a rename or
//! delete of the same file, and [`PersistQueue`] debounces saves per note.
use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::Utc;
use globset::GlobSet;
use log::{debug, error, info, trace, warn};
use tokio::{
    sync::{mpsc, oneshot, Mutex},
    task::{JoinHandle, JoinSet},
    time::{sleep_until, Instant},
};
use uuid::Uuid;

use crate::{
    is_hidden, is_note_file, parse_note_file, serialize_note_file, split_front_matter,
    title_from_path, Config,
    FileSystem, FolderId, GraphEvent, NewNote, Note, NoteGraph, NoteGraphError, NoteId, NoteTree,
    NoteTreeItem, PathChange, Result,
};

/// Hidden directory under the root where files wait while a folder delete
/// is in progress.
const TRASH_DIR: &str = ".notegraph-trash";

/// A change observed on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Removed(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
}

/// Outcome of [`Synchronizer::load_directory`].
#[derive(Debug, Default)]
pub struct LoadReport {
    pub root: PathBuf,
    pub loaded: usize,
    pub folders: usize,
    /// Files that could not be read, with the reason.
    pub errors: Vec<(PathBuf, String)>,
    /// A newer load started before this one finished; nothing was applied.
    pub superseded: bool,
}

impl LoadReport {
    fn superseded(root: &Path) -> Self {
        LoadReport {
            root: root.to_path_buf(),
            superseded: true,
            ..LoadReport::default()
        }
    }
}

struct Snapshot {
    notes: HashMap<NoteId, Note>,
    tree: NoteTree,
    folders: usize,
    errors: Vec<(PathBuf, String)>,
}

/// Folder id of the directory containing `path`, `None` at the root.
fn parent_folder(root: &Path, path: &Path) -> Option<FolderId> {
    path.parent()
        .filter(|parent| *parent != root)
        .map(|parent| parent.to_string_lossy().to_string())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn disk_error(path: PathBuf, source: io::Error) -> NoteGraphError {
    if source.kind() == io::ErrorKind::AlreadyExists {
        NoteGraphError::PathInUse { path }
    } else {
        NoteGraphError::Persist { path, source }
    }
}

/// Mirrors a directory into a shared [`NoteGraph`].
pub struct Synchronizer<F: FileSystem> {
    fs: Arc<F>,
    graph: Arc<Mutex<NoteGraph>>,
    config: Config,
    ignore: GlobSet,
    generation: AtomicU64,
    /// Held by every operation that writes, renames or removes files.
    writes: Mutex<()>,
    /// Last text written to each path, to recognise our own writes when
    /// the watcher reports them back.
    written: Mutex<HashMap<PathBuf, String>>,
}

impl<F: FileSystem> Synchronizer<F> {
    pub fn new(fs: Arc<F>, graph: Arc<Mutex<NoteGraph>>, config: Config) -> Result<Self> {
        let ignore = config.ignore_set()?;
        Ok(Synchronizer {
            fs,
            graph,
            config,
            ignore,
            generation: AtomicU64::new(0),
            writes: Mutex::new(()),
            written: Mutex::new(HashMap::new()),
        })
    }

    pub fn graph(&self) -> Arc<Mutex<NoteGraph>> {
        Arc::clone(&self.graph)
    }

    pub fn fs(&self) -> &F {
        &self.fs
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Hidden entries and anything matching (or inside something matching)
    /// an ignore pattern. Paths outside `root` are skipped too.
    fn is_skipped(&self, root: &Path, path: &Path) -> bool {
        if is_hidden(root, path) {
            return true;
        }
        let Ok(relative) = path.strip_prefix(root) else {
            return true;
        };
        relative
            .ancestors()
            .filter(|a| !a.as_os_str().is_empty())
            .any(|a| self.ignore.is_match(a))
    }

    fn is_note_path(&self, path: &Path) -> bool {
        is_note_file(path, &self.config.note_extensions)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    // ------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------

    /// Loads every note below `root` and replaces the graph with it.
    ///
    /// Files that fail to read are reported and skipped. If another load
    /// starts before this one finishes, this one applies nothing.
    pub async fn load_directory(&self, root: &Path) -> Result<LoadReport> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Loading notes from {}", root.display());

        let snapshot = match self.collect(root, generation).await {
            Ok(snapshot) => snapshot,
            Err(NoteGraphError::LoadCancelled { path }) => {
                debug!("Load of {} superseded", path.display());
                return Ok(LoadReport::superseded(root));
            }
            Err(e) => return Err(e),
        };

        let mut graph = self.graph.lock().await;
        if !self.is_current(generation) {
            debug!("Load of {} superseded before apply", root.display());
            return Ok(LoadReport::superseded(root));
        }
        let loaded = snapshot.notes.len();
        graph.replace_all(snapshot.notes, snapshot.tree);
        drop(graph);
        self.written.lock().await.clear();

        if !snapshot.errors.is_empty() {
            warn!(
                "Encountered {} errors while loading notes",
                snapshot.errors.len()
            );
        }
        info!(
            "Loaded {} notes in {} folders from {}",
            loaded,
            snapshot.folders,
            root.display()
        );
        Ok(LoadReport {
            root: root.to_path_buf(),
            loaded,
            folders: snapshot.folders,
            errors: snapshot.errors,
            superseded: false,
        })
    }

    async fn collect(&self, root: &Path, generation: u64) -> Result<Snapshot> {
        if !self.fs.exists(root).await {
            debug!("Creating notes directory: {}", root.display());
            self.fs.create_dir_all(root).await?;
        }
        let mut entries = self.fs.list_recursive(root).await?;
        entries.sort();

        let mut tree = NoteTree::new(Some(root.to_path_buf()));
        let mut folders = 0;
        let mut files = Vec::new();
        for entry in entries {
            if self.is_skipped(root, &entry.path) {
                trace!("Skipping {}", entry.path.display());
                continue;
            }
            if entry.is_dir {
                let parent = parent_folder(root, &entry.path);
                tree.insert(
                    parent.as_deref(),
                    NoteTreeItem::folder(entry.path.to_string_lossy(), file_name(&entry.path)),
                )?;
                folders += 1;
            } else if self.is_note_path(&entry.path) {
                files.push(entry.path);
            }
        }

        let mut reads = JoinSet::new();
        for path in files {
            let fs = Arc::clone(&self.fs);
            reads.spawn(async move {
                let result = fs.read_to_string(&path).await;
                (path, result)
            });
        }
        let mut results = Vec::new();
        while let Some(joined) = reads.join_next().await {
            if !self.is_current(generation) {
                reads.abort_all();
                return Err(NoteGraphError::LoadCancelled {
                    path: root.to_path_buf(),
                });
            }
            match joined {
                Ok(result) => results.push(result),
                Err(e) => error!("Read task failed: {}", e),
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));

        let mut notes: HashMap<NoteId, Note> = HashMap::new();
        let mut errors = Vec::new();
        for (path, result) in results {
            let text = match result {
                Ok(text) => text,
                Err(e) => {
                    let message = format!("Failed to load note from {}: {}", path.display(), e);
                    error!("{}", message);
                    errors.push((path, e.to_string()));
                    continue;
                }
            };
            let mut note = parse_note_file(&path, &text);
            if notes.contains_key(&note.id) {
                warn!(
                    "Note id {} in {} is already taken, assigning a new one",
                    note.id,
                    path.display()
                );
                note.id = Note::generate_id();
            }
            if tree.find(&note.id).is_some() {
                let message = format!("note id {} is already used by a folder", note.id);
                warn!("Skipping {}: {}", path.display(), message);
                errors.push((path, message));
                continue;
            }
            if let Err(e) = tree.insert(
                parent_folder(root, &path).as_deref(),
                NoteTreeItem::note(&note.id, &note.title),
            ) {
                warn!("Skipping {}: {}", path.display(), e);
                errors.push((path, e.to_string()));
                continue;
            }
            trace!("Loaded note {} from {}", note.id, path.display());
            notes.insert(note.id.clone(), note);
        }
        tree.sort();

        Ok(Snapshot {
            notes,
            tree,
            folders,
            errors,
        })
    }

    // ------------------------------------------------------------------
    // Persisting
    // ------------------------------------------------------------------

    /// Writes the current content of a note to its file.
    ///
    /// On success `updated_at` advances to the write time; on failure it is
    /// left alone and the note stays dirty.
    pub async fn persist(&self, id: &str) -> Result<()> {
        let _gate = self.writes.lock().await;
        let (path, text, revision, at) = {
            let graph = self.graph.lock().await;
            let note = graph
                .note(id)
                .ok_or_else(|| NoteGraphError::NoteNotFound { id: id.to_string() })?;
            let Some(path) = note.file_path.clone() else {
                trace!("Note {} has no file, nothing to persist", id);
                return Ok(());
            };
            let at = Utc::now().max(note.updated_at);
            (path, serialize_note_file(note, at), graph.revision(id), at)
        };

        debug!("Persisting note {} to {}", id, path.display());
        if let Err(source) = self.fs.write(&path, &text).await {
            error!("Failed to persist {}: {}", path.display(), source);
            return Err(NoteGraphError::Persist { path, source });
        }
        self.written.lock().await.insert(path, text);
        self.graph.lock().await.mark_persisted(id, revision, at);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Local operations that touch disk
    // ------------------------------------------------------------------

    /// Creates a note and writes its file. Nothing is kept if the write
    /// fails.
    pub async fn create_note(&self, new: NewNote) -> Result<Note> {
        let note = self.graph.lock().await.create_note(new)?;
        if let Some(path) = &note.file_path {
            let taken = self.fs.exists(path).await;
            let written = if taken {
                Err(NoteGraphError::PathInUse { path: path.clone() })
            } else {
                self.persist(&note.id).await
            };
            if let Err(e) = written {
                warn!("Rolling back creation of note {}", note.id);
                self.graph.lock().await.delete_note(&note.id)?;
                return Err(e);
            }
        }
        self.graph
            .lock()
            .await
            .note(&note.id)
            .cloned()
            .ok_or(NoteGraphError::NoteNotFound { id: note.id })
    }

    /// Renames `change.from` to `change.to`. A missing source is fine (the
    /// file was never written); an occupied destination is not.
    async fn move_file(&self, change: &PathChange) -> io::Result<()> {
        if self.fs.exists(&change.to).await {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", change.to.display()),
            ));
        }
        match self.fs.rename(&change.from, &change.to).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("{} is not on disk yet", change.from.display());
                Ok(())
            }
            other => other,
        }
    }

    async fn forget_written(&self, change: &PathChange) {
        let mut written = self.written.lock().await;
        let moved: Vec<PathBuf> = written
            .keys()
            .filter(|path| path.starts_with(&change.from))
            .cloned()
            .collect();
        for path in moved {
            if let (Some(text), Ok(rest)) = (written.remove(&path), path.strip_prefix(&change.from))
            {
                let target = if rest.as_os_str().is_empty() {
                    change.to.clone()
                } else {
                    change.to.join(rest)
                };
                written.insert(target, text);
            }
        }
    }

    /// Renames a note and its file. Title links to the old title are left
    /// as they are.
    pub async fn rename_note(&self, id: &str, title: &str) -> Result<()> {
        let _gate = self.writes.lock().await;
        let mut graph = self.graph.lock().await;
        let old_title = graph
            .note(id)
            .map(|note| note.title.clone())
            .ok_or_else(|| NoteGraphError::NoteNotFound { id: id.to_string() })?;
        let Some(change) = graph.rename_note(id, title)? else {
            return Ok(());
        };
        if let Err(e) = self.move_file(&change).await {
            error!("Failed to rename {}: {}", change.from.display(), e);
            graph.rename_note(id, &old_title)?;
            return Err(disk_error(change.to, e));
        }
        drop(graph);
        self.forget_written(&change).await;
        Ok(())
    }

    /// Moves a note (and its file) to another folder.
    pub async fn move_note(&self, id: &str, parent: Option<&str>) -> Result<()> {
        let _gate = self.writes.lock().await;
        let mut graph = self.graph.lock().await;
        let old_parent = graph.tree().parent_of(id).flatten();
        let Some(change) = graph.move_note(id, parent)? else {
            return Ok(());
        };
        if let Err(e) = self.move_file(&change).await {
            error!("Failed to move {}: {}", change.from.display(), e);
            graph.move_note(id, old_parent.as_deref())?;
            return Err(disk_error(change.to, e));
        }
        drop(graph);
        self.forget_written(&change).await;
        Ok(())
    }

    /// Deletes a note's file, then the note. The store is untouched if the
    /// file cannot be removed.
    pub async fn delete_note(&self, id: &str) -> Result<Note> {
        let _gate = self.writes.lock().await;
        let mut graph = self.graph.lock().await;
        let path = graph
            .note(id)
            .ok_or_else(|| NoteGraphError::NoteNotFound { id: id.to_string() })?
            .file_path
            .clone();
        if let Some(path) = path {
            match self.fs.remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("{} was already gone", path.display());
                }
                Err(source) => {
                    error!("Failed to delete {}: {}", path.display(), source);
                    return Err(NoteGraphError::DeleteFailed { path, source });
                }
            }
            self.written.lock().await.remove(&path);
        }
        graph.delete_note(id)
    }

    pub async fn create_folder(&self, parent: Option<&str>, name: &str) -> Result<FolderId> {
        let _gate = self.writes.lock().await;
        let mut graph = self.graph.lock().await;
        let id = graph.create_folder(parent, name)?;
        if graph.root().is_some() {
            let path = PathBuf::from(&id);
            if let Err(source) = self.fs.create_dir_all(&path).await {
                error!("Failed to create {}: {}", path.display(), source);
                graph.delete_folder(&id)?;
                return Err(NoteGraphError::Persist { path, source });
            }
        }
        Ok(id)
    }

    /// Renames a folder in place. Returns the folder's new id.
    pub async fn rename_folder(&self, id: &str, name: &str) -> Result<FolderId> {
        let parent = self.graph.lock().await.tree().parent_of(id).flatten();
        self.relocate_folder(id, parent.as_deref(), name).await
    }

    /// Moves a folder under `parent`. Returns the folder's new id.
    pub async fn move_folder(&self, id: &str, parent: Option<&str>) -> Result<FolderId> {
        self.relocate_folder(id, parent, &file_name(Path::new(id)))
            .await
    }

    async fn relocate_folder(
        &self,
        id: &str,
        new_parent: Option<&str>,
        new_name: &str,
    ) -> Result<FolderId> {
        let _gate = self.writes.lock().await;
        let mut graph = self.graph.lock().await;
        if graph.folder_by_path(Path::new(id)).is_none() {
            return Err(NoteGraphError::FolderNotFound { id: id.to_string() });
        }
        let old_parent = graph.tree().parent_of(id).flatten();
        let old_name = file_name(Path::new(id));

        let change = graph.relocate_folder(id, new_parent, new_name)?;
        if change.from == change.to {
            return Ok(id.to_string());
        }
        let new_id = change.to.to_string_lossy().to_string();
        if let Err(e) = self.move_file(&change).await {
            error!("Failed to move {}: {}", change.from.display(), e);
            graph.relocate_folder(&new_id, old_parent.as_deref(), &old_name)?;
            return Err(disk_error(change.to, e));
        }
        drop(graph);
        self.forget_written(&change).await;
        Ok(new_id)
    }

    /// Deletes a folder with every note in it.
    ///
    /// Files are first moved into a hidden trash directory. If any of them
    /// cannot be moved, the ones already moved are put back, the graph is
    /// left as it was and the error is returned.
    pub async fn delete_folder(&self, id: &str) -> Result<Vec<Note>> {
        let _gate = self.writes.lock().await;
        let mut graph = self.graph.lock().await;
        if graph.folder_by_path(Path::new(id)).is_none() {
            return Err(NoteGraphError::FolderNotFound { id: id.to_string() });
        }
        let Some(root) = graph.root().map(Path::to_path_buf) else {
            return graph.delete_folder(id);
        };

        let paths: Vec<PathBuf> = graph
            .tree()
            .notes_bottom_up(id)
            .iter()
            .filter_map(|note_id| graph.note(note_id).and_then(|n| n.file_path.clone()))
            .collect();
        let trash = root
            .join(TRASH_DIR)
            .join(Uuid::new_v4().simple().to_string());

        let mut staged = Vec::new();
        for path in paths {
            let relative = path
                .strip_prefix(&root)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| PathBuf::from(file_name(&path)));
            let staging = trash.join(relative);
            match self.fs.rename(&path, &staging).await {
                Ok(()) => staged.push((path, staging)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    trace!("{} was already gone", path.display());
                }
                Err(source) => {
                    error!("Failed to delete {}: {}", path.display(), source);
                    self.restore(&staged, &trash).await;
                    return Err(NoteGraphError::DeleteFailed { path, source });
                }
            }
        }

        let dir = PathBuf::from(id);
        match self.fs.remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                error!("Failed to delete {}: {}", dir.display(), source);
                self.restore(&staged, &trash).await;
                return Err(NoteGraphError::DeleteFailed { path: dir, source });
            }
        }

        let removed = graph.delete_folder(id)?;
        drop(graph);
        if let Err(e) = self.fs.remove_dir_all(&trash).await {
            warn!("Failed to purge {}: {}", trash.display(), e);
        }
        let mut written = self.written.lock().await;
        written.retain(|path, _| !path.starts_with(&dir));
        Ok(removed)
    }

    async fn restore(&self, staged: &[(PathBuf, PathBuf)], trash: &Path) {
        for (original, staging) in staged.iter().rev() {
            if let Err(e) = self.fs.rename(staging, original).await {
                error!(
                    "Failed to restore {} from {}: {}",
                    original.display(),
                    staging.display(),
                    e
                );
            }
        }
        if let Err(e) = self.fs.remove_dir_all(trash).await {
            warn!("Failed to purge {}: {}", trash.display(), e);
        }
    }

    // ------------------------------------------------------------------
    // External changes
    // ------------------------------------------------------------------

    /// Applies a change made on disk by someone else.
    ///
    /// A note that is open with unsaved edits keeps its in-memory content;
    /// reports of our own writes are ignored.
    pub async fn reconcile_external_change(&self, event: FsEvent) -> Result<()> {
        let _gate = self.writes.lock().await;
        let Some(root) = self.graph.lock().await.root().map(Path::to_path_buf) else {
            return Ok(());
        };
        trace!("External change: {:?}", event);
        match event {
            FsEvent::Created(path) | FsEvent::Modified(path) => self.upsert_path(&root, &path).await,
            FsEvent::Removed(path) => self.remove_path(&path).await,
            FsEvent::Renamed { from, to } => self.rename_path(&root, &from, &to).await,
        }
    }

    async fn upsert_path(&self, root: &Path, path: &Path) -> Result<()> {
        if self.is_skipped(root, path) {
            return Ok(());
        }
        if !self.fs.exists(path).await {
            return self.remove_path(path).await;
        }
        if !self.fs.is_dir(path).await {
            if self.is_note_path(path) {
                self.upsert_file(root, path).await?;
            }
            return Ok(());
        }

        let mut entries = self.fs.list_recursive(path).await?;
        entries.sort();
        let mut files = Vec::new();
        {
            let mut graph = self.graph.lock().await;
            graph.ensure_folder(path)?;
            for entry in entries {
                if self.is_skipped(root, &entry.path) {
                    continue;
                }
                if entry.is_dir {
                    graph.ensure_folder(&entry.path)?;
                } else if self.is_note_path(&entry.path) {
                    files.push(entry.path);
                }
            }
        }
        for file in files {
            if let Err(e) = self.upsert_file(root, &file).await {
                warn!("Failed to pick up {}: {}", file.display(), e);
            }
        }
        Ok(())
    }

    async fn upsert_file(&self, root: &Path, path: &Path) -> Result<()> {
        let text = match self.fs.read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                trace!("{} vanished before it could be read", path.display());
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if self.written.lock().await.get(path) == Some(&text) {
            trace!("Ignoring our own write to {}", path.display());
            return Ok(());
        }

        let mut parsed = parse_note_file(path, &text);
        let mut graph = self.graph.lock().await;
        if let Some(existing) = graph.note_by_path(path) {
            let id = existing.id.clone();
            if split_front_matter(&text).0.created.is_none() {
                parsed.created_at = existing.created_at;
            }
            if existing.content.serialize() == parsed.content.serialize()
                && existing.is_wiki == parsed.is_wiki
                && existing.is_pub == parsed.is_pub
                && existing.created_at == parsed.created_at
            {
                trace!("{} is unchanged", path.display());
                return Ok(());
            }
            if graph.is_dirty(&id) && graph.open_notes().iter().any(|open| *open == id) {
                info!(
                    "Ignoring external change to {}: it has unsaved edits",
                    path.display()
                );
                return Ok(());
            }
            info!("Reloading {} after an external change", path.display());
            return graph.apply_disk_content(&id, parsed);
        }

        let parent = graph.ensure_folder(path.parent().unwrap_or(root))?;
        let mut note = parsed;
        if graph.note(&note.id).is_some() || graph.tree().find(&note.id).is_some() {
            debug!(
                "Note id {} from {} is already taken, assigning a new one",
                note.id,
                path.display()
            );
            note.id = Note::generate_id();
        }
        info!("Picked up new note {}", path.display());
        graph.insert_note(note, parent.as_deref())
    }

    async fn remove_path(&self, path: &Path) -> Result<()> {
        let mut graph = self.graph.lock().await;
        if let Some(id) = graph.note_by_path(path).map(|note| note.id.clone()) {
            info!("{} was removed on disk", path.display());
            graph.delete_note(&id)?;
        } else if let Some(id) = graph.folder_by_path(path).map(|folder| folder.id.clone()) {
            info!("Folder {} was removed on disk", path.display());
            graph.delete_folder(&id)?;
        }
        drop(graph);
        self.written
            .lock()
            .await
            .retain(|written, _| !written.starts_with(path));
        Ok(())
    }

    async fn rename_path(&self, root: &Path, from: &Path, to: &Path) -> Result<()> {
        let leaves = self.is_skipped(root, to);
        let mut graph = self.graph.lock().await;

        if let Some(id) = graph.note_by_path(from).map(|note| note.id.clone()) {
            if leaves || !self.is_note_path(to) {
                info!("{} was moved out of the notes directory", from.display());
                graph.delete_note(&id)?;
                return Ok(());
            }
            let parent = graph.ensure_folder(to.parent().unwrap_or(root))?;
            if graph.tree().parent_of(&id).flatten() != parent {
                graph.move_note(&id, parent.as_deref())?;
            }
            let title = title_from_path(to);
            if graph.note(&id).is_some_and(|note| note.title != title) {
                graph.rename_note(&id, &title)?;
            }
            return graph.set_note_path(&id, to.to_path_buf());
        }

        if let Some(id) = graph.folder_by_path(from).map(|folder| folder.id.clone()) {
            if leaves {
                graph.delete_folder(&id)?;
                return Ok(());
            }
            let parent = graph.ensure_folder(to.parent().unwrap_or(root))?;
            graph.relocate_folder(&id, parent.as_deref(), &file_name(to))?;
            return Ok(());
        }

        drop(graph);
        self.upsert_path(root, to).await
    }
}

// ----------------------------------------------------------------------
// Debounced persistence
// ----------------------------------------------------------------------

enum PersistCommand {
    Schedule(NoteId),
    Flush(oneshot::Sender<Result<()>>),
    Shutdown(oneshot::Sender<Result<()>>),
}

fn queue_stopped() -> NoteGraphError {
    NoteGraphError::Io(io::Error::other("persist queue is not running"))
}

/// Coalesces saves per note: a note is written once it has been quiet for
/// the debounce period, with whatever content it has at that moment.
pub struct PersistQueue {
    commands: mpsc::UnboundedSender<PersistCommand>,
    worker: JoinHandle<()>,
}

impl PersistQueue {
    pub fn start<F: FileSystem>(sync: Arc<Synchronizer<F>>, debounce: Duration) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_queue(sync, receiver, debounce));
        PersistQueue { commands, worker }
    }

    /// Asks for `id` to be saved after the debounce period. Scheduling again
    /// restarts the period.
    pub fn schedule(&self, id: &str) {
        if self
            .commands
            .send(PersistCommand::Schedule(id.to_string()))
            .is_err()
        {
            warn!("Persist queue stopped, dropping save of {}", id);
        }
    }

    /// Saves everything pending now. Returns the first failure.
    pub async fn flush(&self) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(PersistCommand::Flush(reply))
            .map_err(|_| queue_stopped())?;
        done.await.map_err(|_| queue_stopped())?
    }

    /// Saves everything pending and stops the worker.
    pub async fn shutdown(self) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(PersistCommand::Shutdown(reply))
            .map_err(|_| queue_stopped())?;
        let result = done.await.map_err(|_| queue_stopped())?;
        if let Err(e) = self.worker.await {
            error!("Persist worker failed: {}", e);
        }
        result
    }
}

async fn run_queue<F: FileSystem>(
    sync: Arc<Synchronizer<F>>,
    mut commands: mpsc::UnboundedReceiver<PersistCommand>,
    debounce: Duration,
) {
    debug!("Persist queue started");
    let mut pending: HashMap<NoteId, Instant> = HashMap::new();
    loop {
        let next = pending.values().min().copied();
        tokio::select! {
            command = commands.recv() => match command {
                Some(PersistCommand::Schedule(id)) => {
                    trace!("Scheduling save of {}", id);
                    pending.insert(id, Instant::now() + debounce);
                }
                Some(PersistCommand::Flush(reply)) => {
                    let _ = reply.send(write_all(&sync, &mut pending).await);
                }
                Some(PersistCommand::Shutdown(reply)) => {
                    let _ = reply.send(write_all(&sync, &mut pending).await);
                    break;
                }
                None => {
                    let _ = write_all(&sync, &mut pending).await;
                    break;
                }
            },
            _ = sleep_until(next.unwrap_or_else(Instant::now)), if next.is_some() => {
                let now = Instant::now();
                let mut due: Vec<NoteId> = pending
                    .iter()
                    .filter(|(_, deadline)| **deadline <= now)
                    .map(|(id, _)| id.clone())
                    .collect();
                due.sort();
                for id in due {
                    pending.remove(&id);
                    let _ = write_one(&sync, &id).await;
                }
            }
        }
    }
    debug!("Persist queue stopped");
}

async fn write_all<F: FileSystem>(
    sync: &Synchronizer<F>,
    pending: &mut HashMap<NoteId, Instant>,
) -> Result<()> {
    let mut ids: Vec<NoteId> = pending.drain().map(|(id, _)| id).collect();
    ids.sort();
    let mut first_error = None;
    for id in ids {
        if let Err(e) = write_one(sync, &id).await {
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

async fn write_one<F: FileSystem>(sync: &Synchronizer<F>, id: &str) -> Result<()> {
    if !sync.graph.lock().await.is_dirty(id) {
        trace!("Note {} is clean, skipping save", id);
        return Ok(());
    }
    match sync.persist(id).await {
        Ok(()) => Ok(()),
        Err(NoteGraphError::NoteNotFound { .. }) => {
            debug!("Note {} was deleted before it could be saved", id);
            Ok(())
        }
        Err(e) => {
            error!("Failed to save note {}: {}", id, e);
            sync.graph.lock().await.emit(GraphEvent::PersistFailed {
                id: id.to_string(),
                message: e.to_string(),
            });
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::sleep;

    use super::*;
    use crate::{Document, MemoryFs};

    const ROOT: &str = "/notes";

    fn setup(fs: &MemoryFs) -> Arc<Synchronizer<MemoryFs>> {
        setup_with(fs, Config::default())
    }

    fn setup_with(fs: &MemoryFs, config: Config) -> Arc<Synchronizer<MemoryFs>> {
        let graph = Arc::new(Mutex::new(NoteGraph::new(Some(PathBuf::from(ROOT)))));
        Arc::new(Synchronizer::new(Arc::new(fs.clone()), graph, config).unwrap())
    }

    fn path(relative: &str) -> PathBuf {
        Path::new(ROOT).join(relative)
    }

    #[tokio::test]
    async fn load_resolves_block_references_across_files() {
        let fs = MemoryFs::new();
        fs.insert_file(path("a.md"), "See ((blk-1)).\n");
        fs.insert_file(path("b.md"), "The target. ^blk-1\n");
        let sync = setup(&fs);

        let report = sync.load_directory(Path::new(ROOT)).await.unwrap();
        assert_eq!(report.loaded, 2);
        assert!(report.errors.is_empty());

        let graph = sync.graph();
        let graph = graph.lock().await;
        let a = graph.note_by_path(&path("a.md")).unwrap().id.clone();
        let refs = graph.backlinks_for("blk-1");
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].from_note_id, a);
        assert!(refs[0].resolved);
    }

    #[tokio::test]
    async fn load_builds_folders_and_skips_hidden_and_ignored() {
        let fs = MemoryFs::new();
        fs.insert_file(path("work/x.md"), "x\n");
        fs.insert_file(path("work/deep/y.markdown"), "y\n");
        fs.insert_file(path(".git/z.md"), "z\n");
        fs.insert_file(path("drafts/d.md"), "d\n");
        fs.insert_file(path("image.png"), "png");
        let config = Config {
            ignore_patterns: vec!["drafts".to_string()],
            ..Config::default()
        };
        let sync = setup_with(&fs, config);

        let report = sync.load_directory(Path::new(ROOT)).await.unwrap();
        assert_eq!(report.loaded, 2);
        assert_eq!(report.folders, 2);

        let graph = sync.graph();
        let graph = graph.lock().await;
        assert!(graph.folder_by_path(&path("work/deep")).is_some());
        assert!(graph.folder_by_path(&path("drafts")).is_none());
        let y = graph.note_by_path(&path("work/deep/y.markdown")).unwrap();
        assert_eq!(
            graph.tree().parent_of(&y.id),
            Some(Some(path("work/deep").to_string_lossy().to_string()))
        );
    }

    #[tokio::test]
    async fn unreadable_files_do_not_abort_the_load() {
        let fs = MemoryFs::new();
        fs.insert_file(path("good.md"), "fine\n");
        fs.insert_file(path("bad.md"), "locked\n");
        fs.fail_on(path("bad.md"));
        let sync = setup(&fs);

        let report = sync.load_directory(Path::new(ROOT)).await.unwrap();
        assert_eq!(report.loaded, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].0, path("bad.md"));
        assert!(sync
            .graph()
            .lock()
            .await
            .note_by_path(&path("good.md"))
            .is_some());
    }

    #[tokio::test]
    async fn duplicate_ids_on_disk_get_fresh_ids() {
        let fs = MemoryFs::new();
        let text = "---\nid: same\n---\n\nbody\n";
        fs.insert_file(path("one.md"), text);
        fs.insert_file(path("two.md"), text);
        let sync = setup(&fs);

        sync.load_directory(Path::new(ROOT)).await.unwrap();
        let graph = sync.graph();
        let graph = graph.lock().await;
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.note_by_path(&path("one.md")).unwrap().id, "same");
        assert_ne!(graph.note_by_path(&path("two.md")).unwrap().id, "same");
    }

    #[tokio::test]
    async fn note_ids_clashing_with_folders_do_not_abort_the_load() {
        let fs = MemoryFs::new();
        fs.insert_file(path("work/a.md"), "a\n");
        let clash = format!("---\nid: {}\n---\n\nbody\n", path("work").display());
        fs.insert_file(path("b.md"), clash.as_str());
        let sync = setup(&fs);

        let report = sync.load_directory(Path::new(ROOT)).await.unwrap();
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].0, path("b.md"));
        {
            let graph = sync.graph();
            let graph = graph.lock().await;
            assert_eq!(graph.len(), 1);
            assert!(graph.note_by_path(&path("work/a.md")).is_some());
            assert!(graph.folder_by_path(&path("work")).is_some());
        }

        fs.insert_file(path("c.md"), clash.as_str());
        sync.reconcile_external_change(FsEvent::Created(path("c.md")))
            .await
            .unwrap();
        let graph = sync.graph();
        let graph = graph.lock().await;
        let picked = graph.note_by_path(&path("c.md")).unwrap();
        assert_ne!(picked.id, path("work").to_string_lossy());
        assert!(graph.folder_by_path(&path("work")).is_some());
    }

    #[tokio::test]
    async fn superseded_load_leaves_the_store_alone() {
        let fs = MemoryFs::new();
        fs.insert_file("/old/stale.md", "stale\n");
        fs.insert_file("/new/fresh.md", "fresh\n");
        let sync = setup(&fs);

        let (first, second) = tokio::join!(
            sync.load_directory(Path::new("/old")),
            sync.load_directory(Path::new("/new"))
        );
        assert!(first.unwrap().superseded);
        assert!(!second.unwrap().superseded);

        let graph = sync.graph();
        let graph = graph.lock().await;
        assert_eq!(graph.len(), 1);
        assert!(graph.note_by_path(Path::new("/new/fresh.md")).is_some());
        assert!(graph.note_by_path(Path::new("/old/stale.md")).is_none());
    }

    #[tokio::test]
    async fn create_note_writes_front_matter() {
        let fs = MemoryFs::new();
        fs.insert_file(path("keep.md"), "");
        let sync = setup(&fs);
        sync.load_directory(Path::new(ROOT)).await.unwrap();

        let note = sync
            .create_note(NewNote::new("Fresh").with_content(Document::parse("hello #tag ^h1\n")))
            .await
            .unwrap();
        let text = fs.file(&path("Fresh.md")).unwrap();
        assert!(text.starts_with(&format!("---\nid: {}\n", note.id)));
        assert!(text.ends_with("hello #tag ^h1\n"));
        assert!(!sync.graph().lock().await.is_dirty(&note.id));
    }

    #[tokio::test]
    async fn failed_create_keeps_nothing() {
        let fs = MemoryFs::new();
        fs.insert_file(path("keep.md"), "");
        fs.fail_on(path("Broken.md"));
        let sync = setup(&fs);
        sync.load_directory(Path::new(ROOT)).await.unwrap();

        let err = sync.create_note(NewNote::new("Broken")).await.unwrap_err();
        assert!(matches!(err, NoteGraphError::Persist { .. }));
        assert_eq!(sync.graph().lock().await.len(), 1);
    }

    #[tokio::test]
    async fn persist_failure_leaves_updated_at() {
        let fs = MemoryFs::new();
        fs.insert_file(path("n.md"), "---\nid: n\n---\n\nold\n");
        let sync = setup(&fs);
        sync.load_directory(Path::new(ROOT)).await.unwrap();
        let graph = sync.graph();
        let before = graph.lock().await.note("n").unwrap().updated_at;

        graph
            .lock()
            .await
            .update_note_content("n", Document::parse("new\n"))
            .unwrap();
        fs.fail_on(path("n.md"));
        let err = sync.persist("n").await.unwrap_err();
        assert!(matches!(err, NoteGraphError::Persist { .. }));
        assert_eq!(graph.lock().await.note("n").unwrap().updated_at, before);
        assert!(graph.lock().await.is_dirty("n"));

        fs.clear_failures();
        sync.persist("n").await.unwrap();
        assert!(graph.lock().await.note("n").unwrap().updated_at > before);
        assert!(!graph.lock().await.is_dirty("n"));
    }

    #[tokio::test]
    async fn debounced_saves_write_only_the_latest_content() {
        let fs = MemoryFs::new();
        fs.insert_file(path("n.md"), "---\nid: n\n---\n\nv0\n");
        let sync = setup(&fs);
        sync.load_directory(Path::new(ROOT)).await.unwrap();
        let queue = PersistQueue::start(Arc::clone(&sync), Duration::from_millis(50));
        let graph = sync.graph();

        for version in ["v1", "v2", "v3"] {
            graph
                .lock()
                .await
                .update_note_content("n", Document::parse(version))
                .unwrap();
            queue.schedule("n");
        }
        sleep(Duration::from_millis(300)).await;

        let writes = fs.writes();
        assert_eq!(writes.len(), 1);
        assert!(writes[0].1.contains("\nv3 ^"));
        assert!(!graph.lock().await.is_dirty("n"));
        queue.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn flush_writes_pending_saves_and_reports_failures() {
        let fs = MemoryFs::new();
        fs.insert_file(path("a.md"), "---\nid: a\n---\n\na\n");
        fs.insert_file(path("b.md"), "---\nid: b\n---\n\nb\n");
        let sync = setup(&fs);
        sync.load_directory(Path::new(ROOT)).await.unwrap();
        let queue = PersistQueue::start(Arc::clone(&sync), Duration::from_secs(60));
        let graph = sync.graph();
        let mut events = graph.lock().await.subscribe();

        for id in ["a", "b"] {
            graph
                .lock()
                .await
                .update_note_content(id, Document::parse("edited"))
                .unwrap();
            queue.schedule(id);
        }
        fs.fail_on(path("b.md"));
        assert!(queue.flush().await.is_err());
        assert!(fs.file(&path("a.md")).unwrap().contains("edited"));
        assert!(graph.lock().await.is_dirty("b"));

        let mut failed = false;
        while let Ok(event) = events.try_recv() {
            failed |= matches!(event, GraphEvent::PersistFailed { ref id, .. } if id == "b");
        }
        assert!(failed);
        queue.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn delete_folder_failure_keeps_everything() {
        let fs = MemoryFs::new();
        fs.insert_file(path("keep.md"), "");
        let sync = setup(&fs);
        sync.load_directory(Path::new(ROOT)).await.unwrap();
        let folder = sync.create_folder(None, "f").await.unwrap();
        let mut ids = Vec::new();
        for title in ["One", "Two", "Three"] {
            let note = sync
                .create_note(NewNote::new(title).in_folder(folder.as_str()))
                .await
                .unwrap();
            ids.push(note.id);
        }
        fs.fail_on(path("f/Two.md"));

        let err = sync.delete_folder(&folder).await.unwrap_err();
        assert!(matches!(err, NoteGraphError::DeleteFailed { .. }));

        let graph = sync.graph();
        let graph = graph.lock().await;
        assert!(graph.folder_by_path(&path("f")).is_some());
        for id in &ids {
            assert!(graph.note(id).is_some());
            assert_eq!(graph.tree().parent_of(id), Some(Some(folder.clone())));
        }
        for name in ["One", "Two", "Three"] {
            assert!(fs.file(&path(&format!("f/{name}.md"))).is_some());
        }
    }

    #[tokio::test]
    async fn delete_folder_removes_files_and_notes() {
        let fs = MemoryFs::new();
        fs.insert_file(path("f/a.md"), "a\n");
        fs.insert_file(path("f/sub/b.md"), "b\n");
        fs.insert_file(path("c.md"), "c\n");
        let sync = setup(&fs);
        sync.load_directory(Path::new(ROOT)).await.unwrap();

        let removed = sync
            .delete_folder(&path("f").to_string_lossy())
            .await
            .unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(fs.files(), vec![path("c.md")]);
        assert_eq!(sync.graph().lock().await.len(), 1);
    }

    #[tokio::test]
    async fn rename_and_move_follow_on_disk() {
        let fs = MemoryFs::new();
        fs.insert_file(path("Foo.md"), "---\nid: foo\n---\n\nfoo\n");
        let sync = setup(&fs);
        sync.load_directory(Path::new(ROOT)).await.unwrap();
        let archive = sync.create_folder(None, "archive").await.unwrap();

        sync.rename_note("foo", "Bar").await.unwrap();
        sync.move_note("foo", Some(archive.as_str())).await.unwrap();
        assert_eq!(fs.files(), vec![path("archive/Bar.md")]);

        let moved = sync.rename_folder(&archive, "old").await.unwrap();
        assert_eq!(fs.files(), vec![path("old/Bar.md")]);
        let graph = sync.graph();
        let graph = graph.lock().await;
        assert_eq!(graph.note("foo").unwrap().file_path, Some(path("old/Bar.md")));
        assert!(graph.folder_by_path(Path::new(&moved)).is_some());
    }

    #[tokio::test]
    async fn rename_onto_an_existing_file_is_refused() {
        let fs = MemoryFs::new();
        fs.insert_file(path("A.md"), "---\nid: a\n---\n\na\n");
        let sync = setup(&fs);
        sync.load_directory(Path::new(ROOT)).await.unwrap();
        fs.insert_file(path("B.md"), "outside the graph\n");

        let err = sync.rename_note("a", "B").await.unwrap_err();
        assert!(matches!(err, NoteGraphError::PathInUse { .. }));
        let graph = sync.graph();
        let graph = graph.lock().await;
        assert_eq!(graph.note("a").unwrap().title, "A");
        assert_eq!(graph.note("a").unwrap().file_path, Some(path("A.md")));
    }

    #[tokio::test]
    async fn external_modify_reloads_clean_notes() {
        let fs = MemoryFs::new();
        fs.insert_file(path("n.md"), "---\nid: n\n---\n\nold\n");
        let sync = setup(&fs);
        sync.load_directory(Path::new(ROOT)).await.unwrap();

        fs.insert_file(path("n.md"), "---\nid: n\n---\n\n[[Elsewhere]]\n");
        sync.reconcile_external_change(FsEvent::Modified(path("n.md")))
            .await
            .unwrap();
        let graph = sync.graph();
        let graph = graph.lock().await;
        assert_eq!(graph.backlinks_for("Elsewhere").len(), 1);
        assert!(!graph.is_dirty("n"));
    }

    #[tokio::test]
    async fn external_front_matter_edits_are_applied() {
        let fs = MemoryFs::new();
        fs.insert_file(
            path("n.md"),
            "---\nid: n1\ncreated: 2024-01-01T00:00:00+00:00\n---\n\nbody\n",
        );
        fs.insert_file(path("m.md"), "---\nid: m1\n---\n\nsee [[n]]\n");
        let sync = setup(&fs);
        sync.load_directory(Path::new(ROOT)).await.unwrap();
        {
            let graph = sync.graph();
            let graph = graph.lock().await;
            assert_eq!(graph.resolve_title("n").as_deref(), Some("n1"));
            assert!(graph.backlinks_for("n")[0].resolved);
        }

        fs.insert_file(
            path("n.md"),
            "---\nid: n1\ncreated: 2023-06-01T00:00:00+00:00\nwiki: true\npub: true\n---\n\nbody\n",
        );
        sync.reconcile_external_change(FsEvent::Modified(path("n.md")))
            .await
            .unwrap();
        let graph = sync.graph();
        let graph = graph.lock().await;
        let note = graph.note("n1").unwrap();
        assert!(note.is_wiki);
        assert!(note.is_pub);
        assert_eq!(note.created_at.to_rfc3339(), "2023-06-01T00:00:00+00:00");
        assert_eq!(graph.resolve_title("n"), None);
        assert!(!graph.backlinks_for("n")[0].resolved);
        assert!(!graph.is_dirty("n1"));
    }

    #[tokio::test]
    async fn external_modify_of_open_dirty_note_is_ignored() {
        let fs = MemoryFs::new();
        fs.insert_file(path("n.md"), "---\nid: n\n---\n\nold\n");
        let sync = setup(&fs);
        sync.load_directory(Path::new(ROOT)).await.unwrap();
        let graph = sync.graph();
        {
            let mut graph = graph.lock().await;
            graph.open_note("n").unwrap();
            graph
                .update_note_content("n", Document::parse("mine\n"))
                .unwrap();
        }

        fs.insert_file(path("n.md"), "---\nid: n\n---\n\ntheirs\n");
        sync.reconcile_external_change(FsEvent::Modified(path("n.md")))
            .await
            .unwrap();
        let graph = graph.lock().await;
        assert_eq!(graph.note("n").unwrap().content.plain_text(), "mine");
        assert!(graph.is_dirty("n"));
    }

    #[tokio::test]
    async fn our_own_writes_are_not_reapplied() {
        let fs = MemoryFs::new();
        fs.insert_file(path("n.md"), "---\nid: n\n---\n\nold\n");
        let sync = setup(&fs);
        sync.load_directory(Path::new(ROOT)).await.unwrap();
        let graph = sync.graph();
        let mut events = graph.lock().await.subscribe();

        graph
            .lock()
            .await
            .update_note_content("n", Document::parse("saved\n"))
            .unwrap();
        sync.persist("n").await.unwrap();
        while events.try_recv().is_ok() {}

        sync.reconcile_external_change(FsEvent::Modified(path("n.md")))
            .await
            .unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn external_create_remove_and_rename() {
        let fs = MemoryFs::new();
        fs.insert_file(path("keep.md"), "");
        let sync = setup(&fs);
        sync.load_directory(Path::new(ROOT)).await.unwrap();
        let graph = sync.graph();

        fs.insert_file(path("dir/new.md"), "---\nid: new\n---\n\n#fresh\n");
        sync.reconcile_external_change(FsEvent::Created(path("dir")))
            .await
            .unwrap();
        {
            let graph = graph.lock().await;
            assert!(graph.folder_by_path(&path("dir")).is_some());
            assert_eq!(graph.tags().get("fresh"), Some(&1));
        }

        fs.rename(&path("dir/new.md"), &path("Renamed.md"))
            .await
            .unwrap();
        sync.reconcile_external_change(FsEvent::Renamed {
            from: path("dir/new.md"),
            to: path("Renamed.md"),
        })
        .await
        .unwrap();
        {
            let graph = graph.lock().await;
            let note = graph.note("new").unwrap();
            assert_eq!(note.title, "Renamed");
            assert_eq!(note.file_path, Some(path("Renamed.md")));
            assert_eq!(graph.tree().parent_of("new"), Some(None));
        }

        fs.remove_file(&path("Renamed.md")).await.unwrap();
        sync.reconcile_external_change(FsEvent::Removed(path("Renamed.md")))
            .await
            .unwrap();
        assert!(graph.lock().await.note("new").is_none());
    }
}
