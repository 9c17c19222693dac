//! The single in-memory state of the note graph.
//!
//! [`NoteGraph`] owns the note map, the folder tree, the backlink index and
//! the editor-facing state (open views, current note, dirty set). Every
//! mutation goes through its methods so the map, the tree and the index
//! always change together. Consumers observe changes through
//! [`NoteGraph::subscribe`].
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use fuzzy_matcher::{skim::SkimMatcherV2, FuzzyMatcher};
use log::{debug, info, trace};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::{
    resolve, scan, BacklinkIndex, Block, BlockId, BlockKind, Document, FolderId, Inline, NewNote,
    Note, NoteGraphError, NoteId, NoteTree, NoteTreeItem, Reference, Result, TargetResolver,
};

const EVENT_CAPACITY: usize = 256;

/// Change notifications published by the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum GraphEvent {
    Loaded { notes: usize },
    NoteCreated { id: NoteId },
    NoteUpdated { id: NoteId },
    NoteRenamed { id: NoteId, title: String },
    NoteMoved { id: NoteId },
    NoteDeleted { id: NoteId },
    FolderCreated { id: FolderId },
    FolderMoved { from: FolderId, to: FolderId },
    FolderDeleted { id: FolderId },
    CurrentNoteChanged { id: Option<NoteId> },
    Persisted { id: NoteId },
    /// A save failed. The note stays dirty so the save can be retried.
    PersistFailed { id: NoteId, message: String },
}

/// A file that has to move on disk after a rename or move in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathChange {
    pub from: PathBuf,
    pub to: PathBuf,
}

/// A block that names a note in plain text without linking to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mention {
    pub note_id: NoteId,
    pub block_id: BlockId,
    pub text: String,
}

/// A checklist item somewhere in the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Task {
    pub note_id: NoteId,
    pub block_id: BlockId,
    pub text: String,
    pub checked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchHit {
    pub note_id: NoteId,
    pub title: String,
    pub score: i64,
}

/// Notes, tree and backlink index behind one narrow mutation API.
#[derive(Debug)]
pub struct NoteGraph {
    notes: HashMap<NoteId, Note>,
    tree: NoteTree,
    index: BacklinkIndex,

    /// Block id -> notes that contain a block with that id.
    block_owners: HashMap<BlockId, BTreeSet<NoteId>>,
    /// Lowercased title -> non-wiki notes carrying it.
    titles: HashMap<String, BTreeSet<NoteId>>,
    paths: HashMap<PathBuf, NoteId>,
    /// Position of every note in tree pre-order.
    tree_order: HashMap<NoteId, usize>,

    open: Vec<NoteId>,
    current: Option<NoteId>,
    dirty: HashSet<NoteId>,
    /// Bumped on every content change; lets a finished save tell whether a
    /// newer edit arrived while it was writing.
    revisions: HashMap<NoteId, u64>,

    default_extension: String,
    events: broadcast::Sender<GraphEvent>,
}

impl Default for NoteGraph {
    fn default() -> Self {
        Self::new(None)
    }
}

impl NoteGraph {
    /// Creates an empty graph. With a `root`, new notes get a file path
    /// under it.
    pub fn new(root: Option<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        NoteGraph {
            notes: HashMap::new(),
            tree: NoteTree::new(root),
            index: BacklinkIndex::new(),
            block_owners: HashMap::new(),
            titles: HashMap::new(),
            paths: HashMap::new(),
            tree_order: HashMap::new(),
            open: Vec::new(),
            current: None,
            dirty: HashSet::new(),
            revisions: HashMap::new(),
            default_extension: "md".to_string(),
            events,
        }
    }

    pub fn with_default_extension(mut self, extension: impl Into<String>) -> Self {
        self.default_extension = extension.into();
        self
    }

    /// Subscribes to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<GraphEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: GraphEvent) {
        trace!("graph event: {:?}", event);
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    // ------------------------------------------------------------------
    // Bulk replacement
    // ------------------------------------------------------------------

    /// Replaces the note map and rebuilds every derived structure.
    pub fn set_notes(&mut self, notes: HashMap<NoteId, Note>) {
        self.notes = notes;
        self.rebuild();
    }

    /// Replaces the tree.
    pub fn set_note_tree(&mut self, tree: NoteTree) {
        self.tree = tree;
        self.rebuild();
    }

    /// Replaces notes and tree in one step.
    pub fn replace_all(&mut self, notes: HashMap<NoteId, Note>, tree: NoteTree) {
        self.notes = notes;
        self.tree = tree;
        self.rebuild();
        info!("Graph replaced with {} notes", self.notes.len());
        self.emit(GraphEvent::Loaded {
            notes: self.notes.len(),
        });
    }

    fn rebuild(&mut self) {
        self.index.clear();
        self.block_owners.clear();
        self.titles.clear();
        self.paths.clear();
        let ids: Vec<NoteId> = self.notes.keys().cloned().collect();
        for id in &ids {
            self.index_identity(id);
            self.index_content(id);
        }
        self.rebuild_tree_order();

        let notes = &self.notes;
        self.open.retain(|id| notes.contains_key(id));
        self.dirty.retain(|id| notes.contains_key(id));
        self.revisions.retain(|id, _| notes.contains_key(id));
        if self.current.as_ref().is_some_and(|id| !notes.contains_key(id)) {
            self.current = self.open.first().cloned();
        }
        debug!(
            "Rebuilt graph: {} notes, {} references",
            self.notes.len(),
            self.index.len()
        );
    }

    fn rebuild_tree_order(&mut self) {
        self.tree_order = self
            .tree
            .note_ids()
            .into_iter()
            .enumerate()
            .map(|(position, id)| (id, position))
            .collect();
    }

    fn index_identity(&mut self, id: &str) {
        let Some(note) = self.notes.get(id) else {
            return;
        };
        if !note.is_wiki {
            self.titles
                .entry(note.title.to_lowercase())
                .or_default()
                .insert(id.to_string());
        }
        if let Some(path) = &note.file_path {
            self.paths.insert(path.clone(), id.to_string());
        }
    }

    fn unindex_identity(&mut self, id: &str) {
        let Some(note) = self.notes.get(id) else {
            return;
        };
        let key = note.title.to_lowercase();
        if let Some(ids) = self.titles.get_mut(&key) {
            ids.remove(id);
            if ids.is_empty() {
                self.titles.remove(&key);
            }
        }
        if let Some(path) = &note.file_path {
            if self.paths.get(path).is_some_and(|owner| owner == id) {
                self.paths.remove(path);
            }
        }
    }

    fn index_content(&mut self, id: &str) {
        let Some(note) = self.notes.get(id) else {
            return;
        };
        for block_id in note.content.block_ids() {
            self.block_owners
                .entry(block_id)
                .or_default()
                .insert(id.to_string());
        }
        self.index.update(id, scan(id, &note.content));
    }

    fn unindex_content(&mut self, id: &str) {
        let Some(note) = self.notes.get(id) else {
            return;
        };
        for block_id in note.content.block_ids() {
            if let Some(owners) = self.block_owners.get_mut(&block_id) {
                owners.remove(id);
                if owners.is_empty() {
                    self.block_owners.remove(&block_id);
                }
            }
        }
        self.index.retract(id);
    }

    fn bump_revision(&mut self, id: &str) {
        *self.revisions.entry(id.to_string()).or_insert(0) += 1;
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn note(&self, id: &str) -> Option<&Note> {
        self.notes.get(id)
    }

    pub fn notes(&self) -> impl Iterator<Item = &Note> {
        self.notes.values()
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    pub fn tree(&self) -> &NoteTree {
        &self.tree
    }

    pub fn root(&self) -> Option<&Path> {
        self.tree.root.as_deref()
    }

    pub fn index(&self) -> &BacklinkIndex {
        &self.index
    }

    pub fn note_by_path(&self, path: &Path) -> Option<&Note> {
        self.paths.get(path).and_then(|id| self.notes.get(id))
    }

    pub fn folder_by_path(&self, path: &Path) -> Option<&NoteTreeItem> {
        self.tree
            .find(&path.to_string_lossy())
            .filter(|item| item.is_directory)
    }

    /// Notes that contain a block with this id.
    pub fn block_owners(&self, block_id: &str) -> Vec<NoteId> {
        self.block_owners
            .get(block_id)
            .map(|owners| owners.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Notes in tree order, then notes outside the tree by creation time.
    pub fn notes_in_order(&self) -> Vec<&Note> {
        let mut notes: Vec<&Note> = self.notes.values().collect();
        notes.sort_by_key(|note| self.rank(note));
        notes
    }

    fn rank(&self, note: &Note) -> (usize, DateTime<Utc>, NoteId) {
        (
            self.tree_order.get(&note.id).copied().unwrap_or(usize::MAX),
            note.created_at,
            note.id.clone(),
        )
    }

    /// The note a title-addressed link points at.
    ///
    /// Titles match case-insensitively among non-wiki notes. When several
    /// notes share a title the first one in tree order wins.
    pub fn resolve_title(&self, title: &str) -> Option<NoteId> {
        self.titles
            .get(&title.to_lowercase())?
            .iter()
            .filter_map(|id| self.notes.get(id))
            .min_by_key(|note| self.rank(note))
            .map(|note| note.id.clone())
    }

    /// References pointing at a note id, tag name, block id or note title,
    /// resolved against the current state.
    pub fn backlinks_for(&self, key: &str) -> Vec<Reference> {
        let mut references = self.index.backlinks_for(key);
        resolve(&mut references, self);
        references
    }

    /// Note links that land on note `id`: by id, or by a title that
    /// currently resolves to it.
    pub fn backlinks_for_note(&self, id: &str) -> Vec<Reference> {
        let title = self.notes.get(id).map(|note| note.title.as_str());
        let mut references = self.index.backlinks_for_note(id, title);
        references.retain(|r| {
            !r.is_title_link() || self.resolve_title(&r.target_key).as_deref() == Some(id)
        });
        resolve(&mut references, self);
        references
    }

    /// References whose target does not exist right now.
    pub fn unresolved(&self) -> Vec<Reference> {
        self.index.unresolved(self)
    }

    pub fn tags(&self) -> BTreeMap<String, usize> {
        self.index.tags()
    }

    /// Blocks in other notes that mention the title of `id` in plain text.
    pub fn unlinked_mentions(&self, id: &str) -> Result<Vec<Mention>> {
        let target = self
            .notes
            .get(id)
            .ok_or_else(|| NoteGraphError::NoteNotFound { id: id.to_string() })?;
        let needle = target.title.to_lowercase();
        if needle.trim().is_empty() {
            return Ok(Vec::new());
        }

        let mut mentions = Vec::new();
        for note in self.notes_in_order() {
            if note.id == id {
                continue;
            }
            for block in note.content.blocks_preorder() {
                if matches!(
                    block.kind,
                    BlockKind::CodeBlock { .. } | BlockKind::Table { .. }
                ) {
                    continue;
                }
                if contains_word(&mention_text(block).to_lowercase(), &needle) {
                    mentions.push(Mention {
                        note_id: note.id.clone(),
                        block_id: block.id.clone(),
                        text: block.plain_text(),
                    });
                }
            }
        }
        Ok(mentions)
    }

    /// Checklist items in tree order. Completed ones only with `include_done`.
    pub fn tasks(&self, include_done: bool) -> Vec<Task> {
        let mut tasks = Vec::new();
        for note in self.notes_in_order() {
            for block in note.content.blocks_preorder() {
                if let BlockKind::ChecklistItem { checked } = block.kind {
                    if include_done || !checked {
                        tasks.push(Task {
                            note_id: note.id.clone(),
                            block_id: block.id.clone(),
                            text: block.plain_text(),
                            checked,
                        });
                    }
                }
            }
        }
        tasks
    }

    /// Fuzzy search over titles and content. Title matches weigh double.
    pub fn search(&self, query: &str, limit: usize) -> Vec<SearchHit> {
        debug!("Searching {} notes for '{}'", self.notes.len(), query);
        let matcher = SkimMatcherV2::default();
        let mut hits: Vec<SearchHit> = self
            .notes
            .values()
            .filter_map(|note| {
                let title_score = matcher.fuzzy_match(&note.title, query).unwrap_or(0);
                let content_score = matcher
                    .fuzzy_match(&note.content.plain_text(), query)
                    .unwrap_or(0);
                let score = title_score * 2 + content_score;
                (score > 0).then(|| SearchHit {
                    note_id: note.id.clone(),
                    title: note.title.clone(),
                    score,
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.title.cmp(&b.title)));
        hits.truncate(limit);
        hits
    }

    // ------------------------------------------------------------------
    // Note mutations
    // ------------------------------------------------------------------

    fn require_note(&self, id: &str) -> Result<&Note> {
        self.notes
            .get(id)
            .ok_or_else(|| NoteGraphError::NoteNotFound { id: id.to_string() })
    }

    fn require_folder(&self, id: &str) -> Result<()> {
        match self.tree.find(id) {
            Some(item) if item.is_directory => Ok(()),
            _ => Err(NoteGraphError::FolderNotFound { id: id.to_string() }),
        }
    }

    /// Directory backing `folder` (the root for top level).
    fn folder_dir(&self, folder: Option<&str>) -> Option<PathBuf> {
        match folder {
            Some(folder) => Some(PathBuf::from(folder)),
            None => self.tree.root.clone(),
        }
    }

    fn claim_path(&self, path: &Path, id: &str) -> Result<()> {
        match self.paths.get(path) {
            Some(owner) if owner != id => Err(NoteGraphError::PathInUse {
                path: path.to_path_buf(),
            }),
            _ => Ok(()),
        }
    }

    /// Creates a note under `new.parent`. In a rooted graph the note gets a
    /// file path `<folder>/<title>.<ext>` and starts out dirty.
    pub fn create_note(&mut self, new: NewNote) -> Result<Note> {
        if let Some(parent) = &new.parent {
            self.require_folder(parent)?;
        }

        let mut note = Note::new(new.title, new.content);
        note.is_wiki = new.is_wiki;
        note.is_pub = new.is_pub;
        if self.tree.root.is_some() {
            note.file_path = self.folder_dir(new.parent.as_deref()).map(|dir| {
                dir.join(format!(
                    "{}.{}",
                    file_stem_for(&note.title),
                    self.default_extension
                ))
            });
        }
        if let Some(path) = &note.file_path {
            self.claim_path(path, &note.id)?;
        }

        let id = note.id.clone();
        self.tree
            .insert(new.parent.as_deref(), NoteTreeItem::note(&id, &note.title))?;
        self.notes.insert(id.clone(), note.clone());
        self.index_identity(&id);
        self.index_content(&id);
        self.rebuild_tree_order();
        self.dirty.insert(id.clone());
        self.bump_revision(&id);

        info!("Created note {} ({})", note.title, id);
        self.emit(GraphEvent::NoteCreated { id });
        Ok(note)
    }

    /// Adds an already-built note (for example one discovered on disk).
    pub fn insert_note(&mut self, note: Note, parent: Option<&str>) -> Result<()> {
        if self.notes.contains_key(&note.id) || self.tree.find(&note.id).is_some() {
            return Err(NoteGraphError::InvalidMove {
                message: format!("note id {} is already in use", note.id),
            });
        }
        if let Some(parent) = parent {
            self.require_folder(parent)?;
        }
        if let Some(path) = &note.file_path {
            self.claim_path(path, &note.id)?;
        }

        let id = note.id.clone();
        self.tree
            .insert(parent, NoteTreeItem::note(&id, &note.title))?;
        self.notes.insert(id.clone(), note);
        self.index_identity(&id);
        self.index_content(&id);
        self.rebuild_tree_order();
        debug!("Inserted note {}", id);
        self.emit(GraphEvent::NoteCreated { id });
        Ok(())
    }

    /// Replaces a note's content, re-scans it and marks it dirty.
    ///
    /// Notes without a file get `updated_at` bumped right away; file-backed
    /// notes advance it when the write succeeds (see [`Self::mark_persisted`]).
    pub fn update_note_content(&mut self, id: &str, content: Document) -> Result<()> {
        self.require_note(id)?;
        self.unindex_content(id);
        if let Some(note) = self.notes.get_mut(id) {
            note.content = content;
            if note.file_path.is_none() {
                note.touch(Utc::now());
            }
        }
        self.index_content(id);
        self.dirty.insert(id.to_string());
        self.bump_revision(id);
        trace!("Updated content of {}", id);
        self.emit(GraphEvent::NoteUpdated { id: id.to_string() });
        Ok(())
    }

    /// Replaces a note's content and front matter flags with what is on
    /// disk. The note is clean afterwards.
    pub(crate) fn apply_disk_content(&mut self, id: &str, disk: Note) -> Result<()> {
        self.require_note(id)?;
        self.unindex_content(id);
        self.unindex_identity(id);
        if let Some(note) = self.notes.get_mut(id) {
            note.content = disk.content;
            note.is_wiki = disk.is_wiki;
            note.is_pub = disk.is_pub;
            note.created_at = disk.created_at;
            note.touch(disk.updated_at);
        }
        self.index_identity(id);
        self.index_content(id);
        self.dirty.remove(id);
        self.bump_revision(id);
        self.emit(GraphEvent::NoteUpdated { id: id.to_string() });
        Ok(())
    }

    pub fn mark_dirty(&mut self, id: &str) -> Result<()> {
        self.require_note(id)?;
        self.dirty.insert(id.to_string());
        self.bump_revision(id);
        Ok(())
    }

    pub fn is_dirty(&self, id: &str) -> bool {
        self.dirty.contains(id)
    }

    pub fn dirty_notes(&self) -> Vec<NoteId> {
        let mut ids: Vec<NoteId> = self.dirty.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Content revision of a note. Changes on every edit.
    pub fn revision(&self, id: &str) -> u64 {
        self.revisions.get(id).copied().unwrap_or(0)
    }

    /// Records a successful write of `revision` at `at`.
    ///
    /// Advances `updated_at` and clears the dirty flag unless a newer edit
    /// arrived while the write was in flight.
    pub fn mark_persisted(&mut self, id: &str, revision: u64, at: DateTime<Utc>) {
        let Some(note) = self.notes.get_mut(id) else {
            return;
        };
        note.touch(at);
        if self.revision(id) == revision {
            self.dirty.remove(id);
        }
        self.emit(GraphEvent::Persisted { id: id.to_string() });
    }

    /// Points a note at a file that was moved outside the engine.
    pub(crate) fn set_note_path(&mut self, id: &str, path: PathBuf) -> Result<()> {
        self.require_note(id)?;
        self.claim_path(&path, id)?;
        self.unindex_identity(id);
        if let Some(note) = self.notes.get_mut(id) {
            note.file_path = Some(path);
        }
        self.index_identity(id);
        Ok(())
    }

    /// Renames a note. Other notes are never rewritten, so title-addressed
    /// links to the old title stop resolving.
    pub fn rename_note(&mut self, id: &str, new_title: &str) -> Result<Option<PathChange>> {
        let note = self.require_note(id)?;
        let change = match &note.file_path {
            Some(old) => {
                let extension = old
                    .extension()
                    .map(|e| e.to_string_lossy().to_string())
                    .unwrap_or_else(|| self.default_extension.clone());
                let new = old.with_file_name(format!("{}.{extension}", file_stem_for(new_title)));
                self.claim_path(&new, id)?;
                (new != *old).then(|| PathChange {
                    from: old.clone(),
                    to: new,
                })
            }
            None => None,
        };

        self.unindex_identity(id);
        if let Some(note) = self.notes.get_mut(id) {
            note.set_title(new_title);
            if let Some(change) = &change {
                note.file_path = Some(change.to.clone());
            }
        }
        self.index_identity(id);
        self.tree.set_title(id, new_title);

        info!("Renamed note {} to {}", id, new_title);
        self.emit(GraphEvent::NoteRenamed {
            id: id.to_string(),
            title: new_title.to_string(),
        });
        Ok(change)
    }

    /// Moves a note to another folder. The backlink index is unaffected.
    pub fn move_note(&mut self, id: &str, new_parent: Option<&str>) -> Result<Option<PathChange>> {
        let note = self.require_note(id)?;
        if let Some(parent) = new_parent {
            self.require_folder(parent)?;
        }
        let change = match (&note.file_path, self.folder_dir(new_parent)) {
            (Some(old), Some(dir)) => {
                let new = match old.file_name() {
                    Some(name) => dir.join(name),
                    None => old.clone(),
                };
                self.claim_path(&new, id)?;
                (new != *old).then(|| PathChange {
                    from: old.clone(),
                    to: new,
                })
            }
            _ => None,
        };

        self.tree.move_item(id, new_parent)?;
        if let Some(change) = &change {
            self.unindex_identity(id);
            if let Some(note) = self.notes.get_mut(id) {
                note.file_path = Some(change.to.clone());
            }
            self.index_identity(id);
        }
        self.rebuild_tree_order();

        debug!("Moved note {} to {:?}", id, new_parent);
        self.emit(GraphEvent::NoteMoved { id: id.to_string() });
        Ok(change)
    }

    /// Removes a note. Its outgoing references are retracted; references
    /// to it stay and turn unresolved. A view on it moves to the next open
    /// note, else to the first remaining note in tree order, else to none.
    pub fn delete_note(&mut self, id: &str) -> Result<Note> {
        self.require_note(id)?;
        self.unindex_content(id);
        self.unindex_identity(id);
        let note = self
            .notes
            .remove(id)
            .ok_or_else(|| NoteGraphError::NoteNotFound { id: id.to_string() })?;
        self.tree.remove(id);
        self.rebuild_tree_order();
        self.dirty.remove(id);
        self.revisions.remove(id);
        self.drop_view(id, true);

        info!("Deleted note {} ({})", note.title, id);
        self.emit(GraphEvent::NoteDeleted { id: id.to_string() });
        Ok(note)
    }

    // ------------------------------------------------------------------
    // Folder mutations
    // ------------------------------------------------------------------

    /// Creates a folder named `name` under `parent`.
    pub fn create_folder(&mut self, parent: Option<&str>, name: &str) -> Result<FolderId> {
        if let Some(parent) = parent {
            self.require_folder(parent)?;
        }
        let path = self.folder_dir(parent).unwrap_or_default().join(name);
        let id = path.to_string_lossy().to_string();
        if self.tree.contains(&id) {
            return Err(NoteGraphError::PathInUse { path });
        }

        self.tree.insert(parent, NoteTreeItem::folder(&id, name))?;
        debug!("Created folder {}", id);
        self.emit(GraphEvent::FolderCreated { id: id.clone() });
        Ok(id)
    }

    /// Makes sure a folder exists for `dir` (and its ancestors up to the
    /// root). Returns the folder id, or `None` for the root itself.
    pub fn ensure_folder(&mut self, dir: &Path) -> Result<Option<FolderId>> {
        let Some(root) = self.tree.root.clone() else {
            return Err(NoteGraphError::FolderNotFound {
                id: dir.to_string_lossy().to_string(),
            });
        };
        if dir == root {
            return Ok(None);
        }
        if !dir.starts_with(&root) {
            return Err(NoteGraphError::FolderNotFound {
                id: dir.to_string_lossy().to_string(),
            });
        }
        let id = dir.to_string_lossy().to_string();
        if self.folder_by_path(dir).is_some() {
            return Ok(Some(id));
        }

        let parent = match dir.parent() {
            Some(parent) => self.ensure_folder(parent)?,
            None => None,
        };
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| id.clone());
        self.tree
            .insert(parent.as_deref(), NoteTreeItem::folder(&id, name))?;
        self.emit(GraphEvent::FolderCreated { id: id.clone() });
        Ok(Some(id))
    }

    pub fn rename_folder(&mut self, id: &str, new_name: &str) -> Result<PathChange> {
        self.require_folder(id)?;
        let parent = self.tree.parent_of(id).flatten();
        self.relocate_folder(id, parent.as_deref(), new_name)
    }

    /// Moves a folder and everything in it. Refuses to move a folder into
    /// its own subtree.
    pub fn move_folder(&mut self, id: &str, new_parent: Option<&str>) -> Result<PathChange> {
        self.require_folder(id)?;
        let name = Path::new(id)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| id.to_string());
        self.relocate_folder(id, new_parent, &name)
    }

    /// Moves folder `id` under `new_parent` with the name `new_name`.
    pub(crate) fn relocate_folder(
        &mut self,
        id: &str,
        new_parent: Option<&str>,
        new_name: &str,
    ) -> Result<PathChange> {
        let old = PathBuf::from(id);
        let new = self.folder_dir(new_parent).unwrap_or_default().join(new_name);
        if new == old {
            return Ok(PathChange { from: old, to: new });
        }
        if self.tree.contains(&new.to_string_lossy()) {
            return Err(NoteGraphError::PathInUse { path: new });
        }

        let current_parent = self.tree.parent_of(id).flatten();
        if current_parent.as_deref() != new_parent {
            self.tree.move_item(id, new_parent)?;
        }

        for note_id in self.tree.notes_bottom_up(id) {
            let Some(path) = self.notes.get(&note_id).and_then(|n| n.file_path.clone()) else {
                continue;
            };
            let Ok(rest) = path.strip_prefix(&old) else {
                continue;
            };
            let moved = new.join(rest);
            self.unindex_identity(&note_id);
            if let Some(note) = self.notes.get_mut(&note_id) {
                note.file_path = Some(moved);
            }
            self.index_identity(&note_id);
        }
        self.tree.rekey_folder(&old, &new);
        self.rebuild_tree_order();

        let to = new.to_string_lossy().to_string();
        info!("Moved folder {} to {}", id, to);
        self.emit(GraphEvent::FolderMoved {
            from: id.to_string(),
            to,
        });
        Ok(PathChange { from: old, to: new })
    }

    /// Deletes every note in a folder, deepest first, then the folder node.
    pub fn delete_folder(&mut self, id: &str) -> Result<Vec<Note>> {
        self.require_folder(id)?;
        let mut removed = Vec::new();
        for note_id in self.tree.notes_bottom_up(id) {
            removed.push(self.delete_note(&note_id)?);
        }
        self.tree.remove(id);
        self.rebuild_tree_order();

        info!("Deleted folder {} with {} notes", id, removed.len());
        self.emit(GraphEvent::FolderDeleted { id: id.to_string() });
        Ok(removed)
    }

    pub fn toggle_collapsed(&mut self, id: &str) -> Result<bool> {
        self.tree.toggle_collapsed(id)
    }

    // ------------------------------------------------------------------
    // Editor views
    // ------------------------------------------------------------------

    /// Opens a view on `id` and makes it current.
    pub fn open_note(&mut self, id: &str) -> Result<()> {
        self.require_note(id)?;
        if !self.open.iter().any(|open| open == id) {
            self.open.push(id.to_string());
        }
        self.current = Some(id.to_string());
        self.emit(GraphEvent::CurrentNoteChanged {
            id: self.current.clone(),
        });
        Ok(())
    }

    pub fn close_note(&mut self, id: &str) {
        self.drop_view(id, false);
    }

    /// `deleted` also falls back to any remaining note when no other view
    /// is open.
    fn drop_view(&mut self, id: &str, deleted: bool) {
        let position = self.open.iter().position(|open| open == id);
        if let Some(position) = position {
            self.open.remove(position);
        }
        if self.current.as_deref() == Some(id) {
            self.current = position
                .and_then(|p| self.open.get(p))
                .or_else(|| self.open.last())
                .cloned();
            if self.current.is_none() && deleted {
                let first = self.notes_in_order().first().map(|note| note.id.clone());
                if let Some(first) = first {
                    self.open.push(first.clone());
                    self.current = Some(first);
                }
            }
            self.emit(GraphEvent::CurrentNoteChanged {
                id: self.current.clone(),
            });
        }
    }

    pub fn current_note(&self) -> Option<&Note> {
        self.current.as_ref().and_then(|id| self.notes.get(id))
    }

    pub fn current_note_id(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn open_notes(&self) -> &[NoteId] {
        &self.open
    }
}

impl TargetResolver for NoteGraph {
    fn note_exists(&self, id: &str) -> bool {
        self.notes.contains_key(id)
    }

    fn resolve_title(&self, title: &str) -> Option<NoteId> {
        NoteGraph::resolve_title(self, title)
    }

    fn block_exists(&self, id: &str) -> bool {
        self.block_owners.contains_key(id)
    }
}

/// File stem for a title: path separators are not allowed in file names.
pub fn file_stem_for(title: &str) -> String {
    title.trim().replace(['/', '\\'], "-")
}

/// Plain text of a block outside of links and code, with a line break
/// wherever another inline interrupts it.
fn mention_text(block: &Block) -> String {
    let mut text = String::new();
    for inline in &block.content {
        match inline {
            Inline::Text { text: run, marks } if !marks.code => text.push_str(run),
            _ => text.push('\n'),
        }
    }
    text
}

fn contains_word(haystack: &str, needle: &str) -> bool {
    haystack.match_indices(needle).any(|(start, matched)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + matched.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}
