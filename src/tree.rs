//! Folder/note hierarchy mirroring the directory layout.
//!
//! Note nodes use the note id. Folder nodes use the folder's path as their
//! id, so renaming or moving a folder re-keys it and every folder below it.
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{NoteGraphError, Result};

/// A node in the tree: a folder or a note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteTreeItem {
    pub id: String,
    pub title: String,
    pub is_directory: bool,
    pub collapsed: bool,
    pub children: Vec<NoteTreeItem>,
}

impl NoteTreeItem {
    pub fn note(id: impl Into<String>, title: impl Into<String>) -> Self {
        NoteTreeItem {
            id: id.into(),
            title: title.into(),
            is_directory: false,
            collapsed: false,
            children: Vec::new(),
        }
    }

    pub fn folder(id: impl Into<String>, title: impl Into<String>) -> Self {
        NoteTreeItem {
            id: id.into(),
            title: title.into(),
            is_directory: true,
            collapsed: false,
            children: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: Vec<NoteTreeItem>) -> Self {
        self.children = children;
        self
    }

    /// Visits this node and its descendants, parents first.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a NoteTreeItem)) {
        visit(self);
        for child in &self.children {
            child.walk(visit);
        }
    }

    fn contains(&self, id: &str) -> bool {
        let mut found = false;
        self.walk(&mut |item| found |= item.id == id);
        found
    }

    fn sort(&mut self) {
        sort_items(&mut self.children);
    }
}

/// Folders first, then case-insensitive title order, recursively.
fn sort_items(items: &mut [NoteTreeItem]) {
    items.sort_by(|a, b| {
        b.is_directory
            .cmp(&a.is_directory)
            .then_with(|| a.title.to_lowercase().cmp(&b.title.to_lowercase()))
    });
    for item in items {
        item.sort();
    }
}

/// The whole hierarchy. Top-level items live directly under `root`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteTree {
    /// Directory the tree mirrors, if any.
    pub root: Option<PathBuf>,
    pub items: Vec<NoteTreeItem>,
}

impl NoteTree {
    pub fn new(root: Option<PathBuf>) -> Self {
        NoteTree {
            root,
            items: Vec::new(),
        }
    }

    pub fn with_items(mut self, items: Vec<NoteTreeItem>) -> Self {
        self.items = items;
        self
    }

    /// Sorts every level: folders first, then by title.
    pub fn sort(&mut self) {
        sort_items(&mut self.items);
    }

    /// Every node in pre-order.
    pub fn preorder(&self) -> Vec<&NoteTreeItem> {
        let mut out = Vec::new();
        for item in &self.items {
            item.walk(&mut |i| out.push(i));
        }
        out
    }

    /// Note ids in tree pre-order.
    pub fn note_ids(&self) -> Vec<String> {
        self.preorder()
            .into_iter()
            .filter(|i| !i.is_directory)
            .map(|i| i.id.clone())
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.iter().any(|i| i.contains(id))
    }

    pub fn find(&self, id: &str) -> Option<&NoteTreeItem> {
        self.preorder().into_iter().find(|i| i.id == id)
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut NoteTreeItem> {
        fn search<'a>(items: &'a mut [NoteTreeItem], id: &str) -> Option<&'a mut NoteTreeItem> {
            for item in items {
                if item.id == id {
                    return Some(item);
                }
                if let Some(found) = search(&mut item.children, id) {
                    return Some(found);
                }
            }
            None
        }
        search(&mut self.items, id)
    }

    /// Parent folder id of `id`. `Some(None)` means top level.
    pub fn parent_of(&self, id: &str) -> Option<Option<String>> {
        if self.items.iter().any(|i| i.id == id) {
            return Some(None);
        }
        self.preorder()
            .into_iter()
            .find(|item| item.children.iter().any(|c| c.id == id))
            .map(|parent| Some(parent.id.clone()))
    }

    /// Appends `item` under `parent` (top level when `None`).
    pub fn insert(&mut self, parent: Option<&str>, item: NoteTreeItem) -> Result<()> {
        let siblings = match parent {
            None => &mut self.items,
            Some(parent_id) => match self.find_mut(parent_id) {
                Some(folder) if folder.is_directory => &mut folder.children,
                _ => {
                    return Err(NoteGraphError::FolderNotFound {
                        id: parent_id.to_string(),
                    })
                }
            },
        };
        siblings.push(item);
        Ok(())
    }

    /// Detaches `id` and its subtree.
    pub fn remove(&mut self, id: &str) -> Option<NoteTreeItem> {
        fn take(items: &mut Vec<NoteTreeItem>, id: &str) -> Option<NoteTreeItem> {
            if let Some(pos) = items.iter().position(|i| i.id == id) {
                return Some(items.remove(pos));
            }
            items.iter_mut().find_map(|i| take(&mut i.children, id))
        }
        take(&mut self.items, id)
    }

    /// Moves `id` under `new_parent`. Refuses to create a cycle.
    pub fn move_item(&mut self, id: &str, new_parent: Option<&str>) -> Result<()> {
        let item = self.find(id).ok_or_else(|| NoteGraphError::NoteNotFound {
            id: id.to_string(),
        })?;
        if let Some(parent) = new_parent {
            if item.contains(parent) {
                return Err(NoteGraphError::InvalidMove {
                    message: format!("{id} cannot be moved into itself"),
                });
            }
            match self.find(parent) {
                Some(folder) if folder.is_directory => {}
                _ => {
                    return Err(NoteGraphError::FolderNotFound {
                        id: parent.to_string(),
                    })
                }
            }
        }

        if let Some(item) = self.remove(id) {
            self.insert(new_parent, item)?;
        }
        Ok(())
    }

    /// Note ids below `folder`, deepest first, in reverse tree order.
    pub fn notes_bottom_up(&self, folder: &str) -> Vec<String> {
        fn collect(item: &NoteTreeItem, out: &mut Vec<String>) {
            for child in item.children.iter().rev() {
                collect(child, out);
            }
            if !item.is_directory {
                out.push(item.id.clone());
            }
        }
        let mut out = Vec::new();
        if let Some(item) = self.find(folder) {
            collect(item, &mut out);
        }
        out
    }

    /// Flips the collapsed flag of a folder and returns the new value.
    pub fn toggle_collapsed(&mut self, id: &str) -> Result<bool> {
        match self.find_mut(id) {
            Some(folder) if folder.is_directory => {
                folder.collapsed = !folder.collapsed;
                Ok(folder.collapsed)
            }
            _ => Err(NoteGraphError::FolderNotFound { id: id.to_string() }),
        }
    }

    pub fn set_title(&mut self, id: &str, title: &str) {
        if let Some(item) = self.find_mut(id) {
            item.title = title.to_string();
        }
    }

    /// Re-keys folder `old` (and every folder below it) to live at `new`.
    pub fn rekey_folder(&mut self, old: &Path, new: &Path) {
        let Some(folder) = self.find_mut(&old.to_string_lossy()) else {
            return;
        };
        fn rekey(item: &mut NoteTreeItem, old: &Path, new: &Path) {
            if item.is_directory {
                if let Ok(rest) = Path::new(&item.id).strip_prefix(old) {
                    item.id = new.join(rest).to_string_lossy().to_string();
                }
                for child in &mut item.children {
                    rekey(child, old, new);
                }
            }
        }
        rekey(folder, old, new);
        if let Some(name) = new.file_name() {
            folder.title = name.to_string_lossy().to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NoteTree {
        NoteTree::new(Some(PathBuf::from("/n"))).with_items(vec![
            NoteTreeItem::folder("/n/work", "work").with_children(vec![
                NoteTreeItem::note("x", "X"),
                NoteTreeItem::folder("/n/work/old", "old")
                    .with_children(vec![NoteTreeItem::note("y", "Y")]),
            ]),
            NoteTreeItem::note("z", "Z"),
        ])
    }

    #[test]
    fn preorder_lists_notes_in_tree_order() {
        assert_eq!(sample().note_ids(), vec!["x", "y", "z"]);
    }

    #[test]
    fn parent_lookup() {
        let tree = sample();
        assert_eq!(tree.parent_of("z"), Some(None));
        assert_eq!(tree.parent_of("y"), Some(Some("/n/work/old".to_string())));
        assert_eq!(tree.parent_of("nope"), None);
    }

    #[test]
    fn insert_requires_a_folder_parent() {
        let mut tree = sample();
        assert!(tree.insert(Some("z"), NoteTreeItem::note("w", "W")).is_err());
        tree.insert(Some("/n/work"), NoteTreeItem::note("w", "W"))
            .unwrap();
        assert_eq!(tree.parent_of("w"), Some(Some("/n/work".to_string())));
    }

    #[test]
    fn moving_a_folder_into_itself_is_refused() {
        let mut tree = sample();
        let err = tree.move_item("/n/work", Some("/n/work/old")).unwrap_err();
        assert!(matches!(err, NoteGraphError::InvalidMove { .. }));
        assert_eq!(tree, sample());
    }

    #[test]
    fn bottom_up_order_visits_deepest_notes_first() {
        assert_eq!(sample().notes_bottom_up("/n/work"), vec!["y", "x"]);
    }

    #[test]
    fn rekey_updates_nested_folder_ids() {
        let mut tree = sample();
        tree.rekey_folder(Path::new("/n/work"), Path::new("/n/jobs"));
        assert!(tree.find("/n/jobs").is_some());
        assert!(tree.find("/n/jobs/old").is_some());
        assert_eq!(tree.find("/n/jobs").unwrap().title, "jobs");
        assert!(!tree.contains("/n/work"));
    }

    #[test]
    fn toggle_collapsed_only_for_folders() {
        let mut tree = sample();
        assert!(tree.toggle_collapsed("/n/work").unwrap());
        assert!(!tree.toggle_collapsed("/n/work").unwrap());
        assert!(tree.toggle_collapsed("z").is_err());
    }

    #[test]
    fn sort_puts_folders_first() {
        let mut tree = NoteTree::default().with_items(vec![
            NoteTreeItem::note("b", "beta"),
            NoteTreeItem::folder("f", "zeta"),
            NoteTreeItem::note("a", "Alpha"),
        ]);
        tree.sort();
        let ids: Vec<_> = tree.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["f", "a", "b"]);
    }
}
