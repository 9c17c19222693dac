//! Core data structures for notes.
//!
//! This module contains the [`Note`] type held by the store and the
//! [`NewNote`] request used to create one.
use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Document, FolderId, NoteId};

/// Represents a single note in our system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    /// Unique identifier for the note, never derived from title or path
    pub id: NoteId,
    /// Note title (the file stem for file-backed notes)
    pub title: String,
    /// Structured content
    pub content: Document,
    /// Backing file, absent for in-memory notes
    pub file_path: Option<PathBuf>,
    /// When the note was created
    pub created_at: DateTime<Utc>,
    /// Last persisted modification time
    pub updated_at: DateTime<Utc>,
    /// Wiki notes are excluded from title resolution
    pub is_wiki: bool,
    pub is_pub: bool,
    /// Title is an ISO date (`YYYY-MM-DD`)
    pub is_daily: bool,
}

impl Note {
    /// Creates a new note with a fresh id
    pub fn new(title: impl Into<String>, content: Document) -> Self {
        let now = Utc::now();
        let title = title.into();
        Note {
            id: Self::generate_id(),
            is_daily: Self::is_daily_title(&title),
            title,
            content,
            file_path: None,
            created_at: now,
            updated_at: now,
            is_wiki: false,
            is_pub: false,
        }
    }

    /// Allocates a note id. Ids are random and never reused.
    pub fn generate_id() -> NoteId {
        Uuid::new_v4().to_string()
    }

    /// Whether a title names a daily note.
    pub fn is_daily_title(title: &str) -> bool {
        NaiveDate::parse_from_str(title, "%Y-%m-%d").is_ok()
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        self.title = title.into();
        self.is_daily = Self::is_daily_title(&self.title);
    }

    /// Advances `updated_at` to `at`. Never moves it backwards.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.updated_at {
            self.updated_at = at;
        }
    }
}

/// Request to create a note through the store.
#[derive(Debug, Clone, Default)]
pub struct NewNote {
    pub title: String,
    /// Folder to create the note in; top level when `None`
    pub parent: Option<FolderId>,
    pub content: Document,
    pub is_wiki: bool,
    pub is_pub: bool,
}

impl NewNote {
    pub fn new(title: impl Into<String>) -> Self {
        NewNote {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn in_folder(mut self, parent: impl Into<FolderId>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_content(mut self, content: Document) -> Self {
        self.content = content;
        self
    }

    pub fn wiki(mut self) -> Self {
        self.is_wiki = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn new_notes_get_distinct_ids() {
        let a = Note::new("Same", Document::new());
        let b = Note::new("Same", Document::new());
        assert_ne!(a.id, b.id);
        assert!(!a.id.contains("Same"));
    }

    #[test]
    fn daily_titles_are_detected() {
        assert!(Note::new("2024-02-29", Document::new()).is_daily);
        assert!(!Note::new("2023-02-29", Document::new()).is_daily);
        assert!(!Note::new("Meeting", Document::new()).is_daily);

        let mut note = Note::new("Meeting", Document::new());
        note.set_title("2024-01-01");
        assert!(note.is_daily);
    }

    #[test]
    fn touch_is_monotonic() {
        let mut note = Note::new("T", Document::new());
        let before = note.updated_at;
        note.touch(before - Duration::seconds(10));
        assert_eq!(note.updated_at, before);
        note.touch(before + Duration::seconds(10));
        assert!(note.updated_at > before);
    }
}
