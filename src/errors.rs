//! Error types for the notegraph engine.
//!
//! Malformed note text is never an error (the document parser falls back to
//! plain paragraphs) and a missing link target is never an error either (it is
//! an unresolved reference). What remains are I/O failures, lookups of things
//! that do not exist, and mutations that would break the tree.

use std::{io, path::PathBuf};

use thiserror::Error;

/// The main error type for the notegraph engine.
#[derive(Error, Debug)]
pub enum NoteGraphError {
    /// Errors related to file I/O operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Errors related to serialization/deserialization of the configuration.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Note was not found when performing an operation.
    #[error("Note not found: {id}")]
    NoteNotFound { id: String },

    /// Folder was not found in the note tree.
    #[error("Folder not found: {id}")]
    FolderNotFound { id: String },

    /// Block was not found inside a document.
    #[error("Block not found: {id}")]
    BlockNotFound { id: String },

    /// A block with the same id already exists in the document.
    #[error("Duplicate block id: {id}")]
    DuplicateBlockId { id: String },

    /// Another note already owns this file path.
    #[error("Path already belongs to another note: {path}")]
    PathInUse { path: PathBuf },

    /// A tree or document move that would create a cycle or has no valid target.
    #[error("Invalid move: {message}")]
    InvalidMove { message: String },

    /// Writing a note to disk failed. The note stays dirty.
    #[error("Failed to persist {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Removing a file failed. The store was left untouched.
    #[error("Failed to delete {path}: {source}")]
    DeleteFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Errors related to configuration.
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// The filesystem watcher could not be created or attached.
    #[error("Watch error: {message}")]
    WatchError { message: String },

    /// A newer directory load started before this one finished.
    #[error("Directory load superseded: {path}")]
    LoadCancelled { path: PathBuf },
}
