//! Linked-note engine library
//!
//! This library keeps a graph of markdown notes in memory: structured
//! documents with stable block ids, a backlink index over note links, tags
//! and block references, a folder tree, and a synchronizer that mirrors all
//! of it to a directory on disk.

mod backlinks;
mod cli;
mod config;
mod document;
mod errors;
mod fs;
mod graph;
mod note;
mod note_file;
mod scanner;
mod sync;
mod tree;
mod types;
mod watcher;

// Re-export key components
pub use backlinks::*;
pub use cli::*;
pub use config::*;
pub use document::*;
pub use errors::*;
pub use fs::*;
pub use graph::*;
pub use note::*;
pub use note_file::*;
pub use scanner::*;
pub use sync::*;
pub use tree::*;
pub use types::*;
pub use watcher::*;
