//! Shared aliases and the CLI subcommand set.
use clap::Subcommand;

use crate::NoteGraphError;

/// A specialized Result type for notegraph operations.
pub type Result<T> = std::result::Result<T, NoteGraphError>;

/// Identifier of a note. Stable for the life of the note and never derived
/// from its title or path.
pub type NoteId = String;

/// Identifier of a folder in the note tree (the folder's path).
pub type FolderId = String;

/// Available subcommands for the notegraph binary
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Print the folder/note tree
    Tree,

    /// List backlinks pointing at a note id, note title, tag or block id
    Backlinks {
        /// Target key to look up
        target: String,

        /// Format output as JSON
        #[clap(short, long)]
        json: bool,
    },

    /// List every tag with its usage count
    Tags,

    /// List references whose target does not exist
    Unresolved,

    /// Fuzzy search note titles and content
    Search {
        /// Search query text
        query: String,

        /// Limit the number of search results
        #[clap(short = 'n', long, default_value_t = 10)]
        limit: usize,
    },

    /// List checklist items across all notes
    Tasks {
        /// Include completed items
        #[clap(short, long)]
        all: bool,
    },

    /// Load the directory and keep the index in sync with external changes
    Watch,
}
