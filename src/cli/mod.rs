//! CLI module for the notegraph binary
//!
//! Argument parsing lives in [`args`], command execution in [`app`].
mod app;
mod args;

pub use app::*;
pub use args::*;
