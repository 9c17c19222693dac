use std::path::PathBuf;

use clap::Parser;

use crate::Commands;

/// Main CLI application arguments and command structure
#[derive(Parser, Debug)]
#[clap(
    version,
    about = "Linked notes: backlinks, tags and block references over a directory of markdown files"
)]
pub struct Cli {
    /// Path to the configuration file
    #[clap(short = 'c', long, value_parser)]
    pub config: Option<PathBuf>,

    /// Path to the notes directory (overrides the configuration)
    #[clap(long, value_parser)]
    pub notes_dir: Option<PathBuf>,

    /// Verbose output mode
    #[clap(short, long)]
    pub verbose: bool,

    /// Subcommands for the notegraph application
    #[clap(subcommand)]
    pub command: Commands,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_flags_and_subcommands() {
        let cli = Cli::parse_from([
            "notegraph",
            "--notes-dir",
            "/tmp/notes",
            "-v",
            "backlinks",
            "Project X",
            "--json",
        ]);
        assert_eq!(cli.notes_dir, Some(PathBuf::from("/tmp/notes")));
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Commands::Backlinks { ref target, json: true } if target == "Project X"
        ));

        let cli = Cli::parse_from(["notegraph", "search", "rust", "-n", "3"]);
        assert!(matches!(cli.command, Commands::Search { limit: 3, .. }));
    }
}
