//! Command execution for the notegraph binary.
use std::{fmt::Write as _, sync::Arc};

use log::{debug, info, warn};
use tokio::sync::broadcast::error::RecvError;

use crate::{
    watch, Commands, Config, FileSystem, GraphEvent, LoadReport, NoteGraph, NoteTreeItem,
    PersistQueue, Reference, Result, Synchronizer, TargetKind,
};

/// CLI Application handler - loads the notes directory and answers commands
pub struct App<F: FileSystem> {
    /// Synchronizer owning the shared graph
    sync: Arc<Synchronizer<F>>,

    /// Application configuration
    config: Config,

    /// Whether to display verbose output
    verbose: bool,
}

impl<F: FileSystem> App<F> {
    pub fn new(sync: Arc<Synchronizer<F>>, config: Config, verbose: bool) -> Self {
        Self {
            sync,
            config,
            verbose,
        }
    }

    /// Loads the configured notes directory.
    pub async fn load(&self) -> Result<LoadReport> {
        let report = self.sync.load_directory(&self.config.notes_dir).await?;
        if self.verbose {
            for (path, reason) in &report.errors {
                println!("Skipped {}: {}", path.display(), reason);
            }
        }
        Ok(report)
    }

    /// Run the CLI application with the given command
    pub async fn run(&self, command: Commands) -> Result<()> {
        let report = self.load().await?;
        debug!("Running {:?} over {} notes", command, report.loaded);

        if matches!(command, Commands::Watch) {
            return self.watch().await;
        }
        print!("{}", self.render(command).await?);
        Ok(())
    }

    /// Output of a read-only command against the loaded graph.
    pub async fn render(&self, command: Commands) -> Result<String> {
        let graph = self.sync.graph();
        let graph = graph.lock().await;
        let output = match command {
            Commands::Tree => render_tree(&graph),
            Commands::Backlinks { target, json } => {
                let references = graph.backlinks_for(&target);
                if json {
                    format!("{}\n", serde_json::to_string_pretty(&references)?)
                } else if references.is_empty() {
                    format!("No backlinks found for '{}'.\n", target)
                } else {
                    render_references(&graph, &references)
                }
            }
            Commands::Tags => {
                let tags = graph.tags();
                if tags.is_empty() {
                    "No tags found.\n".to_string()
                } else {
                    let width = tags.keys().map(|t| t.chars().count()).max().unwrap_or(0) + 1;
                    let mut out = String::new();
                    for (tag, count) in tags {
                        let _ = writeln!(out, "{:<width$}  {}", format!("#{tag}"), count, width = width);
                    }
                    out
                }
            }
            Commands::Unresolved => {
                let references = graph.unresolved();
                if references.is_empty() {
                    "Every reference resolves.\n".to_string()
                } else {
                    render_references(&graph, &references)
                }
            }
            Commands::Search { query, limit } => {
                let hits = graph.search(&query, limit);
                if hits.is_empty() {
                    "No notes found matching the query.\n".to_string()
                } else {
                    let mut out = String::new();
                    for hit in &hits {
                        let _ = writeln!(out, "{:>5}  {}  ({})", hit.score, hit.title, hit.note_id);
                    }
                    let _ = writeln!(
                        out,
                        "\nFound {} note{}",
                        hits.len(),
                        if hits.len() == 1 { "" } else { "s" }
                    );
                    out
                }
            }
            Commands::Tasks { all } => {
                let tasks = graph.tasks(all);
                if tasks.is_empty() {
                    "No tasks found.\n".to_string()
                } else {
                    let mut out = String::new();
                    for task in tasks {
                        let title = graph
                            .note(&task.note_id)
                            .map(|note| note.title.as_str())
                            .unwrap_or_default();
                        let mark = if task.checked { 'x' } else { ' ' };
                        let _ = writeln!(out, "- [{}] {}  ({})", mark, task.text, title);
                    }
                    out
                }
            }
            Commands::Watch => String::new(),
        };
        Ok(output)
    }

    async fn watch(&self) -> Result<()> {
        let graph = self.sync.graph();
        let mut events = graph.lock().await.subscribe();
        let queue = PersistQueue::start(Arc::clone(&self.sync), self.config.persist_debounce());
        let handle = watch(Arc::clone(&self.sync), &self.config.notes_dir)?;
        println!(
            "Watching {} (Ctrl-C to stop)",
            self.config.notes_dir.display()
        );

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = events.recv() => match event {
                    Ok(event) => {
                        if let Some(id) = needs_persist(&event) {
                            queue.schedule(id);
                        }
                        if self.verbose {
                            println!("{}", serde_json::to_string(&event)?);
                        } else {
                            info!("{:?}", event);
                        }
                    }
                    Err(RecvError::Lagged(missed)) => warn!("Missed {} graph events", missed),
                    Err(RecvError::Closed) => break,
                },
            }
        }

        info!("Stopping watcher");
        handle.stop().await;
        queue.shutdown().await
    }
}

/// The note an event leaves with unsaved edits, if any. The queue skips
/// notes that turn out to be clean by the time it writes.
fn needs_persist(event: &GraphEvent) -> Option<&str> {
    match event {
        GraphEvent::NoteCreated { id } | GraphEvent::NoteUpdated { id } => Some(id.as_str()),
        _ => None,
    }
}

fn render_tree(graph: &NoteGraph) -> String {
    fn walk(item: &NoteTreeItem, depth: usize, out: &mut String) {
        let indent = "  ".repeat(depth);
        if item.is_directory {
            let _ = writeln!(out, "{indent}{}/", item.title);
        } else {
            let _ = writeln!(out, "{indent}{}", item.title);
        }
        for child in &item.children {
            walk(child, depth + 1, out);
        }
    }

    let mut out = String::new();
    for item in &graph.tree().items {
        walk(item, 0, &mut out);
    }
    if out.is_empty() {
        out.push_str("No notes found.\n");
    }
    out
}

fn render_references(graph: &NoteGraph, references: &[Reference]) -> String {
    let mut out = String::new();
    for reference in references {
        let source = graph
            .note(&reference.from_note_id)
            .map(|note| note.title.as_str())
            .unwrap_or(reference.from_note_id.as_str());
        let target = match reference.target_kind {
            TargetKind::Note if reference.is_title_link() => format!("[[{}]]", reference.target_key),
            TargetKind::Note => format!("[[@{}]]", reference.target_key),
            TargetKind::Tag => format!("#{}", reference.target_key),
            TargetKind::Block => format!("(({}))", reference.target_key),
        };
        let status = if reference.resolved { "" } else { "  (unresolved)" };
        let _ = writeln!(
            out,
            "{} ^{}  -> {}{}",
            source, reference.from_block_id, target, status
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tokio::sync::Mutex;

    use super::*;
    use crate::MemoryFs;

    async fn app(files: &[(&str, &str)]) -> App<MemoryFs> {
        let fs = MemoryFs::new();
        for (path, text) in files {
            fs.insert_file(PathBuf::from("/kb").join(path), *text);
        }
        let config = Config {
            notes_dir: PathBuf::from("/kb"),
            ..Config::default()
        };
        let graph = Arc::new(Mutex::new(NoteGraph::new(Some(config.notes_dir.clone()))));
        let sync = Arc::new(Synchronizer::new(Arc::new(fs), graph, config.clone()).unwrap());
        let app = App::new(sync, config, false);
        app.load().await.unwrap();
        app
    }

    #[tokio::test]
    async fn tree_lists_folders_before_notes() {
        let app = app(&[("zeta.md", ""), ("work/alpha.md", "")]).await;
        let out = app.render(Commands::Tree).await.unwrap();
        assert_eq!(out, "work/\n  alpha\nzeta\n");
    }

    #[tokio::test]
    async fn backlinks_in_text_and_json() {
        let app = app(&[
            ("Target.md", ""),
            ("Source.md", "Links to [[Target]]. ^s1\n"),
        ])
        .await;

        let text = app
            .render(Commands::Backlinks {
                target: "target".to_string(),
                json: false,
            })
            .await
            .unwrap();
        assert_eq!(text, "Source ^s1  -> [[Target]]\n");

        let json = app
            .render(Commands::Backlinks {
                target: "Target".to_string(),
                json: true,
            })
            .await
            .unwrap();
        let parsed: Vec<Reference> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.len(), 1);
        assert!(parsed[0].resolved);
    }

    #[tokio::test]
    async fn tags_unresolved_and_tasks() {
        let app = app(&[(
            "Todo.md",
            "- [ ] call [[Nobody]] #phone ^t1\n- [x] done #phone ^t2\n",
        )])
        .await;

        let tags = app.render(Commands::Tags).await.unwrap();
        assert_eq!(tags, "#phone  2\n");

        let unresolved = app.render(Commands::Unresolved).await.unwrap();
        assert_eq!(unresolved, "Todo ^t1  -> [[Nobody]]  (unresolved)\n");

        let open = app.render(Commands::Tasks { all: false }).await.unwrap();
        assert_eq!(open.lines().count(), 1);
        assert!(open.starts_with("- [ ] call"));
        let all = app.render(Commands::Tasks { all: true }).await.unwrap();
        assert_eq!(all.lines().count(), 2);
    }

    #[test]
    fn edits_are_queued_for_saving() {
        let updated = GraphEvent::NoteUpdated {
            id: "n1".to_string(),
        };
        assert_eq!(needs_persist(&updated), Some("n1"));
        let persisted = GraphEvent::Persisted {
            id: "n1".to_string(),
        };
        assert_eq!(needs_persist(&persisted), None);
        assert_eq!(
            needs_persist(&GraphEvent::CurrentNoteChanged { id: None }),
            None
        );
    }

    #[tokio::test]
    async fn empty_results_say_so() {
        let app = app(&[]).await;
        assert_eq!(
            app.render(Commands::Search {
                query: "anything".to_string(),
                limit: 10
            })
            .await
            .unwrap(),
            "No notes found matching the query.\n"
        );
        assert_eq!(app.render(Commands::Tree).await.unwrap(), "No notes found.\n");
    }
}
