//! Feeds filesystem notifications into [`Synchronizer::reconcile_external_change`].
use std::{
    path::Path,
    sync::{mpsc as std_mpsc, Arc},
    time::Duration,
};

use log::{debug, error, info, warn};
use notify::{
    event::{ModifyKind, RenameMode},
    Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{FileSystem, FsEvent, NoteGraphError, Result, Synchronizer};

/// Keeps the watcher alive. Dropping it stops watching.
pub struct WatchHandle {
    watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl WatchHandle {
    /// Stops watching and waits for queued events to be applied.
    pub async fn stop(self) {
        drop(self.watcher);
        if let Err(e) = self.task.await {
            error!("Watch task failed: {}", e);
        }
    }
}

/// Translates one notify event into the changes it describes.
pub fn convert_event(event: Event) -> Vec<FsEvent> {
    let Event { kind, paths, .. } = event;
    match kind {
        EventKind::Create(_) => paths.into_iter().map(FsEvent::Created).collect(),
        EventKind::Remove(_) => paths.into_iter().map(FsEvent::Removed).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() == 2 => {
            let mut paths = paths.into_iter();
            match (paths.next(), paths.next()) {
                (Some(from), Some(to)) => vec![FsEvent::Renamed { from, to }],
                _ => Vec::new(),
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            paths.into_iter().map(FsEvent::Removed).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            paths.into_iter().map(FsEvent::Created).collect()
        }
        // the reconciler checks whether each path still exists
        EventKind::Modify(_) => paths.into_iter().map(FsEvent::Modified).collect(),
        _ => Vec::new(),
    }
}

/// Watches `root` recursively and reconciles every change into the graph.
pub fn watch<F: FileSystem>(sync: Arc<Synchronizer<F>>, root: &Path) -> Result<WatchHandle> {
    let (std_tx, std_rx) = std_mpsc::channel();
    let (tx, mut rx) = mpsc::channel(100);

    let mut watcher: RecommendedWatcher = Watcher::new(
        std_tx,
        notify::Config::default().with_poll_interval(Duration::from_secs(2)),
    )
    .map_err(|e| NoteGraphError::WatchError {
        message: format!("Failed to create file watcher: {}", e),
    })?;
    watcher
        .watch(root, RecursiveMode::Recursive)
        .map_err(|e| NoteGraphError::WatchError {
            message: format!("Failed to watch {}: {}", root.display(), e),
        })?;

    // notify delivers on a std channel; forward without blocking the runtime
    tokio::task::spawn_blocking(move || {
        while let Ok(event) = std_rx.recv() {
            if tx.blocking_send(event).is_err() {
                break;
            }
        }
        debug!("File system event bridge stopped");
    });

    let task = tokio::spawn(async move {
        debug!("File system watcher event handler started");
        while let Some(event) = rx.recv().await {
            match event {
                Ok(event) => {
                    debug!("File system event: {:?}", event.kind);
                    for change in convert_event(event) {
                        if let Err(e) = sync.reconcile_external_change(change).await {
                            warn!("Failed to apply external change: {}", e);
                        }
                    }
                }
                Err(e) => error!("File system watcher error: {}", e),
            }
        }
        debug!("File system watcher event handler stopped");
    });

    info!("Watching {} for changes", root.display());
    Ok(WatchHandle {
        watcher,
        task,
    })
}
