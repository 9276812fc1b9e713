//! Filesystem change feed.
//!
//! [`NotifyWatchRegistry`] owns a `notify` watcher whose callback forwards raw
//! events into a tokio channel. [`watch_loop`] classifies them, applies
//! removals and directory creations to the index immediately, and hands
//! everything else to the debouncer.

use std::path::Path;
use std::sync::Arc;

use notify::event::{AccessKind, AccessMode, CreateKind, ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{ChangeEvent, ChangeOutcome, ContentIndex, Debouncer, WatchRegistry};
use crate::error::Result;

/// Raw notification stream produced by the OS watcher
pub type EventReceiver = mpsc::UnboundedReceiver<notify::Result<Event>>;

/// Per-directory OS watches
pub struct NotifyWatchRegistry {
    watcher: RecommendedWatcher,
}

impl NotifyWatchRegistry {
    /// Create the OS watcher and the channel its callback feeds
    pub fn new() -> Result<(Self, EventReceiver)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = RecommendedWatcher::new(
            move |result| {
                if tx.send(result).is_err() {
                    error!("Unable to forward watcher event; receiver dropped");
                }
            },
            Config::default(),
        )?;
        Ok((Self { watcher }, rx))
    }
}

impl WatchRegistry for NotifyWatchRegistry {
    fn watch(&mut self, dir: &Path) -> Result<()> {
        self.watcher.watch(dir, RecursiveMode::NonRecursive)?;
        Ok(())
    }

    fn unwatch(&mut self, dir: &Path) -> Result<()> {
        self.watcher.unwatch(dir)?;
        Ok(())
    }
}

/// Classify one raw notification.
///
/// Read-only access notifications are dropped; they are produced by sessions
/// reading the files being served.
pub fn classify(event: &Event) -> Vec<ChangeEvent> {
    match event.kind {
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => event
            .paths
            .iter()
            .cloned()
            .map(ChangeEvent::Remove)
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            vec![
                ChangeEvent::Remove(event.paths[0].clone()),
                created(&event.paths[1]),
            ]
        }
        EventKind::Create(CreateKind::Folder) => event
            .paths
            .iter()
            .cloned()
            .map(ChangeEvent::CreateDir)
            .collect(),
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            event.paths.iter().map(|path| created(path)).collect()
        }
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => event
            .paths
            .iter()
            .cloned()
            .map(ChangeEvent::Other)
            .collect(),
        EventKind::Access(_) => Vec::new(),
        _ => event
            .paths
            .iter()
            .cloned()
            .map(ChangeEvent::Other)
            .collect(),
    }
}

fn created(path: &Path) -> ChangeEvent {
    if path.is_dir() {
        ChangeEvent::CreateDir(path.to_path_buf())
    } else {
        ChangeEvent::Other(path.to_path_buf())
    }
}

/// Consume raw notifications until shutdown or until the watcher goes away
pub async fn watch_loop(
    index: Arc<ContentIndex>,
    debouncer: Debouncer,
    mut events: EventReceiver,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let event = match event {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Watcher reported an error; scheduling rebuild");
                debouncer.trigger();
                continue;
            }
        };

        for change in classify(&event) {
            match index.apply_change_event(change) {
                Ok(ChangeOutcome::NeedsRebuild) => debouncer.trigger(),
                Ok(outcome) => debug!(?outcome, "Change applied"),
                Err(e) => error!(error = %e, "Failed to apply change event"),
            }
        }
    }
    debug!("Watch loop stopped");
}
