//! Debounced OS watcher feeding change jobs to the dispatcher

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::event::EventKind;
use notify::{Event, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{DebounceEventResult, Debouncer, RecommendedCache, new_debouncer};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatch::{Dispatcher, SourceSpec, WatchAction};
use crate::error::{Error, Result};
use crate::filter::Predicate;

/// Watches one source root until dropped.
pub struct SourceWatcher {
    _debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
    task: JoinHandle<()>,
}

impl SourceWatcher {
    /// Start watching `spec.root` recursively and forward batches of actions
    /// to `dispatcher.notify`. Must be called inside a tokio runtime.
    ///
    /// # Errors
    /// Returns `Watch` if the OS watcher cannot be created.
    pub fn spawn(dispatcher: Dispatcher, spec: &SourceSpec, debounce: Duration) -> Result<Self> {
        let mut roots = vec![spec.root.clone()];
        if let Ok(canonical) = spec.root.canonicalize() {
            if canonical != spec.root {
                roots.push(canonical);
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let predicate = Arc::clone(&spec.predicate);
        let handler_roots = roots.clone();
        let mut debouncer = new_debouncer(debounce, None, move |result: DebounceEventResult| {
            let actions = match result {
                Ok(events) => {
                    let events: Vec<&Event> = events.iter().map(|e| &e.event).collect();
                    translate(&events, &handler_roots, predicate.as_ref())
                }
                Err(errors) => {
                    for error in errors {
                        warn!(%error, "watcher error, rescanning");
                    }
                    vec![WatchAction::Scan]
                }
            };
            if !actions.is_empty() && tx.send(actions).is_err() {
                debug!("watch forwarder stopped, dropping batch");
            }
        })?;
        debouncer.watch(&spec.root, RecursiveMode::Recursive)?;

        let source = spec.name.clone();
        info!(source = %source, root = %spec.root.display(), "watching");
        let task = tokio::spawn(async move {
            while let Some(actions) = rx.recv().await {
                debug!(source = %source, count = actions.len(), "watch batch");
                match dispatcher.notify(&source, actions) {
                    Ok(_) => {}
                    Err(Error::Shutdown) => break,
                    Err(e) => {
                        warn!(source = %source, error = %e, "dropping watch batch");
                    }
                }
            }
        });

        Ok(Self {
            _debouncer: debouncer,
            task,
        })
    }
}

impl Drop for SourceWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Turn raw events into root-relative actions, dropping excluded paths.
///
/// A rescan flag on any event collapses the batch into a single
/// [`WatchAction::Scan`]. An event on the root itself diffs the root.
#[must_use]
pub fn translate(events: &[&Event], roots: &[PathBuf], predicate: &dyn Predicate) -> Vec<WatchAction> {
    let mut actions = Vec::new();
    for event in events {
        if event.need_rescan() {
            return vec![WatchAction::Scan];
        }
        let remove = match event.kind {
            EventKind::Access(_) => continue,
            EventKind::Remove(_) => true,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any | EventKind::Other => {
                false
            }
        };
        for path in &event.paths {
            let Some(rel) = relative(path, roots) else {
                debug!(path = %path.display(), "event outside root");
                continue;
            };
            if predicate.excludes(rel, path.is_dir()) {
                continue;
            }
            let rel = rel.to_path_buf();
            let action = if remove {
                WatchAction::Remove(rel)
            } else {
                WatchAction::Upsert(rel)
            };
            if !actions.contains(&action) {
                actions.push(action);
            }
        }
    }
    actions
}

fn relative<'p>(path: &'p Path, roots: &[PathBuf]) -> Option<&'p Path> {
    roots.iter().find_map(|root| path.strip_prefix(root).ok())
}

#[cfg(test)]
mod tests {
    use notify::event::{AccessKind, CreateKind, Flag, ModifyKind, RemoveKind};

    use super::*;
    use crate::filter::{AcceptAll, GlobPredicate};

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn test_translate_kinds() {
        let roots = vec![PathBuf::from("/src")];
        let create = event(EventKind::Create(CreateKind::File), "/src/a");
        let modify = event(EventKind::Modify(ModifyKind::Any), "/src/a");
        let remove = event(EventKind::Remove(RemoveKind::Folder), "/src/d");
        let access = event(EventKind::Access(AccessKind::Any), "/src/b");
        let outside = event(EventKind::Create(CreateKind::File), "/elsewhere/x");

        let actions = translate(&[&create, &modify, &remove, &access, &outside], &roots, &AcceptAll);
        assert_eq!(
            actions,
            vec![
                WatchAction::Upsert(PathBuf::from("a")),
                WatchAction::Remove(PathBuf::from("d")),
            ]
        );
    }

    #[test]
    fn test_translate_root_event_diffs_root() {
        let roots = vec![PathBuf::from("/src")];
        let root = event(EventKind::Modify(ModifyKind::Any), "/src");
        assert_eq!(
            translate(&[&root], &roots, &AcceptAll),
            vec![WatchAction::Upsert(PathBuf::new())]
        );
    }

    #[test]
    fn test_translate_rescan_flag() {
        let roots = vec![PathBuf::from("/src")];
        let create = event(EventKind::Create(CreateKind::File), "/src/a");
        let rescan = Event::new(EventKind::Other).set_flag(Flag::Rescan);
        assert_eq!(
            translate(&[&create, &rescan], &roots, &AcceptAll),
            vec![WatchAction::Scan]
        );
    }

    #[test]
    fn test_translate_drops_state_dir() {
        let dir = tempfile::tempdir().unwrap();
        let predicate = GlobPredicate::new(dir.path(), &[]).unwrap();
        let roots = vec![dir.path().to_path_buf()];
        let state = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(dir.path().join(".vsync/data.mdb"));
        let file = Event::new(EventKind::Create(CreateKind::File)).add_path(dir.path().join("f"));
        assert_eq!(
            translate(&[&state, &file], &roots, &predicate),
            vec![WatchAction::Upsert(PathBuf::from("f"))]
        );
    }
}
