//! End-to-end runs through the dispatcher against a real directory

use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use vsync_core::{
    ChangeAction, DispatchEvent, Dispatcher, DispatcherOptions, EntryKind, SourceSpec, Store,
    VsyncConfig, WatchAction,
};

const MAP_SIZE: usize = 16 * 1024 * 1024;

async fn open(
    state: &Path,
    root: &Path,
    config: &VsyncConfig,
) -> (Dispatcher, mpsc::UnboundedReceiver<DispatchEvent>) {
    let store = Store::open_with_map_size(state, MAP_SIZE).unwrap();
    let (dispatcher, events) = Dispatcher::open(
        store,
        DispatcherOptions {
            device_id: Some("test".into()),
        },
    )
    .unwrap();
    let spec = SourceSpec::from_config("src", root, config).unwrap();
    dispatcher.add_source(spec).await.unwrap();
    (dispatcher, events)
}

fn changes(events: &mut mpsc::UnboundedReceiver<DispatchEvent>) -> Vec<(ChangeAction, PathBuf)> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let DispatchEvent::Commit(commit) = event {
            out.extend(commit.changes.into_iter().map(|c| (c.action, c.path)));
        }
    }
    out
}

#[tokio::test]
async fn test_state_survives_restart() {
    let root = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(root.path().join("a")).unwrap();
    std::fs::write(root.path().join("a/f"), b"hello").unwrap();
    let config = VsyncConfig::default();

    let id = {
        let (dispatcher, mut events) = open(state.path(), root.path(), &config).await;
        dispatcher.scan("src").unwrap();
        dispatcher.wait_idle().await;
        assert_eq!(changes(&mut events).len(), 2);
        assert_eq!(dispatcher.clock().get("test"), 1);
        let id = dispatcher.tree("src").unwrap().get(Path::new("a")).unwrap().id;
        dispatcher.shutdown().await;
        id
    };

    let (dispatcher, mut events) = open(state.path(), root.path(), &config).await;
    assert_eq!(dispatcher.clock().get("test"), 1);

    // Unchanged tree: the delta pass commits nothing
    dispatcher.scan("src").unwrap();
    dispatcher.wait_idle().await;
    assert!(changes(&mut events).is_empty());
    assert_eq!(dispatcher.clock().get("test"), 2);

    std::fs::remove_file(root.path().join("a/f")).unwrap();
    std::fs::write(root.path().join("a/g"), b"world").unwrap();
    dispatcher.scan("src").unwrap();
    dispatcher.wait_idle().await;

    let seen = changes(&mut events);
    assert!(seen.contains(&(ChangeAction::Remove, PathBuf::from("a/f"))));
    assert!(seen.contains(&(ChangeAction::Upsert, PathBuf::from("a/g"))));

    let tree = dispatcher.tree("src").unwrap();
    assert_eq!(tree.get(Path::new("a")).unwrap().id, id);
    assert_eq!(tree.get(Path::new("a/g")).unwrap().modification.get("test"), 3);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_excluded_paths_never_stored() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(root.path().join("target/debug")).unwrap();
    std::fs::write(root.path().join("target/debug/bin"), b"x").unwrap();
    std::fs::write(root.path().join("keep.rs"), b"x").unwrap();
    std::fs::write(root.path().join("big.bin"), vec![0u8; 64]).unwrap();

    let config = VsyncConfig::parse("exclude = [\"target/\"]\nmax_file_size = 32\n").unwrap();
    // State lives inside the root, as the CLI lays it out
    let state = config.state_path(root.path());
    let (dispatcher, _events) = open(&state, root.path(), &config).await;

    dispatcher.scan("src").unwrap();
    dispatcher.wait_idle().await;

    let tree = dispatcher.tree("src").unwrap();
    let stored: Vec<PathBuf> = tree
        .get_children(Path::new(""))
        .unwrap()
        .into_iter()
        .map(|(path, _)| path)
        .collect();
    assert_eq!(stored, vec![PathBuf::from("keep.rs")]);
    dispatcher.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_symlink_loop_terminates() {
    let root = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(root.path().join("a")).unwrap();
    std::os::unix::fs::symlink(root.path().join("a"), root.path().join("a/link")).unwrap();

    let config = VsyncConfig::parse("follow_links = true\n").unwrap();
    let (dispatcher, _events) = open(state.path(), root.path(), &config).await;
    dispatcher.scan("src").unwrap();
    dispatcher.wait_idle().await;

    let tree = dispatcher.tree("src").unwrap();
    assert_eq!(tree.len().unwrap(), 2);
    match tree.get(Path::new("a/link")).unwrap().kind {
        EntryKind::Link { target, weak } => {
            assert!(weak);
            assert_eq!(target, "a");
        }
        other => panic!("expected weak link, got {other:?}"),
    }
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_watch_actions_replay_through_commit_path() {
    let root = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(root.path().join("d/e")).unwrap();
    std::fs::write(root.path().join("d/e/f"), b"x").unwrap();

    let (dispatcher, mut events) = open(state.path(), root.path(), &VsyncConfig::default()).await;
    dispatcher.scan("src").unwrap();
    dispatcher.wait_idle().await;
    changes(&mut events);

    std::fs::remove_dir_all(root.path().join("d")).unwrap();
    std::fs::create_dir_all(root.path().join("n")).unwrap();
    std::fs::write(root.path().join("n/x"), b"y").unwrap();
    dispatcher
        .notify(
            "src",
            vec![
                WatchAction::Remove(PathBuf::from("d")),
                WatchAction::Upsert(PathBuf::from("n")),
            ],
        )
        .unwrap();
    dispatcher.wait_idle().await;

    let seen = changes(&mut events);
    let removed: Vec<&PathBuf> = seen
        .iter()
        .filter(|(action, _)| *action == ChangeAction::Remove)
        .map(|(_, path)| path)
        .collect();
    assert_eq!(removed.len(), 3);
    assert!(seen.contains(&(ChangeAction::Upsert, PathBuf::from("n"))));
    assert!(seen.contains(&(ChangeAction::Upsert, PathBuf::from("n/x"))));

    let tree = dispatcher.tree("src").unwrap();
    assert_eq!(tree.len().unwrap(), 2);
    assert_eq!(dispatcher.clock().get("test"), 2);
    dispatcher.shutdown().await;
}
