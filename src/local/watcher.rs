use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use notify_debouncer_mini::{DebouncedEventKind, new_debouncer};
use std::os::unix::fs::MetadataExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::util::path as sync_path;

use super::{FsLocalStore, LocalId, LocalKind, LocalObserver};

/// Start watching the store's root and translate filesystem events into
/// [`LocalObserver`] callbacks.
///
/// Raw events only carry paths, so each debounced batch is compared against
/// the store's id index: an unknown inode is a creation, a known inode at a
/// new path is a rename or move, a known path that vanished is a deletion.
/// Events are debounced to coalesce rapid-fire inotify bursts (e.g., editor
/// save = truncate + write).
///
/// The watcher runs until the returned `WatcherHandle` is dropped.
pub fn start_local_watcher(
    store: Arc<FsLocalStore>,
    observer: Arc<dyn LocalObserver>,
    debounce_ms: u64,
) -> Result<WatcherHandle> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<PathBuf>>();

    let mut debouncer = new_debouncer(
        Duration::from_millis(debounce_ms),
        move |result: Result<Vec<notify_debouncer_mini::DebouncedEvent>, notify::Error>| {
            match result {
                Ok(events) => {
                    let paths: Vec<PathBuf> = events
                        .into_iter()
                        .filter(|e| {
                            e.kind == DebouncedEventKind::Any
                                || e.kind == DebouncedEventKind::AnyContinuous
                        })
                        .map(|e| e.path)
                        .collect();
                    if !paths.is_empty() {
                        let _ = tx.send(paths);
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "local watcher error");
                }
            }
        },
    )
    .context("Failed to create file watcher")?;

    let root = store.root().to_path_buf();
    debouncer
        .watcher()
        .watch(&root, notify::RecursiveMode::Recursive)
        .with_context(|| format!("Failed to watch {}", root.display()))?;
    tracing::info!(root = %root.display(), "watching for local changes");

    let task = tokio::spawn(async move {
        while let Some(paths) = rx.recv().await {
            apply_batch(&store, observer.as_ref(), paths).await;
        }
    });

    Ok(WatcherHandle {
        _debouncer: debouncer,
        task,
    })
}

/// Handle that keeps the watcher alive. Drop to stop watching.
pub struct WatcherHandle {
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    task: JoinHandle<()>,
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum Observed {
    Present {
        rel: String,
        id: LocalId,
        kind: LocalKind,
        size_hint: u64,
    },
    Missing {
        rel: String,
    },
}

/// Classify one debounced batch and fire observer callbacks.
///
/// Present paths go first, shallowest first, so a new folder is indexed
/// before its children and a moved entry is rebased before its old path is
/// checked for deletion.
pub(crate) async fn apply_batch(
    store: &FsLocalStore,
    observer: &dyn LocalObserver,
    mut paths: Vec<PathBuf>,
) {
    paths.sort();
    paths.dedup();

    let mut present = Vec::new();
    let mut missing = Vec::new();
    for path in paths {
        let Ok(rel) = sync_path::relative_path(store.root(), &path) else {
            continue;
        };
        if rel.is_empty() || rel.split('/').any(|seg| store.is_hidden(seg)) {
            continue;
        }
        match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) if meta.is_symlink() => {}
            Ok(meta) => present.push(Observed::Present {
                rel,
                id: LocalId(meta.ino() as i64),
                kind: if meta.is_dir() {
                    LocalKind::Folder
                } else {
                    LocalKind::File
                },
                size_hint: meta.len(),
            }),
            Err(_) => missing.push(Observed::Missing { rel }),
        }
    }

    let depth = |o: &Observed| match o {
        Observed::Present { rel, .. } | Observed::Missing { rel } => rel.matches('/').count(),
    };
    present.sort_by_key(depth);
    missing.sort_by_key(depth);

    for observed in present.into_iter().chain(missing) {
        match observed {
            Observed::Present {
                rel,
                id,
                kind,
                size_hint,
            } => on_present(store, observer, &rel, id, kind, size_hint).await,
            Observed::Missing { rel } => on_missing(store, observer, &rel).await,
        }
    }
}

fn split_rel(rel: &str) -> (&str, &str) {
    rel.rsplit_once('/').unwrap_or(("", rel))
}

async fn on_present(
    store: &FsLocalStore,
    observer: &dyn LocalObserver,
    rel: &str,
    id: LocalId,
    kind: LocalKind,
    size_hint: u64,
) {
    let (parent_rel, name) = split_rel(rel);
    let Some((parent, _)) = store.lookup_path(parent_rel) else {
        tracing::debug!(path = rel, "parent not indexed yet, skipping event");
        return;
    };

    match store.lookup_id(id) {
        None => {
            store.record(id, rel, kind);
            match kind {
                LocalKind::Folder => {
                    observer.on_folder_created(id, parent, name).await;
                    announce_subtree(store, observer, id).await;
                }
                LocalKind::File => observer.on_file_added(id, parent, name).await,
            }
        }
        Some(old_rel) if old_rel == rel => {
            if kind == LocalKind::File {
                tracing::trace!(path = rel, size = size_hint, "file content changed");
                observer.on_file_updated(id, parent, name).await;
            }
        }
        Some(old_rel) => {
            store.relocate(&old_rel, rel);
            let (old_parent_rel, _) = split_rel(&old_rel);
            let same_parent = old_parent_rel == parent_rel;
            tracing::debug!(from = %old_rel, to = rel, "local entry relocated");
            match (kind, same_parent) {
                (LocalKind::Folder, true) => observer.on_folder_renamed(id, parent, name).await,
                (LocalKind::Folder, false) => observer.on_folder_moved(id, parent, name).await,
                (LocalKind::File, _) => observer.on_file_moved(id, parent, name).await,
            }
        }
    }
}

/// A folder that appears with content (moved in from outside the tree)
/// produces no events for its children; walk it and report them.
async fn announce_subtree(store: &FsLocalStore, observer: &dyn LocalObserver, root: LocalId) {
    use super::LocalStore;

    let mut stack = vec![root];
    while let Some(folder) = stack.pop() {
        let children = match store.list_children(folder).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(folder = %folder, error = %e, "cannot list new folder");
                continue;
            }
        };
        for child in children {
            match child.kind {
                LocalKind::Folder => {
                    observer
                        .on_folder_created(child.id, folder, &child.name)
                        .await;
                    stack.push(child.id);
                }
                LocalKind::File => observer.on_file_added(child.id, folder, &child.name).await,
            }
        }
    }
}

async fn on_missing(store: &FsLocalStore, observer: &dyn LocalObserver, rel: &str) {
    let Some((id, kind)) = store.lookup_path(rel) else {
        return;
    };
    store.forget(rel);
    match kind {
        LocalKind::Folder => observer.on_folder_deleted(id).await,
        LocalKind::File => observer.on_file_deleted(id).await,
    }
}
