use std::path::Path;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use super::paths::project_path_for;

/// A change in the working directory, already mapped to a project path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEvent {
    Write { path: String },
    Delete { path: String },
    Move { from: String, to: String },
}

pub fn start_notify_watcher(
    root: &Path,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<LocalEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let watch_root = root.to_path_buf();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            for local in map_event(&watch_root, event) {
                let _ = tx.send(local);
            }
        }
    })?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    Ok((watcher, rx))
}

fn map_event(root: &Path, event: Event) -> Vec<LocalEvent> {
    match event.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            if event.paths.len() >= 2
                && let (Some(from), Some(to)) = (
                    project_path_for(root, &event.paths[0]),
                    project_path_for(root, &event.paths[1]),
                )
            {
                return vec![LocalEvent::Move { from, to }];
            }
            Vec::new()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            project_paths(root, event.paths, |path| LocalEvent::Delete { path })
        }
        EventKind::Create(_) | EventKind::Modify(_) => {
            project_paths(root, event.paths, |path| LocalEvent::Write { path })
        }
        EventKind::Remove(_) => project_paths(root, event.paths, |path| LocalEvent::Delete { path }),
        _ => Vec::new(),
    }
}

fn project_paths(
    root: &Path,
    paths: Vec<std::path::PathBuf>,
    event: impl Fn(String) -> LocalEvent,
) -> Vec<LocalEvent> {
    paths
        .into_iter()
        .filter_map(|path| project_path_for(root, &path))
        .map(event)
        .collect()
}
