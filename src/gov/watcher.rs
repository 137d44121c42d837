use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use std::path::Path;
use tokio::sync::mpsc;

/// Services-directory event, reduced to what the coordinator cares about:
/// the basename and whether the file appeared, changed or went away.
/// Renames surface as Removed (old name) and Created (new name).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    Created(String),
    Modified(String),
    Removed(String),
}

/// Keep the watcher alive for as long as events are wanted; dropping it
/// stops the stream.
pub struct DirWatcher {
    _watcher: RecommendedWatcher,
}

fn base_name(p: &Path) -> Option<String> {
    p.file_name().map(|os| os.to_string_lossy().to_string())
}

fn translate(event: &Event) -> Vec<FileEvent> {
    let mut out = Vec::new();
    match event.kind {
        EventKind::Create(_) => {
            for p in &event.paths {
                if let Some(n) = base_name(p) {
                    out.push(FileEvent::Created(n));
                }
            }
        }
        EventKind::Remove(_) => {
            for p in &event.paths {
                if let Some(n) = base_name(p) {
                    out.push(FileEvent::Removed(n));
                }
            }
        }
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => {
                if let Some(n) = event.paths.first().and_then(|p| base_name(p)) {
                    out.push(FileEvent::Removed(n));
                }
            }
            RenameMode::To => {
                if let Some(n) = event.paths.first().and_then(|p| base_name(p)) {
                    out.push(FileEvent::Created(n));
                }
            }
            RenameMode::Both => {
                if let Some(n) = event.paths.first().and_then(|p| base_name(p)) {
                    out.push(FileEvent::Removed(n));
                }
                if let Some(n) = event.paths.get(1).and_then(|p| base_name(p)) {
                    out.push(FileEvent::Created(n));
                }
            }
            _ => {
                for p in &event.paths {
                    if let Some(n) = base_name(p) {
                        out.push(FileEvent::Modified(n));
                    }
                }
            }
        },
        EventKind::Modify(_) => {
            for p in &event.paths {
                if let Some(n) = base_name(p) {
                    out.push(FileEvent::Modified(n));
                }
            }
        }
        _ => {}
    }
    out
}

/// Watch one directory (non-recursive) and stream translated events into a
/// channel. Watcher errors are logged; the supervisor keeps running without
/// hot reload if the watch dies.
pub fn watch_dir(dir: &Path) -> anyhow::Result<(DirWatcher, mpsc::UnboundedReceiver<FileEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut watcher =
        notify::recommended_watcher(move |result: notify::Result<Event>| match result {
            Ok(event) => {
                log::debug!("file watcher event {event:?}");
                for ev in translate(&event) {
                    let _ = tx.send(ev);
                }
            }
            Err(e) => log::error!("error watching: {e}"),
        })?;
    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .map_err(|e| anyhow::anyhow!("error watching {}: {e}", dir.display()))?;
    Ok((DirWatcher { _watcher: watcher }, rx))
}
