//! File system watcher feeding hot reload.

use std::path::{Path, PathBuf};

use crossbeam_channel::{Receiver, Sender};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};

/// Change observed under a watched resource root. The provider decides
/// added/modified/removed by comparing against its entry tables, which
/// keeps the outcome deterministic across watcher backends.
#[derive(Clone, Debug)]
pub(crate) struct FileChange {
    pub path: PathBuf,
    pub exists: bool,
}

pub(crate) struct ReloadWatcher {
    // Kept alive for the watch registration; dropping it stops events.
    _watcher: RecommendedWatcher,
    receiver: Receiver<FileChange>,
}

impl ReloadWatcher {
    pub fn attach(root: &Path) -> Result<Self, notify::Error> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            forward_event(&sender, result);
        })?;
        watcher.watch(root, RecursiveMode::Recursive)?;
        Ok(ReloadWatcher {
            _watcher: watcher,
            receiver,
        })
    }

    pub fn drain(&self) -> Vec<FileChange> {
        let mut changes = Vec::new();
        while let Ok(change) = self.receiver.try_recv() {
            changes.push(change);
        }
        changes
    }
}

fn forward_event(sender: &Sender<FileChange>, result: notify::Result<notify::Event>) {
    let event = match result {
        Ok(event) => event,
        Err(error) => {
            log::warn!(target: "resource", "file watcher error: {}", error);
            return;
        }
    };

    for path in event.paths {
        let exists = path.is_file();
        if !exists && path.is_dir() {
            // Directory events surface through the files inside them.
            continue;
        }
        let _ = sender.send(FileChange { path, exists });
    }
}
