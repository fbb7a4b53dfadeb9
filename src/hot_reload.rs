// Shader hot reload
//
// Watches the directories holding the compiled shaders (editors and
// glslc replace files rather than writing in place) and records which
// watched files changed. The renderer drains the list once per frame.

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{GpuError, Result};

pub struct ShaderWatcher {
    _watcher: RecommendedWatcher,
    changed: Arc<Mutex<Vec<PathBuf>>>,
}

impl ShaderWatcher {
    pub fn new(paths: &[PathBuf]) -> Result<Self> {
        let watched: Vec<PathBuf> = paths
            .iter()
            .map(|p| p.canonicalize().unwrap_or_else(|_| p.clone()))
            .collect();
        let changed = Arc::new(Mutex::new(Vec::new()));

        let sink = changed.clone();
        let filter = watched.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) => {
                    let hits = matching_paths(&filter, &event.paths);
                    if !hits.is_empty() {
                        let mut changed = sink.lock();
                        for hit in hits {
                            if !changed.contains(&hit) {
                                changed.push(hit);
                            }
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => log::warn!("Shader watcher error: {}", e),
            }
        })
        .map_err(watch_error)?;

        let directories: BTreeSet<&Path> = watched
            .iter()
            .map(|p| p.parent().filter(|d| !d.as_os_str().is_empty()).unwrap_or(Path::new(".")))
            .collect();
        for dir in directories {
            watcher
                .watch(dir, RecursiveMode::NonRecursive)
                .map_err(watch_error)?;
            log::info!("Watching {} for shader changes", dir.display());
        }

        Ok(Self {
            _watcher: watcher,
            changed,
        })
    }

    /// Watched files changed since the last call.
    pub fn take_changed(&self) -> Vec<PathBuf> {
        std::mem::take(&mut *self.changed.lock())
    }
}

fn watch_error(e: notify::Error) -> GpuError {
    GpuError::Io(std::io::Error::other(e.to_string()))
}

/// Watched paths named by an event. Event paths are absolute, watched
/// paths may be relative, so matching is by path suffix.
fn matching_paths(watched: &[PathBuf], event_paths: &[PathBuf]) -> Vec<PathBuf> {
    watched
        .iter()
        .filter(|w| event_paths.iter().any(|e| e.ends_with(w)))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_watch_matches_absolute_event() {
        let watched = vec![
            PathBuf::from("shaders/mesh.vert.spv"),
            PathBuf::from("shaders/mesh.frag.spv"),
        ];
        let events = vec![PathBuf::from("/home/me/proj/shaders/mesh.frag.spv")];
        assert_eq!(
            matching_paths(&watched, &events),
            vec![PathBuf::from("shaders/mesh.frag.spv")]
        );
    }

    #[test]
    fn unrelated_files_are_ignored() {
        let watched = vec![PathBuf::from("shaders/mesh.vert.spv")];
        let events = vec![
            PathBuf::from("/proj/shaders/mesh.vert"),
            PathBuf::from("/proj/shaders/other.vert.spv"),
            PathBuf::from("/proj/shaders/mesh.vert.spv.tmp"),
        ];
        assert!(matching_paths(&watched, &events).is_empty());
    }
}
