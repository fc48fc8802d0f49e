//! Puts new files that appear in the camera folder on the upload queue.

use crate::prelude::*;
use crate::queue::JobQueue;
use crate::{err, Result};
use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Deserialize, Clone)]
pub(crate) struct Config {
    /// Camera folder on the device that the companion app syncs
    pub(crate) dir: PathBuf,

    /// Only the files with this extension are processed (case-insensitive)
    #[serde(default = "default_extension")]
    pub(crate) extension: String,
}

fn default_extension() -> String {
    "mkv".to_owned()
}

impl Config {
    pub(crate) fn is_watched_file(&self, path: &Path) -> bool {
        path.has_extension(&self.extension)
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum WatchError {
    #[error("Failed to watch the directory `{dir}`")]
    Init { dir: PathBuf, source: notify::Error },
}

/// The files are enqueued until the returned watcher is dropped
pub(crate) fn spawn_watcher(
    config: Config,
    queue: Arc<JobQueue<PathBuf>>,
) -> Result<RecommendedWatcher> {
    let dir = config.dir.clone();

    let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
        let event = match event {
            Ok(event) => event,
            Err(err) => {
                warn!(err = tracing_err(&err), "File watcher reported an error");
                return;
            }
        };

        if !is_new_file_event(&event.kind) {
            return;
        }

        for path in event.paths {
            if !config.is_watched_file(&path) || !path.is_file() {
                continue;
            }

            let file = path.display_name();

            if queue.enqueue(path) {
                info!(%file, "New file queued");
                metrics::increment_counter!("files_queued_total");
            } else {
                debug!(%file, "File is already queued");
            }
        }
    })
    .map_err(|source| err!(WatchError::Init { dir: &dir, source }))?;

    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .map_err(|source| err!(WatchError::Init { dir: &dir, source }))?;

    info!(dir = %dir.display(), "Watching for new files");

    Ok(watcher)
}

/// Files copied into the folder produce a create event, and files moved into
/// it from elsewhere produce a rename event on Linux.
fn is_new_file_event(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(CreateKind::File | CreateKind::Any)
            | EventKind::Modify(ModifyKind::Name(RenameMode::To | RenameMode::Any))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn next_queued(queue: &JobQueue<PathBuf>) -> PathBuf {
        tokio::time::timeout(Duration::from_secs(10), queue.next())
            .await
            .expect("no file was queued in time")
            .payload
    }

    #[test_log::test(tokio::test)]
    async fn queues_only_watched_extension() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(JobQueue::new());

        let _watcher = spawn_watcher(
            Config {
                dir: dir.path().to_owned(),
                extension: "mkv".to_owned(),
            },
            queue.clone(),
        )
        .unwrap();

        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        std::fs::write(dir.path().join("clip.MKV"), "video").unwrap();

        let path = next_queued(&queue).await;
        assert_eq!(path.file_name().unwrap(), "clip.MKV");
        assert!(queue.snapshot().pending.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn queues_files_moved_into_the_dir() {
        let dir = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir_in(dir.path().parent().unwrap()).unwrap();
        let queue = Arc::new(JobQueue::new());

        let _watcher = spawn_watcher(
            Config {
                dir: dir.path().to_owned(),
                extension: "mkv".to_owned(),
            },
            queue.clone(),
        )
        .unwrap();

        let staged = staging.path().join("download.mkv");
        std::fs::write(&staged, "video").unwrap();
        std::fs::rename(&staged, dir.path().join("download.mkv")).unwrap();

        let path = next_queued(&queue).await;
        assert_eq!(path.file_name().unwrap(), "download.mkv");
    }

    #[test]
    fn missing_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = spawn_watcher(
            Config {
                dir: dir.path().join("missing"),
                extension: "mkv".to_owned(),
            },
            Arc::new(JobQueue::new()),
        );
        assert!(result.is_err());
    }
}
