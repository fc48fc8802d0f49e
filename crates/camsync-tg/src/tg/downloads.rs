//! Drains the queue of `/download` requests one at a time

use crate::download::{self, DownloadError, DownloadOptions, Downloaded, Progress, ProgressSink};
use crate::error::IoError;
use crate::prelude::*;
use crate::queue::{Job, JobQueue};
use crate::util::display::{human_duration, human_size};
use crate::util::escape_truncated;
use crate::{err, err_ctx, http, tg, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::MessageId;
use url::Url;

#[derive(Debug, Clone)]
pub(crate) struct DownloadRequest {
    pub(crate) url: Url,
    pub(crate) file_name: String,
    pub(crate) chat_id: ChatId,

    /// Message that is edited with the progress of the download
    pub(crate) status_msg: MessageId,
}

/// Requests for the same URL and file name are duplicates no matter which
/// message they came from
impl PartialEq for DownloadRequest {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url && self.file_name == other.file_name
    }
}

pub(crate) struct DownloadWorker {
    bot: tg::Bot,
    http: http::Client,
    cfg: download::Config,
    temp_dir: PathBuf,
    watch_dir: PathBuf,
    queue: Arc<JobQueue<DownloadRequest>>,
}

impl DownloadWorker {
    pub(crate) async fn new(
        bot: tg::Bot,
        http: http::Client,
        cfg: download::Config,
        watch_dir: PathBuf,
        queue: Arc<JobQueue<DownloadRequest>>,
    ) -> Result<Self> {
        let temp_dir = cfg
            .temp_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("camsync"));

        tokio::fs::create_dir_all(&temp_dir)
            .await
            .map_err(err_ctx!(IoError::CreateTempDir {
                path: temp_dir.display().to_string()
            }))?;

        Ok(Self {
            bot,
            http,
            cfg,
            temp_dir,
            watch_dir,
            queue,
        })
    }

    pub(crate) async fn run(self) {
        info!("Download worker started");
        loop {
            let job = self.queue.next().await;
            self.queue.set_processing(true);
            self.process(job).await;
            self.queue.set_processing(false);
        }
    }

    #[instrument(skip_all, fields(file = %job.payload.file_name, url = %job.payload.url))]
    async fn process(&self, job: Job<DownloadRequest>) {
        let request = job.payload;

        let result = self.try_process(&request).await;

        let outcome = match &result {
            Ok(_) => "succeeded",
            Err(err) if err.is_cancelled() => "cancelled",
            Err(err) => {
                warn!(err = tracing_err(err), "Download failed");
                "failed"
            }
        };

        metrics::increment_counter!("downloads_total", "outcome" => outcome);

        let text = finished_text(&request.file_name, &result);

        let edit = self
            .bot
            .edit_message_text(request.chat_id, request.status_msg, escape_truncated(&text))
            .await;

        if let Err(err) = edit {
            warn!(
                err = tracing_err(&err),
                "Failed to update the download status message"
            );
        }
    }

    async fn try_process(&self, request: &DownloadRequest) -> Result<Downloaded> {
        let dest = self.watch_dir.join(&request.file_name);

        if tokio::fs::metadata(&dest).await.is_ok() {
            return Err(err!(IoError::FileExists {
                path: dest.display().to_string()
            }));
        }

        let temp = self.temp_dir.join(&request.file_name);

        let sink = TgProgressSink {
            bot: self.bot.clone(),
            chat_id: request.chat_id,
            message_id: request.status_msg,
            file_name: request.file_name.clone(),
        };

        let downloaded = download::download(
            &self.http,
            DownloadOptions {
                url: &request.url,
                dest: &temp,
                cadence: self.cfg.report_interval,
                sink: &sink,
                is_cancelled: &|| self.queue.is_cancel_requested(),
                cleanup_on_error: true,
                limits: self.cfg.limits(),
            },
        )
        .await?;

        if !self.queue.try_complete() {
            info!("Download was cancelled right after it finished");
            if let Err(err) = tokio::fs::remove_file(&temp).await {
                warn!(err = tracing_err(&err), "Failed to remove the downloaded file");
            }
            return Err(err!(DownloadError::Cancelled));
        }

        move_file(&temp, &dest).await?;

        info!(dest = %dest.display(), "Moved the downloaded file to the camera folder");

        Ok(downloaded)
    }
}

fn finished_text(file_name: &str, result: &Result<Downloaded>) -> String {
    match result {
        Ok(downloaded) => format!(
            "✅ Downloaded {file_name} ({}) in {}\nIt will be uploaded shortly",
            human_size(downloaded.size),
            human_duration(downloaded.elapsed),
        ),
        Err(err) if err.is_cancelled() => format!("🛑 Download of {file_name} was cancelled"),
        Err(err) => format!(
            "❌ Download of {file_name} failed (error id: {})\n{}",
            err.id(),
            err.kind().display_chain(),
        ),
    }
}

/// The file appears in the target directory under its final name in a single
/// rename, so the watcher never sees a partially written file.
async fn move_file(from: &Path, to: &Path) -> Result {
    let map_err = |source| {
        err!(IoError::MoveFile {
            from: from.display().to_string(),
            to: to.display().to_string(),
            source,
        })
    };

    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }

    // Renames don't work across filesystems
    let staged = to.with_file_name(format!(".{}.part", to.display_name()));

    tokio::fs::copy(from, &staged).await.map_err(map_err)?;
    tokio::fs::rename(&staged, to).await.map_err(map_err)?;
    tokio::fs::remove_file(from).await.map_err(map_err)?;

    Ok(())
}

struct TgProgressSink {
    bot: tg::Bot,
    chat_id: ChatId,
    message_id: MessageId,
    file_name: String,
}

#[async_trait]
impl ProgressSink for TgProgressSink {
    async fn report(&self, progress: &Progress) -> Result {
        let text = format!("📥 Downloading {}\n{progress}", self.file_name);

        self.bot
            .edit_message_text(self.chat_id, self.message_id, escape_truncated(&text))
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use expect_test::expect;
    use std::time::Duration;

    #[test]
    fn requests_are_compared_by_url_and_name() {
        let request = |chat_id, message_id| DownloadRequest {
            url: "https://example.com/clip.mkv".parse().unwrap(),
            file_name: "clip.mkv".to_owned(),
            chat_id: ChatId(chat_id),
            status_msg: MessageId(message_id),
        };

        assert_eq!(request(1, 10), request(2, 20));

        let mut renamed = request(1, 10);
        renamed.file_name = "other.mkv".to_owned();
        assert_ne!(request(1, 10), renamed);
    }

    #[test]
    fn finished_texts() {
        let done = Ok(Downloaded {
            size: 300 * 1024 * 1024,
            elapsed: Duration::from_secs(90),
        });

        let text = finished_text("clip.mkv", &done);
        assert!(text.starts_with("✅ Downloaded clip.mkv (300 MiB) in "), "{text}");
        assert!(text.ends_with("\nIt will be uploaded shortly"), "{text}");

        let cancelled = Err(err!(DownloadError::Cancelled));

        expect!["🛑 Download of clip.mkv was cancelled"]
            .assert_eq(&finished_text("clip.mkv", &cancelled));

        let failed = Err(err!(DownloadError::BadStatus {
            status: reqwest::StatusCode::NOT_FOUND
        }));

        let text = finished_text("clip.mkv", &failed);
        let id = failed.as_ref().unwrap_err().id();
        assert!(text.contains(&format!("(error id: {id})")), "{text}");
    }

    #[test_log::test(tokio::test)]
    async fn moves_file_into_the_target_dir() {
        let from_dir = tempfile::tempdir().unwrap();
        let to_dir = tempfile::tempdir().unwrap();

        let from = from_dir.path().join("clip.mkv");
        let to = to_dir.path().join("clip.mkv");

        std::fs::write(&from, "video").unwrap();

        move_file(&from, &to).await.unwrap();

        assert!(!from.exists());
        assert_eq!(std::fs::read_to_string(&to).unwrap(), "video");

        let leftovers: Vec<_> = std::fs::read_dir(to_dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();

        assert_eq!(leftovers, ["clip.mkv"]);
    }

    #[test_log::test(tokio::test)]
    async fn moving_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();

        let result = move_file(&dir.path().join("missing.mkv"), &dir.path().join("b.mkv")).await;

        assert!(result.is_err());
    }
}
