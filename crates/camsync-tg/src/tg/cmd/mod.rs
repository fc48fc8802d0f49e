mod download;

use crate::prelude::*;
use crate::queue::{JobQueue, JobState, QueueSnapshot};
use crate::util::display::{human_duration, human_size};
use crate::util::DynResult;
use crate::{tg, watcher, Result};
use async_trait::async_trait;
use chrono::prelude::*;
use futures::future::BoxFuture;
use itertools::Itertools;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use teloxide::macros::BotCommands;
use teloxide::prelude::*;
use teloxide::types::User;

pub(crate) use download::DownloadCmd;

#[async_trait]
pub(crate) trait Command: fmt::Debug + Send + Sync + 'static {
    async fn handle(self, ctx: &tg::Ctx, msg: &Message) -> Result;
}

pub(crate) fn handle<'a, C: Command>(
) -> impl Fn(Arc<tg::Ctx>, Message, C) -> BoxFuture<'a, DynResult> {
    move |ctx, msg, cmd| {
        let info = info_span!(
            "handle_message",
            sender = msg.from().map(User::debug_id).as_deref(),
            msg_text = msg.text(),
            chat = %msg.chat.debug_id(),
            cmd = format_args!("{cmd:#?}")
        );

        let fut = async move {
            debug!("Processing command");

            let result = cmd.handle(&ctx, &msg).await;
            if let Err(err) = &result {
                let span = warn_span!("err", err = tracing_err(err), id = err.id());
                async {
                    if !err.is_user_error() {
                        warn!("Command handler returned an error");
                    }

                    let reply_msg = err.display_chain().to_string();

                    let msg_result = ctx.bot.reply_code_block(&msg, &reply_msg).await;

                    if let Err(err) = msg_result {
                        warn!(
                            err = tracing_err(&err),
                            "Failed to reply with the error message to the user"
                        );
                    }
                }
                .instrument(span)
                .await;
            }
            result.map_err(Into::into)
        };

        Box::pin(fut.instrument(info))
    }
}

/// Commands from anyone but the operator are silently ignored
pub(crate) fn filter_operator_chat(msg: Message, ctx: Arc<tg::Ctx>) -> bool {
    msg.chat.id == ctx.cfg.chat_id
}

/// `/start` is sent automatically when the chat with the bot is opened for
/// the first time. It's not worth listing in the help message.
#[derive(BotCommands, Clone, Debug)]
#[command(rename_rule = "snake_case")]
pub(crate) enum StartCommand {
    #[command(description = "unreachable")]
    Start,
}

#[async_trait]
impl Command for StartCommand {
    async fn handle(self, ctx: &tg::Ctx, msg: &Message) -> Result {
        Cmd::Help.handle(ctx, msg).await
    }
}

#[derive(BotCommands, Clone, Debug)]
#[command(rename_rule = "snake_case", description = "Commands:")]
pub(crate) enum Cmd {
    #[command(description = "show this message")]
    Help,

    #[command(description = "download a file into the camera folder: <url> [-n <file name>]")]
    Download(String),

    #[command(description = "cancel the running download and upload")]
    Cancel,

    #[command(description = "show the download and upload queues")]
    Status,

    #[command(description = "delete the files in the camera folder that aren't being uploaded")]
    Clean,
}

#[async_trait]
impl Command for Cmd {
    async fn handle(self, ctx: &tg::Ctx, msg: &Message) -> Result {
        match self {
            Cmd::Help => {
                ctx.bot.reply_help_md_escaped::<Cmd>(msg).await?;
            }
            Cmd::Download(args) => {
                args.parse::<DownloadCmd>()?.handle(ctx, msg).await?;
            }
            Cmd::Cancel => {
                let download = ctx.downloads.request_cancel();
                let upload = ctx.uploads.request_cancel();

                info!(download, upload, "Cancellation requested");

                let reply = match (download, upload) {
                    (true, true) => "Cancelling the download and the upload...",
                    (true, false) => "Cancelling the download...",
                    (false, true) => "Cancelling the upload...",
                    (false, false) => "Nothing to cancel",
                };

                ctx.bot.reply_text(msg, reply).await?;
            }
            Cmd::Status => {
                let now = Utc::now();
                let downloads = ctx.downloads.snapshot();
                let uploads = ctx.uploads.snapshot();

                let text = format!(
                    "📥 Downloads\n{}\n\n📤 Uploads\n{}",
                    describe_queue(&downloads, now, |request| request.file_name.clone()),
                    describe_queue(&uploads, now, |path| path.display_name()),
                );

                ctx.bot.reply_text(msg, &text).await?;
            }
            Cmd::Clean => {
                let cleaned = clean_camera_folder(&ctx.watch, &ctx.uploads).await?;

                let text = if cleaned.files == 0 {
                    "Nothing to clean".to_owned()
                } else {
                    format!(
                        "Deleted {} file(s), freed {}",
                        cleaned.files,
                        human_size(cleaned.bytes)
                    )
                };

                ctx.bot.reply_text(msg, &text).await?;
            }
        }
        Ok(())
    }
}

fn describe_queue<T>(
    snapshot: &QueueSnapshot<T>,
    now: DateTime<Utc>,
    name: impl Fn(&T) -> String,
) -> String {
    let age = |since: DateTime<Utc>| {
        human_duration((now - since).to_std().unwrap_or_default())
    };

    let current = snapshot.current.as_ref().map(|current| {
        let name = name(&current.job.payload);
        match current.state {
            JobState::Queued => format!("▶️ {name}: starting"),
            JobState::Processing {
                started_at,
                cancel_requested,
            } => {
                let cancelling = if cancel_requested { ", cancelling" } else { "" };
                format!("▶️ {name}: running for {}{cancelling}", age(started_at))
            }
            JobState::Done => format!("▶️ {name}: finishing"),
        }
    });

    let pending = snapshot
        .pending
        .iter()
        .enumerate()
        .map(|(i, job)| {
            format!(
                "{}. {}: waiting for {}",
                i + 1,
                name(&job.payload),
                age(job.queued_at)
            )
        });

    let lines = current.into_iter().chain(pending).join("\n");

    if lines.is_empty() {
        return "Empty".to_owned();
    }

    lines
}

struct Cleaned {
    files: usize,
    bytes: u64,
}

/// Deletes the files with the watched extension from the camera folder
/// except for the one being uploaded right now.
#[instrument(skip_all)]
async fn clean_camera_folder(
    watch: &watcher::Config,
    uploads: &JobQueue<PathBuf>,
) -> Result<Cleaned> {
    let mut entries = fs_err::tokio::read_dir(&watch.dir).await?;

    let mut cleaned = Cleaned { files: 0, bytes: 0 };

    while let Some(entry) = entries.next_entry().await? {
        let path: PathBuf = entry.path();

        if !watch.is_watched_file(&path) {
            continue;
        }

        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }

        // The upload worker may take the file at any moment, so the current
        // job is checked only once the file can't be dequeued anymore
        if !uploads.remove(&path) && uploads.current_payload().as_ref() == Some(&path) {
            debug!(file = %path.display(), "Keeping the file that is being uploaded");
            continue;
        }

        if let Err(err) = fs_err::tokio::remove_file(&path).await {
            warn!(err = tracing_err(&err), "Failed to delete a file");
            continue;
        }

        info!(file = %path.display(), "Deleted a file");

        cleaned.files += 1;
        cleaned.bytes += metadata.len();
    }

    Ok(cleaned)
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum CommandError {
    #[error("Usage: /download <url> [-n <file name>]")]
    DownloadUsage,

    #[error("The URL is invalid: {url}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },

    #[error("Only http and https URLs are supported, but got: {scheme}")]
    UnsupportedScheme { scheme: String },

    #[error("The file name must not be empty or contain path separators: {name}")]
    InvalidFileName { name: String },

    #[error("The same file is already queued for download")]
    AlreadyQueued,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::JobQueue;
    use expect_test::expect;

    #[test_log::test(tokio::test)]
    async fn clean_keeps_only_the_current_upload() {
        let dir = tempfile::tempdir().unwrap();
        let watch = watcher::Config {
            dir: dir.path().to_owned(),
            extension: "mkv".to_owned(),
        };

        let [current, pending, unqueued, other] =
            ["current.mkv", "pending.mkv", "unqueued.MKV", "notes.txt"].map(|name| {
                let path = dir.path().join(name);
                std::fs::write(&path, vec![0; 100]).unwrap();
                path
            });

        let uploads = JobQueue::new();
        uploads.enqueue(current.clone());
        uploads.enqueue(pending.clone());

        // The worker took the first file after the command was received
        uploads.dequeue().unwrap();
        uploads.set_processing(true);

        let cleaned = clean_camera_folder(&watch, &uploads).await.unwrap();

        assert_eq!(cleaned.files, 2);
        assert_eq!(cleaned.bytes, 200);
        assert!(current.exists());
        assert!(other.exists());
        assert!(!pending.exists());
        assert!(!unqueued.exists());

        assert!(uploads.snapshot().pending.is_empty());
        assert_eq!(uploads.current_payload(), Some(current));
    }

    #[test]
    fn describes_queue() {
        let queue = JobQueue::<PathBuf>::new();
        let now = Utc::now();

        expect!["Empty"].assert_eq(&describe_queue(&queue.snapshot(), now, |path| {
            path.display_name()
        }));

        queue.enqueue("/sdcard/DCIM/Camera/a.mkv".into());
        queue.enqueue("/sdcard/DCIM/Camera/b.mkv".into());
        queue.dequeue();
        queue.set_processing(true);
        queue.request_cancel();

        let text = describe_queue(&queue.snapshot(), now, |path| path.display_name());
        let lines: Vec<_> = text.lines().collect();

        assert_eq!(lines.len(), 2, "{text}");
        assert!(lines[0].starts_with("▶️ a.mkv: running for "), "{text}");
        assert!(lines[0].ends_with(", cancelling"), "{text}");
        assert!(lines[1].starts_with("1. b.mkv: waiting for "), "{text}");
    }
}
