//! Operator-facing notifications about the processing of the files.
//!
//! Notifications are a side channel. Failures to deliver them are logged and
//! never affect the processing itself.

use crate::matching::Confidence;
use crate::prelude::*;
use crate::tg::Bot;
use crate::util::display::{human_duration, human_size};
use crate::util::escape_truncated;
use crate::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use teloxide::types::ChatId;
use url::Url;

#[derive(Debug, Clone)]
pub(crate) enum ShareLink {
    /// Viewable by anyone who has the link
    Album(Url),

    /// Direct link to the item. It may require signing in or expire.
    Fallback(Url),
}

impl ShareLink {
    pub(crate) fn url(&self) -> &Url {
        match self {
            ShareLink::Album(url) | ShareLink::Fallback(url) => url,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Event {
    Started {
        file: String,
        size: u64,
    },
    Progress {
        file: String,
        waited: Duration,
        max_wait: Duration,
    },
    Matched {
        file: String,
        remote_name: String,
        confidence: Confidence,
    },
    Succeeded {
        file: String,
        link: ShareLink,
        confidence: Confidence,
        deleted: bool,
    },
    TimedOut {
        file: String,
        waited: Duration,
    },
    NotFound {
        file: String,
        waited: Duration,
    },
    Cancelled {
        file: String,
    },
    Failed {
        file: String,
        reason: String,
        error_id: String,
    },
}

impl Event {
    /// Label for metrics and logs
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Event::Started { .. } => "started",
            Event::Progress { .. } => "progress",
            Event::Matched { .. } => "matched",
            Event::Succeeded { .. } => "succeeded",
            Event::TimedOut { .. } => "timed_out",
            Event::NotFound { .. } => "not_found",
            Event::Cancelled { .. } => "cancelled",
            Event::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Started { file, size } => write!(
                f,
                "🚀 Processing started\n\
                File: {file}\n\
                Size: {}\n\
                Opening the app to upload it...",
                human_size(*size)
            ),
            Event::Progress {
                file,
                waited,
                max_wait,
            } => write!(
                f,
                "⏳ Waiting for the upload\n\
                File: {file}\n\
                Waited: {} of {}",
                human_duration(*waited),
                human_duration(*max_wait),
            ),
            Event::Matched {
                file,
                remote_name,
                confidence,
            } => {
                write!(
                    f,
                    "🎯 Found the upload\n\
                    File: {file}\n\
                    Uploaded as: {remote_name}\n\
                    Matched by: {confidence}"
                )?;
                if confidence.is_low() {
                    write!(
                        f,
                        "\nThe name didn't match, so make sure it's the right video"
                    )?;
                }
                Ok(())
            }
            Event::Succeeded {
                file,
                link,
                confidence,
                deleted,
            } => {
                write!(f, "✅ Done\nFile: {file}\nMatched by: {confidence}\n")?;
                match link {
                    ShareLink::Album(url) => write!(f, "Share link: {url}")?,
                    ShareLink::Fallback(url) => write!(
                        f,
                        "Couldn't create a share link, here is a direct one \
                        (it may require signing in): {url}"
                    )?,
                }
                if *deleted {
                    write!(f, "\nThe original file was deleted")
                } else {
                    write!(
                        f,
                        "\nThe original file was kept. Delete it with /clean once \
                        you verify the link"
                    )
                }
            }
            Event::TimedOut { file, waited } => write!(
                f,
                "⏰ Upload timed out\n\
                File: {file}\n\
                No new uploads appeared in {}.\n\
                The file was kept. Check the app on the device and the network.",
                human_duration(*waited),
            ),
            Event::NotFound { file, waited } => write!(
                f,
                "🔍 Upload not found\n\
                File: {file}\n\
                New videos were uploaded within {}, but none of them matches \
                the file.\n\
                The file was kept. Check the latest uploads manually.",
                human_duration(*waited),
            ),
            Event::Cancelled { file } => write!(
                f,
                "🛑 Processing cancelled\n\
                File: {file}\n\
                The file was deleted"
            ),
            Event::Failed {
                file,
                reason,
                error_id,
            } => write!(
                f,
                "❌ Processing failed\n\
                File: {file}\n\
                Reason: {reason}\n\
                Error id: {error_id}\n\
                The file was kept"
            ),
        }
    }
}

#[async_trait]
pub(crate) trait Notifier: Send + Sync {
    async fn send_text(&self, text: String) -> Result;
}

/// Sends the notifications to a single Telegram chat
pub(crate) struct TgNotifier {
    bot: Bot,
    chat_id: ChatId,
}

impl TgNotifier {
    pub(crate) fn new(bot: Bot, chat_id: ChatId) -> Self {
        Self { bot, chat_id }
    }
}

#[async_trait]
impl Notifier for TgNotifier {
    async fn send_text(&self, text: String) -> Result {
        self.bot
            .send_message(self.chat_id, escape_truncated(&text))
            .disable_web_page_preview(true)
            .await?;
        Ok(())
    }
}

#[derive(Clone)]
pub(crate) struct Notifications {
    notifier: Arc<dyn Notifier>,
}

impl Notifications {
    pub(crate) fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }

    pub(crate) async fn emit(&self, event: Event) {
        let kind = event.kind();

        metrics::increment_counter!("notifications_total", "kind" => kind);

        let result = self.notifier.send_text(event.to_string()).await;

        match result {
            Ok(()) => debug!(kind, "Sent notification"),
            Err(err) => warn!(
                err = tracing_err(&err),
                kind, "Failed to send notification"
            ),
        }
    }
}
