//! Telegram bot that the operator uses to control the service

mod cmd;
mod config;
mod downloads;

use crate::prelude::*;
use crate::queue::JobQueue;
use crate::{download, http, watcher, Result};
use dptree::di::DependencyMap;
use std::path::PathBuf;
use std::sync::Arc;
use teloxide::adaptors::{CacheMe, DefaultParseMode, Throttle, Trace};
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use teloxide::utils::command::BotCommands;

pub(crate) use cmd::CommandError;
pub(crate) use config::*;
pub(crate) use downloads::{DownloadRequest, DownloadWorker};

pub(crate) type Bot = Trace<CacheMe<DefaultParseMode<Throttle<teloxide::Bot>>>>;

pub(crate) fn create_bot(cfg: &Config) -> Bot {
    teloxide::Bot::with_client(cfg.token.clone(), teloxide::net::client_from_env())
        .throttle(Default::default())
        .parse_mode(ParseMode::MarkdownV2)
        .cache_me()
        .trace(teloxide::adaptors::trace::Settings::all())
}

pub(crate) struct Ctx {
    bot: Bot,
    cfg: Config,
    watch: watcher::Config,
    uploads: Arc<JobQueue<PathBuf>>,
    downloads: Arc<JobQueue<DownloadRequest>>,
}

pub(crate) struct RunBotOptions {
    pub(crate) bot: Bot,
    pub(crate) tg_cfg: Config,
    pub(crate) watch_cfg: watcher::Config,
    pub(crate) download_cfg: download::Config,

    /// Downloads are never retried transparently. A retry from scratch is up
    /// to the operator.
    pub(crate) http: http::Client,
    pub(crate) uploads: Arc<JobQueue<PathBuf>>,
}

pub(crate) async fn run_bot(opts: RunBotOptions) -> Result {
    let RunBotOptions {
        bot,
        tg_cfg,
        watch_cfg,
        download_cfg,
        http,
        uploads,
    } = opts;

    let downloads = Arc::new(JobQueue::new());

    let download_worker = DownloadWorker::new(
        bot.clone(),
        http,
        download_cfg,
        watch_cfg.dir.clone(),
        downloads.clone(),
    )
    .await?;

    tokio::spawn(download_worker.run());

    let mut di = DependencyMap::new();

    di.insert(Arc::new(Ctx {
        bot: bot.clone(),
        cfg: tg_cfg,
        watch: watch_cfg,
        uploads,
        downloads,
    }));

    info!("Starting bot...");

    bot.set_my_commands(cmd::Cmd::bot_commands()).await?;

    let handler = dptree::entry()
        .inspect(|update: Update| {
            metrics::increment_counter!("tg_updates_total");
            trace!(target: "tg_update", "{update:#?}");
        })
        .branch(
            Update::filter_message()
                .filter(cmd::filter_operator_chat)
                .filter_command::<cmd::Cmd>()
                .endpoint(cmd::handle::<cmd::Cmd>()),
        )
        .branch(
            Update::filter_message()
                .filter(cmd::filter_operator_chat)
                .filter_command::<cmd::StartCommand>()
                .endpoint(cmd::handle::<cmd::StartCommand>()),
        )
        .inspect(|update: Update| {
            if let Some(chat) = update.chat() {
                debug!(chat = %chat.debug_id(), "Skipped update");
            }
            metrics::increment_counter!("tg_updates_skipped_total");
        });

    Dispatcher::builder(bot, handler)
        .dependencies(di)
        // Messages from other chats and plain texts are ignored, so this
        // suppresses the warning about unhandled updates
        .default_handler(|_| std::future::ready(()))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    info!("Bot stopped");

    Ok(())
}
