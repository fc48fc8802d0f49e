mod config;
mod device;
mod download;
mod error;
mod http;
mod matching;
mod notification;
mod observability;
mod photos;
mod queue;
mod tg;
mod watcher;
mod worker;

pub mod util;

pub use crate::error::*;
pub use config::*;
pub use observability::*;

use std::sync::Arc;

#[allow(unused_imports)]
mod prelude {
    pub(crate) use crate::error::prelude::*;
    pub(crate) use crate::http::prelude::*;
    pub(crate) use crate::observability::logging::prelude::*;
    pub(crate) use crate::util::prelude::*;
}

/// Run the camera folder watcher, the upload worker and the telegram bot
/// processing loop
pub async fn run(config: Config) -> Result<()> {
    let http = http::create_client();
    let single_attempt_http = http::create_single_attempt_client();
    let bot = tg::create_bot(&config.tg);

    let uploads = Arc::new(queue::JobQueue::new());

    // Stops watching when dropped
    let _watcher = watcher::spawn_watcher(config.watch.clone(), uploads.clone())?;

    let notifier = notification::TgNotifier::new(bot.clone(), config.tg.chat_id);

    let worker = worker::Worker {
        queue: uploads.clone(),
        catalog: Arc::new(photos::PhotosClient::new(
            http,
            single_attempt_http.clone(),
            config.photos,
        )),
        app: Arc::new(device::AndroidPhotosApp::new(config.device)),
        notifications: notification::Notifications::new(Arc::new(notifier)),
        cfg: config.worker,
        claimed: Default::default(),
    };

    tokio::spawn(worker.run());

    let opts = tg::RunBotOptions {
        bot,
        tg_cfg: config.tg,
        watch_cfg: config.watch,
        download_cfg: config.download,
        http: single_attempt_http,
        uploads,
    };

    tg::run_bot(opts).await
}
