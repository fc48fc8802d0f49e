use crate::config::from_env_or_panic;
use crate::observability::GLOBAL_LABELS;
use crate::prelude::*;
use serde::Deserialize;
use serde_with::serde_as;
use std::collections::HashMap;
use tracing_subscriber::prelude::*;
use url::Url;

/// Must be shut down before the process exits, otherwise the last batch of
/// logs never reaches Loki
pub struct LoggingTask {
    loki: Option<LokiTask>,
}

struct LokiTask {
    task: tokio::task::JoinHandle<()>,
    controller: tracing_loki::BackgroundTaskController,
}

impl LoggingTask {
    pub async fn shutdown(self) {
        let Some(LokiTask { task, controller }) = self.loki else {
            return;
        };

        info!("Flushing the remaining logs to Loki...");

        let ((), duration) = controller.shutdown().with_duration().await;

        // The subscriber is still alive, but its Loki layer is not
        eprintln!("Loki task stopped in {duration:.2?}: {:?}", task.await);
    }
}

#[serde_as]
#[derive(Deserialize)]
struct LoggingConfig {
    /// Logs go only to stderr unless this is set
    loki_url: Option<Url>,

    /// JSON object with extra Loki labels, e.g. `{"device":"pixel"}`
    #[serde_as(as = "serde_with::json::JsonString")]
    #[serde(default)]
    log_labels: HashMap<String, String>,
}

pub fn init_logging() -> LoggingTask {
    let config: LoggingConfig = from_env_or_panic("");

    let colors = std::env::var("COLORS").as_deref() != Ok("0");

    let stderr = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(colors)
        .pretty();

    let (loki_layer, loki) = config
        .loki_url
        .map(|url| init_loki(config.log_labels, url))
        .unzip();

    tracing_subscriber::registry()
        .with(stderr)
        .with(loki_layer)
        .with(tracing_subscriber::EnvFilter::from_env("CAMSYNC_LOG"))
        .with(tracing_error::ErrorLayer::default())
        .init();

    init_panic_hook();

    LoggingTask { loki }
}

fn init_loki(mut labels: HashMap<String, String>, url: Url) -> (tracing_loki::Layer, LokiTask) {
    labels.extend(
        GLOBAL_LABELS
            .iter()
            .chain(&[("source", "camsync-tg")])
            .map(|&(key, value)| (key.to_owned(), value.to_owned())),
    );

    let mut builder = tracing_loki::builder();

    for (key, value) in labels {
        builder = builder
            .label(key, value)
            .unwrap_or_else(|err| panic!("BUG: invalid Loki label: {err:#?}"));
    }

    let (layer, controller, task) = builder
        .build_controller_url(url)
        .unwrap_or_else(|err| panic!("BUG: failed to create the Loki layer: {err:#?}"));

    (
        layer,
        LokiTask {
            task: tokio::spawn(task),
            controller,
        },
    )
}

/// Panics in the background tasks would otherwise be visible only in stderr
fn init_panic_hook() {
    let default_hook = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |panic_info| {
        // The default hook goes first. If the panic happened inside of the
        // logging itself, this is the only place where it shows up.
        default_hook(panic_info);

        let payload = panic_info.payload();
        let message = payload
            .downcast_ref::<String>()
            .map(String::as_str)
            .or_else(|| payload.downcast_ref::<&str>().copied())
            .unwrap_or("<non-string panic payload>");

        error!(
            target: "panic",
            thread = std::thread::current().name(),
            location = panic_info.location().map(ToString::to_string),
            span_trace = %tracing_error::SpanTrace::capture(),
            backtrace = %std::backtrace::Backtrace::capture(),
            "{message}"
        );
    }));
}
