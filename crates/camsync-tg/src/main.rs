use camsync_tg::tracing_err;
use futures::prelude::*;
use std::panic::AssertUnwindSafe;
use std::process::ExitCode;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    if dotenvy::dotenv().is_err() {
        eprintln!("No .env file found, using the process environment only");
    }

    let logging_task = camsync_tg::init_logging();

    camsync_tg::init_metrics();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting camsync-tg");

    let service = AssertUnwindSafe(async {
        camsync_tg::run(camsync_tg::Config::load_or_panic())
            .await
            .map(|()| ExitCode::SUCCESS)
            .unwrap_or_else(|err| {
                error!(err = tracing_err(&err), "Service failed, exiting...");
                ExitCode::FAILURE
            })
    })
    .catch_unwind()
    .unwrap_or_else(|_| {
        error!("Service panicked, exiting...");
        ExitCode::FAILURE
    });

    // The dispatcher handles Ctrl+C itself, but the service is usually stopped
    // with SIGTERM by the process supervisor on the device
    let exit_code = tokio::select! {
        exit_code = service => exit_code,
        () = terminate_signal() => ExitCode::SUCCESS,
    };

    logging_task.shutdown().await;

    exit_code
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
            info!("SIGTERM received, exiting...");
        }
        Err(err) => {
            warn!(err = tracing_err(&err), "Failed to listen for SIGTERM");
            future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    future::pending::<()>().await;
}
