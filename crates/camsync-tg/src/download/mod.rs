//! Streaming download of a URL into a local file with periodic progress
//! reports and cooperative cancellation.

mod progress;

use crate::prelude::*;
use crate::util::display::human_size;
use crate::util::units::{KB, MB};
use crate::{err, http, Result};
use futures::prelude::*;
use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use url::Url;

pub(crate) use progress::{Progress, ProgressSink, ProgressTicker};

#[serde_as]
#[derive(Deserialize)]
pub(crate) struct Config {
    /// Seconds between progress reports
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_report_interval")]
    pub(crate) report_interval: Duration,

    /// Where the files are downloaded before they are moved to the watched
    /// directory. System temp directory by default.
    pub(crate) temp_dir: Option<PathBuf>,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_stall_timeout")]
    pub(crate) stall_timeout: Duration,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_min_timeout")]
    pub(crate) min_timeout: Duration,

    /// Bytes per second. Slower downloads time out.
    #[serde(default = "default_min_throughput")]
    pub(crate) min_throughput: u64,
}

fn default_report_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_stall_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_min_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_min_throughput() -> u64 {
    100 * KB
}

impl Config {
    pub(crate) fn limits(&self) -> Limits {
        Limits {
            stall_timeout: self.stall_timeout,
            min_timeout: self.min_timeout,
            min_throughput: self.min_throughput,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    /// Max time to wait for a single chunk of the body
    pub(crate) stall_timeout: Duration,

    /// Lower bound of the overall deadline
    pub(crate) min_timeout: Duration,

    /// Scales the overall deadline with the size of the body
    pub(crate) min_throughput: u64,
}

impl Limits {
    fn deadline(&self, total: Option<u64>) -> Duration {
        let Some(total) = total else {
            return self.min_timeout;
        };
        let scaled = Duration::from_secs(total / self.min_throughput.max(1));
        scaled.max(self.min_timeout)
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum DownloadError {
    #[error("Server responded with unexpected status {status}")]
    BadStatus { status: reqwest::StatusCode },

    #[error("Download timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("Connection to the server failed")]
    Connection { source: reqwest_middleware::Error },

    #[error("Failed to write the downloaded data to disk")]
    Write { source: std::io::Error },

    #[error("Download was cancelled")]
    Cancelled,
}

pub(crate) struct DownloadOptions<'a> {
    pub(crate) url: &'a Url,
    pub(crate) dest: &'a Path,

    /// Min time between progress reports
    pub(crate) cadence: Duration,
    pub(crate) sink: &'a dyn ProgressSink,

    /// Polled once per chunk
    pub(crate) is_cancelled: &'a (dyn Fn() -> bool + Send + Sync),

    /// Remove the partial file if the download fails. The file is always
    /// removed on cancellation regardless of this flag.
    pub(crate) cleanup_on_error: bool,
    pub(crate) limits: Limits,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Downloaded {
    pub(crate) size: u64,
    pub(crate) elapsed: Duration,
}

#[instrument(skip_all, fields(url = %opts.url, dest = %opts.dest.display()))]
pub(crate) async fn download(http: &http::Client, opts: DownloadOptions<'_>) -> Result<Downloaded> {
    let result = download_imp(http, &opts).await;

    if let Err(err) = &result {
        if err.is_cancelled() || opts.cleanup_on_error {
            remove_partial_file(opts.dest).await;
        }
    }

    result
}

async fn remove_partial_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed partially downloaded file"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(
            err = tracing_err(&err),
            "Failed to remove partially downloaded file"
        ),
    }
}

async fn download_imp(http: &http::Client, opts: &DownloadOptions<'_>) -> Result<Downloaded> {
    let start = tokio::time::Instant::now();

    let response = http
        .get(opts.url.clone())
        .send()
        .await
        .map_err(|source| err!(DownloadError::Connection { source }))?;

    let status = response.status();
    if status != reqwest::StatusCode::OK {
        return Err(err!(DownloadError::BadStatus { status }));
    }

    let total = response.content_length();
    let deadline = opts.limits.deadline(total);

    info!(
        total = %total.map(human_size).unwrap_or_else(|| "unknown".to_owned()),
        deadline = tracing_duration(deadline),
        "Starting download"
    );

    let file = tokio::fs::File::create(opts.dest)
        .await
        .map_err(|source| err!(DownloadError::Write { source }))?;

    let mut file = tokio::io::BufWriter::with_capacity(MB as usize, file);

    let mut stream = response.bytes_stream();
    let mut ticker = ProgressTicker::new(opts.cadence);
    let mut downloaded = 0;

    loop {
        if (opts.is_cancelled)() {
            info!(downloaded = %human_size(downloaded), "Download cancelled");
            return Err(err!(DownloadError::Cancelled));
        }

        let remaining = deadline.saturating_sub(start.elapsed());
        let wait = opts.limits.stall_timeout.min(remaining);

        let chunk = tokio::time::timeout(wait, stream.next())
            .await
            .map_err(|_| {
                err!(DownloadError::Timeout {
                    after: start.elapsed()
                })
            })?;

        let Some(chunk) = chunk else {
            break;
        };

        let chunk = chunk.map_err(|source| {
            err!(DownloadError::Connection {
                source: reqwest_middleware::Error::Reqwest(source)
            })
        })?;

        file.write_all(&chunk)
            .await
            .map_err(|source| err!(DownloadError::Write { source }))?;

        downloaded += chunk.len() as u64;

        let elapsed = start.elapsed();
        if ticker.tick(elapsed) {
            report(
                opts.sink,
                Progress {
                    downloaded,
                    total,
                    elapsed,
                },
            )
            .await;
        }
    }

    file.flush()
        .await
        .map_err(|source| err!(DownloadError::Write { source }))?;

    let elapsed = start.elapsed();

    // The final report always goes out, so that the recipient sees 100%
    report(
        opts.sink,
        Progress {
            downloaded,
            total: total.or(Some(downloaded)),
            elapsed,
        },
    )
    .await;

    info!(
        size = %human_size(downloaded),
        elapsed = tracing_duration(elapsed),
        "Download finished"
    );

    Ok(Downloaded {
        size: downloaded,
        elapsed,
    })
}

async fn report(sink: &dyn ProgressSink, progress: Progress) {
    if let Err(err) = sink.report(&progress).await {
        warn!(err = tracing_err(&err), %progress, "Failed to report download progress");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_server::{self, Response};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingSink {
        reports: SyncMutex<Vec<Progress>>,
    }

    #[async_trait]
    impl ProgressSink for RecordingSink {
        async fn report(&self, progress: &Progress) -> Result {
            self.reports.lock().push(*progress);
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl ProgressSink for FailingSink {
        async fn report(&self, _: &Progress) -> Result {
            Err(crate::fatal!("the chat is gone"))
        }
    }

    fn limits() -> Limits {
        Limits {
            stall_timeout: Duration::from_secs(10),
            min_timeout: Duration::from_secs(30),
            min_throughput: KB,
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        dest: PathBuf,
        http: http::Client,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("video.mkv");
        Fixture {
            _dir: dir,
            dest,
            http: http::create_single_attempt_client(),
        }
    }

    impl Fixture {
        async fn download(&self, url: &Url, cleanup_on_error: bool) -> Result<Downloaded> {
            download(
                &self.http,
                DownloadOptions {
                    url,
                    dest: &self.dest,
                    cadence: Duration::from_secs(1),
                    sink: &RecordingSink::default(),
                    is_cancelled: &|| false,
                    cleanup_on_error,
                    limits: limits(),
                },
            )
            .await
        }
    }

    fn kind(err: &crate::Error) -> &DownloadError {
        assert_matches!(err.kind(), crate::error::ErrorKind::Download { source } => source)
    }

    #[test]
    fn deadline_scales_with_size() {
        let limits = Limits {
            stall_timeout: Duration::from_secs(60),
            min_timeout: Duration::from_secs(300),
            min_throughput: 100 * KB,
        };
        assert_eq!(limits.deadline(None), Duration::from_secs(300));
        assert_eq!(limits.deadline(Some(MB)), Duration::from_secs(300));
        assert_eq!(limits.deadline(Some(1000 * MB)), Duration::from_secs(10240));
    }

    #[test_log::test(tokio::test)]
    async fn downloads_whole_body() {
        let chunks = vec![vec![1_u8; 1000], vec![2; 1000], vec![3; 500]];
        let server = test_server::spawn(move |_| {
            Response::chunked(chunks.clone(), Duration::from_millis(10))
        })
        .await;

        let fixture = fixture();
        let sink = RecordingSink::default();

        let downloaded = download(
            &fixture.http,
            DownloadOptions {
                url: &server.url("/video.mkv"),
                dest: &fixture.dest,
                cadence: Duration::from_secs(3600),
                sink: &sink,
                is_cancelled: &|| false,
                cleanup_on_error: true,
                limits: limits(),
            },
        )
        .await
        .unwrap();

        assert_eq!(downloaded.size, 2500);

        let content = std::fs::read(&fixture.dest).unwrap();
        assert_eq!(content.len(), 2500);
        assert_eq!(content[0], 1);
        assert_eq!(content[2499], 3);

        let reports = sink.reports.lock();
        assert_eq!(reports.len(), 1, "only the final report: {reports:?}");
        assert_eq!(reports[0].percent(), Some(100.0));
    }

    #[test_log::test(tokio::test)]
    async fn report_failures_are_swallowed() {
        let server = test_server::spawn(|_| Response::bytes(vec![0; 100])).await;
        let fixture = fixture();

        let downloaded = download(
            &fixture.http,
            DownloadOptions {
                url: &server.url("/"),
                dest: &fixture.dest,
                cadence: Duration::ZERO,
                sink: &FailingSink,
                is_cancelled: &|| false,
                cleanup_on_error: true,
                limits: limits(),
            },
        )
        .await
        .unwrap();

        assert_eq!(downloaded.size, 100);
    }

    #[test_log::test(tokio::test)]
    async fn non_ok_status_is_an_error() {
        let server = test_server::spawn(|_| Response::status(404, "no such file")).await;
        let fixture = fixture();

        let err = download(
            &fixture.http,
            DownloadOptions {
                url: &server.url("/missing.mkv"),
                dest: &fixture.dest,
                cadence: Duration::from_secs(1),
                sink: &RecordingSink::default(),
                is_cancelled: &|| false,
                cleanup_on_error: true,
                limits: limits(),
            },
        )
        .await
        .unwrap_err();

        assert_matches!(
            kind(&err),
            DownloadError::BadStatus { status } if status.as_u16() == 404
        );
        assert!(!err.is_cancelled());
        assert!(!fixture.dest.exists());
    }

    #[test_log::test(tokio::test)]
    async fn cancellation_removes_partial_file() {
        let chunks = vec![vec![0_u8; 1000]; 10];
        let server = test_server::spawn(move |_| {
            Response::chunked(chunks.clone(), Duration::from_millis(20))
        })
        .await;

        let fixture = fixture();
        let checks = AtomicUsize::new(0);

        let err = download(
            &fixture.http,
            DownloadOptions {
                url: &server.url("/video.mkv"),
                dest: &fixture.dest,
                cadence: Duration::from_secs(1),
                sink: &RecordingSink::default(),
                // Cancel after a couple of chunks
                is_cancelled: &|| checks.fetch_add(1, Ordering::SeqCst) >= 2,
                cleanup_on_error: false,
                limits: limits(),
            },
        )
        .await
        .unwrap_err();

        assert!(err.is_cancelled(), "{err:?}");
        assert_matches!(kind(&err), DownloadError::Cancelled);
        assert!(!fixture.dest.exists());
    }

    #[test_log::test(tokio::test)]
    async fn stalled_body_times_out() {
        let server = test_server::spawn(|_| {
            Response::chunked(vec![vec![0; 10], vec![0; 10]], Duration::from_secs(5))
        })
        .await;

        let fixture = fixture();

        let err = download(
            &fixture.http,
            DownloadOptions {
                url: &server.url("/video.mkv"),
                dest: &fixture.dest,
                cadence: Duration::from_secs(1),
                sink: &RecordingSink::default(),
                is_cancelled: &|| false,
                cleanup_on_error: true,
                limits: Limits {
                    stall_timeout: Duration::from_millis(100),
                    ..limits()
                },
            },
        )
        .await
        .unwrap_err();

        assert_matches!(kind(&err), DownloadError::Timeout { .. });
        assert!(!err.is_cancelled());
        assert!(!fixture.dest.exists());
    }

    #[test_log::test(tokio::test)]
    async fn server_errors_are_not_retried() {
        let server = test_server::spawn(|_| Response::status(503, "overloaded")).await;
        let fixture = fixture();

        let err = fixture
            .download(&server.url("/video.mkv"), true)
            .await
            .unwrap_err();

        assert_matches!(
            kind(&err),
            DownloadError::BadStatus { status } if status.as_u16() == 503
        );
        assert_eq!(server.requests().len(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn truncated_body_removes_partial_file() {
        let server = test_server::spawn(|_| {
            Response::bytes(vec![7; 100]).with_declared_len(1000)
        })
        .await;
        let fixture = fixture();

        let err = fixture
            .download(&server.url("/video.mkv"), true)
            .await
            .unwrap_err();

        assert_matches!(kind(&err), DownloadError::Connection { .. });
        assert!(!err.is_cancelled());
        assert!(!fixture.dest.exists());
    }

    #[test_log::test(tokio::test)]
    async fn refused_connection() {
        // Nothing listens on the port once the listener is dropped
        let addr = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        let url = Url::parse(&format!("http://{addr}/video.mkv")).unwrap();

        let fixture = fixture();

        let err = fixture.download(&url, true).await.unwrap_err();

        assert_matches!(kind(&err), DownloadError::Connection { .. });
        assert!(!err.is_cancelled());
        assert!(!fixture.dest.exists());
    }
}
