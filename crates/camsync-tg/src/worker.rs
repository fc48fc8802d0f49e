//! The single consumer of the upload queue.
//!
//! For every file it makes the companion app upload it, finds the uploaded
//! record in the catalog, shares it and tells the operator about the outcome.
//! Files are processed strictly one at a time, because the companion app is a
//! single stateful instance.

use crate::device::CompanionApp;
use crate::matching::{self, Confidence, MatchQuery, TimeWindow};
use crate::notification::{Event, Notifications, ShareLink};
use crate::photos::{Catalog, MediaId, MediaRecord};
use crate::prelude::*;
use crate::queue::{Job, JobQueue};
use crate::util::units::MB;
use crate::{Error, Result};
use parking_lot::Mutex as SyncMutex;
use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[serde_as]
#[derive(Deserialize, Clone)]
pub(crate) struct Config {
    /// Time for the writer of the file to finish before it's touched
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_file_settle")]
    pub(crate) file_settle: Duration,

    /// Time for the companion app to start syncing after it's opened
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_open_settle")]
    pub(crate) open_settle: Duration,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_poll_interval")]
    pub(crate) poll_interval: Duration,

    /// Min time between the notifications about the upload still going on
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_progress_interval")]
    pub(crate) progress_interval: Duration,

    /// Number of the most recent catalog records to search through
    #[serde(default = "default_page_size")]
    pub(crate) page_size: u32,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default)]
    pub(crate) window_before: Duration,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_window_after")]
    pub(crate) window_after: Duration,

    /// Matches by timing alone may pick up a wrong video, so by default the
    /// file is kept for the operator to verify the link.
    #[serde(default)]
    pub(crate) delete_after_timing_match: bool,
}

fn default_file_settle() -> Duration {
    Duration::from_secs(3)
}

fn default_open_settle() -> Duration {
    Duration::from_secs(5)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_progress_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_page_size() -> u32 {
    50
}

fn default_window_after() -> Duration {
    Duration::from_secs(60 * 60)
}

impl Config {
    fn time_window(&self) -> TimeWindow {
        let to_chrono = |duration: Duration| {
            // Clamped to keep the date arithmetic far from overflows
            let secs = duration.as_secs().min(u64::from(u32::MAX));
            chrono::Duration::seconds(secs as i64)
        };
        TimeWindow {
            before: to_chrono(self.window_before),
            after: to_chrono(self.window_after),
        }
    }
}

/// Bigger files take longer to upload
pub(crate) fn max_upload_wait(size: u64) -> Duration {
    let minutes = match size {
        _ if size < 50 * MB => 2,
        _ if size < 200 * MB => 5,
        _ if size < 500 * MB => 10,
        _ if size < 1000 * MB => 15,
        _ => 20,
    };
    Duration::from_secs(minutes * 60)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub(crate) enum Outcome {
    Succeeded,
    TimedOut,
    NotFound,
    Cancelled,
    Failed,
}

pub(crate) struct Worker {
    pub(crate) queue: Arc<JobQueue<PathBuf>>,
    pub(crate) catalog: Arc<dyn Catalog>,
    pub(crate) app: Arc<dyn CompanionApp>,
    pub(crate) notifications: Notifications,
    pub(crate) cfg: Config,
    pub(crate) claimed: ClaimedRecords,
}

/// Way more than a single catalog listing ever shows
const MAX_CLAIMED_RECORDS: usize = 1000;

/// Records that were already shared for the files processed earlier. They
/// stay in the catalog listings for a long time, and none of them may be
/// attributed to another file.
#[derive(Default)]
pub(crate) struct ClaimedRecords {
    ids: SyncMutex<VecDeque<MediaId>>,
}

impl ClaimedRecords {
    fn claim(&self, id: MediaId) {
        let mut ids = self.ids.lock();
        if ids.len() >= MAX_CLAIMED_RECORDS {
            ids.pop_front();
        }
        ids.push_back(id);
    }

    fn retain_unclaimed(&self, records: &mut Vec<MediaRecord>) {
        let ids = self.ids.lock();
        records.retain(|record| !ids.contains(&record.id));
    }
}

/// A file that was found in the catalog
struct Found {
    record: MediaRecord,
    confidence: Confidence,
}

enum Wait {
    Found(Found),
    Ended(Outcome),
}

impl Worker {
    /// Never returns. Errors are reported per file and don't stop the loop.
    pub(crate) async fn run(self) {
        info!("Upload worker started");
        loop {
            let job = self.queue.next().await;
            self.queue.set_processing(true);
            self.process(job).await;
            self.queue.set_processing(false);
        }
    }

    pub(crate) async fn process(&self, job: Job<PathBuf>) -> Outcome {
        let file = job.payload.display_name();
        let span = info_span!("process_file", %file);

        async {
            info!("Processing file");

            let (result, duration) = self.try_process(&job, &file).with_duration().await;

            let outcome = match result {
                Ok(outcome) => outcome,
                Err(err) => self.fail(&file, err).await,
            };

            let outcome_label: &'static str = outcome.into();

            metrics::increment_counter!("files_processed_total", "outcome" => outcome_label);
            metrics::histogram!(
                "file_processing_duration_seconds",
                duration.as_secs_f64(),
                "outcome" => outcome_label,
            );

            info!(
                outcome = outcome_label,
                duration = tracing_duration(duration),
                "Finished processing file"
            );

            outcome
        }
        .instrument(span)
        .await
    }

    async fn try_process(&self, job: &Job<PathBuf>, file: &str) -> Result<Outcome> {
        let path = &job.payload;

        tokio::time::sleep(self.cfg.file_settle).await;

        let size = tokio::fs::metadata(path)
            .await
            .fatal_ctx(|| format!("The file `{file}` is not accessible anymore"))?
            .len();

        self.emit(Event::Started {
            file: file.to_owned(),
            size,
        })
        .await;

        if let Err(err) = self.app.open().await {
            warn!(
                err = tracing_err(&err),
                "Failed to open the app, hoping it's already running"
            );
        }

        tokio::time::sleep(self.cfg.open_settle).await;

        if self.queue.is_cancel_requested() {
            return Ok(self.cancel(path, file).await);
        }

        // Timing can't tell the upload apart from the older records in the
        // first listing, so only the name rules apply to it
        let query = MatchQuery {
            local_name: file,
            queued_at: job.queued_at,
            window: self.cfg.time_window(),
            baseline: None,
        };

        let records = self.list_candidates().await?;

        let found = match find(&query, &records) {
            Some(found) => found,
            None => {
                let baseline = records.into_iter().map(|record| record.id).collect();
                match self.wait_for_upload(path, &query, baseline, size).await {
                    Wait::Found(found) => found,
                    Wait::Ended(outcome) => return Ok(outcome),
                }
            }
        };

        self.finish(path, file, found).await
    }

    /// Polls the catalog until the file appears there. Records listed in the
    /// `baseline` were uploaded before the file.
    async fn wait_for_upload(
        &self,
        path: &Path,
        query: &MatchQuery<'_>,
        baseline: HashSet<MediaId>,
        size: u64,
    ) -> Wait {
        let query = MatchQuery {
            baseline: Some(&baseline),
            ..*query
        };
        let file = query.local_name;
        let max_wait = max_upload_wait(size);
        let started = Instant::now();
        let mut last_progress = started;
        let mut unexpected_upload = false;

        info!(
            max_wait = tracing_duration(max_wait),
            "Not uploaded yet, waiting for the upload"
        );

        loop {
            tokio::time::sleep(self.cfg.poll_interval).await;

            if self.queue.is_cancel_requested() {
                return Wait::Ended(self.cancel(path, file).await);
            }

            let waited = started.elapsed();

            match self.list_candidates().await {
                Ok(records) => {
                    if let Some(found) = find(&query, &records) {
                        info!(waited = tracing_duration(waited), "Upload found");
                        return Wait::Found(found);
                    }

                    let unexpected: Vec<_> = records
                        .iter()
                        .filter(|record| record.is_video() && !baseline.contains(&record.id))
                        .map(|record| record.filename.as_str())
                        .collect();

                    if !unexpected.is_empty() {
                        debug!(?unexpected, "New uploads don't match the file");
                        unexpected_upload = true;
                    }
                }
                // The catalog is polled again soon, so a single failure
                // doesn't end the waiting
                Err(err) => warn!(err = tracing_err(&err), "Failed to poll the catalog"),
            }

            if waited >= max_wait {
                let file = file.to_owned();
                let (event, outcome) = if unexpected_upload {
                    (Event::NotFound { file, waited }, Outcome::NotFound)
                } else {
                    (Event::TimedOut { file, waited }, Outcome::TimedOut)
                };

                warn!(outcome = <&str>::from(outcome), "Gave up waiting for the upload");

                self.stop_app().await;
                self.emit(event).await;

                return Wait::Ended(outcome);
            }

            if last_progress.elapsed() >= self.cfg.progress_interval {
                last_progress = Instant::now();
                self.emit(Event::Progress {
                    file: file.to_owned(),
                    waited,
                    max_wait,
                })
                .await;
            }
        }
    }

    async fn finish(&self, path: &Path, file: &str, found: Found) -> Result<Outcome> {
        let Found { record, confidence } = found;

        info!(
            remote_name = %record.filename,
            %confidence,
            "Matched the file with an uploaded record"
        );

        self.emit(Event::Matched {
            file: file.to_owned(),
            remote_name: record.filename.clone(),
            confidence,
        })
        .await;

        let link = match self.catalog.create_share_link(&[record.id.clone()]).await {
            Ok(url) => ShareLink::Album(url),
            Err(err) => {
                warn!(
                    err = tracing_err(&err),
                    "Failed to create a share link, falling back to the direct link"
                );
                let Some(url) = record.fallback_url() else {
                    return Err(err);
                };
                ShareLink::Fallback(url.clone())
            }
        };

        if !self.queue.try_complete() {
            return Ok(self.cancel(path, file).await);
        }

        self.claimed.claim(record.id);

        self.stop_app().await;

        let deleted = if confidence.is_low() && !self.cfg.delete_after_timing_match {
            info!("Keeping the file, because the match is by timing only");
            false
        } else {
            remove_file(path).await
        };

        info!(link = %link.url(), deleted, "File was shared");

        self.emit(Event::Succeeded {
            file: file.to_owned(),
            link,
            confidence,
            deleted,
        })
        .await;

        Ok(Outcome::Succeeded)
    }

    async fn cancel(&self, path: &Path, file: &str) -> Outcome {
        info!("Processing cancelled");

        self.stop_app().await;
        remove_file(path).await;

        self.emit(Event::Cancelled {
            file: file.to_owned(),
        })
        .await;

        Outcome::Cancelled
    }

    async fn fail(&self, file: &str, err: Error) -> Outcome {
        error!(err = tracing_err(&err), "Processing failed");

        self.stop_app().await;

        self.emit(Event::Failed {
            file: file.to_owned(),
            reason: err.kind().display_chain().to_string(),
            error_id: err.id().to_owned(),
        })
        .await;

        Outcome::Failed
    }

    async fn list_candidates(&self) -> Result<Vec<MediaRecord>> {
        let mut records = self.catalog.list_recent(self.cfg.page_size).await?;
        self.claimed.retain_unclaimed(&mut records);
        Ok(records)
    }

    async fn stop_app(&self) {
        if let Err(err) = self.app.force_stop().await {
            warn!(err = tracing_err(&err), "Failed to force-stop the app");
        }
    }

    async fn emit(&self, event: Event) {
        self.notifications.emit(event).await;
    }
}

fn find(query: &MatchQuery<'_>, records: &[MediaRecord]) -> Option<Found> {
    matching::find_match(query, records).map(|found| Found {
        record: found.record.clone(),
        confidence: found.confidence,
    })
}

/// Returns `true` if the file was deleted
async fn remove_file(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            info!("Deleted the original file");
            true
        }
        Err(err) => {
            warn!(err = tracing_err(&err), "Failed to delete the original file");
            false
        }
    }
}
