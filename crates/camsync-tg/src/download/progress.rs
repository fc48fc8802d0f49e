use crate::util::display::{human_size, human_throughput};
use crate::Result;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Progress {
    pub(crate) downloaded: u64,

    /// `None` if the server didn't send `Content-Length`
    pub(crate) total: Option<u64>,
    pub(crate) elapsed: Duration,
}

impl Progress {
    pub(crate) fn percent(&self) -> Option<f64> {
        let total = self.total.filter(|&total| total > 0)?;
        Some(self.downloaded as f64 * 100.0 / total as f64)
    }

    /// Average bytes per second since the start of the download
    pub(crate) fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.downloaded as f64 / secs
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let downloaded = human_size(self.downloaded);
        let throughput = human_throughput(self.throughput());

        match (self.percent(), self.total) {
            (Some(percent), Some(total)) => write!(
                f,
                "{percent:.1}% ({downloaded} of {}) at {throughput}",
                human_size(total)
            ),
            _ => write!(f, "{downloaded} at {throughput}"),
        }
    }
}

/// Destination of progress reports. Reporting is best-effort, so errors
/// returned from here never abort the download.
#[async_trait]
pub(crate) trait ProgressSink: Send + Sync {
    async fn report(&self, progress: &Progress) -> Result;
}

/// Decides when it's time for the next progress report
pub(crate) struct ProgressTicker {
    cadence: Duration,
    last_report: Duration,
}

impl ProgressTicker {
    pub(crate) fn new(cadence: Duration) -> Self {
        Self {
            cadence,
            last_report: Duration::ZERO,
        }
    }

    /// Accepts the time elapsed since the start of the download and returns
    /// `true` if a report is due.
    pub(crate) fn tick(&mut self, elapsed: Duration) -> bool {
        if elapsed.saturating_sub(self.last_report) < self.cadence {
            return false;
        }
        self.last_report = elapsed;
        true
    }
}
