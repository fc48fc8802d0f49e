//! Strictly FIFO queue of jobs drained by a single consumer.
//!
//! Producers only ever enqueue and never block. The consumer takes one job at a
//! time and drives it to completion before taking the next one. The job that
//! is being processed can be asked to cancel, but the cancellation is
//! cooperative: the consumer checks [`JobQueue::is_cancel_requested`] at its
//! own checkpoints.

use chrono::prelude::*;
use parking_lot::Mutex as SyncMutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Job<T> {
    pub(crate) payload: T,
    pub(crate) queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobState {
    Queued,
    Processing {
        started_at: DateTime<Utc>,
        cancel_requested: bool,
    },
    Done,
}

#[derive(Debug, Clone)]
pub(crate) struct CurrentJob<T> {
    pub(crate) job: Job<T>,
    pub(crate) state: JobState,
}

/// Consistent view of the queue at some moment in time
#[derive(Debug, Clone)]
pub(crate) struct QueueSnapshot<T> {
    pub(crate) pending: Vec<Job<T>>,
    pub(crate) current: Option<CurrentJob<T>>,
}

pub(crate) struct JobQueue<T> {
    state: SyncMutex<QueueState<T>>,
    wake: Notify,
}

struct QueueState<T> {
    pending: VecDeque<Job<T>>,
    current: Option<CurrentJob<T>>,
}

impl<T: Clone + PartialEq> JobQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: SyncMutex::new(QueueState {
                pending: VecDeque::new(),
                current: None,
            }),
            wake: Notify::new(),
        }
    }

    /// Appends the payload to the end of the queue unless the same payload is
    /// already waiting there. Returns `false` for such a duplicate.
    pub(crate) fn enqueue(&self, payload: T) -> bool {
        {
            let mut state = self.state.lock();

            if state.pending.iter().any(|job| job.payload == payload) {
                return false;
            }

            state.pending.push_back(Job {
                payload,
                queued_at: Utc::now(),
            });
        }

        self.wake.notify_one();
        true
    }

    /// Takes the oldest job out of the queue and makes it the current one.
    /// Returns `None` if there is nothing to take.
    pub(crate) fn dequeue(&self) -> Option<Job<T>> {
        let mut state = self.state.lock();
        let job = state.pending.pop_front()?;
        state.current = Some(CurrentJob {
            job: job.clone(),
            state: JobState::Queued,
        });
        Some(job)
    }

    /// Waits until there is a job to take and takes it.
    pub(crate) async fn next(&self) -> Job<T> {
        loop {
            if let Some(job) = self.dequeue() {
                return job;
            }
            // `Notify` stores a permit if there is no waiter, so an enqueue
            // that happens between `dequeue` and this line isn't lost.
            self.wake.notified().await;
        }
    }

    pub(crate) fn set_processing(&self, processing: bool) {
        let mut state = self.state.lock();
        let Some(current) = &mut state.current else {
            return;
        };

        if processing {
            current.state = JobState::Processing {
                started_at: Utc::now(),
                cancel_requested: false,
            };
        } else {
            state.current = None;
        }
    }

    pub(crate) fn is_processing(&self) -> bool {
        matches!(
            self.state.lock().current,
            Some(CurrentJob {
                state: JobState::Processing { .. },
                ..
            })
        )
    }

    /// Flags the job that is being processed for cancellation. Returns `false`
    /// if there is no such job.
    pub(crate) fn request_cancel(&self) -> bool {
        let mut state = self.state.lock();
        match &mut state.current {
            Some(CurrentJob {
                state: JobState::Processing {
                    cancel_requested, ..
                },
                ..
            }) => {
                *cancel_requested = true;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn is_cancel_requested(&self) -> bool {
        matches!(
            self.state.lock().current,
            Some(CurrentJob {
                state: JobState::Processing {
                    cancel_requested: true,
                    ..
                },
                ..
            })
        )
    }

    /// Last cancellation checkpoint. Atomically moves the current job to
    /// [`JobState::Done`] unless the cancellation was requested. Once this
    /// returns `true`, [`Self::request_cancel`] has nothing to cancel.
    pub(crate) fn try_complete(&self) -> bool {
        let mut state = self.state.lock();
        let Some(current) = &mut state.current else {
            return false;
        };

        match current.state {
            JobState::Processing {
                cancel_requested: false,
                ..
            } => {
                current.state = JobState::Done;
                true
            }
            JobState::Processing {
                cancel_requested: true,
                ..
            }
            | JobState::Queued
            | JobState::Done => false,
        }
    }

    /// Removes the payload from the pending jobs. The current job is never
    /// affected.
    pub(crate) fn remove(&self, payload: &T) -> bool {
        let mut state = self.state.lock();
        let len_before = state.pending.len();
        state.pending.retain(|job| job.payload != *payload);
        state.pending.len() != len_before
    }

    pub(crate) fn current_payload(&self) -> Option<T> {
        self.state
            .lock()
            .current
            .as_ref()
            .map(|current| current.job.payload.clone())
    }

    pub(crate) fn snapshot(&self) -> QueueSnapshot<T> {
        let state = self.state.lock();
        QueueSnapshot {
            pending: state.pending.iter().cloned().collect(),
            current: state.current.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    fn queue() -> JobQueue<PathBuf> {
        JobQueue::new()
    }

    #[test]
    fn duplicate_pending_payload_is_stored_once() {
        let queue = queue();
        assert!(queue.enqueue("a.mkv".into()));
        assert!(!queue.enqueue("a.mkv".into()));
        assert!(queue.enqueue("b.mkv".into()));

        assert_eq!(queue.snapshot().pending.len(), 2);

        // Once dequeued, the same path may be queued again
        assert_eq!(queue.dequeue().unwrap().payload, PathBuf::from("a.mkv"));
        assert!(queue.enqueue("a.mkv".into()));
    }

    #[test]
    fn dequeue_is_fifo() {
        let queue = queue();
        for name in ["1.mkv", "2.mkv", "3.mkv"] {
            queue.enqueue(name.into());
        }
        let order: Vec<_> = std::iter::from_fn(|| queue.dequeue())
            .map(|job| job.payload)
            .collect();

        assert_eq!(
            order,
            ["1.mkv", "2.mkv", "3.mkv"].map(PathBuf::from).to_vec()
        );
    }

    #[test]
    fn dequeue_on_empty_queue_is_idempotent() {
        let queue = queue();
        for _ in 0..3 {
            assert!(queue.dequeue().is_none());
        }
        assert!(queue.snapshot().current.is_none());
    }

    #[test]
    fn processing_lifecycle() {
        let queue = queue();
        queue.enqueue("a.mkv".into());

        assert!(!queue.is_processing());
        assert!(!queue.request_cancel(), "nothing to cancel yet");

        queue.dequeue().unwrap();
        assert_matches!(
            queue.snapshot().current,
            Some(CurrentJob {
                state: JobState::Queued,
                ..
            })
        );

        queue.set_processing(true);
        assert!(queue.is_processing());
        assert!(!queue.is_cancel_requested());

        assert!(queue.try_complete());
        assert_matches!(
            queue.snapshot().current,
            Some(CurrentJob {
                state: JobState::Done,
                ..
            })
        );
        assert!(!queue.request_cancel(), "completed job can't be cancelled");

        queue.set_processing(false);
        assert!(!queue.is_processing());
        assert!(queue.snapshot().current.is_none());
    }

    #[test]
    fn cancel_prevents_completion() {
        let queue = queue();
        queue.enqueue("a.mkv".into());
        queue.dequeue().unwrap();
        queue.set_processing(true);

        assert!(queue.request_cancel());
        assert!(queue.is_cancel_requested());
        assert!(!queue.try_complete());

        queue.set_processing(false);
        assert!(!queue.is_cancel_requested());
    }

    #[test]
    fn remove_only_affects_pending() {
        let queue = queue();
        queue.enqueue("a.mkv".into());
        queue.enqueue("b.mkv".into());
        queue.dequeue().unwrap();

        assert!(!queue.remove(&"a.mkv".into()));
        assert!(queue.remove(&"b.mkv".into()));
        assert_eq!(queue.current_payload(), Some("a.mkv".into()));
        assert!(queue.snapshot().pending.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn next_waits_for_enqueue() {
        let queue = Arc::new(queue());

        let consumer = tokio::spawn({
            let queue = queue.clone();
            async move { queue.next().await.payload }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!consumer.is_finished());

        queue.enqueue("late.mkv".into());

        let payload = tokio::time::timeout(Duration::from_secs(5), consumer)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(payload, PathBuf::from("late.mkv"));
    }
}
