//! Bounded concurrent execution of uploads and the handles to await their results.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::blob::Blob;
use crate::collector::{OutcomeStatus, UploadOutcome};
use crate::upload::{Error, UploadOutput, Uploader};

/// What an upload task resolves to.
#[derive(Debug)]
struct Attempt {
    result: Result<UploadOutput, Error>,
    elapsed: Duration,
}

/// Runs uploads with at most `size` of them in flight at a time.
///
/// A pool is created per iteration and consumed by [`shutdown`](Self::shutdown) at its end.
#[derive(Debug)]
pub struct WorkerPool {
    uploader: Uploader,
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    tasks: Vec<AbortHandle>,
    size: usize,
}

impl WorkerPool {
    /// Creates a pool running up to `size` uploads concurrently.
    ///
    /// The pool starts shutting down when `parent` is cancelled, in addition to an explicit call
    /// to [`shutdown`](Self::shutdown).
    pub fn new(uploader: Uploader, size: usize, parent: &CancellationToken) -> Self {
        let size = size.max(1);
        let tracker = TaskTracker::new();
        Self {
            uploader: uploader.with_cleanup(tracker.clone()),
            semaphore: Arc::new(Semaphore::new(size)),
            tracker,
            shutdown: parent.child_token(),
            tasks: Vec::new(),
            size,
        }
    }

    /// The maximum number of concurrent uploads.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Schedules the upload of `blob` and returns immediately.
    ///
    /// The upload waits for a free slot in the pool. If the pool shuts down before a slot frees
    /// up, the upload fails with [`Error::Cancelled`] without contacting the backend.
    pub fn submit(&mut self, blob: Blob, iteration: u64) -> UploadHandle {
        let uploader = self.uploader.clone();
        let semaphore = Arc::clone(&self.semaphore);
        let shutdown = self.shutdown.clone();
        let span = tracing::info_span!("upload", blob = %blob.name, iteration);

        let name = blob.name.clone();
        let key = blob.key.clone();

        let task = self.tracker.spawn(
            async move {
                let queued = Instant::now();
                let permit = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };

                let Some(_permit) = permit else {
                    return Attempt {
                        result: Err(Error::Cancelled { key: blob.key }),
                        elapsed: queued.elapsed(),
                    };
                };
                tracing::trace!(queued = ?queued.elapsed(), "acquired upload slot");

                let start = Instant::now();
                let result = uploader.upload(&blob, &shutdown).await;
                Attempt {
                    result,
                    elapsed: start.elapsed(),
                }
            }
            .instrument(span),
        );

        self.tasks.push(task.abort_handle());

        UploadHandle {
            blob: name,
            key,
            iteration,
            task,
        }
    }

    /// Shuts the pool down.
    ///
    /// Signals all running uploads to stop before their next part and rejects uploads still
    /// waiting for a slot. Waits up to `grace` for all tasks to finish, then aborts the remaining
    /// ones. The sessions of aborted uploads are discarded in the background, which is given
    /// another `grace` period.
    pub async fn shutdown(self, grace: Duration) -> ShutdownReport {
        self.shutdown.cancel();
        self.semaphore.close();
        self.tracker.close();

        if tokio::time::timeout(grace, self.tracker.wait()).await.is_ok() {
            tracing::debug!("worker pool shut down gracefully");
            return ShutdownReport::Graceful;
        }

        let mut aborted = 0;
        for task in &self.tasks {
            if !task.is_finished() {
                task.abort();
                aborted += 1;
            }
        }

        tracing::warn!(
            aborted,
            grace = ?grace,
            "worker pool did not drain within the grace period, aborted remaining uploads"
        );

        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            tracing::warn!("interrupted uploads were not discarded, parts may need manual removal");
        }
        ShutdownReport::Forced { aborted }
    }
}

/// How a [`WorkerPool`] shut down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownReport {
    /// All tasks finished within the grace period.
    Graceful,
    /// The grace period elapsed and the remaining tasks were aborted.
    Forced {
        /// Number of tasks that were aborted.
        aborted: usize,
    },
}

/// The pending result of one submitted upload.
///
/// Dropping the handle does not cancel the upload.
#[derive(Debug)]
pub struct UploadHandle {
    blob: String,
    key: String,
    iteration: u64,
    task: JoinHandle<Attempt>,
}

impl UploadHandle {
    /// The name of the blob being uploaded.
    pub fn blob(&self) -> &str {
        &self.blob
    }

    /// The iteration the upload belongs to.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Returns `true` once the upload finished, successfully or not.
    pub fn is_done(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the upload to finish for at most `timeout`.
    ///
    /// On timeout, a [`TimedOut`](OutcomeStatus::TimedOut) outcome is returned and the upload
    /// keeps running in the pool. Its elapsed time is the time spent waiting.
    pub async fn wait(self, timeout: Duration) -> UploadOutcome {
        let start = Instant::now();
        let Self {
            blob,
            key,
            iteration,
            task,
        } = self;

        let (elapsed, status) = match tokio::time::timeout(timeout, task).await {
            Ok(Ok(attempt)) => {
                let status = match attempt.result {
                    Ok(output) => OutcomeStatus::Success(output),
                    Err(error) => OutcomeStatus::Failure(error),
                };
                (attempt.elapsed, status)
            }
            Ok(Err(cause)) => (
                start.elapsed(),
                OutcomeStatus::Failure(Error::Task { key, cause }),
            ),
            Err(_) => (start.elapsed(), OutcomeStatus::TimedOut),
        };

        UploadOutcome {
            blob,
            iteration,
            elapsed,
            status,
        }
    }
}
