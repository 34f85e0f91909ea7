//! The repeating benchmark loop.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uploadbench_storage::Backend;

use crate::blob::Blob;
use crate::collector::{IterationReport, ResultCollector};
use crate::pool::WorkerPool;
use crate::purge::purge_prefix;
use crate::upload::{UploadSettings, Uploader};

/// Where uploads go and how fast they need to be.
#[derive(Clone, Debug)]
pub struct Target {
    /// Destination bucket.
    pub bucket: String,
    /// Key prefix of all uploaded blobs. Purged after every iteration.
    pub prefix: String,
    /// Maximum acceptable upload time of a single blob.
    pub budget: Duration,
}

/// Tunables of the benchmark loop.
#[derive(Clone, Debug)]
pub struct BenchmarkSettings {
    /// How long to wait for each upload before reporting it as timed out.
    pub upload_timeout: Duration,
    /// Pause between iterations.
    pub pause: Duration,
    /// How long a worker pool may take to drain before its uploads are aborted.
    pub shutdown_grace: Duration,
    /// Maximum number of concurrent uploads.
    pub concurrency: usize,
    /// Stop after this many iterations. Runs until shut down if `None`.
    pub iterations: Option<u64>,
    /// How individual blobs are uploaded.
    pub upload: UploadSettings,
}

impl Default for BenchmarkSettings {
    fn default() -> Self {
        Self {
            upload_timeout: Duration::from_secs(5 * 60),
            pause: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5 * 60),
            concurrency: num_cpus::get(),
            iterations: None,
            upload: UploadSettings::default(),
        }
    }
}

/// Uploads a corpus over and over, purging the prefix in between.
#[derive(Debug)]
pub struct Benchmark {
    backend: Arc<dyn Backend>,
    uploader: Uploader,
    target: Target,
    corpus: Vec<Blob>,
    settings: BenchmarkSettings,
    shutdown: CancellationToken,
}

impl Benchmark {
    /// Creates a benchmark uploading `corpus` to `target`.
    pub fn new(
        backend: Arc<dyn Backend>,
        target: Target,
        corpus: Vec<Blob>,
        settings: BenchmarkSettings,
    ) -> Self {
        let uploader = Uploader::new(
            Arc::clone(&backend),
            &target.bucket,
            settings.upload.clone(),
        );

        Self {
            backend,
            uploader,
            target,
            corpus,
            settings,
            shutdown: CancellationToken::new(),
        }
    }

    /// A token that stops the benchmark when cancelled.
    ///
    /// The current iteration's uploads stop before their next part, and no further iteration
    /// starts.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs iterations until shut down or the iteration limit is reached.
    ///
    /// Returns the number of completed iterations.
    pub async fn run(&self) -> u64 {
        self.run_with(|_| ()).await
    }

    /// Like [`run`](Self::run), handing every iteration's report to `on_report`.
    pub async fn run_with(&self, mut on_report: impl FnMut(IterationReport)) -> u64 {
        tracing::info!(
            backend = self.backend.name(),
            bucket = %self.target.bucket,
            prefix = %self.target.prefix,
            blobs = self.corpus.len(),
            concurrency = self.settings.concurrency,
            budget = ?self.target.budget,
            "starting benchmark"
        );

        let mut iteration = 0;
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let report = self.run_iteration(iteration).await;
            on_report(report);
            iteration += 1;

            if self.settings.iterations.is_some_and(|limit| iteration >= limit) {
                break;
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.settings.pause) => (),
            }
        }

        tracing::info!(iterations = iteration, "benchmark stopped");
        iteration
    }

    /// Uploads the corpus once, waits for all uploads, purges the prefix and shuts down the pool.
    pub async fn run_iteration(&self, iteration: u64) -> IterationReport {
        let span = tracing::info_span!("iteration", iteration);
        self.iteration(iteration).instrument(span).await
    }

    async fn iteration(&self, iteration: u64) -> IterationReport {
        let mut pool = WorkerPool::new(
            self.uploader.clone(),
            self.settings.concurrency,
            &self.shutdown,
        );

        let handles: Vec<_> = self
            .corpus
            .iter()
            .map(|blob| pool.submit(blob.clone(), iteration))
            .collect();
        tracing::debug!(submitted = handles.len(), "submitted uploads");

        let mut collector = ResultCollector::new(iteration, self.target.budget);
        for handle in handles {
            let outcome = handle.wait(self.settings.upload_timeout).await;
            collector.record(outcome);
        }

        let purge = purge_prefix(&*self.backend, &self.target.bucket, &self.target.prefix).await;
        let shutdown = pool.shutdown(self.settings.shutdown_grace).await;

        collector.finish(purge, shutdown)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use uploadbench_storage::InMemoryBackend;

    use super::*;
    use crate::collector::Verdict;

    fn benchmark(backend: &InMemoryBackend, iterations: Option<u64>) -> Benchmark {
        let target = Target {
            bucket: "bucket".into(),
            prefix: "prefix/".into(),
            budget: Duration::from_secs(10),
        };
        let corpus = vec![Blob::from_bytes(
            "a",
            "prefix/a",
            Bytes::from_static(b"hello"),
        )];
        let settings = BenchmarkSettings {
            concurrency: 2,
            iterations,
            ..Default::default()
        };

        Benchmark::new(Arc::new(backend.clone()), target, corpus, settings)
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_iteration_limit() {
        uploadbench_test::tracing::init();
        let backend = InMemoryBackend::new();
        let benchmark = benchmark(&backend, Some(2));

        let mut reports = Vec::new();
        let iterations = benchmark.run_with(|report| reports.push(report)).await;

        assert_eq!(iterations, 2);
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1].iteration, 1);
        assert!(reports.iter().all(|r| r.count(Verdict::Pass) == 1));
        assert_eq!(backend.calls().list, 2);
        assert_eq!(backend.object_count("bucket"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_pause() {
        let backend = InMemoryBackend::new();
        let benchmark = benchmark(&backend, None);
        let shutdown = benchmark.shutdown_token();

        let (iterations, ()) = tokio::join!(benchmark.run(), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            shutdown.cancel();
        });

        assert_eq!(iterations, 1);
    }

    #[tokio::test]
    async fn does_not_start_when_already_shut_down() {
        let backend = InMemoryBackend::new();
        let benchmark = benchmark(&backend, None);
        benchmark.shutdown_token().cancel();

        assert_eq!(benchmark.run().await, 0);
        assert_eq!(backend.calls().list, 0);
    }
}
