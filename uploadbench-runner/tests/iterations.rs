use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use uploadbench_runner::planner::PartLimits;
use uploadbench_runner::{
    Benchmark, BenchmarkSettings, Blob, ShutdownReport, Target, UploadSettings, Verdict,
};
use uploadbench_storage::{InMemoryBackend, Latency};

const BUCKET: &str = "bucket";
const PREFIX: &str = "runs/";

/// Ten bytes, uploaded in three parts of 4, 4 and 2 bytes.
const CONTENTS: &[u8] = b"0123456789";

fn settings() -> BenchmarkSettings {
    BenchmarkSettings {
        upload_timeout: Duration::from_secs(60),
        pause: Duration::from_secs(10),
        shutdown_grace: Duration::from_secs(60),
        concurrency: 4,
        iterations: None,
        upload: UploadSettings {
            limits: PartLimits {
                min_part_size: 4,
                max_part_size: 1024,
                max_parts: 100,
                granularity: 1,
            },
            min_part_size: 4,
            multipart_threshold: 4,
            ..Default::default()
        },
    }
}

fn key(name: &str) -> String {
    format!("{PREFIX}{name}")
}

fn benchmark(backend: &InMemoryBackend, names: &[&str], settings: BenchmarkSettings) -> Benchmark {
    let corpus = names
        .iter()
        .map(|name| Blob::from_bytes(*name, key(name), Bytes::from_static(CONTENTS)))
        .collect();
    let target = Target {
        bucket: BUCKET.into(),
        prefix: PREFIX.into(),
        budget: Duration::from_secs(10),
    };

    Benchmark::new(Arc::new(backend.clone()), target, corpus, settings)
}

fn slow_parts(backend: &InMemoryBackend, part: Duration) {
    backend.set_latency(Latency {
        part,
        ..Default::default()
    });
}

#[tokio::test(start_paused = true)]
async fn one_success_one_part_failure() {
    uploadbench_test::tracing::init();
    let backend = InMemoryBackend::new();
    slow_parts(&backend, Duration::from_secs(1));
    backend.fail_part(key("b"), 2);

    let report = benchmark(&backend, &["a", "b"], settings())
        .run_iteration(0)
        .await;

    let a = report.upload("a").unwrap();
    assert_eq!(a.verdict, Verdict::Pass);
    assert_eq!(a.elapsed, Duration::from_secs(3));
    let calls = backend.calls_for(&key("a"));
    assert_eq!(calls.upload_part, 3);
    assert_eq!(calls.complete, 1);

    let b = report.upload("b").unwrap();
    assert_eq!(b.verdict, Verdict::Error);
    let calls = backend.calls_for(&key("b"));
    assert_eq!(calls.upload_part, 2);
    assert_eq!(calls.abort, 1);
    assert_eq!(calls.complete, 0);

    // One purge after both uploads resolved, removing the one stored object.
    assert_eq!(backend.calls().list, 1);
    let purge = report.purge.as_ref().unwrap();
    assert_eq!(purge.listed, 1);
    assert_eq!(purge.deleted, 1);
    assert_eq!(backend.object_count(BUCKET), 0);
    assert_eq!(backend.open_uploads(), 0);

    assert_eq!(report.shutdown, ShutdownReport::Graceful);
    assert_eq!(report.latency.unwrap().count, 1);
}

#[tokio::test(start_paused = true)]
async fn every_iteration_is_purged() {
    let backend = InMemoryBackend::new();
    let settings = BenchmarkSettings {
        iterations: Some(3),
        ..settings()
    };

    let mut reports = Vec::new();
    let iterations = benchmark(&backend, &["a", "b", "c"], settings)
        .run_with(|report| reports.push(report))
        .await;

    assert_eq!(iterations, 3);
    assert_eq!(backend.calls().list, 3);
    assert_eq!(backend.calls().complete, 9);

    for (iteration, report) in reports.iter().enumerate() {
        assert_eq!(report.iteration, iteration as u64);
        assert_eq!(report.uploads.len(), 3);
        assert_eq!(report.count(Verdict::Pass), 3);
        assert_eq!(report.purge.as_ref().unwrap().deleted, 3);
    }
}

#[tokio::test(start_paused = true)]
async fn slow_upload_exceeds_budget() {
    let backend = InMemoryBackend::new();
    slow_parts(&backend, Duration::from_secs(5));

    let report = benchmark(&backend, &["a"], settings())
        .run_iteration(0)
        .await;

    let a = report.upload("a").unwrap();
    assert_eq!(a.verdict, Verdict::BudgetExceeded);
    assert_eq!(a.elapsed, Duration::from_secs(15));
    assert_eq!(report.count(Verdict::Pass), 0);

    // The upload itself succeeded and was purged afterwards.
    assert_eq!(backend.calls_for(&key("a")).complete, 1);
    assert_eq!(report.purge.as_ref().unwrap().deleted, 1);
}

#[tokio::test(start_paused = true)]
async fn timed_out_upload_is_cancelled_at_pool_shutdown() {
    let backend = InMemoryBackend::new();
    slow_parts(&backend, Duration::from_secs(1));
    let settings = BenchmarkSettings {
        upload_timeout: Duration::from_millis(1500),
        ..settings()
    };

    let report = benchmark(&backend, &["a"], settings)
        .run_iteration(0)
        .await;

    let a = report.upload("a").unwrap();
    assert_eq!(a.verdict, Verdict::Error);
    assert_eq!(a.elapsed, Duration::from_millis(1500));

    // The upload kept running after the wait timed out, and stopped before its last part once
    // the pool shut down.
    let calls = backend.calls_for(&key("a"));
    assert_eq!(calls.upload_part, 2);
    assert_eq!(calls.abort, 1);
    assert_eq!(calls.complete, 0);
    assert_eq!(report.shutdown, ShutdownReport::Graceful);
    assert_eq!(backend.open_uploads(), 0);
}

#[tokio::test(start_paused = true)]
async fn stuck_upload_is_aborted_after_grace_period() {
    let backend = InMemoryBackend::new();
    slow_parts(&backend, Duration::from_secs(600));
    let settings = BenchmarkSettings {
        upload_timeout: Duration::from_secs(2),
        shutdown_grace: Duration::from_secs(1),
        ..settings()
    };

    let report = benchmark(&backend, &["a"], settings)
        .run_iteration(0)
        .await;

    assert_eq!(report.count(Verdict::Error), 1);
    assert_eq!(report.shutdown, ShutdownReport::Forced { aborted: 1 });
    let calls = backend.calls_for(&key("a"));
    assert_eq!(calls.complete, 0);
    assert_eq!(calls.abort, 1);
    assert_eq!(backend.open_uploads(), 0);
}

#[tokio::test(start_paused = true)]
async fn purge_failure_does_not_stop_the_loop() {
    let backend = InMemoryBackend::new();
    backend.fail_listing(true);
    let settings = BenchmarkSettings {
        iterations: Some(2),
        ..settings()
    };

    let mut reports = Vec::new();
    let iterations = benchmark(&backend, &["a"], settings)
        .run_with(|report| reports.push(report))
        .await;

    assert_eq!(iterations, 2);
    for report in &reports {
        assert!(report.purge.is_err());
        assert_eq!(report.count(Verdict::Pass), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_running_iteration() {
    let backend = InMemoryBackend::new();
    slow_parts(&backend, Duration::from_secs(1));
    let benchmark = benchmark(&backend, &["a", "b"], settings());
    let shutdown = benchmark.shutdown_token();

    let (iterations, ()) = tokio::join!(benchmark.run(), async {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        shutdown.cancel();
    });

    assert_eq!(iterations, 1);
    for name in ["a", "b"] {
        let calls = backend.calls_for(&key(name));
        assert_eq!(calls.upload_part, 2);
        assert_eq!(calls.abort, 1);
        assert_eq!(calls.complete, 0);
    }
    assert_eq!(backend.calls().list, 1);
    assert_eq!(backend.open_uploads(), 0);
}
