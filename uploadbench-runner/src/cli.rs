use std::time::Duration;

use anyhow::{Context, Result};
use argh::FromArgs;
use tokio::signal::unix::SignalKind;

use crate::benchmark::{Benchmark, Target};
use crate::blob::Blob;
use crate::config::{self, Config};
use crate::corpus::{self, SyntheticCorpus};
use crate::observability;

/// Repeatedly upload a corpus of large files to an object store and report upload latencies.
///
/// Tunables are read from `UPLOADBENCH__` environment variables.
#[derive(Debug, FromArgs)]
struct Args {
    /// maximum acceptable upload time of a single file, in seconds
    #[argh(positional)]
    budget: u64,

    /// destination bucket
    #[argh(positional)]
    bucket: String,

    /// key prefix of all uploaded files, purged after every iteration
    #[argh(positional)]
    prefix: String,
}

/// Bootstrap the runtime and run the benchmark until terminated.
pub fn execute() -> Result<()> {
    let args: Args = argh::from_env();
    let config = Config::load()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("main-rt")
        .enable_all()
        .worker_threads(config.runtime.worker_threads)
        .build()?;
    let _runtime_guard = runtime.enter();

    observability::init_tracing(&config.logging);
    tracing::debug!(?config);

    let target = Target {
        bucket: args.bucket,
        prefix: args.prefix,
        budget: Duration::from_secs(args.budget),
    };

    runtime.block_on(run(config, target))
}

async fn run(config: Config, target: Target) -> Result<()> {
    let backend = config.storage.create_backend()?;
    let corpus = load_corpus(&config.corpus, &target.prefix).await?;
    if corpus.is_empty() {
        tracing::warn!("the corpus is empty, iterations will only purge the prefix");
    }

    let benchmark = Benchmark::new(backend, target, corpus, config.benchmark_settings());
    let shutdown = benchmark.shutdown_token();

    tokio::spawn(async move {
        elegant_departure::get_shutdown_guard().wait().await;
        tracing::info!("Shutting down ...");
        shutdown.cancel();
    });

    let mut task = tokio::spawn(async move { benchmark.run().await });

    let depart = elegant_departure::tokio::depart()
        .on_termination()
        .on_sigint()
        .on_signal(SignalKind::hangup())
        .on_signal(SignalKind::quit());

    // The benchmark ends on its own once the iteration limit is reached.
    let finished = tokio::select! {
        result = &mut task => Some(result),
        _ = depart => None,
    };
    let iterations = match finished {
        Some(result) => result,
        None => task.await,
    }
    .context("benchmark task failed")?;

    tracing::info!(iterations, "Shutdown complete");
    Ok(())
}

async fn load_corpus(config: &config::Corpus, prefix: &str) -> Result<Vec<Blob>> {
    if let Some(dir) = &config.dir {
        let blobs = corpus::from_dir(dir, prefix)
            .await
            .with_context(|| format!("failed to read corpus from `{}`", dir.display()))?;
        tracing::info!(files = blobs.len(), dir = %dir.display(), "loaded corpus");
        return Ok(blobs);
    }

    let synthetic = SyntheticCorpus {
        files: config.files,
        file_size: config.file_size.as_u64(),
        name_prefix: config.name_prefix.clone(),
        seed: config.seed.unwrap_or_else(rand::random),
    };
    let prefix = prefix.to_owned();

    tracing::info!(
        files = synthetic.files,
        file_size = %config.file_size,
        seed = synthetic.seed,
        "generating corpus"
    );
    let blobs = tokio::task::spawn_blocking(move || synthetic.generate(&prefix))
        .await
        .context("corpus generation failed")?;

    Ok(blobs)
}
