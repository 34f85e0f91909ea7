//! Classification of upload outcomes against the latency budget and per-iteration reports.

use std::fmt;
use std::time::Duration;

use sketches_ddsketch::DDSketch;

use crate::pool::ShutdownReport;
use crate::purge::{PurgeError, PurgeReport};
use crate::upload::{Error, UploadOutput};

/// The result of waiting for one upload.
#[derive(Debug)]
pub struct UploadOutcome {
    /// Name of the uploaded blob.
    pub blob: String,
    /// The iteration the upload belongs to.
    pub iteration: u64,
    /// Time the upload took, or the time spent waiting if it timed out.
    pub elapsed: Duration,
    /// How the upload ended.
    pub status: OutcomeStatus,
}

/// Terminal status of an [`UploadOutcome`].
#[derive(Debug)]
pub enum OutcomeStatus {
    /// The object was stored.
    Success(UploadOutput),
    /// The upload failed.
    Failure(Error),
    /// The upload did not finish within the wait timeout. It may still be running.
    TimedOut,
}

/// Classification of an outcome against the latency budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Succeeded within the budget.
    Pass,
    /// Succeeded, but took longer than the budget.
    BudgetExceeded,
    /// Failed or timed out.
    Error,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Verdict::Pass => "pass",
            Verdict::BudgetExceeded => "budget exceeded",
            Verdict::Error => "error",
        })
    }
}

/// What is retained of an outcome after it was classified.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadRecord {
    /// Name of the uploaded blob.
    pub blob: String,
    /// Time the upload took.
    pub elapsed: Duration,
    /// The classification.
    pub verdict: Verdict,
}

/// Latency distribution of the successful uploads of an iteration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LatencySummary {
    pub count: usize,
    pub avg: Duration,
    pub p50: Duration,
    pub p90: Duration,
    pub p99: Duration,
    pub max: Duration,
}

impl LatencySummary {
    fn from_sketch(sketch: &DDSketch) -> Option<Self> {
        let count = sketch.count();
        if count == 0 {
            return None;
        }

        let quantile = |q| {
            let value = sketch.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(value.max(0.0))
        };

        Some(Self {
            count,
            avg: Duration::from_secs_f64(sketch.sum().unwrap_or_default().max(0.0) / count as f64),
            p50: quantile(0.5),
            p90: quantile(0.9),
            p99: quantile(0.99),
            max: Duration::from_secs_f64(sketch.max().unwrap_or_default().max(0.0)),
        })
    }
}

/// The summary of one iteration.
#[derive(Debug)]
pub struct IterationReport {
    /// The iteration number.
    pub iteration: u64,
    /// One record per submitted blob, in submission order.
    pub uploads: Vec<UploadRecord>,
    /// Latency distribution of all successful uploads, including those over budget.
    pub latency: Option<LatencySummary>,
    /// The result of purging the prefix after the uploads.
    pub purge: Result<PurgeReport, PurgeError>,
    /// How the iteration's worker pool shut down.
    pub shutdown: ShutdownReport,
}

impl IterationReport {
    /// Number of uploads with the given verdict.
    pub fn count(&self, verdict: Verdict) -> usize {
        self.uploads.iter().filter(|u| u.verdict == verdict).count()
    }

    /// Looks up the record of a blob.
    pub fn upload(&self, blob: &str) -> Option<&UploadRecord> {
        self.uploads.iter().find(|u| u.blob == blob)
    }
}

/// Classifies and logs the outcomes of one iteration.
pub struct ResultCollector {
    iteration: u64,
    budget: Duration,
    uploads: Vec<UploadRecord>,
    latency: DDSketch,
}

impl fmt::Debug for ResultCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCollector")
            .field("iteration", &self.iteration)
            .field("budget", &self.budget)
            .field("uploads", &self.uploads)
            .finish_non_exhaustive()
    }
}

impl ResultCollector {
    /// Creates a collector for `iteration` with the given latency budget.
    pub fn new(iteration: u64, budget: Duration) -> Self {
        Self {
            iteration,
            budget,
            uploads: Vec::new(),
            latency: DDSketch::default(),
        }
    }

    /// Classifies an outcome, logs it and records it for the report.
    pub fn record(&mut self, outcome: UploadOutcome) -> Verdict {
        let UploadOutcome {
            blob,
            iteration,
            elapsed,
            status,
        } = outcome;

        let verdict = match &status {
            OutcomeStatus::Success(output) => {
                self.latency.add(elapsed.as_secs_f64());
                if elapsed <= self.budget {
                    tracing::info!(
                        blob = %blob,
                        iteration,
                        elapsed = ?elapsed,
                        parts = output.parts,
                        etag = output.object.etag.as_deref(),
                        version_id = output.object.version_id.as_deref(),
                        "upload passed"
                    );
                    Verdict::Pass
                } else {
                    tracing::warn!(
                        blob = %blob,
                        iteration,
                        elapsed = ?elapsed,
                        budget = ?self.budget,
                        "upload exceeded latency budget"
                    );
                    Verdict::BudgetExceeded
                }
            }
            OutcomeStatus::Failure(error) => {
                tracing::error!(
                    blob = %blob,
                    iteration,
                    elapsed = ?elapsed,
                    error = error as &dyn std::error::Error,
                    "upload failed"
                );
                Verdict::Error
            }
            OutcomeStatus::TimedOut => {
                tracing::error!(
                    blob = %blob,
                    iteration,
                    waited = ?elapsed,
                    "timed out waiting for upload"
                );
                Verdict::Error
            }
        };

        self.uploads.push(UploadRecord {
            blob,
            elapsed,
            verdict,
        });
        verdict
    }

    /// Finishes the iteration and logs its summary.
    pub fn finish(
        self,
        purge: Result<PurgeReport, PurgeError>,
        shutdown: ShutdownReport,
    ) -> IterationReport {
        if let Err(error) = &purge {
            tracing::warn!(
                iteration = self.iteration,
                error = error as &dyn std::error::Error,
                "failed to purge prefix"
            );
        }

        let report = IterationReport {
            iteration: self.iteration,
            latency: LatencySummary::from_sketch(&self.latency),
            uploads: self.uploads,
            purge,
            shutdown,
        };

        let passed = report.count(Verdict::Pass);
        let budget_exceeded = report.count(Verdict::BudgetExceeded);
        let failed = report.count(Verdict::Error);
        match &report.latency {
            Some(latency) => tracing::info!(
                iteration = report.iteration,
                passed,
                budget_exceeded,
                failed,
                avg = ?latency.avg,
                p50 = ?latency.p50,
                p90 = ?latency.p90,
                p99 = ?latency.p99,
                max = ?latency.max,
                "iteration finished"
            ),
            None => tracing::info!(
                iteration = report.iteration,
                passed,
                budget_exceeded,
                failed,
                "iteration finished"
            ),
        }

        report
    }
}
