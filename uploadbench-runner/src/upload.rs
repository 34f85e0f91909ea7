//! Uploads a single blob, either in one request or through the multipart protocol.
//!
//! The multipart path is a small state machine driven by [`Orchestrator`]:
//!
//! ```text
//! Idle → Initiated → UploadingParts → Completing → Completed
//!                          │               │
//!                          └──→ Aborting ←─┘
//!                                  │
//!                                  ↓
//!                               Aborted
//! ```
//!
//! Parts are uploaded strictly one after another in ascending order, so only one part buffer is
//! alive per upload. Concurrency comes from running many orchestrators side by side in the
//! [`WorkerPool`](crate::pool::WorkerPool).
//!
//! Once a session exists, every failure path issues exactly one best-effort abort so the backend
//! is not left with orphaned parts. This includes an upload future that is dropped mid-flight, in
//! which case the abort is spawned in the background.

use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uploadbench_storage::{
    Backend, BackendError, CompletedUpload, MultipartUpload, PartTag, UploadMetadata,
};

use crate::blob::{Blob, ContentReader};
use crate::planner::{MIB, PartDescriptor, PartLimits, PlanningError};

/// Errors uploading a blob.
#[derive(Debug, Error)]
pub enum Error {
    /// The blob could not be split into parts.
    #[error("cannot plan parts of `{key}`")]
    Planning {
        key: String,
        #[source]
        cause: PlanningError,
    },

    /// The blob's contents could not be opened or read before the upload started.
    #[error("cannot read contents of `{key}`")]
    Read {
        key: String,
        #[source]
        cause: io::Error,
    },

    /// The backend refused to open a multipart session. No abort was issued.
    #[error("failed to initiate multipart upload of `{key}`")]
    Initiation {
        key: String,
        #[source]
        cause: BackendError,
    },

    /// A part could not be uploaded. The session was aborted.
    #[error("failed to upload part {part_number} of `{key}`")]
    Upload {
        key: String,
        part_number: u32,
        #[source]
        cause: PartError,
    },

    /// The backend refused to assemble the uploaded parts. The session was aborted.
    #[error("failed to complete multipart upload of `{key}`")]
    Completion {
        key: String,
        #[source]
        cause: BackendError,
    },

    /// The single-request upload failed.
    #[error("failed to put `{key}`")]
    Put {
        key: String,
        #[source]
        cause: BackendError,
    },

    /// The worker pool shut down before the upload started.
    #[error("upload of `{key}` was cancelled before it started")]
    Cancelled { key: String },

    /// The task running the upload panicked or was aborted by a forced pool shutdown.
    #[error("upload task of `{key}` did not finish")]
    Task {
        key: String,
        #[source]
        cause: tokio::task::JoinError,
    },
}

/// The reason a single part could not be uploaded.
#[derive(Debug, Error)]
pub enum PartError {
    /// The backend rejected the part.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The part's bytes could not be read from the content source.
    #[error("failed to read part contents")]
    Read(#[source] io::Error),

    /// The worker pool started shutting down before the part was sent.
    #[error("worker pool is shutting down")]
    Cancelled,
}

/// A convenience alias that defaults our [`Error`] type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// How blobs are uploaded.
#[derive(Clone, Debug)]
pub struct UploadSettings {
    /// Part constraints of the backend.
    pub limits: PartLimits,
    /// Requested size of non-last parts.
    pub min_part_size: u64,
    /// Blobs smaller than this are uploaded in a single request.
    pub multipart_threshold: u64,
    /// MIME type passed to the backend.
    pub content_type: Option<String>,
    /// Storage class passed to the backend.
    pub storage_class: Option<String>,
    /// Canned ACL passed to the backend.
    pub acl: Option<String>,
}

impl UploadSettings {
    fn metadata(&self, blob: &Blob) -> UploadMetadata {
        UploadMetadata {
            content_length: blob.len,
            content_type: self.content_type.clone(),
            storage_class: self.storage_class.clone(),
            acl: self.acl.clone(),
        }
    }
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            limits: PartLimits::S3,
            min_part_size: 5 * MIB,
            multipart_threshold: 5 * MIB,
            content_type: None,
            storage_class: None,
            acl: None,
        }
    }
}

/// The result of a successful upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadOutput {
    /// What the backend reported for the stored object.
    pub object: CompletedUpload,
    /// Number of parts the blob was sent in. `1` for single-request uploads.
    pub parts: u32,
    /// Number of bytes sent.
    pub bytes: u64,
}

/// Uploads blobs into one bucket.
///
/// Cheap to clone; all clones share the backend and settings.
#[derive(Clone, Debug)]
pub struct Uploader {
    backend: Arc<dyn Backend>,
    bucket: Arc<str>,
    settings: Arc<UploadSettings>,
    cleanup: TaskTracker,
}

impl Uploader {
    /// Creates an uploader writing to `bucket`.
    pub fn new(backend: Arc<dyn Backend>, bucket: &str, settings: UploadSettings) -> Self {
        Self {
            backend,
            bucket: bucket.into(),
            settings: Arc::new(settings),
            cleanup: TaskTracker::new(),
        }
    }

    /// Spawns background aborts of interrupted uploads on `tracker`.
    pub(crate) fn with_cleanup(mut self, tracker: TaskTracker) -> Self {
        self.cleanup = tracker;
        self
    }

    /// Uploads `blob`, choosing the single-request path for blobs below the multipart threshold.
    ///
    /// `shutdown` is checked before every part; once cancelled, the upload aborts its session.
    pub async fn upload(&self, blob: &Blob, shutdown: &CancellationToken) -> Result<UploadOutput> {
        if blob.len < self.settings.multipart_threshold {
            self.put(blob).await
        } else {
            self.orchestrator(blob, shutdown).run().await
        }
    }

    /// Creates the multipart state machine for `blob`.
    pub fn orchestrator<'a>(
        &'a self,
        blob: &'a Blob,
        shutdown: &'a CancellationToken,
    ) -> Orchestrator<'a> {
        Orchestrator {
            backend: &self.backend,
            cleanup: &self.cleanup,
            bucket: &self.bucket,
            settings: &self.settings,
            blob,
            shutdown,
            state: State::Idle,
        }
    }

    async fn put(&self, blob: &Blob) -> Result<UploadOutput> {
        let bytes = blob.read_all().await.map_err(|cause| Error::Read {
            key: blob.key.clone(),
            cause,
        })?;

        let start = Instant::now();
        let object = self
            .backend
            .put_object(&self.bucket, &blob.key, bytes, &self.settings.metadata(blob))
            .await
            .map_err(|cause| Error::Put {
                key: blob.key.clone(),
                cause,
            })?;
        tracing::debug!(elapsed = ?start.elapsed(), "put object");

        Ok(UploadOutput {
            object,
            parts: 1,
            bytes: blob.len,
        })
    }
}

/// States of a multipart upload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Nothing was sent yet.
    Idle,
    /// The backend assigned a session.
    Initiated,
    /// Parts are being sent.
    UploadingParts,
    /// All parts were sent and the completion call is in flight.
    Completing,
    /// The object was stored.
    Completed,
    /// A failure occurred and the session is being discarded.
    Aborting,
    /// The session was discarded, or there was no session to discard.
    Aborted,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Idle => "idle",
            State::Initiated => "initiated",
            State::UploadingParts => "uploading_parts",
            State::Completing => "completing",
            State::Completed => "completed",
            State::Aborting => "aborting",
            State::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Lifecycle of a [`Session`] as seen by the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    /// Opened, no parts sent yet.
    Initiated,
    /// At least one part was sent.
    InProgress,
    /// The parts were assembled into the final object.
    Completed,
    /// The session was discarded.
    Aborted,
    /// Discarding the session failed; it may still hold parts on the backend.
    Failed,
}

/// An open multipart upload together with the receipts of all parts sent so far.
///
/// A session is owned by exactly one orchestrator and never shared.
///
/// Dropping a session that was neither completed nor aborted aborts it in the background.
#[derive(Debug)]
pub struct Session {
    upload: MultipartUpload,
    parts: Vec<PartTag>,
    status: SessionStatus,
    guard: AbortOnDrop,
}

impl Session {
    /// Receipts of all parts sent so far, in part number order.
    pub fn parts(&self) -> &[PartTag] {
        &self.parts
    }

    /// The current status.
    pub fn status(&self) -> SessionStatus {
        self.status
    }
}

/// Aborts a multipart upload that is dropped while still open.
#[derive(Debug)]
struct AbortOnDrop {
    backend: Arc<dyn Backend>,
    cleanup: TaskTracker,
    upload: Option<MultipartUpload>,
}

impl AbortOnDrop {
    fn disarm(&mut self) {
        self.upload = None;
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        let Some(upload) = self.upload.take() else {
            return;
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                upload_id = %upload.upload_id,
                "interrupted multipart upload cannot be aborted without a runtime"
            );
            return;
        };

        tracing::debug!(upload_id = %upload.upload_id, "aborting interrupted multipart upload");
        let backend = Arc::clone(&self.backend);
        let abort = async move {
            if let Err(error) = backend.abort_multipart_upload(&upload).await {
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    upload_id = %upload.upload_id,
                    "unable to abort interrupted multipart upload"
                );
            }
        };
        self.cleanup.spawn_on(abort, &runtime);
    }
}

/// Drives one blob through the multipart protocol.
///
/// Created by [`Uploader::orchestrator`] and consumed by [`run`](Self::run).
#[derive(Debug)]
pub struct Orchestrator<'a> {
    backend: &'a Arc<dyn Backend>,
    cleanup: &'a TaskTracker,
    bucket: &'a str,
    settings: &'a UploadSettings,
    blob: &'a Blob,
    shutdown: &'a CancellationToken,
    state: State,
}

impl Orchestrator<'_> {
    /// The current state.
    pub fn state(&self) -> State {
        self.state
    }

    fn transition(&mut self, state: State) {
        tracing::trace!(from = %self.state, to = %state, "multipart state change");
        self.state = state;
    }

    /// Runs the upload to completion or failure.
    pub async fn run(mut self) -> Result<UploadOutput> {
        let key = &self.blob.key;

        let parts = self
            .settings
            .limits
            .plan(self.blob.len, self.settings.min_part_size)
            .map_err(|cause| Error::Planning {
                key: key.clone(),
                cause,
            })?;

        // Opened before the session so that an unreadable source never leaves an upload behind.
        let reader = self.blob.open().await.map_err(|cause| Error::Read {
            key: key.clone(),
            cause,
        })?;

        let mut session = match self.initiate().await {
            Ok(session) => session,
            Err(error) => {
                self.transition(State::Aborted);
                return Err(error);
            }
        };

        // The reader is released here, on success and failure alike.
        let uploaded = self.upload_parts(&mut session, reader, &parts).await;
        if let Err(error) = uploaded {
            self.abort(&mut session).await;
            return Err(error);
        }

        match self.complete(&mut session).await {
            Ok(object) => Ok(UploadOutput {
                object,
                parts: parts.len() as u32,
                bytes: self.blob.len,
            }),
            Err(error) => {
                self.abort(&mut session).await;
                Err(error)
            }
        }
    }

    async fn initiate(&mut self) -> Result<Session> {
        let start = Instant::now();
        let upload = self
            .backend
            .initiate_multipart_upload(
                self.bucket,
                &self.blob.key,
                &self.settings.metadata(self.blob),
            )
            .await
            .map_err(|cause| Error::Initiation {
                key: self.blob.key.clone(),
                cause,
            })?;

        tracing::debug!(
            upload_id = %upload.upload_id,
            elapsed = ?start.elapsed(),
            "initiated multipart upload"
        );
        self.transition(State::Initiated);

        let guard = AbortOnDrop {
            backend: Arc::clone(self.backend),
            cleanup: self.cleanup.clone(),
            upload: Some(upload.clone()),
        };

        Ok(Session {
            upload,
            parts: Vec::new(),
            status: SessionStatus::Initiated,
            guard,
        })
    }

    async fn upload_parts(
        &mut self,
        session: &mut Session,
        mut reader: ContentReader,
        parts: &[PartDescriptor],
    ) -> Result<()> {
        self.transition(State::UploadingParts);

        for part in parts {
            let part_error = |cause| Error::Upload {
                key: self.blob.key.clone(),
                part_number: part.number,
                cause,
            };

            if self.shutdown.is_cancelled() {
                return Err(part_error(PartError::Cancelled));
            }

            let bytes = reader
                .read_part(part)
                .await
                .map_err(|e| part_error(PartError::Read(e)))?;

            let start = Instant::now();
            let tag = self
                .backend
                .upload_part(&session.upload, part.number, bytes)
                .await
                .map_err(|e| part_error(PartError::Backend(e)))?;

            tracing::debug!(
                part_number = part.number,
                len = part.len,
                elapsed = ?start.elapsed(),
                "uploaded part"
            );
            session.parts.push(tag);
            session.status = SessionStatus::InProgress;
        }

        Ok(())
    }

    async fn complete(&mut self, session: &mut Session) -> Result<CompletedUpload> {
        self.transition(State::Completing);

        let start = Instant::now();
        let object = self
            .backend
            .complete_multipart_upload(&session.upload, &session.parts)
            .await
            .map_err(|cause| Error::Completion {
                key: self.blob.key.clone(),
                cause,
            })?;

        tracing::debug!(elapsed = ?start.elapsed(), "completed multipart upload");
        session.guard.disarm();
        session.status = SessionStatus::Completed;
        self.transition(State::Completed);

        Ok(object)
    }

    async fn abort(&mut self, session: &mut Session) {
        self.transition(State::Aborting);
        session.guard.disarm();

        match self.backend.abort_multipart_upload(&session.upload).await {
            Ok(()) => {
                tracing::debug!(upload_id = %session.upload.upload_id, "aborted multipart upload");
                session.status = SessionStatus::Aborted;
            }
            Err(error) => {
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    upload_id = %session.upload.upload_id,
                    "unable to abort multipart upload, uploaded parts may need manual removal"
                );
                session.status = SessionStatus::Failed;
            }
        }

        self.transition(State::Aborted);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use uploadbench_storage::{InMemoryBackend, Latency};

    use super::*;

    const BUCKET: &str = "bucket";

    /// Limits small enough to exercise many parts with tiny blobs.
    const TINY: PartLimits = PartLimits {
        min_part_size: 4,
        max_part_size: 1024,
        max_parts: 100,
        granularity: 1,
    };

    fn settings() -> UploadSettings {
        UploadSettings {
            limits: TINY,
            min_part_size: 4,
            multipart_threshold: 4,
            ..Default::default()
        }
    }

    fn uploader(backend: &InMemoryBackend) -> Uploader {
        Uploader::new(Arc::new(backend.clone()), BUCKET, settings())
    }

    fn blob(name: &str, contents: &'static [u8]) -> Blob {
        Blob::from_bytes(name, format!("prefix/{name}"), Bytes::from_static(contents))
    }

    #[tokio::test]
    async fn uploads_all_parts_in_order() {
        uploadbench_test::tracing::init();
        let backend = InMemoryBackend::new();
        let blob = blob("a", b"0123456789");

        let output = uploader(&backend)
            .upload(&blob, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(output.parts, 3);
        assert_eq!(output.bytes, 10);
        assert_eq!(output.object.key, "prefix/a");
        assert!(output.object.etag.is_some());
        assert_eq!(
            backend.get_stored(BUCKET, "prefix/a").unwrap().as_ref(),
            b"0123456789"
        );

        let calls = backend.calls_for("prefix/a");
        assert_eq!(calls.initiate, 1);
        assert_eq!(calls.upload_part, 3);
        assert_eq!(calls.complete, 1);
        assert_eq!(calls.abort, 0);
    }

    #[tokio::test]
    async fn ends_in_completed_state() {
        let backend = InMemoryBackend::new();
        let blob = blob("a", b"0123456789");
        let uploader = uploader(&backend);
        let shutdown = CancellationToken::new();

        let mut orchestrator = uploader.orchestrator(&blob, &shutdown);
        assert_eq!(orchestrator.state(), State::Idle);

        let mut session = orchestrator.initiate().await.unwrap();
        assert_eq!(orchestrator.state(), State::Initiated);
        assert_eq!(session.status(), SessionStatus::Initiated);

        let parts = TINY.plan(blob.len, 4).unwrap();
        let reader = blob.open().await.unwrap();
        orchestrator
            .upload_parts(&mut session, reader, &parts)
            .await
            .unwrap();
        assert_eq!(session.status(), SessionStatus::InProgress);
        assert_eq!(
            session
                .parts()
                .iter()
                .map(|p| p.part_number)
                .collect::<Vec<_>>(),
            [1, 2, 3]
        );

        orchestrator.complete(&mut session).await.unwrap();
        assert_eq!(orchestrator.state(), State::Completed);
        assert_eq!(session.status(), SessionStatus::Completed);
    }

    #[tokio::test]
    async fn part_failure_aborts_once_and_never_completes() {
        uploadbench_test::tracing::init();
        let backend = InMemoryBackend::new();
        backend.fail_part("prefix/a", 2);
        let blob = blob("a", b"0123456789");

        let error = uploader(&backend)
            .upload(&blob, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            Error::Upload {
                part_number: 2,
                cause: PartError::Backend(_),
                ..
            }
        ));

        let calls = backend.calls_for("prefix/a");
        assert_eq!(calls.upload_part, 2);
        assert_eq!(calls.abort, 1);
        assert_eq!(calls.complete, 0);
        assert_eq!(backend.open_uploads(), 0);
        assert!(backend.get_stored(BUCKET, "prefix/a").is_none());
    }

    #[tokio::test]
    async fn initiation_failure_issues_no_abort() {
        let backend = InMemoryBackend::new();
        backend.fail_initiate("prefix/a");
        let blob = blob("a", b"0123456789");

        let error = uploader(&backend)
            .upload(&blob, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(error, Error::Initiation { .. }));
        let calls = backend.calls_for("prefix/a");
        assert_eq!(calls.upload_part, 0);
        assert_eq!(calls.abort, 0);
    }

    #[tokio::test]
    async fn completion_failure_aborts() {
        let backend = InMemoryBackend::new();
        backend.fail_complete("prefix/a");
        let blob = blob("a", b"0123456789");

        let error = uploader(&backend)
            .upload(&blob, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(error, Error::Completion { .. }));
        let calls = backend.calls_for("prefix/a");
        assert_eq!(calls.complete, 1);
        assert_eq!(calls.abort, 1);
        assert_eq!(backend.open_uploads(), 0);
    }

    #[tokio::test]
    async fn failed_abort_is_not_propagated() {
        let backend = InMemoryBackend::new();
        backend.fail_part("prefix/a", 1);
        backend.fail_abort("prefix/a");
        let blob = blob("a", b"0123456789");

        let error = uploader(&backend)
            .upload(&blob, &CancellationToken::new())
            .await
            .unwrap_err();

        // The original part failure is reported, not the abort failure.
        assert!(matches!(
            error,
            Error::Upload {
                part_number: 1,
                cause: PartError::Backend(_),
                ..
            }
        ));
        assert_eq!(backend.calls_for("prefix/a").abort, 1);
        assert_eq!(backend.open_uploads(), 1);
    }

    #[tokio::test]
    async fn cancelled_before_first_part() {
        let backend = InMemoryBackend::new();
        let blob = blob("a", b"0123456789");
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let error = uploader(&backend).upload(&blob, &shutdown).await.unwrap_err();

        assert!(matches!(
            error,
            Error::Upload {
                part_number: 1,
                cause: PartError::Cancelled,
                ..
            }
        ));
        let calls = backend.calls_for("prefix/a");
        assert_eq!(calls.upload_part, 0);
        assert_eq!(calls.abort, 1);
        assert_eq!(backend.open_uploads(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn observes_cancellation_between_parts() {
        let backend = InMemoryBackend::new();
        backend.set_latency(Latency {
            part: Duration::from_secs(1),
            ..Default::default()
        });
        let blob = blob("a", b"0123456789");
        let uploader = uploader(&backend);
        let shutdown = CancellationToken::new();

        let task = {
            let shutdown = shutdown.clone();
            let blob = blob.clone();
            tokio::spawn(async move { uploader.upload(&blob, &shutdown).await })
        };

        // Cancel while the first part is in flight.
        tokio::time::sleep(Duration::from_millis(500)).await;
        shutdown.cancel();

        let error = task.await.unwrap().unwrap_err();
        assert!(matches!(
            error,
            Error::Upload {
                part_number: 2,
                cause: PartError::Cancelled,
                ..
            }
        ));

        let calls = backend.calls_for("prefix/a");
        assert_eq!(calls.upload_part, 1);
        assert_eq!(calls.abort, 1);
        assert_eq!(calls.complete, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupted_upload_is_aborted_in_background() {
        let backend = InMemoryBackend::new();
        backend.set_latency(Latency {
            part: Duration::from_secs(1),
            ..Default::default()
        });
        let blob = blob("a", b"0123456789");
        let cleanup = TaskTracker::new();
        let uploader = uploader(&backend).with_cleanup(cleanup.clone());

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(async move { uploader.upload(&blob, &shutdown).await });

        // Drop the upload while the first part is in flight.
        tokio::time::sleep(Duration::from_millis(500)).await;
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        cleanup.close();
        cleanup.wait().await;

        let calls = backend.calls_for("prefix/a");
        assert_eq!(calls.upload_part, 0);
        assert_eq!(calls.abort, 1);
        assert_eq!(calls.complete, 0);
        assert_eq!(backend.open_uploads(), 0);
    }

    #[tokio::test]
    async fn small_blobs_use_single_put() {
        let backend = InMemoryBackend::new();
        let blob = blob("small", b"abc");

        let output = uploader(&backend)
            .upload(&blob, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(output.parts, 1);
        let calls = backend.calls_for("prefix/small");
        assert_eq!(calls.put, 1);
        assert_eq!(calls.initiate, 0);
        assert_eq!(
            backend.get_stored(BUCKET, "prefix/small").unwrap().as_ref(),
            b"abc"
        );
    }

    #[tokio::test]
    async fn unplannable_blob_fails_before_initiation() {
        let backend = InMemoryBackend::new();
        let blob = blob("empty", b"");
        let uploader = uploader(&backend);
        let shutdown = CancellationToken::new();

        let error = uploader
            .orchestrator(&blob, &shutdown)
            .run()
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            Error::Planning {
                cause: PlanningError::EmptyBlob,
                ..
            }
        ));
        assert_eq!(backend.calls_for("prefix/empty").initiate, 0);
    }
}
