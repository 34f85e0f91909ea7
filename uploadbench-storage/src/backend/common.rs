use std::fmt::Debug;

use bytes::Bytes;
use thiserror::Error;

/// Opaque object attributes forwarded to the backend when an upload is created.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UploadMetadata {
    /// Total length of the object in bytes.
    pub content_length: u64,
    /// MIME type of the object, if known.
    pub content_type: Option<String>,
    /// Storage class requested for the object, e.g. `STANDARD_IA`.
    pub storage_class: Option<String>,
    /// Canned ACL applied to the object, e.g. `bucket-owner-full-control`.
    pub acl: Option<String>,
}

/// A multipart upload session that was opened on the backend.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MultipartUpload {
    /// Bucket the object is written to.
    pub bucket: String,
    /// Full object key within the bucket.
    pub key: String,
    /// Session identifier assigned by the backend.
    pub upload_id: String,
}

/// Receipt for a single uploaded part, required to complete the upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartTag {
    /// The 1-based part number.
    pub part_number: u32,
    /// Integrity tag (ETag) the backend returned for this part.
    pub etag: String,
}

/// The result of a successfully stored object.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompletedUpload {
    /// Full object key within the bucket.
    pub key: String,
    /// ETag of the assembled object, if the backend reported one.
    pub etag: Option<String>,
    /// Version identifier, if the bucket is versioned.
    pub version_id: Option<String>,
}

/// One page of a prefix listing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListPage {
    /// Object keys on this page.
    pub keys: Vec<String>,
    /// Token to pass to the next [`Backend::list_objects`] call.
    pub next_token: Option<String>,
    /// Whether more pages follow.
    pub is_truncated: bool,
}

/// The operations an object storage backend offers to the benchmark.
///
/// Implementations must be safe to share across all upload tasks of an iteration.
#[async_trait::async_trait]
pub trait Backend: Debug + Send + Sync + 'static {
    /// The backend name, used for diagnostics.
    fn name(&self) -> &'static str;

    /// Lists one page of object keys under `prefix`.
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> BackendResult<ListPage>;

    /// Deletes the given keys and returns how many the backend confirmed as deleted.
    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> BackendResult<usize>;

    /// Opens a multipart upload session for `key`.
    async fn initiate_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        metadata: &UploadMetadata,
    ) -> BackendResult<MultipartUpload>;

    /// Uploads one part of an open session.
    async fn upload_part(
        &self,
        upload: &MultipartUpload,
        part_number: u32,
        bytes: Bytes,
    ) -> BackendResult<PartTag>;

    /// Stitches the uploaded parts together into the final object.
    ///
    /// `parts` must be ordered by part number.
    async fn complete_multipart_upload(
        &self,
        upload: &MultipartUpload,
        parts: &[PartTag],
    ) -> BackendResult<CompletedUpload>;

    /// Discards an open session along with all parts uploaded so far.
    async fn abort_multipart_upload(&self, upload: &MultipartUpload) -> BackendResult<()>;

    /// Stores an object in a single request.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        bytes: Bytes,
        metadata: &UploadMetadata,
    ) -> BackendResult<CompletedUpload>;
}

/// Errors returned by storage backends.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Errors returned by the S3 client, covering both transport failures and error responses.
    #[error("s3 error: {context}")]
    S3 {
        /// The operation that failed.
        context: String,
        /// The error returned by the client.
        #[source]
        cause: s3::error::S3Error,
    },

    /// The S3 client could not resolve credentials.
    #[error("credentials error: {0}")]
    Credentials(#[from] s3::creds::error::CredentialsError),

    /// The referenced multipart upload does not exist, or was already completed or aborted.
    #[error("no such upload: {upload_id}")]
    NoSuchUpload {
        /// Session identifier that was not found.
        upload_id: String,
    },

    /// The parts passed to a completion call do not match what was uploaded.
    #[error("invalid part list: {0}")]
    InvalidPart(String),

    /// A failure injected into the in-memory backend.
    #[error("simulated failure: {0}")]
    Simulated(String),
}

impl BackendError {
    pub(crate) fn s3(context: impl Into<String>, cause: s3::error::S3Error) -> Self {
        Self::S3 {
            context: context.into(),
            cause,
        }
    }
}

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;
