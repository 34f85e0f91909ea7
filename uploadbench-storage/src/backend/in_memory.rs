//! In-memory backend for tests and dry runs.
//!
//! This provides a [`Backend`](super::common::Backend) backed by a `BTreeMap`, with knobs to
//! inject latency and failures into individual operations. The backend is [`Clone`] so tests can
//! hold a handle for direct inspection while the benchmark owns a shared copy.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use uuid::Uuid;

use super::common::{
    Backend, BackendError, BackendResult, CompletedUpload, ListPage, MultipartUpload, PartTag,
    UploadMetadata,
};

/// Number of keys returned per listing page unless configured otherwise.
const DEFAULT_PAGE_SIZE: usize = 1000;

/// Number of calls made against an [`InMemoryBackend`], per operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallCounts {
    /// Calls to `list_objects`.
    pub list: usize,
    /// Calls to `delete_objects`.
    pub delete: usize,
    /// Calls to `initiate_multipart_upload`.
    pub initiate: usize,
    /// Calls to `upload_part`.
    pub upload_part: usize,
    /// Calls to `complete_multipart_upload`.
    pub complete: usize,
    /// Calls to `abort_multipart_upload`.
    pub abort: usize,
    /// Calls to `put_object`.
    pub put: usize,
}

/// Artificial delays applied before an operation takes effect.
///
/// Delays use tokio's clock, so tests running with a paused clock observe them without
/// actually waiting.
#[derive(Clone, Copy, Debug, Default)]
pub struct Latency {
    /// Delay of `initiate_multipart_upload`.
    pub initiate: Duration,
    /// Delay of every `upload_part` call.
    pub part: Duration,
    /// Delay of `complete_multipart_upload`.
    pub complete: Duration,
    /// Delay of `put_object`.
    pub put: Duration,
}

#[derive(Debug, Default)]
struct Faults {
    initiate: HashSet<String>,
    parts: HashSet<(String, u32)>,
    complete: HashSet<String>,
    abort: HashSet<String>,
    list: bool,
    delete: bool,
}

#[derive(Debug)]
struct PendingUpload {
    bucket: String,
    key: String,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<(String, String), Bytes>,
    uploads: HashMap<String, PendingUpload>,
    faults: Faults,
    calls: CallCounts,
    calls_by_key: HashMap<String, CallCounts>,
    latency: Latency,
    page_size: Option<usize>,
}

impl State {
    fn record(&mut self, key: Option<&str>, f: impl Fn(&mut CallCounts)) {
        f(&mut self.calls);
        if let Some(key) = key {
            f(self.calls_by_key.entry(key.to_owned()).or_default());
        }
    }
}

/// A [`Backend`] that keeps objects and open uploads in process memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    state: Arc<Mutex<State>>,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not cascade into every other holder of the backend.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sets the artificial delays applied to subsequent operations.
    pub fn set_latency(&self, latency: Latency) {
        self.state().latency = latency;
    }

    /// Limits the number of keys returned per listing page.
    pub fn set_page_size(&self, page_size: usize) {
        self.state().page_size = Some(page_size.max(1));
    }

    /// Makes `initiate_multipart_upload` fail for `key`.
    pub fn fail_initiate(&self, key: impl Into<String>) {
        self.state().faults.initiate.insert(key.into());
    }

    /// Makes the upload of `part_number` fail for `key`.
    pub fn fail_part(&self, key: impl Into<String>, part_number: u32) {
        self.state()
            .faults
            .parts
            .insert((key.into(), part_number));
    }

    /// Makes `complete_multipart_upload` fail for `key`.
    pub fn fail_complete(&self, key: impl Into<String>) {
        self.state().faults.complete.insert(key.into());
    }

    /// Makes `abort_multipart_upload` fail for `key`. The session is left open.
    pub fn fail_abort(&self, key: impl Into<String>) {
        self.state().faults.abort.insert(key.into());
    }

    /// Makes every `list_objects` call fail while set.
    pub fn fail_listing(&self, fail: bool) {
        self.state().faults.list = fail;
    }

    /// Makes every `delete_objects` call fail while set.
    pub fn fail_deletes(&self, fail: bool) {
        self.state().faults.delete = fail;
    }

    /// Stores an object directly, bypassing the `Backend` trait.
    pub fn insert(&self, bucket: &str, key: &str, bytes: impl Into<Bytes>) {
        self.state()
            .objects
            .insert((bucket.to_owned(), key.to_owned()), bytes.into());
    }

    /// Returns a clone of the stored bytes, if present.
    pub fn get_stored(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.state()
            .objects
            .get(&(bucket.to_owned(), key.to_owned()))
            .cloned()
    }

    /// Returns the number of objects stored in `bucket`.
    pub fn object_count(&self, bucket: &str) -> usize {
        self.state()
            .objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .count()
    }

    /// Returns the number of multipart sessions that were neither completed nor aborted.
    pub fn open_uploads(&self) -> usize {
        self.state().uploads.len()
    }

    /// Returns the total number of calls per operation.
    pub fn calls(&self) -> CallCounts {
        self.state().calls
    }

    /// Returns the number of calls per operation that targeted `key`.
    pub fn calls_for(&self, key: &str) -> CallCounts {
        self.state()
            .calls_by_key
            .get(key)
            .copied()
            .unwrap_or_default()
    }

    fn latency(&self) -> Latency {
        self.state().latency
    }
}

async fn delay(duration: Duration) {
    if !duration.is_zero() {
        tokio::time::sleep(duration).await;
    }
}

fn new_etag() -> String {
    format!("\"{}\"", Uuid::new_v4().simple())
}

#[async_trait::async_trait]
impl Backend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> BackendResult<ListPage> {
        let mut state = self.state();
        state.record(None, |c| c.list += 1);
        if state.faults.list {
            return Err(BackendError::Simulated(format!("listing `{prefix}`")));
        }

        let page_size = state.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        let mut keys = state
            .objects
            .keys()
            .filter(|(b, k)| b == bucket && k.starts_with(prefix))
            .filter(|(_, k)| continuation_token.as_ref().is_none_or(|token| k > token))
            .map(|(_, k)| k.clone())
            .take(page_size + 1)
            .collect::<Vec<_>>();

        let is_truncated = keys.len() > page_size;
        keys.truncate(page_size);
        let next_token = is_truncated.then(|| keys.last().cloned()).flatten();

        Ok(ListPage {
            keys,
            next_token,
            is_truncated,
        })
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> BackendResult<usize> {
        let mut state = self.state();
        state.record(None, |c| c.delete += 1);
        if state.faults.delete {
            return Err(BackendError::Simulated(format!(
                "deleting {} objects",
                keys.len()
            )));
        }

        let deleted = keys
            .iter()
            .filter(|key| {
                state
                    .objects
                    .remove(&(bucket.to_owned(), (*key).clone()))
                    .is_some()
            })
            .count();
        Ok(deleted)
    }

    async fn initiate_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        _metadata: &UploadMetadata,
    ) -> BackendResult<MultipartUpload> {
        delay(self.latency().initiate).await;

        let mut state = self.state();
        state.record(Some(key), |c| c.initiate += 1);
        if state.faults.initiate.contains(key) {
            return Err(BackendError::Simulated(format!("initiating `{key}`")));
        }

        let upload_id = Uuid::new_v4().to_string();
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                bucket: bucket.to_owned(),
                key: key.to_owned(),
                parts: BTreeMap::new(),
            },
        );

        Ok(MultipartUpload {
            bucket: bucket.to_owned(),
            key: key.to_owned(),
            upload_id,
        })
    }

    async fn upload_part(
        &self,
        upload: &MultipartUpload,
        part_number: u32,
        bytes: Bytes,
    ) -> BackendResult<PartTag> {
        delay(self.latency().part).await;

        let mut state = self.state();
        state.record(Some(upload.key.as_str()), |c| c.upload_part += 1);
        if state
            .faults
            .parts
            .contains(&(upload.key.clone(), part_number))
        {
            return Err(BackendError::Simulated(format!(
                "uploading part {part_number} of `{}`",
                upload.key
            )));
        }

        let pending =
            state
                .uploads
                .get_mut(&upload.upload_id)
                .ok_or_else(|| BackendError::NoSuchUpload {
                    upload_id: upload.upload_id.clone(),
                })?;

        let etag = new_etag();
        pending.parts.insert(part_number, (etag.clone(), bytes));

        Ok(PartTag { part_number, etag })
    }

    async fn complete_multipart_upload(
        &self,
        upload: &MultipartUpload,
        parts: &[PartTag],
    ) -> BackendResult<CompletedUpload> {
        delay(self.latency().complete).await;

        let mut state = self.state();
        state.record(Some(upload.key.as_str()), |c| c.complete += 1);
        if state.faults.complete.contains(&upload.key) {
            return Err(BackendError::Simulated(format!(
                "completing `{}`",
                upload.key
            )));
        }

        let pending = state
            .uploads
            .get(&upload.upload_id)
            .ok_or_else(|| BackendError::NoSuchUpload {
                upload_id: upload.upload_id.clone(),
            })?;

        if parts.is_empty() {
            return Err(BackendError::InvalidPart("no parts given".into()));
        }

        let mut assembled = BytesMut::new();
        for (expected, part) in (1..).zip(parts) {
            if part.part_number != expected {
                return Err(BackendError::InvalidPart(format!(
                    "expected part {expected}, got part {}",
                    part.part_number
                )));
            }
            match pending.parts.get(&part.part_number) {
                Some((etag, bytes)) if *etag == part.etag => assembled.extend_from_slice(bytes),
                _ => {
                    return Err(BackendError::InvalidPart(format!(
                        "part {} was not uploaded with etag {}",
                        part.part_number, part.etag
                    )));
                }
            }
        }

        let Some(pending) = state.uploads.remove(&upload.upload_id) else {
            return Err(BackendError::NoSuchUpload {
                upload_id: upload.upload_id.clone(),
            });
        };
        state
            .objects
            .insert((pending.bucket, pending.key), assembled.freeze());

        Ok(CompletedUpload {
            key: upload.key.clone(),
            etag: Some(format!("\"{}-{}\"", Uuid::new_v4().simple(), parts.len())),
            version_id: Some(Uuid::now_v7().to_string()),
        })
    }

    async fn abort_multipart_upload(&self, upload: &MultipartUpload) -> BackendResult<()> {
        let mut state = self.state();
        state.record(Some(upload.key.as_str()), |c| c.abort += 1);
        if state.faults.abort.contains(&upload.key) {
            return Err(BackendError::Simulated(format!("aborting `{}`", upload.key)));
        }

        match state.uploads.remove(&upload.upload_id) {
            Some(_) => Ok(()),
            None => Err(BackendError::NoSuchUpload {
                upload_id: upload.upload_id.clone(),
            }),
        }
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        bytes: Bytes,
        _metadata: &UploadMetadata,
    ) -> BackendResult<CompletedUpload> {
        delay(self.latency().put).await;

        let mut state = self.state();
        state.record(Some(key), |c| c.put += 1);
        state
            .objects
            .insert((bucket.to_owned(), key.to_owned()), bytes);

        Ok(CompletedUpload {
            key: key.to_owned(),
            etag: Some(new_etag()),
            version_id: Some(Uuid::now_v7().to_string()),
        })
    }
}
