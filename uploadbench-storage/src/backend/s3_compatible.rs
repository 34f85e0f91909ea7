use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{StreamExt, stream};
use s3::creds::Credentials;
use s3::serde_types::Part;
use s3::{Bucket, Region};
use serde::Deserialize;

use super::common::{
    Backend, BackendError, BackendResult, CompletedUpload, ListPage, MultipartUpload, PartTag,
    UploadMetadata,
};

/// Content type used when the caller did not provide one.
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Number of concurrent single-key deletes, since the client has no batch delete.
const DELETE_CONCURRENCY: usize = 16;

/// Connection settings for an [`S3CompatibleBackend`].
#[derive(Clone, Default)]
pub struct S3CompatibleConfig {
    /// Endpoint URL, e.g. `http://localhost:9000` for MinIO. Defaults to AWS for the region.
    pub endpoint: Option<String>,
    /// Region name used for request signing.
    pub region: String,
    /// Whether to address buckets as a path component instead of a subdomain.
    pub path_style: bool,
    /// Access key. Falls back to the environment and instance metadata when unset.
    pub access_key: Option<String>,
    /// Secret key. Falls back to the environment and instance metadata when unset.
    pub secret_key: Option<String>,
    /// Session token for temporary credentials.
    pub session_token: Option<String>,
    /// Timeout applied to every request.
    pub request_timeout: Option<Duration>,
}

impl fmt::Debug for S3CompatibleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3CompatibleConfig")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("path_style", &self.path_style)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

/// A [`Backend`] talking to AWS S3 or any service implementing its API.
pub struct S3CompatibleBackend {
    region: Region,
    credentials: Credentials,
    path_style: bool,
    request_timeout: Option<Duration>,
}

impl S3CompatibleBackend {
    /// Creates a new backend, resolving credentials eagerly.
    pub fn new(config: S3CompatibleConfig) -> BackendResult<Self> {
        let credentials = Credentials::new(
            config.access_key.as_deref(),
            config.secret_key.as_deref(),
            None,
            config.session_token.as_deref(),
            None,
        )?;

        let region = Region::Custom {
            endpoint: match config.endpoint {
                Some(endpoint) => endpoint,
                None => format!("https://s3.{}.amazonaws.com", config.region),
            },
            region: config.region,
        };

        Ok(Self {
            region,
            credentials,
            path_style: config.path_style,
            request_timeout: config.request_timeout,
        })
    }

    fn bucket(&self, name: &str) -> BackendResult<Box<Bucket>> {
        let mut bucket = Bucket::new(name, self.region.clone(), self.credentials.clone())
            .map_err(|cause| BackendError::s3(format!("invalid bucket `{name}`"), cause))?;

        if self.path_style {
            bucket = bucket.with_path_style();
        }

        if let Some(request_timeout) = self.request_timeout {
            bucket = bucket
                .with_request_timeout(request_timeout)
                .map_err(|cause| BackendError::s3("invalid request timeout", cause))?;
        }

        Ok(bucket)
    }
}

impl fmt::Debug for S3CompatibleBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Compatible")
            .field("endpoint", &self.region.endpoint())
            .field("path_style", &self.path_style)
            .finish_non_exhaustive()
    }
}

/// Body of a successful `CompleteMultipartUpload` response.
#[derive(Debug, Deserialize)]
struct CompleteMultipartUploadResult {
    #[serde(rename = "ETag")]
    etag: Option<String>,
}

fn completion_etag(body: &[u8]) -> Option<String> {
    let body = std::str::from_utf8(body).ok()?;
    match quick_xml::de::from_str::<CompleteMultipartUploadResult>(body) {
        Ok(result) => result.etag,
        Err(error) => {
            tracing::debug!(
                error = &error as &dyn std::error::Error,
                "unreadable completion response"
            );
            None
        }
    }
}

fn version_id(headers: &HashMap<String, String>) -> Option<String> {
    headers.get("x-amz-version-id").cloned()
}

#[async_trait::async_trait]
impl Backend for S3CompatibleBackend {
    fn name(&self) -> &'static str {
        "s3-compatible"
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> BackendResult<ListPage> {
        let (result, _status) = self
            .bucket(bucket)?
            .list_page(prefix.to_owned(), None, continuation_token, None, None)
            .await
            .map_err(|cause| BackendError::s3(format!("listing `{prefix}`"), cause))?;

        Ok(ListPage {
            keys: result.contents.into_iter().map(|object| object.key).collect(),
            next_token: result.next_continuation_token,
            is_truncated: result.is_truncated,
        })
    }

    #[tracing::instrument(level = "trace", skip_all, fields(count = keys.len()))]
    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> BackendResult<usize> {
        let bucket = &self.bucket(bucket)?;
        let results: Vec<_> = stream::iter(keys.to_vec())
            .map(|key: String| async move {
                bucket
                    .delete_object(&key)
                    .await
                    .map_err(|cause| BackendError::s3(format!("deleting `{key}`"), cause))
            })
            .buffer_unordered(DELETE_CONCURRENCY)
            .collect()
            .await;

        let mut deleted = 0;
        let mut first_error = None;
        for result in results {
            match result {
                Ok(_) => deleted += 1,
                Err(error) => {
                    tracing::debug!(error = &error as &dyn std::error::Error, "delete failed");
                    first_error.get_or_insert(error);
                }
            }
        }

        match first_error {
            Some(error) if deleted == 0 => Err(error),
            _ => Ok(deleted),
        }
    }

    #[tracing::instrument(level = "trace", skip(self, metadata))]
    async fn initiate_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        metadata: &UploadMetadata,
    ) -> BackendResult<MultipartUpload> {
        let mut s3_bucket = self.bucket(bucket)?;
        if let Some(storage_class) = &metadata.storage_class {
            s3_bucket.add_header("x-amz-storage-class", storage_class);
        }
        if let Some(acl) = &metadata.acl {
            s3_bucket.add_header("x-amz-acl", acl);
        }

        let content_type = metadata
            .content_type
            .as_deref()
            .unwrap_or(DEFAULT_CONTENT_TYPE);
        let response = s3_bucket
            .initiate_multipart_upload(key, content_type)
            .await
            .map_err(|cause| BackendError::s3(format!("initiating upload of `{key}`"), cause))?;

        Ok(MultipartUpload {
            bucket: bucket.to_owned(),
            key: key.to_owned(),
            upload_id: response.upload_id,
        })
    }

    #[tracing::instrument(
        level = "trace",
        skip(self, bytes),
        fields(key = %upload.key, len = bytes.len())
    )]
    async fn upload_part(
        &self,
        upload: &MultipartUpload,
        part_number: u32,
        bytes: Bytes,
    ) -> BackendResult<PartTag> {
        let part = self
            .bucket(&upload.bucket)?
            .put_multipart_chunk(
                bytes.to_vec(),
                &upload.key,
                part_number,
                &upload.upload_id,
                DEFAULT_CONTENT_TYPE,
            )
            .await
            .map_err(|cause| {
                BackendError::s3(
                    format!("uploading part {part_number} of `{}`", upload.key),
                    cause,
                )
            })?;

        Ok(PartTag {
            part_number: part.part_number,
            etag: part.etag,
        })
    }

    #[tracing::instrument(
        level = "trace",
        skip(self, parts),
        fields(key = %upload.key, parts = parts.len())
    )]
    async fn complete_multipart_upload(
        &self,
        upload: &MultipartUpload,
        parts: &[PartTag],
    ) -> BackendResult<CompletedUpload> {
        let parts = parts
            .iter()
            .map(|tag| Part {
                part_number: tag.part_number,
                etag: tag.etag.clone(),
            })
            .collect();

        let response = self
            .bucket(&upload.bucket)?
            .complete_multipart_upload(&upload.key, &upload.upload_id, parts)
            .await
            .map_err(|cause| {
                BackendError::s3(format!("completing upload of `{}`", upload.key), cause)
            })?;

        Ok(CompletedUpload {
            key: upload.key.clone(),
            etag: completion_etag(response.as_slice()),
            version_id: version_id(&response.headers()),
        })
    }

    #[tracing::instrument(level = "trace", skip(self), fields(key = %upload.key))]
    async fn abort_multipart_upload(&self, upload: &MultipartUpload) -> BackendResult<()> {
        self.bucket(&upload.bucket)?
            .abort_upload(&upload.key, &upload.upload_id)
            .await
            .map_err(|cause| {
                BackendError::s3(format!("aborting upload of `{}`", upload.key), cause)
            })
    }

    #[tracing::instrument(level = "trace", skip(self, bytes, metadata), fields(len = bytes.len()))]
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        bytes: Bytes,
        metadata: &UploadMetadata,
    ) -> BackendResult<CompletedUpload> {
        let content_type = metadata
            .content_type
            .as_deref()
            .unwrap_or(DEFAULT_CONTENT_TYPE);
        let response = self
            .bucket(bucket)?
            .put_object_with_content_type(key, &bytes, content_type)
            .await
            .map_err(|cause| BackendError::s3(format!("writing `{key}`"), cause))?;

        let headers = response.headers();
        Ok(CompletedUpload {
            key: key.to_owned(),
            etag: headers.get("etag").cloned(),
            version_id: version_id(&headers),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_etag_from_completion_response() {
        let body = br#"<?xml version="1.0" encoding="UTF-8"?>
<CompleteMultipartUploadResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Location>http://bucket.s3.amazonaws.com/dir/file</Location>
  <Bucket>bucket</Bucket>
  <Key>dir/file</Key>
  <ETag>&quot;3858f62230ac3c915f300c664312c11f-9&quot;</ETag>
</CompleteMultipartUploadResult>"#;

        assert_eq!(
            completion_etag(body).as_deref(),
            Some("\"3858f62230ac3c915f300c664312c11f-9\"")
        );
        assert_eq!(completion_etag(b"<Error/>"), None);
        assert_eq!(completion_etag(b"not xml"), None);
    }

    #[test]
    fn debug_redacts_credentials() {
        let config = S3CompatibleConfig {
            region: "us-east-1".into(),
            access_key: Some("AKIA".into()),
            secret_key: Some("super-secret".into()),
            ..Default::default()
        };

        let debug = format!("{config:?}");
        assert!(debug.contains("us-east-1"));
        assert!(!debug.contains("super-secret"));
    }

    #[ignore = "requires a local S3-compatible server, e.g. MinIO on port 9000"]
    #[tokio::test]
    async fn works_with_minio() {
        let backend = S3CompatibleBackend::new(S3CompatibleConfig {
            endpoint: Some("http://localhost:9000".into()),
            region: "us-east-1".into(),
            path_style: true,
            access_key: Some("minioadmin".into()),
            secret_key: Some("minioadmin".into()),
            ..Default::default()
        })
        .unwrap();

        let metadata = UploadMetadata {
            content_length: 7,
            ..Default::default()
        };
        let upload = backend
            .initiate_multipart_upload("uploadbench", "test/file", &metadata)
            .await
            .unwrap();
        let part = backend
            .upload_part(&upload, 1, Bytes::from_static(b"oh hai!"))
            .await
            .unwrap();
        backend
            .complete_multipart_upload(&upload, &[part])
            .await
            .unwrap();

        let page = backend
            .list_objects("uploadbench", "test/", None)
            .await
            .unwrap();
        assert_eq!(page.keys, ["test/file"]);

        let deleted = backend
            .delete_objects("uploadbench", &page.keys)
            .await
            .unwrap();
        assert_eq!(deleted, 1);
    }
}
