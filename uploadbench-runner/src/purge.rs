//! Removal of all objects under a key prefix between iterations.

use thiserror::Error;
use uploadbench_storage::{Backend, BackendError};

/// Maximum number of keys passed to a single delete request.
const DELETE_BATCH_SIZE: usize = 1000;

/// Errors purging a prefix.
#[derive(Debug, Error)]
pub enum PurgeError {
    /// Listing the prefix failed.
    #[error("failed to list objects under `{prefix}`")]
    List {
        prefix: String,
        #[source]
        cause: BackendError,
    },

    /// Deleting a batch of listed objects failed.
    #[error("failed to delete {count} objects under `{prefix}`")]
    Delete {
        prefix: String,
        count: usize,
        #[source]
        cause: BackendError,
    },
}

/// Summary of a successful purge.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Number of keys found under the prefix.
    pub listed: usize,
    /// Number of keys the backend confirmed as deleted.
    pub deleted: usize,
}

/// Deletes every object under `prefix` in `bucket`.
///
/// All listing pages are collected before the first delete is issued, so deletions do not shift
/// the listing. A difference between listed and deleted keys is logged but not an error.
pub async fn purge_prefix(
    backend: &dyn Backend,
    bucket: &str,
    prefix: &str,
) -> Result<PurgeReport, PurgeError> {
    let mut keys = Vec::new();
    let mut token = None;

    loop {
        let page = backend
            .list_objects(bucket, prefix, token.take())
            .await
            .map_err(|cause| PurgeError::List {
                prefix: prefix.to_owned(),
                cause,
            })?;

        keys.extend(page.keys);
        match page.next_token {
            Some(next) if page.is_truncated => token = Some(next),
            _ => break,
        }
    }

    let mut report = PurgeReport {
        listed: keys.len(),
        deleted: 0,
    };

    for batch in keys.chunks(DELETE_BATCH_SIZE) {
        report.deleted += backend
            .delete_objects(bucket, batch)
            .await
            .map_err(|cause| PurgeError::Delete {
                prefix: prefix.to_owned(),
                count: batch.len(),
                cause,
            })?;
    }

    if report.deleted != report.listed {
        tracing::warn!(
            listed = report.listed,
            deleted = report.deleted,
            prefix,
            "not all listed objects were deleted"
        );
    } else {
        tracing::debug!(deleted = report.deleted, prefix, "purged prefix");
    }

    Ok(report)
}
