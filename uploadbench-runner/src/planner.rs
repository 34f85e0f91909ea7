//! Splits a blob into the parts of a multipart upload.
//!
//! The planner runs once per upload, before the session is opened, and its output is never
//! recomputed: part numbers and byte ranges stay fixed for the lifetime of the session.

use std::ops::Range;

use thiserror::Error;

/// One mebibyte.
pub const MIB: u64 = 1024 * 1024;

/// Size constraints a backend imposes on multipart uploads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartLimits {
    /// Smallest size allowed for any part except the last.
    pub min_part_size: u64,
    /// Largest size allowed for a single part.
    pub max_part_size: u64,
    /// Largest number of parts in one upload.
    pub max_parts: u32,
    /// Part sizes grown beyond the minimum are rounded up to a multiple of this.
    pub granularity: u64,
}

impl PartLimits {
    /// The limits of AWS S3.
    pub const S3: Self = Self {
        min_part_size: 5 * MIB,
        max_part_size: 5 * 1024 * MIB,
        max_parts: 10_000,
        granularity: MIB,
    };

    /// Computes the size of all non-last parts for a blob of `total_size` bytes.
    ///
    /// The requested `min_part_size` is raised to the backend minimum. It is used as-is unless
    /// the blob would then need more than [`max_parts`](Self::max_parts) parts, in which case the
    /// part size grows to `total_size / max_parts`, rounded up to the granularity.
    pub fn part_size(&self, total_size: u64, min_part_size: u64) -> Result<u64, PlanningError> {
        if total_size == 0 {
            return Err(PlanningError::EmptyBlob);
        }

        let floor = min_part_size
            .max(self.min_part_size)
            .min(self.max_part_size)
            .max(1);
        let naive = total_size.div_ceil(u64::from(self.max_parts.max(1)));

        let part_size = if naive > floor {
            let granularity = self.granularity.max(1);
            naive.div_ceil(granularity) * granularity
        } else {
            floor
        };

        if part_size > self.max_part_size {
            return Err(PlanningError::TooLarge {
                total_size,
                max_size: self.max_part_size * u64::from(self.max_parts),
            });
        }

        Ok(part_size)
    }

    /// Plans the parts of a blob of `total_size` bytes.
    pub fn plan(
        &self,
        total_size: u64,
        min_part_size: u64,
    ) -> Result<Vec<PartDescriptor>, PlanningError> {
        let part_size = self.part_size(total_size, min_part_size)?;
        let count = total_size.div_ceil(part_size);

        let parts = (0..count)
            .map(|index| {
                let offset = index * part_size;
                PartDescriptor {
                    number: index as u32 + 1,
                    offset,
                    len: part_size.min(total_size - offset),
                }
            })
            .collect();

        Ok(parts)
    }
}

impl Default for PartLimits {
    fn default() -> Self {
        Self::S3
    }
}

/// Plans the parts of a blob of `total_size` bytes using the [S3 limits](PartLimits::S3).
pub fn plan(total_size: u64, min_part_size: u64) -> Result<Vec<PartDescriptor>, PlanningError> {
    PartLimits::S3.plan(total_size, min_part_size)
}

/// A contiguous byte range of a blob, uploaded as one part.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartDescriptor {
    /// 1-based part number.
    pub number: u32,
    /// Offset of the first byte within the blob.
    pub offset: u64,
    /// Number of bytes in this part.
    pub len: u64,
}

impl PartDescriptor {
    /// The byte range of this part within the blob.
    pub fn range(&self) -> Range<u64> {
        self.offset..self.offset + self.len
    }
}

/// Errors computing a part plan.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanningError {
    /// Empty blobs cannot be uploaded in parts.
    #[error("cannot split an empty blob into parts")]
    EmptyBlob,

    /// The blob does not fit into the maximum number of maximum-size parts.
    #[error("blob of {total_size} bytes exceeds the multipart limit of {max_size} bytes")]
    TooLarge { total_size: u64, max_size: u64 },
}
