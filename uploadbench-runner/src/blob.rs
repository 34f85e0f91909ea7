//! Blobs to upload and the sources their contents are read from.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::planner::PartDescriptor;

/// Where the contents of a [`Blob`] come from.
#[derive(Clone, Debug)]
pub enum BlobSource {
    /// Contents held in memory, shared between all uploads of the blob.
    Memory(Bytes),
    /// Contents read from a file whenever the blob is uploaded.
    File(PathBuf),
}

/// A logical file uploaded once per iteration.
///
/// Cloning a blob is cheap, in-memory contents are reference counted.
#[derive(Clone, Debug)]
pub struct Blob {
    /// Identity of the blob in logs and outcomes.
    pub name: String,
    /// Destination key within the bucket, including the prefix.
    pub key: String,
    /// Content length in bytes.
    pub len: u64,
    /// Where to read the contents from.
    pub source: BlobSource,
}

impl Blob {
    /// Creates a blob from in-memory contents.
    pub fn from_bytes(name: impl Into<String>, key: impl Into<String>, bytes: Bytes) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
            len: bytes.len() as u64,
            source: BlobSource::Memory(bytes),
        }
    }

    /// Creates a blob backed by a file. The length is taken from the file's metadata.
    pub async fn from_file(
        name: impl Into<String>,
        key: impl Into<String>,
        path: impl AsRef<Path>,
    ) -> io::Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;

        Ok(Self {
            name: name.into(),
            key: key.into(),
            len: metadata.len(),
            source: BlobSource::File(path.to_owned()),
        })
    }

    /// Opens the content source for reading.
    ///
    /// For file-backed blobs this holds an open file handle until the reader is dropped.
    pub(crate) async fn open(&self) -> io::Result<ContentReader> {
        Ok(match &self.source {
            BlobSource::Memory(bytes) => ContentReader::Memory(bytes.clone()),
            BlobSource::File(path) => ContentReader::File(File::open(path).await?),
        })
    }

    /// Reads the complete contents.
    pub(crate) async fn read_all(&self) -> io::Result<Bytes> {
        match &self.source {
            BlobSource::Memory(bytes) => Ok(bytes.clone()),
            BlobSource::File(path) => Ok(tokio::fs::read(path).await?.into()),
        }
    }
}

/// An open content source that hands out the byte ranges of parts.
#[derive(Debug)]
pub(crate) enum ContentReader {
    Memory(Bytes),
    File(File),
}

impl ContentReader {
    /// Reads the bytes covered by `part`.
    pub(crate) async fn read_part(&mut self, part: &PartDescriptor) -> io::Result<Bytes> {
        match self {
            Self::Memory(bytes) => {
                let range = part.range();
                if range.end > bytes.len() as u64 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("part {} ends past the end of the blob", part.number),
                    ));
                }
                Ok(bytes.slice(range.start as usize..range.end as usize))
            }
            Self::File(file) => {
                let mut buf = vec![0; part.len as usize];
                file.seek(SeekFrom::Start(part.offset)).await?;
                file.read_exact(&mut buf).await?;
                Ok(buf.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn part(number: u32, offset: u64, len: u64) -> PartDescriptor {
        PartDescriptor {
            number,
            offset,
            len,
        }
    }

    #[tokio::test]
    async fn reads_parts_from_memory() {
        let blob = Blob::from_bytes("a", "prefix/a", Bytes::from_static(b"oh hai!"));
        let mut reader = blob.open().await.unwrap();

        assert_eq!(reader.read_part(&part(1, 0, 3)).await.unwrap(), "oh ");
        assert_eq!(reader.read_part(&part(2, 3, 4)).await.unwrap(), "hai!");
        assert!(reader.read_part(&part(3, 6, 4)).await.is_err());
    }

    #[tokio::test]
    async fn reads_parts_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"oh hai!").unwrap();

        let blob = Blob::from_file("a", "prefix/a", file.path()).await.unwrap();
        assert_eq!(blob.len, 7);

        let mut reader = blob.open().await.unwrap();
        assert_eq!(reader.read_part(&part(2, 3, 4)).await.unwrap(), "hai!");
        assert_eq!(reader.read_part(&part(1, 0, 3)).await.unwrap(), "oh ");
        assert_eq!(blob.read_all().await.unwrap(), "oh hai!");
    }

    #[tokio::test]
    async fn missing_file_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let blob = Blob {
            name: "gone".into(),
            key: "prefix/gone".into(),
            len: 1,
            source: BlobSource::File(dir.path().join("gone")),
        };

        assert!(blob.open().await.is_err());
    }
}
