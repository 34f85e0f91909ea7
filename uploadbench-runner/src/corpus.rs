//! The fixed set of blobs uploaded in every iteration.

use std::io;
use std::path::Path;

use bytes::{Bytes, BytesMut};
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};

use crate::blob::Blob;

/// Parameters of a synthetic corpus.
#[derive(Clone, Debug)]
pub struct SyntheticCorpus {
    /// Number of blobs.
    pub files: usize,
    /// Size of each blob in bytes.
    pub file_size: u64,
    /// Blob names are this prefix followed by the blob's index.
    pub name_prefix: String,
    /// Seed of the content generator.
    pub seed: u64,
}

impl SyntheticCorpus {
    /// Generates the blobs with random contents, addressed under `key_prefix`.
    ///
    /// Every blob gets its own generator seeded from `seed` and its index, so the contents are
    /// reproducible and distinct across blobs.
    pub fn generate(&self, key_prefix: &str) -> Vec<Blob> {
        (0..self.files)
            .map(|index| {
                let name = format!("{}{index}", self.name_prefix);
                let key = format!("{key_prefix}{name}");
                let bytes = random_bytes(self.seed.wrapping_add(index as u64), self.file_size);
                Blob::from_bytes(name, key, bytes)
            })
            .collect()
    }
}

fn random_bytes(seed: u64, len: u64) -> Bytes {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut bytes = BytesMut::zeroed(len as usize);
    rng.fill_bytes(&mut bytes);
    bytes.freeze()
}

/// Uses every regular file in `dir` as a blob, ordered by file name.
///
/// The blob name is the file name; contents are read from disk on every upload.
pub async fn from_dir(dir: &Path, key_prefix: &str) -> io::Result<Vec<Blob>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            paths.push(entry.path());
        }
    }
    paths.sort();

    let mut blobs = Vec::with_capacity(paths.len());
    for path in paths {
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            tracing::warn!(path = %path.display(), "skipping file with non UTF-8 name");
            continue;
        };
        let key = format!("{key_prefix}{name}");
        blobs.push(Blob::from_file(name, key, &path).await?);
    }

    Ok(blobs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BlobSource;

    #[test]
    fn generates_named_blobs() {
        let corpus = SyntheticCorpus {
            files: 3,
            file_size: 1000,
            name_prefix: "test_file_".into(),
            seed: 42,
        };

        let blobs = corpus.generate("runs/");
        let names: Vec<_> = blobs.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, ["test_file_0", "test_file_1", "test_file_2"]);
        assert_eq!(blobs[1].key, "runs/test_file_1");
        assert!(blobs.iter().all(|b| b.len == 1000));
    }

    #[test]
    fn contents_are_reproducible_and_distinct() {
        let corpus = SyntheticCorpus {
            files: 2,
            file_size: 64,
            name_prefix: "f".into(),
            seed: 7,
        };

        let contents = |blobs: Vec<Blob>| -> Vec<Bytes> {
            blobs
                .into_iter()
                .map(|blob| match blob.source {
                    BlobSource::Memory(bytes) => bytes,
                    BlobSource::File(_) => unreachable!(),
                })
                .collect()
        };

        let first = contents(corpus.generate(""));
        let second = contents(corpus.generate(""));
        assert_eq!(first, second);
        assert_ne!(first[0], first[1]);
    }

    #[tokio::test]
    async fn reads_directory_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.bin"), b"bb").unwrap();
        std::fs::write(dir.path().join("a.bin"), b"a").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let blobs = from_dir(dir.path(), "prefix/").await.unwrap();

        assert_eq!(blobs.len(), 2);
        assert_eq!(blobs[0].name, "a.bin");
        assert_eq!(blobs[0].key, "prefix/a.bin");
        assert_eq!(blobs[0].len, 1);
        assert_eq!(blobs[1].len, 2);
        assert!(matches!(blobs[1].source, BlobSource::File(_)));
    }
}
