//! Configuration for the upload benchmark.
//!
//! The latency budget, bucket and prefix are passed on the command line. Everything else is tuned
//! through environment variables on top of built-in defaults. There is no configuration file.
//!
//! See [`Config`] for a description of all configuration fields and their defaults.
//!
//! # Environment Variables
//!
//! Environment variables use `UPLOADBENCH__` as a prefix and double underscores (`__`) to denote
//! nested configuration structures. For example:
//!
//! - `UPLOADBENCH__CONCURRENCY=8` limits the number of concurrent uploads
//! - `UPLOADBENCH__STORAGE__TYPE=s3compatible` selects the storage backend
//! - `UPLOADBENCH__STORAGE__ENDPOINT=http://localhost:9000` points it at a local MinIO

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytesize::ByteSize;
use figment::providers::{Env, Serialized};
use secrecy::{CloneableSecret, ExposeSecret, SecretBox, SerializableSecret, zeroize::Zeroize};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use uploadbench_storage::{Backend, InMemoryBackend, S3CompatibleBackend, S3CompatibleConfig};

use crate::benchmark::BenchmarkSettings;
use crate::planner::PartLimits;
use crate::upload::UploadSettings;

/// Environment variable prefix for all configuration options.
const ENV_PREFIX: &str = "UPLOADBENCH__";

/// Newtype around `String` that may protect against accidental
/// logging of secrets in our configuration struct. Use with
/// [`secrecy::SecretBox`].
#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigSecret(String);

impl ConfigSecret {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for ConfigSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "[redacted]")
    }
}

impl CloneableSecret for ConfigSecret {}
impl SerializableSecret for ConfigSecret {}
impl Zeroize for ConfigSecret {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

fn expose(secret: &Option<SecretBox<ConfigSecret>>) -> Option<String> {
    secret
        .as_ref()
        .map(|secret| secret.expose_secret().as_str().to_owned())
}

/// Storage backend configuration.
///
/// The `__TYPE` environment variable determines which variant is used.
///
/// Used in: [`Config::storage`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Storage {
    /// In-process storage (type `"memory"`).
    ///
    /// Keeps all objects in memory and discards them on exit. Measures the overhead of the
    /// benchmark itself, without any network involved.
    Memory,

    /// S3-compatible storage backend (type `"s3compatible"`).
    ///
    /// Supports [Amazon S3] and other S3-compatible services such as MinIO. Credentials that are
    /// not configured explicitly are taken from the standard AWS environment variables, the
    /// shared credentials file, or instance metadata.
    ///
    /// [Amazon S3]: https://aws.amazon.com/s3/
    S3Compatible {
        /// S3 endpoint URL.
        ///
        /// Examples: `https://s3.eu-west-1.amazonaws.com`, `http://localhost:9000` (for MinIO)
        ///
        /// # Default
        ///
        /// `None` (AWS endpoint of the configured region)
        ///
        /// # Environment Variables
        ///
        /// - `UPLOADBENCH__STORAGE__TYPE=s3compatible`
        /// - `UPLOADBENCH__STORAGE__ENDPOINT=http://localhost:9000`
        #[serde(default)]
        endpoint: Option<String>,

        /// Region used to sign requests.
        ///
        /// # Environment Variable
        ///
        /// `UPLOADBENCH__STORAGE__REGION`
        region: String,

        /// Address buckets as a path component instead of a subdomain.
        ///
        /// Usually required for MinIO and other self-hosted services.
        ///
        /// # Default
        ///
        /// `false`
        ///
        /// # Environment Variable
        ///
        /// `UPLOADBENCH__STORAGE__PATH_STYLE`
        #[serde(default)]
        path_style: bool,

        /// Access key ID.
        ///
        /// # Environment Variable
        ///
        /// `UPLOADBENCH__STORAGE__ACCESS_KEY`
        #[serde(default)]
        access_key: Option<String>,

        /// Secret access key.
        ///
        /// # Environment Variable
        ///
        /// `UPLOADBENCH__STORAGE__SECRET_KEY`
        #[serde(default)]
        secret_key: Option<SecretBox<ConfigSecret>>,

        /// Session token for temporary credentials.
        ///
        /// # Environment Variable
        ///
        /// `UPLOADBENCH__STORAGE__SESSION_TOKEN`
        #[serde(default)]
        session_token: Option<SecretBox<ConfigSecret>>,

        /// Timeout applied to every request sent to the service.
        ///
        /// # Default
        ///
        /// `None` (no timeout beyond the per-upload wait timeout)
        ///
        /// # Environment Variable
        ///
        /// `UPLOADBENCH__STORAGE__REQUEST_TIMEOUT`
        #[serde(default, with = "humantime_serde")]
        request_timeout: Option<Duration>,
    },
}

impl Storage {
    /// Creates the configured backend.
    pub fn create_backend(&self) -> Result<Arc<dyn Backend>> {
        Ok(match self {
            Storage::Memory => Arc::new(InMemoryBackend::new()),
            Storage::S3Compatible {
                endpoint,
                region,
                path_style,
                access_key,
                secret_key,
                session_token,
                request_timeout,
            } => {
                let config = S3CompatibleConfig {
                    endpoint: endpoint.clone(),
                    region: region.clone(),
                    path_style: *path_style,
                    access_key: access_key.clone(),
                    secret_key: expose(secret_key),
                    session_token: expose(session_token),
                    request_timeout: *request_timeout,
                };
                let backend = S3CompatibleBackend::new(config)
                    .context("failed to set up the S3-compatible backend")?;
                Arc::new(backend)
            }
        })
    }
}

/// The set of blobs uploaded in every iteration.
///
/// Used in: [`Config::corpus`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Corpus {
    /// Number of synthetic files.
    ///
    /// # Default
    ///
    /// `50`
    ///
    /// # Environment Variable
    ///
    /// `UPLOADBENCH__CORPUS__FILES`
    pub files: usize,

    /// Size of each synthetic file.
    ///
    /// # Default
    ///
    /// `50 MiB`
    ///
    /// # Environment Variable
    ///
    /// `UPLOADBENCH__CORPUS__FILE_SIZE`
    pub file_size: ByteSize,

    /// Name prefix of synthetic files, followed by the file's index.
    ///
    /// # Default
    ///
    /// `"test_file_"`
    ///
    /// # Environment Variable
    ///
    /// `UPLOADBENCH__CORPUS__NAME_PREFIX`
    pub name_prefix: String,

    /// Seed for the contents of synthetic files.
    ///
    /// # Default
    ///
    /// `None` (random seed per run)
    ///
    /// # Environment Variable
    ///
    /// `UPLOADBENCH__CORPUS__SEED`
    pub seed: Option<u64>,

    /// Directory of real files to upload instead of synthetic ones.
    ///
    /// Every regular file directly inside the directory is uploaded under its file name.
    ///
    /// # Default
    ///
    /// `None` (generate synthetic files)
    ///
    /// # Environment Variable
    ///
    /// `UPLOADBENCH__CORPUS__DIR`
    pub dir: Option<PathBuf>,
}

impl Default for Corpus {
    fn default() -> Self {
        Self {
            files: 50,
            file_size: ByteSize::mib(50),
            name_prefix: "test_file_".to_owned(),
            seed: None,
            dir: None,
        }
    }
}

/// Multipart upload behavior.
///
/// Used in: [`Config::multipart`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Multipart {
    /// Requested size of each part except the last.
    ///
    /// Raised to the backend minimum of 5 MiB, and grown further if a blob would otherwise need
    /// more than 10 000 parts.
    ///
    /// # Default
    ///
    /// `5 MiB`
    ///
    /// # Environment Variable
    ///
    /// `UPLOADBENCH__MULTIPART__MIN_PART_SIZE`
    pub min_part_size: ByteSize,

    /// Blobs smaller than this are uploaded in a single request.
    ///
    /// # Default
    ///
    /// `5 MiB`
    ///
    /// # Environment Variable
    ///
    /// `UPLOADBENCH__MULTIPART__THRESHOLD`
    pub threshold: ByteSize,

    /// MIME type of uploaded objects.
    ///
    /// # Environment Variable
    ///
    /// `UPLOADBENCH__MULTIPART__CONTENT_TYPE`
    pub content_type: Option<String>,

    /// Storage class of uploaded objects, e.g. `STANDARD_IA`.
    ///
    /// # Environment Variable
    ///
    /// `UPLOADBENCH__MULTIPART__STORAGE_CLASS`
    pub storage_class: Option<String>,

    /// Canned ACL of uploaded objects, e.g. `private`.
    ///
    /// # Environment Variable
    ///
    /// `UPLOADBENCH__MULTIPART__ACL`
    pub acl: Option<String>,
}

impl Default for Multipart {
    fn default() -> Self {
        Self {
            min_part_size: ByteSize::mib(5),
            threshold: ByteSize::mib(5),
            content_type: None,
            storage_class: None,
            acl: None,
        }
    }
}

/// Runtime configuration for the Tokio async runtime.
///
/// Used in: [`Config::runtime`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Runtime {
    /// Number of worker threads of the runtime.
    ///
    /// # Default
    ///
    /// Defaults to the number of CPU cores on the host machine.
    ///
    /// # Environment Variable
    ///
    /// `UPLOADBENCH__RUNTIME__WORKER_THREADS`
    pub worker_threads: usize,
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get(),
        }
    }
}

/// Log output format.
///
/// Controls how log messages are formatted. The format can be explicitly specified or
/// auto-detected based on whether output is to a TTY.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect the best format.
    ///
    /// This chooses [`LogFormat::Pretty`] for TTY, otherwise [`LogFormat::Simplified`].
    Auto,

    /// Pretty printing with colors.
    ///
    /// ```text
    ///  INFO uploadbench_runner::collector: upload passed blob=test_file_0 iteration=0
    /// ```
    Pretty,

    /// Simplified plain text output.
    ///
    /// ```text
    /// 2025-07-01T12:10:32Z INFO uploadbench_runner::collector: upload passed blob=test_file_0
    /// ```
    Simplified,

    /// Dump out JSON lines.
    ///
    /// ```text
    /// {"timestamp":"2025-07-01T12:11:08.729716Z","level":"INFO","fields":{"message":"upload passed","blob":"test_file_0"},"target":"uploadbench_runner::collector"}
    /// ```
    Json,
}

mod display_fromstr {
    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
        T: std::fmt::Display,
    {
        serializer.collect_str(&value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        D: serde::Deserializer<'de>,
        T: std::str::FromStr,
        <T as std::str::FromStr>::Err: std::fmt::Display,
    {
        use serde::Deserialize;
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Logging configuration.
///
/// Logs are always written to stderr.
///
/// Used in: [`Config::logging`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Logging {
    /// Minimum log level to output.
    ///
    /// Valid levels in increasing severity: TRACE, DEBUG, INFO, WARN, ERROR, OFF. At DEBUG, every
    /// protocol step of every upload is logged with its duration.
    ///
    /// The `RUST_LOG` environment variable provides more granular control per module if needed.
    ///
    /// # Default
    ///
    /// `INFO`
    ///
    /// # Environment Variable
    ///
    /// `UPLOADBENCH__LOGGING__LEVEL`
    #[serde(with = "display_fromstr")]
    pub level: LevelFilter,

    /// Log output format.
    ///
    /// See [`LogFormat`] for available options and examples.
    ///
    /// # Default
    ///
    /// `Auto` (pretty for TTY, simplified otherwise)
    ///
    /// # Environment Variable
    ///
    /// `UPLOADBENCH__LOGGING__FORMAT`
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Main configuration struct of the benchmark.
///
/// Each field can be overridden through an environment variable, see the field documentation.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Files uploaded in every iteration.
    pub corpus: Corpus,

    /// How long to wait for a single upload before reporting it as timed out.
    ///
    /// This bounds the wait only; the upload itself keeps running until the iteration's worker
    /// pool shuts down.
    ///
    /// # Default
    ///
    /// `5m`
    ///
    /// # Environment Variable
    ///
    /// `UPLOADBENCH__UPLOAD_TIMEOUT`
    #[serde(with = "humantime_serde")]
    pub upload_timeout: Duration,

    /// Pause between two iterations.
    ///
    /// # Default
    ///
    /// `10s`
    ///
    /// # Environment Variable
    ///
    /// `UPLOADBENCH__PAUSE`
    #[serde(with = "humantime_serde")]
    pub pause: Duration,

    /// How long the worker pool may take to finish running uploads at the end of an iteration
    /// before they are aborted.
    ///
    /// # Default
    ///
    /// `5m`
    ///
    /// # Environment Variable
    ///
    /// `UPLOADBENCH__SHUTDOWN_GRACE`
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,

    /// Maximum number of concurrent uploads.
    ///
    /// # Default
    ///
    /// Defaults to the number of CPU cores on the host machine.
    ///
    /// # Environment Variable
    ///
    /// `UPLOADBENCH__CONCURRENCY`
    pub concurrency: usize,

    /// Number of iterations to run before exiting.
    ///
    /// # Default
    ///
    /// `None` (run until terminated)
    ///
    /// # Environment Variable
    ///
    /// `UPLOADBENCH__ITERATIONS`
    pub iterations: Option<u64>,

    /// Multipart upload behavior.
    pub multipart: Multipart,

    /// Where blobs are uploaded to.
    ///
    /// # Default
    ///
    /// AWS S3 in `us-east-1`, with credentials from the environment.
    pub storage: Storage,

    /// Tokio runtime configuration.
    pub runtime: Runtime,

    /// Logging configuration.
    pub logging: Logging,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            corpus: Corpus::default(),
            upload_timeout: Duration::from_secs(5 * 60),
            pause: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5 * 60),
            concurrency: num_cpus::get(),
            iterations: None,
            multipart: Multipart::default(),
            storage: Storage::S3Compatible {
                endpoint: None,
                region: "us-east-1".to_owned(),
                path_style: false,
                access_key: None,
                secret_key: None,
                session_token: None,
                request_timeout: None,
            },
            runtime: Runtime::default(),
            logging: Logging::default(),
        }
    }
}

impl Config {
    /// Loads the configuration from defaults and `UPLOADBENCH__` environment variables.
    pub fn load() -> Result<Self> {
        let config = figment::Figment::from(Serialized::defaults(Config::default()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        Ok(config)
    }

    /// Settings of the benchmark loop derived from this configuration.
    pub fn benchmark_settings(&self) -> BenchmarkSettings {
        BenchmarkSettings {
            upload_timeout: self.upload_timeout,
            pause: self.pause,
            shutdown_grace: self.shutdown_grace,
            concurrency: self.concurrency,
            iterations: self.iterations,
            upload: UploadSettings {
                limits: PartLimits::S3,
                min_part_size: self.multipart.min_part_size.as_u64(),
                multipart_threshold: self.multipart.threshold.as_u64(),
                content_type: self.multipart.content_type.clone(),
                storage_class: self.multipart.storage_class.clone(),
                acl: self.multipart.acl.clone(),
            },
        }
    }
}
