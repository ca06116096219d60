//! Storage configuration.
use std::{fmt, time::Duration};

use figment::{providers::Env, Figment};
use serde::Deserialize;
use snafu::{ensure, ResultExt as _, Snafu};
use tessera_io::{
    compression::CompressionScheme,
    net::{HttpTransport, TransportError},
};
use tokio::sync::Semaphore;
use url::Url;

use crate::writer::WriteStrategy;

/// Default prefix of the environment variables read by [`StorageConfiguration::from_environment`].
pub const DEFAULT_ENV_PREFIX: &str = "TESSERA_";

/// Number of bulkhead permits per transport connection, when the bulkhead capacity is not set explicitly.
const BULKHEAD_CALLS_PER_CONNECTION: usize = 6;

/// A configuration error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum ConfigurationError {
    /// Environment variable prefix was empty.
    #[snafu(display("Environment variable prefix must not be empty."))]
    EmptyPrefix,

    /// Configuration could not be loaded or deserialized.
    #[snafu(display("Failed to load configuration: {source}"))]
    Load {
        /// Error source.
        source: Box<figment::Error>,
    },

    /// A field has an invalid value.
    #[snafu(display("Invalid value for '{field}': {reason}"))]
    InvalidField {
        /// Name of the invalid field.
        field: &'static str,

        /// Why the value is invalid.
        reason: String,
    },

    /// The transport could not be created.
    #[snafu(display("Failed to create transport: {source}"))]
    CreateTransport {
        /// Error source.
        source: TransportError,
    },
}

impl From<figment::Error> for ConfigurationError {
    fn from(e: figment::Error) -> Self {
        Self::Load { source: Box::new(e) }
    }
}

/// Compression applied to write payloads.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PayloadCompression {
    /// Gzip, at the default level.
    #[default]
    Gzip,

    /// No compression.
    None,
}

const fn default_url() -> &'static str {
    "http://localhost:8086"
}

fn default_url_string() -> String {
    default_url().to_string()
}

fn default_org() -> String {
    "default".to_string()
}

fn default_bucket() -> String {
    "default".to_string()
}

const fn default_allow_backpressure() -> bool {
    true
}

const fn default_max_concurrent_connections() -> usize {
    100
}

const fn default_write_timeout_ms() -> u64 {
    1000
}

const fn default_read_timeout_ms() -> u64 {
    1000
}

const fn default_pooled_buffer_size() -> usize {
    16
}

/// Storage configuration.
#[derive(Clone, Deserialize)]
pub struct StorageConfiguration {
    /// Base URL of the remote store.
    ///
    /// Defaults to `http://localhost:8086`.
    #[serde(default = "default_url_string")]
    pub url: String,

    /// Organization owning the bucket.
    ///
    /// Defaults to `default`.
    #[serde(default = "default_org")]
    pub org: String,

    /// Bucket samples are written to and read from.
    ///
    /// Defaults to `default`.
    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// API token used to authenticate every request.
    pub token: String,

    /// How writes are dispatched.
    ///
    /// Defaults to `bulkhead`.
    #[serde(default)]
    pub write_strategy: WriteStrategy,

    /// Whether callers wait when the writer is saturated.
    ///
    /// When disabled, saturated writes are dropped immediately instead of waiting for capacity.
    ///
    /// Defaults to `true`.
    #[serde(default = "default_allow_backpressure")]
    pub allow_backpressure: bool,

    /// Maximum number of concurrent connections to the remote store.
    ///
    /// Defaults to 100.
    #[serde(default = "default_max_concurrent_connections")]
    pub max_concurrent_connections: usize,

    /// Time allowed, in milliseconds, between sending a request and receiving the response headers.
    ///
    /// Defaults to 1000.
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Time allowed, in milliseconds, for reading a response body.
    ///
    /// Defaults to 1000.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Maximum time, in milliseconds, a write waits for a free bulkhead permit.
    ///
    /// Unset waits indefinitely.
    #[serde(default)]
    pub bulkhead_max_wait_ms: Option<u64>,

    /// Number of bulkhead permits.
    ///
    /// Defaults to six times `max_concurrent_connections`.
    #[serde(default)]
    pub bulkhead_max_concurrent_calls: Option<usize>,

    /// Number of batches the pooled writer queues before applying backpressure.
    ///
    /// Defaults to 16.
    #[serde(default = "default_pooled_buffer_size")]
    pub pooled_buffer_size: usize,

    /// Compression applied to write payloads.
    ///
    /// Defaults to `gzip`.
    #[serde(default)]
    pub compression: PayloadCompression,
}

impl StorageConfiguration {
    /// Creates a configuration with default values and the given token.
    pub fn new<T: Into<String>>(token: T) -> Self {
        Self {
            url: default_url_string(),
            org: default_org(),
            bucket: default_bucket(),
            token: token.into(),
            write_strategy: WriteStrategy::default(),
            allow_backpressure: default_allow_backpressure(),
            max_concurrent_connections: default_max_concurrent_connections(),
            write_timeout_ms: default_write_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            bulkhead_max_wait_ms: None,
            bulkhead_max_concurrent_calls: None,
            pooled_buffer_size: default_pooled_buffer_size(),
            compression: PayloadCompression::default(),
        }
    }

    /// Loads and validates a configuration from the given figment.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be deserialized, or fails validation, an error is returned.
    pub fn from_figment(figment: &Figment) -> Result<Self, ConfigurationError> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a configuration from environment variables with the given prefix.
    ///
    /// Variable names are the field names, upper-cased, after the prefix: `TESSERA_MAX_CONCURRENT_CONNECTIONS`.
    ///
    /// # Errors
    ///
    /// If the prefix is empty, the configuration cannot be deserialized, or it fails validation, an error is returned.
    pub fn from_environment(prefix: &str) -> Result<Self, ConfigurationError> {
        ensure!(!prefix.is_empty(), EmptyPrefix);
        Self::from_figment(&Figment::new().merge(Env::prefixed(prefix)))
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// If any field has an invalid value, an error is returned.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.base_url()?;
        ensure!(
            !self.token.is_empty(),
            InvalidField {
                field: "token",
                reason: "must not be empty"
            }
        );
        ensure!(
            self.max_concurrent_connections > 0,
            InvalidField {
                field: "max_concurrent_connections",
                reason: "must be greater than zero"
            }
        );
        ensure!(
            self.max_concurrent_connections <= Semaphore::MAX_PERMITS,
            InvalidField {
                field: "max_concurrent_connections",
                reason: format!("must not exceed {}", Semaphore::MAX_PERMITS),
            }
        );
        ensure!(
            self.bulkhead_capacity() > 0,
            InvalidField {
                field: "bulkhead_max_concurrent_calls",
                reason: "must be greater than zero"
            }
        );
        ensure!(
            self.bulkhead_capacity() <= Semaphore::MAX_PERMITS,
            InvalidField {
                field: "bulkhead_max_concurrent_calls",
                reason: format!("must not exceed {}", Semaphore::MAX_PERMITS),
            }
        );
        ensure!(
            self.pooled_buffer_size > 0,
            InvalidField {
                field: "pooled_buffer_size",
                reason: "must be greater than zero"
            }
        );
        Ok(())
    }

    /// Returns the number of bulkhead permits.
    pub fn bulkhead_capacity(&self) -> usize {
        self.bulkhead_max_concurrent_calls
            .unwrap_or_else(|| self.max_concurrent_connections.saturating_mul(BULKHEAD_CALLS_PER_CONNECTION))
    }

    /// Returns the maximum time a write waits for a bulkhead permit, or `None` if unbounded.
    pub fn bulkhead_max_wait(&self) -> Option<Duration> {
        self.bulkhead_max_wait_ms.map(Duration::from_millis)
    }

    /// Returns the write timeout.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Returns the read timeout.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Returns the compression scheme for write payloads.
    pub fn compression_scheme(&self) -> CompressionScheme {
        match self.compression {
            PayloadCompression::Gzip => CompressionScheme::gzip_default(),
            PayloadCompression::None => CompressionScheme::noop(),
        }
    }

    fn base_url(&self) -> Result<Url, ConfigurationError> {
        let url = Url::parse(&self.url).map_err(|e| {
            InvalidField {
                field: "url",
                reason: e.to_string(),
            }
            .build()
        })?;
        ensure!(
            matches!(url.scheme(), "http" | "https"),
            InvalidField {
                field: "url",
                reason: format!("unsupported scheme '{}'", url.scheme()),
            }
        );
        Ok(url)
    }

    /// Returns the write endpoint: `{url}/api/v2/write?org={org}&bucket={bucket}&precision=ms`.
    ///
    /// # Errors
    ///
    /// If the base URL is invalid, an error is returned.
    pub fn write_url(&self) -> Result<Url, ConfigurationError> {
        let mut url = self.base_url()?;
        {
            let mut segments = url.path_segments_mut().map_err(|()| {
                InvalidField {
                    field: "url",
                    reason: "cannot be used as a base",
                }
                .build()
            })?;
            segments.pop_if_empty().extend(["api", "v2", "write"]);
        }
        url.query_pairs_mut()
            .clear()
            .append_pair("org", &self.org)
            .append_pair("bucket", &self.bucket)
            .append_pair("precision", "ms");
        Ok(url)
    }

    /// Builds an HTTP transport for the configured store.
    ///
    /// TLS is enabled when the base URL uses `https`.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, or the transport cannot be created, an error is returned.
    pub fn build_transport(&self) -> Result<HttpTransport, ConfigurationError> {
        self.validate()?;
        let url = self.base_url()?;
        HttpTransport::builder()
            .with_tls(url.scheme() == "https")
            .with_max_connections(self.max_concurrent_connections)
            .with_write_timeout(self.write_timeout())
            .with_read_timeout(self.read_timeout())
            .build()
            .context(CreateTransport)
    }
}

impl fmt::Debug for StorageConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfiguration")
            .field("url", &self.url)
            .field("org", &self.org)
            .field("bucket", &self.bucket)
            .field("token", &"<redacted>")
            .field("write_strategy", &self.write_strategy)
            .field("allow_backpressure", &self.allow_backpressure)
            .field("max_concurrent_connections", &self.max_concurrent_connections)
            .field("write_timeout_ms", &self.write_timeout_ms)
            .field("read_timeout_ms", &self.read_timeout_ms)
            .field("bulkhead_max_wait_ms", &self.bulkhead_max_wait_ms)
            .field("bulkhead_max_concurrent_calls", &self.bulkhead_max_concurrent_calls)
            .field("pooled_buffer_size", &self.pooled_buffer_size)
            .field("compression", &self.compression)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    #[test]
    fn defaults() {
        let config = StorageConfiguration::new("secret");
        config.validate().unwrap();

        assert_eq!(config.url, default_url());
        assert_eq!(config.write_strategy, WriteStrategy::Bulkhead);
        assert!(config.allow_backpressure);
        assert_eq!(config.bulkhead_capacity(), 600);
        assert_eq!(config.bulkhead_max_wait(), None);
        assert_eq!(config.write_timeout(), Duration::from_secs(1));
        assert_eq!(config.compression, PayloadCompression::Gzip);
    }

    #[test]
    fn write_url_keeps_base_path() {
        let mut config = StorageConfiguration::new("secret");
        config.org = "acme corp".to_string();
        config.bucket = "metrics".to_string();
        assert_eq!(
            config.write_url().unwrap().as_str(),
            "http://localhost:8086/api/v2/write?org=acme+corp&bucket=metrics&precision=ms"
        );

        config.url = "https://tsdb.example.com/influx/".to_string();
        assert_eq!(
            config.write_url().unwrap().as_str(),
            "https://tsdb.example.com/influx/api/v2/write?org=acme+corp&bucket=metrics&precision=ms"
        );
    }

    #[test]
    fn validation() {
        let mut config = StorageConfiguration::new("");
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidField { field: "token", .. })
        ));

        config.token = "secret".to_string();
        config.max_concurrent_connections = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidField {
                field: "max_concurrent_connections",
                ..
            })
        ));

        config.max_concurrent_connections = 1;
        config.bulkhead_max_concurrent_calls = Some(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidField {
                field: "bulkhead_max_concurrent_calls",
                ..
            })
        ));

        config.bulkhead_max_concurrent_calls = Some(usize::MAX);
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidField {
                field: "bulkhead_max_concurrent_calls",
                ..
            })
        ));

        // The derived bulkhead capacity saturates rather than overflowing, and is still bounded.
        config.bulkhead_max_concurrent_calls = None;
        config.max_concurrent_connections = Semaphore::MAX_PERMITS / 2;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidField {
                field: "bulkhead_max_concurrent_calls",
                ..
            })
        ));

        config.max_concurrent_connections = usize::MAX;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidField {
                field: "max_concurrent_connections",
                ..
            })
        ));

        config.max_concurrent_connections = 1;
        config.url = "ftp://localhost".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidField { field: "url", .. })
        ));

        config.url = "localhost:8086".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn token_is_not_printed() {
        let config = StorageConfiguration::new("hunter2");
        assert!(!format!("{:?}", config).contains("hunter2"));
    }

    #[test]
    fn from_environment() {
        Jail::expect_with(|jail| {
            jail.set_env("TESSERA_TOKEN", "secret");
            jail.set_env("TESSERA_URL", "https://tsdb.example.com");
            jail.set_env("TESSERA_WRITE_STRATEGY", "pooled");
            jail.set_env("TESSERA_ALLOW_BACKPRESSURE", "false");
            jail.set_env("TESSERA_MAX_CONCURRENT_CONNECTIONS", "8");
            jail.set_env("TESSERA_BULKHEAD_MAX_WAIT_MS", "250");
            jail.set_env("TESSERA_COMPRESSION", "none");

            let config = StorageConfiguration::from_environment(DEFAULT_ENV_PREFIX).unwrap();
            assert_eq!(config.url, "https://tsdb.example.com");
            assert_eq!(config.write_strategy, WriteStrategy::Pooled);
            assert!(!config.allow_backpressure);
            assert_eq!(config.bulkhead_capacity(), 48);
            assert_eq!(config.bulkhead_max_wait(), Some(Duration::from_millis(250)));
            assert_eq!(config.compression, PayloadCompression::None);
            assert_eq!(config.org, "default");
            Ok(())
        });
    }

    #[test]
    fn missing_token_fails_to_load() {
        Jail::expect_with(|_| {
            let err = StorageConfiguration::from_environment("TESSERA_TEST_UNSET_").unwrap_err();
            assert!(matches!(err, ConfigurationError::Load { .. }));
            Ok(())
        });

        assert!(matches!(
            StorageConfiguration::from_environment(""),
            Err(ConfigurationError::EmptyPrefix)
        ));
    }
}
