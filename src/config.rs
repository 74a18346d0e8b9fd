//! Configuration types for usenet-engine

use crate::types::ServerId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// One NNTP server the engine may lease connections from
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Stable server id, unique within the pool
    pub id: ServerId,

    /// Server hostname
    pub host: String,

    /// Server port (119 plain, 563 TLS)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for AUTHINFO (None = no authentication)
    #[serde(default)]
    pub username: Option<String>,

    /// Password for AUTHINFO
    #[serde(default)]
    pub password: Option<String>,

    /// Whether to wrap the socket in TLS
    #[serde(default)]
    pub tls: bool,

    /// Whether the server requires GROUP before ARTICLE
    #[serde(default)]
    pub join_group: bool,

    /// Failover tier; 0 = primary. Higher levels are only tried after every
    /// lower-level server has been burned for an article.
    #[serde(default)]
    pub level: u32,

    /// Server group; servers sharing a non-zero group are treated as
    /// interchangeable when one of them fails an article
    #[serde(default)]
    pub group: u32,

    /// Maximum simultaneous connections leased from this server
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl ServerConfig {
    /// Minimal plain-text server entry, for tests and examples
    pub fn new(id: u32, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: ServerId(id),
            host: host.into(),
            port,
            username: None,
            password: None,
            tls: false,
            join_group: false,
            level: 0,
            group: 0,
            max_connections: default_max_connections(),
        }
    }
}

/// Download behavior configuration (directories, retry policy, decoding)
///
/// Groups settings related to how articles are fetched, decoded and stored.
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Destination directory for assembled files (default: "./downloads")
    #[serde(default = "default_dest_dir")]
    pub dest_dir: PathBuf,

    /// Temporary directory for per-article files (default: "./temp")
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// Number of download worker tasks (default: 4)
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Retries on the same server for a generic failure before burning it
    /// (default: 3; 0 behaves like 1)
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Wait between retry attempts (default: 10s); sliced into ≤100ms quanta
    /// so stop/pause are observed promptly
    #[serde(default = "default_retry_interval", with = "duration_secs")]
    pub retry_interval: Duration,

    /// TCP connect + greeting timeout (default: 30s)
    #[serde(default = "default_connection_timeout", with = "duration_secs")]
    pub connection_timeout: Duration,

    /// Timeout for a single line read during article transfer (default: 60s)
    #[serde(default = "default_read_timeout", with = "duration_secs")]
    pub read_timeout: Duration,

    /// Skip articles whose result file already exists from a previous run
    #[serde(default)]
    pub continue_partial: bool,

    /// Write decoded yEnc bytes at their final offset in a pre-allocated
    /// sparse file instead of joining per-article temp files afterwards
    #[serde(default)]
    pub direct_write: bool,

    /// Verify the yEnc part CRC32 (default: true)
    #[serde(default = "default_true")]
    pub crc_check: bool,

    /// Decode article bodies; when false the raw lines are stored as
    /// numbered subfiles ("rawmode")
    #[serde(default = "default_true")]
    pub decode: bool,

    /// Aggregate download rate limit in bytes per second (0 = unlimited)
    #[serde(default)]
    pub download_rate_bps: u64,

    /// Rename files with failed articles to `<name>_broken`
    #[serde(default)]
    pub rename_broken: bool,

    /// Append failed files to `_brokenlog.txt` in the destination directory
    /// (default: true)
    #[serde(default = "default_true")]
    pub create_broken_log: bool,

    /// Buffer size for output file writes in bytes; 0 = unbuffered writes
    #[serde(default = "default_write_buffer_size")]
    pub write_buffer_size: usize,

    /// Maximum simultaneous article downloads per file (default: 8)
    #[serde(default = "default_max_active_per_file")]
    pub max_active_per_file: usize,

    /// Health in permille below which a bundle is deleted from the queue
    /// (0 = never auto-delete)
    #[serde(default)]
    pub critical_health: u32,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            dest_dir: default_dest_dir(),
            temp_dir: default_temp_dir(),
            workers: default_workers(),
            retries: default_retries(),
            retry_interval: default_retry_interval(),
            connection_timeout: default_connection_timeout(),
            read_timeout: default_read_timeout(),
            continue_partial: false,
            direct_write: false,
            crc_check: true,
            decode: true,
            download_rate_bps: 0,
            rename_broken: false,
            create_broken_log: true,
            write_buffer_size: default_write_buffer_size(),
            max_active_per_file: default_max_active_per_file(),
            critical_health: 0,
        }
    }
}

/// Par-repair configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParConfig {
    /// Run par verification/repair when a bundle finishes (default: true)
    #[serde(default = "default_true")]
    pub par_check: bool,

    /// Only unpause recovery files whose base name matches the main par file
    /// exactly; when false, prefix matches are accepted as a fallback
    /// (default: true)
    #[serde(default = "default_true")]
    pub strict_par_name: bool,
}

impl Default for ParConfig {
    fn default() -> Self {
        Self {
            par_check: true,
            strict_par_name: true,
        }
    }
}

/// Top-level engine configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// News servers, in no particular order; failover follows `level`
    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    /// Download behavior
    #[serde(default)]
    pub download: DownloadConfig,

    /// Par-repair behavior
    #[serde(default)]
    pub par: ParConfig,
}

impl Config {
    /// Validate invariants that serde defaults cannot express
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.servers.is_empty() {
            return Err(crate::error::Error::Config {
                message: "at least one server is required".into(),
                key: Some("servers".into()),
            });
        }
        for server in &self.servers {
            if server.max_connections == 0 {
                return Err(crate::error::Error::Config {
                    message: format!("{} has a zero connection budget", server.id),
                    key: Some("servers".into()),
                });
            }
            if server.host.is_empty() {
                return Err(crate::error::Error::Config {
                    message: format!("{} has an empty host", server.id),
                    key: Some("servers".into()),
                });
            }
        }
        if self.download.workers == 0 {
            return Err(crate::error::Error::Config {
                message: "worker count must be at least 1".into(),
                key: Some("download.workers".into()),
            });
        }
        Ok(())
    }
}

fn default_port() -> u16 {
    119
}

fn default_max_connections() -> usize {
    4
}

fn default_dest_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("./temp")
}

fn default_workers() -> usize {
    4
}

fn default_retries() -> u32 {
    3
}

fn default_retry_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_connection_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_write_buffer_size() -> usize {
    64 * 1024
}

fn default_max_active_per_file() -> usize {
    8
}

fn default_true() -> bool {
    true
}

/// Serialize durations as whole seconds, the way the config file writes them
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_download_settings() {
        let config = Config::default();
        assert_eq!(config.download.workers, 4);
        assert_eq!(config.download.retries, 3);
        assert!(config.download.crc_check);
        assert!(config.download.decode);
        assert!(!config.download.direct_write);
        assert_eq!(config.download.download_rate_bps, 0);
    }

    #[test]
    fn validate_rejects_empty_server_list() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_connection_budget() {
        let mut config = Config {
            servers: vec![ServerConfig::new(1, "news.example.com", 119)],
            ..Default::default()
        };
        config.servers[0].max_connections = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_accepts_minimal_config() {
        let config = Config {
            servers: vec![ServerConfig::new(1, "news.example.com", 119)],
            ..Default::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn durations_round_trip_as_seconds() {
        let config = Config {
            servers: vec![ServerConfig::new(1, "news.example.com", 119)],
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.download.retry_interval, Duration::from_secs(10));
        assert_eq!(back.download.connection_timeout, Duration::from_secs(30));
    }

    #[test]
    fn missing_fields_take_defaults() {
        let json = r#"{"servers":[{"id":1,"host":"news.example.com"}]}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.servers[0].port, 119);
        assert_eq!(config.servers[0].max_connections, 4);
        assert_eq!(config.servers[0].level, 0);
        assert!(!config.servers[0].tls);
    }
}
