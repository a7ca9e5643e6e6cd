use crate::api::node::{ScorebookNodeConfig, IDENTITY_FILE};
use crate::api::options::RaftOptions;
use crate::crypto::SecretFileError;
use crate::membership::NodeIdentity;
use crate::server::NodeTls;
use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs, io};
use zeroize::Zeroizing;

const DEFAULT_KEY_SECRET_ENV: &str = "SCOREBOOK_KEY_SECRET";

/// NodeConfig is the on-disk TOML form of a node's configuration.
///
/// ```toml
/// data_directory = "/var/lib/scorebook"
/// ip_addr = "10.0.0.1"
/// raft_port = 7000
/// sync_port = 8000
/// bootstrap = ["10.0.0.1:8000", "10.0.0.2:8000", "10.0.0.3:8000"]
/// cluster_secret = "..."
///
/// [tls]
/// cert = "/etc/scorebook/node.pem"
/// key = "/etc/scorebook/node.key"
/// ca = "/etc/scorebook/cluster-ca.pem"
///
/// [raft]
/// snapshot_threshold = 2048
/// ```
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub data_directory: PathBuf,
    pub ip_addr: Ipv4Addr,
    pub raft_port: u16,
    pub sync_port: u16,
    /// Sync-port addresses of the founding members, ourselves included.
    #[serde(default)]
    pub bootstrap: Vec<SocketAddr>,
    /// Start as a non-voting newcomer and wait for an operator `AddNode`.
    #[serde(default)]
    pub join: bool,
    pub cluster_secret: String,
    /// Environment variable holding the secret that unlocks the key ring and node identity.
    #[serde(default = "default_key_secret_env")]
    pub key_secret_env: String,
    #[serde(default = "default_bootstrap_attempts")]
    pub bootstrap_attempts: u32,
    #[serde(default = "default_max_clock_skew_ms")]
    pub max_clock_skew_ms: u64,
    pub tls: TlsSection,
    #[serde(default)]
    pub raft: RaftSection,
}

/// `[tls]` table of PEM files. The certificate must carry the names `node_certificate_names()`
/// gives for this node's id.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsSection {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: PathBuf,
}

/// Optional `[raft]` table. Durations are in milliseconds.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RaftSection {
    pub leader_heartbeat_ms: Option<u64>,
    pub follower_min_timeout_ms: Option<u64>,
    pub follower_max_timeout_ms: Option<u64>,
    pub leader_append_entries_timeout_ms: Option<u64>,
    pub snapshot_threshold: Option<u64>,
    pub retained_snapshots: Option<usize>,
    pub key_gc_interval_ms: Option<u64>,
    pub key_rotation_interval_ms: Option<u64>,
    pub max_in_flight_writes: Option<usize>,
    pub rate_limit_retry_after_ms: Option<u64>,
    pub write_apply_timeout_ms: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0:?}: {1}")]
    Read(PathBuf, io::Error),
    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Key ring secret variable {0} is not set")]
    MissingKeySecret(String),
    #[error("Cluster secret must not be empty")]
    EmptyClusterSecret,
    #[error("Failed to load TLS material: {0}")]
    Tls(io::Error),
    #[error("Failed to open node identity: {0}")]
    Identity(SecretFileError),
}

fn default_key_secret_env() -> String {
    DEFAULT_KEY_SECRET_ENV.to_string()
}

fn default_bootstrap_attempts() -> u32 {
    20
}

fn default_max_clock_skew_ms() -> u64 {
    30_000
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = toml::from_str(text)?;
        if config.cluster_secret.is_empty() {
            return Err(ConfigError::EmptyClusterSecret);
        }
        Ok(config)
    }

    /// Resolves secrets from the environment. A missing key secret is fatal: the key ring can't be
    /// opened without it.
    pub fn into_node_config(self, info_logger: slog::Logger) -> Result<ScorebookNodeConfig, ConfigError> {
        let key_secret = self.key_secret()?;
        let tls = NodeTls::load(&self.tls.cert, &self.tls.key, &self.tls.ca).map_err(ConfigError::Tls)?;

        Ok(ScorebookNodeConfig {
            data_directory: self.data_directory,
            ip_addr: self.ip_addr,
            raft_port: self.raft_port,
            sync_port: self.sync_port,
            bootstrap: self.bootstrap,
            join: self.join,
            cluster_secret: self.cluster_secret,
            key_secret,
            tls,
            bootstrap_attempts: self.bootstrap_attempts,
            max_clock_skew: Duration::from_millis(self.max_clock_skew_ms),
            info_logger,
            options: RaftOptions::from(self.raft),
        })
    }

    /// Opens this node's identity, creating it on first use, without starting the node. The cluster
    /// CA needs the node id before it can issue the node's certificate.
    pub fn open_identity(&self) -> Result<NodeIdentity, ConfigError> {
        let key_secret = self.key_secret()?;
        fs::create_dir_all(&self.data_directory).map_err(|e| ConfigError::Read(self.data_directory.clone(), e))?;
        NodeIdentity::load_or_create(self.data_directory.join(IDENTITY_FILE), &key_secret).map_err(ConfigError::Identity)
    }

    fn key_secret(&self) -> Result<Zeroizing<Vec<u8>>, ConfigError> {
        env::var(&self.key_secret_env)
            .ok()
            .filter(|s| !s.is_empty())
            .map(|s| Zeroizing::new(s.into_bytes()))
            .ok_or_else(|| ConfigError::MissingKeySecret(self.key_secret_env.clone()))
    }
}

// ------- Conversions --------

impl From<RaftSection> for RaftOptions {
    fn from(section: RaftSection) -> Self {
        RaftOptions {
            leader_heartbeat_duration: section.leader_heartbeat_ms.map(Duration::from_millis),
            follower_min_timeout: section.follower_min_timeout_ms.map(Duration::from_millis),
            follower_max_timeout: section.follower_max_timeout_ms.map(Duration::from_millis),
            leader_append_entries_timeout: section.leader_append_entries_timeout_ms.map(Duration::from_millis),
            snapshot_threshold: section.snapshot_threshold,
            retained_snapshots: section.retained_snapshots,
            key_gc_interval: section.key_gc_interval_ms.map(Duration::from_millis),
            key_rotation_interval: section.key_rotation_interval_ms.map(Duration::from_millis),
            max_in_flight_writes: section.max_in_flight_writes,
            rate_limit_retry_after: section.rate_limit_retry_after_ms.map(Duration::from_millis),
            write_apply_timeout: section.write_apply_timeout_ms.map(Duration::from_millis),
            restore_workers: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        data_directory = "/tmp/scorebook"
        ip_addr = "127.0.0.1"
        raft_port = 7000
        sync_port = 8000
        bootstrap = ["127.0.0.1:8000", "127.0.0.1:8001"]
        cluster_secret = "s3cret"

        [tls]
        cert = "/etc/scorebook/node.pem"
        key = "/etc/scorebook/node.key"
        ca = "/etc/scorebook/cluster-ca.pem"

        [raft]
        snapshot_threshold = 64
        leader_heartbeat_ms = 50
        key_rotation_interval_ms = 86400000
    "#;

    #[test]
    fn parses_with_defaults() {
        let config = NodeConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.sync_port, 8000);
        assert_eq!(config.bootstrap.len(), 2);
        assert!(!config.join);
        assert_eq!(config.key_secret_env, DEFAULT_KEY_SECRET_ENV);
        assert_eq!(config.bootstrap_attempts, 20);

        let options = RaftOptions::from(config.raft);
        assert_eq!(options.snapshot_threshold, Some(64));
        assert_eq!(options.leader_heartbeat_duration, Some(Duration::from_millis(50)));
        assert_eq!(options.follower_min_timeout, None);
        assert_eq!(options.key_rotation_interval, Some(Duration::from_secs(86_400)));
    }

    #[test]
    fn rejects_unknown_fields_and_empty_secret() {
        let typo = MINIMAL.replace("raft_port", "raft_prot");
        assert!(matches!(NodeConfig::from_toml_str(&typo), Err(ConfigError::Parse(_))));

        let no_secret = MINIMAL.replace("\"s3cret\"", "\"\"");
        assert!(matches!(
            NodeConfig::from_toml_str(&no_secret),
            Err(ConfigError::EmptyClusterSecret)
        ));
    }

    #[test]
    fn tls_section_is_required() {
        let start = MINIMAL.find("[tls]").unwrap();
        let end = MINIMAL.find("[raft]").unwrap();
        let without_tls = format!("{}{}", &MINIMAL[..start], &MINIMAL[end..]);
        assert!(matches!(NodeConfig::from_toml_str(&without_tls), Err(ConfigError::Parse(_))));

        let config = NodeConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.tls.ca, PathBuf::from("/etc/scorebook/cluster-ca.pem"));
    }

    #[test]
    fn missing_key_secret_is_fatal() {
        let mut config = NodeConfig::from_toml_str(MINIMAL).unwrap();
        config.key_secret_env = "SCOREBOOK_TEST_UNSET_SECRET_VARIABLE".to_string();
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        assert!(matches!(
            config.into_node_config(logger),
            Err(ConfigError::MissingKeySecret(_))
        ));
    }
}
