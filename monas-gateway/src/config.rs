//! Gateway configuration, loaded from TOML

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::infrastructure::ipfs::DEFAULT_IPFS_API;
use crate::presentation::scgi::ListenTarget;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct GatewayConfig {
    /// IPFS RPC API configuration
    #[serde(default)]
    pub ipfs: IpfsConfig,

    /// Key collection configuration
    #[serde(default)]
    pub keys: KeysConfig,

    /// SCGI listener configuration
    #[serde(default)]
    pub scgi: ScgiConfig,
}

impl GatewayConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Self::from_toml_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

/// IPFS RPC API configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct IpfsConfig {
    /// RPC API address, a multiaddr or an `http(s)://` URL
    #[serde(default = "default_ipfs_api")]
    pub api: String,

    /// Per-request timeout in seconds. Unset means requests never time out.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Query the daemon's version before serving
    #[serde(default = "default_true")]
    pub check_on_startup: bool,
}

impl IpfsConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

impl Default for IpfsConfig {
    fn default() -> Self {
        Self {
            api: default_ipfs_api(),
            timeout_secs: None,
            check_on_startup: true,
        }
    }
}

fn default_ipfs_api() -> String {
    DEFAULT_IPFS_API.to_string()
}

fn default_true() -> bool {
    true
}

/// Key collection configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct KeysConfig {
    /// File with one JWK per line
    #[serde(default = "default_keys_file")]
    pub file: PathBuf,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            file: default_keys_file(),
        }
    }
}

fn default_keys_file() -> PathBuf {
    PathBuf::from("keys.jsonarray")
}

/// SCGI listener configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ScgiConfig {
    /// Unix socket path
    #[serde(default = "default_socket")]
    pub socket: PathBuf,

    /// TCP address; takes precedence over `socket` when set
    #[serde(default)]
    pub listen: Option<SocketAddr>,

    /// Largest accepted frame header block, in bytes
    #[serde(default = "default_max_header_len")]
    pub max_header_len: usize,
}

impl ScgiConfig {
    pub fn listen_target(&self) -> ListenTarget {
        match self.listen {
            Some(addr) => ListenTarget::Tcp(addr),
            None => ListenTarget::Unix(self.socket.clone()),
        }
    }
}

impl Default for ScgiConfig {
    fn default() -> Self {
        Self {
            socket: default_socket(),
            listen: None,
            max_header_len: default_max_header_len(),
        }
    }
}

fn default_socket() -> PathBuf {
    PathBuf::from("ipfs-jwe-scgi.socket")
}

fn default_max_header_len() -> usize {
    1024 * 1024
}

/// Configuration error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_default() {
        let config = GatewayConfig::default();
        assert_eq!(config.ipfs.api, "/ip4/127.0.0.1/tcp/5001");
        assert_eq!(config.ipfs.timeout(), None);
        assert!(config.ipfs.check_on_startup);
        assert_eq!(config.keys.file, PathBuf::from("keys.jsonarray"));
        assert_eq!(
            config.scgi.listen_target(),
            ListenTarget::Unix(PathBuf::from("ipfs-jwe-scgi.socket"))
        );
        assert_eq!(config.scgi.max_header_len, 1024 * 1024);
    }

    #[test]
    fn test_config_from_str() {
        let toml_content = r#"
[ipfs]
api = "/dns4/ipfs.internal/tcp/5001"
timeout_secs = 30
check_on_startup = false

[keys]
file = "/etc/gateway/keys.jsonarray"

[scgi]
listen = "127.0.0.1:4000"
max_header_len = 4096
"#;

        let config = GatewayConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.ipfs.api, "/dns4/ipfs.internal/tcp/5001");
        assert_eq!(config.ipfs.timeout(), Some(Duration::from_secs(30)));
        assert!(!config.ipfs.check_on_startup);
        assert_eq!(config.keys.file, PathBuf::from("/etc/gateway/keys.jsonarray"));
        assert_eq!(
            config.scgi.listen_target(),
            ListenTarget::Tcp("127.0.0.1:4000".parse().unwrap())
        );
        assert_eq!(config.scgi.max_header_len, 4096);
    }

    #[test]
    fn test_config_partial() {
        let config = GatewayConfig::from_toml_str("[scgi]\nsocket = \"/run/gw.socket\"\n").unwrap();
        assert_eq!(config.scgi.socket, PathBuf::from("/run/gw.socket"));
        assert_eq!(config.scgi.max_header_len, 1024 * 1024);
        assert_eq!(config.ipfs, IpfsConfig::default());
        assert_eq!(config.keys, KeysConfig::default());
    }

    #[test]
    fn test_config_empty() {
        assert_eq!(GatewayConfig::from_toml_str("").unwrap(), GatewayConfig::default());
    }

    #[test]
    fn test_config_errors() {
        let err = GatewayConfig::from_toml_str("[scgi]\nlisten = \"not an address\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));

        let err = GatewayConfig::from_file("/nonexistent/gateway.toml").unwrap_err();
        assert!(matches!(err, ConfigError::IoError(_)));
    }

    #[test]
    fn test_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[keys]\nfile = \"k.jsonarray\"").unwrap();

        let config = GatewayConfig::from_file(file.path()).unwrap();
        assert_eq!(config.keys.file, PathBuf::from("k.jsonarray"));
    }
}
