use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Fragproxy configuration loaded from YAML.
///
/// This structure defines all configuration options for the tunnel proxy:
/// listen addresses, relay buffer sizing, metrics configuration, and the
/// optional fragmentation blocklist.
#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    /// List of addresses to listen on (e.g., "0.0.0.0:8881", "[::]:8881")
    pub listen_addrs: Vec<String>,
    /// Relay read buffer size in bytes (default: 4096)
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Prometheus metrics configuration
    pub metrics: Metrics,
    /// Optional list of hostnames to fragment. When present, only TLS
    /// handshakes mentioning one of these names are split; when absent,
    /// every port-443 tunnel is fragmented.
    #[serde(default)]
    pub blocklist: Option<Vec<String>>,
}

fn default_buffer_size() -> usize {
    4096
}

/// Prometheus metrics server configuration.
#[derive(Debug, Serialize, Deserialize)]
pub struct Metrics {
    /// Whether to enable metrics collection
    pub enabled: bool,
    /// Address to bind metrics HTTP server (e.g., "127.0.0.1:9100")
    pub address: String,
}

impl Config {
    /// Loads configuration from a YAML file.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use fragproxy_config::Config;
    /// use std::path::Path;
    ///
    /// let config = Config::from_file(Path::new("config.yaml")).unwrap();
    /// ```
    pub fn from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)?;
        let config = serde_yaml_ng::from_str(&contents)?;
        Ok(config)
    }

    /// Parses configuration from a YAML string.
    ///
    /// This is primarily used for testing and programmatic configuration.
    ///
    /// # Examples
    ///
    /// ```
    /// use fragproxy_config::Config;
    ///
    /// let yaml = r#"
    /// listen_addrs:
    ///   - "127.0.0.1:8881"
    /// metrics:
    ///   enabled: false
    ///   address: "127.0.0.1:9100"
    /// "#;
    ///
    /// let config = Config::parse(yaml).unwrap();
    /// assert_eq!(config.listen_addrs[0], "127.0.0.1:8881");
    /// assert_eq!(config.buffer_size, 4096);
    /// ```
    pub fn parse(contents: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let config = serde_yaml_ng::from_str(contents)?;
        Ok(config)
    }
}

/// Checks whether a captured ClientHello body mentions any blocklisted name.
///
/// The match is a plain byte substring search over the raw handshake body,
/// where the server name appears in cleartext. Empty patterns never match.
///
/// # Examples
///
/// ```
/// use fragproxy_config::blocklist_matches;
///
/// let body = b"\x00\x00\x10example.com\x00";
/// assert!(blocklist_matches(body, &["example.com".to_string()]));
/// assert!(!blocklist_matches(body, &["other.org".to_string()]));
/// ```
pub fn blocklist_matches(body: &[u8], blocklist: &[String]) -> bool {
    blocklist.iter().any(|name| {
        let pat = name.as_bytes();
        !pat.is_empty() && body.windows(pat.len()).any(|window| window == pat)
    })
}
