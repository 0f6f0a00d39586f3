//! Configuration management
//!
//! The file format mirrors the deployed YAML surface but loads as TOML:
//! role, listeners, remote paths, shared secret, mimicry cosmetics,
//! obfuscation and stealth knobs, mux tuning, and port mappings. Defaults
//! match the values proven out in production profiles.

use crate::channel::ChannelConfig;
use crate::crypto::PacketKey;
use crate::mux::SessionConfig;
use crate::obfs::fragment::FragmentPolicy;
use crate::obfs::{BurstPolicy, DelayPolicy, PaddingPolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Node role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Edge: inside the restricted network, fronts user listeners
    Server,
    /// Origin: outside, dials the edge and the final targets
    Client,
}

/// Transport for one remote path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Tls,
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mode: Mode,

    /// Edge bind address (merged into `listen_ports`)
    #[serde(default)]
    pub listen: Option<String>,

    /// Edge bind addresses; every listener feeds the same session pool
    #[serde(default)]
    pub listen_ports: Vec<String>,

    /// Shared secret; empty selects unencrypted framing (loopback tests only)
    #[serde(default)]
    pub psk: String,

    /// TLS certificate/key for the edge listeners
    #[serde(default)]
    pub cert_file: Option<String>,
    #[serde(default)]
    pub key_file: Option<String>,

    /// Origin's remote endpoints
    #[serde(default)]
    pub paths: Vec<PathConfig>,

    #[serde(default)]
    pub mimic: MimicConfig,
    #[serde(default)]
    pub obfs: ObfsConfig,
    #[serde(default)]
    pub stealth: StealthConfig,
    #[serde(default)]
    pub fragment: FragmentConfig,
    #[serde(default)]
    pub mux: MuxTuning,
    #[serde(default)]
    pub advanced: AdvancedConfig,
    #[serde(default)]
    pub forward: ForwardConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
}

/// One remote endpoint the origin maintains connections to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    pub addr: String,
    #[serde(default = "default_transport")]
    pub transport: Transport,
    #[serde(default = "default_connection_pool")]
    pub connection_pool: usize,
    /// Base retry interval in seconds
    #[serde(default = "default_retry_interval")]
    pub retry_interval: u64,
    /// Dial timeout in seconds
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout: u64,
}

fn default_transport() -> Transport {
    Transport::Tcp
}
fn default_connection_pool() -> usize {
    4
}
fn default_retry_interval() -> u64 {
    3
}
fn default_dial_timeout() -> u64 {
    10
}

/// Handshake cosmetics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MimicConfig {
    pub fake_domain: String,
    /// `{rand}` is substituted with a random token per connection
    pub fake_path: String,
    pub user_agent: String,
    /// Extra request headers, `"Name: value"` form
    pub custom_headers: Vec<String>,
    pub session_cookie: bool,
}

impl Default for MimicConfig {
    fn default() -> Self {
        Self {
            fake_domain: "www.google.com".to_string(),
            fake_path: "/search".to_string(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36"
                .to_string(),
            custom_headers: Vec::new(),
            session_cookie: true,
        }
    }
}

/// Padding/jitter policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObfsConfig {
    pub enabled: bool,
    pub min_padding: usize,
    pub max_padding: usize,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ObfsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_padding: 16,
            max_padding: 64,
            min_delay_ms: 0,
            max_delay_ms: 0,
        }
    }
}

/// DPI-resistance knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StealthConfig {
    pub random_padding: bool,
    pub min_padding: usize,
    pub max_padding: usize,
    /// Keepalive jitter in seconds (± jitter·500 ms on each interval)
    pub keepalive_jitter: u64,
    /// Worker start stagger upper bound in milliseconds
    pub conn_jitter_ms: u64,
    pub burst_split: bool,
    pub max_burst_size: usize,
    pub fake_traffic: bool,
    /// Base fake-traffic period in seconds
    pub fake_traffic_interval: u64,
}

impl Default for StealthConfig {
    fn default() -> Self {
        Self {
            random_padding: true,
            min_padding: 16,
            max_padding: 128,
            keepalive_jitter: 2,
            conn_jitter_ms: 500,
            burst_split: false,
            max_burst_size: 4096,
            fake_traffic: false,
            fake_traffic_interval: 30,
        }
    }
}

/// First-write fragmentation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FragmentConfig {
    pub enabled: bool,
    pub min_size: usize,
    pub max_size: usize,
    /// Inter-fragment delay bounds in milliseconds
    pub min_delay: u64,
    pub max_delay: u64,
}

impl Default for FragmentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_size: 64,
            max_size: 191,
            min_delay: 1,
            max_delay: 3,
        }
    }
}

/// Multiplexer tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxTuning {
    /// Keepalive interval in seconds
    pub keepalive: u64,
    pub max_recv: u32,
    /// Per-substream window in bytes
    pub max_stream: u32,
    pub frame_size: usize,
    pub version: u32,
}

impl Default for MuxTuning {
    fn default() -> Self {
        Self {
            keepalive: 2,
            max_recv: 1_048_576,
            max_stream: 1_048_576,
            frame_size: 4096,
            version: 2,
        }
    }
}

/// System knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvancedConfig {
    pub tcp_nodelay: bool,
    /// TCP keepalive period in seconds
    pub tcp_keepalive: u64,
    pub tcp_read_buffer: usize,
    pub tcp_write_buffer: usize,
    pub max_streams_per_session: usize,
    pub max_connections: usize,
    /// Idle UDP flow lifetime in seconds
    pub udp_flow_timeout: u64,
    /// Cap on concurrent UDP flows per listener
    pub max_udp_flows: usize,
    pub udp_buffer_size: usize,
    /// Pool health sweep cadence in seconds
    pub cleanup_interval: u64,
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            tcp_keepalive: 5,
            tcp_read_buffer: 65536,
            tcp_write_buffer: 65536,
            max_streams_per_session: 512,
            max_connections: 500,
            udp_flow_timeout: 120,
            max_udp_flows: 300,
            udp_buffer_size: 524_288,
            cleanup_interval: 3,
        }
    }
}

/// Edge port mappings, `"<bind>-><target>"` entries
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardConfig {
    pub tcp: Vec<String>,
    pub udp: Vec<String>,
}

/// Origin-local forward proxy listeners
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub socks5_listen: Option<String>,
    pub http_listen: Option<String>,
}

impl Config {
    /// Load and normalize a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("failed to read config: {e}")))?;
        let mut config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("failed to parse config: {e}")))?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Apply cross-field defaults.
    pub fn normalize(&mut self) {
        if self.mode == Mode::Server {
            if self.listen_ports.is_empty() {
                if let Some(listen) = self.listen.clone() {
                    self.listen_ports.push(listen);
                }
            }
            if self.listen_ports.is_empty() {
                self.listen_ports.push("0.0.0.0:2020".to_string());
            }
        }

        // TLS first flights get fragmented unless explicitly configured
        if !self.fragment.enabled && self.paths.iter().any(|p| p.transport == Transport::Tls) {
            self.fragment.enabled = true;
        }

        // The padded body length prefix is a u16
        self.stealth.max_burst_size = self.stealth.max_burst_size.clamp(1024, 65535);
    }

    pub fn validate(&self) -> crate::Result<()> {
        match self.mode {
            Mode::Server => {
                if self.listen_ports.is_empty() {
                    return Err(crate::Error::Config("server requires listen_ports".into()));
                }
            }
            Mode::Client => {
                if self.paths.is_empty() {
                    return Err(crate::Error::Config("client requires at least one path".into()));
                }
                for path in &self.paths {
                    if path.addr.is_empty() {
                        return Err(crate::Error::Config("path with empty addr".into()));
                    }
                }
            }
        }
        if self.obfs.enabled && self.obfs.max_padding < self.obfs.min_padding {
            return Err(crate::Error::Config("obfs.max_padding < obfs.min_padding".into()));
        }
        Ok(())
    }

    /// Framed-channel parameters derived from psk/obfs/stealth.
    pub fn channel_config(&self) -> crate::Result<ChannelConfig> {
        let key = if self.psk.is_empty() {
            warn!("psk is empty: tunnel traffic will NOT be encrypted");
            None
        } else {
            Some(Arc::new(PacketKey::from_secret(&self.psk)?))
        };

        let padding = if self.obfs.enabled {
            Some(PaddingPolicy {
                min: self.obfs.min_padding,
                max: self.obfs.max_padding,
            })
        } else if self.stealth.random_padding {
            Some(PaddingPolicy {
                min: self.stealth.min_padding,
                max: self.stealth.max_padding,
            })
        } else {
            None
        };

        let burst = self.stealth.burst_split.then_some(BurstPolicy {
            max_chunk: self.stealth.max_burst_size,
        });

        let write_delay = (self.obfs.enabled && self.obfs.max_delay_ms > self.obfs.min_delay_ms)
            .then_some(DelayPolicy {
                min_ms: self.obfs.min_delay_ms,
                max_ms: self.obfs.max_delay_ms,
            });

        Ok(ChannelConfig {
            key,
            padding,
            burst,
            write_delay,
        })
    }

    /// Mux session parameters.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            keepalive: Duration::from_secs(self.mux.keepalive.max(1)),
            keepalive_jitter: Duration::from_millis(self.stealth.keepalive_jitter * 500),
            window: self.mux.max_stream.max(65536),
            frame_size: self.mux.frame_size.clamp(1024, 65535),
            accept_backlog: 64,
        }
    }

    pub fn fragment_policy(&self) -> FragmentPolicy {
        FragmentPolicy {
            min_size: self.fragment.min_size,
            max_size: self.fragment.max_size.max(self.fragment.min_size),
            min_delay_ms: self.fragment.min_delay,
            max_delay_ms: self.fragment.max_delay.max(self.fragment.min_delay),
        }
    }
}

/// Parse a `"bind->target"` forward entry. A bare port on the bind side is
/// normalized to a wildcard address.
pub fn parse_forward_entry(entry: &str) -> crate::Result<(String, String)> {
    let (bind, target) = entry
        .split_once("->")
        .ok_or_else(|| crate::Error::Config(format!("bad forward entry: {entry}")))?;
    let bind = bind.trim();
    let target = target.trim();
    if bind.is_empty() || target.is_empty() {
        return Err(crate::Error::Config(format!("bad forward entry: {entry}")));
    }

    let bind = if bind.contains(':') {
        bind.to_string()
    } else {
        format!("0.0.0.0:{bind}")
    };
    Ok((bind, target.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forward_entry() {
        let (bind, target) = parse_forward_entry("127.0.0.1:9000->10.0.0.1:9999").unwrap();
        assert_eq!(bind, "127.0.0.1:9000");
        assert_eq!(target, "10.0.0.1:9999");

        let (bind, target) = parse_forward_entry("8080 -> web.internal:80").unwrap();
        assert_eq!(bind, "0.0.0.0:8080");
        assert_eq!(target, "web.internal:80");

        assert!(parse_forward_entry("no-arrow").is_err());
        assert!(parse_forward_entry("->x").is_err());
    }

    #[test]
    fn test_server_defaults_listen_port() {
        let mut config: Config = toml::from_str("mode = \"server\"").unwrap();
        config.normalize();
        assert_eq!(config.listen_ports, vec!["0.0.0.0:2020"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_client_requires_paths() {
        let config: Config = toml::from_str("mode = \"client\"").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tls_path_enables_fragmentation() {
        let mut config: Config = toml::from_str(
            r#"
            mode = "client"
            [[paths]]
            addr = "edge.example.com:443"
            transport = "tls"
            "#,
        )
        .unwrap();
        assert!(!config.fragment.enabled);
        config.normalize();
        assert!(config.fragment.enabled);
    }

    #[test]
    fn test_channel_config_padding_precedence() {
        let mut config: Config = toml::from_str("mode = \"server\"").unwrap();
        config.normalize();
        config.psk = "secret".to_string();

        // Stealth padding by default
        let cc = config.channel_config().unwrap();
        assert_eq!(cc.padding, Some(PaddingPolicy { min: 16, max: 128 }));

        // Obfs padding wins when enabled
        config.obfs.enabled = true;
        let cc = config.channel_config().unwrap();
        assert_eq!(cc.padding, Some(PaddingPolicy { min: 16, max: 64 }));

        // Both off: no padding framing
        config.obfs.enabled = false;
        config.stealth.random_padding = false;
        let cc = config.channel_config().unwrap();
        assert!(cc.padding.is_none());
    }

    #[test]
    fn test_empty_psk_unencrypted() {
        let mut config: Config = toml::from_str("mode = \"server\"").unwrap();
        config.normalize();
        let cc = config.channel_config().unwrap();
        assert!(cc.key.is_none());
    }

    #[test]
    fn test_full_config_parses() {
        let mut config: Config = toml::from_str(
            r#"
            mode = "client"
            psk = "shared-secret"

            [[paths]]
            addr = "edge-a.example.net:443"
            transport = "tls"
            connection_pool = 2
            retry_interval = 2
            dial_timeout = 8

            [[paths]]
            addr = "edge-b.example.net:8443"

            [mimic]
            fake_domain = "cdn.example.net"
            fake_path = "/assets/{rand}.js"
            session_cookie = true

            [obfs]
            enabled = true
            min_padding = 32
            max_padding = 96

            [stealth]
            burst_split = true
            max_burst_size = 2048
            fake_traffic = true

            [mux]
            keepalive = 5
            frame_size = 8192

            [advanced]
            max_streams_per_session = 128

            [proxy]
            socks5_listen = "127.0.0.1:1080"
            "#,
        )
        .unwrap();
        config.normalize();
        config.validate().unwrap();

        assert_eq!(config.paths.len(), 2);
        assert_eq!(config.paths[0].transport, Transport::Tls);
        assert_eq!(config.paths[0].connection_pool, 2);
        assert_eq!(config.paths[1].transport, Transport::Tcp);
        assert_eq!(config.paths[1].connection_pool, 4);
        assert!(config.fragment.enabled, "tls path should enable fragmentation");
        assert_eq!(config.proxy.socks5_listen.as_deref(), Some("127.0.0.1:1080"));
        assert!(config.proxy.http_listen.is_none());

        let cc = config.channel_config().unwrap();
        assert!(cc.key.is_some());
        assert_eq!(cc.padding, Some(PaddingPolicy { min: 32, max: 96 }));
        assert_eq!(cc.burst, Some(BurstPolicy { max_chunk: 2048 }));

        let sc = config.session_config();
        assert_eq!(sc.keepalive, Duration::from_secs(5));
        assert_eq!(sc.frame_size, 8192);
    }

    #[test]
    fn test_session_config_jitter() {
        let mut config: Config = toml::from_str("mode = \"server\"").unwrap();
        config.normalize();
        let sc = config.session_config();
        assert_eq!(sc.keepalive, Duration::from_secs(2));
        assert_eq!(sc.keepalive_jitter, Duration::from_millis(1000));
    }
}
