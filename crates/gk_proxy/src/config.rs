use std::fs;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Bounds for the single CLI port argument.
pub const MIN_CLIENT_PORT: u16 = 2000;
pub const MAX_CLIENT_PORT: u16 = 9000;

/// The game server and the controller live next to the proxy at fixed
/// offsets from the client-facing port.
pub const GAME_SERVER_PORT_OFFSET: u16 = 100;
pub const CONTROL_PORT_OFFSET: u16 = 200;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProxyConfig {
    #[serde(default)]
    pub proxy: ProxySection,
    #[serde(default)]
    pub metrics: MetricsSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxySection {
    /// Client-facing UDP port. Set from the CLI argument; a value in the
    /// config file is overridden.
    #[serde(default)]
    pub client_port: u16,
    /// Defaults to `client_port + 100`.
    #[serde(default)]
    pub game_server_port: Option<u16>,
    /// Defaults to `client_port + 200`.
    #[serde(default)]
    pub control_port: Option<u16>,
    #[serde(default = "default_local_host")]
    pub game_server_host: Ipv4Addr,
    #[serde(default = "default_local_host")]
    pub control_host: Ipv4Addr,
    #[serde(default = "default_max_datagram_bytes")]
    pub max_datagram_bytes: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_max_flows")]
    pub max_flows: usize,
    /// Sources in loopback/RFC1918 ranges bypass admission. Disable when
    /// untrusted machines share the local network.
    #[serde(default = "default_true")]
    pub trust_private_sources: bool,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            client_port: 0,
            game_server_port: None,
            control_port: None,
            game_server_host: default_local_host(),
            control_host: default_local_host(),
            max_datagram_bytes: default_max_datagram_bytes(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_flows: default_max_flows(),
            trust_private_sources: true,
        }
    }
}

impl ProxySection {
    pub fn game_server_port(&self) -> u16 {
        self.game_server_port
            .unwrap_or_else(|| self.client_port.saturating_add(GAME_SERVER_PORT_OFFSET))
    }

    pub fn control_port(&self) -> u16 {
        self.control_port
            .unwrap_or_else(|| self.client_port.saturating_add(CONTROL_PORT_OFFSET))
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.client_port))
    }

    pub fn game_server_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(
            self.game_server_host,
            self.game_server_port(),
        ))
    }

    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.control_host, self.control_port()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: default_metrics_listen_addr(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_local_host() -> Ipv4Addr {
    Ipv4Addr::LOCALHOST
}

fn default_max_datagram_bytes() -> usize {
    64 * 1024
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_max_flows() -> usize {
    1024
}

fn default_metrics_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9300))
}

impl ProxyConfig {
    /// Configuration for the binary: the optional TOML file supplies the
    /// ambient knobs, the CLI port argument supplies `client_port`.
    pub fn load(path: Option<&Path>, client_port: u16) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.proxy.client_port = client_port;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed reading config file {}", path.display()))?;
        Self::from_toml(&raw).context("invalid config file")
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: ProxyConfig = toml::from_str(raw)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let port = self.proxy.client_port;
        if !(MIN_CLIENT_PORT..=MAX_CLIENT_PORT).contains(&port) {
            bail!("port must be between {MIN_CLIENT_PORT} and {MAX_CLIENT_PORT}, got {port}");
        }
        if self.proxy.game_server_port() == port {
            bail!("proxy.game_server_port must differ from the client port");
        }
        if self.proxy.control_port() == port {
            bail!("proxy.control_port must differ from the client port");
        }
        if self.proxy.max_datagram_bytes == 0 || self.proxy.max_datagram_bytes > 64 * 1024 {
            bail!("proxy.max_datagram_bytes must be between 1 and 65536");
        }
        if self.proxy.idle_timeout_secs == 0 {
            bail!("proxy.idle_timeout_secs must be > 0");
        }
        if self.proxy.max_flows == 0 {
            bail!("proxy.max_flows must be > 0");
        }
        Ok(())
    }
}
