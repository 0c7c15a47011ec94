use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tokio::fs;

/// Cluster client configuration.
///
/// `entry_addrs` seeds topology discovery; every other field tunes how node
/// connections are dialed and pooled. The whole struct deserializes from
/// TOML so deployments can ship it as a file.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Seed addresses, any reachable cluster node works. Must be non-empty.
    pub entry_addrs: Vec<String>,

    /// Dial behavior for node connections. Also used verbatim when no pool
    /// is configured and every checkout is a fresh connection.
    #[serde(default)]
    pub dial: DialConfig,

    /// Per-checkout deadline in milliseconds. `None` or 0 waits forever.
    #[serde(default)]
    pub pool_timeout_ms: Option<u64>,

    /// Connection pooling knobs. Absent means no pooling at all.
    #[serde(default)]
    pub pool: Option<PoolConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DialConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,
    #[serde(default)]
    pub write_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,
    #[serde(default = "default_max_active")]
    pub max_active: usize,
    /// Idle connections older than this are discarded at checkout.
    #[serde(default)]
    pub idle_timeout_ms: Option<u64>,
    /// Ping idle connections before handing them out.
    #[serde(default)]
    pub test_on_borrow: bool,
}

impl ClusterConfig {
    pub fn new<I, S>(entry_addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entry_addrs: entry_addrs.into_iter().map(Into::into).collect(),
            dial: DialConfig::default(),
            pool_timeout_ms: None,
            pool: None,
        }
    }

    /// Load configuration from a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: ClusterConfig = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.ensure_valid()?;
        Ok(config)
    }

    /// Ensure configuration correctness.
    pub fn ensure_valid(&self) -> Result<()> {
        if self.entry_addrs.is_empty() {
            bail!("entry addresses must not be empty");
        }
        for addr in &self.entry_addrs {
            parse_port(addr)
                .with_context(|| format!("entry address {} is not a valid host:port", addr))?;
        }
        if let Some(pool) = &self.pool {
            if pool.max_active == 0 {
                bail!("pool max_active must be at least 1");
            }
        }
        Ok(())
    }

    pub fn pool_timeout(&self) -> Option<Duration> {
        match self.pool_timeout_ms {
            Some(0) | None => None,
            Some(ms) => Some(Duration::from_millis(ms)),
        }
    }
}

impl DialConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms.map(Duration::from_millis)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: None,
            write_timeout_ms: None,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: default_max_idle(),
            max_active: default_max_active(),
            idle_timeout_ms: None,
            test_on_borrow: false,
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }
}

fn parse_port(addr: &str) -> Result<u16> {
    if let Ok(socket) = addr.parse::<std::net::SocketAddr>() {
        return Ok(socket.port());
    }
    if let Some((host, port_str)) = addr.rsplit_once(':') {
        if host.is_empty() {
            bail!("missing host in address {}", addr);
        }
        return port_str
            .trim()
            .parse::<u16>()
            .with_context(|| format!("invalid port component {}", port_str));
    }
    bail!("unable to extract port from address {}", addr)
}

fn default_connect_timeout_ms() -> u64 {
    1_000
}

fn default_max_idle() -> usize {
    8
}

fn default_max_active() -> usize {
    16
}
