//! Tundra configuration

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::{Result, TunnelError};

fn default_listen_v4() -> SocketAddr {
    "0.0.0.0:53".parse().unwrap()
}

fn default_tun_ip() -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, 1)
}

fn default_netmask() -> u8 {
    27
}

fn default_mtu() -> u16 {
    1130
}

fn default_check_ip() -> bool {
    true
}

fn default_dns_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_user_timeout() -> Duration {
    Duration::from_secs(60)
}

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// DNS suffix owned by this server; every tunnel query ends with it
    pub topdomain: String,

    /// Shared tunnel password (at most 32 bytes take part in the digest)
    pub password: String,

    /// UDP listen address for DNS
    #[serde(default = "default_listen_v4")]
    pub listen_v4: SocketAddr,

    /// Optional second listener for IPv6 transport
    #[serde(default)]
    pub listen_v6: Option<SocketAddr>,

    /// Server address inside the tunnel subnet; clients get the following ones
    #[serde(default = "default_tun_ip")]
    pub tun_ip: Ipv4Addr,

    /// Tunnel subnet prefix length
    #[serde(default = "default_netmask")]
    pub netmask: u8,

    /// MTU announced to clients at login
    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// External nameserver address handed out on `I` queries
    #[serde(default)]
    pub ns_ip: Option<IpAddr>,

    /// Reject queries whose source IP differs from the handshake's
    #[serde(default = "default_check_ip")]
    pub check_ip: bool,

    /// Initial per-query DNS timeout; clients adjust it with pings
    #[serde(with = "humantime_serde", default = "default_dns_timeout")]
    pub dns_timeout: Duration,

    /// Sessions silent past this bound are reaped
    #[serde(with = "humantime_serde", default = "default_user_timeout")]
    pub user_timeout: Duration,

    /// Stop the server after this much time with no active user
    #[serde(with = "humantime_serde", default)]
    pub max_idle_time: Option<Duration>,

    /// Relay non-tunnel queries to 127.0.0.1:<bind_port>
    #[serde(default)]
    pub bind_port: Option<u16>,

    /// Debug verbosity used by a few hot-path hexdumps
    #[serde(default)]
    pub debug: u8,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            topdomain: String::new(),
            password: String::new(),
            listen_v4: default_listen_v4(),
            listen_v6: None,
            tun_ip: default_tun_ip(),
            netmask: default_netmask(),
            mtu: default_mtu(),
            ns_ip: None,
            check_ip: default_check_ip(),
            dns_timeout: default_dns_timeout(),
            user_timeout: default_user_timeout(),
            max_idle_time: None,
            bind_port: None,
            debug: 0,
        }
    }
}

impl ServerConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.topdomain.is_empty() || self.topdomain.len() > 128 {
            return Err(TunnelError::Config(
                "topdomain must be 1..=128 characters".into(),
            ));
        }
        for label in self.topdomain.split('.') {
            if label.is_empty() || label.len() > 63 {
                return Err(TunnelError::Config(format!(
                    "bad topdomain label '{}'",
                    label
                )));
            }
            if !label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-')
            {
                return Err(TunnelError::Config(format!(
                    "topdomain label '{}' has invalid characters",
                    label
                )));
            }
        }

        if self.password.is_empty() {
            return Err(TunnelError::Config("password must be set".into()));
        }
        if self.password.len() > 32 {
            return Err(TunnelError::Config("password longer than 32 bytes".into()));
        }

        if !(8..=30).contains(&self.netmask) {
            return Err(TunnelError::Config("netmask must be 8..=30".into()));
        }

        if !(576..=9000).contains(&self.mtu) {
            return Err(TunnelError::Config("mtu must be 576..=9000".into()));
        }

        Ok(())
    }
}
