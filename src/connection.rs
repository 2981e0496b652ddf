//! Connection types shared by every protocol implementation

use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Network kind requested by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Network {
    #[default]
    Tcp,
    Udp,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "udp" => Ok(Network::Udp),
            other => Err(Error::Other(format!("unknown network: {}", other))),
        }
    }
}

/// Resolved target and credentials for one proxied connection.
///
/// Produced by a server-side handshake, consumed by the orchestrator for routing
/// and by a client-side handshake when the request is re-issued upstream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionInfo {
    pub network: Network,
    pub address: String,
    pub username: String,
    pub password: String,
    pub hardware_addresses: Vec<Vec<u8>>,
}

impl ConnectionInfo {
    pub fn new(network: Network, address: impl Into<String>) -> Self {
        Self {
            network,
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Hardware addresses formatted as `aa:bb:cc:dd:ee:ff` for logging.
    pub fn hardware_addresses_display(&self) -> Vec<String> {
        self.hardware_addresses
            .iter()
            .map(|addr| {
                addr.iter()
                    .map(|b| format!("{:02x}", b))
                    .collect::<Vec<_>>()
                    .join(":")
            })
            .collect()
    }
}

/// Input handed to the authentication hook
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthInfo {
    pub username: String,
    pub password: String,
    pub remote_address: String,
    pub hardware_addresses: Vec<Vec<u8>>,
}
