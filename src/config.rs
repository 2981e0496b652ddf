use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen address, `host:port`
    pub address: String,
    /// Upstream proxy URL; the scheme names a registered protocol
    pub upstream: Option<String>,
    /// Requests for exactly this address receive the PAC file
    pub pac_address: Option<String>,
    pub pac_file: String,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub root_ca: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub auth_enabled: bool,
    pub auth_users: HashMap<String, String>,
    pub handshake_timeout_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:1080".to_string(),
            upstream: None,
            pac_address: None,
            pac_file: "conf/pac.txt".to_string(),
            cert_file: None,
            key_file: None,
            root_ca: None,
            username: None,
            password: None,
            auth_enabled: false,
            auth_users: HashMap::new(),
            handshake_timeout_secs: None,
        }
    }
}

/// Options handed to every protocol factory. Each protocol decides which apply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolConfig {
    pub certificate_file: Option<String>,
    pub private_key_file: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub root_ca_file: Option<String>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        Ok(config)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn expand_path(&self, path: &str) -> String {
        if let Some(rest) = path.strip_prefix('~') {
            if let Some(home) = dirs::home_dir() {
                return format!("{}{}", home.display(), rest);
            }
        }
        path.to_string()
    }

    pub fn protocol_config(&self) -> ProtocolConfig {
        ProtocolConfig {
            certificate_file: self.cert_file.as_deref().map(|p| self.expand_path(p)),
            private_key_file: self.key_file.as_deref().map(|p| self.expand_path(p)),
            username: self.username.clone(),
            password: self.password.clone(),
            root_ca_file: self.root_ca.as_deref().map(|p| self.expand_path(p)),
        }
    }

    pub fn upstream_url(&self) -> Result<Option<Url>> {
        let Some(raw) = self.upstream.as_deref() else {
            return Ok(None);
        };
        let url = Url::parse(raw)?;
        if url.host_str().is_none() {
            return Err(Error::invalid_config(format!("upstream {} has no host", raw)));
        }
        Ok(Some(url))
    }

    pub fn pac_file(&self) -> String {
        self.expand_path(&self.pac_file)
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_secs.map(Duration::from_secs)
    }
}
