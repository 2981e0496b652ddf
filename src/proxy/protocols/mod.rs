//! Concrete protocols served on the shared listener

pub mod http;
pub mod mino;
pub mod socks5;

use std::sync::Arc;

use crate::auth::Authenticator;
use crate::config::ProtocolConfig;
use crate::proxy::{Protocol, Registry};
use crate::Result;

pub use http::HttpProtocol;
pub use mino::MinoProtocol;
pub use socks5::Socks5Protocol;

/// Build the registry in detection order: `http`, `socks5`, `mino`.
pub fn default_registry(
    config: &ProtocolConfig,
    auth: Option<Arc<dyn Authenticator>>,
) -> Result<Registry> {
    let protocols: Vec<Arc<dyn Protocol>> = vec![
        Arc::new(HttpProtocol::new(auth.clone())),
        Arc::new(Socks5Protocol::new(auth.clone())),
        Arc::new(MinoProtocol::new(config, auth)?),
    ];
    Ok(Registry::new(protocols))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_order() {
        let registry = default_registry(&ProtocolConfig::default(), None).unwrap();
        assert_eq!(registry.names(), vec!["http", "socks5", "mino"]);
    }
}
