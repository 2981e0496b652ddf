//! Authentication callback boundary

use std::collections::HashMap;

use tracing::debug;

use crate::connection::AuthInfo;

/// Decides whether a client may use the proxy.
#[cfg_attr(test, mockall::automock)]
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, info: &AuthInfo) -> bool;
}

impl<F> Authenticator for F
where
    F: Fn(&AuthInfo) -> bool + Send + Sync,
{
    fn authenticate(&self, info: &AuthInfo) -> bool {
        self(info)
    }
}

/// Username/password table taken from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticAuthenticator {
    users: HashMap<String, String>,
}

impl StaticAuthenticator {
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }
}

impl Authenticator for StaticAuthenticator {
    fn authenticate(&self, info: &AuthInfo) -> bool {
        let ok = self
            .users
            .get(&info.username)
            .is_some_and(|password| *password == info.password);
        if !ok {
            debug!("rejecting user {:?} from {}", info.username, info.remote_address);
        }
        ok
    }
}
