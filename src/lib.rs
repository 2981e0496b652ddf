pub mod auth;
pub mod certs;
pub mod config;
pub mod connection;
pub mod error;
pub mod pac;
pub mod proxy;
pub mod rewind;
pub mod server;
pub mod session;

pub use connection::{ConnectionInfo, Network};
pub use error::{Error, Result};
pub use server::ProxyServer;
pub use session::{Session, Transferred};
