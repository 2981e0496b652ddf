//! Local self-info responses
//!
//! A request for the configured self-info address never leaves the process:
//! the orchestrator hands the client stream to an [`InfoResponder`] instead.

use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::connection::ConnectionInfo;
use crate::Result;

pub const PAC_CONTENT_TYPE: &str = "application/x-ns-proxy-autoconfig";

#[async_trait]
pub trait InfoResponder: Send + Sync {
    /// Write the informational payload for `info` and return the bytes written.
    async fn respond(
        &self,
        stream: &mut (dyn AsyncWrite + Unpin + Send),
        info: &ConnectionInfo,
    ) -> Result<u64>;
}

/// Serves a proxy auto-config file over HTTP/1.1.
#[derive(Debug, Clone)]
pub struct PacFile {
    path: PathBuf,
    proxy_address: String,
}

impl PacFile {
    /// `proxy_address` is advertised by the generated script used when
    /// `path` does not exist.
    pub fn new(path: impl Into<PathBuf>, proxy_address: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            proxy_address: proxy_address.into(),
        }
    }

    pub async fn body(&self) -> Result<Vec<u8>> {
        match tokio::fs::read(&self.path).await {
            Ok(body) => Ok(body),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("{} not found, generating PAC", self.path.display());
                Ok(self.generated().into_bytes())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn generated(&self) -> String {
        format!(
            "function FindProxyForURL(url, host) {{\n    return \"PROXY {}; DIRECT\";\n}}\n",
            self.proxy_address
        )
    }
}

#[async_trait]
impl InfoResponder for PacFile {
    async fn respond(
        &self,
        stream: &mut (dyn AsyncWrite + Unpin + Send),
        _info: &ConnectionInfo,
    ) -> Result<u64> {
        let body = self.body().await?;
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            PAC_CONTENT_TYPE,
            body.len()
        );
        stream.write_all(head.as_bytes()).await?;
        stream.write_all(&body).await?;
        stream.flush().await?;
        Ok((head.len() + body.len()) as u64)
    }
}
