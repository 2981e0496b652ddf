//! Listener and per-connection orchestration
//!
//! Each accepted connection runs on its own task: dispatch, server handshake,
//! optional self-info diversion, dial (direct or through the upstream proxy),
//! then a [`Session`] relaying both directions.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::auth::{Authenticator, StaticAuthenticator};
use crate::config::Config;
use crate::connection::{ConnectionInfo, Network};
use crate::pac::{InfoResponder, PacFile};
use crate::proxy::protocols::default_registry;
use crate::proxy::{BoxedStream, Protocol, Registry, ServerHandshake};
use crate::rewind::{RewindStream, DEFAULT_CAPACITY};
use crate::session::Session;
use crate::{Error, Result};

/// The configured next hop
struct Upstream {
    protocol: Arc<dyn Protocol>,
    /// `host:port` to dial
    address: String,
    /// host used for TLS server name checks
    host: String,
    credentials: Option<(String, String)>,
}

impl std::fmt::Debug for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upstream")
            .field("protocol", &self.protocol.name())
            .field("address", &self.address)
            .finish()
    }
}

pub struct ProxyServer {
    config: Arc<Config>,
    registry: Registry,
    upstream: Option<Upstream>,
    responder: Arc<dyn InfoResponder>,
}

impl ProxyServer {
    /// Build the registry and resolve the upstream. A scheme that names no
    /// registered protocol is rejected here, before anything listens.
    pub fn new(config: Config) -> Result<Self> {
        let auth: Option<Arc<dyn Authenticator>> = if config.auth_enabled {
            Some(Arc::new(StaticAuthenticator::new(config.auth_users.clone())))
        } else {
            None
        };
        let registry = default_registry(&config.protocol_config(), auth)?;
        let upstream = resolve_upstream(&config, &registry)?;
        let responder = Arc::new(PacFile::new(config.pac_file(), config.address.clone()));

        Ok(Self {
            config: Arc::new(config),
            registry,
            upstream,
            responder,
        })
    }

    pub fn with_responder(mut self, responder: Arc<dyn InfoResponder>) -> Self {
        self.responder = responder;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Listen on the configured address until Ctrl+C.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.address).await?;
        info!(
            "listening on {} ({})",
            listener.local_addr()?,
            self.registry.names().join(", ")
        );
        if let Some(upstream) = &self.upstream {
            info!(
                "forwarding through {}://{}",
                upstream.protocol.name(),
                upstream.address
            );
        }

        let server = Arc::new(self);
        tokio::select! {
            result = server.serve(listener) => result,
            _ = signal::ctrl_c() => {
                info!("Received shutdown signal");
                Ok(())
            }
        }
    }

    /// Accept connections forever; a failed accept is logged and skipped.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    tokio::spawn(Arc::clone(&self).handle(stream, peer));
                }
                Err(e) => {
                    error!("accept error: {}", e);
                }
            }
        }
    }

    async fn handle(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let span = info_span!("conn", id = %Uuid::new_v4(), peer = %peer);
        async move {
            if let Err(e) = self.serve_connection(stream, peer.to_string()).await {
                debug!("connection closed: {}", e);
            }
        }
        .instrument(span)
        .await
    }

    /// Run one accepted connection to completion.
    pub async fn serve_connection<S>(&self, stream: S, peer: String) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut server = match self.config.handshake_timeout() {
            Some(limit) => tokio::time::timeout(limit, self.accept(stream, &peer))
                .await
                .map_err(|_| Error::handshake(format!("no handshake within {:?}", limit)))??,
            None => self.accept(stream, &peer).await?,
        };

        let info = server.info()?;
        if self.config.pac_address.as_deref() == Some(info.address.as_str()) {
            server.send_success().await?;
            let written = self.responder.respond(&mut server, &info).await?;
            info!("return pac {} {} ({} bytes)", info.network, info.address, written);
            let _ = server.shutdown().await;
            return Ok(());
        }

        info!(
            "dial {} {} user {:?} hardware addr {:?}",
            info.network,
            info.address,
            info.username,
            info.hardware_addresses_display()
        );
        let remote = match self.dial(&info).await {
            Ok(remote) => remote,
            Err(e) => {
                warn!("dial {} {} error: {}", info.network, info.address, e);
                let reported = dial_failure(&e);
                if let Err(report) = server.send_error(reported.as_ref().unwrap_or(&e)).await {
                    debug!("cannot report dial error: {}", report);
                }
                return Err(e);
            }
        };
        server.send_success().await?;
        info!("connected {} {}", info.network, info.address);

        let transferred = Session::new(server.into_stream(), remote).transport().await;
        info!(
            "transport {} {} up {} down {}",
            info.network, info.address, transferred.up, transferred.down
        );
        Ok(())
    }

    /// Detect the protocol and complete its server handshake. A failed
    /// handshake is reported to the client when the protocol can.
    async fn accept<S>(&self, stream: S, peer: &str) -> Result<Box<dyn ServerHandshake>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut stream = RewindStream::new(stream, DEFAULT_CAPACITY);
        let protocol = match self.registry.dispatch(&mut stream).await {
            Ok(protocol) => protocol,
            Err(e) => {
                warn!("accept proto error: {}", e);
                return Err(e);
            }
        };
        info!("accept proto {}", protocol.name());

        let mut server = protocol.server(Box::new(stream), peer.to_string());
        if let Err(e) = server.handshake().await {
            warn!("proto handshake error: {}", e);
            if let Err(report) = server.send_error(&e).await {
                debug!("cannot report handshake error: {}", report);
            }
            return Err(e);
        }
        Ok(server)
    }

    async fn dial(&self, info: &ConnectionInfo) -> Result<BoxedStream> {
        if info.network != Network::Tcp {
            return Err(Error::UnsupportedNetwork(info.network));
        }

        let Some(upstream) = &self.upstream else {
            let remote = TcpStream::connect(&info.address).await?;
            return Ok(Box::new(remote));
        };

        let remote = TcpStream::connect(&upstream.address).await?;
        let mut client = upstream.protocol.client(Box::new(remote), &upstream.host);

        let mut forwarded = info.clone();
        if let Some((username, password)) = &upstream.credentials {
            forwarded.username = username.clone();
            forwarded.password = password.clone();
        }
        client.handshake().await?;
        client.connect(&forwarded).await?;
        debug!(
            "{} upstream {} accepted {}",
            upstream.protocol.name(),
            upstream.address,
            info.address
        );
        Ok(client.into_stream())
    }
}

/// What the client hears about a failed dial. Errors raised by the next hop
/// become a general failure carrying their text. `None` keeps the error as is.
fn dial_failure(err: &Error) -> Option<Error> {
    match err {
        Error::UnsupportedNetwork(_) | Error::Io(_) | Error::Remote(_) => None,
        other => Some(Error::remote(other)),
    }
}

fn resolve_upstream(config: &Config, registry: &Registry) -> Result<Option<Upstream>> {
    let Some(url) = config.upstream_url()? else {
        return Ok(None);
    };
    let protocol = registry.get(url.scheme()).ok_or_else(|| {
        Error::invalid_config(format!(
            "upstream scheme {:?} is not one of {}",
            url.scheme(),
            registry.names().join(", ")
        ))
    })?;
    let host = url.host_str().unwrap_or_default();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::invalid_config(format!("upstream {} has no port", url)))?;

    let credentials = if !url.username().is_empty() || url.password().is_some() {
        Some((
            url.username().to_string(),
            url.password().unwrap_or_default().to_string(),
        ))
    } else if config.username.is_some() || config.password.is_some() {
        Some((
            config.username.clone().unwrap_or_default(),
            config.password.clone().unwrap_or_default(),
        ))
    } else {
        None
    };

    Ok(Some(Upstream {
        protocol,
        address: format!("{}:{}", host, port),
        host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
        credentials,
    }))
}
