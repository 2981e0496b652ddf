//! The mino protocol: a TLS-wrapped request/response handshake
//!
//! After the TLS handshake the client sends one request frame naming the
//! target, its credentials and the hardware addresses of its host; the server
//! authenticates it and answers with one response frame. Everything after the
//! response is relayed payload.

pub mod frame;
pub mod message;

pub use frame::{read_frame, write_frame, Frame, FrameType};
pub use message::{RequestMessage, ResponseMessage, StatusCode};

use async_trait::async_trait;
use openssl::ssl::{Ssl, SslAcceptor, SslConnector, SslMethod, SslVerifyMode};
use openssl::x509::store::X509StoreBuilder;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio_openssl::SslStream;
use tracing::{debug, info};

use crate::auth::Authenticator;
use crate::certs::{load_root_certificates, Identity};
use crate::config::ProtocolConfig;
use crate::connection::{AuthInfo, ConnectionInfo};
use crate::proxy::{BoxedStream, ClientHandshake, Detector, Protocol, ServerHandshake};
use crate::{Error, Result};

pub const NAME: &str = "mino";

/// TLS record type of a handshake record
pub const TLS_RECORD_TYPE_HANDSHAKE: u8 = 22;

/// Matches the record header of a TLS 1.0-1.2 style ClientHello.
#[derive(Debug, Default)]
pub struct Checker;

#[async_trait]
impl Detector for Checker {
    async fn check(&self, stream: &mut (dyn AsyncRead + Unpin + Send)) -> io::Result<bool> {
        let mut buf = [0u8; 3];
        stream.read_exact(&mut buf).await?;
        // 0x0300..=0x0305
        Ok(buf[0] == TLS_RECORD_TYPE_HANDSHAKE && buf[1] == 0x03 && buf[2] <= 0x05)
    }
}

/// The connection underneath a mino role, before and after the TLS upgrade
enum Transport {
    Plain(BoxedStream),
    Tls(Pin<Box<SslStream<BoxedStream>>>),
    Closed,
}

impl Transport {
    fn take_plain(&mut self) -> Result<BoxedStream> {
        match std::mem::replace(self, Transport::Closed) {
            Transport::Plain(stream) => Ok(stream),
            Transport::Tls(tls) => {
                *self = Transport::Tls(tls);
                Err(Error::handshake("TLS already established"))
            }
            Transport::Closed => Err(Error::handshake("connection closed")),
        }
    }

    fn is_secure(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "mino transport closed")
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Transport::Tls(tls) => tls.as_mut().poll_read(cx, buf),
            Transport::Closed => Poll::Ready(Err(closed())),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Transport::Tls(tls) => tls.as_mut().poll_write(cx, buf),
            Transport::Closed => Poll::Ready(Err(closed())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Transport::Tls(tls) => tls.as_mut().poll_flush(cx),
            Transport::Closed => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Transport::Tls(tls) => tls.as_mut().poll_shutdown(cx),
            Transport::Closed => Poll::Ready(Ok(())),
        }
    }
}

/// Server role: TLS upgrade, request frame, authentication.
pub struct Server {
    transport: Transport,
    peer: String,
    acceptor: Option<Arc<SslAcceptor>>,
    auth: Option<Arc<dyn Authenticator>>,
    request: Option<RequestMessage>,
}

impl Server {
    async fn write_response(&mut self, code: StatusCode, message: &str) -> Result<()> {
        let response = ResponseMessage::new(code, message);
        let frame = Frame::new(FrameType::Response, response.marshal())?;
        write_frame(&mut self.transport, &frame).await
    }
}

#[async_trait]
impl ServerHandshake for Server {
    async fn handshake(&mut self) -> Result<()> {
        let acceptor = self
            .acceptor
            .clone()
            .ok_or_else(|| Error::certificate("no server certificate configured"))?;

        let plain = self.transport.take_plain()?;
        let ssl = Ssl::new(acceptor.context())?;
        let mut tls = Box::pin(SslStream::new(ssl, plain)?);
        tls.as_mut()
            .accept()
            .await
            .map_err(|e| Error::handshake(format!("TLS accept failed: {}", e)))?;
        self.transport = Transport::Tls(tls);

        let frame = read_frame(&mut self.transport).await?;
        if frame.frame_type != FrameType::Request {
            return Err(Error::frame("expected a request frame"));
        }
        let request = RequestMessage::unmarshal(&frame.payload)?;

        if let Some(auth) = &self.auth {
            let auth_info = AuthInfo {
                username: request.username.clone(),
                password: request.password.clone(),
                remote_address: self.peer.clone(),
                hardware_addresses: request.hardware_addresses.clone(),
            };
            if !auth.authenticate(&auth_info) {
                return Err(Error::auth(format!(
                    "user {:?} from {} rejected",
                    request.username, self.peer
                )));
            }
        }

        self.request = Some(request);
        Ok(())
    }

    fn info(&self) -> Result<ConnectionInfo> {
        self.request
            .clone()
            .map(ConnectionInfo::from)
            .ok_or_else(|| Error::handshake("handshake not completed"))
    }

    async fn send_success(&mut self) -> Result<()> {
        self.write_response(StatusCode::Succeeded, "OK").await
    }

    async fn send_error(&mut self, err: &Error) -> Result<()> {
        if !self.transport.is_secure() {
            return Err(Error::handshake("no secure channel to report the error on"));
        }
        let code = err.status_code();
        let message = match err {
            Error::Remote(message) => message.clone(),
            other => other.to_string(),
        };
        self.write_response(code, &message).await
    }

    fn into_stream(self: Box<Self>) -> BoxedStream {
        self
    }
}

crate::proxy::delegate_stream!(Server, transport);

/// Client role used when the upstream proxy speaks mino.
pub struct Client {
    transport: Transport,
    server_name: String,
    root_ca: Option<String>,
    /// sent when the request names no user of its own
    credentials: Option<(String, String)>,
}

impl Client {
    fn connector(&self) -> Result<SslConnector> {
        let mut builder = SslConnector::builder(SslMethod::tls_client())?;
        match &self.root_ca {
            // No trust anchor configured: accept any server certificate.
            None => builder.set_verify(SslVerifyMode::NONE),
            Some(path) => {
                let mut store = X509StoreBuilder::new()?;
                for cert in load_root_certificates(path)? {
                    store.add_cert(cert)?;
                }
                builder.set_cert_store(store.build());
                builder.set_verify(SslVerifyMode::PEER);
            }
        }
        Ok(builder.build())
    }
}

#[async_trait]
impl ClientHandshake for Client {
    async fn handshake(&mut self) -> Result<()> {
        let connector = self.connector()?;
        let mut config = connector.configure()?;
        if self.root_ca.is_none() {
            config.set_verify_hostname(false);
        }
        let ssl = config.into_ssl(&self.server_name)?;

        let plain = self.transport.take_plain()?;
        let mut tls = Box::pin(SslStream::new(ssl, plain)?);
        tls.as_mut()
            .connect()
            .await
            .map_err(|e| Error::handshake(format!("TLS connect failed: {}", e)))?;
        self.transport = Transport::Tls(tls);
        Ok(())
    }

    async fn connect(&mut self, info: &ConnectionInfo) -> Result<()> {
        let mut request = RequestMessage::from(info.clone());
        if request.username.is_empty() {
            if let Some((username, password)) = &self.credentials {
                request.username = username.clone();
                request.password = password.clone();
            }
        }
        request.hardware_addresses = local_hardware_addresses();

        let frame = Frame::new(FrameType::Request, request.marshal()?)?;
        write_frame(&mut self.transport, &frame).await?;

        let frame = read_frame(&mut self.transport).await?;
        if frame.frame_type != FrameType::Response {
            return Err(Error::frame("expected a response frame"));
        }
        let response = ResponseMessage::unmarshal(&frame.payload)?;
        match response.code {
            StatusCode::Succeeded => Ok(()),
            StatusCode::UnknownError => Err(Error::Remote(response.message)),
            code => Err(Error::Status(code)),
        }
    }

    fn into_stream(self: Box<Self>) -> BoxedStream {
        self
    }
}

crate::proxy::delegate_stream!(Client, transport);

/// Hardware addresses of every non-loopback interface on this host.
pub fn local_hardware_addresses() -> Vec<Vec<u8>> {
    match mac_address::MacAddressIterator::new() {
        Ok(addresses) => addresses
            .map(|addr| addr.bytes().to_vec())
            // loopback interfaces report an all-zero address
            .filter(|bytes| bytes.iter().any(|b| *b != 0))
            .collect(),
        Err(e) => {
            debug!("cannot list hardware addresses: {}", e);
            Vec::new()
        }
    }
}

/// Protocol descriptor for mino
pub struct MinoProtocol {
    acceptor: Option<Arc<SslAcceptor>>,
    root_ca: Option<String>,
    credentials: Option<(String, String)>,
    auth: Option<Arc<dyn Authenticator>>,
}

impl std::fmt::Debug for MinoProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MinoProtocol")
            .field("server_identity", &self.acceptor.is_some())
            .field("root_ca", &self.root_ca)
            .field(
                "username",
                &self.credentials.as_ref().map(|(username, _)| username),
            )
            .field("auth", &self.auth.is_some())
            .finish()
    }
}

impl MinoProtocol {
    /// Load the server identity when both certificate and key are configured.
    ///
    /// Without an identity the protocol still detects and serves as a client;
    /// accepted connections fail their handshake.
    pub fn new(config: &ProtocolConfig, auth: Option<Arc<dyn Authenticator>>) -> Result<Self> {
        let acceptor = match (&config.certificate_file, &config.private_key_file) {
            (Some(cert), Some(key)) => {
                let identity = Identity::load(cert, key)?;
                info!("mino certificate sha256 {}", identity.fingerprint()?);
                Some(Arc::new(build_acceptor(&identity)?))
            }
            _ => None,
        };

        let credentials = match (&config.username, &config.password) {
            (None, None) => None,
            (username, password) => Some((
                username.clone().unwrap_or_default(),
                password.clone().unwrap_or_default(),
            )),
        };

        Ok(Self {
            acceptor,
            root_ca: config.root_ca_file.clone(),
            credentials,
            auth,
        })
    }
}

fn build_acceptor(identity: &Identity) -> Result<SslAcceptor> {
    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())?;
    builder.set_private_key(&identity.key)?;
    builder.set_certificate(&identity.cert)?;
    for cert in &identity.chain {
        builder.add_extra_chain_cert(cert.clone())?;
    }
    builder.check_private_key()?;
    Ok(builder.build())
}

impl Protocol for MinoProtocol {
    fn name(&self) -> &'static str {
        NAME
    }

    fn detector(&self) -> Box<dyn Detector> {
        Box::new(Checker)
    }

    fn server(&self, stream: BoxedStream, peer: String) -> Box<dyn ServerHandshake> {
        Box::new(Server {
            transport: Transport::Plain(stream),
            peer,
            acceptor: self.acceptor.clone(),
            auth: self.auth.clone(),
            request: None,
        })
    }

    fn client(&self, stream: BoxedStream, server_name: &str) -> Box<dyn ClientHandshake> {
        Box::new(Client {
            transport: Transport::Plain(stream),
            server_name: server_name.to_string(),
            root_ca: self.root_ca.clone(),
            credentials: self.credentials.clone(),
        })
    }
}
