//! HTTP forward proxy: `CONNECT` tunnels and absolute-form requests

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{Buf, BufMut, BytesMut};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use url::Url;

use crate::auth::Authenticator;
use crate::connection::{AuthInfo, ConnectionInfo, Network};
use crate::proxy::{BoxedStream, ClientHandshake, Detector, Protocol, ServerHandshake};
use crate::{Error, Result};

pub const NAME: &str = "http";

/// Upper bound for a request or response head
pub const MAX_HEAD_LEN: usize = 8 * 1024;

const MAX_HEADERS: usize = 64;
const MAX_METHOD_LEN: usize = 8;
const METHODS: &[&str] = &[
    "GET", "HEAD", "POST", "PUT", "DELETE", "OPTIONS", "CONNECT", "PATCH", "TRACE",
];

/// Matches a request line starting with a known method token.
#[derive(Debug, Default)]
pub struct MethodDetector;

#[async_trait]
impl Detector for MethodDetector {
    async fn check(&self, stream: &mut (dyn AsyncRead + Unpin + Send)) -> io::Result<bool> {
        let mut method = Vec::with_capacity(MAX_METHOD_LEN);
        for _ in 0..MAX_METHOD_LEN {
            let b = stream.read_u8().await?;
            if b == b' ' {
                return Ok(METHODS.iter().any(|m| m.as_bytes() == method.as_slice()));
            }
            if !b.is_ascii_uppercase() {
                return Ok(false);
            }
            method.push(b);
        }
        Ok(false)
    }
}

/// A stream that serves `pending` before reading from `inner`.
///
/// Holds bytes read past a message head, and for absolute-form requests the
/// rewritten head that must reach the target first.
struct Buffered {
    inner: BoxedStream,
    pending: BytesMut,
}

impl Buffered {
    fn new(inner: BoxedStream) -> Self {
        Self {
            inner,
            pending: BytesMut::new(),
        }
    }

    /// Read until a complete head (terminated by an empty line) is buffered and
    /// split it off. Bytes after the head stay pending.
    async fn read_head(&mut self) -> Result<BytesMut> {
        loop {
            if let Some(end) = find_double_crlf(&self.pending) {
                return Ok(self.pending.split_to(end));
            }
            if self.pending.len() >= MAX_HEAD_LEN {
                return Err(Error::frame("message head too large"));
            }
            let n = self.inner.read_buf(&mut self.pending).await?;
            if n == 0 {
                return Err(Error::handshake("connection closed inside message head"));
            }
        }
    }
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

impl AsyncRead for Buffered {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.pending.is_empty() {
            let n = this.pending.len().min(buf.remaining());
            buf.put_slice(&this.pending[..n]);
            this.pending.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Buffered {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Decode `Basic <base64(user:pass)>`.
fn parse_basic_credentials(value: &[u8]) -> Option<(String, String)> {
    let value = std::str::from_utf8(value).ok()?.trim();
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

fn with_default_port(authority: &str, port: u16) -> String {
    let has_port = match authority.rsplit_once(':') {
        // a bare IPv6 literal has colons but no port
        Some((host, p)) => !p.is_empty() && !p.contains(']') && (!host.contains(':') || host.ends_with(']')),
        None => false,
    };
    if has_port {
        authority.to_string()
    } else {
        format!("{}:{}", authority, port)
    }
}

/// Server role. A `CONNECT` tunnel relays raw bytes; an absolute-form request
/// is forwarded once and the origin connection closes after its response.
pub struct Server {
    stream: Buffered,
    peer: String,
    auth: Option<Arc<dyn Authenticator>>,
    info: Option<ConnectionInfo>,
    tunnel: bool,
}

impl Server {
    async fn reply(&mut self, status: &str, extra: &str) -> Result<()> {
        let response = format!(
            "HTTP/1.1 {}\r\n{}Content-Length: 0\r\nConnection: close\r\n\r\n",
            status, extra
        );
        self.stream.write_all(response.as_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl ServerHandshake for Server {
    async fn handshake(&mut self) -> Result<()> {
        let head = self.stream.read_head().await?;

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        match request.parse(&head) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => return Err(Error::frame("incomplete request head")),
            Err(e) => return Err(Error::frame(format!("bad request head: {}", e))),
        }
        let method = request.method.unwrap_or_default();
        let target = request.path.unwrap_or_default();

        let (username, password) = request
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case("proxy-authorization"))
            .and_then(|h| parse_basic_credentials(h.value))
            .unwrap_or_default();

        let address = if method == "CONNECT" {
            self.tunnel = true;
            with_default_port(target, 443)
        } else {
            let url = Url::parse(target)
                .map_err(|_| Error::frame(format!("not a proxy request: {}", target)))?;
            let host = url
                .host_str()
                .ok_or_else(|| Error::frame(format!("no host in {}", target)))?;
            let port = url.port_or_known_default().unwrap_or(80);
            let address = format!("{}:{}", host, port);

            let mut origin = url.path().to_string();
            if let Some(query) = url.query() {
                origin.push('?');
                origin.push_str(query);
            }

            // Replay the head in origin-form without hop-by-hop headers. Only
            // this head is rewritten, so the origin is told to close after it.
            let mut rewritten = BytesMut::with_capacity(head.len());
            rewritten.put_slice(
                format!("{} {} HTTP/1.{}\r\n", method, origin, request.version.unwrap_or(1))
                    .as_bytes(),
            );
            for header in request.headers.iter() {
                let name = header.name.to_ascii_lowercase();
                if name.starts_with("proxy-") || name == "connection" || name == "keep-alive" {
                    continue;
                }
                rewritten.put_slice(header.name.as_bytes());
                rewritten.put_slice(b": ");
                rewritten.put_slice(header.value);
                rewritten.put_slice(b"\r\n");
            }
            rewritten.put_slice(b"Connection: close\r\n\r\n");
            rewritten.put_slice(&self.stream.pending);
            self.stream.pending = rewritten;
            address
        };

        if let Some(auth) = &self.auth {
            let auth_info = AuthInfo {
                username: username.clone(),
                password: password.clone(),
                remote_address: self.peer.clone(),
                hardware_addresses: Vec::new(),
            };
            if !auth.authenticate(&auth_info) {
                return Err(Error::auth(format!(
                    "user {:?} from {} rejected",
                    username, self.peer
                )));
            }
        }

        self.info = Some(ConnectionInfo::new(Network::Tcp, address).with_credentials(username, password));
        Ok(())
    }

    fn info(&self) -> Result<ConnectionInfo> {
        self.info
            .clone()
            .ok_or_else(|| Error::handshake("handshake not completed"))
    }

    async fn send_success(&mut self) -> Result<()> {
        if self.tunnel {
            self.stream
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await?;
            self.stream.flush().await?;
        }
        Ok(())
    }

    async fn send_error(&mut self, err: &Error) -> Result<()> {
        match err {
            Error::Auth(_) => {
                self.reply(
                    "407 Proxy Authentication Required",
                    "Proxy-Authenticate: Basic realm=\"mino\"\r\n",
                )
                .await
            }
            _ => self.reply("502 Bad Gateway", "").await,
        }
    }

    fn into_stream(self: Box<Self>) -> BoxedStream {
        self
    }
}

crate::proxy::delegate_stream!(Server, stream);

/// Client role: opens a `CONNECT` tunnel through an upstream HTTP proxy.
pub struct Client {
    stream: Buffered,
}

#[async_trait]
impl ClientHandshake for Client {
    async fn handshake(&mut self) -> Result<()> {
        Ok(())
    }

    async fn connect(&mut self, info: &ConnectionInfo) -> Result<()> {
        if info.network != Network::Tcp {
            return Err(Error::UnsupportedNetwork(info.network));
        }

        let mut request = format!(
            "CONNECT {addr} HTTP/1.1\r\nHost: {addr}\r\n",
            addr = info.address
        );
        if !info.username.is_empty() || !info.password.is_empty() {
            let token = STANDARD.encode(format!("{}:{}", info.username, info.password));
            request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", token));
        }
        request.push_str("\r\n");
        self.stream.write_all(request.as_bytes()).await?;
        self.stream.flush().await?;

        let head = self.stream.read_head().await?;
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(&head) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => return Err(Error::frame("incomplete response head")),
            Err(e) => return Err(Error::frame(format!("bad response head: {}", e))),
        }
        match response.code {
            Some(200) => Ok(()),
            Some(407) => Err(Error::auth("upstream proxy requires authentication")),
            code => Err(Error::remote(format!(
                "upstream answered {} {}",
                code.unwrap_or_default(),
                response.reason.unwrap_or_default()
            ))),
        }
    }

    fn into_stream(self: Box<Self>) -> BoxedStream {
        self
    }
}

crate::proxy::delegate_stream!(Client, stream);

pub struct HttpProtocol {
    auth: Option<Arc<dyn Authenticator>>,
}

impl HttpProtocol {
    pub fn new(auth: Option<Arc<dyn Authenticator>>) -> Self {
        Self { auth }
    }
}

impl Protocol for HttpProtocol {
    fn name(&self) -> &'static str {
        NAME
    }

    fn detector(&self) -> Box<dyn Detector> {
        Box::new(MethodDetector)
    }

    fn server(&self, stream: BoxedStream, peer: String) -> Box<dyn ServerHandshake> {
        Box::new(Server {
            stream: Buffered::new(stream),
            peer,
            auth: self.auth.clone(),
            info: None,
            tunnel: false,
        })
    }

    fn client(&self, stream: BoxedStream, _server_name: &str) -> Box<dyn ClientHandshake> {
        Box::new(Client {
            stream: Buffered::new(stream),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MockAuthenticator;
    use tokio::io::duplex;

    async fn detect(input: &[u8]) -> io::Result<bool> {
        let mut mock = tokio_test::io::Builder::new().read(input).build();
        MethodDetector.check(&mut mock).await
    }

    #[tokio::test]
    async fn test_detector() {
        assert!(detect(b"GET ").await.unwrap());
        assert!(detect(b"CONNECT ").await.unwrap());
        assert!(!detect(b"FETCH ").await.unwrap());
        assert!(!detect(b"g").await.unwrap());
        assert!(!detect(b"\x16").await.unwrap());
        assert!(!detect(b"\x05").await.unwrap());
        assert!(!detect(b"ABCDEFGH").await.unwrap());
        assert!(detect(b"GE").await.is_err());
    }

    #[test]
    fn test_basic_credentials() {
        let value = format!("Basic {}", STANDARD.encode("alice:s3:cret"));
        assert_eq!(
            parse_basic_credentials(value.as_bytes()),
            Some(("alice".to_string(), "s3:cret".to_string()))
        );
        assert_eq!(parse_basic_credentials(b"Bearer abc"), None);
        assert_eq!(parse_basic_credentials(b"Basic !!!"), None);
    }

    #[test]
    fn test_default_port() {
        assert_eq!(with_default_port("example.com", 443), "example.com:443");
        assert_eq!(with_default_port("example.com:8443", 443), "example.com:8443");
        assert_eq!(with_default_port("[::1]:22", 443), "[::1]:22");
        assert_eq!(with_default_port("[::1]", 443), "[::1]:443");
    }

    #[tokio::test]
    async fn test_connect_tunnel() {
        let (a, mut b) = duplex(4096);
        let mut server = HttpProtocol::new(None).server(Box::new(a), "peer".to_string());

        b.write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\nearly")
            .await
            .unwrap();
        server.handshake().await.unwrap();
        assert_eq!(
            server.info().unwrap(),
            ConnectionInfo::new(Network::Tcp, "example.com:443")
        );

        server.send_success().await.unwrap();
        let mut reply = [0u8; 39];
        b.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"HTTP/1.1 200 Connection Established\r\n\r\n");

        let mut early = [0u8; 5];
        server.read_exact(&mut early).await.unwrap();
        assert_eq!(&early, b"early");
    }

    #[tokio::test]
    async fn test_absolute_form_is_rewritten() {
        let (a, mut b) = duplex(4096);
        let mut server = HttpProtocol::new(None).server(Box::new(a), "peer".to_string());

        let auth = STANDARD.encode("bob:pw");
        let request = format!(
            "GET http://example.com/a?b=1 HTTP/1.1\r\nHost: example.com\r\nProxy-Authorization: Basic {}\r\nProxy-Connection: keep-alive\r\n\r\n",
            auth
        );
        b.write_all(request.as_bytes()).await.unwrap();
        drop(b);

        server.handshake().await.unwrap();
        let info = server.info().unwrap();
        assert_eq!(info.address, "example.com:80");
        assert_eq!(info.username, "bob");
        assert_eq!(info.password, "pw");

        server.send_success().await.unwrap();
        let mut forwarded = Vec::new();
        server.read_to_end(&mut forwarded).await.unwrap();
        assert_eq!(
            forwarded,
            b"GET /a?b=1 HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n".to_vec()
        );
    }

    #[tokio::test]
    async fn test_absolute_form_keep_alive_is_closed() {
        let (a, mut b) = duplex(4096);
        let mut server = HttpProtocol::new(None).server(Box::new(a), "peer".to_string());

        b.write_all(
            b"GET http://one.example/ HTTP/1.1\r\nHost: one.example\r\nConnection: keep-alive\r\nKeep-Alive: timeout=5\r\n\r\n\
              GET http://two.example/ HTTP/1.1\r\nHost: two.example\r\n\r\n",
        )
        .await
        .unwrap();
        drop(b);

        server.handshake().await.unwrap();
        assert_eq!(server.info().unwrap().address, "one.example:80");

        let mut forwarded = Vec::new();
        server.read_to_end(&mut forwarded).await.unwrap();
        let forwarded = String::from_utf8(forwarded).unwrap();
        let (first, rest) = forwarded.split_once("\r\n\r\n").unwrap();
        assert_eq!(
            first,
            "GET / HTTP/1.1\r\nHost: one.example\r\nConnection: close"
        );
        // anything pipelined after the first head is relayed untouched
        assert_eq!(rest, "GET http://two.example/ HTTP/1.1\r\nHost: two.example\r\n\r\n");
    }

    #[tokio::test]
    async fn test_origin_form_rejected() {
        let (a, mut b) = duplex(4096);
        let mut server = HttpProtocol::new(None).server(Box::new(a), "peer".to_string());
        b.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let err = server.handshake().await.unwrap_err();
        assert!(matches!(err, Error::Frame(_)));
        server.send_error(&err).await.unwrap();
        drop(server);

        let mut reply = String::new();
        b.read_to_string(&mut reply).await.unwrap();
        assert!(reply.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
    }

    #[tokio::test]
    async fn test_auth_rejected_answers_407() {
        let mut auth = MockAuthenticator::new();
        auth.expect_authenticate()
            .withf(|info| info.username.is_empty() && info.remote_address == "10.0.0.1:5")
            .times(1)
            .return_const(false);
        let proto = HttpProtocol::new(Some(Arc::new(auth)));
        let (a, mut b) = duplex(4096);
        let mut server = proto.server(Box::new(a), "10.0.0.1:5".to_string());

        b.write_all(b"CONNECT a:1 HTTP/1.1\r\n\r\n").await.unwrap();
        let err = server.handshake().await.unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
        server.send_error(&err).await.unwrap();
        drop(server);

        let mut reply = String::new();
        b.read_to_string(&mut reply).await.unwrap();
        assert!(reply.starts_with("HTTP/1.1 407 Proxy Authentication Required\r\n"));
        assert!(reply.contains("Proxy-Authenticate: Basic realm=\"mino\"\r\n"));
    }

    #[tokio::test]
    async fn test_oversized_head() {
        let (a, mut b) = duplex(MAX_HEAD_LEN * 2);
        let mut server = HttpProtocol::new(None).server(Box::new(a), "peer".to_string());
        let mut request = b"GET http://a/ HTTP/1.1\r\nX: ".to_vec();
        request.extend(std::iter::repeat(b'x').take(MAX_HEAD_LEN));
        b.write_all(&request).await.unwrap();

        assert!(matches!(server.handshake().await, Err(Error::Frame(_))));
    }

    #[tokio::test]
    async fn test_client_connect() {
        let (a, b) = duplex(4096);
        let proto = HttpProtocol::new(None);
        let mut server = proto.server(Box::new(a), "peer".to_string());
        let mut client = proto.client(Box::new(b), "upstream");

        let server_task = tokio::spawn(async move {
            server.handshake().await.unwrap();
            let info = server.info().unwrap();
            server.send_success().await.unwrap();
            info
        });

        client.handshake().await.unwrap();
        client
            .connect(&ConnectionInfo::new(Network::Tcp, "target:22").with_credentials("u", "p"))
            .await
            .unwrap();
        let info = server_task.await.unwrap();
        assert_eq!(info.address, "target:22");
        assert_eq!(info.username, "u");
        assert_eq!(info.password, "p");
    }

    #[tokio::test]
    async fn test_client_refused_status() {
        let mock = tokio_test::io::Builder::new()
            .write(b"CONNECT t:1 HTTP/1.1\r\nHost: t:1\r\n\r\n")
            .read(b"HTTP/1.1 403 Forbidden\r\n\r\n")
            .build();
        let mut client = HttpProtocol::new(None).client(Box::new(mock), "upstream");
        match client.connect(&ConnectionInfo::new(Network::Tcp, "t:1")).await {
            Err(Error::Remote(message)) => assert!(message.contains("403")),
            other => panic!("unexpected result: {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_client_rejects_udp() {
        let (_a, b) = duplex(64);
        let mut client = HttpProtocol::new(None).client(Box::new(b), "upstream");
        assert!(matches!(
            client.connect(&ConnectionInfo::new(Network::Udp, "t:1")).await,
            Err(Error::UnsupportedNetwork(Network::Udp))
        ));
    }
}
