//! SOCKS5 (RFC 1928) with username/password authentication (RFC 1929)

use async_trait::async_trait;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::auth::Authenticator;
use crate::connection::{AuthInfo, ConnectionInfo, Network};
use crate::proxy::{BoxedStream, ClientHandshake, Detector, Protocol, ServerHandshake};
use crate::{Error, Result};

pub const NAME: &str = "socks5";

pub const VERSION5: u8 = 0x05;
pub const AUTH_NONE: u8 = 0x00;
pub const AUTH_PASSWORD: u8 = 0x02;
pub const AUTH_NO_ACCEPT: u8 = 0xFF;
const PASSWORD_VERSION: u8 = 0x01;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REP_SUCCESS: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_CONN_REFUSED: u8 = 0x05;
pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDR_NOT_SUPPORTED: u8 = 0x08;

#[derive(Debug, Default)]
pub struct VersionDetector;

#[async_trait]
impl Detector for VersionDetector {
    async fn check(&self, stream: &mut (dyn AsyncRead + Unpin + Send)) -> io::Result<bool> {
        Ok(stream.read_u8().await? == VERSION5)
    }
}

/// Read `[atyp-specific address][port:2]` and format it as `host:port`.
///
/// Returns `Ok(None)` for an address type this implementation does not know.
async fn read_address<R>(stream: &mut R, atyp: u8) -> Result<Option<String>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let host = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            format!("[{}]", Ipv6Addr::from(octets))
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut domain = vec![0u8; len];
            stream.read_exact(&mut domain).await?;
            String::from_utf8(domain).map_err(|_| Error::frame("domain is not UTF-8"))?
        }
        _ => return Ok(None),
    };
    let port = stream.read_u16().await?;
    Ok(Some(format!("{}:{}", host, port)))
}

async fn read_string<R>(stream: &mut R) -> Result<String>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = stream.read_u8().await? as usize;
    let mut value = vec![0u8; len];
    stream.read_exact(&mut value).await?;
    String::from_utf8(value).map_err(|_| Error::frame("credential is not UTF-8"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Greeting,
    Request,
    Replied,
}

pub struct Server {
    stream: BoxedStream,
    peer: String,
    auth: Option<Arc<dyn Authenticator>>,
    info: Option<ConnectionInfo>,
    stage: Stage,
    /// Reply code decided during the handshake itself
    failure: Option<u8>,
}

impl Server {
    async fn reply(&mut self, code: u8) -> Result<()> {
        self.stream
            .write_all(&[VERSION5, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
            .await?;
        self.stream.flush().await?;
        self.stage = Stage::Replied;
        Ok(())
    }

    async fn negotiate(&mut self) -> Result<(String, String)> {
        let version = self.stream.read_u8().await?;
        if version != VERSION5 {
            return Err(Error::frame(format!("unsupported SOCKS version {}", version)));
        }
        let count = self.stream.read_u8().await? as usize;
        let mut methods = vec![0u8; count];
        self.stream.read_exact(&mut methods).await?;

        let method = if self.auth.is_some() || !methods.contains(&AUTH_NONE) {
            AUTH_PASSWORD
        } else {
            AUTH_NONE
        };
        if !methods.contains(&method) {
            self.stream.write_all(&[VERSION5, AUTH_NO_ACCEPT]).await?;
            self.stream.flush().await?;
            return Err(Error::auth("no acceptable authentication method"));
        }
        self.stream.write_all(&[VERSION5, method]).await?;
        self.stream.flush().await?;

        if method == AUTH_NONE {
            return Ok((String::new(), String::new()));
        }

        let version = self.stream.read_u8().await?;
        if version != PASSWORD_VERSION {
            return Err(Error::frame(format!(
                "unsupported password auth version {}",
                version
            )));
        }
        let username = read_string(&mut self.stream).await?;
        let password = read_string(&mut self.stream).await?;

        if let Some(auth) = &self.auth {
            let auth_info = AuthInfo {
                username: username.clone(),
                password: password.clone(),
                remote_address: self.peer.clone(),
                hardware_addresses: Vec::new(),
            };
            if !auth.authenticate(&auth_info) {
                self.stream.write_all(&[PASSWORD_VERSION, 0x01]).await?;
                self.stream.flush().await?;
                return Err(Error::auth(format!(
                    "user {:?} from {} rejected",
                    username, self.peer
                )));
            }
        }
        self.stream.write_all(&[PASSWORD_VERSION, 0x00]).await?;
        self.stream.flush().await?;
        Ok((username, password))
    }
}

#[async_trait]
impl ServerHandshake for Server {
    async fn handshake(&mut self) -> Result<()> {
        let (username, password) = self.negotiate().await?;
        self.stage = Stage::Request;

        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header).await?;
        if header[0] != VERSION5 {
            return Err(Error::frame(format!("unsupported SOCKS version {}", header[0])));
        }
        let network = match header[1] {
            CMD_CONNECT => Network::Tcp,
            CMD_UDP_ASSOCIATE => Network::Udp,
            cmd => {
                self.failure = Some(REP_CMD_NOT_SUPPORTED);
                return Err(Error::handshake(format!("unsupported command {:#04x}", cmd)));
            }
        };
        let address = match read_address(&mut self.stream, header[3]).await? {
            Some(address) => address,
            None => {
                self.failure = Some(REP_ADDR_NOT_SUPPORTED);
                return Err(Error::frame(format!("unsupported address type {:#04x}", header[3])));
            }
        };

        self.info = Some(ConnectionInfo::new(network, address).with_credentials(username, password));
        Ok(())
    }

    fn info(&self) -> Result<ConnectionInfo> {
        self.info
            .clone()
            .ok_or_else(|| Error::handshake("handshake not completed"))
    }

    async fn send_success(&mut self) -> Result<()> {
        self.reply(REP_SUCCESS).await
    }

    async fn send_error(&mut self, err: &Error) -> Result<()> {
        // Before the request phase the negotiation already answered.
        if self.stage != Stage::Request {
            return Ok(());
        }
        let code = match (self.failure, err) {
            (Some(code), _) => code,
            (None, Error::UnsupportedNetwork(_)) => REP_CMD_NOT_SUPPORTED,
            (None, e) if e.is_connection_refused() => REP_CONN_REFUSED,
            _ => REP_GENERAL_FAILURE,
        };
        self.reply(code).await
    }

    fn into_stream(self: Box<Self>) -> BoxedStream {
        self.stream
    }
}

crate::proxy::delegate_stream!(Server, stream);

/// Client role: CONNECT through an upstream SOCKS5 proxy.
pub struct Client {
    stream: BoxedStream,
}

#[async_trait]
impl ClientHandshake for Client {
    async fn handshake(&mut self) -> Result<()> {
        // Method selection depends on the credentials, which arrive with `connect`.
        Ok(())
    }

    async fn connect(&mut self, info: &ConnectionInfo) -> Result<()> {
        if info.network != Network::Tcp {
            return Err(Error::UnsupportedNetwork(info.network));
        }
        let with_password = !info.username.is_empty() || !info.password.is_empty();
        if with_password {
            self.stream
                .write_all(&[VERSION5, 2, AUTH_NONE, AUTH_PASSWORD])
                .await?;
        } else {
            self.stream.write_all(&[VERSION5, 1, AUTH_NONE]).await?;
        }
        self.stream.flush().await?;

        let mut choice = [0u8; 2];
        self.stream.read_exact(&mut choice).await?;
        match choice {
            [VERSION5, AUTH_NONE] => {}
            [VERSION5, AUTH_PASSWORD] if with_password => {
                let mut request = vec![PASSWORD_VERSION];
                for field in [&info.username, &info.password] {
                    let len = u8::try_from(field.len())
                        .map_err(|_| Error::frame("credential longer than 255 bytes"))?;
                    request.push(len);
                    request.extend_from_slice(field.as_bytes());
                }
                self.stream.write_all(&request).await?;
                self.stream.flush().await?;

                let mut status = [0u8; 2];
                self.stream.read_exact(&mut status).await?;
                if status[1] != 0x00 {
                    return Err(Error::auth("upstream SOCKS5 proxy rejected credentials"));
                }
            }
            _ => return Err(Error::auth("no acceptable authentication method")),
        }

        let (host, port) = info
            .address
            .rsplit_once(':')
            .ok_or_else(|| Error::frame(format!("missing port in {}", info.address)))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port: u16 = port
            .parse()
            .map_err(|_| Error::frame(format!("invalid port in {}", info.address)))?;
        let host_len = u8::try_from(host.len())
            .map_err(|_| Error::frame("host longer than 255 bytes"))?;

        let mut request = vec![VERSION5, CMD_CONNECT, 0x00, ATYP_DOMAIN, host_len];
        request.extend_from_slice(host.as_bytes());
        request.extend_from_slice(&port.to_be_bytes());
        self.stream.write_all(&request).await?;
        self.stream.flush().await?;

        let mut reply = [0u8; 4];
        self.stream.read_exact(&mut reply).await?;
        if reply[0] != VERSION5 {
            return Err(Error::frame(format!("unsupported SOCKS version {}", reply[0])));
        }
        read_address(&mut self.stream, reply[3])
            .await?
            .ok_or_else(|| Error::frame(format!("unsupported address type {:#04x}", reply[3])))?;
        if reply[1] != REP_SUCCESS {
            return Err(Error::remote(format!(
                "SOCKS5 connect failed with reply {:#04x}",
                reply[1]
            )));
        }
        Ok(())
    }

    fn into_stream(self: Box<Self>) -> BoxedStream {
        self.stream
    }
}

crate::proxy::delegate_stream!(Client, stream);

pub struct Socks5Protocol {
    auth: Option<Arc<dyn Authenticator>>,
}

impl Socks5Protocol {
    pub fn new(auth: Option<Arc<dyn Authenticator>>) -> Self {
        Self { auth }
    }
}

impl Protocol for Socks5Protocol {
    fn name(&self) -> &'static str {
        NAME
    }

    fn detector(&self) -> Box<dyn Detector> {
        Box::new(VersionDetector)
    }

    fn server(&self, stream: BoxedStream, peer: String) -> Box<dyn ServerHandshake> {
        Box::new(Server {
            stream,
            peer,
            auth: self.auth.clone(),
            info: None,
            stage: Stage::Greeting,
            failure: None,
        })
    }

    fn client(&self, stream: BoxedStream, _server_name: &str) -> Box<dyn ClientHandshake> {
        Box::new(Client { stream })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MockAuthenticator;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_detector() {
        let mut mock = tokio_test::io::Builder::new().read(b"\x05").build();
        assert!(VersionDetector.check(&mut mock).await.unwrap());
        let mut mock = tokio_test::io::Builder::new().read(b"\x04").build();
        assert!(!VersionDetector.check(&mut mock).await.unwrap());
    }

    #[tokio::test]
    async fn test_connect_ipv4_without_auth() {
        let mock = tokio_test::io::Builder::new()
            .read(&[5, 1, 0])
            .write(&[5, 0])
            .read(&[5, 1, 0, 1, 10, 0, 0, 1, 0x1f, 0x90])
            .write(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0])
            .build();
        let mut server = Socks5Protocol::new(None).server(Box::new(mock), "peer".to_string());
        server.handshake().await.unwrap();
        assert_eq!(
            server.info().unwrap(),
            ConnectionInfo::new(Network::Tcp, "10.0.0.1:8080")
        );
        server.send_success().await.unwrap();
    }

    #[tokio::test]
    async fn test_udp_associate_is_recorded() {
        let mock = tokio_test::io::Builder::new()
            .read(&[5, 1, 0])
            .write(&[5, 0])
            .read(&[5, 3, 0, 4])
            .read(&[0; 15])
            .read(&[1, 0, 53])
            .write(&[5, 7, 0, 1, 0, 0, 0, 0, 0, 0])
            .build();
        let mut server = Socks5Protocol::new(None).server(Box::new(mock), "peer".to_string());
        server.handshake().await.unwrap();
        let info = server.info().unwrap();
        assert_eq!(info.network, Network::Udp);
        assert_eq!(info.address, "[::1]:53");
        server
            .send_error(&Error::UnsupportedNetwork(Network::Udp))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let mock = tokio_test::io::Builder::new()
            .read(&[5, 1, 0])
            .write(&[5, 0])
            .read(&[5, 2, 0, 1])
            .write(&[5, 7, 0, 1, 0, 0, 0, 0, 0, 0])
            .build();
        let mut server = Socks5Protocol::new(None).server(Box::new(mock), "peer".to_string());
        let err = server.handshake().await.unwrap_err();
        server.send_error(&err).await.unwrap();
    }

    #[tokio::test]
    async fn test_password_auth_rejected() {
        let mut auth = MockAuthenticator::new();
        auth.expect_authenticate()
            .withf(|info| info.username == "eve" && info.password == "pw")
            .times(1)
            .return_const(false);
        let mock = tokio_test::io::Builder::new()
            .read(&[5, 2, 0, 2])
            .write(&[5, 2])
            .read(&[1, 3, b'e', b'v', b'e', 2, b'p', b'w'])
            .write(&[1, 1])
            .build();
        let mut server =
            Socks5Protocol::new(Some(Arc::new(auth))).server(Box::new(mock), "peer".to_string());
        let err = server.handshake().await.unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
        // the negotiation already answered; no request reply follows
        server.send_error(&err).await.unwrap();
    }

    #[tokio::test]
    async fn test_auth_required_but_not_offered() {
        let mut auth = MockAuthenticator::new();
        auth.expect_authenticate().never();
        let mock = tokio_test::io::Builder::new()
            .read(&[5, 1, 0])
            .write(&[5, 0xFF])
            .build();
        let mut server =
            Socks5Protocol::new(Some(Arc::new(auth))).server(Box::new(mock), "peer".to_string());
        assert!(matches!(server.handshake().await, Err(Error::Auth(_))));
    }

    #[tokio::test]
    async fn test_dial_refused_reply() {
        let mock = tokio_test::io::Builder::new()
            .read(&[5, 1, 0])
            .write(&[5, 0])
            .read(&[5, 1, 0, 3, 1, b'h', 0, 80])
            .write(&[5, 5, 0, 1, 0, 0, 0, 0, 0, 0])
            .build();
        let mut server = Socks5Protocol::new(None).server(Box::new(mock), "peer".to_string());
        server.handshake().await.unwrap();
        assert_eq!(server.info().unwrap().address, "h:80");
        let refused = Error::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        server.send_error(&refused).await.unwrap();
    }

    #[tokio::test]
    async fn test_client_against_server() {
        let mut auth = MockAuthenticator::new();
        auth.expect_authenticate()
            .withf(|info| info.username == "alice" && info.remote_address == "192.0.2.1:9")
            .return_const(true);
        let proto = Socks5Protocol::new(Some(Arc::new(auth)));
        let (a, b) = duplex(1024);
        let mut server = proto.server(Box::new(a), "192.0.2.1:9".to_string());
        let mut client = proto.client(Box::new(b), "upstream");

        let server_task = tokio::spawn(async move {
            server.handshake().await.unwrap();
            let info = server.info().unwrap();
            server.send_success().await.unwrap();
            (info, server.into_stream())
        });

        client.handshake().await.unwrap();
        client
            .connect(&ConnectionInfo::new(Network::Tcp, "example.com:443").with_credentials("alice", "pw"))
            .await
            .unwrap();
        let (info, mut server) = server_task.await.unwrap();
        assert_eq!(info.address, "example.com:443");
        assert_eq!(info.password, "pw");

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_client_failure_reply() {
        let mock = tokio_test::io::Builder::new()
            .write(&[5, 1, 0])
            .read(&[5, 0])
            .write(&[5, 1, 0, 3, 1, b'h', 0, 80])
            .read(&[5, 5, 0, 1, 0, 0, 0, 0, 0, 0])
            .build();
        let mut client = Socks5Protocol::new(None).client(Box::new(mock), "upstream");
        assert!(matches!(
            client.connect(&ConnectionInfo::new(Network::Tcp, "h:80")).await,
            Err(Error::Remote(_))
        ));
    }
}
