//! Request and response payload encodings

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::connection::{ConnectionInfo, Network};
use crate::{Error, Result};

/// Longest value a one-byte length prefix can describe
pub const MAX_FIELD_LEN: usize = u8::MAX as usize;

const NETWORK_TCP: u8 = 0;
const NETWORK_UDP: u8 = 1;

/// Response status carried in the first payload byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Succeeded,
    UnknownError,
    AuthFailed,
    UnsupportedNetwork,
    MalformedRequest,
    Other(u8),
}

impl From<u8> for StatusCode {
    fn from(value: u8) -> Self {
        match value {
            0 => StatusCode::Succeeded,
            1 => StatusCode::UnknownError,
            2 => StatusCode::AuthFailed,
            3 => StatusCode::UnsupportedNetwork,
            4 => StatusCode::MalformedRequest,
            other => StatusCode::Other(other),
        }
    }
}

impl From<StatusCode> for u8 {
    fn from(code: StatusCode) -> Self {
        match code {
            StatusCode::Succeeded => 0,
            StatusCode::UnknownError => 1,
            StatusCode::AuthFailed => 2,
            StatusCode::UnsupportedNetwork => 3,
            StatusCode::MalformedRequest => 4,
            StatusCode::Other(other) => other,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StatusCode::Succeeded => "succeeded",
            StatusCode::UnknownError => "unknown error",
            StatusCode::AuthFailed => "authentication failed",
            StatusCode::UnsupportedNetwork => "unsupported network",
            StatusCode::MalformedRequest => "malformed request",
            StatusCode::Other(_) => "status",
        };
        write!(f, "{} ({})", text, u8::from(*self))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestMessage {
    pub network: Network,
    pub address: String,
    pub username: String,
    pub password: String,
    pub hardware_addresses: Vec<Vec<u8>>,
}

impl RequestMessage {
    fn has_credentials(&self) -> bool {
        !self.username.is_empty() || !self.password.is_empty() || !self.hardware_addresses.is_empty()
    }

    /// `[network][addr]` followed, unless every field is empty, by
    /// `[user][pass][count]{[hw]}`. Strings and addresses are u8-length prefixed.
    pub fn marshal(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_u8(match self.network {
            Network::Tcp => NETWORK_TCP,
            Network::Udp => NETWORK_UDP,
        });
        put_field(&mut buf, "address", self.address.as_bytes())?;

        if self.has_credentials() {
            put_field(&mut buf, "username", self.username.as_bytes())?;
            put_field(&mut buf, "password", self.password.as_bytes())?;
            if self.hardware_addresses.len() > MAX_FIELD_LEN {
                return Err(Error::frame(format!(
                    "{} hardware addresses exceed the limit of {}",
                    self.hardware_addresses.len(),
                    MAX_FIELD_LEN
                )));
            }
            buf.put_u8(self.hardware_addresses.len() as u8);
            for addr in &self.hardware_addresses {
                put_field(&mut buf, "hardware address", addr)?;
            }
        }
        Ok(buf.freeze())
    }

    pub fn unmarshal(mut payload: &[u8]) -> Result<Self> {
        let buf = &mut payload;
        let network = match get_u8(buf, "network")? {
            NETWORK_TCP => Network::Tcp,
            NETWORK_UDP => Network::Udp,
            other => return Err(Error::frame(format!("unknown network tag {}", other))),
        };
        let address = get_string(buf, "address")?;

        let mut message = RequestMessage {
            network,
            address,
            ..Default::default()
        };
        if !buf.has_remaining() {
            return Ok(message);
        }

        message.username = get_string(buf, "username")?;
        message.password = get_string(buf, "password")?;
        let count = get_u8(buf, "hardware address count")?;
        for _ in 0..count {
            message.hardware_addresses.push(get_field(buf, "hardware address")?);
        }
        if buf.has_remaining() {
            return Err(Error::frame(format!(
                "{} trailing bytes after request",
                buf.remaining()
            )));
        }
        Ok(message)
    }
}

impl From<ConnectionInfo> for RequestMessage {
    fn from(info: ConnectionInfo) -> Self {
        Self {
            network: info.network,
            address: info.address,
            username: info.username,
            password: info.password,
            hardware_addresses: info.hardware_addresses,
        }
    }
}

impl From<RequestMessage> for ConnectionInfo {
    fn from(message: RequestMessage) -> Self {
        Self {
            network: message.network,
            address: message.address,
            username: message.username,
            password: message.password,
            hardware_addresses: message.hardware_addresses,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMessage {
    pub code: StatusCode,
    pub message: String,
}

impl ResponseMessage {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// `[code]` followed by the message text filling the rest of the payload.
    pub fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.message.len());
        buf.put_u8(self.code.into());
        buf.put_slice(self.message.as_bytes());
        buf.freeze()
    }

    pub fn unmarshal(mut payload: &[u8]) -> Result<Self> {
        let buf = &mut payload;
        let code = StatusCode::from(get_u8(buf, "status")?);
        let message = String::from_utf8(buf.to_vec())
            .map_err(|_| Error::frame("response message is not UTF-8"))?;
        Ok(Self { code, message })
    }
}

fn put_field(buf: &mut BytesMut, name: &str, value: &[u8]) -> Result<()> {
    if value.len() > MAX_FIELD_LEN {
        return Err(Error::frame(format!(
            "{} of {} bytes exceeds {} bytes",
            name,
            value.len(),
            MAX_FIELD_LEN
        )));
    }
    buf.put_u8(value.len() as u8);
    buf.put_slice(value);
    Ok(())
}

fn get_u8(buf: &mut &[u8], name: &str) -> Result<u8> {
    if !buf.has_remaining() {
        return Err(Error::frame(format!("truncated {}", name)));
    }
    Ok(buf.get_u8())
}

fn get_field(buf: &mut &[u8], name: &str) -> Result<Vec<u8>> {
    let len = get_u8(buf, name)? as usize;
    if buf.remaining() < len {
        return Err(Error::frame(format!("truncated {}", name)));
    }
    let value = buf[..len].to_vec();
    buf.advance(len);
    Ok(value)
}

fn get_string(buf: &mut &[u8], name: &str) -> Result<String> {
    String::from_utf8(get_field(buf, name)?)
        .map_err(|_| Error::frame(format!("{} is not UTF-8", name)))
}
