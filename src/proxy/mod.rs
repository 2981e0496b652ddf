//! Protocol capability interface
//!
//! Every wire protocol served on the shared listener provides three roles:
//! a [`Detector`] that recognises the protocol from a short stream prefix, a
//! [`ServerHandshake`] that accepts a client and extracts its
//! [`ConnectionInfo`], and a [`ClientHandshake`] that re-issues a request to an
//! upstream proxy speaking the same protocol. A [`Protocol`] bundles the
//! factories for those roles.

pub mod protocols;
pub mod registry;

pub use registry::Registry;

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::connection::ConnectionInfo;
use crate::{Error, Result};

/// A duplex byte stream that can be moved between tasks
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + ?Sized> Stream for T {}

pub type BoxedStream = Box<dyn Stream>;

#[async_trait]
pub trait Detector: Send + Sync {
    /// Inspect a prefix of `stream`.
    ///
    /// `Ok(false)` means the bytes are present but do not match; read failures
    /// (including end-of-stream before the signature is complete) are errors.
    async fn check(&self, stream: &mut (dyn AsyncRead + Unpin + Send)) -> io::Result<bool>;
}

/// Server side of a protocol, bound to one accepted connection.
///
/// The role is itself a stream: after a successful handshake, reads and writes
/// go through whatever transformation the protocol applied (e.g. TLS).
#[async_trait]
pub trait ServerHandshake: AsyncRead + AsyncWrite + Unpin + Send {
    async fn handshake(&mut self) -> Result<()>;

    /// Requested target and credentials; only available after `handshake`.
    fn info(&self) -> Result<ConnectionInfo>;

    async fn send_success(&mut self) -> Result<()>;

    async fn send_error(&mut self, err: &Error) -> Result<()>;

    fn into_stream(self: Box<Self>) -> BoxedStream;
}

/// Client side of a protocol, bound to a connection to an upstream proxy.
#[async_trait]
pub trait ClientHandshake: AsyncRead + AsyncWrite + Unpin + Send {
    async fn handshake(&mut self) -> Result<()>;

    /// Issue the request for `info` and wait for the upstream's answer.
    async fn connect(&mut self, info: &ConnectionInfo) -> Result<()>;

    fn into_stream(self: Box<Self>) -> BoxedStream;
}

/// Protocol descriptor registered with the [`Registry`]
pub trait Protocol: Send + Sync {
    fn name(&self) -> &'static str;

    fn detector(&self) -> Box<dyn Detector>;

    /// `peer` is the client's address, handed to the authentication hook.
    fn server(&self, stream: BoxedStream, peer: String) -> Box<dyn ServerHandshake>;

    /// `server_name` is the upstream host, used where the protocol verifies it.
    fn client(&self, stream: BoxedStream, server_name: &str) -> Box<dyn ClientHandshake>;
}

/// Forward `AsyncRead`/`AsyncWrite` for a role struct to one of its fields.
macro_rules! delegate_stream {
    ($ty:ty, $field:ident) => {
        impl tokio::io::AsyncRead for $ty {
            fn poll_read(
                mut self: std::pin::Pin<&mut Self>,
                cx: &mut std::task::Context<'_>,
                buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::pin::Pin::new(&mut self.$field).poll_read(cx, buf)
            }
        }

        impl tokio::io::AsyncWrite for $ty {
            fn poll_write(
                mut self: std::pin::Pin<&mut Self>,
                cx: &mut std::task::Context<'_>,
                buf: &[u8],
            ) -> std::task::Poll<std::io::Result<usize>> {
                std::pin::Pin::new(&mut self.$field).poll_write(cx, buf)
            }

            fn poll_flush(
                mut self: std::pin::Pin<&mut Self>,
                cx: &mut std::task::Context<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::pin::Pin::new(&mut self.$field).poll_flush(cx)
            }

            fn poll_shutdown(
                mut self: std::pin::Pin<&mut Self>,
                cx: &mut std::task::Context<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::pin::Pin::new(&mut self.$field).poll_shutdown(cx)
            }
        }
    };
}

pub(crate) use delegate_stream;
