//! Ordered protocol registry and first-match dispatcher

use std::sync::Arc;

use tokio::io::AsyncRead;
use tracing::debug;

use crate::proxy::Protocol;
use crate::rewind::{is_capacity_error, RewindStream};
use crate::{Error, Result};

/// Protocols served on one listener, tried in registration order.
///
/// Built once at start-up and read-only afterwards.
#[derive(Clone, Default)]
pub struct Registry {
    protocols: Vec<Arc<dyn Protocol>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("protocols", &self.names())
            .finish()
    }
}

impl Registry {
    pub fn new(protocols: Vec<Arc<dyn Protocol>>) -> Self {
        Self { protocols }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Protocol>> {
        self.protocols.iter().find(|p| p.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.protocols.iter().map(|p| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.protocols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty()
    }

    /// Select the first protocol whose detector matches the start of `stream`.
    ///
    /// Every detector starts from offset zero of the recorded prefix. On a match
    /// the stream is rewound so the handshake sees the complete byte sequence.
    pub async fn dispatch<S>(&self, stream: &mut RewindStream<S>) -> Result<Arc<dyn Protocol>>
    where
        S: AsyncRead + Unpin + Send,
    {
        for protocol in &self.protocols {
            stream.reset();
            let detector = protocol.detector();
            match detector.check(stream).await {
                Ok(true) => {
                    stream.rewind()?;
                    return Ok(Arc::clone(protocol));
                }
                Ok(false) => debug!("protocol {} did not match", protocol.name()),
                Err(e) if is_capacity_error(&e) => {
                    debug!("detection window exhausted by {}", protocol.name());
                    return Err(Error::UnknownProtocol);
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Err(Error::UnknownProtocol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{BoxedStream, ClientHandshake, Detector, ServerHandshake};
    use async_trait::async_trait;
    use std::io;
    use tokio::io::AsyncReadExt;

    /// Matches when the stream starts with `prefix`.
    struct PrefixProtocol {
        name: &'static str,
        prefix: &'static [u8],
    }

    struct PrefixDetector(&'static [u8]);

    #[async_trait]
    impl Detector for PrefixDetector {
        async fn check(&self, stream: &mut (dyn AsyncRead + Unpin + Send)) -> io::Result<bool> {
            let mut buf = vec![0u8; self.0.len()];
            stream.read_exact(&mut buf).await?;
            Ok(buf == self.0)
        }
    }

    impl Protocol for PrefixProtocol {
        fn name(&self) -> &'static str {
            self.name
        }

        fn detector(&self) -> Box<dyn Detector> {
            Box::new(PrefixDetector(self.prefix))
        }

        fn server(&self, _stream: BoxedStream, _peer: String) -> Box<dyn ServerHandshake> {
            unimplemented!("detection only")
        }

        fn client(&self, _stream: BoxedStream, _server_name: &str) -> Box<dyn ClientHandshake> {
            unimplemented!("detection only")
        }
    }

    fn build(entries: &[(&'static str, &'static [u8])]) -> Registry {
        Registry::new(
            entries
                .iter()
                .map(|&(name, prefix)| {
                    Arc::new(PrefixProtocol { name, prefix }) as Arc<dyn Protocol>
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_dispatch_rewinds_to_start() {
        let registry = build(&[("abc", b"abc"), ("xyz", b"xyz")]);
        let mock = tokio_test::io::Builder::new().read(b"xyz-payload").build();
        let mut stream = RewindStream::new(mock, 255);

        let protocol = registry.dispatch(&mut stream).await.unwrap();
        assert_eq!(protocol.name(), "xyz");

        let mut all = Vec::new();
        stream.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, b"xyz-payload");
    }

    #[tokio::test]
    async fn test_first_match_wins() {
        let registry = build(&[("short", b"GE"), ("long", b"GET")]);
        let mock = tokio_test::io::Builder::new().read(b"GET /").build();
        let mut stream = RewindStream::new(mock, 255);

        let protocol = registry.dispatch(&mut stream).await.unwrap();
        assert_eq!(protocol.name(), "short");
        let mut all = Vec::new();
        stream.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, b"GET /");

        let reversed = build(&[("long", b"GET"), ("short", b"GE")]);
        let mock = tokio_test::io::Builder::new().read(b"GET /").build();
        let mut stream = RewindStream::new(mock, 255);
        assert_eq!(reversed.dispatch(&mut stream).await.unwrap().name(), "long");
        let mut all = Vec::new();
        stream.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, b"GET /");
    }

    #[tokio::test]
    async fn test_detection_is_idempotent() {
        let registry = build(&[("abc", b"abc")]);
        let mock = tokio_test::io::Builder::new().read(b"abc").build();
        let mut stream = RewindStream::new(mock, 255);

        let detector = registry.get("abc").unwrap().detector();
        assert!(detector.check(&mut stream).await.unwrap());
        stream.reset();
        assert!(detector.check(&mut stream).await.unwrap());
    }

    #[tokio::test]
    async fn test_no_match_is_unknown_protocol() {
        let registry = build(&[("abc", b"abc"), ("xyz", b"xyz")]);
        let mock = tokio_test::io::Builder::new().read(b"qqq").build();
        let mut stream = RewindStream::new(mock, 255);

        let err = match registry.dispatch(&mut stream).await {
            Ok(protocol) => panic!("unexpected match: {}", protocol.name()),
            Err(e) => e,
        };
        assert!(matches!(err, Error::UnknownProtocol));
    }

    #[tokio::test]
    async fn test_capacity_overflow_is_unknown_protocol() {
        let registry = build(&[("long", b"0123456789")]);
        let mock = tokio_test::io::Builder::new().read(b"01234567").build();
        let mut stream = RewindStream::new(mock, 8);

        let err = match registry.dispatch(&mut stream).await {
            Ok(protocol) => panic!("unexpected match: {}", protocol.name()),
            Err(e) => e,
        };
        assert!(matches!(err, Error::UnknownProtocol));
    }

    #[tokio::test]
    async fn test_read_failure_propagates() {
        let registry = build(&[("abc", b"abc")]);
        let mock = tokio_test::io::Builder::new().read(b"a").build();
        let mut stream = RewindStream::new(mock, 255);

        let err = match registry.dispatch(&mut stream).await {
            Ok(protocol) => panic!("unexpected match: {}", protocol.name()),
            Err(e) => e,
        };
        match err {
            Error::Io(e) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_lookup_by_name() {
        let registry = build(&[("abc", b"abc"), ("xyz", b"xyz")]);
        assert_eq!(registry.names(), vec!["abc", "xyz"]);
        assert!(registry.get("xyz").is_some());
        assert!(registry.get("mino").is_none());
        assert_eq!(registry.len(), 2);
    }
}
