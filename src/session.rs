//! Bidirectional relay between a client-facing and a target-facing stream

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved by a finished session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Transferred {
    /// local -> remote
    pub up: u64,
    /// remote -> local
    pub down: u64,
}

/// Owns both streams of one relayed connection.
///
/// Both streams are closed as soon as either direction finishes, and the
/// counts are only reported once both directions have stopped.
#[derive(Debug)]
pub struct Session<L, R> {
    local: L,
    remote: R,
}

impl<L, R> Session<L, R>
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(local: L, remote: R) -> Self {
        Self { local, remote }
    }

    pub async fn transport(self) -> Transferred {
        let (mut local_rd, mut local_wr) = tokio::io::split(self.local);
        let (mut remote_rd, mut remote_wr) = tokio::io::split(self.remote);
        let closed = CancellationToken::new();

        let (up, down) = tokio::join!(
            relay("up", &mut local_rd, &mut remote_wr, &closed),
            relay("down", &mut remote_rd, &mut local_wr, &closed),
        );

        let mut local = local_rd.unsplit(local_wr);
        let mut remote = remote_rd.unsplit(remote_wr);
        let _ = local.shutdown().await;
        let _ = remote.shutdown().await;

        Transferred { up, down }
    }
}

/// Copy until end-of-stream, an I/O failure, or the session closing.
async fn relay<Rd, Wr>(
    direction: &'static str,
    reader: &mut Rd,
    writer: &mut Wr,
    closed: &CancellationToken,
) -> u64
where
    Rd: AsyncRead + Unpin,
    Wr: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            _ = closed.cancelled() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("{} read error: {}", direction, e);
                    break;
                }
            },
        };

        let written = tokio::select! {
            _ = closed.cancelled() => break,
            written = writer.write_all(&buf[..n]) => written,
        };
        if let Err(e) = written {
            debug!("{} write error: {}", direction, e);
            break;
        }
        total += n as u64;
    }

    // first direction to stop closes the whole session
    closed.cancel();
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_up_counts_exactly() {
        let (local, mut client) = duplex(64 * 1024);
        let (remote, mut target) = duplex(64 * 1024);

        let payload = vec![7u8; 40_000];
        let expected = payload.clone();
        let session = tokio::spawn(Session::new(local, remote).transport());

        client.write_all(&payload).await.unwrap();

        let mut received = vec![0u8; expected.len()];
        target.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);
        drop(target);

        let transferred = session.await.unwrap();
        assert_eq!(transferred.up, 40_000);
        assert_eq!(transferred.down, 0);
    }

    #[tokio::test]
    async fn test_both_directions() {
        let (local, mut client) = duplex(1024);
        let (remote, mut target) = duplex(1024);
        let session = tokio::spawn(Session::new(local, remote).transport());

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        target.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        target.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        drop(client);
        let transferred = session.await.unwrap();
        assert_eq!(transferred, Transferred { up: 4, down: 5 });

        // the remote side was closed along with the local one
        let mut rest = Vec::new();
        target.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_immediate_close() {
        let (local, client) = duplex(1024);
        let (remote, _target) = duplex(1024);
        drop(client);

        let transferred = Session::new(local, remote).transport().await;
        assert_eq!(transferred, Transferred::default());
    }
}
