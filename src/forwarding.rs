// ===========================================
// Imports
// ===========================================
use crate::metrics;
use log::debug;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

// ===========================================
// Bidirectional TCP Relay
// ===========================================

/// Copies bytes between the client and the backend until both directions
/// close. Each direction propagates its half-close (TCP FIN) to the other
/// side so the peer can drain cleanly. Returns the first error that is not
/// an ordinary connection teardown.
pub async fn relay(client: &mut TcpStream, backend: &mut TcpStream) -> io::Result<()> {
    let (mut client_read, mut client_write) = client.split();
    let (mut backend_read, mut backend_write) = backend.split();

    let (upstream, downstream) = tokio::join!(
        pipe(&mut client_read, &mut backend_write, "client->backend"),
        pipe(&mut backend_read, &mut client_write, "backend->client"),
    );

    for result in [upstream, downstream] {
        match result {
            Ok(bytes) => debug!("Relay direction finished after {} bytes", bytes),
            Err(e) if is_benign_disconnect(&e) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Forwards data from `from` to `to` until EOF or an error, then shuts down
/// the write side so the FIN reaches the destination.
async fn pipe<R, W>(from: &mut R, to: &mut W, tag: &'static str) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 2048];
    let mut total = 0u64;
    let result = loop {
        match from.read(&mut buf).await {
            Ok(0) => break Ok(()), // EOF
            Ok(n) => {
                if let Err(e) = to.write_all(&buf[..n]).await {
                    debug!("{} - write error: {}", tag, e);
                    break Err(e);
                }
                total += n as u64;
                metrics::record_bytes(tag, n);
            }
            Err(e) => {
                debug!("{} - read error: {}", tag, e);
                break Err(e);
            }
        }
    };
    let _ = to.shutdown().await;
    result.map(|_| total)
}

/// Errors that only mean the peer went away mid-stream.
pub fn is_benign_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_teardown_errors_are_benign() {
        assert!(is_benign_disconnect(&io::Error::new(
            io::ErrorKind::ConnectionReset,
            "reset",
        )));
        assert!(is_benign_disconnect(&io::Error::new(
            io::ErrorKind::BrokenPipe,
            "pipe",
        )));
        assert!(!is_benign_disconnect(&io::Error::new(
            io::ErrorKind::InvalidData,
            "bad frame",
        )));
    }

    #[tokio::test]
    async fn relay_moves_bytes_both_ways_and_propagates_fin() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = listener.local_addr().unwrap();

        let relay_side = tokio::spawn(async move {
            let (mut backend, _) = listener.accept().await.unwrap();
            let front = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let front_addr = front.local_addr().unwrap();
            let accept = tokio::spawn(async move {
                let (mut client, _) = front.accept().await.unwrap();
                relay(&mut client, &mut backend).await
            });
            (front_addr, accept)
        });

        let mut backend_peer = TcpStream::connect(backend_addr).await.unwrap();
        let (front_addr, relay_task) = relay_side.await.unwrap();
        let mut client = TcpStream::connect(front_addr).await.unwrap();

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        backend_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        backend_peer.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Client close must reach the backend as EOF.
        drop(client);
        let n = backend_peer.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
        drop(backend_peer);

        relay_task.await.unwrap().unwrap();
    }
}
