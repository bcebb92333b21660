//! First-bytes protocol classification.

use std::io;
use std::time::Duration;

use tokio::net::TcpStream;

/// What a new connection speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tls,
    Http,
}

/// Bytes needed to tell a TLS record header apart from anything else.
pub const SNIFF_LEN: usize = 3;

/// Classify a connection prefix.
///
/// A TLS handshake record starts with content type `0x16` followed by a
/// `0x03 0x00..=0x04` legacy version. Returns `None` for an empty prefix.
pub fn classify(prefix: &[u8]) -> Option<Protocol> {
    match prefix {
        [] => None,
        [0x16] | [0x16, 0x03] => Some(Protocol::Tls),
        [0x16, 0x03, minor, ..] if *minor <= 0x04 => Some(Protocol::Tls),
        _ => Some(Protocol::Http),
    }
}

/// Peek at the connection until enough bytes arrive to classify it.
///
/// Returns `Ok(None)` if the peer closes without sending anything; a peer
/// that stays silent past `timeout` is an error.
pub async fn sniff(stream: &TcpStream, timeout: Duration) -> io::Result<Option<Protocol>> {
    let mut buf = [0u8; SNIFF_LEN];
    let peek = async {
        loop {
            let n = stream.peek(&mut buf).await?;
            // peek returns whatever is buffered; wait for a full header unless
            // the first byte already rules TLS out.
            if n == 0 || n >= SNIFF_LEN || buf[0] != 0x16 {
                return Ok::<_, io::Error>(classify(&buf[..n]));
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(timeout, peek)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no data before sniff timeout"))?
}
