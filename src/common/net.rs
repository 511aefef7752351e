//! Network utilities

use crate::{Error, Result};
use socket2::SockRef;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

#[inline]
pub fn configure_tcp_stream(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let sock = SockRef::from(stream);
    let _ = sock.set_keepalive(true);
}

/// Copy data between two streams bidirectionally
pub async fn copy_bidirectional<A, B>(a: &mut A, b: &mut B) -> Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (up, down) = tokio::io::copy_bidirectional(a, b).await?;
    Ok((up, down))
}

/// Find end of HTTP headers (double CRLF)
pub fn find_header_end(data: &[u8]) -> Option<usize> {
    for i in 0..data.len().saturating_sub(3) {
        if &data[i..i + 4] == b"\r\n\r\n" {
            return Some(i + 4);
        }
    }
    None
}

/// Parse `host:port` (with optional bracketed IPv6), falling back to
/// `default_port` when no port is present.
pub fn parse_host_port(value: &str, default_port: u16) -> Result<(String, u16)> {
    if let Some(rest) = value.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let host = rest[..end].to_string();
            let port = match rest[end + 1..].strip_prefix(':') {
                Some(p) => p
                    .parse()
                    .map_err(|_| Error::protocol(format!("Invalid port in {}", value)))?,
                None => default_port,
            };
            return Ok((host, port));
        }
        return Err(Error::protocol(format!("Unterminated IPv6 literal: {}", value)));
    }

    match value.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| Error::protocol(format!("Invalid port in {}", value)))?;
            Ok((host.to_string(), port))
        }
        None => Ok((value.to_string(), default_port)),
    }
}
