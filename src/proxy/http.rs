//! Minimal HTTP/1.1 codec
//!
//! Reads and writes requests and responses over buffered streams. The
//! relay is payload agnostic: status reason phrases, header casing, and
//! body bytes pass through untouched. Chunked bodies are decoded on read
//! and re-framed with a Content-Length on write; the bytes themselves are
//! never altered.

use crate::{Error, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Ordered, case-preserving header list.
#[derive(Debug, Clone, Default)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Headers(Vec::new())
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value for `name`, case-insensitive.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Remove every occurrence of `name`.
    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// Replace (or insert) the single value for `name`.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.0.push((name.to_string(), value.into()));
    }

    /// True when `name` lists `token` (comma separated, case-insensitive).
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.0
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .flat_map(|(_, v)| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A parsed downstream or replayed request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    /// Target exactly as received: absolute form on the proxy port,
    /// origin form inside a terminated tunnel, authority form for CONNECT.
    pub target: String,
    pub version: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Request {
    /// True when the downstream connection should close after this exchange.
    pub fn wants_close(&self) -> bool {
        wants_close(&self.version, &self.headers)
    }
}

/// A parsed upstream response.
#[derive(Debug, Clone)]
pub struct Response {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Response {
    /// Build a relay-generated response (gateway errors, config errors).
    pub fn synthetic(status: u16, reason: &str, body: &str) -> Self {
        let mut headers = Headers::new();
        headers.push("Content-Type", "text/plain; charset=utf-8");
        headers.push("Content-Length", body.len().to_string());
        headers.push("Connection", "close");
        Response {
            version: "HTTP/1.1".to_string(),
            status,
            reason: reason.to_string(),
            headers,
            body: body.as_bytes().to_vec(),
        }
    }

    pub fn wants_close(&self) -> bool {
        wants_close(&self.version, &self.headers)
    }

    /// True when the `WWW-Authenticate` header advertises NTLM or Negotiate.
    pub fn has_ntlm_challenge(&self) -> bool {
        self.headers
            .get("WWW-Authenticate")
            .map(|v| {
                v.split(',').any(|token| {
                    let name = token.trim().split_whitespace().next().unwrap_or("");
                    name.eq_ignore_ascii_case("NTLM") || name.eq_ignore_ascii_case("Negotiate")
                })
            })
            .unwrap_or(false)
    }
}

fn wants_close(version: &str, headers: &Headers) -> bool {
    if headers.has_token("Connection", "close") {
        return true;
    }
    // HTTP/1.0 closes by default
    version.eq_ignore_ascii_case("HTTP/1.0") && !headers.has_token("Connection", "keep-alive")
}

/// Read one request head plus body. Returns `None` on a clean EOF before
/// the request line.
pub async fn read_request<R>(reader: &mut R) -> Result<Option<Request>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    let line = line.trim_end();
    if line.is_empty() {
        return Err(Error::protocol("Empty request line"));
    }

    let mut parts = line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| Error::protocol("Missing method"))?
        .to_string();
    let target = parts
        .next()
        .ok_or_else(|| Error::protocol("Missing request target"))?
        .to_string();
    let version = parts.next().unwrap_or("HTTP/1.1").to_string();

    let headers = read_headers(reader).await?;

    // CONNECT carries no body; everything else is framed by its headers
    let body = if method.eq_ignore_ascii_case("CONNECT") {
        Vec::new()
    } else {
        read_body(reader, &headers, false).await?
    };

    Ok(Some(Request {
        method,
        target,
        version,
        headers,
        body,
    }))
}

/// Read one response. `head_only` suppresses the body (HEAD requests).
pub async fn read_response<R>(reader: &mut R, head_only: bool) -> Result<Response>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(Error::upstream_aborted("Connection closed before response"));
    }
    let line = line.trim_end();

    // Status line: HTTP/1.1 SP code SP reason-phrase (reason may be empty
    // or contain spaces; it is preserved byte for byte)
    let (version, rest) = line
        .split_once(' ')
        .ok_or_else(|| Error::protocol(format!("Malformed status line: {}", line)))?;
    let (code, reason) = match rest.split_once(' ') {
        Some((code, reason)) => (code, reason),
        None => (rest, ""),
    };
    let status: u16 = code
        .parse()
        .map_err(|_| Error::protocol(format!("Invalid status code: {}", code)))?;

    let headers = read_headers(reader).await?;

    let body = if head_only || !response_has_body(status) {
        // Drain nothing; these responses are defined to carry no body
        Vec::new()
    } else {
        // Responses on a closing connection may be EOF delimited
        let eof_fallback = wants_close(version, &headers);
        read_body(reader, &headers, eof_fallback).await?
    };

    Ok(Response {
        version: version.to_string(),
        status,
        reason: reason.to_string(),
        headers,
        body,
    })
}

fn response_has_body(status: u16) -> bool {
    !(status < 200 || status == 204 || status == 304)
}

async fn read_headers<R>(reader: &mut R) -> Result<Headers>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = Headers::new();
    let mut total = 0usize;
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(Error::protocol("Connection closed inside headers"));
        }
        total += n;
        if total > MAX_HEADER_BYTES {
            return Err(Error::protocol("Header section too large"));
        }
        let line = line.trim_end();
        if line.is_empty() {
            return Ok(headers);
        }
        match line.split_once(':') {
            Some((name, value)) => headers.push(name.trim(), value.trim()),
            None => return Err(Error::protocol(format!("Malformed header line: {}", line))),
        }
    }
}

async fn read_body<R>(reader: &mut R, headers: &Headers, eof_fallback: bool) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    if headers
        .get("Transfer-Encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
    {
        return read_chunked_body(reader).await;
    }

    if let Some(len) = headers.get("Content-Length") {
        let len: usize = len
            .trim()
            .parse()
            .map_err(|_| Error::protocol(format!("Invalid Content-Length: {}", len)))?;
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await?;
        return Ok(body);
    }

    if eof_fallback {
        let mut body = Vec::new();
        reader.read_to_end(&mut body).await?;
        return Ok(body);
    }

    Ok(Vec::new())
}

async fn read_chunked_body<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();
    loop {
        let mut size_line = String::new();
        let n = reader.read_line(&mut size_line).await?;
        if n == 0 {
            return Err(Error::upstream_aborted("Connection closed inside chunked body"));
        }
        let size_str = size_line.trim_end();
        let size_str = size_str.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| Error::protocol(format!("Invalid chunk size: {}", size_str)))?;

        if size == 0 {
            // Trailer section up to the final empty line
            loop {
                let mut trailer = String::new();
                let n = reader.read_line(&mut trailer).await?;
                if n == 0 || trailer.trim_end().is_empty() {
                    break;
                }
            }
            return Ok(body);
        }

        let start = body.len();
        body.resize(start + size, 0);
        reader.read_exact(&mut body[start..]).await?;

        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await?;
        if &crlf != b"\r\n" {
            return Err(Error::protocol("Missing CRLF after chunk"));
        }
    }
}

/// Serialize a request. Headers are written as given; the caller is
/// responsible for framing consistency.
pub async fn write_request<W>(writer: &mut W, request: &Request) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut head = format!("{} {} {}\r\n", request.method, request.target, request.version);
    for (name, value) in request.headers.iter() {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");

    writer.write_all(head.as_bytes()).await?;
    if !request.body.is_empty() {
        writer.write_all(&request.body).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Serialize a response, re-framing the (already decoded) body with a
/// Content-Length.
pub async fn write_response<W>(writer: &mut W, response: &Response) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut head = if response.reason.is_empty() {
        format!("{} {}\r\n", response.version, response.status)
    } else {
        format!("{} {} {}\r\n", response.version, response.status, response.reason)
    };

    let needs_length = response_has_body(response.status);
    for (name, value) in response.headers.iter() {
        if name.eq_ignore_ascii_case("Transfer-Encoding")
            || (needs_length && name.eq_ignore_ascii_case("Content-Length"))
        {
            continue;
        }
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    if needs_length {
        head.push_str(&format!("Content-Length: {}\r\n", response.body.len()));
    }
    head.push_str("\r\n");

    writer.write_all(head.as_bytes()).await?;
    if !response.body.is_empty() {
        writer.write_all(&response.body).await?;
    }
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn parse_request(raw: &[u8]) -> Request {
        let mut reader = BufReader::new(raw);
        read_request(&mut reader).await.unwrap().unwrap()
    }

    async fn parse_response(raw: &[u8]) -> Response {
        let mut reader = BufReader::new(raw);
        read_response(&mut reader, false).await.unwrap()
    }

    #[tokio::test]
    async fn test_read_simple_request() {
        let req = parse_request(b"GET http://host:5000/get HTTP/1.1\r\nHost: host:5000\r\n\r\n").await;
        assert_eq!(req.method, "GET");
        assert_eq!(req.target, "http://host:5000/get");
        assert_eq!(req.headers.get("host"), Some("host:5000"));
        assert!(req.body.is_empty());
    }

    #[tokio::test]
    async fn test_read_request_with_body() {
        let req = parse_request(
            b"POST /post HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\n\r\nhello",
        )
        .await;
        assert_eq!(req.body, b"hello");
    }

    #[tokio::test]
    async fn test_eof_returns_none() {
        let mut reader = BufReader::new(&b""[..]);
        assert!(read_request(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_response_preserves_reason_phrase() {
        let resp =
            parse_response(b"HTTP/1.1 200 My fantastic status phrase\r\nContent-Length: 2\r\n\r\nOK")
                .await;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.reason, "My fantastic status phrase");
        assert_eq!(resp.body, b"OK");
    }

    #[tokio::test]
    async fn test_response_preserves_utf8_body() {
        let payload = "OK ÅÄÖéß".as_bytes();
        let raw = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n",
            payload.len()
        );
        let mut bytes = raw.into_bytes();
        bytes.extend_from_slice(payload);
        let resp = parse_response(&bytes).await;
        assert_eq!(resp.body, payload);
    }

    #[tokio::test]
    async fn test_chunked_body_decoding() {
        let resp = parse_response(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
        )
        .await;
        assert_eq!(resp.body, b"hello world");
    }

    #[tokio::test]
    async fn test_no_body_statuses() {
        let resp = parse_response(b"HTTP/1.1 204 No Content\r\n\r\n").await;
        assert!(resp.body.is_empty());
    }

    #[tokio::test]
    async fn test_write_response_reframes_chunked() {
        let resp = parse_response(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nhi\r\n0\r\n\r\n",
        )
        .await;
        let mut out = Vec::new();
        write_response(&mut out, &resp).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Content-Length: 2"));
        assert!(!text.to_lowercase().contains("transfer-encoding"));
        assert!(text.ends_with("hi"));
    }

    #[tokio::test]
    async fn test_ntlm_challenge_detection() {
        let resp = parse_response(
            b"HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: NTLM\r\nContent-Length: 0\r\n\r\n",
        )
        .await;
        assert!(resp.has_ntlm_challenge());

        let resp = parse_response(
            b"HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: Basic realm=\"x\"\r\nContent-Length: 0\r\n\r\n",
        )
        .await;
        assert!(!resp.has_ntlm_challenge());
    }

    #[tokio::test]
    async fn test_wants_close() {
        let req = parse_request(b"GET / HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n").await;
        assert!(req.wants_close());
        let req = parse_request(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n").await;
        assert!(!req.wants_close());
        let req = parse_request(b"GET / HTTP/1.0\r\nHost: h\r\n\r\n").await;
        assert!(req.wants_close());
    }

    #[test]
    fn test_headers_case_insensitive_ops() {
        let mut headers = Headers::new();
        headers.push("Content-Type", "text/plain");
        headers.push("X-Custom", "1");
        assert_eq!(headers.get("content-type"), Some("text/plain"));
        headers.set("content-type", "application/json");
        assert_eq!(headers.get("Content-Type"), Some("application/json"));
        headers.remove("CONTENT-TYPE");
        assert!(headers.get("content-type").is_none());
        assert_eq!(headers.len(), 1);
    }
}
