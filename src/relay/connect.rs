//! Outbound upstream connections
//!
//! Opens a socket to one of a relay's candidate upstreams, sends a minimal
//! pull request for the remote mount and parses the response head. Follows
//! redirects up to a fixed bound. Stream bytes that arrive glued to the
//! response head are handed back as leftover so the producer loop starts
//! with them.

use std::net::SocketAddr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::time;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::relay::config::{RelayConfig, UpstreamConfig};

/// Redirect bound per candidate
const MAX_REDIRECTS: usize = 10;

/// Response head larger than this is garbage
const MAX_HEAD_BYTES: usize = 16 * 1024;

/// An established upstream pull
pub struct UpstreamConnection {
    /// The open socket, positioned at the start of stream data
    pub stream: TcpStream,
    /// Response headers, keys lowercased
    pub headers: Vec<(String, String)>,
    /// Stream bytes that arrived with the response head
    pub leftover: Bytes,
}

/// Try the relay's upstream candidates in order until one streams
pub async fn open_upstream(relay: &RelayConfig) -> Result<UpstreamConnection> {
    let mut last_err: Option<Error> = None;
    for upstream in &relay.upstreams {
        match pull_from(relay, upstream).await {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                warn!(mount = %relay.local_mount, host = %upstream.host, port = upstream.port,
                      error = %e, "Upstream candidate failed");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        Error::RelayConnect(format!("no upstreams configured for {}", relay.local_mount))
    }))
}

async fn pull_from(relay: &RelayConfig, upstream: &UpstreamConfig) -> Result<UpstreamConnection> {
    let mut host = upstream.host.clone();
    let mut port = upstream.port;
    let mut mount = upstream.mount.clone();

    for _ in 0..=MAX_REDIRECTS {
        let mut stream = connect_to(&host, port, upstream).await?;

        let mut request = format!(
            "GET {} HTTP/1.0\r\nHost: {}:{}\r\nUser-Agent: aircast\r\n",
            mount, host, port
        );
        if let (Some(user), Some(pass)) = (&relay.username, &relay.password) {
            let credentials = BASE64.encode(format!("{}:{}", user, pass));
            request.push_str(&format!("Authorization: Basic {}\r\n", credentials));
        }
        request.push_str("\r\n");

        let exchange = async {
            stream.write_all(request.as_bytes()).await?;
            read_head(&mut stream).await
        };
        let (head, leftover) = time::timeout(upstream.timeout, exchange)
            .await
            .map_err(|_| {
                Error::RelayConnect(format!("response from {}:{} timed out", host, port))
            })??;

        let (status, headers) = parse_head(&head)?;
        match status {
            200 => {
                debug!(host = %host, port = port, mount = %mount, "Upstream streaming");
                return Ok(UpstreamConnection {
                    stream,
                    headers,
                    leftover,
                });
            }
            301 | 302 | 303 | 307 => {
                let location = headers
                    .iter()
                    .find(|(k, _)| k == "location")
                    .map(|(_, v)| v.as_str())
                    .ok_or_else(|| {
                        Error::UpstreamResponse(format!("redirect {} without location", status))
                    })?;
                let (next_host, next_port, next_mount) = parse_location(location)
                    .ok_or_else(|| {
                        Error::UpstreamResponse(format!("unusable redirect: {}", location))
                    })?;
                debug!(from = %format!("{}:{}{}", host, port, mount),
                       to = %location, "Following upstream redirect");
                host = next_host;
                port = next_port;
                mount = next_mount;
            }
            other => {
                return Err(Error::UpstreamResponse(format!(
                    "{}:{}{} answered {}",
                    host, port, mount, other
                )))
            }
        }
    }
    Err(Error::RelayConnect(format!(
        "redirect limit reached chasing {}:{}{}",
        upstream.host, upstream.port, upstream.mount
    )))
}

async fn connect_to(host: &str, port: u16, upstream: &UpstreamConfig) -> Result<TcpStream> {
    let addr = tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| Error::RelayConnect(format!("no address for {}:{}", host, port)))?;

    let connect = async {
        match upstream.bind {
            Some(ip) => {
                let socket = if addr.is_ipv4() {
                    TcpSocket::new_v4()?
                } else {
                    TcpSocket::new_v6()?
                };
                socket.bind(SocketAddr::new(ip, 0))?;
                socket.connect(addr).await
            }
            None => TcpStream::connect(addr).await,
        }
    };
    let stream = time::timeout(upstream.timeout, connect)
        .await
        .map_err(|_| Error::RelayConnect(format!("connect to {}:{} timed out", host, port)))??;
    Ok(stream)
}

/// Read up to the blank line ending the response head
///
/// Returns the head text and whatever stream bytes followed it in the same
/// reads.
async fn read_head(stream: &mut TcpStream) -> Result<(String, Bytes)> {
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some(end) = find_head_end(&buf) {
            let mut head = buf.split_to(end + 4);
            head.truncate(end);
            let head = String::from_utf8_lossy(&head).into_owned();
            return Ok((head, buf.freeze()));
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(Error::UpstreamResponse("response head too large".to_string()));
        }
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(Error::UpstreamResponse(
                "connection closed before response head".to_string(),
            ));
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Split a response head into status code and lowercased headers
fn parse_head(head: &str) -> Result<(u16, Vec<(String, String)>)> {
    let mut lines = head.lines();
    let status_line = lines
        .next()
        .ok_or_else(|| Error::UpstreamResponse("empty response head".to_string()))?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| {
            Error::UpstreamResponse(format!("unparsable status line: {}", status_line))
        })?;

    let mut headers = Vec::new();
    for line in lines {
        if let Some((key, value)) = line.split_once(':') {
            headers.push((key.trim().to_ascii_lowercase(), value.trim().to_string()));
        }
    }
    Ok((status, headers))
}

/// Pull host, port and mount out of an absolute http redirect target
fn parse_location(location: &str) -> Option<(String, u16, String)> {
    let rest = location.strip_prefix("http://")?;
    let (hostport, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    let (host, port) = match hostport.split_once(':') {
        Some((host, port)) => (host, port.parse::<u16>().ok()?),
        None => (hostport, 80),
    };
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port, path.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_head_status_and_headers() {
        let head = "HTTP/1.0 200 OK\r\nContent-Type: audio/mpeg\r\nicy-name: Test Radio";
        let (status, headers) = parse_head(head).unwrap();
        assert_eq!(status, 200);
        assert_eq!(
            headers,
            vec![
                ("content-type".to_string(), "audio/mpeg".to_string()),
                ("icy-name".to_string(), "Test Radio".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_head_rejects_garbage() {
        assert!(parse_head("ICY GARBAGE").is_err());
        assert!(parse_head("").is_err());
    }

    #[test]
    fn test_parse_location() {
        assert_eq!(
            parse_location("http://other.example.com:8080/live"),
            Some(("other.example.com".to_string(), 8080, "/live".to_string()))
        );
        assert_eq!(
            parse_location("http://other.example.com/live"),
            Some(("other.example.com".to_string(), 80, "/live".to_string()))
        );
        assert_eq!(parse_location("https://secure.example.com/live"), None);
        assert_eq!(parse_location("http:///live"), None);
    }

    #[test]
    fn test_find_head_end_splits_leftover() {
        let buf = b"HTTP/1.0 200 OK\r\n\r\nstreamdata";
        let end = find_head_end(buf).unwrap();
        assert_eq!(&buf[..end], b"HTTP/1.0 200 OK");
        assert_eq!(&buf[end + 4..], b"streamdata");
    }
}
