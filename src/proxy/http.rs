//! HTTP proxy negotiation: CONNECT tunnels and plain-HTTP forwarding
//!
//! CONNECT requests yield a target and nothing else; the `200 Connection
//! established` reply is the caller's job once the tunnel is actually up.
//! Plain requests (`GET http://host/path HTTP/1.1` and friends) have their
//! request line rewritten to origin-form and the whole rewritten head
//! (plus any body bytes that arrived with it) becomes the first payload
//! pushed through the tunnel.

use super::ProxyError;
use crate::protocol::Address;
use crate::MAX_HTTP_HEADER;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// What the client asked the proxy to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// CONNECT: open a raw tunnel, reply 200 once it is up
    Connect,
    /// Anything else: forward the rewritten request through the tunnel
    Forward,
}

/// Outcome of a successful HTTP negotiation
#[derive(Debug)]
pub struct HttpRequest {
    pub address: Address,
    pub kind: RequestKind,
    /// Bytes to inject into the tunnel before relaying: the rewritten head
    /// (Forward) and/or whatever the client sent past the header end.
    pub initial_data: Bytes,
}

/// Read and parse the client's request head.
pub async fn negotiate_http<S>(stream: &mut S) -> Result<HttpRequest, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);

    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() >= MAX_HTTP_HEADER {
            return Err(ProxyError::HeaderTooLarge(MAX_HTTP_HEADER));
        }
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(ProxyError::MalformedRequest(
                "connection closed before the request head ended".into(),
            ));
        }
    };

    let head = buf.split_to(head_end + 4);
    let leftover = buf.freeze();

    let head_str = match std::str::from_utf8(&head) {
        Ok(s) => s,
        Err(_) => {
            return reject(stream, "request head is not valid UTF-8").await;
        }
    };

    let (request_line, rest) = match head_str.split_once("\r\n") {
        Some(split) => split,
        None => return reject(stream, "missing request line").await,
    };

    let mut parts = request_line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v)) => (m, t, v),
        _ => return reject(stream, "malformed request line").await,
    };

    if method.eq_ignore_ascii_case("CONNECT") {
        let address = Address::parse(target, 443)
            .map_err(|_| ProxyError::InvalidAddress(target.to_string()))?;
        debug!("HTTP CONNECT to {}", address);

        return Ok(HttpRequest {
            address,
            kind: RequestKind::Connect,
            initial_data: leftover,
        });
    }

    // Plain request: resolve the target, rewrite the request line to
    // origin-form, forward headers and early body bytes untouched.
    let (address, origin_form) = if let Some(rest_uri) = target.strip_prefix("http://") {
        let (authority, path) = match rest_uri.find('/') {
            Some(idx) => (&rest_uri[..idx], &rest_uri[idx..]),
            None => (rest_uri, "/"),
        };
        let address = Address::parse(authority, 80)
            .map_err(|_| ProxyError::InvalidAddress(target.to_string()))?;
        (address, path.to_string())
    } else if target.starts_with('/') {
        match host_header(rest) {
            Some(host) => {
                let address = Address::parse(host, 80)
                    .map_err(|_| ProxyError::InvalidAddress(host.to_string()))?;
                (address, target.to_string())
            }
            None => return reject(stream, "origin-form request without a Host header").await,
        }
    } else {
        return reject(stream, "unsupported request target").await;
    };

    debug!("HTTP {} forwarded to {}", method, address);

    let mut rewritten = BytesMut::with_capacity(head.len() + leftover.len());
    rewritten.extend_from_slice(format!("{} {} {}\r\n", method, origin_form, version).as_bytes());
    rewritten.extend_from_slice(rest.as_bytes());
    rewritten.extend_from_slice(&leftover);

    Ok(HttpRequest {
        address,
        kind: RequestKind::Forward,
        initial_data: rewritten.freeze(),
    })
}

/// Best-effort 400, then fail the negotiation.
async fn reject<S, T>(stream: &mut S, reason: &str) -> Result<T, ProxyError>
where
    S: AsyncWrite + Unpin,
{
    let _ = stream
        .write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n")
        .await;
    Err(ProxyError::MalformedRequest(reason.to_string()))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Value of the Host header, if present.
fn host_header(headers: &str) -> Option<&str> {
    for line in headers.split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("host") {
                return Some(value.trim());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run_script(client_bytes: &[u8]) -> (Result<HttpRequest, ProxyError>, Vec<u8>) {
        // Large enough to hold any script below without blocking the write.
        let (mut server_side, mut client_side) = tokio::io::duplex(64 * 1024);
        client_side.write_all(client_bytes).await.unwrap();
        // Close the client's write half so truncated scripts surface as EOF.
        client_side.shutdown().await.unwrap();

        let result = negotiate_http(&mut server_side).await;

        let mut written = Vec::new();
        drop(server_side);
        client_side.read_to_end(&mut written).await.unwrap();
        (result, written)
    }

    #[tokio::test]
    async fn test_connect() {
        let (result, written) =
            run_script(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
                .await;
        let request = result.unwrap();
        assert_eq!(request.kind, RequestKind::Connect);
        assert_eq!(request.address, Address::Domain("example.com".into(), 443));
        assert!(request.initial_data.is_empty());
        // The 200 reply is deferred until the tunnel exists.
        assert!(written.is_empty());
    }

    #[tokio::test]
    async fn test_connect_default_port() {
        let (result, _) = run_script(b"CONNECT example.com HTTP/1.1\r\n\r\n").await;
        assert_eq!(
            result.unwrap().address,
            Address::Domain("example.com".into(), 443)
        );
    }

    #[tokio::test]
    async fn test_connect_preserves_early_bytes() {
        let (result, _) =
            run_script(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n\x16\x03\x01").await;
        let request = result.unwrap();
        assert_eq!(&request.initial_data[..], &[0x16, 0x03, 0x01]);
    }

    #[tokio::test]
    async fn test_absolute_uri_rewritten_to_origin_form() {
        let (result, _) =
            run_script(b"GET http://example.com/foo HTTP/1.1\r\nHost: example.com\r\n\r\n").await;
        let request = result.unwrap();
        assert_eq!(request.kind, RequestKind::Forward);
        assert_eq!(request.address, Address::Domain("example.com".into(), 80));
        assert!(request
            .initial_data
            .starts_with(b"GET /foo HTTP/1.1\r\nHost: example.com\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_absolute_uri_with_port_and_body() {
        let (result, _) = run_script(
            b"POST http://api.test:8080/v1 HTTP/1.1\r\nContent-Length: 2\r\n\r\nok",
        )
        .await;
        let request = result.unwrap();
        assert_eq!(request.address, Address::Domain("api.test".into(), 8080));
        assert!(request.initial_data.starts_with(b"POST /v1 HTTP/1.1\r\n"));
        assert!(request.initial_data.ends_with(b"\r\n\r\nok"));
    }

    #[tokio::test]
    async fn test_origin_form_uses_host_header() {
        let (result, _) =
            run_script(b"GET /index.html HTTP/1.1\r\nHost: example.com:8000\r\n\r\n").await;
        let request = result.unwrap();
        assert_eq!(request.address, Address::Domain("example.com".into(), 8000));
        assert!(request.initial_data.starts_with(b"GET /index.html HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_missing_host_gets_400() {
        let (result, written) = run_script(b"GET /index.html HTTP/1.1\r\n\r\n").await;
        assert!(matches!(result, Err(ProxyError::MalformedRequest(_))));
        assert!(written.starts_with(b"HTTP/1.1 400"));
    }

    #[tokio::test]
    async fn test_oversized_head_rejected() {
        let mut script = Vec::from(&b"GET http://example.com/ HTTP/1.1\r\n"[..]);
        while script.len() <= MAX_HTTP_HEADER {
            script.extend_from_slice(b"X-Padding: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\n");
        }
        let (result, _) = run_script(&script).await;
        assert!(matches!(result, Err(ProxyError::HeaderTooLarge(_))));
    }

    #[tokio::test]
    async fn test_truncated_head_rejected() {
        let (result, _) = run_script(b"GET http://example.com/ HTT").await;
        assert!(matches!(result, Err(ProxyError::MalformedRequest(_))));
    }
}
