//! Proxy-aware remote dialing.
//!
//! Opens the TCP connection a relay uses to reach the broker's tunnel
//! endpoint. When `HTTP_PROXY`/`http_proxy` names a forward proxy, the
//! connection is tunneled through it with an HTTP CONNECT exchange;
//! after a `200` response the socket carries raw application bytes.

use std::env;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;

use crate::error::{Result, TunnelError};

/// Upper bound on CONNECT response headers; anything larger is garbage.
const MAX_RESPONSE_HEADER: usize = 8 * 1024;

/// Dial `host:port`, honoring the proxy environment variables.
pub async fn dial_remote(host: &str, port: u16) -> Result<TcpStream> {
    match proxy_from_env() {
        Some(proxy_addr) => {
            debug!("dialing {}:{} via proxy {}", host, port, proxy_addr);
            connect_via_proxy(&proxy_addr, host, port).await
        }
        None => {
            let stream = TcpStream::connect((host, port)).await?;
            debug!("connected to {}:{}", host, port);
            Ok(stream)
        }
    }
}

/// Proxy address from the environment: `HTTP_PROXY` first, then
/// `http_proxy`. Absence or an unparseable value means no proxy.
fn proxy_from_env() -> Option<String> {
    env::var("HTTP_PROXY")
        .or_else(|_| env::var("http_proxy"))
        .ok()
        .and_then(|raw| parse_proxy_addr(&raw))
}

fn parse_proxy_addr(raw: &str) -> Option<String> {
    let url = Url::parse(raw).ok()?;
    let host = url.host_str()?;
    let port = url.port_or_known_default().unwrap_or(80);
    Some(format!("{}:{}", host, port))
}

/// Connect to the proxy and issue `CONNECT host:port`. On success the
/// returned stream is the established tunnel; the CONNECT exchange is
/// invisible to the caller.
async fn connect_via_proxy(proxy_addr: &str, host: &str, port: u16) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(proxy_addr).await?;

    let target = format!("{}:{}", host, port);
    let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    // Read the response one byte at a time. A buffered reader could
    // consume tunnel bytes the endpoint sends right after its 200.
    let mut header = Vec::new();
    let mut byte = [0u8; 1];
    while !header.ends_with(b"\r\n\r\n") {
        if header.len() >= MAX_RESPONSE_HEADER {
            return Err(TunnelError::ProxyProtocolError);
        }
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => return Err(TunnelError::ProxyProtocolError),
            Ok(_) => header.push(byte[0]),
        }
    }

    parse_connect_status(&header)?;
    debug!("proxy {} accepted CONNECT to {}", proxy_addr, target);
    Ok(stream)
}

/// Parse the status line of a CONNECT response. Only `200` is success;
/// any other code surfaces the reason text the proxy gave.
fn parse_connect_status(header: &[u8]) -> Result<()> {
    let text = std::str::from_utf8(header).map_err(|_| TunnelError::ProxyProtocolError)?;
    let status_line = text.lines().next().ok_or(TunnelError::ProxyProtocolError)?;

    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().ok_or(TunnelError::ProxyProtocolError)?;
    if !version.starts_with("HTTP/") {
        return Err(TunnelError::ProxyProtocolError);
    }
    let code: u16 = parts
        .next()
        .and_then(|c| c.parse().ok())
        .ok_or(TunnelError::ProxyProtocolError)?;

    if code == 200 {
        Ok(())
    } else {
        let reason = parts.next().unwrap_or_default().trim().to_string();
        Err(TunnelError::ProxyRejected(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Fake forward proxy: asserts the CONNECT line, answers with
    /// `response`, then echoes one read back to the client.
    async fn spawn_proxy(expected_target: String, response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut byte = [0u8; 1];
            while !request.ends_with(b"\r\n\r\n") {
                if stream.read(&mut byte).await.unwrap_or(0) == 0 {
                    return;
                }
                request.push(byte[0]);
            }
            let text = String::from_utf8_lossy(&request);
            assert!(
                text.starts_with(&format!("CONNECT {expected_target} HTTP/1.1\r\n")),
                "unexpected request: {text}"
            );
            assert!(text.contains(&format!("Host: {expected_target}\r\n")));

            stream.write_all(response.as_bytes()).await.unwrap();

            let mut buf = [0u8; 64];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        addr
    }

    #[tokio::test]
    async fn connect_succeeds_on_200_and_is_transparent() {
        let proxy = spawn_proxy(
            "broker.example.com:4443".to_string(),
            "HTTP/1.1 200 Connection established\r\n\r\n",
        )
        .await;

        let mut stream = connect_via_proxy(&proxy, "broker.example.com", 4443)
            .await
            .unwrap();

        stream.write_all(b"raw bytes").await.unwrap();
        let mut buf = [0u8; 9];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"raw bytes");
    }

    #[tokio::test]
    async fn connect_rejection_carries_reason_text() {
        let proxy = spawn_proxy(
            "broker.example.com:4443".to_string(),
            "HTTP/1.1 403 Forbidden\r\n\r\n",
        )
        .await;

        let err = connect_via_proxy(&proxy, "broker.example.com", 4443)
            .await
            .unwrap_err();
        match err {
            TunnelError::ProxyRejected(reason) => assert_eq!(reason, "Forbidden"),
            other => panic!("expected ProxyRejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn garbage_response_is_a_protocol_error() {
        let proxy = spawn_proxy(
            "broker.example.com:4443".to_string(),
            "SSH-2.0-OpenSSH\r\n\r\n",
        )
        .await;

        let err = connect_via_proxy(&proxy, "broker.example.com", 4443)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::ProxyProtocolError));
    }

    #[test]
    fn proxy_addr_parsing() {
        assert_eq!(
            parse_proxy_addr("http://proxy.local:3128"),
            Some("proxy.local:3128".to_string())
        );
        // scheme default port
        assert_eq!(
            parse_proxy_addr("http://proxy.local"),
            Some("proxy.local:80".to_string())
        );
        // not a URL: treated as no proxy
        assert_eq!(parse_proxy_addr("not a url"), None);
    }

    #[test]
    fn status_line_parsing() {
        assert!(parse_connect_status(b"HTTP/1.1 200 Connection established\r\n\r\n").is_ok());
        assert!(matches!(
            parse_connect_status(b"HTTP/1.0 407 Proxy Authentication Required\r\n\r\n"),
            Err(TunnelError::ProxyRejected(reason)) if reason == "Proxy Authentication Required"
        ));
        assert!(matches!(
            parse_connect_status(b"\r\n\r\n"),
            Err(TunnelError::ProxyProtocolError)
        ));
    }
}
