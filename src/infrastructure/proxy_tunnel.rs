//! WebSocket dialing through an outbound proxy.
//!
//! HTTP proxies are tunnelled with CONNECT, SOCKS5 proxies with the
//! no-auth or username/password handshake. TLS and the WebSocket upgrade run
//! over the tunnel afterwards.

use crate::domain::entities::credential::{ProxyConfig, ProxyKind};
use crate::domain::repositories::private_stream::StreamError;
use base64::{engine::general_purpose, Engine as _};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{client_async_tls, connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connect to `url`, directly or through `proxy`, within `timeout`
pub async fn dial(url: &str, proxy: Option<&ProxyConfig>, timeout: Duration) -> Result<WsStream, StreamError> {
    let attempt = async {
        match proxy {
            None => connect_async(url)
                .await
                .map(|(ws, _)| ws)
                .map_err(|e| StreamError::Connect(e.to_string())),
            Some(proxy) => {
                let (host, port) = target_of(url)?;
                let tunnel = open_tunnel(proxy, &host, port).await?;
                client_async_tls(url, tunnel)
                    .await
                    .map(|(ws, _)| ws)
                    .map_err(|e| StreamError::Connect(format!("handshake via proxy: {}", e)))
            }
        }
    };

    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| StreamError::Connect(format!("connect timed out after {:?}", timeout)))?
}

fn target_of(url: &str) -> Result<(String, u16), StreamError> {
    let parsed = Url::parse(url).map_err(|e| StreamError::Connect(format!("invalid url: {}", e)))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| StreamError::Connect(format!("url has no host: {}", url)))?
        .to_string();
    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| StreamError::Connect(format!("url has no port: {}", url)))?;
    Ok((host, port))
}

async fn open_tunnel(proxy: &ProxyConfig, host: &str, port: u16) -> Result<TcpStream, StreamError> {
    let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port))
        .await
        .map_err(|e| StreamError::Connect(format!("proxy {}:{}: {}", proxy.host, proxy.port, e)))?;

    match proxy.kind {
        ProxyKind::Http => http_connect(&mut stream, proxy, host, port).await?,
        ProxyKind::Socks5 => socks5_connect(&mut stream, proxy, host, port).await?,
    }
    Ok(stream)
}

async fn http_connect(
    stream: &mut TcpStream,
    proxy: &ProxyConfig,
    host: &str,
    port: u16,
) -> Result<(), StreamError> {
    let mut request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n",
        host = host,
        port = port
    );
    if let Some(user) = &proxy.username {
        let token = general_purpose::STANDARD.encode(format!(
            "{}:{}",
            user,
            proxy.password.as_deref().unwrap_or("")
        ));
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", token));
    }
    request.push_str("\r\n");

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| StreamError::Connect(format!("proxy write: {}", e)))?;

    // Read the response head byte by byte so no tunnelled bytes are consumed
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() > 8192 {
            return Err(StreamError::Connect("proxy response too large".to_string()));
        }
        let n = stream
            .read(&mut byte)
            .await
            .map_err(|e| StreamError::Connect(format!("proxy read: {}", e)))?;
        if n == 0 {
            return Err(StreamError::Connect("proxy closed during CONNECT".to_string()));
        }
        head.push(byte[0]);
    }

    let status_line = String::from_utf8_lossy(&head);
    let status = status_line.split_whitespace().nth(1).unwrap_or("");
    if status != "200" {
        return Err(StreamError::Connect(format!(
            "proxy CONNECT rejected: {}",
            status_line.lines().next().unwrap_or("")
        )));
    }
    Ok(())
}

async fn socks5_connect(
    stream: &mut TcpStream,
    proxy: &ProxyConfig,
    host: &str,
    port: u16,
) -> Result<(), StreamError> {
    let io = |e: std::io::Error| StreamError::Connect(format!("socks5: {}", e));

    let methods: &[u8] = if proxy.username.is_some() { &[0x00, 0x02] } else { &[0x00] };
    let mut greeting = vec![0x05, methods.len() as u8];
    greeting.extend_from_slice(methods);
    stream.write_all(&greeting).await.map_err(io)?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await.map_err(io)?;
    match choice {
        [0x05, 0x00] => {}
        [0x05, 0x02] => {
            let user = proxy.username.as_deref().unwrap_or("");
            let pass = proxy.password.as_deref().unwrap_or("");
            if user.len() > 255 || pass.len() > 255 {
                return Err(StreamError::Connect("socks5 credentials too long".to_string()));
            }
            let mut auth = vec![0x01, user.len() as u8];
            auth.extend_from_slice(user.as_bytes());
            auth.push(pass.len() as u8);
            auth.extend_from_slice(pass.as_bytes());
            stream.write_all(&auth).await.map_err(io)?;

            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await.map_err(io)?;
            if status[1] != 0x00 {
                return Err(StreamError::Connect("socks5 authentication rejected".to_string()));
            }
        }
        other => {
            return Err(StreamError::Connect(format!(
                "socks5 method not accepted: {:?}",
                other
            )))
        }
    }

    if host.len() > 255 {
        return Err(StreamError::Connect("socks5 host too long".to_string()));
    }
    let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await.map_err(io)?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await.map_err(io)?;
    if reply[1] != 0x00 {
        return Err(StreamError::Connect(format!("socks5 connect failed: code {}", reply[1])));
    }
    // Skip the bound address
    let addr_len = match reply[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.map_err(io)?;
            len[0] as usize
        }
        other => return Err(StreamError::Connect(format!("socks5 address type {}", other))),
    };
    let mut rest = vec![0u8; addr_len + 2];
    stream.read_exact(&mut rest).await.map_err(io)?;
    Ok(())
}
