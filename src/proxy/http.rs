//! HTTP CONNECT proxy front-end

use super::ProxyError;
use crate::pool::SessionPool;
use crate::relay::{splice_tcp, StreamKind, Target};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

/// Accept HTTP clients and relay their CONNECT targets through the pool.
pub async fn serve(pool: Arc<SessionPool>, listener: TcpListener) {
    if let Ok(addr) = listener.local_addr() {
        info!(bind = %addr, "HTTP proxy listening");
    }

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                debug!("HTTP proxy accept error: {}", e);
                continue;
            }
        };

        let pool = pool.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(pool, stream).await {
                debug!(%peer, "HTTP proxy connection error: {}", e);
            }
        });
    }
}

async fn handle_connection(pool: Arc<SessionPool>, mut stream: TcpStream) -> Result<(), ProxyError> {
    stream.set_nodelay(true).ok();

    let destination = {
        let mut reader = BufReader::new(&mut stream);

        let mut request_line = String::new();
        reader.read_line(&mut request_line).await?;

        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or("");
        let target = parts.next().unwrap_or("");
        if !method.eq_ignore_ascii_case("CONNECT") || target.is_empty() {
            drop(reader);
            stream
                .write_all(b"HTTP/1.1 405 Method Not Allowed\r\n\r\n")
                .await?;
            return Err(ProxyError::Malformed(format!("not a CONNECT: {method}")));
        }
        let destination = target.to_string();

        // Drain the remaining request headers
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).await?;
            if line == "\r\n" || line == "\n" || line.is_empty() {
                break;
            }
        }

        destination
    };

    debug!(%destination, "HTTP CONNECT via tunnel");

    match pool
        .open_stream(StreamKind::Forward, &Target::tcp(&destination))
        .await
    {
        Ok((mux_stream, guard)) => {
            stream
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await?;
            let _guard = guard;
            let (read, write) = mux_stream.split();
            splice_tcp(stream, read, write).await;
            Ok(())
        }
        Err(_) => {
            stream.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await?;
            Err(ProxyError::NoSession)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_non_connect_rejected() {
        let pool = Arc::new(SessionPool::new(16));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(pool, listener));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET http://example.com/ HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        let mut response = [0u8; 32];
        let n = client.read(&mut response).await.unwrap();
        assert!(std::str::from_utf8(&response[..n]).unwrap().starts_with("HTTP/1.1 405"));
    }

    #[tokio::test]
    async fn test_connect_without_session_is_bad_gateway() {
        let pool = Arc::new(SessionPool::new(16));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(pool, listener));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .await
            .unwrap();

        let mut response = [0u8; 32];
        let n = client.read(&mut response).await.unwrap();
        assert!(std::str::from_utf8(&response[..n]).unwrap().starts_with("HTTP/1.1 502"));
    }
}
