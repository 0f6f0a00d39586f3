//! SOCKS5 proxy front-end
//!
//! Implements the CONNECT command with no authentication. BIND and UDP
//! ASSOCIATE are refused with the standard "command not supported" reply.

use super::ProxyError;
use crate::pool::SessionPool;
use crate::relay::{splice_tcp, StreamKind, Target};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;

const REPLY_SUCCESS: u8 = 0x00;
const REPLY_HOST_UNREACHABLE: u8 = 0x04;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// Accept SOCKS5 clients and relay their CONNECT targets through the pool.
pub async fn serve(pool: Arc<SessionPool>, listener: TcpListener) {
    if let Ok(addr) = listener.local_addr() {
        info!(bind = %addr, "SOCKS5 proxy listening");
    }

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                debug!("SOCKS5 accept error: {}", e);
                continue;
            }
        };

        let pool = pool.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(pool, stream).await {
                debug!(%peer, "SOCKS5 connection error: {}", e);
            }
        });
    }
}

async fn handle_connection(pool: Arc<SessionPool>, mut stream: TcpStream) -> Result<(), ProxyError> {
    stream.set_nodelay(true).ok();

    // Greeting: version + offered auth methods
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await?;
    if greeting[0] != SOCKS_VERSION {
        return Err(ProxyError::Version(greeting[0]));
    }
    let mut methods = vec![0u8; greeting[1] as usize];
    stream.read_exact(&mut methods).await?;
    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    // Request: version, command, reserved, address type
    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != SOCKS_VERSION {
        return Err(ProxyError::Version(request[0]));
    }
    if request[1] != CMD_CONNECT {
        reply(&mut stream, REPLY_COMMAND_NOT_SUPPORTED).await?;
        return Err(ProxyError::Command(request[1]));
    }

    let destination = match read_address(&mut stream, request[3]).await {
        Ok(destination) => destination,
        Err(e) => {
            reply(&mut stream, REPLY_ADDRESS_NOT_SUPPORTED).await?;
            return Err(e);
        }
    };

    debug!(%destination, "SOCKS5 CONNECT via tunnel");

    match pool
        .open_stream(StreamKind::Forward, &Target::tcp(&destination))
        .await
    {
        Ok((mux_stream, guard)) => {
            reply(&mut stream, REPLY_SUCCESS).await?;
            let _guard = guard;
            let (read, write) = mux_stream.split();
            splice_tcp(stream, read, write).await;
            Ok(())
        }
        Err(_) => {
            reply(&mut stream, REPLY_HOST_UNREACHABLE).await?;
            Err(ProxyError::NoSession)
        }
    }
}

/// Parse the destination per RFC 1928 address types.
async fn read_address(stream: &mut TcpStream, addr_type: u8) -> Result<String, ProxyError> {
    match addr_type {
        0x01 => {
            let mut raw = [0u8; 6];
            stream.read_exact(&mut raw).await?;
            let port = u16::from_be_bytes([raw[4], raw[5]]);
            Ok(format!("{}.{}.{}.{}:{}", raw[0], raw[1], raw[2], raw[3], port))
        }
        0x03 => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            let domain = String::from_utf8(name)
                .map_err(|_| ProxyError::Malformed("non-utf8 domain".to_string()))?;
            let port = stream.read_u16().await?;
            Ok(format!("{domain}:{port}"))
        }
        0x04 => {
            let mut raw = [0u8; 18];
            stream.read_exact(&mut raw).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&raw[..16]);
            let ip = std::net::Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([raw[16], raw[17]]);
            Ok(format!("[{ip}]:{port}"))
        }
        other => Err(ProxyError::AddressType(other)),
    }
}

async fn reply(stream: &mut TcpStream, code: u8) -> Result<(), ProxyError> {
    // Bound address is zeroed; clients ignore it for CONNECT
    stream
        .write_all(&[SOCKS_VERSION, code, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_wrong_version() {
        let pool = Arc::new(SessionPool::new(16));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(pool, listener));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();

        // Server drops the connection without a method reply
        let mut buf = [0u8; 2];
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_connect_without_session_is_unreachable() {
        let pool = Arc::new(SessionPool::new(16));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(pool, listener));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();

        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        // CONNECT 127.0.0.1:9 over an empty pool
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0, 9])
            .await
            .unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REPLY_HOST_UNREACHABLE);
    }

    #[tokio::test]
    async fn test_bind_command_refused() {
        let pool = Arc::new(SessionPool::new(16));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(pool, listener));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();

        // BIND (0x02) is not supported
        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REPLY_COMMAND_NOT_SUPPORTED);
    }
}
