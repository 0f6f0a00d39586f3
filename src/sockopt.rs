//! Per-socket TCP option application

use crate::config::AdvancedConfig;
use socket2::{SockRef, TcpKeepalive};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::trace;

/// Apply the configured TCP options to a connected socket. Best-effort: a
/// refused option is logged and skipped, never fatal.
pub fn apply(stream: &TcpStream, advanced: &AdvancedConfig) {
    if let Err(e) = stream.set_nodelay(advanced.tcp_nodelay) {
        trace!("set_nodelay failed: {}", e);
    }

    let sock = SockRef::from(stream);

    if advanced.tcp_keepalive > 0 {
        let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(advanced.tcp_keepalive));
        if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
            trace!("set_tcp_keepalive failed: {}", e);
        }
    }
    if advanced.tcp_read_buffer > 0 {
        if let Err(e) = sock.set_recv_buffer_size(advanced.tcp_read_buffer) {
            trace!("set_recv_buffer_size failed: {}", e);
        }
    }
    if advanced.tcp_write_buffer > 0 {
        if let Err(e) = sock.set_send_buffer_size(advanced.tcp_write_buffer) {
            trace!("set_send_buffer_size failed: {}", e);
        }
    }
}
