//! HTTP upgrade mimicry
//!
//! The tunnel handshake impersonates a browser's WebSocket upgrade. The
//! origin sends a decorated GET request; the edge validates host, path and
//! upgrade tokens and answers 101 Switching Protocols, or a decoy 404 that
//! never reveals which check failed. The handshake is cosmetic: nothing in it
//! is authenticated, it exists purely to blunt passive DPI pattern matching.
//!
//! Any bytes the response/request parser read past the header boundary are
//! the first packets of the crypto channel; losing them kills the session.
//! [`PrefixedStream`] re-serves them ahead of the raw socket.

use crate::config::MimicConfig;
use crate::crypto::{rand_alphanumeric, rand_below, rand_between, random_bytes};
use base64::Engine;
use bytes::{Buf, Bytes};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::debug;

/// Read deadline for the upgrade request on the edge
const SERVER_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Read deadline for the upgrade response on the origin
const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest request/response head we are willing to buffer
const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Handshake errors
#[derive(Debug, Error)]
pub enum MimicError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("handshake timed out")]
    Timeout,

    #[error("malformed HTTP head")]
    Malformed,

    #[error("HTTP head exceeds {MAX_HEAD_SIZE} bytes")]
    HeadTooLarge,

    #[error("unexpected status code: {0}")]
    Status(u16),

    #[error("request rejected")]
    Rejected,
}

/// Stream wrapper that serves buffered bytes before the inner stream.
pub struct PrefixedStream<S> {
    leftover: Bytes,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(leftover: Bytes, inner: S) -> Self {
        Self { leftover, inner }
    }

    /// Bytes still pending ahead of the socket
    pub fn buffered(&self) -> usize {
        self.leftover.len()
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.leftover.is_empty() {
            let n = this.leftover.len().min(buf.remaining());
            buf.put_slice(&this.leftover[..n]);
            this.leftover.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Accumulate bytes until the blank line ending an HTTP head. Returns the
/// buffer and the offset one past `\r\n\r\n`.
async fn read_head<S: AsyncRead + Unpin>(
    stream: &mut S,
    deadline: Duration,
) -> Result<(Vec<u8>, usize), MimicError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        if let Some(pos) = find_head_end(&buf) {
            return Ok((buf, pos));
        }
        if buf.len() >= MAX_HEAD_SIZE {
            return Err(MimicError::HeadTooLarge);
        }

        let n = tokio::time::timeout(deadline, stream.read(&mut chunk))
            .await
            .map_err(|_| MimicError::Timeout)??;
        if n == 0 {
            return Err(MimicError::Malformed);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

// ──────────────────── Origin (client) side ────────────────────

/// Perform the upgrade handshake from the origin side. On success the
/// returned stream replays any response bytes the parser over-read.
pub async fn client_handshake<S>(
    mut stream: S,
    cfg: &MimicConfig,
) -> Result<PrefixedStream<S>, MimicError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = build_upgrade_request(cfg);
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let (buf, head_end) = read_head(&mut stream, CLIENT_READ_TIMEOUT).await?;

    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut resp = httparse::Response::new(&mut headers);
    match resp.parse(&buf[..head_end]) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => return Err(MimicError::Malformed),
    }

    let code = resp.code.ok_or(MimicError::Malformed)?;
    if code != 101 && code != 200 {
        return Err(MimicError::Status(code));
    }

    let leftover = Bytes::copy_from_slice(&buf[head_end..]);
    Ok(PrefixedStream::new(leftover, stream))
}

/// Build the decorated GET request for one connection.
fn build_upgrade_request(cfg: &MimicConfig) -> String {
    let domain = &cfg.fake_domain;
    let ua = &cfg.user_agent;

    let path = if cfg.fake_path.contains("{rand}") {
        cfg.fake_path.replace("{rand}", &rand_alphanumeric(8))
    } else {
        format!("{}{}", cfg.fake_path, random_query_string())
    };

    let mut lines: Vec<String> = vec![
        format!("GET {path} HTTP/1.1"),
        format!("Host: {domain}"),
        format!("User-Agent: {ua}"),
        "Connection: Upgrade".to_string(),
        "Upgrade: websocket".to_string(),
        format!("Sec-WebSocket-Key: {}", websocket_key()),
        "Sec-WebSocket-Version: 13".to_string(),
    ];

    // Decorative headers vary by which browser the UA claims to be
    let mut extra: Vec<String> = if ua.contains("Firefox") {
        vec![
            "Accept: text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".into(),
            format!("Accept-Language: {}", random_accept_lang()),
            "Accept-Encoding: gzip, deflate, br".into(),
            "Sec-Fetch-Dest: empty".into(),
            "Sec-Fetch-Mode: websocket".into(),
            "Sec-Fetch-Site: cross-site".into(),
            format!("Origin: https://{domain}"),
            "Pragma: no-cache".into(),
            "Cache-Control: no-cache".into(),
        ]
    } else if ua.contains("Safari") && !ua.contains("Chrome") {
        vec![
            "Accept: text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".into(),
            format!("Accept-Language: {}", random_accept_lang()),
            "Accept-Encoding: gzip, deflate, br".into(),
            format!("Origin: https://{domain}"),
        ]
    } else {
        vec![
            "Accept: text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8".into(),
            format!("Accept-Language: {}", random_accept_lang()),
            "Accept-Encoding: gzip, deflate, br".into(),
            "Sec-Fetch-Dest: empty".into(),
            "Sec-Fetch-Mode: websocket".into(),
            "Sec-Fetch-Site: same-origin".into(),
            format!("Origin: https://{domain}"),
            format!("Sec-Ch-Ua-Platform: {}", random_platform()),
            "Cache-Control: no-cache".into(),
            "Pragma: no-cache".into(),
        ]
    };
    shuffle(&mut extra);
    lines.extend(extra);

    for header in &cfg.custom_headers {
        if let Some((name, value)) = header.split_once(':') {
            lines.push(format!("{}: {}", name.trim(), value.trim()));
        }
    }

    if cfg.session_cookie {
        let mut cookies = vec![format!("session={}", hex_token(16))];
        if rand_below(3) == 0 {
            cookies.push(format!(
                "_ga=GA1.2.{}.{}",
                rand_between(100_000_000, 999_999_999),
                rand_between(1_700_000_000, 1_800_000_000)
            ));
        }
        if rand_below(4) == 0 {
            cookies.push("consent=yes".to_string());
        }
        lines.push(format!("Cookie: {}", cookies.join("; ")));
    }

    let mut out = lines.join("\r\n");
    out.push_str("\r\n\r\n");
    out
}

fn websocket_key() -> String {
    let mut raw = [0u8; 16];
    random_bytes(&mut raw);
    base64::engine::general_purpose::STANDARD.encode(raw)
}

fn hex_token(n: usize) -> String {
    let mut raw = vec![0u8; n];
    random_bytes(&mut raw);
    raw.iter().map(|b| format!("{b:02x}")).collect()
}

fn random_accept_lang() -> &'static str {
    const LANGS: &[&str] = &[
        "en-US,en;q=0.9",
        "en-US,en;q=0.9,fa;q=0.8",
        "en-GB,en;q=0.9,en-US;q=0.8",
        "en-US,en;q=0.9,de;q=0.8",
        "en-US,en;q=0.9,fr;q=0.8",
        "en,en-US;q=0.9",
        "en-US,en;q=0.9,ar;q=0.8",
        "en-US,en;q=0.9,tr;q=0.8",
    ];
    LANGS[rand_below(LANGS.len() as u64) as usize]
}

fn random_platform() -> &'static str {
    const PLATFORMS: &[&str] = &["\"Windows\"", "\"macOS\"", "\"Linux\""];
    PLATFORMS[rand_below(PLATFORMS.len() as u64) as usize]
}

fn random_query_string() -> String {
    match rand_below(7) {
        0 => format!("?q={}", rand_alphanumeric(5 + rand_below(10) as usize)),
        1 => format!("?s={}&lang=en", rand_alphanumeric(4 + rand_below(8) as usize)),
        2 => format!("?p={}", rand_between(1, 500)),
        3 => format!("?id={}&v={}", rand_alphanumeric(8), rand_below(10)),
        4 => format!("?ref={}", rand_alphanumeric(6)),
        5 => format!("?t={}", rand_between(1_700_000_000, 1_800_000_000)),
        _ => format!("?utm_source={}&utm_medium=web", rand_alphanumeric(5)),
    }
}

fn shuffle<T>(items: &mut [T]) {
    for i in (1..items.len()).rev() {
        let j = rand_below((i + 1) as u64) as usize;
        items.swap(i, j);
    }
}

// ──────────────────── Edge (server) side ────────────────────

const UPGRADE_RESPONSE: &str = "HTTP/1.1 101 Switching Protocols\r\n\
    Upgrade: websocket\r\n\
    Connection: Upgrade\r\n\
    Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\
    \r\n";

const DECOY_BODY: &str = "<html>\r\n\
    <head><title>404 Not Found</title></head>\r\n\
    <body>\r\n\
    <center><h1>404 Not Found</h1></center>\r\n\
    <hr><center>nginx/1.24.0</center>\r\n\
    </body>\r\n\
    </html>\r\n";

/// Identical bytes regardless of which check failed.
fn decoy_404() -> String {
    format!(
        "HTTP/1.1 404 Not Found\r\n\
         Server: nginx/1.24.0\r\n\
         Content-Type: text/html\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n{}",
        DECOY_BODY.len(),
        DECOY_BODY
    )
}

/// Validate an upgrade request from the edge side. On success the 101
/// response has been written and the returned stream replays any request
/// bytes read past the head. On rejection the decoy page has been written
/// and the caller must drop the connection.
pub async fn server_handshake<S>(
    mut stream: S,
    cfg: &MimicConfig,
) -> Result<PrefixedStream<S>, MimicError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (buf, head_end) = read_head(&mut stream, SERVER_READ_TIMEOUT).await?;

    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(&buf[..head_end]) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => return Err(MimicError::Malformed),
    }

    let path = req.path.unwrap_or("/");
    let host = header_value(&req, "host").unwrap_or_default();
    let upgrade = header_value(&req, "upgrade").unwrap_or_default();
    let connection = header_value(&req, "connection").unwrap_or_default();

    let expected_prefix = cfg.fake_path.split('{').next().unwrap_or("/");

    let valid = host_allowed(&host, &cfg.fake_domain)
        && upgrade.to_ascii_lowercase().contains("websocket")
        && connection.to_ascii_lowercase().contains("upgrade")
        && path.starts_with(expected_prefix);

    if !valid {
        debug!(%host, %path, "rejecting non-tunnel request");
        let _ = stream.write_all(decoy_404().as_bytes()).await;
        let _ = stream.flush().await;
        return Err(MimicError::Rejected);
    }

    stream.write_all(UPGRADE_RESPONSE.as_bytes()).await?;
    stream.flush().await?;

    let leftover = Bytes::copy_from_slice(&buf[head_end..]);
    Ok(PrefixedStream::new(leftover, stream))
}

fn header_value(req: &httparse::Request<'_, '_>, name: &str) -> Option<String> {
    req.headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| String::from_utf8_lossy(h.value).into_owned())
}

/// The host must match the fake domain, a subdomain of it, or be an IP
/// literal (operators often probe their own edge by address).
fn host_allowed(host: &str, fake_domain: &str) -> bool {
    if host.is_empty() {
        return false;
    }
    let bare = host_without_port(host);
    if bare == fake_domain || bare.ends_with(&format!(".{fake_domain}")) {
        return true;
    }
    bare.parse::<std::net::IpAddr>().is_ok()
}

fn host_without_port(host: &str) -> &str {
    if let Some(stripped) = host.strip_prefix('[') {
        // Bracketed IPv6 literal
        return stripped.split(']').next().unwrap_or(stripped);
    }
    host.rsplit_once(':')
        .map(|(h, p)| if p.chars().all(|c| c.is_ascii_digit()) { h } else { host })
        .unwrap_or(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cfg() -> MimicConfig {
        MimicConfig {
            fake_domain: "www.example.com".to_string(),
            fake_path: "/search".to_string(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) Chrome/122.0".to_string(),
            custom_headers: vec![],
            session_cookie: true,
        }
    }

    #[test]
    fn test_request_has_required_headers() {
        let req = build_upgrade_request(&test_cfg());
        assert!(req.starts_with("GET /search?"));
        assert!(req.contains("Host: www.example.com\r\n"));
        assert!(req.contains("Connection: Upgrade\r\n"));
        assert!(req.contains("Upgrade: websocket\r\n"));
        assert!(req.contains("Sec-WebSocket-Key: "));
        assert!(req.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(req.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_archetype_headers_follow_user_agent() {
        let mut cfg = test_cfg();
        cfg.user_agent =
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0"
                .to_string();
        let req = build_upgrade_request(&cfg);
        assert!(req.contains("Sec-Fetch-Site: cross-site\r\n"));
        assert!(!req.contains("Sec-Ch-Ua-Platform"));

        cfg.user_agent = "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_2) AppleWebKit/605.1.15 \
                          Version/17.2 Safari/605.1.15"
            .to_string();
        let req = build_upgrade_request(&cfg);
        assert!(!req.contains("Sec-Fetch-Mode"));
        assert!(req.contains("Origin: https://www.example.com\r\n"));
    }

    #[test]
    fn test_custom_headers_applied() {
        let mut cfg = test_cfg();
        cfg.custom_headers = vec!["X-Requested-With: XMLHttpRequest".to_string()];
        let req = build_upgrade_request(&cfg);
        assert!(req.contains("X-Requested-With: XMLHttpRequest\r\n"));
    }

    #[test]
    fn test_rand_path_substitution() {
        let mut cfg = test_cfg();
        cfg.fake_path = "/assets/{rand}.js".to_string();
        let req = build_upgrade_request(&cfg);
        let line = req.lines().next().unwrap();
        assert!(!line.contains("{rand}"));
        assert!(line.starts_with("GET /assets/"));
        assert!(line.contains(".js"));
    }

    #[test]
    fn test_host_allowed() {
        assert!(host_allowed("www.example.com", "www.example.com"));
        assert!(host_allowed("cdn.www.example.com", "www.example.com"));
        assert!(host_allowed("www.example.com:8443", "www.example.com"));
        assert!(host_allowed("192.168.1.5", "www.example.com"));
        assert!(host_allowed("[::1]:2020", "www.example.com"));
        assert!(!host_allowed("attacker.local", "www.example.com"));
        assert!(!host_allowed("", "www.example.com"));
        assert!(!host_allowed("notexample.com", "www.example.com"));
    }

    #[tokio::test]
    async fn test_handshake_pair() {
        let cfg = test_cfg();
        let (client_io, server_io) = tokio::io::duplex(1 << 16);

        let server_cfg = cfg.clone();
        let server = tokio::spawn(async move {
            server_handshake(server_io, &server_cfg).await
        });

        let upgraded = client_handshake(client_io, &cfg).await.unwrap();
        assert_eq!(upgraded.buffered(), 0);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_post_handshake_bytes_preserved() {
        let cfg = test_cfg();
        let (mut scripted, client_io) = tokio::io::duplex(1 << 16);

        // Scripted edge: consume the request, answer 101 with channel bytes
        // already stuck to the response in one write.
        let server = tokio::spawn(async move {
            let mut sink = [0u8; 4096];
            let n = scripted.read(&mut sink).await.unwrap();
            assert!(n > 0);
            let mut reply = UPGRADE_RESPONSE.as_bytes().to_vec();
            reply.extend_from_slice(b"EARLY-FRAMES");
            scripted.write_all(&reply).await.unwrap();
        });

        let mut upgraded = client_handshake(client_io, &cfg).await.unwrap();
        assert_eq!(upgraded.buffered(), 12);

        let mut first = [0u8; 12];
        upgraded.read_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"EARLY-FRAMES");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_host_gets_decoy() {
        let cfg = test_cfg();
        let (mut probe, server_io) = tokio::io::duplex(1 << 16);

        let server = tokio::spawn(async move {
            server_handshake(server_io, &cfg).await
        });

        probe
            .write_all(b"GET / HTTP/1.1\r\nHost: attacker.local\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            match probe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    response.extend_from_slice(&chunk[..n]);
                    if response.windows(7).any(|w| w == b"</html>") {
                        break;
                    }
                }
            }
        }
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 404 Not Found"));
        assert!(text.contains("Server: nginx/1.24.0"));

        assert!(matches!(server.await.unwrap(), Err(MimicError::Rejected)));
    }

    #[tokio::test]
    async fn test_decoy_identical_for_all_failures() {
        // Wrong host and wrong path must produce byte-identical decoys
        let a = decoy_404();
        let b = decoy_404();
        assert_eq!(a, b);
        assert!(a.contains("Content-Length: "));
    }

    #[tokio::test]
    async fn test_missing_upgrade_rejected() {
        let cfg = test_cfg();
        let (mut probe, server_io) = tokio::io::duplex(1 << 16);

        let server = tokio::spawn(async move {
            server_handshake(server_io, &cfg).await
        });

        probe
            .write_all(b"GET /search HTTP/1.1\r\nHost: www.example.com\r\n\r\n")
            .await
            .unwrap();

        assert!(matches!(server.await.unwrap(), Err(MimicError::Rejected)));
    }
}
