use crate::SessionError;
use crate::{fragment, relay};
use fragproxy_config::Config;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, lookup_host};
use tracing::{debug, info, warn};

/// Cap on the one-and-only read performed for the request line.
const REQUEST_READ_SIZE: usize = 1500;
/// Request lines at or beyond this length abort the session.
const MAX_LINE_LEN: usize = 1024;
/// Token truncation limits, method and target respectively.
const MAX_METHOD_LEN: usize = 15;
const MAX_TARGET_LEN: usize = 255;

/// The literal port token that triggers handshake fragmentation. Numeric
/// equivalents like " 443" or "0443" do not match.
const TLS_PORT: &str = "443";

const CONNECT_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

/// Parsed CONNECT target.
#[derive(Debug, PartialEq)]
pub struct ConnectRequest {
    pub host: String,
    pub port: String,
}

#[derive(Clone)]
pub struct SessionHandler {
    config: Arc<Config>,
    metrics: Option<Arc<SessionMetrics>>,
}

struct SessionMetrics {
    connections_total: IntCounterVec,
    connections_active: IntGauge,
    fragmented_total: IntCounter,
    bytes_transferred: IntCounterVec,
}

impl SessionMetrics {
    fn new(registry: &Registry) -> Self {
        let connections_total = IntCounterVec::new(
            Opts::new(
                "fragproxy_connections_total",
                "Total number of sessions handled",
            ),
            &["status"],
        )
        .unwrap();
        registry
            .register(Box::new(connections_total.clone()))
            .unwrap();

        let connections_active = IntGauge::new(
            "fragproxy_connections_active",
            "Number of currently active sessions",
        )
        .unwrap();
        registry
            .register(Box::new(connections_active.clone()))
            .unwrap();

        let fragmented_total = IntCounter::new(
            "fragproxy_fragmented_total",
            "Sessions whose ClientHello was re-emitted as fragments",
        )
        .unwrap();
        registry
            .register(Box::new(fragmented_total.clone()))
            .unwrap();

        let bytes_transferred = IntCounterVec::new(
            Opts::new(
                "fragproxy_bytes_transferred_total",
                "Total relayed bytes per direction",
            ),
            &["direction"],
        )
        .unwrap();
        registry
            .register(Box::new(bytes_transferred.clone()))
            .unwrap();

        Self {
            connections_total,
            connections_active,
            fragmented_total,
            bytes_transferred,
        }
    }
}

impl SessionHandler {
    pub fn new(config: Arc<Config>, registry: Option<&Registry>) -> Self {
        let metrics = registry.map(|r| Arc::new(SessionMetrics::new(r)));
        Self { config, metrics }
    }

    /// Drives one client connection end to end.
    ///
    /// Every failure is session-local: the sockets this session owns are
    /// closed on drop and the client sees nothing but a dropped connection.
    pub async fn handle_connection(&self, mut client: TcpStream, client_addr: SocketAddr) {
        let peer = client_addr.to_string();

        if let Some(ref metrics) = self.metrics {
            metrics.connections_active.inc();
        }

        debug!(peer, "New connection");

        let result = self.process_session(&mut client).await;

        if let Some(ref metrics) = self.metrics {
            metrics.connections_active.dec();
            let status = if result.is_ok() { "success" } else { "failure" };
            metrics
                .connections_total
                .with_label_values(&[status])
                .inc();
        }

        match result {
            Ok(_) => info!(peer, "Session completed"),
            Err(e) if e.is_client_error() => {
                debug!(peer, error = %e, "Session rejected");
            }
            Err(e) => {
                warn!(peer, error = %e, "Session error");
            }
        }
    }

    async fn process_session(&self, client: &mut TcpStream) -> Result<(), SessionError> {
        // One read, no accumulation. Anything in this buffer beyond the
        // request line is discarded, never forwarded.
        let mut buf = [0u8; REQUEST_READ_SIZE];
        let n = client.read(&mut buf).await?;
        if n == 0 {
            return Err(SessionError::MissingRequestLine);
        }

        let request = parse_connect(&buf[..n])?;
        debug!(
            host = request.host,
            port = request.port,
            "Parsed CONNECT target"
        );

        let mut upstream = connect_upstream(&request.host, &request.port).await?;

        client.write_all(CONNECT_RESPONSE).await?;

        if request.port == TLS_PORT {
            let blocklist = self.config.blocklist.as_deref();
            let fragmented =
                fragment::fragment_client_hello(&mut *client, &mut upstream, blocklist).await?;
            if fragmented && let Some(ref metrics) = self.metrics {
                metrics.fragmented_total.inc();
            }
        }

        let counters = self.metrics.as_ref().map(|m| {
            (
                m.bytes_transferred.with_label_values(&["tx"]),
                m.bytes_transferred.with_label_values(&["rx"]),
            )
        });

        debug!(host = request.host, "Starting bidirectional tunnel");
        relay::run(client, upstream, self.config.buffer_size, counters).await;

        Ok(())
    }
}

/// Parses the CONNECT request line out of the first read.
///
/// The line before the first `\n` must stay under 1024 bytes and split on
/// whitespace into at least two tokens; the method (truncated to 15 chars)
/// must be the literal `CONNECT`, and the target (truncated to 255 chars)
/// splits at its FIRST colon into host and port. Bracketed IPv6 literals
/// are not supported, the first colon always wins.
pub fn parse_connect(buf: &[u8]) -> Result<ConnectRequest, SessionError> {
    let line_end = buf
        .iter()
        .position(|&b| b == b'\n')
        .ok_or(SessionError::MissingRequestLine)?;
    if line_end >= MAX_LINE_LEN {
        return Err(SessionError::RequestLineTooLong);
    }

    let line =
        std::str::from_utf8(&buf[..line_end]).map_err(|_| SessionError::MalformedRequest)?;

    let mut tokens = line.split_whitespace();
    let method = tokens.next().ok_or(SessionError::MalformedRequest)?;
    let target = tokens.next().ok_or(SessionError::MalformedRequest)?;
    // Tokens beyond the second (e.g. the HTTP version) are ignored

    if truncate_chars(method, MAX_METHOD_LEN) != "CONNECT" {
        return Err(SessionError::UnsupportedMethod);
    }

    let target = truncate_chars(target, MAX_TARGET_LEN);
    let (host, port) = target
        .split_once(':')
        .ok_or(SessionError::MalformedTarget)?;

    Ok(ConnectRequest {
        host: host.to_string(),
        port: port.to_string(),
    })
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Resolves the target and returns the first candidate that connects.
///
/// Candidates are attempted one at a time in resolution order, both address
/// families included; a failed attempt is closed and the next one tried.
pub async fn connect_upstream(host: &str, port: &str) -> Result<TcpStream, SessionError> {
    let port_num: u16 = port
        .parse()
        .map_err(|_| SessionError::Connect(format!("{}:{}", host, port)))?;

    let candidates = lookup_host((host, port_num))
        .await
        .map_err(|_| SessionError::Connect(format!("{}:{}", host, port)))?;

    for addr in candidates {
        debug!(%addr, "Attempting upstream connection");
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => debug!(%addr, error = %e, "Upstream candidate failed"),
        }
    }

    Err(SessionError::Connect(format!("{}:{}", host, port)))
}
