pub mod fragment;
pub mod relay;
pub mod session;

use fragproxy_config::Config;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use prometheus::Registry;
use session::SessionHandler;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

/// Runs the accept loop until Ctrl-C.
///
/// Each accepted connection gets its own spawned task; a failed accept is
/// logged and the loop continues, so descriptor exhaustion or transient
/// socket errors never take the process down.
pub async fn run_proxy(
    config: Config,
    registry: Option<Registry>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(config);
    let handler = SessionHandler::new(config.clone(), registry.as_ref());

    let mut listeners: Vec<TcpListener> = Vec::new();
    for addr_str in &config.listen_addrs {
        let addr: SocketAddr = addr_str.parse()?;
        info!("Starting listener on {}", addr);
        listeners.push(TcpListener::bind(addr).await?);
    }

    info!("Proxy started, waiting for connections...");

    loop {
        let mut accepts = FuturesUnordered::new();
        for listener in &listeners {
            accepts.push(listener.accept());
        }

        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
            Some(result) = accepts.next() => {
                match result {
                    Ok((socket, addr)) => {
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            handler.handle_connection(socket, addr).await;
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
        }
    }

    info!("Shutting down proxy");
    Ok(())
}

/// Per-session failure. Every variant is session-local: the handler closes
/// whatever sockets it owns and moves on, nothing propagates to the accept
/// loop.
#[derive(Debug)]
pub enum SessionError {
    /// First read contained no request line terminator
    MissingRequestLine,
    /// Request line reached the 1024-byte cap
    RequestLineTooLong,
    /// Request line had fewer than two tokens or was not valid text
    MalformedRequest,
    /// Method token was not the literal `CONNECT`
    UnsupportedMethod,
    /// Target token had no `host:port` colon
    MalformedTarget,
    /// No resolved candidate accepted a connection
    Connect(String),
    Io(io::Error),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::MissingRequestLine => write!(f, "No request line in first read"),
            SessionError::RequestLineTooLong => write!(f, "Request line too long"),
            SessionError::MalformedRequest => write!(f, "Malformed request line"),
            SessionError::UnsupportedMethod => write!(f, "Method is not CONNECT"),
            SessionError::MalformedTarget => write!(f, "Target is not host:port"),
            SessionError::Connect(target) => write!(f, "Cannot connect upstream to {}", target),
            SessionError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<io::Error> for SessionError {
    fn from(err: io::Error) -> Self {
        SessionError::Io(err)
    }
}

impl SessionError {
    /// True for errors caused by the peer rather than by this process.
    /// Client misbehavior is logged at debug, real faults at warn.
    pub fn is_client_error(&self) -> bool {
        match self {
            SessionError::MissingRequestLine
            | SessionError::RequestLineTooLong
            | SessionError::MalformedRequest
            | SessionError::UnsupportedMethod
            | SessionError::MalformedTarget => true,
            SessionError::Connect(_) => false,
            SessionError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
        }
    }
}
