use fragproxy_config::{Config, Metrics};
use fragproxy_core::session::SessionHandler;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const OK_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

fn test_config() -> Config {
    Config {
        listen_addrs: vec![],
        buffer_size: 4096,
        metrics: Metrics {
            enabled: false,
            address: "127.0.0.1:0".to_string(),
        },
        blocklist: None,
    }
}

/// Accept loop over an ephemeral listener, one spawned session per client.
async fn start_proxy(config: Config) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = SessionHandler::new(Arc::new(config), None);

    tokio::spawn(async move {
        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => continue,
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                handler.handle_connection(socket, peer).await;
            });
        }
    });

    addr
}

async fn read_ok_response(client: &mut TcpStream) {
    let mut buf = [0u8; OK_RESPONSE.len()];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, OK_RESPONSE);
}

#[tokio::test]
async fn test_connect_tunnel_relays_both_ways() {
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream_listener.local_addr().unwrap();

    // Echo upstream
    tokio::spawn(async move {
        let (mut socket, _) = upstream_listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            socket.write_all(&buf[..n]).await.unwrap();
        }
    });

    let proxy_addr = start_proxy(test_config()).await;
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();

    let request = format!(
        "CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n",
        upstream_addr.port()
    );
    client.write_all(request.as_bytes()).await.unwrap();
    read_ok_response(&mut client).await;

    client.write_all(b"hello through tunnel").await.unwrap();
    let mut buf = [0u8; 20];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello through tunnel");
}

#[tokio::test]
async fn test_non_tls_port_relays_bytes_unchanged() {
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream_listener.local_addr().unwrap();

    // TLS-looking record: on a non-443 port it must arrive byte-identical,
    // no fragmentation
    let mut payload = vec![0x16, 0x03, 0x01, 0x00, 0x10];
    payload.extend_from_slice(&[0xAA; 16]);
    payload[9] = 0x00;
    let expected = payload.clone();

    let capture = tokio::spawn(async move {
        let (mut socket, _) = upstream_listener.accept().await.unwrap();
        let mut received = Vec::new();
        socket.read_to_end(&mut received).await.unwrap();
        received
    });

    let proxy_addr = start_proxy(test_config()).await;
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();

    let request = format!("CONNECT 127.0.0.1:{}\r\n", upstream_addr.port());
    client.write_all(request.as_bytes()).await.unwrap();
    read_ok_response(&mut client).await;

    client.write_all(&payload).await.unwrap();
    client.shutdown().await.unwrap();

    assert_eq!(capture.await.unwrap(), expected);
}

#[tokio::test]
async fn test_bytes_after_request_line_are_discarded() {
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream_listener.local_addr().unwrap();

    let capture = tokio::spawn(async move {
        let (mut socket, _) = upstream_listener.accept().await.unwrap();
        let mut received = Vec::new();
        socket.read_to_end(&mut received).await.unwrap();
        received
    });

    let proxy_addr = start_proxy(test_config()).await;
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();

    // Trailing bytes in the same segment as the request line never reach
    // the upstream
    let request = format!(
        "CONNECT 127.0.0.1:{}\r\nleftover-header-bytes",
        upstream_addr.port()
    );
    client.write_all(request.as_bytes()).await.unwrap();
    read_ok_response(&mut client).await;

    client.write_all(b"relayed").await.unwrap();
    client.shutdown().await.unwrap();

    assert_eq!(capture.await.unwrap(), b"relayed");
}

#[tokio::test]
async fn test_malformed_requests_close_with_zero_bytes() {
    let cases: &[&[u8]] = &[
        b"CONNECT example.com:443",              // no newline in first read
        b"GET example.com:443 HTTP/1.1\r\n",     // wrong method
        b"connect example.com:443 HTTP/1.1\r\n", // case-sensitive method
        b"CONNECT example.com HTTP/1.1\r\n",     // no colon in target
        b"CONNECT\r\n",                          // single token
    ];

    for case in cases {
        let proxy_addr = start_proxy(test_config()).await;
        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(case).await.unwrap();

        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "expected silent close for {:?}", case);
    }
}

#[tokio::test]
async fn test_overlong_request_line_closes_with_zero_bytes() {
    let proxy_addr = start_proxy(test_config()).await;
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();

    let mut request = vec![b'A'; 1200];
    request.push(b'\n');
    client.write_all(&request).await.unwrap();

    let mut buf = [0u8; 64];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_unreachable_target_closes_with_zero_bytes() {
    // Bind then drop so nothing listens on the port
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = listener.local_addr().unwrap().port();
    drop(listener);

    let proxy_addr = start_proxy(test_config()).await;
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();

    let request = format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n", dead_port);
    client.write_all(request.as_bytes()).await.unwrap();

    let mut buf = [0u8; 64];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_half_close_propagates_through_tunnel() {
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream_listener.local_addr().unwrap();

    let upstream_task = tokio::spawn(async move {
        let (mut socket, _) = upstream_listener.accept().await.unwrap();

        // Drain the client direction to EOF first
        let mut received = Vec::new();
        socket.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"ping");

        // Our direction is still open after the client's half-close
        socket.write_all(b"pong").await.unwrap();
    });

    let proxy_addr = start_proxy(test_config()).await;
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();

    let request = format!("CONNECT 127.0.0.1:{}\r\n", upstream_addr.port());
    client.write_all(request.as_bytes()).await.unwrap();
    read_ok_response(&mut client).await;

    client.write_all(b"ping").await.unwrap();
    client.shutdown().await.unwrap();

    let mut received = Vec::new();
    client.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, b"pong");

    upstream_task.await.unwrap();
}

/// On-wire fragmentation needs an upstream on the literal port 443, which
/// is a privileged bind; skip quietly where that is not possible.
#[tokio::test]
async fn test_port_443_fragments_on_the_wire() {
    let upstream_listener = match TcpListener::bind("127.0.0.1:443").await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("skipping: cannot bind 127.0.0.1:443 ({})", e);
            return;
        }
    };

    let mut body = vec![0x77u8; 42];
    body[9] = 0x00;
    let mut hello = vec![0x16, 0x03, 0x01, 0x00, 0x2A];
    hello.extend_from_slice(&body);
    let expected_body = body.clone();

    let capture = tokio::spawn(async move {
        let (mut socket, _) = upstream_listener.accept().await.unwrap();
        let mut received = Vec::new();
        socket.read_to_end(&mut received).await.unwrap();
        received
    });

    let proxy_addr = start_proxy(test_config()).await;
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();

    client
        .write_all(b"CONNECT 127.0.0.1:443 HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    read_ok_response(&mut client).await;

    client.write_all(&hello).await.unwrap();
    client.shutdown().await.unwrap();

    let emitted = capture.await.unwrap();

    // The upstream must see well-formed records whose payloads concatenate
    // back to the original handshake body, the first one cut at the zero
    let mut payloads = Vec::new();
    let mut first_len = None;
    let mut pos = 0;
    while pos < emitted.len() {
        assert_eq!(&emitted[pos..pos + 3], &[0x16, 0x03, 0x04]);
        let len = u16::from_be_bytes([emitted[pos + 3], emitted[pos + 4]]) as usize;
        assert!(len > 0);
        payloads.extend_from_slice(&emitted[pos + 5..pos + 5 + len]);
        first_len.get_or_insert(len);
        pos += 5 + len;
    }
    assert_eq!(pos, emitted.len());
    assert_eq!(first_len, Some(10));
    assert_eq!(payloads, expected_body);
}
