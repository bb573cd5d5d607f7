//! End-to-end proxy scenarios over real loopback sockets.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

mod common;

const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

async fn open_tunnel(proxy: std::net::SocketAddr, target: std::net::SocketAddr) -> TcpStream {
    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let mut reply = vec![0u8; ESTABLISHED.len()];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, ESTABLISHED);
    client
}

#[tokio::test]
async fn get_is_forwarded_and_response_relayed_verbatim() {
    let (origin, mut seen) = common::start_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello").await;
    let proxy = common::start_proxy().await;

    let response = common::raw_exchange(
        proxy.addr,
        format!("GET http://{origin}/hello HTTP/1.1\r\nHost: {origin}\r\nConnection: close\r\n\r\n").as_bytes(),
    )
    .await;
    assert_eq!(response, b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello");

    let request = seen.recv().await.unwrap();
    assert_eq!(request.request_line(), "GET /hello HTTP/1.1");
    assert!(!request.has_header("connection"));
    assert_eq!(request.header_values("host"), vec![origin.to_string()]);

    proxy.stop().await;
}

#[tokio::test]
async fn connect_tunnel_relays_bytes_both_ways() {
    let (peer, mut received) = common::start_tunnel_peer(&[0x01, 0x02, 0x03]).await;
    let proxy = common::start_proxy().await;

    let mut client = open_tunnel(proxy.addr, peer).await;
    client.write_all(&[0xAA, 0xBB]).await.unwrap();

    let mut greeting = [0u8; 3];
    client.read_exact(&mut greeting).await.unwrap();
    assert_eq!(greeting, [0x01, 0x02, 0x03]);

    client.shutdown().await.unwrap();
    assert_eq!(received.recv().await.unwrap(), vec![0xAA, 0xBB]);

    // Peer closed after reading EOF, so the client sees EOF with no framing.
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    proxy.stop().await;
}

#[tokio::test]
async fn connect_to_refusing_port_gets_502() {
    let refused = common::closed_port().await;
    let proxy = common::start_proxy().await;

    let response = common::raw_exchange(proxy.addr, format!("CONNECT {refused} HTTP/1.1\r\n\r\n").as_bytes()).await;
    assert_eq!(response, b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n");

    proxy.stop().await;
}

#[tokio::test]
async fn post_body_reaches_origin_in_origin_form() {
    let (origin, mut seen) = common::start_origin(b"HTTP/1.1 204 No Content\r\n\r\n").await;
    let proxy = common::start_proxy().await;

    let response = common::raw_exchange(
        proxy.addr,
        format!(
            "POST http://{origin}/echo HTTP/1.1\r\nHost: {origin}\r\nContent-Length: 4\r\nProxy-Connection: keep-alive\r\n\r\nPING"
        )
        .as_bytes(),
    )
    .await;
    assert!(response.starts_with(b"HTTP/1.1 204 No Content\r\n"));

    let request = seen.recv().await.unwrap();
    assert_eq!(request.request_line(), "POST /echo HTTP/1.1");
    assert!(!request.has_header("proxy-connection"));
    assert_eq!(request.header_values("content-length"), vec!["4"]);
    assert_eq!(request.body, b"PING");

    proxy.stop().await;
}

#[tokio::test]
async fn http_0_9_gets_505() {
    let proxy = common::start_proxy().await;

    let response = common::raw_exchange(proxy.addr, b"GET / HTTP/0.9\r\n\r\n").await;
    assert!(response.starts_with(b"HTTP/1.1 505 HTTP Version Not Supported\r\n"));

    proxy.stop().await;
}

#[tokio::test]
async fn shutdown_closes_idle_tunnel_within_grace() {
    let peer = common::start_echo_peer().await;
    let proxy = common::start_proxy().await;

    let mut client = open_tunnel(proxy.addr, peer).await;
    client.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");

    proxy.shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(2), proxy.handle)
        .await
        .expect("drain finishes within the grace period")
        .unwrap()
        .unwrap();

    // Aborted handler dropped both sockets.
    let mut buf = [0u8; 16];
    let closed = tokio::time::timeout(Duration::from_secs(1), client.read(&mut buf))
        .await
        .expect("tunnel closed");
    assert!(matches!(closed, Ok(0) | Err(_)));
}

#[cfg(unix)]
#[tokio::test]
async fn sigterm_exits_zero_with_open_tunnel() {
    use std::process::Stdio;
    use tokio::process::Command;

    let peer = common::start_echo_peer().await;
    let listen = common::closed_port().await;

    let mut child = Command::new(env!("CARGO_BIN_EXE_forward-proxy"))
        .args(["--listen", &listen.to_string(), "--shutdown-grace", "1"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .unwrap();

    let mut ready = false;
    for _ in 0..100 {
        if TcpStream::connect(listen).await.is_ok() {
            ready = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(ready, "proxy binary did not start listening");

    let mut client = open_tunnel(listen, peer).await;

    let pid = child.id().unwrap().to_string();
    let killed = Command::new("kill").args(["-TERM", &pid]).status().await.unwrap();
    assert!(killed.success());

    let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
        .await
        .expect("process exits after the grace period")
        .unwrap();
    assert_eq!(status.code(), Some(0));

    let mut buf = [0u8; 16];
    let closed = tokio::time::timeout(Duration::from_secs(1), client.read(&mut buf))
        .await
        .expect("tunnel closed");
    assert!(matches!(closed, Ok(0) | Err(_)));
}
