//! End-to-end SOCKS4/4a/5 scenarios over a folder transport: a local
//! `SocksFrontEnd` talking to a remote `Server` running the `Socks4Backend`/
//! `Socks5Backend` capabilities.

use std::sync::Arc;
use std::time::Duration;

use driftlink::transport::FolderTransport;
use driftlink::{BlobTransport, Client, ProxyMode, Server, Socks4Backend, Socks5Backend, SocksFrontEnd};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn spawn_server(dir: &std::path::Path) -> (Arc<Server>, Arc<dyn BlobTransport>) {
    let transport: Arc<dyn BlobTransport> = Arc::new(FolderTransport::new(dir));
    let mut server = Server::new("origin-server", transport.clone());
    server.register_capability(Arc::new(Socks4Backend::new("socks")));
    server.register_capability(Arc::new(Socks5Backend::new("socks5")));
    let server = Arc::new(server);
    tokio::spawn(server.clone().serve_forever());
    (server, transport)
}

async fn free_port() -> u16 {
    TcpListener::bind(("127.0.0.1", 0)).await.unwrap().local_addr().unwrap().port()
}

async fn read_exact_timeout(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf)).await.unwrap().unwrap();
    buf
}

#[tokio::test]
async fn socks4_connect_succeeds_and_bridges_payload() {
    let dir = tempfile::tempdir().unwrap();
    let (server, transport) = spawn_server(dir.path()).await;

    // An upper-casing TCP "origin" server.
    let origin_listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let origin_port = origin_listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut conn, _) = origin_listener.accept().await.unwrap();
        let mut buf = vec![0u8; 1024];
        let n = conn.read(&mut buf).await.unwrap();
        let upper: Vec<u8> = buf[..n].iter().map(|b| b.to_ascii_uppercase()).collect();
        conn.write_all(&upper).await.unwrap();
    });

    let client = Arc::new(Client::new("socks-client", transport));
    let front_port = free_port().await;
    let front = Arc::new(SocksFrontEnd::new(client, "origin-server", ProxyMode::Socks4));
    tokio::spawn(front.serve(("127.0.0.1", front_port)));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut conn = TcpStream::connect(("127.0.0.1", front_port)).await.unwrap();
    let mut request = vec![4u8, 1];
    request.extend_from_slice(&origin_port.to_be_bytes());
    request.extend_from_slice(&[127, 0, 0, 1]);
    request.extend_from_slice(b"Identification\0");
    conn.write_all(&request).await.unwrap();

    let reply = read_exact_timeout(&mut conn, 8).await;
    assert_eq!(reply, vec![0x00, 0x5a, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);

    conn.write_all(b"hello world!").await.unwrap();
    let echoed = read_exact_timeout(&mut conn, b"HELLO WORLD!".len()).await;
    assert_eq!(echoed, b"HELLO WORLD!");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn socks4_connect_refused_replies_with_failure_code() {
    let dir = tempfile::tempdir().unwrap();
    let (server, transport) = spawn_server(dir.path()).await;

    // A port nobody listens on: bind then drop the listener to free it.
    let dead_port = free_port().await;

    let client = Arc::new(Client::new("socks-client", transport));
    let front_port = free_port().await;
    let front = Arc::new(SocksFrontEnd::new(client, "origin-server", ProxyMode::Socks4));
    tokio::spawn(front.serve(("127.0.0.1", front_port)));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut conn = TcpStream::connect(("127.0.0.1", front_port)).await.unwrap();
    let mut request = vec![4u8, 1];
    request.extend_from_slice(&dead_port.to_be_bytes());
    request.extend_from_slice(&[127, 0, 0, 1]);
    request.extend_from_slice(b"id\0");
    conn.write_all(&request).await.unwrap();

    let reply = read_exact_timeout(&mut conn, 8).await;
    assert_eq!(reply, vec![0x00, 0x5c, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);

    let mut trailing = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_millis(500), conn.read(&mut trailing)).await.unwrap().unwrap();
    assert_eq!(n, 0, "connection should close after a refused SOCKS4 dial");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn socks5_connect_to_hostname_bridges_payload() {
    let dir = tempfile::tempdir().unwrap();
    let (server, transport) = spawn_server(dir.path()).await;

    let origin_listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let origin_port = origin_listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut conn, _) = origin_listener.accept().await.unwrap();
        let mut buf = vec![0u8; 1024];
        let n = conn.read(&mut buf).await.unwrap();
        conn.write_all(&buf[..n]).await.unwrap();
    });

    let client = Arc::new(Client::new("socks-client", transport));
    let front_port = free_port().await;
    let front = Arc::new(SocksFrontEnd::new(client, "origin-server", ProxyMode::Socks5));
    tokio::spawn(front.serve(("127.0.0.1", front_port)));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut conn = TcpStream::connect(("127.0.0.1", front_port)).await.unwrap();
    conn.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let methods_reply = read_exact_timeout(&mut conn, 2).await;
    assert_eq!(methods_reply, vec![0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x03, 9u8];
    request.extend_from_slice(b"localhost");
    request.extend_from_slice(&origin_port.to_be_bytes());
    conn.write_all(&request).await.unwrap();

    let reply = read_exact_timeout(&mut conn, request.len()).await;
    assert_eq!(reply[0], 0x05);
    assert_eq!(reply[1], 0x00);
    assert_eq!(&reply[2..], &request[2..]);

    conn.write_all(b"ping").await.unwrap();
    let echoed = read_exact_timeout(&mut conn, 4).await;
    assert_eq!(echoed, b"ping");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn socks5_no_acceptable_methods_closes_session() {
    let dir = tempfile::tempdir().unwrap();
    let (server, transport) = spawn_server(dir.path()).await;

    let client = Arc::new(Client::new("socks-client", transport));
    let front_port = free_port().await;
    let front = Arc::new(SocksFrontEnd::new(client, "origin-server", ProxyMode::Socks5));
    tokio::spawn(front.serve(("127.0.0.1", front_port)));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut conn = TcpStream::connect(("127.0.0.1", front_port)).await.unwrap();
    // GSSAPI only (0x01): no acceptable method.
    conn.write_all(&[0x05, 0x01, 0x01]).await.unwrap();

    let reply = read_exact_timeout(&mut conn, 2).await;
    assert_eq!(reply, vec![0x05, 0xff]);

    let mut trailing = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_millis(500), conn.read(&mut trailing)).await.unwrap().unwrap();
    assert_eq!(n, 0, "connection should close after no acceptable auth methods");

    server.stop().await.unwrap();
}
