//! End-to-end tests that drive a bound server over loopback exactly the way
//! a vanilla client (and a voice chat companion) would.

use minemock::config_loader::{LoginConfig, StatusConfig};
use minemock::protocol;
use minemock::server::MockServer;
use std::collections::HashSet;
use std::io::Cursor;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;

fn status_cfg() -> StatusConfig {
    StatusConfig {
        version_name: "1.20.1".to_string(),
        protocol: 763,
        motd: "Down for maintenance".to_string(),
        max_players: 20,
        online_players: 7,
    }
}

fn login_cfg() -> LoginConfig {
    LoginConfig {
        error_message: "Try again later".to_string(),
        ..LoginConfig::default()
    }
}

fn handshake_frame(protocol_version: i32, host: &str, port: u16, next_state: i32) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend(protocol::encode_varint(0x00));
    body.extend(protocol::encode_varint(protocol_version));
    body.extend(protocol::encode_varint(host.len() as i32));
    body.extend(host.as_bytes());
    body.extend(port.to_be_bytes());
    body.extend(protocol::encode_varint(next_state));
    protocol::wrap_packet(&body)
}

fn login_start_frame(username: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend(protocol::encode_varint(0x00));
    body.extend(protocol::encode_varint(username.len() as i32));
    body.extend(username.as_bytes());
    protocol::wrap_packet(&body)
}

/// Reads a `[VarInt len][UTF-8 bytes]` string out of a packet payload.
fn string_field(payload: &[u8]) -> (String, usize) {
    let mut cursor = Cursor::new(payload);
    let len = protocol::read_varint(&mut cursor).expect("string length") as usize;
    let start = cursor.position() as usize;
    let text = String::from_utf8(payload[start..start + len].to_vec()).expect("utf-8 string");
    (text, start + len)
}

async fn read_frame(stream: &mut TcpStream) -> (i32, Vec<u8>) {
    let body = protocol::read_packet(stream).await.expect("packet");
    let (id, payload) = protocol::split_packet_id(&body).expect("packet id");
    (id, payload.to_vec())
}

async fn expect_eof(stream: &mut TcpStream) {
    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("timely close")
        .expect("clean close");
    assert_eq!(n, 0, "no bytes may follow the final frame");
}

#[tokio::test]
async fn status_ping_round_trip() {
    let server = MockServer::start("127.0.0.1:0", status_cfg(), login_cfg())
        .await
        .unwrap();
    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();

    stream
        .write_all(&handshake_frame(763, "localhost", 25565, 1))
        .await
        .unwrap();
    stream
        .write_all(&protocol::wrap_packet(&protocol::encode_varint(0x00)))
        .await
        .unwrap();

    let (id, payload) = read_frame(&mut stream).await;
    assert_eq!(id, 0x00);
    let (json_text, _) = string_field(&payload);
    let status: serde_json::Value = serde_json::from_str(&json_text).unwrap();
    assert_eq!(status["version"]["name"], "1.20.1");
    assert_eq!(status["version"]["protocol"], 763);
    assert_eq!(status["players"]["max"], 20);
    assert_eq!(status["players"]["online"], 7);
    assert_eq!(status["description"]["text"], "Down for maintenance");

    let ping_payload = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
    let mut ping_body = protocol::encode_varint(0x01);
    ping_body.extend(ping_payload);
    stream
        .write_all(&protocol::wrap_packet(&ping_body))
        .await
        .unwrap();

    let (id, payload) = read_frame(&mut stream).await;
    assert_eq!(id, 0x01);
    assert_eq!(payload, ping_payload);

    server.shutdown();
}

#[tokio::test]
async fn login_is_rejected_with_configured_reason() {
    let server = MockServer::start("127.0.0.1:0", status_cfg(), login_cfg())
        .await
        .unwrap();
    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();

    stream
        .write_all(&handshake_frame(763, "localhost", 25565, 2))
        .await
        .unwrap();
    stream.write_all(&login_start_frame("Steve")).await.unwrap();

    let (id, payload) = read_frame(&mut stream).await;
    assert_eq!(id, 0x00);
    let (reason, _) = string_field(&payload);
    assert_eq!(reason, r#"{"text":"Try again later"}"#);

    expect_eof(&mut stream).await;
    server.shutdown();
}

#[tokio::test]
async fn forced_title_sends_login_success_then_play_disconnect() {
    let mut cfg = login_cfg();
    cfg.force_connection_lost_title = true;
    let server = MockServer::start("127.0.0.1:0", status_cfg(), cfg)
        .await
        .unwrap();
    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();

    stream
        .write_all(&handshake_frame(763, "localhost", 25565, 2))
        .await
        .unwrap();
    stream.write_all(&login_start_frame("Steve")).await.unwrap();

    let (id, payload) = read_frame(&mut stream).await;
    assert_eq!(id, 0x02);
    let (username, consumed) = string_field(&payload[16..]);
    assert_eq!(username, "Steve");
    assert_eq!(payload[16 + consumed], 0x00); // no properties

    let (id, payload) = read_frame(&mut stream).await;
    assert_eq!(id, 0x1A);
    let (reason, _) = string_field(&payload);
    assert_eq!(reason, r#"{"text":"Try again later"}"#);

    expect_eof(&mut stream).await;
    server.shutdown();
}

#[tokio::test]
async fn whitelisted_login_is_tunnelled_verbatim() {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend.local_addr().unwrap();

    let mut cfg = login_cfg();
    cfg.real_server_addr = backend_addr.to_string();
    cfg.whitelist = HashSet::from(["alex".to_string()]);
    let server = MockServer::start("127.0.0.1:0", status_cfg(), cfg)
        .await
        .unwrap();

    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
    let handshake = handshake_frame(763, "localhost", 25565, 2);
    let login_start = login_start_frame("Alex");
    stream.write_all(&handshake).await.unwrap();
    stream.write_all(&login_start).await.unwrap();

    let (mut backend_conn, _) = timeout(Duration::from_secs(2), backend.accept())
        .await
        .expect("backend accept")
        .unwrap();

    // The two opening frames must arrive byte-identical.
    let mut opening = vec![0u8; handshake.len() + login_start.len()];
    backend_conn.read_exact(&mut opening).await.unwrap();
    let mut expected = handshake.clone();
    expected.extend(&login_start);
    assert_eq!(opening, expected);

    // After that the tunnel is a transparent byte pipe in both directions.
    stream.write_all(b"from-client").await.unwrap();
    let mut buf = [0u8; 11];
    backend_conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"from-client");

    backend_conn.write_all(b"from-server").await.unwrap();
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"from-server");

    // Closing the client propagates EOF to the backend.
    drop(stream);
    let mut end = [0u8; 1];
    let n = timeout(Duration::from_secs(2), backend_conn.read(&mut end))
        .await
        .expect("timely EOF")
        .unwrap();
    assert_eq!(n, 0);

    server.shutdown();
}

#[tokio::test]
async fn voicechat_relay_is_gated_by_login() {
    let tcp_backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let udp_backend = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let mut cfg = login_cfg();
    cfg.real_server_addr = tcp_backend.local_addr().unwrap().to_string();
    cfg.whitelist = HashSet::from(["alex".to_string()]);
    cfg.voicechat_listen_addr = "127.0.0.1:0".to_string();
    cfg.voicechat_backend_addr = udp_backend.local_addr().unwrap().to_string();

    let server = MockServer::start("127.0.0.1:0", status_cfg(), cfg)
        .await
        .unwrap();
    let relay_addr = server.voicechat_addr().expect("voice chat relay enabled");

    // Before any login the relay must drop datagrams silently.
    let voice_client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    voice_client.send_to(b"early", relay_addr).await.unwrap();
    let mut buf = [0u8; 32];
    assert!(
        timeout(Duration::from_millis(200), udp_backend.recv_from(&mut buf))
            .await
            .is_err(),
        "unauthorized datagram must not be forwarded"
    );

    // A whitelisted login from this IP opens the voice chat gate.
    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
    stream
        .write_all(&handshake_frame(763, "localhost", 25565, 2))
        .await
        .unwrap();
    stream.write_all(&login_start_frame("Alex")).await.unwrap();
    let (mut backend_conn, _) = timeout(Duration::from_secs(2), tcp_backend.accept())
        .await
        .expect("backend accept")
        .unwrap();
    let mut opening = [0u8; 8];
    backend_conn.read_exact(&mut opening).await.unwrap(); // drain a prefix of the replayed frames

    voice_client.send_to(b"voice frame", relay_addr).await.unwrap();
    let (n, session_addr) = timeout(Duration::from_secs(2), udp_backend.recv_from(&mut buf))
        .await
        .expect("authorized datagram reaches the backend")
        .unwrap();
    assert_eq!(&buf[..n], b"voice frame");

    udp_backend
        .send_to(b"reply frame", session_addr)
        .await
        .unwrap();
    let (n, from) = timeout(Duration::from_secs(2), voice_client.recv_from(&mut buf))
        .await
        .expect("reply reaches the voice client")
        .unwrap();
    assert_eq!(&buf[..n], b"reply frame");
    assert_eq!(from, relay_addr);

    server.shutdown();
}
