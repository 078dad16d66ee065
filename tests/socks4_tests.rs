//! SOCKS4/4a end-to-end tests over loopback

mod common;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn anonymous_server() -> std::net::SocketAddr {
    common::start_server(
        r#"
        [server]
        bind = "127.0.0.1:0"
        timeout = 5
        allow_anonymous = true
        "#,
    )
    .await
}

/// CONNECT to an IPv4 literal; the granted reply echoes port and address.
#[tokio::test]
async fn connect_ipv4() {
    let proxy = anonymous_server().await;
    let echo = common::start_tcp_echo().await;

    let mut client = TcpStream::connect(proxy).await.unwrap();

    let mut request = vec![0x04, 0x01];
    request.extend_from_slice(&echo.port().to_be_bytes());
    request.extend_from_slice(&[127, 0, 0, 1]);
    request.extend_from_slice(b"userid\x00");
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 8];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], 0x00);
    assert_eq!(reply[1], 0x5A);
    assert_eq!(u16::from_be_bytes([reply[2], reply[3]]), echo.port());
    assert_eq!(&reply[4..8], &[127, 0, 0, 1]);

    common::assert_echo(&mut client, b"socks4 bytes").await;
}

/// The 4a escape (DSTIP 0.0.0.1) carries a trailing domain name.
#[tokio::test]
async fn connect_4a_domain() {
    let proxy = anonymous_server().await;
    let echo = common::start_tcp_echo().await;

    let mut client = TcpStream::connect(proxy).await.unwrap();

    let mut request = vec![0x04, 0x01];
    request.extend_from_slice(&echo.port().to_be_bytes());
    request.extend_from_slice(&[0, 0, 0, 1]);
    request.extend_from_slice(b"\x00"); // empty userid
    request.extend_from_slice(b"localhost\x00");
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 8];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x5A);
    assert_eq!(u16::from_be_bytes([reply[2], reply[3]]), echo.port());
    assert_eq!(&reply[4..8], &[0, 0, 0, 0]);

    common::assert_echo(&mut client, b"hello via 4a").await;
}

/// SOCKS4 has no credentials, so disabling anonymous access rejects it.
#[tokio::test]
async fn anonymous_disabled_rejected() {
    let users = common::write_users_file("s4-users", "user:pass\n");
    let proxy = common::start_server(&format!(
        r#"
        [server]
        bind = "127.0.0.1:0"
        timeout = 5

        [auth]
        users_file = {:?}
        "#,
        users
    ))
    .await;

    let mut client = TcpStream::connect(proxy).await.unwrap();

    let mut request = vec![0x04, 0x01, 0x00, 0x50];
    request.extend_from_slice(&[127, 0, 0, 1]);
    request.extend_from_slice(b"\x00");
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 8];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x5B);

    let n = client.read(&mut [0u8; 8]).await.unwrap();
    assert_eq!(n, 0);
}

/// BIND disabled: immediate 0x5B.
#[tokio::test]
async fn bind_disabled_rejected() {
    let proxy = anonymous_server().await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let mut request = vec![0x04, 0x02, 0x00, 0x50];
    request.extend_from_slice(&[127, 0, 0, 1]);
    request.extend_from_slice(b"\x00");
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 8];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x5B);
}

/// Full BIND flow over the IPv4 bind endpoint.
#[tokio::test]
async fn bind_accept_then_relay() {
    let proxy = common::start_server(
        r#"
        [server]
        bind = "127.0.0.1:0"
        timeout = 5
        allow_anonymous = true
        allow_tcp_bind = true

        [tcp_bind]
        addr = "127.0.0.1"
        ports_start = 46850
        ports_end = 46859
        "#,
    )
    .await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let mut request = vec![0x04, 0x02, 0x00, 0x00];
    request.extend_from_slice(&[0, 0, 0, 0]);
    request.extend_from_slice(b"\x00");
    client.write_all(&request).await.unwrap();

    let mut first = [0u8; 8];
    client.read_exact(&mut first).await.unwrap();
    assert_eq!(first[1], 0x5A);
    assert_eq!(&first[4..8], &[127, 0, 0, 1]);
    let bound_port = u16::from_be_bytes([first[2], first[3]]);
    assert!((46850..=46859).contains(&bound_port));

    let mut peer = TcpStream::connect(("127.0.0.1", bound_port)).await.unwrap();
    let peer_addr = peer.local_addr().unwrap();

    let mut second = [0u8; 8];
    client.read_exact(&mut second).await.unwrap();
    assert_eq!(second[1], 0x5A);
    assert_eq!(u16::from_be_bytes([second[2], second[3]]), peer_addr.port());
    assert_eq!(&second[4..8], &[127, 0, 0, 1]);

    peer.write_all(b"reverse data").await.unwrap();
    let mut buf = [0u8; 12];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"reverse data");
}

/// A userid that never terminates within the bound is malformed; the
/// connection closes with no reply.
#[tokio::test]
async fn oversized_userid_closes() {
    let proxy = anonymous_server().await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let mut request = vec![0x04, 0x01, 0x00, 0x50];
    request.extend_from_slice(&[127, 0, 0, 1]);
    request.extend_from_slice(&vec![b'a'; 300]);
    client.write_all(&request).await.unwrap();

    // Closed without a reply; unread bytes may turn the close into a reset.
    let result = client.read(&mut [0u8; 8]).await;
    assert!(matches!(result, Ok(0) | Err(_)));
}
