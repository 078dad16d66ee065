//! HTTP CONNECT and forward-mode end-to-end tests

mod common;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn read_response_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

#[tokio::test]
async fn connect_tunnel_anonymous() {
    let proxy = common::start_server(
        r#"
        [server]
        bind = "127.0.0.1:0"
        timeout = 5
        allow_anonymous = true
        allow_http_connect = true
        "#,
    )
    .await;
    let echo = common::start_tcp_echo().await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let request = format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", echo.port());
    client.write_all(request.as_bytes()).await.unwrap();

    let head = read_response_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200 Connection Established\r\n"));
    assert!(head.contains("Proxy-Agent: trident\r\n"));

    common::assert_echo(&mut client, b"tunneled").await;
}

#[tokio::test]
async fn basic_auth_accepted_case_insensitive_header() {
    let users = common::write_users_file("http-users", "user:pass\n");
    let proxy = common::start_server(&format!(
        r#"
        [server]
        bind = "127.0.0.1:0"
        timeout = 5
        allow_http_connect = true

        [auth]
        users_file = {:?}
        "#,
        users
    ))
    .await;
    let echo = common::start_tcp_echo().await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    // dXNlcjpwYXNz = base64("user:pass"); lower-case header name on purpose
    let request = format!(
        "CONNECT 127.0.0.1:{} HTTP/1.1\r\nproxy-authorization: Basic dXNlcjpwYXNz\r\n\r\n",
        echo.port()
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let head = read_response_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"));

    common::assert_echo(&mut client, b"authed tunnel").await;
}

#[tokio::test]
async fn missing_credentials_get_407() {
    let users = common::write_users_file("http-407", "user:pass\n");
    let proxy = common::start_server(&format!(
        r#"
        [server]
        bind = "127.0.0.1:0"
        timeout = 5
        allow_http_connect = true

        [auth]
        users_file = {:?}
        "#,
        users
    ))
    .await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
        .await
        .unwrap();

    let head = read_response_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 407 Proxy Authentication Required\r\n"));
    assert!(head.contains("Proxy-Authenticate: Basic\r\n"));
}

#[tokio::test]
async fn invalid_credentials_get_403() {
    let users = common::write_users_file("http-403", "user:pass\n");
    let proxy = common::start_server(&format!(
        r#"
        [server]
        bind = "127.0.0.1:0"
        timeout = 5
        allow_http_connect = true

        [auth]
        users_file = {:?}
        "#,
        users
    ))
    .await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    // base64("user:wrong")
    client
        .write_all(
            b"CONNECT example.com:443 HTTP/1.1\r\nProxy-Authorization: Basic dXNlcjp3cm9uZw==\r\n\r\n",
        )
        .await
        .unwrap();

    let head = read_response_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 403 Forbidden\r\n"));
}

#[tokio::test]
async fn unreachable_upstream_gets_503() {
    let proxy = common::start_server(
        r#"
        [server]
        bind = "127.0.0.1:0"
        timeout = 5
        allow_anonymous = true
        allow_http_connect = true
        "#,
    )
    .await;

    // Find a loopback port with no listener.
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = probe.local_addr().unwrap().port();
    drop(probe);

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let request = format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", dead_port);
    client.write_all(request.as_bytes()).await.unwrap();

    let head = read_response_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
}

/// Forward mode rewrites the absolute-form target to origin form and
/// strips proxy headers before replaying upstream.
#[tokio::test]
async fn forward_mode_rewrites_request_line() {
    let proxy = common::start_server(
        r#"
        [server]
        bind = "127.0.0.1:0"
        timeout = 5
        allow_anonymous = true
        allow_http_connect = true
        allow_http_forward = true
        "#,
    )
    .await;

    // Origin server that records the request head and answers 204.
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    let recorded = tokio::spawn(async move {
        let (mut socket, _) = origin.accept().await.unwrap();
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            socket.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        socket
            .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
            .await
            .unwrap();
        String::from_utf8(head).unwrap()
    });

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let request = format!(
        "GET http://127.0.0.1:{}/hello?x=1 HTTP/1.1\r\nHost: 127.0.0.1\r\nProxy-Authorization: Basic Zm9vOmJhcg==\r\nAccept: */*\r\n\r\n",
        origin_addr.port()
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let head = recorded.await.unwrap();
    assert!(head.starts_with("GET /hello?x=1 HTTP/1.1\r\n"));
    assert!(head.contains("Host: 127.0.0.1\r\n"));
    assert!(head.contains("Accept: */*\r\n"));
    assert!(!head.contains("Proxy-Authorization"));

    let response = read_response_head(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 204 No Content\r\n"));
}

/// Forward disabled: a non-CONNECT verb starting with 'C' reaches the
/// handler and is answered with 405.
#[tokio::test]
async fn forward_disabled_gets_405() {
    let proxy = common::start_server(
        r#"
        [server]
        bind = "127.0.0.1:0"
        timeout = 5
        allow_anonymous = true
        allow_http_connect = true
        "#,
    )
    .await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(b"COPY http://example.com/ HTTP/1.1\r\n\r\n")
        .await
        .unwrap();

    let head = read_response_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
}

/// A bare LF after CR is required; a stray CR closes the connection.
#[tokio::test]
async fn bare_cr_is_malformed() {
    let proxy = common::start_server(
        r#"
        [server]
        bind = "127.0.0.1:0"
        timeout = 5
        allow_anonymous = true
        allow_http_connect = true
        "#,
    )
    .await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(b"CONNECT example.com:443 HTTP/1.1\rX\n\r\n")
        .await
        .unwrap();

    // Closed without a reply; unread bytes may turn the close into a reset.
    let result = client.read(&mut [0u8; 16]).await;
    assert!(matches!(result, Ok(0) | Err(_)));
}
