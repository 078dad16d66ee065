//! Shared helpers for integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use trident_proxy::{Config, Server};

/// Start a proxy server from a TOML config snippet; returns the bound
/// listener address. The accept loop runs until the test ends.
pub async fn start_server(config_toml: &str) -> SocketAddr {
    let config: Config = toml::from_str(config_toml).expect("test config parses");
    let server = Arc::new(
        Server::new(Arc::new(config))
            .await
            .expect("server starts"),
    );
    let addr = server.local_addr().unwrap();

    let runner = server.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });

    addr
}

/// TCP echo server on an ephemeral loopback port.
pub async fn start_tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

/// UDP echo server on an ephemeral loopback port.
pub async fn start_udp_echo() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = [0u8; 65535];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });

    addr
}

/// Write a users file for auth tests; returns its path.
pub fn write_users_file(name: &str, contents: &str) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(format!("trident-test-{}-{}", std::process::id(), name));
    std::fs::write(&path, contents).unwrap();
    path
}

/// Assert an echo round trip through an established tunnel.
pub async fn assert_echo(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, payload);
}
