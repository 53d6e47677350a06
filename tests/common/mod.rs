#![allow(dead_code)]

use ethrs::{Config, Server};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};

/// Starts a server on an ephemeral loopback port (TCP and UDP share it).
pub async fn start_server() -> (Arc<Server>, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let socket = UdpSocket::bind(addr).await.unwrap();

    let server = Arc::new(Server::new(
        Config::server(addr.port()).with_interval(Duration::from_millis(500)),
    ));
    let running = server.clone();
    tokio::spawn(async move {
        let _ = running.serve(listener, socket).await;
    });
    (server, addr.port())
}

/// A loopback port nothing listens on.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

pub fn client_config(port: u16) -> Config {
    Config::client("127.0.0.1".to_string(), port)
        .with_duration(Duration::from_secs(1))
        .with_interval(Duration::from_millis(500))
}
