//! TCP echo server.
//!
//! Run with `cargo run --example echo_server [addr]`, then poke it with
//! `nc 127.0.0.1 7890` or the echo_client example.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tracing::info;
use tracing_subscriber::EnvFilter;

use flywheel_net::{Acceptor, EventLoop, TcpConnection, TcpConnectionPtr};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7890".to_string())
        .parse()
        .expect("usage: echo_server [ip:port]");

    let mut event_loop = EventLoop::new().expect("event loop");
    let acceptor = Acceptor::new(&event_loop.handle(), addr, false).expect("bind");

    let connections: Arc<Mutex<HashMap<String, TcpConnectionPtr>>> =
        Arc::new(Mutex::new(HashMap::new()));
    acceptor.set_new_connection_callback(move |lease, peer| {
        let conn = TcpConnection::new(format!("echo-{peer}"), lease).expect("connection");
        conn.set_connection_callback(|conn| {
            info!(
                "{} is {}",
                conn.name(),
                if conn.connected() { "UP" } else { "DOWN" }
            );
        });
        conn.set_message_callback(|conn, buf, _when| {
            let bytes = buf.retrieve_all_as_bytes();
            conn.send(&bytes);
        });
        {
            let connections = connections.clone();
            conn.set_close_callback(move |conn| {
                connections.lock().unwrap().remove(conn.name());
            });
        }
        connections
            .lock()
            .unwrap()
            .insert(conn.name().to_string(), conn.clone());
        conn.connect_established();
    });
    acceptor.listen();

    info!("echo server listening on {addr}");
    event_loop.run().expect("run");
}
