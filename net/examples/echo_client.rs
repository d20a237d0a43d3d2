//! TCP echo client: connects, sends one line, prints the echo, then
//! half-closes and exits when the server finishes.
//!
//! Run with `cargo run --example echo_client [addr] [message]`.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tracing::info;
use tracing_subscriber::EnvFilter;

use flywheel_net::{Connector, EventLoop, TcpConnection, TcpConnectionPtr};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7890".to_string())
        .parse()
        .expect("usage: echo_client [ip:port] [message]");
    let message = std::env::args().nth(2).unwrap_or_else(|| "hello".to_string());

    let mut event_loop = EventLoop::new().expect("event loop");
    let handle = event_loop.handle();

    let connector = Connector::new(&handle, addr);
    let connection: Arc<Mutex<Option<TcpConnectionPtr>>> = Arc::new(Mutex::new(None));
    {
        let connection = connection.clone();
        let handle = handle.clone();
        connector.set_new_connection_callback(move |lease, peer| {
            let conn = TcpConnection::new(format!("client-{peer}"), lease).expect("connection");
            {
                let message = message.clone();
                conn.set_connection_callback(move |conn| {
                    if conn.connected() {
                        info!("{} UP, sending {:?}", conn.name(), message);
                        conn.send(message.as_bytes());
                    } else {
                        info!("{} DOWN", conn.name());
                    }
                });
            }
            {
                let handle = handle.clone();
                conn.set_message_callback(move |conn, buf, _when| {
                    let reply = buf.retrieve_all_as_bytes();
                    info!("echo: {:?}", String::from_utf8_lossy(&reply));
                    conn.shutdown();
                    let handle = handle.clone();
                    conn.owner_loop().run_after(std::time::Duration::from_millis(100), move || {
                        handle.quit();
                    });
                });
            }
            {
                let connection = connection.clone();
                conn.set_close_callback(move |_conn| {
                    connection.lock().unwrap().take();
                });
            }
            *connection.lock().unwrap() = Some(conn.clone());
            conn.connect_established();
        });
    }
    connector.start();

    event_loop.run().expect("run");
}
