//! End-to-end echo scenarios over loopback.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flywheel_net::{Acceptor, Connector, EventLoop, LoopHandle, TcpConnection, TcpConnectionPtr};

#[derive(Debug, PartialEq)]
enum Ev {
    Up,
    Down,
    Data(Vec<u8>),
}

fn spawn_loop(name: &str) -> (LoopHandle, std::thread::JoinHandle<()>) {
    let (tx, rx) = crossbeam_channel::bounded(1);
    let join = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let mut event_loop = EventLoop::new().unwrap();
            tx.send(event_loop.handle()).unwrap();
            event_loop.run().unwrap();
        })
        .unwrap();
    (rx.recv().unwrap(), join)
}

/// Echo server owning its connections; replies with whatever arrives,
/// half-closing on "quit\n".
fn start_echo_server(server_loop: &LoopHandle) -> (Arc<Acceptor>, std::net::SocketAddr) {
    let acceptor = Acceptor::new(server_loop, "127.0.0.1:0".parse().unwrap(), false).unwrap();
    let addr = acceptor.local_addr().unwrap();

    let connections: Arc<Mutex<HashMap<String, TcpConnectionPtr>>> =
        Arc::new(Mutex::new(HashMap::new()));
    acceptor.set_new_connection_callback(move |lease, peer| {
        let conn = TcpConnection::new(format!("server-{peer}"), lease).unwrap();
        conn.set_message_callback(|conn, buf, _when| {
            let bytes = buf.retrieve_all_as_bytes();
            if bytes == b"quit\n" {
                conn.shutdown();
            } else {
                conn.send(&bytes);
            }
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

    for _ in 0..100 {
        if acceptor.listening() {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(acceptor.listening());
    (acceptor, addr)
}

/// Connect a flywheel client to `addr`, reporting connection events and
/// received data on a channel.
fn start_client(
    client_loop: &LoopHandle,
    addr: std::net::SocketAddr,
) -> (
    Arc<Connector>,
    Arc<Mutex<Option<TcpConnectionPtr>>>,
    crossbeam_channel::Receiver<Ev>,
) {
    let (event_tx, event_rx) = crossbeam_channel::unbounded();
    let connector = Connector::new(client_loop, addr);
    let client_conn: Arc<Mutex<Option<TcpConnectionPtr>>> = Arc::new(Mutex::new(None));
    {
        let client_conn = client_conn.clone();
        connector.set_new_connection_callback(move |lease, peer| {
            let conn = TcpConnection::new(format!("client-{peer}"), lease).unwrap();
            {
                let tx = event_tx.clone();
                conn.set_connection_callback(move |conn| {
                    let _ = tx.send(if conn.connected() { Ev::Up } else { Ev::Down });
                });
            }
            {
                let tx = event_tx.clone();
                conn.set_message_callback(move |_conn, buf, _when| {
                    let _ = tx.send(Ev::Data(buf.retrieve_all_as_bytes()));
                });
            }
            {
                let client_conn = client_conn.clone();
                conn.set_close_callback(move |_conn| {
                    client_conn.lock().unwrap().take();
                });
            }
            *client_conn.lock().unwrap() = Some(conn.clone());
            conn.connect_established();
        });
    }
    connector.start();
    (connector, client_conn, event_rx)
}

#[test]
fn test_echo_single_client() {
    let (server_loop, server_join) = spawn_loop("echo-server");
    let (client_loop, client_join) = spawn_loop("echo-client");

    let (_acceptor, addr) = start_echo_server(&server_loop);
    let (_connector, client_conn, events) = start_client(&client_loop, addr);

    assert_eq!(events.recv_timeout(Duration::from_secs(5)).unwrap(), Ev::Up);

    {
        let guard = client_conn.lock().unwrap();
        let conn = guard.as_ref().expect("client connection missing");
        conn.send(b"hello\n");
    }
    assert_eq!(
        events.recv_timeout(Duration::from_secs(5)).unwrap(),
        Ev::Data(b"hello\n".to_vec())
    );

    {
        let guard = client_conn.lock().unwrap();
        let conn = guard.as_ref().expect("client connection missing");
        conn.send(b"quit\n");
    }

    // The server half-closes; the client observes DOWN and nothing else.
    assert_eq!(
        events.recv_timeout(Duration::from_secs(5)).unwrap(),
        Ev::Down
    );
    assert!(events.try_recv().is_err(), "client received extra bytes");

    server_loop.quit();
    client_loop.quit();
    server_join.join().unwrap();
    client_join.join().unwrap();
}

#[test]
fn test_graceful_half_close_reply_precedes_down() {
    let (server_loop, server_join) = spawn_loop("half-close-server");
    let (client_loop, client_join) = spawn_loop("half-close-client");

    // Server that answers EOF-adjacent traffic with one final reply.
    let acceptor = Acceptor::new(&server_loop, "127.0.0.1:0".parse().unwrap(), false).unwrap();
    let addr = acceptor.local_addr().unwrap();
    let connections: Arc<Mutex<Vec<TcpConnectionPtr>>> = Arc::new(Mutex::new(Vec::new()));
    acceptor.set_new_connection_callback(move |lease, peer| {
        let conn = TcpConnection::new(format!("server-{peer}"), lease).unwrap();
        conn.set_message_callback(|conn, buf, _when| {
            buf.retrieve_all();
            conn.send(b"farewell");
            conn.shutdown();
        });
        connections.lock().unwrap().push(conn.clone());
        conn.connect_established();
    });
    acceptor.listen();
    for _ in 0..100 {
        if acceptor.listening() {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    let (_connector, client_conn, events) = start_client(&client_loop, addr);
    assert_eq!(events.recv_timeout(Duration::from_secs(5)).unwrap(), Ev::Up);

    // Half-close from the client: data then FIN.
    {
        let guard = client_conn.lock().unwrap();
        let conn = guard.as_ref().expect("client connection missing");
        conn.send(b"bye");
        conn.shutdown();
    }

    // The final reply must arrive before the DOWN notification.
    assert_eq!(
        events.recv_timeout(Duration::from_secs(5)).unwrap(),
        Ev::Data(b"farewell".to_vec())
    );
    assert_eq!(
        events.recv_timeout(Duration::from_secs(5)).unwrap(),
        Ev::Down
    );

    server_loop.quit();
    client_loop.quit();
    server_join.join().unwrap();
    client_join.join().unwrap();
}
