//! Connection-level behaviors: write completion, shutdown idempotence,
//! cross-thread sends, delayed force-close.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flywheel_net::{Acceptor, Connector, EventLoop, LoopHandle, TcpConnection, TcpConnectionPtr};

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

struct Harness {
    server_loop: LoopHandle,
    client_loop: LoopHandle,
    server_join: std::thread::JoinHandle<()>,
    client_join: std::thread::JoinHandle<()>,
    _acceptor: Arc<Acceptor>,
    _connector: Arc<Connector>,
    client_conn: TcpConnectionPtr,
    server_conns: Arc<Mutex<Vec<TcpConnectionPtr>>>,
    server_bytes: crossbeam_channel::Receiver<Vec<u8>>,
}

/// A connected client/server pair; the server forwards every received
/// chunk to a channel.
fn connect_pair(tag: &str) -> Harness {
    let (server_loop, server_join) = spawn_loop(&format!("{tag}-server"));
    let (client_loop, client_join) = spawn_loop(&format!("{tag}-client"));

    let (bytes_tx, bytes_rx) = crossbeam_channel::unbounded();
    let acceptor = Acceptor::new(&server_loop, "127.0.0.1:0".parse().unwrap(), false).unwrap();
    let addr = acceptor.local_addr().unwrap();
    let server_conns: Arc<Mutex<Vec<TcpConnectionPtr>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let server_conns = server_conns.clone();
        acceptor.set_new_connection_callback(move |lease, peer| {
            let conn = TcpConnection::new(format!("server-{peer}"), lease).unwrap();
            let tx = bytes_tx.clone();
            conn.set_message_callback(move |_conn, buf, _when| {
                let _ = tx.send(buf.retrieve_all_as_bytes());
            });
            server_conns.lock().unwrap().push(conn.clone());
            conn.connect_established();
        });
    }
    acceptor.listen();
    for _ in 0..100 {
        if acceptor.listening() {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    let (conn_tx, conn_rx) = crossbeam_channel::bounded(1);
    let connector = Connector::new(&client_loop, addr);
    connector.set_new_connection_callback(move |lease, peer| {
        let conn = TcpConnection::new(format!("client-{peer}"), lease).unwrap();
        conn.connect_established();
        let _ = conn_tx.send(conn);
    });
    connector.start();
    let client_conn = conn_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    Harness {
        server_loop,
        client_loop,
        server_join,
        client_join,
        _acceptor: acceptor,
        _connector: connector,
        client_conn,
        server_conns,
        server_bytes: bytes_rx,
    }
}

impl Harness {
    fn finish(self) {
        self.server_loop.quit();
        self.client_loop.quit();
        self.server_join.join().unwrap();
        self.client_join.join().unwrap();
    }
}

#[test]
fn test_write_complete_fires_after_drain() {
    let harness = connect_pair("write-complete");
    let completions = Arc::new(AtomicUsize::new(0));
    {
        let completions = completions.clone();
        harness
            .client_conn
            .set_write_complete_callback(move |_conn| {
                completions.fetch_add(1, Ordering::SeqCst);
            });
    }

    harness.client_conn.send(b"payload");
    assert_eq!(
        harness
            .server_bytes
            .recv_timeout(Duration::from_secs(5))
            .unwrap(),
        b"payload".to_vec()
    );

    for _ in 0..100 {
        if completions.load(Ordering::SeqCst) == 1 {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(completions.load(Ordering::SeqCst), 1);
    harness.finish();
}

#[test]
fn test_empty_send_still_completes() {
    let harness = connect_pair("empty-send");
    let completions = Arc::new(AtomicUsize::new(0));
    {
        let completions = completions.clone();
        harness
            .client_conn
            .set_write_complete_callback(move |_conn| {
                completions.fetch_add(1, Ordering::SeqCst);
            });
    }

    // A no-op send on an empty output buffer still reports completion.
    harness.client_conn.send(b"");
    for _ in 0..100 {
        if completions.load(Ordering::SeqCst) == 1 {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(completions.load(Ordering::SeqCst), 1);
    harness.finish();
}

#[test]
fn test_shutdown_is_idempotent() {
    let harness = connect_pair("idempotent-shutdown");
    let conn = harness.client_conn.clone();

    conn.shutdown();
    conn.shutdown();
    conn.shutdown();

    // The server sees exactly one EOF and the connection settles in
    // Disconnected once the server closes its side too.
    for _ in 0..100 {
        if harness.server_conns.lock().unwrap().first().is_some_and(|c| c.disconnected()) {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    // Repeat shutdown after the fact: still a no-op.
    conn.shutdown();
    harness.finish();
}

#[test]
fn test_cross_thread_sends_are_complete_and_ordered() {
    const THREADS: usize = 8;
    const MESSAGES: usize = 500;
    const FRAME: usize = 64;

    let harness = connect_pair("cross-thread");
    let conn = harness.client_conn.clone();

    let senders: Vec<_> = (0..THREADS)
        .map(|thread_id| {
            let conn = conn.clone();
            std::thread::spawn(move || {
                for seq in 0..MESSAGES as u32 {
                    let mut frame = vec![0u8; FRAME];
                    frame[0] = thread_id as u8;
                    frame[1..5].copy_from_slice(&seq.to_be_bytes());
                    conn.send(&frame);
                }
            })
        })
        .collect();
    for join in senders {
        join.join().unwrap();
    }

    // Reassemble frames from the server's chunk stream.
    let mut stream: Vec<u8> = Vec::new();
    let mut frames: Vec<(u8, u32)> = Vec::new();
    let deadline = std::time::Instant::now() + Duration::from_secs(20);
    while frames.len() < THREADS * MESSAGES {
        let remaining = deadline
            .checked_duration_since(std::time::Instant::now())
            .expect("timed out collecting frames");
        let chunk = harness.server_bytes.recv_timeout(remaining).unwrap();
        stream.extend_from_slice(&chunk);
        while stream.len() >= FRAME {
            let frame: Vec<u8> = stream.drain(..FRAME).collect();
            let mut seq = [0u8; 4];
            seq.copy_from_slice(&frame[1..5]);
            frames.push((frame[0], u32::from_be_bytes(seq)));
        }
    }

    assert_eq!(frames.len(), THREADS * MESSAGES);
    assert!(stream.is_empty(), "trailing partial frame");

    // Within each thread the sequence must be strictly increasing.
    let mut last = vec![None::<u32>; THREADS];
    for (thread_id, seq) in frames {
        let slot = &mut last[thread_id as usize];
        if let Some(prev) = *slot {
            assert!(seq > prev, "thread {thread_id}: {seq} after {prev}");
        }
        *slot = Some(seq);
    }
    for (thread_id, slot) in last.iter().enumerate() {
        assert_eq!(*slot, Some(MESSAGES as u32 - 1), "thread {thread_id} incomplete");
    }

    harness.finish();
}

#[test]
fn test_force_close_with_delay() {
    let harness = connect_pair("force-close-delay");
    let conn = harness.client_conn.clone();

    conn.force_close_with_delay(Duration::from_millis(50));
    assert!(!conn.disconnected());

    for _ in 0..100 {
        if conn.disconnected() {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(conn.disconnected());
    harness.finish();
}
