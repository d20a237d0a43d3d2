//! Reactor-pattern networking: per-thread event loops with a
//! cross-thread task queue and timer service, buffered TCP connections
//! with half-close and high-water-mark backpressure, accept/connect
//! drivers, and UDP helpers.
//!
//! One [`EventLoop`] pins to one OS thread. User callbacks run on the
//! loop thread and must not block it; every public entry point is safe
//! from any thread and marshals through the loop's task queue when
//! called off-thread.
//!
//! ```no_run
//! use std::sync::{Arc, Mutex};
//! use flywheel_net::{Acceptor, EventLoop, TcpConnection};
//!
//! let mut event_loop = EventLoop::new().unwrap();
//! let acceptor = Acceptor::new(&event_loop.handle(), "127.0.0.1:7890".parse().unwrap(), false).unwrap();
//! let connections = Arc::new(Mutex::new(Vec::new()));
//! acceptor.set_new_connection_callback(move |lease, peer| {
//!     let conn = TcpConnection::new(format!("conn-{peer}"), lease).unwrap();
//!     conn.set_message_callback(|conn, buf, _when| {
//!         let bytes = buf.retrieve_all_as_bytes();
//!         conn.send(&bytes); // echo
//!     });
//!     conn.connect_established();
//!     connections.lock().unwrap().push(conn);
//! });
//! acceptor.listen();
//! event_loop.run().unwrap();
//! ```

pub mod acceptor;
pub mod buffer;
pub mod callbacks;
pub mod connection;
pub mod connector;
pub mod error;
pub mod event_loop;
pub mod socket;
pub mod timer;
pub mod udp;

pub use acceptor::{Acceptor, SocketLease};
pub use buffer::Buffer;
pub use callbacks::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, NewConnectionCallback,
    NextLoopCallback, TimerCallback, UdpMessageCallback, UdpWriteCompleteCallback,
    WriteCompleteCallback,
};
pub use connection::{ConnState, TcpConnection, TcpConnectionPtr};
pub use connector::Connector;
pub use error::{Error, Result};
pub use event_loop::{EventLoop, LoopHandle};
pub use socket::TcpSocket;
pub use timer::TimerId;
pub use udp::{UdpClient, UdpCommunicator, UdpCommunicatorPtr, UdpServer};
