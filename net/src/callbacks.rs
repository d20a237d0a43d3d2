//! Type-erased user callbacks.
//!
//! All callbacks are value-semantics closures behind `Arc`, so they can
//! be cloned out of a connection's state and invoked with no locks held,
//! and so deferred invocations (queued tasks, timers) can outlive the
//! setter's borrow.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tracing::trace;

use crate::acceptor::SocketLease;
use crate::buffer::Buffer;
use crate::connection::TcpConnectionPtr;
use crate::event_loop::LoopHandle;
use crate::udp::UdpCommunicatorPtr;

/// Invoked on UP (state reaches Connected) and DOWN (state reaches
/// Disconnected).
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

/// Invoked with newly received bytes; the user consumes from the buffer.
/// The timestamp is the loop's poll-return time for the iteration that
/// surfaced the data.
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer, Instant) + Send + Sync>;

/// Invoked when the output buffer drains after a previous send.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

/// Invoked when the output buffer crosses the high-water mark upward;
/// the second argument is the pending byte count.
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync>;

/// Internal: used by the owning container to unregister a connection.
pub type CloseCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Delivery of an accepted or connected socket, with the peer address.
pub type NewConnectionCallback = Arc<dyn Fn(SocketLease, SocketAddr) + Send + Sync>;

/// Selects the loop that will own the next accepted connection.
pub type NextLoopCallback = Arc<dyn Fn() -> LoopHandle + Send + Sync>;

/// Invoked per received datagram with the sender's address.
pub type UdpMessageCallback =
    Arc<dyn Fn(&UdpCommunicatorPtr, &mut Buffer, SocketAddr, Instant) + Send + Sync>;

pub type UdpWriteCompleteCallback = Arc<dyn Fn(&UdpCommunicatorPtr) + Send + Sync>;

/// Default connection callback: log the transition.
///
/// Does not force-close, because some users register a message callback
/// only.
pub fn default_connection_callback(conn: &TcpConnectionPtr) {
    trace!(
        "{} -> {} is {}",
        conn.local_addr(),
        conn.peer_addr(),
        if conn.connected() { "UP" } else { "DOWN" }
    );
}

/// Default message callback: discard the input.
pub fn default_message_callback(_conn: &TcpConnectionPtr, buf: &mut Buffer, _when: Instant) {
    buf.retrieve_all();
}
