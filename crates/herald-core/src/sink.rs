//! Outbound side of a live connection.
//!
//! The core never touches sockets. Each registered connection carries a
//! [`ConnectionSink`]; the transport layer decides what a send or a close
//! means on the wire.

use herald_protocol::ServerEvent;
use thiserror::Error;
use tokio::sync::mpsc;

/// Close code for a connection superseded by a newer one for the same device.
pub const CLOSE_REPLACED: u16 = 1000;

/// Close code for a connection evicted by the idle sweep.
pub const CLOSE_IDLE: u16 = 4000;

/// Close code for a handshake without any identity.
pub const CLOSE_REJECTED: u16 = 4001;

/// Close code for a connection dropped after a failed write.
pub const CLOSE_WRITE_FAILED: u16 = 4002;

/// Sink errors.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The peer side of the sink is gone.
    #[error("Connection closed")]
    Closed,

    /// The write was rejected.
    #[error("Send failed: {0}")]
    Failed(String),
}

/// Outbound half of a connection.
///
/// Implementations must not block: they are called while fanning out to
/// many connections and, for `close`, right after a registry mutation.
pub trait ConnectionSink: Send + Sync {
    /// Queue an event for the peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection can no longer accept events.
    fn send(&self, event: &ServerEvent) -> Result<(), SinkError>;

    /// Force-close the connection.
    fn close(&self, code: u16, reason: &str);

    /// Whether the peer answers `ping` with `pong`.
    fn supports_ack(&self) -> bool {
        true
    }
}

/// A message queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Event to serialize and write.
    Event(ServerEvent),
    /// Close the socket with the given code and reason.
    Close { code: u16, reason: String },
}

/// Sink backed by an unbounded queue drained by a per-connection writer.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Outbound>,
    supports_ack: bool,
}

impl ChannelSink {
    /// Create a sink whose peer answers pings.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        Self::with_ack(true)
    }

    /// Create a sink, stating whether the peer answers pings.
    #[must_use]
    pub fn with_ack(supports_ack: bool) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, supports_ack }, rx)
    }
}

impl ConnectionSink for ChannelSink {
    fn send(&self, event: &ServerEvent) -> Result<(), SinkError> {
        self.tx
            .send(Outbound::Event(event.clone()))
            .map_err(|_| SinkError::Closed)
    }

    fn close(&self, code: u16, reason: &str) {
        // The writer may already be gone; nothing left to close then.
        let _ = self.tx.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }

    fn supports_ack(&self) -> bool {
        self.supports_ack
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_protocol::PingEvent;

    #[test]
    fn test_channel_sink_queues_events_and_close() {
        let (sink, mut rx) = ChannelSink::new();
        let ping = ServerEvent::Ping(PingEvent { id: 1, timestamp: 0 });

        sink.send(&ping).unwrap();
        sink.close(CLOSE_IDLE, "Idle timeout");

        assert_eq!(rx.try_recv().unwrap(), Outbound::Event(ping));
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Close {
                code: CLOSE_IDLE,
                reason: "Idle timeout".into()
            }
        );
    }

    #[test]
    fn test_channel_sink_reports_closed_peer() {
        let (sink, rx) = ChannelSink::with_ack(false);
        drop(rx);

        let ping = ServerEvent::Ping(PingEvent { id: 1, timestamp: 0 });
        assert!(matches!(sink.send(&ping), Err(SinkError::Closed)));
        assert!(!sink.supports_ack());
    }
}
