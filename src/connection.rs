//! One WebSocket peer, as the server sees it.
//!
//! Each connection owns a bounded outbound FIFO drained by a single writer
//! task; the reader task lives in the server accept path. Backpressure is
//! the queue bound: a peer that cannot keep up overflows the queue and is
//! closed with [`CloseCode::SlowConsumer`]. Close is idempotent; a normal
//! closure drains the queue up to a grace period, every other closure
//! drops it.
//!
//! A connection attaches to at most one document per name but to many
//! distinct documents over one socket (name-multiplexed).

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{Sink, SinkExt};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

use crate::auth::AuthScope;
use crate::protocol::Message;

/// Stable identity of one connection. Origin elision compares these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Authenticating = 1,
    Active = 2,
    Closing = 3,
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Authenticating,
            2 => ConnectionState::Active,
            3 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Why a connection (or the whole hub) closed a socket. Carried to the
/// peer as a WebSocket close code in the 4000 block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// Orderly shutdown; the outbound queue is drained first.
    Normal,
    /// Malformed frame, unknown tag, trailing bytes, oversize frame.
    ProtocolError,
    /// Admission refused and the socket had nothing else attached.
    AuthDenied,
    /// Outbound queue overflow.
    SlowConsumer,
    /// The persistence hook failed or timed out while loading.
    LoadFailure,
    /// The persistence hook failed on write beyond the retry budget.
    StorageFailure,
}

impl CloseCode {
    /// The WebSocket close code sent on the wire.
    pub fn wire_code(self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::ProtocolError => 4400,
            CloseCode::AuthDenied => 4401,
            CloseCode::SlowConsumer => 4408,
            CloseCode::LoadFailure => 4500,
            CloseCode::StorageFailure => 4501,
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CloseCode::Normal => "normal",
            CloseCode::ProtocolError => "protocol error",
            CloseCode::AuthDenied => "auth denied",
            CloseCode::SlowConsumer => "slow consumer",
            CloseCode::LoadFailure => "load failure",
            CloseCode::StorageFailure => "storage failure",
        };
        write!(f, "{name}")
    }
}

/// Receiver halves handed to the writer task.
pub(crate) struct ConnectionChannels {
    pub frames: mpsc::Receiver<Arc<Vec<u8>>>,
    pub control: mpsc::Receiver<(CloseCode, String)>,
}

/// Server-side connection handle. Cheap to clone behind an `Arc`; shared
/// between the reader task and every document the peer attaches to.
pub struct Connection {
    id: ConnectionId,
    state: AtomicU8,
    queue_limit: usize,
    frames: mpsc::Sender<Arc<Vec<u8>>>,
    control: mpsc::Sender<(CloseCode, String)>,
    /// Flips to true once closure is requested; the reader selects on it
    /// so a close is observed even while no frame is inbound.
    closing: watch::Sender<bool>,
    /// Documents this connection has been admitted to, with their scope.
    attached: Mutex<HashMap<String, AuthScope>>,
}

impl Connection {
    /// Create a connection with a bounded outbound queue.
    pub(crate) fn new(queue_limit: usize) -> (Arc<Self>, ConnectionChannels) {
        let (frames_tx, frames_rx) = mpsc::channel(queue_limit);
        let (control_tx, control_rx) = mpsc::channel(1);
        let (closing_tx, _) = watch::channel(false);
        let conn = Arc::new(Self {
            id: ConnectionId::generate(),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            queue_limit,
            frames: frames_tx,
            control: control_tx,
            closing: closing_tx,
            attached: Mutex::new(HashMap::new()),
        });
        (
            conn,
            ConnectionChannels {
                frames: frames_rx,
                control: control_rx,
            },
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Whether frames may still be enqueued.
    pub fn is_open(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connecting
                | ConnectionState::Authenticating
                | ConnectionState::Active
        )
    }

    /// Enqueue a pre-encoded frame for transmission.
    ///
    /// Never blocks. Overflowing the bounded queue closes the connection
    /// with [`CloseCode::SlowConsumer`].
    pub fn send(&self, frame: Arc<Vec<u8>>) {
        if !self.is_open() {
            return;
        }
        match self.frames.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!(
                    "connection {}: outbound queue overflow ({} frames)",
                    self.id,
                    self.queue_limit
                );
                self.close(CloseCode::SlowConsumer, "outbound queue overflow");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.set_state(ConnectionState::Closed);
            }
        }
    }

    /// Encode and enqueue a protocol message.
    pub fn send_message(&self, message: &Message) {
        self.send(Arc::new(message.encode()));
    }

    /// Request closure. Idempotent; the first call wins.
    pub fn close(&self, code: CloseCode, reason: &str) {
        let prev = self
            .state
            .fetch_max(ConnectionState::Closing as u8, Ordering::AcqRel);
        if prev >= ConnectionState::Closing as u8 {
            return;
        }
        log::debug!("connection {}: closing ({code}: {reason})", self.id);
        let _ = self.control.try_send((code, reason.to_owned()));
        let _ = self.closing.send(true);
    }

    /// Watch that flips when closure is requested.
    pub(crate) fn closing_watch(&self) -> watch::Receiver<bool> {
        self.closing.subscribe()
    }

    /// Record admission to `doc`. Returns false if already attached.
    pub(crate) fn attach(&self, doc: &str, scope: AuthScope) -> bool {
        self.attached
            .lock()
            .unwrap()
            .insert(doc.to_owned(), scope)
            .is_none()
    }

    pub(crate) fn detach(&self, doc: &str) -> bool {
        self.attached.lock().unwrap().remove(doc).is_some()
    }

    /// The scope granted for `doc`, if attached.
    pub fn scope(&self, doc: &str) -> Option<AuthScope> {
        self.attached.lock().unwrap().get(doc).copied()
    }

    pub fn is_attached(&self, doc: &str) -> bool {
        self.attached.lock().unwrap().contains_key(doc)
    }

    pub fn attached_documents(&self) -> Vec<String> {
        self.attached.lock().unwrap().keys().cloned().collect()
    }

    /// Frames currently queued for transmission.
    pub fn queued_frames(&self) -> usize {
        self.queue_limit - self.frames.capacity()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Writer task: drain the outbound queue into the WebSocket sink until a
/// close is requested or the connection is dropped.
///
/// A [`CloseCode::Normal`] closure flushes whatever is already queued,
/// bounded by `drain_grace`; every other code drops the queue and sends
/// the close frame immediately.
pub(crate) async fn run_writer<S>(
    mut sink: S,
    mut channels: ConnectionChannels,
    drain_grace: Duration,
) where
    S: Sink<WsMessage> + Unpin,
    S::Error: fmt::Display,
{
    let close = loop {
        tokio::select! {
            biased;
            requested = channels.control.recv() => {
                break requested;
            }
            frame = channels.frames.recv() => {
                match frame {
                    Some(frame) => {
                        let bytes: Vec<u8> = frame.as_ref().clone();
                        if let Err(e) = sink.send(WsMessage::Binary(bytes.into())).await {
                            log::debug!("writer send failed: {e}");
                            return;
                        }
                    }
                    None => return, // connection handle dropped
                }
            }
        }
    };

    let (code, reason) = close.unwrap_or((CloseCode::Normal, String::new()));

    if code == CloseCode::Normal {
        // Drain what is already queued, but do not wait past the grace
        // period for a slow peer.
        let deadline = Instant::now() + drain_grace;
        while let Ok(frame) = channels.frames.try_recv() {
            let bytes: Vec<u8> = frame.as_ref().clone();
            let send = sink.send(WsMessage::Binary(bytes.into()));
            match tokio::time::timeout_at(deadline, send).await {
                Ok(Ok(())) => {}
                _ => break,
            }
        }
    }

    let frame = CloseFrame {
        code: WsCloseCode::from(code.wire_code()),
        reason: reason.into(),
    };
    let _ = sink.send(WsMessage::Close(Some(frame))).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_send_enqueues() {
        let (conn, mut channels) = Connection::new(4);
        conn.send(Arc::new(vec![1, 2, 3]));
        assert_eq!(conn.queued_frames(), 1);

        let frame = channels.frames.recv().await.unwrap();
        assert_eq!(*frame, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_overflow_closes_slow_consumer() {
        let (conn, mut channels) = Connection::new(2);
        conn.send(Arc::new(vec![1]));
        conn.send(Arc::new(vec![2]));
        assert!(conn.is_open());

        // Third frame overflows the queue.
        conn.send(Arc::new(vec![3]));
        assert_eq!(conn.state(), ConnectionState::Closing);
        let (code, _) = channels.control.recv().await.unwrap();
        assert_eq!(code, CloseCode::SlowConsumer);
    }

    #[tokio::test]
    async fn test_close_idempotent() {
        let (conn, mut channels) = Connection::new(4);
        conn.close(CloseCode::ProtocolError, "bad frame");
        conn.close(CloseCode::Normal, "later");
        conn.close(CloseCode::SlowConsumer, "even later");

        // Only the first close reaches the writer.
        let (code, reason) = channels.control.recv().await.unwrap();
        assert_eq!(code, CloseCode::ProtocolError);
        assert_eq!(reason, "bad frame");
        assert!(channels.control.try_recv().is_err());
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn test_send_after_close_dropped() {
        let (conn, mut channels) = Connection::new(4);
        conn.close(CloseCode::Normal, "done");
        conn.send(Arc::new(vec![9]));
        assert!(channels.frames.try_recv().is_err());
    }

    #[test]
    fn test_attachment_set() {
        let (conn, _channels) = Connection::new(4);
        assert!(conn.attach("a", AuthScope::Write));
        assert!(!conn.attach("a", AuthScope::Write)); // once per name
        assert!(conn.attach("b", AuthScope::ReadOnly));

        assert!(conn.is_attached("a"));
        assert_eq!(conn.scope("b"), Some(AuthScope::ReadOnly));
        assert_eq!(conn.attached_documents().len(), 2);

        assert!(conn.detach("a"));
        assert!(!conn.detach("a"));
        assert!(!conn.is_attached("a"));
    }

    #[test]
    fn test_close_code_wire_values() {
        assert_eq!(CloseCode::Normal.wire_code(), 1000);
        assert_eq!(CloseCode::ProtocolError.wire_code(), 4400);
        assert_eq!(CloseCode::AuthDenied.wire_code(), 4401);
        assert_eq!(CloseCode::SlowConsumer.wire_code(), 4408);
        assert_eq!(CloseCode::LoadFailure.wire_code(), 4500);
        assert_eq!(CloseCode::StorageFailure.wire_code(), 4501);
    }

    #[test]
    fn test_connection_ids_distinct() {
        let (a, _ca) = Connection::new(1);
        let (b, _cb) = Connection::new(1);
        assert_ne!(a.id(), b.id());
    }
}
