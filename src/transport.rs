//! Shared client-side WebSocket transport.
//!
//! One socket carries any number of providers, each addressable by the
//! document name on the envelope:
//!
//! ```text
//! Provider("notes")  ──┐
//! Provider("tasks")  ──┼── SharedTransport ── WebSocket ── hub
//! Provider("board")  ──┘        │
//!                               └── inbound frames routed by name
//! ```
//!
//! The transport is reference-counted by its providers: the first provider
//! creates it, the last one to unregister destroys it. Lifecycle is a
//! fixed set of typed events ([`TransportEvent`]), not free-form names.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::protocol::{Direction, FrameLimits, Message};

/// Socket status as the providers see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// Typed lifecycle events, re-emitted to every provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The socket finished its handshake and is writable.
    Open,
    /// Status changed (also emitted alongside Open/Close).
    Status(TransportStatus),
    /// The socket closed or failed.
    Close,
    /// The transport was destroyed; no further events follow.
    Destroy,
}

/// Transport failures.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// The WebSocket connect failed.
    Connect(String),
    /// A provider for this document name is already registered on the
    /// socket (one provider per (document, socket) pair).
    DuplicateProvider(String),
    /// The transport was already destroyed.
    Destroyed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Connect(e) => write!(f, "websocket connect failed: {e}"),
            TransportError::DuplicateProvider(doc) => {
                write!(f, "provider already registered for '{doc}'")
            }
            TransportError::Destroyed => write!(f, "transport destroyed"),
        }
    }
}

impl std::error::Error for TransportError {}

enum Outbound {
    Frame(Vec<u8>),
    Shutdown,
}

/// A WebSocket shared by multiple providers.
pub struct SharedTransport {
    url: String,
    out_tx: mpsc::Sender<Outbound>,
    events: broadcast::Sender<TransportEvent>,
    routes: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Message>>>>,
    status: Arc<Mutex<TransportStatus>>,
    refs: AtomicUsize,
    destroyed: AtomicBool,
}

impl SharedTransport {
    /// Connect to the hub and spawn the reader/writer tasks.
    pub async fn connect(url: &str) -> Result<Arc<Self>, TransportError> {
        let (ws, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        log::info!("transport connected to {url}");
        let (mut sink, mut stream) = ws.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(256);
        let (events, _) = broadcast::channel(64);
        let routes: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Message>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let status = Arc::new(Mutex::new(TransportStatus::Connected));

        // Writer: forward outbound frames until shutdown.
        tokio::spawn(async move {
            while let Some(outbound) = out_rx.recv().await {
                match outbound {
                    Outbound::Frame(frame) => {
                        if sink.send(WsMessage::Binary(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    Outbound::Shutdown => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        break;
                    }
                }
            }
        });

        // Reader: decode server frames and route them by document name.
        let reader_routes = routes.clone();
        let reader_status = status.clone();
        let reader_events = events.clone();
        let limits = FrameLimits::default();
        tokio::spawn(async move {
            while let Some(next) = stream.next().await {
                match next {
                    Ok(WsMessage::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let message =
                            match Message::decode(&bytes, Direction::ServerToClient, &limits) {
                                Ok(message) => message,
                                Err(e) => {
                                    log::warn!("transport: undecodable server frame: {e}");
                                    continue;
                                }
                            };
                        let route = {
                            let routes = reader_routes.lock().unwrap();
                            routes.get(message.doc()).cloned()
                        };
                        match route {
                            Some(inbound) => {
                                let _ = inbound.send(message);
                            }
                            None => log::debug!(
                                "transport: frame for unregistered document '{}'",
                                message.doc()
                            ),
                        }
                    }
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            *reader_status.lock().unwrap() = TransportStatus::Disconnected;
            let _ = reader_events.send(TransportEvent::Status(TransportStatus::Disconnected));
            let _ = reader_events.send(TransportEvent::Close);
            log::info!("transport disconnected");
        });

        Ok(Arc::new(Self {
            url: url.to_owned(),
            out_tx,
            events,
            routes,
            status,
            refs: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
        }))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> TransportStatus {
        *self.status.lock().unwrap()
    }

    /// Subscribe to lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    /// Providers currently registered.
    pub fn provider_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Claim the document name for a provider and take a reference.
    pub(crate) fn register(
        &self,
        doc: &str,
        inbound: mpsc::UnboundedSender<Message>,
    ) -> Result<(), TransportError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(TransportError::Destroyed);
        }
        let mut routes = self.routes.lock().unwrap();
        if routes.contains_key(doc) {
            return Err(TransportError::DuplicateProvider(doc.to_owned()));
        }
        routes.insert(doc.to_owned(), inbound);
        self.refs.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Drop a provider's registration; the last one out destroys the
    /// transport.
    pub(crate) fn unregister(&self, doc: &str) {
        let removed = self.routes.lock().unwrap().remove(doc).is_some();
        if removed && self.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.destroy();
        }
    }

    /// Enqueue a frame. Never blocks; a full queue drops the frame (the
    /// force-sync cycle repairs any gap).
    pub fn send_frame(&self, frame: Vec<u8>) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        match self.out_tx.try_send(Outbound::Frame(frame)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("transport: outbound queue full, frame dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Encode and enqueue a protocol message.
    pub fn send_message(&self, message: &Message) {
        self.send_frame(message.encode());
    }

    /// Close the socket and end both tasks. Idempotent.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("transport to {} destroyed", self.url);
        *self.status.lock().unwrap() = TransportStatus::Disconnected;
        let _ = self.out_tx.try_send(Outbound::Shutdown);
        let _ = self.events.send(TransportEvent::Destroy);
    }
}

impl fmt::Debug for SharedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedTransport")
            .field("url", &self.url)
            .field("status", &self.status())
            .field("providers", &self.provider_count())
            .finish()
    }
}
