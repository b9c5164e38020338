//! The WebSocket hub server.
//!
//! ```text
//! Client A ──┐
//!            ├── Connection ── Document (per name) ── Replica
//! Client B ──┘       │              │
//!                    │              ├── fanout to siblings (origin elided)
//!                    │              └── persist coalescer ── Storage
//!                    └── per-document admission (Authenticator)
//! ```
//!
//! Each accepted socket gets one reader task (this module) and one writer
//! task (`connection::run_writer`). The reader decodes envelopes once and
//! dispatches by document name; the first `Auth` or first `LoroSyncRequest`
//! for a name triggers the admission check for that attachment. A socket
//! multiplexes any number of documents; a denied or failed attachment
//! never takes down the others, except for load failures and storage
//! failures, which close the socket with their own codes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::auth::{AllowAll, AuthDecision, AuthScope, Authenticator};
use crate::connection::{run_writer, CloseCode, Connection, ConnectionId, ConnectionState};
use crate::document::{ConnectionPredicate, Document, PersistOptions, UpdateHook};
use crate::engine::{loro_replica_factory, ReplicaFactory};
use crate::protocol::{AuthCode, Direction, FrameLimits, Message};
use crate::registry::{DocumentRegistry, RegistryOptions};
use crate::storage::{MemoryStorage, Storage, StorageError};

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Inbound framing limits (name length, frame size).
    pub limits: FrameLimits,
    /// Per-connection outbound queue bound.
    pub outbound_queue_limit: usize,
    /// Persistence coalescing windows.
    pub persist: PersistOptions,
    /// Registry load/unload timing.
    pub registry: RegistryOptions,
    /// How long a normal closure may spend draining the outbound queue.
    pub drain_grace: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            limits: FrameLimits::default(),
            outbound_queue_limit: 256,
            persist: PersistOptions::default(),
            registry: RegistryOptions::default(),
            drain_grace: Duration::from_secs(5),
        }
    }
}

/// Point-in-time server statistics.
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub auth_denials: u64,
    pub protocol_errors: u64,
    pub documents_live: usize,
}

/// Lock-free counters; read via snapshot.
#[derive(Default)]
struct AtomicStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_frames: AtomicU64,
    total_bytes: AtomicU64,
    auth_denials: AtomicU64,
    protocol_errors: AtomicU64,
}

impl AtomicStats {
    fn snapshot(&self, documents_live: usize) -> HubStats {
        HubStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_frames: self.total_frames.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            auth_denials: self.auth_denials.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            documents_live,
        }
    }
}

/// The collaboration hub server.
pub struct HubServer {
    config: HubConfig,
    registry: Arc<DocumentRegistry>,
    authenticator: Arc<dyn Authenticator>,
    stats: Arc<AtomicStats>,
    connections: Arc<Mutex<HashMap<ConnectionId, Arc<Connection>>>>,
    stopping: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl HubServer {
    /// Create a hub from its parts.
    pub fn with_parts(
        config: HubConfig,
        storage: Arc<dyn Storage>,
        factory: ReplicaFactory,
        authenticator: Arc<dyn Authenticator>,
        update_hook: Option<UpdateHook>,
    ) -> Self {
        let registry = DocumentRegistry::new(
            factory,
            storage,
            config.persist.clone(),
            config.registry.clone(),
            update_hook,
        );
        Self {
            config,
            registry,
            authenticator,
            stats: Arc::new(AtomicStats::default()),
            connections: Arc::new(Mutex::new(HashMap::new())),
            stopping: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// A hub with the given config, loro replicas, in-memory storage, and
    /// an allow-all admission policy.
    pub fn new(config: HubConfig) -> Self {
        Self::with_parts(
            config,
            Arc::new(MemoryStorage::new()),
            loro_replica_factory(),
            Arc::new(AllowAll),
            None,
        )
    }

    /// A hub with entirely default configuration.
    pub fn with_defaults() -> Self {
        Self::new(HubConfig::default())
    }

    /// A hub with default config except for the persistence backend.
    pub fn with_storage(config: HubConfig, storage: Arc<dyn Storage>) -> Self {
        Self::with_parts(
            config,
            storage,
            loro_replica_factory(),
            Arc::new(AllowAll),
            None,
        )
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> HubStats {
        self.stats.snapshot(self.registry.len())
    }

    /// Accept connections until [`shutdown`](Self::shutdown) is called.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("hub listening on {}", self.config.bind_addr);

        loop {
            if self.stopping.load(Ordering::Acquire) {
                break;
            }
            tokio::select! {
                _ = self.shutdown.notified() => break,
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("tcp connection from {addr}");
                    let ctx = ConnectionContext {
                        config: self.config.clone(),
                        registry: self.registry.clone(),
                        authenticator: self.authenticator.clone(),
                        stats: self.stats.clone(),
                        connections: self.connections.clone(),
                    };
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, ctx).await {
                            log::error!("connection error from {addr}: {e}");
                        }
                    });
                }
            }
        }

        self.drain().await;
        Ok(())
    }

    /// Stop accepting, flush every dirty document once, and close all
    /// connections with a normal code.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::Release);
        self.shutdown.notify_one();
    }

    async fn drain(&self) {
        log::info!("hub shutting down");
        self.registry.flush_all().await;
        let connections: Vec<Arc<Connection>> = {
            let mut map = self.connections.lock().unwrap();
            map.drain().map(|(_, conn)| conn).collect()
        };
        for conn in connections {
            conn.close(CloseCode::Normal, "server shutdown");
        }
    }

    /// Introduce an update from the server itself (an admin API or a
    /// reload); the origin is nobody, so it fans out to every attachment.
    pub async fn apply_update(&self, name: &str, update: Vec<u8>) -> Result<(), StorageError> {
        let doc = self.registry.acquire(name).await?;
        doc.handle_client_update(update, None).await;
        self.registry.release(name);
        Ok(())
    }

    /// Out-of-band push to the connections of a live document matching
    /// `predicate`. Returns how many connections were addressed; zero when
    /// the document is not loaded.
    pub async fn broadcast_stateless(
        &self,
        name: &str,
        message: &Message,
        predicate: Option<ConnectionPredicate<'_>>,
    ) -> usize {
        match self.registry.peek(name) {
            Some(doc) => {
                doc.broadcast_stateless(Arc::new(message.encode()), predicate)
                    .await
            }
            None => 0,
        }
    }
}

struct ConnectionContext {
    config: HubConfig,
    registry: Arc<DocumentRegistry>,
    authenticator: Arc<dyn Authenticator>,
    stats: Arc<AtomicStats>,
    connections: Arc<Mutex<HashMap<ConnectionId, Arc<Connection>>>>,
}

enum Admission {
    Attached(Arc<Document>),
    Denied,
    LoadFailed,
}

/// Run the admission check for one (connection, document) pair and attach
/// on success. `token` is `None` when a sync request arrived first.
async fn admit(
    ctx: &ConnectionContext,
    conn: &Arc<Connection>,
    doc: &str,
    token: Option<&str>,
) -> Admission {
    match ctx.authenticator.authenticate(doc, token).await {
        AuthDecision::Deny(reason) => {
            log::info!("connection {}: admission to '{doc}' denied: {reason}", conn.id());
            ctx.stats.auth_denials.fetch_add(1, Ordering::Relaxed);
            conn.send_message(&Message::AuthReply {
                doc: doc.to_owned(),
                code: AuthCode::PermissionDenied,
                reason,
            });
            Admission::Denied
        }
        AuthDecision::Allow(scope) => match ctx.registry.acquire(doc).await {
            Ok(document) => {
                document.attach(conn.clone()).await;
                conn.attach(doc, scope);
                log::info!("connection {}: attached to '{doc}' ({scope:?})", conn.id());
                Admission::Attached(document)
            }
            Err(e) => {
                log::error!("connection {}: load of '{doc}' failed: {e}", conn.id());
                conn.close(CloseCode::LoadFailure, "document load failed");
                Admission::LoadFailed
            }
        },
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: ConnectionContext,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (sink, mut frames) = ws.split();

    let (conn, channels) = Connection::new(ctx.config.outbound_queue_limit);
    conn.set_state(ConnectionState::Authenticating);
    ctx.connections.lock().unwrap().insert(conn.id(), conn.clone());
    ctx.stats.total_connections.fetch_add(1, Ordering::Relaxed);
    ctx.stats.active_connections.fetch_add(1, Ordering::Relaxed);
    log::info!("connection {} established from {addr}", conn.id());

    let mut writer = tokio::spawn(run_writer(sink, channels, ctx.config.drain_grace));

    // Documents this socket is attached to, resolved once at admission.
    let mut attachments: HashMap<String, Arc<Document>> = HashMap::new();
    let mut closing = conn.closing_watch();

    loop {
        let next = tokio::select! {
            next = frames.next() => match next {
                Some(next) => next,
                None => break,
            },
            // A locally-requested close (slow consumer, protocol error)
            // must end the reader even while the peer is silent.
            _ = closing.changed() => break,
        };
        match next {
            Ok(WsMessage::Binary(data)) => {
                let bytes: Vec<u8> = data.into();
                ctx.stats.total_frames.fetch_add(1, Ordering::Relaxed);
                ctx.stats
                    .total_bytes
                    .fetch_add(bytes.len() as u64, Ordering::Relaxed);

                let message =
                    match Message::decode(&bytes, Direction::ClientToServer, &ctx.config.limits) {
                        Ok(message) => message,
                        Err(e) => {
                            ctx.stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                            log::warn!("connection {}: {e}", conn.id());
                            conn.close(CloseCode::ProtocolError, &e.to_string());
                            break;
                        }
                    };

                match message {
                    Message::Auth { doc, token } => {
                        if conn.is_attached(&doc) {
                            // Repeat auth for an attached document is
                            // answered, not re-checked.
                            conn.send_message(&Message::AuthReply {
                                doc,
                                code: AuthCode::Authenticated,
                                reason: String::new(),
                            });
                            continue;
                        }
                        match admit(&ctx, &conn, &doc, Some(&token)).await {
                            Admission::Attached(document) => {
                                conn.send_message(&Message::AuthReply {
                                    doc: doc.clone(),
                                    code: AuthCode::Authenticated,
                                    reason: String::new(),
                                });
                                attachments.insert(doc, document);
                                conn.set_state(ConnectionState::Active);
                            }
                            Admission::Denied => {}
                            Admission::LoadFailed => break,
                        }
                    }

                    Message::SyncRequest { doc, version } => {
                        let document = match attachments.get(&doc) {
                            Some(document) => document.clone(),
                            None => {
                                // First contact via sync request: admission
                                // with no token, server policy decides.
                                match admit(&ctx, &conn, &doc, None).await {
                                    Admission::Attached(document) => {
                                        attachments.insert(doc.clone(), document.clone());
                                        conn.set_state(ConnectionState::Active);
                                        document
                                    }
                                    Admission::Denied => continue,
                                    Admission::LoadFailed => break,
                                }
                            }
                        };
                        document.handle_sync_request(&version, &conn).await;
                    }

                    Message::Update { doc, update } => match attachments.get(&doc) {
                        Some(document) if conn.scope(&doc) == Some(AuthScope::Write) => {
                            document.handle_client_update(update, Some(conn.id())).await;
                        }
                        Some(_) => {
                            log::debug!(
                                "connection {}: read-only update for '{doc}' dropped",
                                conn.id()
                            );
                        }
                        None => {
                            // Not fatal to the socket: other documents on
                            // this connection keep working.
                            ctx.stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                            log::warn!(
                                "connection {}: update for unattached '{doc}' dropped",
                                conn.id()
                            );
                        }
                    },

                    Message::Ephemeral { doc, delta } => match attachments.get(&doc) {
                        Some(document) => {
                            document.handle_ephemeral(delta, Some(conn.id())).await;
                        }
                        None => {
                            ctx.stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                            log::warn!(
                                "connection {}: ephemeral for unattached '{doc}' dropped",
                                conn.id()
                            );
                        }
                    },

                    Message::SyncBatch { .. } | Message::AuthReply { .. } => {
                        ctx.stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                        conn.close(CloseCode::ProtocolError, "server-only message kind");
                        break;
                    }
                }
            }

            Ok(WsMessage::Close(_)) => {
                log::info!("connection {} closed by peer", conn.id());
                break;
            }

            // tungstenite answers pings on the next write; nothing to do.
            Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => {}

            Ok(_) => {}

            Err(e) => {
                log::debug!("connection {}: websocket error: {e}", conn.id());
                break;
            }
        }

        if !conn.is_open() {
            break;
        }
    }

    // Cleanup: detach everywhere, release every reference. The writer
    // gets the drain grace to finish its close handshake, then is dropped
    // (a stalled peer must not pin the task).
    conn.close(CloseCode::Normal, "connection closed");
    if tokio::time::timeout(ctx.config.drain_grace, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
    for (name, document) in attachments {
        document.detach(conn.id()).await;
        conn.detach(&name);
        ctx.registry.release(&name);
    }
    ctx.connections.lock().unwrap().remove(&conn.id());
    conn.set_state(ConnectionState::Closed);
    ctx.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    log::info!("connection {} from {addr} cleaned up", conn.id());

    Ok(())
}
