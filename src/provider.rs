//! The client-side provider: one per (document, socket) pair.
//!
//! A provider binds a local replica to a document name on a shared
//! transport:
//!
//! ```text
//! replica.subscribe_local_updates ──► LoroUpdate ──► transport
//! ephemeral.subscribe_local_updates ─► LoroEphemeral ─► transport
//!
//! transport ──► LoroUpdate      ──► replica.import
//!           ──► LoroSyncBatch   ──► replica.import × N, in order
//!           ──► LoroEphemeral   ──► ephemeral.apply
//!           ──► Auth reply      ──► ProviderEvent::AuthResult
//! ```
//!
//! On every socket open the provider fetches its token (value or
//! producer), sends `Auth` when one is available, then sends a
//! `LoroSyncRequest` carrying its replica's version vector. A periodic
//! force-sync reissues the request to keep the pipeline warm and recover
//! from silent gaps; `None` disables it.
//!
//! `detach` stops outbound traffic without tearing anything down;
//! `destroy` cancels the timers, releases every subscription exactly
//! once, and drops the transport reference. Both are idempotent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::auth::AuthToken;
use crate::engine::Replica;
use crate::ephemeral::EphemeralStore;
use crate::protocol::{AuthCode, Message};
use crate::transport::{SharedTransport, TransportError, TransportEvent, TransportStatus};

/// Provider construction options.
#[derive(Clone)]
pub struct ProviderOptions {
    /// Client token source for per-document admission.
    pub token: AuthToken,
    /// Cadence of the keep-alive resync; `None` disables it.
    pub force_sync_interval: Option<Duration>,
    /// Ephemeral store whose local updates ride this provider.
    pub ephemeral: Option<Arc<dyn EphemeralStore>>,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            token: AuthToken::None,
            force_sync_interval: Some(Duration::from_millis(15_000)),
            ephemeral: None,
        }
    }
}

impl std::fmt::Debug for ProviderOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderOptions")
            .field("token", &self.token)
            .field("force_sync_interval", &self.force_sync_interval)
            .field("ephemeral", &self.ephemeral.is_some())
            .finish()
    }
}

/// Typed events surfaced to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    /// The transport opened and the handshake was sent.
    Connected,
    /// The transport closed.
    Disconnected,
    /// The server answered an `Auth` frame.
    AuthResult { code: AuthCode, reason: String },
    /// A sync batch was applied to the replica.
    BatchApplied { updates: usize },
}

/// Client-side document provider.
pub struct Provider {
    doc: String,
    replica: Arc<dyn Replica>,
    transport: Arc<SharedTransport>,
    token: AuthToken,
    attached: Arc<AtomicBool>,
    destroyed: AtomicBool,
    subscriptions: Mutex<Vec<crate::engine::LocalSubscription>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    event_rx: Mutex<Option<mpsc::Receiver<ProviderEvent>>>,
}

impl Provider {
    /// Wire a provider onto the transport and start its tasks.
    ///
    /// Fails if the transport is destroyed or already carries a provider
    /// for this document name.
    pub fn new(
        doc: impl Into<String>,
        replica: Arc<dyn Replica>,
        transport: Arc<SharedTransport>,
        options: ProviderOptions,
    ) -> Result<Arc<Self>, TransportError> {
        let doc = doc.into();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        transport.register(&doc, inbound_tx)?;

        let (event_tx, event_rx) = mpsc::channel(256);
        let provider = Arc::new(Self {
            doc,
            replica,
            transport,
            token: options.token.clone(),
            attached: Arc::new(AtomicBool::new(true)),
            destroyed: AtomicBool::new(false),
            subscriptions: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            event_rx: Mutex::new(Some(event_rx)),
        });
        provider.wire(inbound_rx, event_tx, &options);
        Ok(provider)
    }

    /// Convenience: connect a fresh transport and put one provider on it.
    pub async fn connect(
        url: &str,
        doc: impl Into<String>,
        replica: Arc<dyn Replica>,
        options: ProviderOptions,
    ) -> Result<Arc<Self>, TransportError> {
        let transport = SharedTransport::connect(url).await?;
        Self::new(doc, replica, transport, options)
    }

    pub fn doc(&self) -> &str {
        &self.doc
    }

    pub fn replica(&self) -> &Arc<dyn Replica> {
        &self.replica
    }

    pub fn transport(&self) -> &Arc<SharedTransport> {
        &self.transport
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// Resume sending after a detach. Idempotent.
    pub fn attach(&self) {
        if !self.destroyed.load(Ordering::Acquire) {
            self.attached.store(true, Ordering::Release);
        }
    }

    /// Stop sending; inbound state keeps applying. Idempotent.
    pub fn detach(&self) {
        self.attached.store(false, Ordering::Release);
    }

    /// Take the event stream (first caller only).
    pub fn take_events(&self) -> Option<mpsc::Receiver<ProviderEvent>> {
        self.event_rx.lock().unwrap().take()
    }

    /// Reissue the sync request now.
    pub fn sync_now(&self) {
        self.send_sync_request();
    }

    /// Tear the provider down: cancel timers, release subscriptions
    /// exactly once, detach, and drop the transport reference. Idempotent.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.attached.store(false, Ordering::Release);
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        for subscription in self.subscriptions.lock().unwrap().drain(..) {
            subscription.unsubscribe();
        }
        self.transport.unregister(&self.doc);
        log::debug!("provider for '{}' destroyed", self.doc);
    }

    fn wire(
        self: &Arc<Self>,
        mut inbound_rx: mpsc::UnboundedReceiver<Message>,
        event_tx: mpsc::Sender<ProviderEvent>,
        options: &ProviderOptions,
    ) {
        // Local CRDT updates → LoroUpdate frames. The closure owns plain
        // parts, not the provider, so destroy() can drop it cleanly.
        let outbound = OutboundHandle {
            doc: self.doc.clone(),
            transport: self.transport.clone(),
            attached: self.attached.clone(),
        };
        let updates_out = outbound.clone();
        let sub = self.replica.subscribe_local_updates(Box::new(move |update| {
            updates_out.send(Message::Update {
                doc: updates_out.doc.clone(),
                update: update.to_vec(),
            });
        }));
        self.subscriptions.lock().unwrap().push(sub);

        // Local ephemeral updates → LoroEphemeral frames.
        if let Some(store) = &options.ephemeral {
            let ephemeral_out = outbound.clone();
            let sub = store.subscribe_local_updates(Box::new(move |delta| {
                ephemeral_out.send(Message::Ephemeral {
                    doc: ephemeral_out.doc.clone(),
                    delta: delta.to_vec(),
                });
            }));
            self.subscriptions.lock().unwrap().push(sub);
        }

        let mut tasks = self.tasks.lock().unwrap();

        // Tasks hold the provider weakly so dropping the last handle is
        // enough to wind everything down even without destroy().

        // Inbound dispatch.
        {
            let weak = Arc::downgrade(self);
            let events = event_tx.clone();
            let ephemeral = options.ephemeral.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(message) = inbound_rx.recv().await {
                    let Some(provider) = weak.upgrade() else { break };
                    provider.dispatch(message, &events, ephemeral.as_deref());
                }
            }));
        }

        // Lifecycle: handshake on open (or right away if already open).
        {
            let weak = Arc::downgrade(self);
            let events = event_tx.clone();
            let mut lifecycle = self.transport.events();
            let already_open = self.transport.status() == TransportStatus::Connected;
            tasks.push(tokio::spawn(async move {
                if already_open {
                    let Some(provider) = weak.upgrade() else { return };
                    provider.handshake().await;
                    let _ = events.send(ProviderEvent::Connected).await;
                }
                loop {
                    match lifecycle.recv().await {
                        Ok(TransportEvent::Open) => {
                            let Some(provider) = weak.upgrade() else { break };
                            provider.handshake().await;
                            let _ = events.send(ProviderEvent::Connected).await;
                        }
                        Ok(TransportEvent::Close) => {
                            let _ = events.send(ProviderEvent::Disconnected).await;
                        }
                        Ok(TransportEvent::Destroy) => break,
                        Ok(TransportEvent::Status(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("provider: lagged {n} lifecycle events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));
        }

        // Force-sync ticker.
        if let Some(every) = options.force_sync_interval {
            let weak = Arc::downgrade(self);
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await; // immediate first tick; handshake covers it
                loop {
                    ticker.tick().await;
                    let Some(provider) = weak.upgrade() else { break };
                    provider.send_sync_request();
                }
            }));
        }
    }

    /// Token fetch, `Auth`, then the initial sync request.
    async fn handshake(&self) {
        if let Some(token) = self.token.resolve().await {
            self.send(Message::Auth {
                doc: self.doc.clone(),
                token,
            });
        }
        self.send_sync_request();
    }

    fn send_sync_request(&self) {
        let vv = self.replica.version();
        let version = if vv.is_empty() { String::new() } else { vv.to_json() };
        self.send(Message::SyncRequest {
            doc: self.doc.clone(),
            version,
        });
    }

    fn send(&self, message: Message) {
        if self.is_attached() && !self.destroyed.load(Ordering::Acquire) {
            self.transport.send_message(&message);
        }
    }

    fn dispatch(
        &self,
        message: Message,
        events: &mpsc::Sender<ProviderEvent>,
        ephemeral: Option<&dyn EphemeralStore>,
    ) {
        match message {
            Message::Update { update, .. } => {
                if let Err(e) = self.replica.import(&update) {
                    log::warn!("provider '{}': {e}", self.doc);
                }
            }
            Message::SyncBatch { updates, .. } => {
                let count = updates.len();
                for update in updates {
                    if let Err(e) = self.replica.import(&update) {
                        log::warn!("provider '{}': batch {e}", self.doc);
                    }
                }
                let _ = events.try_send(ProviderEvent::BatchApplied { updates: count });
            }
            Message::Ephemeral { delta, .. } => match ephemeral {
                Some(store) => store.apply(&delta),
                None => log::debug!(
                    "provider '{}': ephemeral frame with no store attached",
                    self.doc
                ),
            },
            Message::AuthReply { code, reason, .. } => {
                if code == AuthCode::PermissionDenied {
                    log::warn!("provider '{}': admission denied: {reason}", self.doc);
                }
                let _ = events.try_send(ProviderEvent::AuthResult { code, reason });
            }
            // The server never sends these; drop quietly.
            Message::Auth { .. } | Message::SyncRequest { .. } => {}
        }
    }
}

impl Drop for Provider {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        if !self.destroyed.swap(true, Ordering::AcqRel) {
            self.transport.unregister(&self.doc);
        }
    }
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("doc", &self.doc)
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// The plain parts the outbound closures capture.
#[derive(Clone)]
struct OutboundHandle {
    doc: String,
    transport: Arc<SharedTransport>,
    attached: Arc<AtomicBool>,
}

impl OutboundHandle {
    fn send(&self, message: Message) {
        if self.attached.load(Ordering::Acquire) {
            self.transport.send_message(&message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_defaults() {
        let options = ProviderOptions::default();
        assert!(matches!(options.token, AuthToken::None));
        assert_eq!(
            options.force_sync_interval,
            Some(Duration::from_millis(15_000))
        );
        assert!(options.ephemeral.is_none());
    }

    #[test]
    fn test_disabling_force_sync() {
        let options = ProviderOptions {
            force_sync_interval: None,
            ..ProviderOptions::default()
        };
        assert!(options.force_sync_interval.is_none());
    }
}
