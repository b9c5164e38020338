//! Authoritative per-document state and the sync engine.
//!
//! One `Document` per name:
//!
//! ```text
//! Connection A ──┐
//!                ├── Document ── replica (CRDT authority)
//! Connection B ──┘      │
//!                       ├── pending_updates ── persist coalescer ── Storage
//!                       └── fanout (origin elided)
//! ```
//!
//! A single logical lock guards the replica, the pending-update log, the
//! last-persisted version vector, and the connection set; per-document
//! operations serialize, documents proceed in parallel. The only
//! suspension taken while holding the lock is the persistence hook itself.
//!
//! Persistence is coalesced: the first update after a quiescent period
//! arms a debounce window (default 2 s) with a hard deadline (default
//! 10 s); a persist failure retries with exponential backoff until the
//! budget (3 × the hard deadline) is spent, after which the document is
//! destroyed and its connections closed with `StorageFailure`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::connection::{CloseCode, Connection, ConnectionId};
use crate::engine::{Replica, ReplicaFactory, VersionVector};
use crate::protocol::Message;
use crate::storage::{Storage, StorageError};

/// Persistence coalescing knobs.
#[derive(Debug, Clone)]
pub struct PersistOptions {
    /// Quiet window after the last update before a persist fires.
    pub debounce: Duration,
    /// Hard deadline: a persist fires at most this long after the first
    /// unpersisted update, however busy the document stays.
    pub max_debounce: Duration,
}

impl Default for PersistOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(2000),
            max_debounce: Duration::from_millis(10_000),
        }
    }
}

/// Server-side observer invoked after every accepted client update.
pub type UpdateHook = Arc<dyn Fn(&str, Option<ConnectionId>, &[u8]) + Send + Sync>;

/// Predicate selecting connections for an out-of-band push.
pub type ConnectionPredicate<'a> = &'a (dyn Fn(&Connection) -> bool + Send + Sync);

struct DocState {
    connections: HashMap<ConnectionId, Arc<Connection>>,
    /// Updates accepted since the last successful persist.
    pending_updates: Vec<Vec<u8>>,
    /// Version vector captured at the last successful persist. Monotonic.
    last_persisted_vv: VersionVector,
    /// When the current dirty period began; `None` while quiescent.
    dirty_since: Option<Instant>,
    last_update_at: Instant,
}

/// Authoritative state for one named document.
pub struct Document {
    name: String,
    replica: Arc<dyn Replica>,
    storage: Arc<dyn Storage>,
    opts: PersistOptions,
    state: Mutex<DocState>,
    dirty: Arc<Notify>,
    destroyed: AtomicBool,
    update_hook: Option<UpdateHook>,
}

impl Document {
    /// Hydrate a document from storage and start its persist task.
    ///
    /// The load is bounded by `load_timeout`; a hook failure, timeout, or
    /// unimportable stored blob fails the load and the document is never
    /// registered.
    pub(crate) async fn load(
        name: String,
        factory: &ReplicaFactory,
        storage: Arc<dyn Storage>,
        opts: PersistOptions,
        load_timeout: Duration,
        update_hook: Option<UpdateHook>,
    ) -> Result<Arc<Self>, StorageError> {
        let source = tokio::time::timeout(load_timeout, storage.load_document(&name))
            .await
            .map_err(|_| StorageError::Backend(format!("load of '{name}' timed out")))??;

        let replica = factory();
        for blob in source.into_blobs() {
            if blob.is_empty() {
                continue;
            }
            replica.import(&blob).map_err(|e| {
                StorageError::Backend(format!("stored blob for '{name}' rejected: {e}"))
            })?;
        }
        let last_persisted_vv = replica.version();
        log::info!("document '{name}': loaded at version {}", last_persisted_vv.to_json());

        let doc = Arc::new(Self {
            name,
            replica,
            storage,
            opts,
            state: Mutex::new(DocState {
                connections: HashMap::new(),
                pending_updates: Vec::new(),
                last_persisted_vv,
                dirty_since: None,
                last_update_at: Instant::now(),
            }),
            dirty: Arc::new(Notify::new()),
            destroyed: AtomicBool::new(false),
            update_hook,
        });
        doc.spawn_persist_task();
        Ok(doc)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The authoritative replica's current version vector.
    pub fn version(&self) -> VersionVector {
        self.replica.version()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Add a connection to the fanout set.
    pub async fn attach(&self, conn: Arc<Connection>) {
        let mut st = self.state.lock().await;
        st.connections.insert(conn.id(), conn);
    }

    /// Remove a connection from the fanout set.
    pub async fn detach(&self, conn: ConnectionId) {
        let mut st = self.state.lock().await;
        st.connections.remove(&conn);
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending_updates.len()
    }

    /// Unload is allowed only with no connections and nothing unpersisted.
    pub async fn eligible_for_unload(&self) -> bool {
        let st = self.state.lock().await;
        st.connections.is_empty() && st.pending_updates.is_empty()
    }

    /// Apply one client update, relay it to every other connection, and
    /// arm the persist coalescer. `origin` is `None` for updates the
    /// server itself introduces, which then fan out to every connection.
    pub async fn handle_client_update(&self, update: Vec<u8>, origin: Option<ConnectionId>) {
        if self.is_destroyed() {
            return;
        }
        let frame = Arc::new(
            Message::Update {
                doc: self.name.clone(),
                update: update.clone(),
            }
            .encode(),
        );
        {
            let mut st = self.state.lock().await;
            match self.replica.import(&update) {
                Ok(status) => {
                    if status.pending {
                        log::debug!(
                            "document '{}': update parked awaiting dependencies",
                            self.name
                        );
                    }
                }
                // Import errors are not fatal: peers may hold the
                // dependencies this replica lacks, so the update still
                // ships to them and to storage.
                Err(e) => log::warn!("document '{}': {e}; relaying anyway", self.name),
            }
            st.pending_updates.push(update.clone());

            for (id, conn) in &st.connections {
                if Some(*id) != origin {
                    conn.send(frame.clone());
                }
            }

            let now = Instant::now();
            if st.dirty_since.is_none() {
                st.dirty_since = Some(now);
            }
            st.last_update_at = now;
        }
        self.dirty.notify_one();

        if let Some(hook) = &self.update_hook {
            hook(&self.name, origin, &update);
        }
    }

    /// Answer an initial-sync request: diff the replica against the
    /// sender's version vector and reply to the origin only.
    ///
    /// An empty or unparsable descriptor reads as "sender has nothing"
    /// and is served the full update set.
    pub async fn handle_sync_request(&self, version_json: &str, origin: &Connection) {
        let from = if version_json.is_empty() {
            VersionVector::new()
        } else {
            match VersionVector::from_json(version_json) {
                Ok(vv) => vv,
                Err(e) => {
                    log::warn!(
                        "document '{}': unparsable version vector ({e}); serving full sync",
                        self.name
                    );
                    VersionVector::new()
                }
            }
        };

        let updates = {
            let _st = self.state.lock().await;
            match self.replica.export_from(&from) {
                Ok(updates) => updates,
                Err(e) => {
                    log::error!("document '{}': {e}", self.name);
                    Vec::new()
                }
            }
        };

        log::debug!(
            "document '{}': sync request from {} answered with {} update(s)",
            self.name,
            origin.id(),
            updates.len()
        );
        origin.send_message(&Message::SyncBatch {
            doc: self.name.clone(),
            updates,
        });
    }

    /// Relay an ephemeral delta to every other connection. Ephemeral
    /// payloads never reach the replica or the persistence pipeline.
    pub async fn handle_ephemeral(&self, delta: Vec<u8>, origin: Option<ConnectionId>) {
        let frame = Arc::new(
            Message::Ephemeral {
                doc: self.name.clone(),
                delta,
            }
            .encode(),
        );
        let st = self.state.lock().await;
        for (id, conn) in &st.connections {
            if Some(*id) != origin {
                conn.send(frame.clone());
            }
        }
    }

    /// Out-of-band server push to the subset of connections matching
    /// `predicate` (all of them when `None`).
    pub async fn broadcast_stateless(
        &self,
        frame: Arc<Vec<u8>>,
        predicate: Option<ConnectionPredicate<'_>>,
    ) -> usize {
        let st = self.state.lock().await;
        let mut sent = 0;
        for conn in st.connections.values() {
            if predicate.map_or(true, |keep| keep(conn)) {
                conn.send(frame.clone());
                sent += 1;
            }
        }
        sent
    }

    /// Persist everything unpersisted, now. One attempt, no backoff; used
    /// by unload and shutdown. A no-op while clean.
    pub async fn flush(&self) -> Result<(), StorageError> {
        self.persist_once().await
    }

    async fn persist_once(&self) -> Result<(), StorageError> {
        let mut st = self.state.lock().await;
        if st.pending_updates.is_empty() {
            st.dirty_since = None;
            return Ok(());
        }
        let from = st.last_persisted_vv.clone();
        let updates = self
            .replica
            .export_from(&from)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let mut stored = 0usize;
        for blob in &updates {
            if blob.is_empty() {
                continue;
            }
            // The one permitted suspension under the document lock.
            self.storage.store_document(&self.name, blob).await?;
            stored += 1;
        }

        let version = self.replica.version();
        st.last_persisted_vv.merge(&version);
        st.pending_updates.clear();
        st.dirty_since = None;
        log::debug!(
            "document '{}': persisted {stored} blob(s) at {}",
            self.name,
            version.to_json()
        );
        Ok(())
    }

    fn spawn_persist_task(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let dirty = self.dirty.clone();
        tokio::spawn(async move {
            loop {
                dirty.notified().await;
                let Some(doc) = Weak::upgrade(&weak) else {
                    break;
                };
                if doc.is_destroyed() {
                    break;
                }
                doc.run_persist_cycle().await;
                if doc.is_destroyed() {
                    break;
                }
            }
        });
    }

    /// Wait out the coalescing window, then persist with bounded retry.
    async fn run_persist_cycle(&self) {
        loop {
            let deadline = {
                let st = self.state.lock().await;
                match st.dirty_since {
                    None => return, // flushed concurrently
                    Some(since) => {
                        let soft = st.last_update_at + self.opts.debounce;
                        let hard = since + self.opts.max_debounce;
                        soft.min(hard)
                    }
                }
            };
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep_until(deadline).await;
        }

        let budget = self.opts.max_debounce * 3;
        let started = Instant::now();
        let mut delay = self.opts.debounce.max(Duration::from_millis(50));
        loop {
            let err = match self.persist_once().await {
                Ok(()) => return,
                Err(e) => e,
            };
            log::warn!("document '{}': persist failed: {err}; retrying", self.name);
            if started.elapsed() + delay > budget {
                self.fatal_storage_failure(&err).await;
                return;
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(self.opts.max_debounce);
        }
    }

    /// The retry budget is spent: destroy the document and cut loose
    /// every attached connection.
    async fn fatal_storage_failure(&self, err: &StorageError) {
        log::error!(
            "document '{}': persistence retries exhausted ({err}); destroying",
            self.name
        );
        self.destroyed.store(true, Ordering::Release);
        let connections: Vec<Arc<Connection>> = {
            let mut st = self.state.lock().await;
            st.connections.drain().map(|(_, conn)| conn).collect()
        };
        for conn in connections {
            conn.detach(&self.name);
            conn.close(CloseCode::StorageFailure, "document storage failed");
        }
    }
}

impl Drop for Document {
    fn drop(&mut self) {
        // Wake the persist task so it observes the dropped document.
        self.dirty.notify_waiters();
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("name", &self.name)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
