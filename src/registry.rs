//! The document registry: `name → Document` with load-on-demand,
//! reference counting, and idle unload.
//!
//! ```text
//! acquire("notes") ── miss ──► load_document ──► Document (refs = 1)
//!        │                         ▲
//!        └── concurrent acquires coalesce onto the in-flight load
//!
//! release("notes") ── refs = 0 ──► idle timer ──► flush ──► unload
//! ```
//!
//! A document is never unloaded while it has connections (refs > 0) or
//! unpersisted updates; a fired idle timer that finds either condition
//! false simply stands down.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::document::{Document, PersistOptions, UpdateHook};
use crate::engine::ReplicaFactory;
use crate::storage::{Storage, StorageError};

/// Registry timing knobs.
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Idle delay between the last release and eviction.
    pub unload_delay: Duration,
    /// Budget for the load hook before the load fails.
    pub load_timeout: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            unload_delay: Duration::from_millis(30_000),
            load_timeout: Duration::from_secs(30),
        }
    }
}

type LoadWaiter = oneshot::Sender<Result<Arc<Document>, StorageError>>;

enum Slot {
    /// Load in flight; everyone who asked is parked here.
    Loading(Vec<LoadWaiter>),
    Ready(Arc<Document>),
}

struct Entry {
    slot: Slot,
    refs: usize,
}

/// Live documents, keyed by name.
pub struct DocumentRegistry {
    entries: Mutex<HashMap<String, Entry>>,
    factory: ReplicaFactory,
    storage: Arc<dyn Storage>,
    persist: PersistOptions,
    options: RegistryOptions,
    update_hook: Option<UpdateHook>,
}

impl DocumentRegistry {
    pub fn new(
        factory: ReplicaFactory,
        storage: Arc<dyn Storage>,
        persist: PersistOptions,
        options: RegistryOptions,
        update_hook: Option<UpdateHook>,
    ) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            factory,
            storage,
            persist,
            options,
            update_hook,
        })
    }

    /// Fetch (loading if necessary) the document and take a reference.
    ///
    /// Concurrent acquires for the same name share one in-flight load; a
    /// failed load reaches every waiter and leaves the name unregistered.
    pub async fn acquire(self: &Arc<Self>, name: &str) -> Result<Arc<Document>, StorageError> {
        let waiter = {
            let mut entries = self.entries.lock().unwrap();
            // A destroyed document is a corpse; evict it and load fresh.
            let destroyed = matches!(
                entries.get(name),
                Some(Entry {
                    slot: Slot::Ready(doc),
                    ..
                }) if doc.is_destroyed()
            );
            if destroyed {
                entries.remove(name);
            }
            match entries.get_mut(name) {
                Some(entry) => {
                    entry.refs += 1;
                    match &mut entry.slot {
                        Slot::Ready(doc) => return Ok(doc.clone()),
                        Slot::Loading(waiters) => {
                            let (tx, rx) = oneshot::channel();
                            waiters.push(tx);
                            rx
                        }
                    }
                }
                None => {
                    let (tx, rx) = oneshot::channel();
                    entries.insert(
                        name.to_owned(),
                        Entry {
                            slot: Slot::Loading(vec![tx]),
                            refs: 1,
                        },
                    );
                    self.spawn_load(name.to_owned());
                    rx
                }
            }
        };

        match waiter.await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Backend("document load was abandoned".into())),
        }
    }

    /// Drop one reference. At zero the idle unload timer is armed.
    pub fn release(self: &Arc<Self>, name: &str) {
        let arm = {
            let mut entries = self.entries.lock().unwrap();
            match entries.get_mut(name) {
                Some(entry) => {
                    entry.refs = entry.refs.saturating_sub(1);
                    entry.refs == 0
                }
                None => false,
            }
        };
        if arm {
            self.spawn_unload_timer(name.to_owned());
        }
    }

    /// The live document for `name`, if loaded.
    pub fn peek(&self, name: &str) -> Option<Arc<Document>> {
        let entries = self.entries.lock().unwrap();
        match entries.get(name) {
            Some(Entry {
                slot: Slot::Ready(doc),
                ..
            }) if !doc.is_destroyed() => Some(doc.clone()),
            _ => None,
        }
    }

    /// Names of all loaded documents.
    pub fn document_names(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, entry)| matches!(entry.slot, Slot::Ready(_)))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// Flush every loaded document once. Used by server shutdown.
    pub async fn flush_all(&self) {
        let docs: Vec<Arc<Document>> = {
            let entries = self.entries.lock().unwrap();
            entries
                .values()
                .filter_map(|entry| match &entry.slot {
                    Slot::Ready(doc) => Some(doc.clone()),
                    Slot::Loading(_) => None,
                })
                .collect()
        };
        for doc in docs {
            if let Err(e) = doc.flush().await {
                log::error!("document '{}': shutdown flush failed: {e}", doc.name());
            }
        }
    }

    fn spawn_load(self: &Arc<Self>, name: String) {
        let registry = self.clone();
        tokio::spawn(async move {
            let result = Document::load(
                name.clone(),
                &registry.factory,
                registry.storage.clone(),
                registry.persist.clone(),
                registry.options.load_timeout,
                registry.update_hook.clone(),
            )
            .await;

            let waiters = {
                let mut entries = registry.entries.lock().unwrap();
                let Some(entry) = entries.get_mut(&name) else {
                    return;
                };
                let Slot::Loading(waiters) = &mut entry.slot else {
                    return;
                };
                let waiters = std::mem::take(waiters);
                match &result {
                    Ok(doc) => {
                        entry.slot = Slot::Ready(doc.clone());
                        // Nobody stayed around for the result; eviction
                        // is the idle timer's job now.
                        if entry.refs == 0 {
                            registry.spawn_unload_timer(name.clone());
                        }
                    }
                    Err(e) => {
                        log::error!("document '{name}': load failed: {e}");
                        entries.remove(&name);
                    }
                }
                waiters
            };

            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        });
    }

    fn spawn_unload_timer(self: &Arc<Self>, name: String) {
        let registry = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(registry.options.unload_delay).await;
            registry.try_unload(&name).await;
        });
    }

    /// Evict `name` if it is still idle: refs zero and nothing pending.
    async fn try_unload(self: &Arc<Self>, name: &str) {
        let doc = {
            let entries = self.entries.lock().unwrap();
            match entries.get(name) {
                Some(Entry {
                    slot: Slot::Ready(doc),
                    refs: 0,
                }) => doc.clone(),
                _ => return, // re-acquired or still loading
            }
        };

        // Persist one last time so nothing pending is lost.
        if !doc.eligible_for_unload().await {
            if let Err(e) = doc.flush().await {
                log::error!("document '{name}': unload flush failed: {e}; retaining");
                return;
            }
        }

        self.storage.before_unload(name).await;

        let removed = {
            let mut entries = self.entries.lock().unwrap();
            match entries.get(name) {
                Some(Entry {
                    slot: Slot::Ready(current),
                    refs: 0,
                }) if Arc::ptr_eq(current, &doc) => {
                    entries.remove(name);
                    true
                }
                _ => false, // re-acquired during the flush
            }
        };

        if removed {
            self.storage.after_unload(name).await;
            log::info!("document '{name}': unloaded after idle");
        }
    }
}
