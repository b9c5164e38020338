//! CRDT engine capability seam.
//!
//! The hub never interprets document content; it needs exactly four things
//! from a CRDT implementation: import an opaque update, export the updates
//! a remote version vector is missing, report its own version vector, and
//! stream locally-produced updates. [`Replica`] captures that contract, and
//! [`LoroReplica`] is the shipping adapter over [`loro::LoroDoc`]. An engine
//! that cannot satisfy the trait fails at construction, not mid-session.
//!
//! Version vectors cross the wire as canonical JSON: a map from peer
//! identifier (stringified) to its highest observed counter, with sorted
//! keys so equal vectors serialize identically.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A version vector: peer identifier → highest observed counter.
///
/// Backed by a `BTreeMap` so the JSON form is canonical.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionVector(BTreeMap<String, u64>);

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The counter recorded for `peer`, zero if absent.
    pub fn get(&self, peer: &str) -> u64 {
        self.0.get(peer).copied().unwrap_or(0)
    }

    /// Record `counter` for `peer`, keeping the maximum seen.
    pub fn insert(&mut self, peer: impl Into<String>, counter: u64) {
        let entry = self.0.entry(peer.into()).or_insert(0);
        *entry = (*entry).max(counter);
    }

    /// Pointwise maximum with `other`. Monotonic under the partial order.
    pub fn merge(&mut self, other: &VersionVector) {
        for (peer, counter) in &other.0 {
            self.insert(peer.clone(), *counter);
        }
    }

    /// Whether every entry of `other` is covered by this vector.
    pub fn covers(&self, other: &VersionVector) -> bool {
        other.0.iter().all(|(peer, counter)| self.get(peer) >= *counter)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(peer, counter)| (peer.as_str(), *counter))
    }

    /// Canonical JSON form.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_owned())
    }

    /// Parse the JSON form. Callers decide what a parse failure means;
    /// the sync path treats it as "sender has nothing".
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Outcome of importing one update into a replica.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportStatus {
    /// The engine parked part of the update awaiting missing dependencies.
    pub pending: bool,
}

/// Engine-boundary failures.
#[derive(Debug, Clone)]
pub enum EngineError {
    /// The replica rejected an update. Logged, never fatal: the hub
    /// still relays the update, since peers may hold its dependencies.
    Import(String),
    /// The replica failed to produce an export.
    Export(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Import(e) => write!(f, "import rejected: {e}"),
            EngineError::Export(e) => write!(f, "export failed: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

/// Callback invoked with each locally-committed update.
pub type LocalUpdateFn = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Handle for a local-update subscription.
///
/// Unsubscribing is best-effort and never fails; the underlying callback is
/// released exactly once, whether by [`unsubscribe`](Self::unsubscribe) or
/// by drop.
pub struct LocalSubscription(Option<Box<dyn FnOnce() + Send>>);

impl LocalSubscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(cancel)))
    }

    /// A subscription with nothing to release.
    pub fn noop() -> Self {
        Self(None)
    }

    /// Release the subscription now.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.0.take() {
            cancel();
        }
    }
}

impl Drop for LocalSubscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.0.take() {
            cancel();
        }
    }
}

impl fmt::Debug for LocalSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LocalSubscription")
            .field(&self.0.is_some())
            .finish()
    }
}

/// The capability contract a CRDT engine must satisfy.
///
/// All methods take `&self`: the replica is expected to be internally
/// synchronized (loro's is), and the hub additionally serializes mutating
/// access per document behind its own lock.
pub trait Replica: Send + Sync {
    /// Apply one opaque update.
    fn import(&self, update: &[u8]) -> Result<ImportStatus, EngineError>;

    /// Export the updates a replica at version `from` is missing. An engine
    /// with only a monolithic export returns a one-element sequence.
    fn export_from(&self, from: &VersionVector) -> Result<Vec<Vec<u8>>, EngineError>;

    /// This replica's current version vector.
    fn version(&self) -> VersionVector;

    /// Stream locally-committed updates until the subscription is released.
    fn subscribe_local_updates(&self, cb: LocalUpdateFn) -> LocalSubscription;
}

/// Factory producing fresh replicas, used when a document loads.
pub type ReplicaFactory = Arc<dyn Fn() -> Arc<dyn Replica> + Send + Sync>;

/// The default factory: one fresh [`LoroReplica`] per document.
pub fn loro_replica_factory() -> ReplicaFactory {
    Arc::new(|| Arc::new(LoroReplica::new()) as Arc<dyn Replica>)
}

/// Adapter implementing [`Replica`] over [`loro::LoroDoc`].
pub struct LoroReplica {
    doc: loro::LoroDoc,
}

impl LoroReplica {
    pub fn new() -> Self {
        Self {
            doc: loro::LoroDoc::new(),
        }
    }

    /// Wrap an existing document (the client side owns its doc).
    pub fn from_doc(doc: loro::LoroDoc) -> Self {
        Self { doc }
    }

    /// The underlying document.
    pub fn doc(&self) -> &loro::LoroDoc {
        &self.doc
    }

    /// Hub VV → loro VV. Peers that do not parse as loro peer ids are
    /// skipped, which only ever widens the export.
    fn to_loro_vv(vv: &VersionVector) -> loro::VersionVector {
        let mut out = loro::VersionVector::new();
        for (peer, counter) in vv.iter() {
            if let Ok(peer) = peer.parse::<u64>() {
                out.insert(peer, counter.min(i32::MAX as u64) as i32);
            }
        }
        out
    }

    fn from_loro_vv(vv: &loro::VersionVector) -> VersionVector {
        let mut out = VersionVector::new();
        for (peer, counter) in vv.iter() {
            out.insert(peer.to_string(), (*counter).max(0) as u64);
        }
        out
    }
}

impl Default for LoroReplica {
    fn default() -> Self {
        Self::new()
    }
}

impl Replica for LoroReplica {
    fn import(&self, update: &[u8]) -> Result<ImportStatus, EngineError> {
        let status = self
            .doc
            .import(update)
            .map_err(|e| EngineError::Import(e.to_string()))?;
        Ok(ImportStatus {
            pending: status.pending.is_some(),
        })
    }

    fn export_from(&self, from: &VersionVector) -> Result<Vec<Vec<u8>>, EngineError> {
        let from = Self::to_loro_vv(from);
        let bytes = self
            .doc
            .export(loro::ExportMode::Updates {
                from: Cow::Owned(from),
            })
            .map_err(|e| EngineError::Export(e.to_string()))?;
        // loro emits one combined update blob.
        Ok(vec![bytes])
    }

    fn version(&self) -> VersionVector {
        Self::from_loro_vv(&self.doc.oplog_vv())
    }

    fn subscribe_local_updates(&self, cb: LocalUpdateFn) -> LocalSubscription {
        let sub = self.doc.subscribe_local_update(Box::new(move |update: &Vec<u8>| {
            cb(update);
            true
        }));
        LocalSubscription::new(move || sub.unsubscribe())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A deterministic log-structured replica for hub unit tests.
    //!
    //! Each update blob is `varstring(peer) varuint(counter) varbytes(payload)`;
    //! the replica is a grow-only set of (peer, counter) entries, which is
    //! enough CRDT to exercise every hub path without a real engine.

    use super::*;
    use std::sync::Mutex;

    use crate::codec::{Decoder, Encoder};

    #[derive(Default)]
    struct LogState {
        counter: u64,
        seen: Vec<(String, u64, Vec<u8>)>,
        vv: VersionVector,
    }

    pub(crate) struct LogReplica {
        peer: String,
        state: Mutex<LogState>,
        subscribers: Arc<Mutex<Vec<(u64, Arc<LocalUpdateFn>)>>>,
        next_sub: Mutex<u64>,
    }

    impl LogReplica {
        pub(crate) fn new(peer: impl Into<String>) -> Self {
            Self {
                peer: peer.into(),
                state: Mutex::new(LogState::default()),
                subscribers: Arc::new(Mutex::new(Vec::new())),
                next_sub: Mutex::new(0),
            }
        }

        pub(crate) fn encode_entry(peer: &str, counter: u64, payload: &[u8]) -> Vec<u8> {
            let mut enc = Encoder::new();
            enc.varstring(peer).varuint(counter).varbytes(payload);
            enc.into_bytes()
        }

        /// Commit a local edit: record it and fan it out to local-update
        /// subscribers, the way a real engine does on commit.
        pub(crate) fn commit(&self, payload: &[u8]) -> Vec<u8> {
            let blob = {
                let mut st = self.state.lock().unwrap();
                st.counter += 1;
                let counter = st.counter;
                let blob = Self::encode_entry(&self.peer, counter, payload);
                let peer = self.peer.clone();
                st.seen.push((peer.clone(), counter, payload.to_vec()));
                st.vv.insert(peer, counter);
                blob
            };
            for (_, cb) in self.subscribers.lock().unwrap().iter() {
                cb(&blob);
            }
            blob
        }

        pub(crate) fn payloads(&self) -> Vec<Vec<u8>> {
            self.state
                .lock()
                .unwrap()
                .seen
                .iter()
                .map(|(_, _, payload)| payload.clone())
                .collect()
        }
    }

    impl Replica for LogReplica {
        fn import(&self, update: &[u8]) -> Result<ImportStatus, EngineError> {
            let mut dec = Decoder::new(update);
            let mut parse = || -> Result<(String, u64, Vec<u8>), crate::codec::CodecError> {
                Ok((
                    dec.varstring()?.to_owned(),
                    dec.varuint()?,
                    dec.varbytes()?.to_vec(),
                ))
            };
            let (peer, counter, payload) =
                parse().map_err(|e| EngineError::Import(e.to_string()))?;
            let mut st = self.state.lock().unwrap();
            if st.vv.get(&peer) < counter {
                st.seen.push((peer.clone(), counter, payload));
                st.vv.insert(peer, counter);
            }
            Ok(ImportStatus::default())
        }

        fn export_from(&self, from: &VersionVector) -> Result<Vec<Vec<u8>>, EngineError> {
            let st = self.state.lock().unwrap();
            Ok(st
                .seen
                .iter()
                .filter(|(peer, counter, _)| *counter > from.get(peer))
                .map(|(peer, counter, payload)| Self::encode_entry(peer, *counter, payload))
                .collect())
        }

        fn version(&self) -> VersionVector {
            self.state.lock().unwrap().vv.clone()
        }

        fn subscribe_local_updates(&self, cb: LocalUpdateFn) -> LocalSubscription {
            let id = {
                let mut next = self.next_sub.lock().unwrap();
                *next += 1;
                *next
            };
            self.subscribers.lock().unwrap().push((id, Arc::new(cb)));
            let subscribers = self.subscribers.clone();
            LocalSubscription::new(move || {
                subscribers.lock().unwrap().retain(|(sub, _)| *sub != id);
            })
        }
    }

    pub(crate) fn log_replica_factory(peer: &str) -> ReplicaFactory {
        let peer = peer.to_owned();
        Arc::new(move || Arc::new(LogReplica::new(peer.clone())) as Arc<dyn Replica>)
    }
}
