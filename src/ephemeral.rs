//! Ephemeral (presence) state.
//!
//! Ephemeral payloads carry cursors, selections, and other shared
//! auxiliary state: broadcast to peers, never persisted, never part of
//! document content. The hub relays them opaquely; what a payload means is
//! entirely between the stores at each end.
//!
//! [`EphemeralStore`] is the contract a store must satisfy to ride a
//! provider. [`KeyedEphemeralStore`] is the reference implementation:
//! keyed last-writer-wins entries with wall-clock timestamps and TTL
//! eviction. Its delta format is the hub codec:
//!
//! ```text
//! delta := varuint(count) count × (varstring(key) varuint(ts_ms) varbytes(value))
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::codec::{Decoder, Encoder};
use crate::engine::{LocalSubscription, LocalUpdateFn};

/// Contract for a store whose state rides `LoroEphemeral` frames.
pub trait EphemeralStore: Send + Sync {
    /// Merge an inbound delta from a peer.
    fn apply(&self, delta: &[u8]);

    /// Stream deltas produced by local writes until unsubscribed.
    fn subscribe_local_updates(&self, cb: LocalUpdateFn) -> LocalSubscription;

    /// Encode the full current state as one delta.
    fn encode_all(&self) -> Vec<u8>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct EphemeralEntry {
    value: Vec<u8>,
    /// Last-writer-wins ordering key, milliseconds since the epoch.
    timestamp_ms: u64,
}

/// Keyed last-writer-wins store with TTL eviction.
pub struct KeyedEphemeralStore {
    entries: Mutex<HashMap<String, EphemeralEntry>>,
    ttl: Duration,
    subscribers: Arc<Mutex<Vec<(u64, Arc<LocalUpdateFn>)>>>,
    next_sub: Mutex<u64>,
}

impl KeyedEphemeralStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            subscribers: Arc::new(Mutex::new(Vec::new())),
            next_sub: Mutex::new(0),
        }
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Write a key locally and fan the delta out to subscribers.
    pub fn set(&self, key: &str, value: &[u8]) {
        let timestamp_ms = {
            let mut entries = self.entries.lock().unwrap();
            // Strictly after whatever we already hold for the key, so a
            // local write always wins over what it overwrites.
            let floor = entries
                .get(key)
                .map(|entry| entry.timestamp_ms + 1)
                .unwrap_or(0);
            let timestamp_ms = Self::now_ms().max(floor);
            entries.insert(
                key.to_owned(),
                EphemeralEntry {
                    value: value.to_vec(),
                    timestamp_ms,
                },
            );
            timestamp_ms
        };

        let delta = Self::encode_entries(&[(key, timestamp_ms, value)]);
        for (_, cb) in self.subscribers.lock().unwrap().iter() {
            cb(&delta);
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries
            .lock()
            .unwrap()
            .get(key)
            .map(|entry| entry.value.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.lock().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// Drop every entry older than the TTL. Returns how many were evicted.
    pub fn evict_expired(&self) -> usize {
        let cutoff = Self::now_ms().saturating_sub(self.ttl.as_millis() as u64);
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, entry| entry.timestamp_ms >= cutoff);
        before - entries.len()
    }

    fn encode_entries(entries: &[(&str, u64, &[u8])]) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.varuint(entries.len() as u64);
        for (key, timestamp_ms, value) in entries {
            enc.varstring(key).varuint(*timestamp_ms).varbytes(value);
        }
        enc.into_bytes()
    }
}

impl EphemeralStore for KeyedEphemeralStore {
    /// Merge a peer's delta: per key, the newer timestamp wins.
    ///
    /// A malformed delta is dropped at the first bad entry; whatever
    /// decoded before it stays merged.
    fn apply(&self, delta: &[u8]) {
        let mut dec = Decoder::new(delta);
        let count = match dec.varuint() {
            Ok(count) => count,
            Err(e) => {
                log::warn!("ephemeral delta rejected: {e}");
                return;
            }
        };
        let mut entries = self.entries.lock().unwrap();
        for _ in 0..count {
            let parsed = (|| -> Result<_, crate::codec::CodecError> {
                let key = dec.varstring()?.to_owned();
                let timestamp_ms = dec.varuint()?;
                let value = dec.varbytes()?.to_vec();
                Ok((key, timestamp_ms, value))
            })();
            let (key, timestamp_ms, value) = match parsed {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("ephemeral delta truncated: {e}");
                    return;
                }
            };
            let stale = entries
                .get(&key)
                .map(|existing| existing.timestamp_ms >= timestamp_ms)
                .unwrap_or(false);
            if !stale {
                entries.insert(
                    key,
                    EphemeralEntry {
                        value,
                        timestamp_ms,
                    },
                );
            }
        }
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

    fn encode_all(&self) -> Vec<u8> {
        let entries = self.entries.lock().unwrap();
        let all: Vec<(&str, u64, &[u8])> = entries
            .iter()
            .map(|(key, entry)| (key.as_str(), entry.timestamp_ms, entry.value.as_slice()))
            .collect();
        Self::encode_entries(&all)
    }
}

impl Default for KeyedEphemeralStore {
    fn default() -> Self {
        // Presence entries go stale quickly.
        Self::new(Duration::from_secs(30))
    }
}
