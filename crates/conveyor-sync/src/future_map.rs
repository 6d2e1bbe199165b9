//! Keyed future map.
//!
//! Rendezvous point between a producer that delivers values keyed by id
//! (a broker subscription, an RPC consumer) and consumers awaiting those ids,
//! in either arrival order. Each key holds at most one entry; a Pending entry
//! carries the settle-handles of its waiters, so the producer can fulfil an
//! entry the consumer has not asked for yet, and vice versa.

use std::collections::hash_map::Entry as MapEntry;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Why a waiter was turned away instead of receiving a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    /// The entry was removed while waiters were still parked on it.
    #[error("deleted")]
    Deleted,
    /// The whole map was cleared.
    #[error("cleared")]
    Cleared,
    /// The producer rejected the entry with a reason of its own.
    #[error("{0}")]
    Reason(String),
}

enum EntryState<V> {
    Pending {
        waiters: Vec<oneshot::Sender<Result<V, Rejection>>>,
    },
    Fulfilled(V),
    Rejected(Rejection),
}

struct Entry<V> {
    state: EntryState<V>,
    expiry: Option<JoinHandle<()>>,
}

impl<V> Entry<V> {
    fn pending() -> Self {
        Self {
            state: EntryState::Pending {
                waiters: Vec::new(),
            },
            expiry: None,
        }
    }
}

struct Inner<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
    ttl: Option<Duration>,
}

/// Map of key -> settleable future, with optional per-entry time-to-live.
///
/// Cloning is cheap and shares the underlying map, so the producer side
/// (e.g. a subscriber task) and the consumer side can each hold a handle.
pub struct FutureMap<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for FutureMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V> fmt::Debug for FutureMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutureMap").field("ttl", &self.inner.ttl).finish()
    }
}

impl<K, V> FutureMap<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                ttl: None,
            }),
        }
    }

    /// Every touch of an entry (create, settle, delete) restarts a deletion
    /// timer for its key; entries untouched for `ttl` evaporate.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                ttl: Some(ttl),
            }),
        }
    }

    /// Await the value for `key`, installing a Pending entry if none exists.
    ///
    /// Settled entries answer immediately; Pending entries park the caller on
    /// a settle-handle that `resolve`/`reject` will trip later.
    pub async fn get(&self, key: K) -> Result<V, Rejection> {
        let receiver = {
            let mut entries = self.inner.entries.lock();
            match entries.entry(key.clone()) {
                MapEntry::Occupied(mut occupied) => match &mut occupied.get_mut().state {
                    EntryState::Pending { waiters } => {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        rx
                    }
                    EntryState::Fulfilled(value) => return Ok(value.clone()),
                    EntryState::Rejected(rejection) => return Err(rejection.clone()),
                },
                MapEntry::Vacant(vacant) => {
                    let (tx, rx) = oneshot::channel();
                    let mut entry = Entry::pending();
                    if let EntryState::Pending { waiters } = &mut entry.state {
                        waiters.push(tx);
                    }
                    entry.expiry = self.schedule_expiry(&key);
                    vacant.insert(entry);
                    rx
                }
            }
        };

        // The sender only disappears without settling if the map itself is
        // torn down; treat that like a deletion.
        receiver.await.unwrap_or(Err(Rejection::Deleted))
    }

    /// Settle `key` with `value`.
    ///
    /// Returns `true` when the call installed a brand-new Fulfilled entry,
    /// `false` when an entry already existed (its waiters were notified, or
    /// its settled value was overwritten; the original waiters are never
    /// re-invoked).
    pub fn resolve(&self, key: K, value: V) -> bool {
        let mut entries = self.inner.entries.lock();
        let created = match entries.entry(key.clone()) {
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry {
                    state: EntryState::Fulfilled(value),
                    expiry: None,
                });
                true
            }
            MapEntry::Occupied(mut occupied) => {
                let previous = std::mem::replace(
                    &mut occupied.get_mut().state,
                    EntryState::Fulfilled(value.clone()),
                );
                if let EntryState::Pending { waiters } = previous {
                    for waiter in waiters {
                        let _ = waiter.send(Ok(value.clone()));
                    }
                }
                false
            }
        };
        Self::reschedule(&mut entries, &key, self.schedule_expiry(&key));
        created
    }

    /// Counterpart of [`FutureMap::resolve`] for failures.
    pub fn reject(&self, key: K, reason: impl Into<String>) -> bool {
        let rejection = Rejection::Reason(reason.into());
        let mut entries = self.inner.entries.lock();
        let created = match entries.entry(key.clone()) {
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry {
                    state: EntryState::Rejected(rejection),
                    expiry: None,
                });
                true
            }
            MapEntry::Occupied(mut occupied) => {
                let previous = std::mem::replace(
                    &mut occupied.get_mut().state,
                    EntryState::Rejected(rejection.clone()),
                );
                if let EntryState::Pending { waiters } = previous {
                    for waiter in waiters {
                        let _ = waiter.send(Err(rejection.clone()));
                    }
                }
                false
            }
        };
        Self::reschedule(&mut entries, &key, self.schedule_expiry(&key));
        created
    }

    /// Reject every entry that is still Pending. Settled entries keep their
    /// values. Returns how many entries were rejected.
    pub fn reject_all(&self, reason: impl Into<String>) -> usize {
        let rejection = Rejection::Reason(reason.into());
        let mut entries = self.inner.entries.lock();
        let mut rejected = 0;
        for entry in entries.values_mut() {
            if matches!(entry.state, EntryState::Pending { .. }) {
                let previous = std::mem::replace(
                    &mut entry.state,
                    EntryState::Rejected(rejection.clone()),
                );
                if let EntryState::Pending { waiters } = previous {
                    for waiter in waiters {
                        let _ = waiter.send(Err(rejection.clone()));
                    }
                }
                rejected += 1;
            }
        }
        rejected
    }

    /// Remove `key`, turning away any parked waiters. Returns whether the
    /// key existed.
    pub fn delete(&self, key: &K) -> bool {
        let mut entries = self.inner.entries.lock();
        match entries.remove(key) {
            Some(entry) => {
                Self::discard(entry, Rejection::Deleted);
                true
            }
            None => false,
        }
    }

    /// Remove every entry, turning away all parked waiters. Returns the
    /// number of entries removed.
    pub fn clear(&self) -> usize {
        let mut entries = self.inner.entries.lock();
        let count = entries.len();
        for (_, entry) in entries.drain() {
            Self::discard(entry, Rejection::Cleared);
        }
        count
    }

    pub fn has(&self, key: &K) -> bool {
        self.inner.entries.lock().contains_key(key)
    }

    pub fn is_pending(&self, key: &K) -> bool {
        matches!(
            self.inner.entries.lock().get(key),
            Some(Entry { state: EntryState::Pending { .. }, .. })
        )
    }

    pub fn is_fulfilled(&self, key: &K) -> bool {
        matches!(
            self.inner.entries.lock().get(key),
            Some(Entry { state: EntryState::Fulfilled(_), .. })
        )
    }

    pub fn is_rejected(&self, key: &K) -> bool {
        matches!(
            self.inner.entries.lock().get(key),
            Some(Entry { state: EntryState::Rejected(_), .. })
        )
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }

    fn discard(entry: Entry<V>, rejection: Rejection) {
        if let Some(expiry) = entry.expiry {
            expiry.abort();
        }
        if let EntryState::Pending { waiters } = entry.state {
            for waiter in waiters {
                let _ = waiter.send(Err(rejection.clone()));
            }
        }
    }

    fn schedule_expiry(&self, key: &K) -> Option<JoinHandle<()>> {
        let ttl = self.inner.ttl?;
        let inner = Arc::downgrade(&self.inner);
        let key = key.clone();
        Some(tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(inner) = inner.upgrade() {
                let mut entries = inner.entries.lock();
                if let Some(entry) = entries.remove(&key) {
                    Self::discard(entry, Rejection::Deleted);
                }
            }
        }))
    }

    fn reschedule(
        entries: &mut HashMap<K, Entry<V>>,
        key: &K,
        timer: Option<JoinHandle<()>>,
    ) {
        if let Some(entry) = entries.get_mut(key) {
            if let Some(previous) = entry.expiry.take() {
                previous.abort();
            }
            entry.expiry = timer;
        } else if let Some(timer) = timer {
            timer.abort();
        }
    }
}

impl<K, V> Default for FutureMap<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
