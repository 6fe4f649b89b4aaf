// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A bounded in-memory artifact cache with MRU retention.
//!
//! A compute engine answers many requests for the same data chunks. This
//! cache keeps recently used artifacts resident up to a configurable byte
//! budget, evicting the least-recently-used entries when the budget is
//! exceeded, and collapses concurrent fetches of the same key into a single
//! producer invocation.
//!
//! The cache is owned by one engine process and never shared across
//! processes. It is safe to share across tasks within the process: the
//! resident/absent decision in [`MruCache::get_or_compute`] is atomic, so two
//! callers can never both decide "absent" and both produce.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, trace};

/// The byte weight of a cached artifact, charged against the cache capacity.
pub trait Weight {
    /// Returns the resident size of this artifact in bytes.
    fn weight(&self) -> usize;
}

impl Weight for Vec<u8> {
    fn weight(&self) -> usize {
        self.len()
    }
}

impl Weight for bytes::Bytes {
    fn weight(&self) -> usize {
        self.len()
    }
}

impl Weight for String {
    fn weight(&self) -> usize {
        self.len()
    }
}

/// An error returned by [`MruCache::get_or_compute`].
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The producer for this key failed. The failure is delivered to every
    /// caller that was waiting on the production; nothing is cached.
    #[error("artifact producer failed: {0}")]
    Producer(String),
}

/// Shared production outcome delivered to waiting callers.
type Produced<V> = Result<Arc<V>, String>;

/// A bounded key/artifact store with least-recently-used eviction.
///
/// Artifacts are returned as [`Arc`]s; eviction drops the cache's reference
/// while outstanding callers keep theirs.
#[derive(Debug)]
pub struct MruCache<K, V> {
    inner: Mutex<Inner<K, V>>,
}

#[derive(Debug)]
struct Inner<K, V> {
    capacity: usize,
    used: usize,
    tick: u64,
    resident: BTreeMap<K, Entry<V>>,
    in_flight: BTreeMap<K, Flight<V>>,
}

#[derive(Debug)]
struct Entry<V> {
    value: Arc<V>,
    weight: usize,
    last_access: u64,
    inserted: u64,
}

#[derive(Debug)]
struct Flight<V> {
    state: Arc<FlightState>,
    rx: watch::Receiver<Option<Produced<V>>>,
}

#[derive(Debug)]
struct FlightState {
    invalidated: AtomicBool,
}

/// What a caller found when it consulted the cache state.
enum Plan<V> {
    Hit(Arc<V>),
    Wait(watch::Receiver<Option<Produced<V>>>),
    Produce(watch::Sender<Option<Produced<V>>>, Arc<FlightState>),
}

impl<K, V> MruCache<K, V>
where
    K: Ord + Clone,
    V: Weight,
{
    /// Creates a cache bounded to `capacity_bytes` of resident artifacts.
    pub fn new(capacity_bytes: usize) -> MruCache<K, V> {
        MruCache {
            inner: Mutex::new(Inner {
                capacity: capacity_bytes,
                used: 0,
                tick: 0,
                resident: BTreeMap::new(),
                in_flight: BTreeMap::new(),
            }),
        }
    }

    /// Returns the artifact for `key`, invoking `producer` only if it is
    /// neither resident nor already being produced.
    ///
    /// A resident artifact has its recency updated and is returned without
    /// invoking `producer`. If another caller is already producing this key,
    /// the call suspends until that production completes and shares its
    /// outcome, success or failure. Otherwise this caller produces: the
    /// result is inserted (evicting least-recently-used entries down to
    /// capacity) and handed to every waiter.
    ///
    /// A producer failure is delivered to all waiting callers and caches
    /// nothing; the next call for the key produces afresh.
    pub async fn get_or_compute<F, Fut>(&self, key: K, producer: F) -> Result<Arc<V>, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>>,
    {
        let mut producer = Some(producer);
        loop {
            let plan = {
                let mut inner = self.inner.lock().expect("lock poisoned");
                if let Some(value) = inner.touch(&key) {
                    Plan::Hit(value)
                } else {
                    match inner.in_flight.get(&key) {
                        Some(flight) if !flight.is_dead() => Plan::Wait(flight.rx.clone()),
                        _ => {
                            let (tx, rx) = watch::channel(None);
                            let state = Arc::new(FlightState {
                                invalidated: AtomicBool::new(false),
                            });
                            inner.in_flight.insert(
                                key.clone(),
                                Flight {
                                    state: Arc::clone(&state),
                                    rx,
                                },
                            );
                            Plan::Produce(tx, state)
                        }
                    }
                }
            };

            match plan {
                Plan::Hit(value) => return Ok(value),
                Plan::Wait(mut rx) => {
                    match rx.wait_for(|outcome| outcome.is_some()).await {
                        Ok(outcome) => {
                            let outcome = outcome.clone().expect("matched Some");
                            return outcome.map_err(CacheError::Producer);
                        }
                        // The producing caller went away without completing.
                        // Retry; this caller may now produce itself.
                        Err(_) => continue,
                    }
                }
                Plan::Produce(tx, state) => {
                    let producer = producer.take().expect("only one production attempt");
                    let result = producer().await;

                    let outcome = {
                        let mut inner = self.inner.lock().expect("lock poisoned");
                        // The flight may have been superseded if the key was
                        // invalidated mid-production; only retire our own.
                        let ours = inner
                            .in_flight
                            .get(&key)
                            .is_some_and(|f| Arc::ptr_eq(&f.state, &state));
                        if ours {
                            inner.in_flight.remove(&key);
                        }
                        match result {
                            Ok(value) => {
                                let value = Arc::new(value);
                                if ours && !state.invalidated.load(Ordering::SeqCst) {
                                    inner.insert(key.clone(), Arc::clone(&value));
                                } else {
                                    trace!("discarding invalidated production");
                                }
                                Ok(value)
                            }
                            Err(err) => Err(format!("{:#}", err)),
                        }
                    };

                    // Wake every waiting caller with the shared outcome.
                    let _ = tx.send(Some(outcome.clone()));
                    return outcome.map_err(CacheError::Producer);
                }
            }
        }
    }

    /// Returns the resident artifact for `key`, updating its recency.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.inner.lock().expect("lock poisoned").touch(key)
    }

    /// Removes `key` unconditionally.
    ///
    /// If a production for `key` is in flight, it still completes and its
    /// waiters still receive the artifact, but the result is discarded
    /// rather than inserted.
    pub fn invalidate(&self, key: &K) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if let Some(entry) = inner.resident.remove(key) {
            inner.used -= entry.weight;
        }
        if let Some(flight) = inner.in_flight.remove(key) {
            flight.state.invalidated.store(true, Ordering::SeqCst);
        }
    }

    /// Changes the capacity, evicting immediately if the new bound is
    /// exceeded.
    pub fn set_capacity(&self, capacity_bytes: usize) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.capacity = capacity_bytes;
        inner.evict();
    }

    /// The configured capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.inner.lock().expect("lock poisoned").capacity
    }

    /// The total weight of resident artifacts.
    pub fn used_bytes(&self) -> usize {
        self.inner.lock().expect("lock poisoned").used
    }

    /// The number of resident artifacts.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("lock poisoned").resident.len()
    }

    /// Whether no artifacts are resident.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` is resident, without updating recency.
    pub fn contains(&self, key: &K) -> bool {
        self.inner
            .lock()
            .expect("lock poisoned")
            .resident
            .contains_key(key)
    }
}

impl<V> Flight<V> {
    /// A flight is dead if its producer went away without completing: the
    /// sender is gone and no outcome was ever published.
    fn is_dead(&self) -> bool {
        self.rx.has_changed().is_err() && self.rx.borrow().is_none()
    }
}

impl<K, V> Inner<K, V>
where
    K: Ord + Clone,
    V: Weight,
{
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn touch(&mut self, key: &K) -> Option<Arc<V>> {
        let tick = self.next_tick();
        let entry = self.resident.get_mut(key)?;
        entry.last_access = tick;
        Some(Arc::clone(&entry.value))
    }

    fn insert(&mut self, key: K, value: Arc<V>) {
        let weight = value.weight();
        if weight > self.capacity {
            // Retaining this artifact would evict everything else and still
            // exceed the bound.
            debug!(weight, capacity = self.capacity, "artifact exceeds capacity; not retained");
            return;
        }
        let tick = self.next_tick();
        let entry = Entry {
            value,
            weight,
            last_access: tick,
            inserted: tick,
        };
        if let Some(old) = self.resident.insert(key, entry) {
            self.used -= old.weight;
        }
        self.used += weight;
        self.evict();
    }

    fn evict(&mut self) {
        while self.used > self.capacity {
            let victim = self
                .resident
                .iter()
                .min_by_key(|(_, e)| (e.last_access, e.inserted))
                .map(|(k, _)| k.clone());
            let Some(key) = victim else { break };
            if let Some(entry) = self.resident.remove(&key) {
                self.used -= entry.weight;
                trace!(weight = entry.weight, "evicted least-recently-used artifact");
            }
        }
    }
}
