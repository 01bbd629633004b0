// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reference-counted real-time listeners.
//!
//! Every distinct listener key maps to at most one live subscription on the
//! remote store, shared by all consumers that attached to that key. The
//! subscription is torn down when the last consumer detaches.
//!
//! # Entry lifecycle
//!
//! ```text
//!             first attach
//!                  │
//!                  ▼
//!            ┌───────────┐  subscribe failed   (entry removed,
//!            │ Attaching │ ──────────────────►  waiters get error)
//!            └───────────┘
//!                  │ subscribed
//!                  ▼
//!            ┌───────────┐  ref_count → 0, no callback running
//!   ┌──────► │  Active   │ ─────────────────────────────────────┐
//!   │        └───────────┘                                      │
//!   │ re-attach    │ ref_count → 0 while a callback is running  │
//!   │              ▼                                            ▼
//!   │     ┌─────────────────┐   callback returned       ┌──────────┐
//!   └──── │ DetachRequested │ ────────────────────────► │ Detached │
//!         └─────────────────┘                           └──────────┘
//! ```
//!
//! The raw detach function runs exactly once per entry, never while one of
//! the entry's callbacks is executing, and consumers never see data after
//! teardown has started. A late joiner is replayed the latest snapshot before
//! regular fan-out reaches it, so it never sees snapshots out of order.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::resilience::classify::classify;
use crate::storage::traits::{codes, DataCallback, DetachFn, ErrorCallback, StoreError};
use crate::throttle::DispatchChain;

/// Where a listener entry is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerPhase {
    /// Waiting for the remote subscribe call
    Attaching,
    Active,
    /// Last consumer left while a callback was running
    DetachRequested,
    Detached,
}

impl std::fmt::Display for ListenerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Attaching => write!(f, "attaching"),
            Self::Active => write!(f, "active"),
            Self::DetachRequested => write!(f, "detach_requested"),
            Self::Detached => write!(f, "detached"),
        }
    }
}

type AttachOutcome = Option<Result<(), StoreError>>;

struct Consumer {
    id: u64,
    on_data: DataCallback,
    on_error: ErrorCallback,
    /// Still being handed the latest snapshot by `attach`; fan-out skips it
    catching_up: bool,
}

struct ListenerEntry {
    generation: u64,
    ref_count: usize,
    phase: ListenerPhase,
    callbacks_running: usize,
    raw_detach: Option<DetachFn>,
    consumers: Vec<Consumer>,
    last_snapshot: Option<Value>,
    /// Bumped on every delivered snapshot
    snapshot_version: u64,
    ready: watch::Sender<AttachOutcome>,
}

impl ListenerEntry {
    fn accepts_callbacks(&self) -> bool {
        matches!(self.phase, ListenerPhase::Attaching | ListenerPhase::Active)
    }
}

struct RegistryInner {
    chain: DispatchChain,
    entries: Mutex<HashMap<String, ListenerEntry>>,
    next_id: AtomicU64,
}

/// Shares remote subscriptions between consumers of the same key.
pub struct ListenerRegistry {
    inner: Arc<RegistryInner>,
}

enum Plan {
    /// This caller must perform the remote subscribe
    Subscribe,
    /// Another caller is subscribing; wait for its outcome
    Join(watch::Receiver<AttachOutcome>),
    /// Subscription is already live; replay this snapshot and version first
    Ready(Option<(Value, u64)>),
}

impl ListenerRegistry {
    /// Create a registry whose subscribe calls go through `chain`.
    pub fn new(chain: DispatchChain) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                chain,
                entries: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Attach a consumer to `key`.
    ///
    /// The first consumer for a key runs `subscribe` (through the listener
    /// dispatch chain) with callbacks owned by the registry; later consumers
    /// share that subscription. A consumer joining a live subscription is
    /// handed the most recent snapshot straight away.
    pub async fn attach<F, Fut>(
        &self,
        key: impl Into<String>,
        on_data: DataCallback,
        on_error: ErrorCallback,
        subscribe: F,
    ) -> Result<ListenerHandle, StoreError>
    where
        F: FnOnce(DataCallback, ErrorCallback) -> Fut,
        Fut: Future<Output = Result<DetachFn, StoreError>>,
    {
        let key = key.into();
        let consumer_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut consumer = Consumer {
            id: consumer_id,
            on_data: on_data.clone(),
            on_error,
            catching_up: false,
        };

        let (generation, plan) = {
            let mut entries = self.inner.entries.lock();
            match entries.get_mut(&key) {
                Some(entry) if entry.phase != ListenerPhase::Detached => {
                    entry.ref_count += 1;
                    if entry.phase == ListenerPhase::DetachRequested {
                        debug!(key = %key, "Re-attach revived listener awaiting teardown");
                        entry.phase = ListenerPhase::Active;
                    }
                    let plan = if entry.phase == ListenerPhase::Attaching {
                        Plan::Join(entry.ready.subscribe())
                    } else {
                        let replay = entry
                            .last_snapshot
                            .clone()
                            .map(|snapshot| (snapshot, entry.snapshot_version));
                        if replay.is_some() {
                            consumer.catching_up = true;
                            entry.callbacks_running += 1;
                        }
                        Plan::Ready(replay)
                    };
                    entry.consumers.push(consumer);
                    (entry.generation, plan)
                }
                _ => {
                    let generation = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    let (ready, _) = watch::channel(None);
                    entries.insert(
                        key.clone(),
                        ListenerEntry {
                            generation,
                            ref_count: 1,
                            phase: ListenerPhase::Attaching,
                            callbacks_running: 0,
                            raw_detach: None,
                            consumers: vec![consumer],
                            last_snapshot: None,
                            snapshot_version: 0,
                            ready,
                        },
                    );
                    crate::metrics::set_active_listeners(entries.len());
                    (generation, Plan::Subscribe)
                }
            }
        };

        // Created before any await so a dropped attach still releases its ref
        let handle = ListenerHandle {
            inner: Arc::clone(&self.inner),
            key: key.clone(),
            generation,
            consumer_id,
            detached: AtomicBool::new(false),
        };

        match plan {
            Plan::Ready(replay) => {
                debug!(key = %key, "Shared existing listener");
                if let Some((mut snapshot, mut version)) = replay {
                    let _scope = CallbackScope::armed(&self.inner, &key, generation);
                    loop {
                        on_data(snapshot);
                        match self.inner.catch_up(&key, generation, consumer_id, version) {
                            Some(newer) => (snapshot, version) = newer,
                            None => break,
                        }
                    }
                }
                Ok(handle)
            }
            Plan::Join(mut ready) => {
                debug!(key = %key, "Waiting for in-progress listener attach");
                let outcome = ready
                    .wait_for(Option::is_some)
                    .await
                    .map(|outcome| outcome.clone());
                match outcome {
                    Ok(Some(Ok(()))) => Ok(handle),
                    Ok(Some(Err(e))) => Err(e),
                    _ => Err(StoreError::new(codes::UNKNOWN, "listener attach was abandoned")),
                }
            }
            Plan::Subscribe => {
                let mut pending = PendingAttach {
                    inner: &self.inner,
                    key: &key,
                    generation,
                    settled: false,
                };
                let (data_cb, error_cb) = self.inner.callbacks(&key, generation);
                let result = self.inner.chain.run(|| subscribe(data_cb, error_cb)).await;
                pending.settled = true;
                self.inner.finish_attach(&key, generation, result)?;
                Ok(handle)
            }
        }
    }

    /// Consumers currently attached to `key`
    #[must_use]
    pub fn ref_count(&self, key: &str) -> usize {
        self.inner
            .entries
            .lock()
            .get(key)
            .map(|e| e.ref_count)
            .unwrap_or(0)
    }

    /// Lifecycle phase of `key`, or `None` if no entry exists.
    #[must_use]
    pub fn phase(&self, key: &str) -> Option<ListenerPhase> {
        self.inner.entries.lock().get(key).map(|e| e.phase)
    }

    /// Number of live listener entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RegistryInner {
    /// Callbacks handed to the remote store for one entry generation.
    fn callbacks(self: &Arc<Self>, key: &str, generation: u64) -> (DataCallback, ErrorCallback) {
        let data_inner = Arc::clone(self);
        let data_key = key.to_string();
        let on_data: DataCallback = Arc::new(move |snapshot: Value| {
            data_inner.deliver_data(&data_key, generation, snapshot);
        });

        let error_inner = Arc::clone(self);
        let error_key = key.to_string();
        let on_error: ErrorCallback = Arc::new(move |err: StoreError| {
            error_inner.deliver_error(&error_key, generation, err);
        });

        (on_data, on_error)
    }

    fn deliver_data(self: &Arc<Self>, key: &str, generation: u64, snapshot: Value) {
        let targets: Vec<(u64, DataCallback)> = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(key).filter(|e| e.generation == generation) else {
                return;
            };
            if !entry.accepts_callbacks() {
                return;
            }
            entry.last_snapshot = Some(snapshot.clone());
            entry.snapshot_version += 1;
            entry.callbacks_running += 1;
            entry
                .consumers
                .iter()
                .filter(|c| !c.catching_up)
                .map(|c| (c.id, c.on_data.clone()))
                .collect()
        };

        let _scope = CallbackScope::armed(self, key, generation);
        for (consumer_id, on_data) in targets {
            if self.still_attached(key, generation, consumer_id) {
                on_data(snapshot.clone());
            }
        }
    }

    /// Whether `consumer_id` may still be called: attached, and the entry is
    /// not being torn down. Earlier callbacks in a fan-out can detach later
    /// consumers.
    fn still_attached(&self, key: &str, generation: u64, consumer_id: u64) -> bool {
        self.entries
            .lock()
            .get(key)
            .filter(|e| e.generation == generation && e.accepts_callbacks())
            .is_some_and(|e| e.consumers.iter().any(|c| c.id == consumer_id))
    }

    /// After replaying snapshot `version` to a late joiner, return a newer
    /// snapshot it missed, or hand the consumer over to normal fan-out.
    fn catch_up(
        &self,
        key: &str,
        generation: u64,
        consumer_id: u64,
        version: u64,
    ) -> Option<(Value, u64)> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(key).filter(|e| e.generation == generation)?;
        if entry.snapshot_version > version && entry.accepts_callbacks() {
            if let Some(snapshot) = entry.last_snapshot.clone() {
                return Some((snapshot, entry.snapshot_version));
            }
        }
        if let Some(consumer) = entry.consumers.iter_mut().find(|c| c.id == consumer_id) {
            consumer.catching_up = false;
        }
        None
    }

    fn deliver_error(self: &Arc<Self>, key: &str, generation: u64, err: StoreError) {
        let class = classify(&err);
        if class.is_expected_noise() {
            warn!(key = %key, %class, error = %err, "Suppressed listener error, expecting recovery");
            crate::metrics::record_listener_error(class.as_str(), "suppressed");
            return;
        }

        let targets: Vec<(u64, ErrorCallback)> = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(key).filter(|e| e.generation == generation) else {
                return;
            };
            if !entry.accepts_callbacks() {
                return;
            }
            entry.callbacks_running += 1;
            entry
                .consumers
                .iter()
                .map(|c| (c.id, c.on_error.clone()))
                .collect()
        };

        crate::metrics::record_listener_error(class.as_str(), "forwarded");
        let _scope = CallbackScope::armed(self, key, generation);
        for (consumer_id, on_error) in targets {
            if self.still_attached(key, generation, consumer_id) {
                on_error(err.clone());
            }
        }
    }

    fn finish_attach(
        &self,
        key: &str,
        generation: u64,
        result: Result<DetachFn, StoreError>,
    ) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        let current = entries.get(key).map(|e| e.generation) == Some(generation);

        match result {
            Ok(raw_detach) => {
                if !current {
                    drop(entries);
                    raw_detach();
                    return Err(StoreError::new(codes::UNKNOWN, "listener entry vanished during attach"));
                }
                let Some(entry) = entries.get_mut(key) else {
                    return Ok(());
                };
                let _ = entry.ready.send(Some(Ok(())));
                if entry.ref_count > 0 {
                    entry.phase = ListenerPhase::Active;
                    entry.raw_detach = Some(raw_detach);
                    info!(key = %key, "Listener attached");
                    return Ok(());
                }
                // Every consumer left while the subscribe call was running
                if entry.callbacks_running > 0 {
                    entry.phase = ListenerPhase::DetachRequested;
                    entry.raw_detach = Some(raw_detach);
                    return Ok(());
                }
                entries.remove(key);
                crate::metrics::set_active_listeners(entries.len());
                drop(entries);
                raw_detach();
                crate::metrics::record_listener_detach("immediate");
                Ok(())
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Listener attach failed");
                if current {
                    if let Some(entry) = entries.remove(key) {
                        let _ = entry.ready.send(Some(Err(e.clone())));
                    }
                    crate::metrics::set_active_listeners(entries.len());
                }
                Err(e)
            }
        }
    }

    /// Drop one consumer; tear the subscription down once nobody is left.
    fn release(&self, key: &str, generation: u64, consumer_id: u64) {
        let raw_detach = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(key).filter(|e| e.generation == generation) else {
                return;
            };
            let before = entry.consumers.len();
            entry.consumers.retain(|c| c.id != consumer_id);
            if entry.consumers.len() == before {
                return;
            }
            entry.ref_count = entry.ref_count.saturating_sub(1);
            if entry.ref_count > 0 {
                return;
            }

            match entry.phase {
                ListenerPhase::Active if entry.callbacks_running > 0 => {
                    debug!(key = %key, "Deferring detach until running callback returns");
                    entry.phase = ListenerPhase::DetachRequested;
                    return;
                }
                ListenerPhase::Active => {
                    entry.phase = ListenerPhase::Detached;
                    let raw_detach = entry.raw_detach.take();
                    entries.remove(key);
                    crate::metrics::set_active_listeners(entries.len());
                    raw_detach
                }
                // Attaching: the subscribe call settles the entry
                _ => return,
            }
        };

        if let Some(raw_detach) = raw_detach {
            raw_detach();
            info!(key = %key, "Listener detached");
            crate::metrics::record_listener_detach("immediate");
        }
    }

    /// Runs when the last concurrently executing callback of an entry exits.
    fn callback_exited(&self, key: &str, generation: u64) {
        let raw_detach = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(key).filter(|e| e.generation == generation) else {
                return;
            };
            entry.callbacks_running = entry.callbacks_running.saturating_sub(1);
            if entry.callbacks_running > 0 || entry.phase != ListenerPhase::DetachRequested {
                return;
            }
            entry.phase = ListenerPhase::Detached;
            let raw_detach = entry.raw_detach.take();
            entries.remove(key);
            crate::metrics::set_active_listeners(entries.len());
            raw_detach
        };

        if let Some(raw_detach) = raw_detach {
            raw_detach();
            info!(key = %key, "Deferred listener detach completed");
            crate::metrics::record_listener_detach("deferred");
        }
    }
}

/// Ends a running callback when dropped, including on unwind.
///
/// The caller bumps `callbacks_running` under the same lock it used to pick
/// the consumers, then arms the scope.
struct CallbackScope<'a> {
    inner: &'a RegistryInner,
    key: &'a str,
    generation: u64,
}

impl<'a> CallbackScope<'a> {
    fn armed(inner: &'a RegistryInner, key: &'a str, generation: u64) -> Self {
        Self {
            inner,
            key,
            generation,
        }
    }
}

impl Drop for CallbackScope<'_> {
    fn drop(&mut self) {
        self.inner.callback_exited(self.key, self.generation);
    }
}

/// Removes an `Attaching` entry if the subscribing caller is dropped before
/// the remote call settles, so joined callers are not left waiting.
struct PendingAttach<'a> {
    inner: &'a RegistryInner,
    key: &'a str,
    generation: u64,
    settled: bool,
}

impl Drop for PendingAttach<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut entries = self.inner.entries.lock();
        let abandoned = entries
            .get(self.key)
            .map(|e| e.generation == self.generation && e.phase == ListenerPhase::Attaching)
            .unwrap_or(false);
        if abandoned {
            if let Some(entry) = entries.remove(self.key) {
                let _ = entry.ready.send(Some(Err(StoreError::new(
                    codes::UNKNOWN,
                    "listener attach was abandoned",
                ))));
            }
            crate::metrics::set_active_listeners(entries.len());
        }
    }
}

/// One consumer's share of a listener.
///
/// Call [`detach`](Self::detach) to leave; dropping the handle does the same.
/// Detaching more than once is a no-op.
pub struct ListenerHandle {
    inner: Arc<RegistryInner>,
    key: String,
    generation: u64,
    consumer_id: u64,
    detached: AtomicBool,
}

impl ListenerHandle {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    pub fn detach(&self) {
        if self.detached.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.release(&self.key, self.generation, self.consumer_id);
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("key", &self.key)
            .field("detached", &self.is_detached())
            .finish()
    }
}
