//! In-process [`RemoteStore`] with fault injection.
//!
//! Behaves like a tiny document store: collections of JSON documents,
//! filterable and sortable by [`Query`] clauses, with live listeners that see
//! every write. Test hooks let callers inject errors, add latency, and observe
//! how the coordinator drives the store (call counts, peak concurrency,
//! network resets, detaches).

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use super::traits::{DataCallback, DetachFn, ErrorCallback, Operation, RemoteStore, StoreError};
use crate::query_key::{Clause, Direction, FilterOp, Query};

struct Listener {
    query: Query,
    on_data: DataCallback,
    on_error: ErrorCallback,
}

type ListenerMap = Arc<Mutex<HashMap<u64, Listener>>>;

pub struct InMemoryStore {
    data: DashMap<String, BTreeMap<String, Value>>,
    listeners: ListenerMap,
    next_listener: AtomicU64,

    injected: Mutex<VecDeque<StoreError>>,
    latency: Mutex<Duration>,
    network_enabled: AtomicBool,
    fail_network_toggle: AtomicBool,

    execute_calls: AtomicUsize,
    subscribe_calls: AtomicUsize,
    detach_calls: Arc<AtomicUsize>,
    network_resets: AtomicUsize,
    running: AtomicUsize,
    peak_running: AtomicUsize,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_listener: AtomicU64::new(1),
            injected: Mutex::new(VecDeque::new()),
            latency: Mutex::new(Duration::ZERO),
            network_enabled: AtomicBool::new(true),
            fail_network_toggle: AtomicBool::new(false),
            execute_calls: AtomicUsize::new(0),
            subscribe_calls: AtomicUsize::new(0),
            detach_calls: Arc::new(AtomicUsize::new(0)),
            network_resets: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            peak_running: AtomicUsize::new(0),
        }
    }

    /// Seed a document without going through `execute`.
    pub fn insert(&self, collection: &str, id: &str, doc: Value) {
        self.data
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), doc);
    }

    /// Number of documents in a collection
    #[must_use]
    pub fn len(&self, collection: &str) -> usize {
        self.data.get(collection).map(|c| c.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.iter().all(|c| c.is_empty())
    }

    // ─── Fault injection ─────────────────────────────────────────────────

    /// Fail the next `execute` with `err`. Injected errors queue up in order.
    pub fn inject_error(&self, err: StoreError) {
        self.injected.lock().push_back(err);
    }

    /// Fail the next `n` executes with clones of `err`.
    pub fn inject_errors(&self, err: StoreError, n: usize) {
        let mut queue = self.injected.lock();
        for _ in 0..n {
            queue.push_back(err.clone());
        }
    }

    /// Simulated network latency per `execute`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Make `disable_network` / `enable_network` fail.
    pub fn fail_network_toggle(&self, fail: bool) {
        self.fail_network_toggle.store(fail, Ordering::SeqCst);
    }

    /// Deliver `err` to every listener on `collection`.
    pub fn emit_error(&self, collection: &str, err: StoreError) {
        let targets: Vec<ErrorCallback> = self
            .listeners
            .lock()
            .values()
            .filter(|l| l.query.collection == collection)
            .map(|l| l.on_error.clone())
            .collect();
        for on_error in targets {
            on_error(err.clone());
        }
    }

    /// Re-deliver the current snapshot to every listener on `collection`.
    pub fn emit_snapshot(&self, collection: &str) {
        self.notify(collection);
    }

    // ─── Observation ─────────────────────────────────────────────────────

    #[must_use]
    pub fn execute_calls(&self) -> usize {
        self.execute_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn detach_calls(&self) -> usize {
        self.detach_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn active_listeners(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Completed disable → enable cycles
    #[must_use]
    pub fn network_resets(&self) -> usize {
        self.network_resets.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn network_enabled(&self) -> bool {
        self.network_enabled.load(Ordering::SeqCst)
    }

    /// Highest number of `execute` calls that were ever running at once
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.peak_running.load(Ordering::SeqCst)
    }

    // ─── Internals ───────────────────────────────────────────────────────

    fn notify(&self, collection: &str) {
        let targets: Vec<(Query, DataCallback)> = self
            .listeners
            .lock()
            .values()
            .filter(|l| l.query.collection == collection)
            .map(|l| (l.query.clone(), l.on_data.clone()))
            .collect();
        for (query, on_data) in targets {
            on_data(self.run_query(&query));
        }
    }

    fn run_query(&self, query: &Query) -> Value {
        let mut docs: Vec<Value> = match self.data.get(&query.collection) {
            Some(c) => c.iter().map(|(id, doc)| with_id(id, doc)).collect(),
            None => Vec::new(),
        };
        let mut limit = None;
        let mut sort_field: Option<String> = None;

        for clause in &query.clauses {
            match clause {
                Clause::Where { field, op, value } => {
                    docs.retain(|d| matches_filter(d.get(field), *op, value));
                }
                Clause::OrderBy { field, direction } => {
                    docs.sort_by(|a, b| {
                        let ord = compare(a.get(field), b.get(field));
                        match direction {
                            Direction::Asc => ord,
                            Direction::Desc => ord.reverse(),
                        }
                    });
                    sort_field = Some(field.clone());
                }
                Clause::StartAfter(cursor) => {
                    if let Some(field) = &sort_field {
                        if let Some(pos) = docs.iter().position(|d| d.get(field) == Some(cursor)) {
                            docs.drain(..=pos);
                        }
                    }
                }
                Clause::Limit(n) => limit = Some(*n),
            }
        }
        if let Some(n) = limit {
            docs.truncate(n);
        }
        Value::Array(docs)
    }

    fn apply(&self, op: &Operation) -> Result<Value, StoreError> {
        match op {
            Operation::Query(query) => Ok(self.run_query(query)),
            Operation::Get { collection, id } => self
                .data
                .get(collection)
                .and_then(|c| c.get(id).map(|doc| with_id(id, doc)))
                .ok_or_else(|| StoreError::not_found(format!("{}/{} does not exist", collection, id))),
            Operation::Set { collection, id, data } => {
                self.insert(collection, id, data.clone());
                Ok(Value::Null)
            }
            Operation::Update { collection, id, fields } => {
                let mut coll = self.data.entry(collection.clone()).or_default();
                let doc = coll
                    .get_mut(id)
                    .ok_or_else(|| StoreError::not_found(format!("{}/{} does not exist", collection, id)))?;
                if let (Value::Object(target), Value::Object(patch)) = (doc, fields) {
                    for (k, v) in patch {
                        target.insert(k.clone(), v.clone());
                    }
                }
                Ok(Value::Null)
            }
            Operation::Delete { collection, id } => {
                if let Some(mut coll) = self.data.get_mut(collection) {
                    coll.remove(id);
                }
                Ok(Value::Null)
            }
            Operation::Batch(ops) => {
                for op in ops {
                    self.apply(op)?;
                }
                Ok(Value::Null)
            }
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn with_id(id: &str, doc: &Value) -> Value {
    let mut out = Map::new();
    out.insert("id".to_string(), Value::String(id.to_string()));
    if let Value::Object(fields) = doc {
        for (k, v) in fields {
            out.insert(k.clone(), v.clone());
        }
    }
    Value::Object(out)
}

fn compare(a: Option<&Value>, b: Option<&Value>) -> CmpOrdering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(CmpOrdering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (None, Some(_)) => CmpOrdering::Less,
        (Some(_), None) => CmpOrdering::Greater,
        _ => CmpOrdering::Equal,
    }
}

fn matches_filter(field: Option<&Value>, op: FilterOp, value: &Value) -> bool {
    let Some(field) = field else {
        return matches!(op, FilterOp::Ne | FilterOp::NotIn);
    };
    match op {
        FilterOp::Eq => field == value,
        FilterOp::Ne => field != value,
        FilterOp::Lt => compare(Some(field), Some(value)) == CmpOrdering::Less,
        FilterOp::Le => compare(Some(field), Some(value)) != CmpOrdering::Greater,
        FilterOp::Gt => compare(Some(field), Some(value)) == CmpOrdering::Greater,
        FilterOp::Ge => compare(Some(field), Some(value)) != CmpOrdering::Less,
        FilterOp::In => value.as_array().map(|a| a.contains(field)).unwrap_or(false),
        FilterOp::NotIn => value.as_array().map(|a| !a.contains(field)).unwrap_or(true),
        FilterOp::ArrayContains => field.as_array().map(|a| a.contains(value)).unwrap_or(false),
    }
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteStore for InMemoryStore {
    async fn execute(&self, op: &Operation) -> Result<Value, StoreError> {
        self.execute_calls.fetch_add(1, Ordering::SeqCst);
        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        let _running = RunningGuard(&self.running);
        self.peak_running.fetch_max(now_running, Ordering::SeqCst);

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let injected = self.injected.lock().pop_front();
        if let Some(err) = injected {
            return Err(err);
        }
        if !self.network_enabled() {
            return Err(StoreError::unavailable("client is offline"));
        }

        let result = self.apply(op)?;
        match op {
            Operation::Query(_) | Operation::Get { .. } => {}
            Operation::Set { collection, .. }
            | Operation::Update { collection, .. }
            | Operation::Delete { collection, .. } => self.notify(collection),
            Operation::Batch(ops) => {
                let mut touched: Vec<&str> = Vec::new();
                for op in ops {
                    if let Operation::Set { collection, .. }
                    | Operation::Update { collection, .. }
                    | Operation::Delete { collection, .. } = op
                    {
                        if !touched.contains(&collection.as_str()) {
                            touched.push(collection);
                        }
                    }
                }
                for collection in touched {
                    self.notify(collection);
                }
            }
        }
        Ok(result)
    }

    async fn subscribe(
        &self,
        query: &Query,
        on_data: DataCallback,
        on_error: ErrorCallback,
    ) -> Result<DetachFn, StoreError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let id = self.next_listener.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().insert(
            id,
            Listener {
                query: query.clone(),
                on_data: on_data.clone(),
                on_error,
            },
        );

        on_data(self.run_query(query));

        let listeners = Arc::clone(&self.listeners);
        let detach_calls = Arc::clone(&self.detach_calls);
        Ok(Box::new(move || {
            detach_calls.fetch_add(1, Ordering::SeqCst);
            listeners.lock().remove(&id);
        }))
    }

    async fn disable_network(&self) -> Result<(), StoreError> {
        if self.fail_network_toggle.load(Ordering::SeqCst) {
            return Err(StoreError::internal("network toggle failed"));
        }
        self.network_enabled.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn enable_network(&self) -> Result<(), StoreError> {
        if self.fail_network_toggle.load(Ordering::SeqCst) {
            return Err(StoreError::internal("network toggle failed"));
        }
        if !self.network_enabled.swap(true, Ordering::SeqCst) {
            self.network_resets.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
