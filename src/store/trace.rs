//! Lossy tracing of the import pipeline.
//!
//! Every request transition (queued, start, finish) is published onto a
//! bounded [`TraceBus`]; a background thread fans events out to
//! subscribers. When publishers outrun the bus, the oldest unseen events
//! are overwritten rather than blocking the import path.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::context::FetchCause;
use crate::model::ObjectId;
use crate::store::priority::ImportPriorityKind;
use crate::store::queue::{ImportRequest, RequestKind};

/// Which pipeline transition an event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEventType {
    /// The request entered the queue.
    Queued,
    /// A worker began processing the request.
    Start,
    /// The request's promises were resolved.
    Finish,
}

/// One import pipeline transition.
#[derive(Debug, Clone)]
pub struct ImportTraceEvent {
    /// Id shared by all events of one request.
    pub unique: u64,
    /// The transition recorded.
    pub event_type: TraceEventType,
    /// The request's bucket.
    pub kind: RequestKind,
    /// The object being imported.
    pub id: ObjectId,
    /// Priority class at the time of the event.
    pub priority: ImportPriorityKind,
    /// Why the request was issued.
    pub cause: FetchCause,
    /// The requesting client process, when known.
    pub client_pid: Option<u32>,
    /// When the event was published.
    pub when: Instant,
}

impl ImportTraceEvent {
    /// Build an event describing `request` at `event_type`.
    pub fn for_request(request: &ImportRequest, event_type: TraceEventType) -> Self {
        Self {
            unique: request.unique(),
            event_type,
            kind: request.kind(),
            id: request.id().clone(),
            priority: request.priority().kind(),
            cause: request.cause(),
            client_pid: request.client_pid(),
            when: Instant::now(),
        }
    }
}

type Subscriber<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct BusState<T> {
    pending: VecDeque<T>,
    subscribers: Vec<(u64, Subscriber<T>)>,
    next_subscriber_id: u64,
    running: bool,
    overwritten: u64,
}

struct BusInner<T> {
    state: Mutex<BusState<T>>,
    wakeup: Condvar,
    capacity: usize,
}

/// A bounded, lossy publish/subscribe bus with a dedicated dispatch thread.
///
/// Publishing never blocks on subscribers; events beyond the capacity
/// overwrite the oldest undelivered ones. Subscribers observe events in
/// publish order but may miss overwritten ones.
pub struct TraceBus<T: Send + 'static> {
    inner: Arc<BusInner<T>>,
    dispatcher: Option<thread::JoinHandle<()>>,
}

/// Unsubscribes its subscriber when dropped. Owned by the party that also
/// owns the subscriber's captured state, so the subscription always ends
/// before the state it points into.
pub struct TraceSubscriptionHandle<T: Send + 'static> {
    inner: Weak<BusInner<T>>,
    id: u64,
}

impl<T: Send + 'static> TraceBus<T> {
    /// Create a bus holding at most `capacity` undelivered events.
    pub fn new(name: &str, capacity: usize) -> Self {
        let inner = Arc::new(BusInner {
            state: Mutex::new(BusState {
                pending: VecDeque::new(),
                subscribers: Vec::new(),
                next_subscriber_id: 1,
                running: true,
                overwritten: 0,
            }),
            wakeup: Condvar::new(),
            capacity: capacity.max(1),
        });

        let dispatch_inner = Arc::clone(&inner);
        let dispatcher = thread::Builder::new()
            .name(format!("tracebus-{name}"))
            .spawn(move || Self::dispatch_loop(dispatch_inner))
            .expect("spawning trace bus dispatcher");

        Self {
            inner,
            dispatcher: Some(dispatcher),
        }
    }

    fn dispatch_loop(inner: Arc<BusInner<T>>) {
        loop {
            let (batch, subscribers) = {
                let mut state = inner.state.lock();
                while state.running && state.pending.is_empty() {
                    inner.wakeup.wait(&mut state);
                }
                if !state.running && state.pending.is_empty() {
                    return;
                }
                let batch = std::mem::take(&mut state.pending);
                let subscribers: Vec<Subscriber<T>> = state
                    .subscribers
                    .iter()
                    .map(|(_, subscriber)| Arc::clone(subscriber))
                    .collect();
                (batch, subscribers)
            };
            // Deliver outside the lock so publishers never wait on
            // subscriber work.
            for event in &batch {
                for subscriber in &subscribers {
                    subscriber(event);
                }
            }
        }
    }

    /// Publish an event. Never blocks on subscribers; drops the oldest
    /// undelivered event when full.
    pub fn publish(&self, event: T) {
        {
            let mut state = self.inner.state.lock();
            if !state.running {
                return;
            }
            if state.pending.len() >= self.inner.capacity {
                state.pending.pop_front();
                state.overwritten += 1;
            }
            state.pending.push_back(event);
        }
        self.inner.wakeup.notify_one();
    }

    /// Register a subscriber. Dropping the returned handle unsubscribes.
    pub fn subscribe(
        &self,
        subscriber: impl Fn(&T) + Send + Sync + 'static,
    ) -> TraceSubscriptionHandle<T> {
        let mut state = self.inner.state.lock();
        let id = state.next_subscriber_id;
        state.next_subscriber_id += 1;
        state.subscribers.push((id, Arc::new(subscriber)));
        TraceSubscriptionHandle {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// How many events were overwritten before delivery.
    pub fn overwritten(&self) -> u64 {
        self.inner.state.lock().overwritten
    }
}

impl<T: Send + 'static> Drop for TraceBus<T> {
    fn drop(&mut self) {
        self.inner.state.lock().running = false;
        self.inner.wakeup.notify_all();
        if let Some(dispatcher) = self.dispatcher.take() {
            let _ = dispatcher.join();
        }
    }
}

impl<T: Send + 'static> Drop for TraceSubscriptionHandle<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut state = inner.state.lock();
            state.subscribers.retain(|(id, _)| *id != self.id);
        }
    }
}

/// A bounded ring of recent import events, kept for debugging.
pub struct ActivityBuffer {
    events: Mutex<VecDeque<ImportTraceEvent>>,
    capacity: usize,
}

impl ActivityBuffer {
    /// Create a buffer retaining the last `capacity` events.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
        })
    }

    /// Archive one event, discarding the oldest when full.
    pub fn add_event(&self, event: ImportTraceEvent) {
        let mut events = self.events.lock();
        if events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Snapshot of the retained events, oldest first.
    pub fn snapshot(&self) -> Vec<ImportTraceEvent> {
        self.events.lock().iter().cloned().collect()
    }
}
