// src/core/events.rs

//! A typed publish/subscribe event bus.
//!
//! Every stateful component of the client (connection, session group,
//! reactive key, client facade) owns one `EventBus` and publishes its
//! lifecycle through it. Each owner defines its own event enum; subscription
//! is by the enum's kind discriminant, so routing is resolved per event kind
//! at compile time instead of through string names and downcasts.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use uuid::Uuid;

/// A payload that can be published on an [`EventBus`].
///
/// `Kind` identifies the subscription channel for a payload. It is usually a
/// fieldless mirror of the event enum, but it may carry data when a family of
/// events fans out into per-instance streams (watch notifications are keyed
/// by their remote watch id this way).
pub trait BusEvent: Clone + Send + Sync + 'static {
    type Kind: Clone + Eq + Hash + Send + Sync + fmt::Debug + 'static;

    fn kind(&self) -> Self::Kind;
}

/// A unique identifier for one registered handler.
pub type HandlerId = Uuid;

type Callback<E> = Box<dyn Fn(E) + Send + Sync>;

/// One registered handler. The active flag is atomic so that `off` observed
/// mid-emission suppresses the callback without touching the handler table.
struct Handler<E: BusEvent> {
    id: HandlerId,
    kind: E::Kind,
    once: bool,
    active: AtomicBool,
    callback: Callback<E>,
}

struct HandlerTable<E: BusEvent> {
    by_id: HashMap<HandlerId, Arc<Handler<E>>>,
    ids_by_kind: HashMap<E::Kind, Vec<HandlerId>>,
}

struct BusInner<E: BusEvent> {
    table: Mutex<HandlerTable<E>>,
}

/// A typed publish/subscribe dispatcher.
///
/// Handler bodies never run on the emitter's stack: `emit` snapshots the
/// matching handlers under the table lock and invokes them from a spawned
/// task, so a handler may register or remove handlers on the same bus without
/// corrupting the iteration that delivered it.
pub struct EventBus<E: BusEvent> {
    inner: Arc<BusInner<E>>,
}

impl<E: BusEvent> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: BusEvent> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: BusEvent> EventBus<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                table: Mutex::new(HandlerTable {
                    by_id: HashMap::new(),
                    ids_by_kind: HashMap::new(),
                }),
            }),
        }
    }

    /// Registers a handler for one event kind and returns its id.
    pub fn on<F>(&self, kind: E::Kind, callback: F) -> HandlerId
    where
        F: Fn(E) + Send + Sync + 'static,
    {
        self.register(kind, false, callback)
    }

    /// Registers a handler that deactivates itself before its first
    /// invocation, so a re-entrant emission cannot fire it twice.
    pub fn once<F>(&self, kind: E::Kind, callback: F) -> HandlerId
    where
        F: Fn(E) + Send + Sync + 'static,
    {
        self.register(kind, true, callback)
    }

    fn register<F>(&self, kind: E::Kind, once: bool, callback: F) -> HandlerId
    where
        F: Fn(E) + Send + Sync + 'static,
    {
        let handler = Arc::new(Handler {
            id: Uuid::new_v4(),
            kind: kind.clone(),
            once,
            active: AtomicBool::new(true),
            callback: Box::new(callback),
        });

        let mut table = self.inner.table.lock();
        table.ids_by_kind.entry(kind).or_default().push(handler.id);
        let id = handler.id;
        table.by_id.insert(id, handler);
        id
    }

    /// Deactivates and removes a single handler, regardless of its kind.
    /// A no-op for ids that are already gone.
    pub fn off(&self, id: HandlerId) {
        let mut table = self.inner.table.lock();
        if let Some(handler) = table.by_id.remove(&id) {
            handler.active.store(false, Ordering::Release);
            if let Some(ids) = table.ids_by_kind.get_mut(&handler.kind) {
                ids.retain(|other| *other != id);
            }
        }
    }

    /// Deactivates and removes every handler registered for one event kind.
    pub fn off_event(&self, kind: &E::Kind) {
        let mut table = self.inner.table.lock();
        if let Some(ids) = table.ids_by_kind.remove(kind) {
            for id in ids {
                if let Some(handler) = table.by_id.remove(&id) {
                    handler.active.store(false, Ordering::Release);
                }
            }
        }
    }

    /// Publishes an event to every handler currently registered for its kind.
    ///
    /// Each handler is invoked at most once per emission, in registration
    /// order, from a spawned task. Handlers deactivated between scheduling
    /// and invocation are skipped.
    pub fn emit(&self, event: E) {
        let batch: Vec<Arc<Handler<E>>> = {
            let table = self.inner.table.lock();
            match table.ids_by_kind.get(&event.kind()) {
                Some(ids) => ids
                    .iter()
                    .filter_map(|id| table.by_id.get(id))
                    .filter(|handler| handler.active.load(Ordering::Acquire))
                    .cloned()
                    .collect(),
                None => return,
            }
        };

        if batch.is_empty() {
            return;
        }

        let bus = self.clone();
        let deliver = move || {
            for handler in batch {
                if handler.once {
                    // Claim the single invocation; lose the race, skip the call.
                    if handler
                        .active
                        .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        continue;
                    }
                } else if !handler.active.load(Ordering::Acquire) {
                    continue;
                }

                (handler.callback)(event.clone());

                if handler.once {
                    bus.off(handler.id);
                }
            }
        };

        // Without a runtime (teardown from a plain Drop) delivery degrades to
        // the caller's stack; every async path stays off it.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { deliver() });
            }
            Err(_) => deliver(),
        }
    }

    /// Registers transient listeners for the given kinds and returns a
    /// handle resolving to the first event that fires among them.
    ///
    /// Registration happens eagerly, before the handle is awaited, so an
    /// event emitted right after this call is not missed. Every transient
    /// listener is unregistered when the handle resolves or is dropped,
    /// including the ones whose kind never fired.
    pub fn first_of(&self, kinds: &[E::Kind]) -> FirstEvent<E> {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));

        let ids: Vec<HandlerId> = kinds
            .iter()
            .map(|kind| {
                let slot = Arc::clone(&slot);
                self.once(kind.clone(), move |event| {
                    if let Some(tx) = slot.lock().take() {
                        let _ = tx.send(event);
                    }
                })
            })
            .collect();

        FirstEvent {
            bus: self.clone(),
            ids,
            rx,
        }
    }

    /// Suspends until the first of the given kinds fires.
    ///
    /// Resolves to `None` only if the listeners are torn down externally
    /// (e.g. `off_event` on a kind being waited on).
    pub fn wait_for_one_of(&self, kinds: &[E::Kind]) -> impl Future<Output = Option<E>> + Send {
        let first = self.first_of(kinds);
        async move { first.wait().await }
    }

    /// Number of live handlers, all kinds included.
    pub fn handler_count(&self) -> usize {
        self.inner.table.lock().by_id.len()
    }
}

/// A pending [`EventBus::first_of`] subscription. Dropping it unregisters
/// the transient listeners it created.
pub struct FirstEvent<E: BusEvent> {
    bus: EventBus<E>,
    ids: Vec<HandlerId>,
    rx: oneshot::Receiver<E>,
}

impl<E: BusEvent> FirstEvent<E> {
    /// Waits for the first matching event. `None` means the listeners were
    /// removed before any of the kinds fired.
    pub async fn wait(mut self) -> Option<E> {
        (&mut self.rx).await.ok()
    }
}

impl<E: BusEvent> Drop for FirstEvent<E> {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            self.bus.off(id);
        }
    }
}
