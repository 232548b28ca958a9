// src/core/watch.rs

//! Reactive watched keys.
//!
//! A [`ReactiveKey`] keeps a client-side mirror of one remote value current:
//! it registers a server-side watch through the session group, re-fetches the
//! value through a caller-supplied retriever whenever a change notification
//! arrives, and re-registers itself after renames and full session outages.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

use crate::core::events::{BusEvent, EventBus, HandlerId};
use crate::core::session::{SessionEvent, SessionEventKind, SessionGroup};

/// Fetches the current value of a key. Invoked with the key's current name,
/// so a retriever stays correct across renames.
pub type ValueRetriever<T> = Arc<dyn Fn(String) -> BoxFuture<'static, Option<T>> + Send + Sync>;

/// One server-pushed notification for a watched key.
#[derive(Debug, Clone)]
pub struct WatchNotification {
    /// The remote watch id this notification belongs to.
    pub watch_id: String,
    /// Monotonic notification id; duplicates of the last-seen id are ignored.
    pub id: String,
    pub action: WatchAction,
    /// The key's new name, present on `Renamed`.
    pub new_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAction {
    Changed,
    Deleted,
    Renamed,
}

impl WatchNotification {
    /// Parses a notification event payload. `None` for anything malformed;
    /// an unknown action is malformed.
    pub fn from_payload(watch_id: &str, payload: &Value) -> Option<Self> {
        let action = match payload.get("action")?.as_str()? {
            "changed" => WatchAction::Changed,
            "deleted" => WatchAction::Deleted,
            "renamed" => WatchAction::Renamed,
            _ => return None,
        };
        let id = payload.get("id")?.as_str()?.to_string();
        let new_key = payload
            .get("newKey")
            .and_then(Value::as_str)
            .map(str::to_string);

        Some(Self {
            watch_id: watch_id.to_string(),
            id,
            action,
            new_key,
        })
    }
}

/// Events published by a reactive key.
#[derive(Debug, Clone)]
pub enum KeyEvent<T> {
    /// The mirrored value was re-fetched; carries the fresh value.
    Changed(Option<T>),
    /// The remote key was deleted; the cache is cleared.
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyEventKind {
    Changed,
    Deleted,
}

impl<T: Clone + Send + Sync + 'static> BusEvent for KeyEvent<T> {
    type Kind = KeyEventKind;

    fn kind(&self) -> KeyEventKind {
        match self {
            KeyEvent::Changed(_) => KeyEventKind::Changed,
            KeyEvent::Deleted => KeyEventKind::Deleted,
        }
    }
}

/// Bookkeeping for one active server-side watch: the remote id plus the two
/// group-bus listeners (notifications and reconnect resume) registered for it.
struct WatchSubscription {
    remote_id: String,
    notification_listener: HandlerId,
    reconnect_listener: HandlerId,
}

struct KeyState {
    /// The watched key's current name; renaming updates it.
    key: String,
    /// Last delivered notification id, for idempotent duplicate suppression.
    last_seen: Option<String>,
    subscription: Option<WatchSubscription>,
}

/// A client-side mirror of one remote value of type `T`.
///
/// Holds only a weak handle to the session group, so a forgotten key never
/// keeps a logged-out session alive.
pub struct ReactiveKey<T: Clone + Send + Sync + 'static> {
    bus: EventBus<KeyEvent<T>>,
    group: Weak<SessionGroup>,
    retriever: ValueRetriever<T>,
    state: Mutex<KeyState>,
    value: Mutex<Option<T>>,
    /// Serializes concurrent `start_watching` calls so at most one watch
    /// registration is in flight.
    registering: AtomicBool,
}

impl<T: Clone + Send + Sync + 'static> ReactiveKey<T> {
    /// Creates the key and seeds the cached value through one retrieval.
    /// Watching does not start until the caller asks for it.
    pub async fn for_key(
        key: &str,
        group: Weak<SessionGroup>,
        retriever: ValueRetriever<T>,
    ) -> Arc<Self> {
        let this = Arc::new(Self {
            bus: EventBus::new(),
            group,
            retriever,
            state: Mutex::new(KeyState {
                key: key.to_string(),
                last_seen: None,
                subscription: None,
            }),
            value: Mutex::new(None),
            registering: AtomicBool::new(false),
        });
        this.retrieve_value().await;
        this
    }

    /// The key's current name. Renaming on the server updates it.
    pub fn key(&self) -> String {
        self.state.lock().key.clone()
    }

    /// The last retrieved value, if any.
    pub fn value(&self) -> Option<T> {
        self.value.lock().clone()
    }

    /// True iff an active subscription with a remote watch id exists.
    pub fn is_watching(&self) -> bool {
        self.state.lock().subscription.is_some()
    }

    /// The remote watch id of the active subscription, if watching.
    pub fn watch_id(&self) -> Option<String> {
        self.state
            .lock()
            .subscription
            .as_ref()
            .map(|sub| sub.remote_id.clone())
    }

    pub fn bus(&self) -> &EventBus<KeyEvent<T>> {
        &self.bus
    }

    /// Registers the server-side watch and wires the notification stream.
    /// A no-op when already watching or when the session group is gone.
    pub async fn start_watching(self: &Arc<Self>) -> bool {
        if self.is_watching() {
            return true;
        }
        let Some(group) = self.group.upgrade() else {
            return false;
        };
        if self.registering.swap(true, Ordering::AcqRel) {
            return false;
        }
        let registered = self.register_watch(&group).await;
        self.registering.store(false, Ordering::Release);
        registered
    }

    async fn register_watch(self: &Arc<Self>, group: &Arc<SessionGroup>) -> bool {
        let key = self.key();
        let Some(remote_id) = group.watch(&key).await else {
            debug!(key = %key, "watch registration failed");
            return false;
        };

        let weak = Arc::downgrade(self);
        let notification_listener = group.bus().on(
            SessionEventKind::Watch(remote_id.clone()),
            move |event| {
                if let (Some(this), SessionEvent::Notification(notification)) =
                    (weak.upgrade(), event)
                {
                    tokio::spawn(async move { this.handle_notification(notification).await });
                }
            },
        );

        let weak = Arc::downgrade(self);
        let reconnect_listener = group.bus().on(SessionEventKind::Connected, move |_| {
            if let Some(this) = weak.upgrade() {
                tokio::spawn(async move { this.resume_after_reconnect().await });
            }
        });

        let replaced = {
            let mut state = self.state.lock();
            let replaced = state.subscription.take();
            state.subscription = Some(WatchSubscription {
                remote_id,
                notification_listener,
                reconnect_listener,
            });
            replaced
        };
        if let Some(old) = replaced {
            group.bus().off(old.notification_listener);
            group.bus().off(old.reconnect_listener);
        }

        debug!(key = %key, "watching started");
        true
    }

    /// Unregisters the server-side watch. Local bookkeeping is cleared only
    /// once the server confirms.
    pub async fn stop_watching(&self) -> bool {
        let remote_id = {
            self.state
                .lock()
                .subscription
                .as_ref()
                .map(|sub| sub.remote_id.clone())
        };
        let Some(remote_id) = remote_id else {
            return false;
        };
        let Some(group) = self.group.upgrade() else {
            return false;
        };

        if !group.stop_watching(&remote_id).await {
            return false;
        }

        if let Some(sub) = self.state.lock().subscription.take() {
            group.bus().off(sub.notification_listener);
            group.bus().off(sub.reconnect_listener);
        }
        debug!(key = %self.key(), "watching stopped");
        true
    }

    /// Re-fetches the value and publishes `Changed` with it.
    async fn retrieve_value(&self) {
        let key = self.key();
        let value = (self.retriever)(key).await;
        *self.value.lock() = value.clone();
        self.bus.emit(KeyEvent::Changed(value));
    }

    fn handle_notification(
        self: Arc<Self>,
        notification: WatchNotification,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
        {
            let mut state = self.state.lock();
            if state.last_seen.as_deref() == Some(notification.id.as_str()) {
                debug!(
                    key = %state.key,
                    notification = %notification.id,
                    "suppressing duplicate watch notification"
                );
                return;
            }
            state.last_seen = Some(notification.id.clone());
        }

        match notification.action {
            WatchAction::Changed => self.retrieve_value().await,
            WatchAction::Deleted => {
                *self.value.lock() = None;
                self.bus.emit(KeyEvent::Deleted);
            }
            WatchAction::Renamed => {
                let was_watching = self.is_watching();

                self.stop_watching().await;

                {
                    let mut state = self.state.lock();
                    if let Some(new_key) = &notification.new_key {
                        debug!(old = %state.key, new = %new_key, "watched key renamed");
                        state.key = new_key.clone();
                    }
                }
                // The cached value belonged to the old name.
                *self.value.lock() = None;

                if was_watching && self.start_watching().await {
                    self.retrieve_value().await;
                }
            }
        }
        })
    }

    /// The session was re-established after a full outage: the server-side
    /// watch died with the old session, so discard the stale remote id and
    /// register anew.
    fn resume_after_reconnect(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let stale = { self.state.lock().subscription.take() };
            let Some(stale) = stale else {
                return;
            };
            if let Some(group) = self.group.upgrade() {
                group.bus().off(stale.notification_listener);
                group.bus().off(stale.reconnect_listener);
            }
            debug!(key = %self.key(), "re-registering watch after session reconnect");
            self.start_watching().await;
        })
    }
}
