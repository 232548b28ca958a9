// src/core/session.rs

//! The redundant multi-endpoint session group.
//!
//! One group owns one connection per endpoint for the same logical session.
//! Logical requests fan out to every member and the first valid answer wins;
//! connectivity is the aggregate OR of the members. Watch notifications from
//! any member surface on the group bus keyed by their remote watch id.

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::connection::{Connection, ConnectionEvent, ConnectionEventKind};
use crate::core::events::{BusEvent, EventBus, HandlerId};
use crate::core::protocol;
use crate::core::transport::{Connector, Endpoint};
use crate::core::watch::WatchNotification;

/// Events published on a session group's bus.
///
/// `Connected` fires when the group goes from zero connected members to one;
/// `Disconnected` only once no member remains connected. `Notification`
/// events form one stream per remote watch id.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    Notification(WatchNotification),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionEventKind {
    Connected,
    Disconnected,
    Watch(String),
}

impl BusEvent for SessionEvent {
    type Kind = SessionEventKind;

    fn kind(&self) -> SessionEventKind {
        match self {
            SessionEvent::Connected => SessionEventKind::Connected,
            SessionEvent::Disconnected => SessionEventKind::Disconnected,
            SessionEvent::Notification(n) => SessionEventKind::Watch(n.watch_id.clone()),
        }
    }
}

/// A fixed-membership group of redundant connections carrying one logical
/// session. Constructed once per session after bootstrap, torn down on
/// logout.
pub struct SessionGroup {
    bus: EventBus<SessionEvent>,
    members: Vec<Arc<Connection>>,
    /// Edge detector for the aggregate connectivity signal.
    any_connected: Mutex<bool>,
    /// Listener registrations on member buses, removed on dispose.
    member_listeners: Mutex<Vec<(usize, HandlerId)>>,
    disposed: AtomicBool,
}

impl SessionGroup {
    /// Builds the group and starts one connection per endpoint, each
    /// independently running its own state machine.
    pub fn new(
        endpoints: Vec<Endpoint>,
        session_key: String,
        session_tag: Option<String>,
        connector: Arc<dyn Connector>,
        config: Arc<Config>,
    ) -> Arc<Self> {
        let members: Vec<Arc<Connection>> = endpoints
            .into_iter()
            .map(|endpoint| {
                debug!(%endpoint, "adding session group member");
                Connection::new(
                    endpoint,
                    session_key.clone(),
                    session_tag.clone(),
                    Arc::clone(&connector),
                    Arc::clone(&config),
                )
            })
            .collect();

        let group = Arc::new(Self {
            bus: EventBus::new(),
            members,
            any_connected: Mutex::new(false),
            member_listeners: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        });

        group.wire_members();

        for member in &group.members {
            let member = Arc::clone(member);
            tokio::spawn(async move {
                member.connect().await;
            });
        }

        group
    }

    pub fn bus(&self) -> &EventBus<SessionEvent> {
        &self.bus
    }

    /// True while at least one member is connected.
    pub fn is_connected(&self) -> bool {
        self.members.iter().any(|member| member.is_connected())
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Subscribes each member's connectivity and server events into the
    /// group. Members hold no reference back into the group; the callbacks
    /// carry weak handles and fall silent once the group is gone.
    fn wire_members(self: &Arc<Self>) {
        let mut listeners = self.member_listeners.lock();
        for (index, member) in self.members.iter().enumerate() {
            // Every transition matters for the aggregate: a member sitting in
            // `Reconnecting` is down even though it never visited
            // `Disconnected`.
            let weak = Arc::downgrade(self);
            let state_id = member.bus().on(ConnectionEventKind::StateChanged, move |_| {
                if let Some(group) = weak.upgrade() {
                    group.refresh_connectivity();
                }
            });

            let weak = Arc::downgrade(self);
            let server_event_id = member.bus().on(ConnectionEventKind::ServerEvent, move |event| {
                if let (Some(group), ConnectionEvent::ServerEvent { name, payload }) =
                    (weak.upgrade(), event)
                {
                    group.handle_server_event(&name, payload);
                }
            });

            listeners.push((index, state_id));
            listeners.push((index, server_event_id));
        }
    }

    /// Recomputes the aggregate connectivity signal and emits on the edges.
    fn refresh_connectivity(&self) {
        let now = self.is_connected();
        {
            let mut was = self.any_connected.lock();
            if *was == now {
                return;
            }
            *was = now;
        }
        if now {
            info!("session group connected");
            self.bus.emit(SessionEvent::Connected);
        } else {
            warn!("session group lost all members");
            self.bus.emit(SessionEvent::Disconnected);
        }
    }

    fn handle_server_event(&self, name: &str, payload: Value) {
        if let Some(watch_id) = protocol::watch_event_id(name) {
            match WatchNotification::from_payload(watch_id, &payload) {
                Some(notification) => self.bus.emit(SessionEvent::Notification(notification)),
                None => debug!(watch = watch_id, "discarding malformed watch notification"),
            }
        }
    }

    /// Fans the request out to every member and returns the first settled
    /// result, discarding the rest. Once a member's result is accepted,
    /// later results from other members are dropped, even if they arrive
    /// after.
    pub async fn dispatch(&self, name: &str, args: Vec<Value>) -> Option<Value> {
        self.dispatch_map(name, args, Some).await
    }

    /// `dispatch` with a typed conversion applied per member before
    /// arbitration.
    pub async fn dispatch_map<T, F>(&self, name: &str, args: Vec<Value>, convert: F) -> Option<T>
    where
        F: Fn(Value) -> Option<T>,
    {
        let convert = &convert;
        let mut races: FuturesUnordered<_> = self
            .members
            .iter()
            .map(|member| {
                let args = args.clone();
                async move { member.send_command(name, args).await.and_then(convert) }
            })
            .collect();

        races.next().await.flatten()
    }

    /// The nil-tolerant dispatch variant for queries where any single member
    /// may legitimately hold no value: a member's absent answer is accepted
    /// only once every member has answered absent, while any member's
    /// present answer wins immediately.
    pub async fn dispatch_first_value(&self, name: &str, args: Vec<Value>) -> Option<Value> {
        self.dispatch_first_value_map(name, args, Some).await
    }

    /// `dispatch_first_value` with a typed conversion applied per member
    /// before arbitration.
    pub async fn dispatch_first_value_map<T, F>(
        &self,
        name: &str,
        args: Vec<Value>,
        convert: F,
    ) -> Option<T>
    where
        F: Fn(Value) -> Option<T>,
    {
        let total = self.members.len();
        let convert = &convert;
        let mut races: FuturesUnordered<_> = self
            .members
            .iter()
            .map(|member| {
                let args = args.clone();
                async move { member.send_command(name, args).await.and_then(convert) }
            })
            .collect();

        let mut absent = 0usize;
        while let Some(result) = races.next().await {
            if result.is_some() {
                return result;
            }
            absent += 1;
            if absent >= total {
                return None;
            }
        }
        None
    }

    /// Registers a server-side watch for one key, returning the remote watch
    /// id.
    pub async fn watch(&self, key: &str) -> Option<String> {
        self.dispatch_first_value_map("watch", vec![Value::String(key.to_string())], |ack| {
            ack.get("id").and_then(Value::as_str).map(str::to_string)
        })
        .await
    }

    /// Releases a server-side watch. `true` once the server confirms.
    pub async fn stop_watching(&self, watch_id: &str) -> bool {
        self.dispatch_map("unwatch", vec![Value::String(watch_id.to_string())], |ack| {
            ack.get("ok").and_then(Value::as_bool)
        })
        .await
        .unwrap_or(false)
    }

    /// Tears every member down and silences the group bus. Safe to call more
    /// than once.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("disposing session group");

        for (index, id) in self.member_listeners.lock().drain(..) {
            if let Some(member) = self.members.get(index) {
                member.bus().off(id);
            }
        }

        for member in &self.members {
            member.dispose();
        }

        let was_connected = {
            let mut was = self.any_connected.lock();
            std::mem::replace(&mut *was, false)
        };
        if was_connected {
            self.bus.emit(SessionEvent::Disconnected);
        }
    }
}

impl Drop for SessionGroup {
    fn drop(&mut self) {
        self.dispose();
    }
}
