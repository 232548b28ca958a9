// src/client.rs

//! The top-level client facade.
//!
//! `KeySyncClient` resolves an application key through the directory service,
//! owns the resulting session group, and exposes the typed command catalog
//! and reactive watched keys on top of it.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::bootstrap::{Bootstrap, DirectoryClient};
use crate::core::commands;
use crate::core::events::{BusEvent, EventBus, HandlerId};
use crate::core::session::{SessionEventKind, SessionGroup};
use crate::core::transport::{Connector, TcpConnector};
use crate::core::watch::{ReactiveKey, ValueRetriever};

/// Lifecycle of the logical client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    NotConnected,
    Connecting,
    Connected,
}

/// Events published on the client's bus.
///
/// `Connected`/`Disconnected` mirror the session group's aggregate
/// connectivity; `ConnectFailed` reports a `connect()` attempt that never
/// produced a session.
#[derive(Debug, Clone, Copy)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    ConnectFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientEventKind {
    Connected,
    Disconnected,
    ConnectFailed,
}

impl BusEvent for ClientEvent {
    type Kind = ClientEventKind;

    fn kind(&self) -> ClientEventKind {
        match self {
            ClientEvent::Connected => ClientEventKind::Connected,
            ClientEvent::Disconnected => ClientEventKind::Disconnected,
            ClientEvent::ConnectFailed => ClientEventKind::ConnectFailed,
        }
    }
}

enum BeginConnect {
    Started,
    InFlight,
    AlreadyConnected,
}

/// An asynchronous client for the KeySync service.
pub struct KeySyncClient {
    app_key: String,
    config: Arc<Config>,
    connector: Arc<dyn Connector>,
    bus: EventBus<ClientEvent>,
    status: Mutex<ClientStatus>,
    group: Mutex<Option<Arc<SessionGroup>>>,
    group_listeners: Mutex<Vec<HandlerId>>,
}

impl KeySyncClient {
    /// A client with the default configuration and the TCP transport.
    pub fn new(app_key: impl Into<String>) -> Self {
        Self::with_config(app_key, Config::default())
    }

    pub fn with_config(app_key: impl Into<String>, config: Config) -> Self {
        Self::with_connector(app_key, config, Arc::new(TcpConnector))
    }

    /// A client over a custom transport. The connector is handed to every
    /// session group member; embedders use this to tunnel or to test.
    pub fn with_connector(
        app_key: impl Into<String>,
        config: Config,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            app_key: app_key.into(),
            config: Arc::new(config),
            connector,
            bus: EventBus::new(),
            status: Mutex::new(ClientStatus::NotConnected),
            group: Mutex::new(None),
            group_listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn status(&self) -> ClientStatus {
        *self.status.lock()
    }

    /// True while the session group has at least one live endpoint.
    pub fn is_connected(&self) -> bool {
        self.group
            .lock()
            .as_ref()
            .is_some_and(|group| group.is_connected())
    }

    pub fn bus(&self) -> &EventBus<ClientEvent> {
        &self.bus
    }

    /// The active session group, while logged in.
    pub fn session(&self) -> Option<Arc<SessionGroup>> {
        self.group.lock().clone()
    }

    /// Resolves the application key through the directory service and brings
    /// the session group up. `true` once at least one endpoint is ready.
    ///
    /// Concurrent calls never run a second bootstrap: late callers suspend
    /// until the in-flight attempt settles.
    pub async fn connect(&self) -> bool {
        let settled = self.bus.first_of(&[
            ClientEventKind::Connected,
            ClientEventKind::ConnectFailed,
        ]);

        match self.begin_connect() {
            BeginConnect::AlreadyConnected => true,
            BeginConnect::InFlight => {
                matches!(settled.wait().await, Some(ClientEvent::Connected))
            }
            BeginConnect::Started => {
                debug!("resolving session through directory service");
                let bootstrap = match DirectoryClient::new(self.config.bootstrap_url.clone()) {
                    Ok(directory) => directory.init(&self.app_key).await,
                    Err(e) => Err(e),
                };
                match bootstrap {
                    Ok(bootstrap) => self.establish(bootstrap).await,
                    Err(e) => {
                        warn!("bootstrap failed: {e}");
                        self.fail_connect()
                    }
                }
            }
        }
    }

    /// Brings the session group up from an already-resolved session, skipping
    /// the directory exchange. Useful when the bootstrap response is cached
    /// or supplied out of band.
    pub async fn connect_with_session(&self, bootstrap: Bootstrap) -> bool {
        let settled = self.bus.first_of(&[
            ClientEventKind::Connected,
            ClientEventKind::ConnectFailed,
        ]);

        match self.begin_connect() {
            BeginConnect::AlreadyConnected => true,
            BeginConnect::InFlight => {
                matches!(settled.wait().await, Some(ClientEvent::Connected))
            }
            BeginConnect::Started => self.establish(bootstrap).await,
        }
    }

    fn begin_connect(&self) -> BeginConnect {
        let mut status = self.status.lock();
        match *status {
            ClientStatus::Connected => BeginConnect::AlreadyConnected,
            ClientStatus::Connecting => BeginConnect::InFlight,
            ClientStatus::NotConnected => {
                *status = ClientStatus::Connecting;
                BeginConnect::Started
            }
        }
    }

    async fn establish(&self, bootstrap: Bootstrap) -> bool {
        info!(
            endpoints = bootstrap.endpoints.len(),
            "establishing session group"
        );
        let group = SessionGroup::new(
            bootstrap.endpoints,
            bootstrap.session_key,
            bootstrap.session_tag,
            Arc::clone(&self.connector),
            Arc::clone(&self.config),
        );

        let ready = group.bus().first_of(&[SessionEventKind::Connected]);
        let connected = group.is_connected()
            || tokio::time::timeout(self.config.connect_timeout, ready.wait())
                .await
                .ok()
                .flatten()
                .is_some();

        if !connected {
            warn!("no session endpoint became ready in time");
            group.dispose();
            return self.fail_connect();
        }

        self.adopt_group(group);
        *self.status.lock() = ClientStatus::Connected;
        self.bus.emit(ClientEvent::Connected);
        true
    }

    fn fail_connect(&self) -> bool {
        *self.status.lock() = ClientStatus::NotConnected;
        self.bus.emit(ClientEvent::ConnectFailed);
        false
    }

    /// Mirrors the group's aggregate connectivity onto the client bus.
    fn adopt_group(&self, group: Arc<SessionGroup>) {
        let bus = self.bus.clone();
        let connected_id = group.bus().on(SessionEventKind::Connected, move |_| {
            bus.emit(ClientEvent::Connected);
        });
        let bus = self.bus.clone();
        let disconnected_id = group.bus().on(SessionEventKind::Disconnected, move |_| {
            bus.emit(ClientEvent::Disconnected);
        });

        *self.group_listeners.lock() = vec![connected_id, disconnected_id];
        *self.group.lock() = Some(group);
    }

    /// Tears the session group down and returns to `NotConnected`.
    pub fn disconnect(&self) {
        let group = self.group.lock().take();
        if let Some(group) = group {
            for id in self.group_listeners.lock().drain(..) {
                group.bus().off(id);
            }
            group.dispose();
            info!("session closed");
        }

        let was = {
            let mut status = self.status.lock();
            std::mem::replace(&mut *status, ClientStatus::NotConnected)
        };
        if was == ClientStatus::Connected {
            self.bus.emit(ClientEvent::Disconnected);
        }
    }

    fn group_weak(&self) -> Weak<SessionGroup> {
        self.group
            .lock()
            .as_ref()
            .map(Arc::downgrade)
            .unwrap_or_default()
    }

    /// A reactive mirror of a string key, fetched with `GET`.
    pub async fn watched_string(&self, key: &str) -> Arc<ReactiveKey<String>> {
        let retriever = self.retriever("get", commands::string_result);
        ReactiveKey::for_key(key, self.group_weak(), retriever).await
    }

    /// A reactive mirror of an integer key, fetched with `GET`.
    pub async fn watched_int(&self, key: &str) -> Arc<ReactiveKey<i64>> {
        let retriever = self.retriever("get", commands::int_result);
        ReactiveKey::for_key(key, self.group_weak(), retriever).await
    }

    /// A reactive mirror of a hash key, fetched with `HGETALL`.
    pub async fn watched_hash(&self, key: &str) -> Arc<ReactiveKey<HashMap<String, String>>> {
        let retriever = self.retriever("hgetall", commands::map_result);
        ReactiveKey::for_key(key, self.group_weak(), retriever).await
    }

    /// A reactive mirror of a list key, fetched with a full-range `LRANGE`.
    pub async fn watched_list(&self, key: &str) -> Arc<ReactiveKey<Vec<String>>> {
        let group = self.group_weak();
        let retriever: ValueRetriever<Vec<String>> = Arc::new({
            let group = group.clone();
            move |key: String| {
                let group = group.clone();
                Box::pin(async move {
                    let group = group.upgrade()?;
                    group
                        .dispatch_first_value_map(
                            "lrange",
                            vec![Value::from(key), Value::from(0), Value::from(-1)],
                            commands::string_array_result,
                        )
                        .await
                })
            }
        });
        ReactiveKey::for_key(key, group, retriever).await
    }

    /// Builds a retriever running one single-key command through the
    /// nil-tolerant dispatch.
    fn retriever<T>(
        &self,
        command: &'static str,
        convert: fn(Value) -> Option<T>,
    ) -> ValueRetriever<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let group = self.group_weak();
        Arc::new(move |key: String| {
            let group = group.clone();
            Box::pin(async move {
                let group = group.upgrade()?;
                group
                    .dispatch_first_value_map(command, vec![Value::from(key)], convert)
                    .await
            })
        })
    }
}

impl Drop for KeySyncClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}
