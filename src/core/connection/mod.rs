// src/core/connection/mod.rs

//! One physical session to one endpoint: the connect/handshake/reconnect
//! state machine and the correlated request table.

mod state;

pub use state::{ConnectionEvent, ConnectionEventKind, ConnectionState};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::core::events::EventBus;
use crate::core::protocol::{self, Frame};
use crate::core::transport::{Connector, Endpoint};

/// Bookkeeping for the currently installed transport instance. Each connect
/// attempt installs a fresh one; the epoch lets stale read loops recognize
/// that a newer transport has taken over.
struct TransportCtl {
    outbound: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    epoch: u64,
}

enum BeginConnect {
    Started,
    InFlight,
    AlreadyConnected,
}

/// A single session transport to one [`Endpoint`], owned by a session group.
///
/// The connection owns its transport exclusively and recreates it on every
/// (re)connect attempt. All lifecycle is published on the connection's
/// [`EventBus`]; callers observe outcomes, they never poll.
pub struct Connection {
    endpoint: Endpoint,
    config: Arc<Config>,
    connector: Arc<dyn Connector>,
    bus: EventBus<ConnectionEvent>,
    /// Session key presented on handshake; the server may reassign it.
    session_key: Mutex<String>,
    /// Opaque session metadata from bootstrap, forwarded on handshake.
    session_tag: Option<String>,
    state: Mutex<ConnectionState>,
    transport: Mutex<Option<TransportCtl>>,
    /// In-flight correlated requests. An entry is consumed by exactly one
    /// resolution; late or duplicate acknowledgements find nothing and are
    /// dropped.
    pending: DashMap<u64, oneshot::Sender<Value>>,
    next_request_id: AtomicU64,
    next_epoch: AtomicU64,
    disposed: AtomicBool,
}

impl Connection {
    pub fn new(
        endpoint: Endpoint,
        session_key: String,
        session_tag: Option<String>,
        connector: Arc<dyn Connector>,
        config: Arc<Config>,
    ) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            config,
            connector,
            bus: EventBus::new(),
            session_key: Mutex::new(session_key),
            session_tag,
            state: Mutex::new(ConnectionState::Disconnected),
            transport: Mutex::new(None),
            pending: DashMap::new(),
            next_request_id: AtomicU64::new(1),
            next_epoch: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The session key currently associated with this transport.
    pub fn session_key(&self) -> String {
        self.session_key.lock().clone()
    }

    pub fn bus(&self) -> &EventBus<ConnectionEvent> {
        &self.bus
    }

    /// Establishes the session, returning `true` once the handshake has
    /// settled into `Connected`.
    ///
    /// Already connected: immediate success. A handshake already in flight:
    /// suspends until that attempt reaches a terminal state, so concurrent
    /// callers never race a second handshake onto the wire.
    pub async fn connect(self: &Arc<Self>) -> bool {
        // Register for the terminal event before touching the state so a
        // fast attempt cannot settle unobserved.
        let settled = self.bus.first_of(&[
            ConnectionEventKind::Connected,
            ConnectionEventKind::Disconnected,
        ]);

        match self.begin_connect() {
            BeginConnect::AlreadyConnected => true,
            BeginConnect::InFlight => {
                matches!(settled.wait().await, Some(ConnectionEvent::Connected))
            }
            BeginConnect::Started => {
                let this = Arc::clone(self);
                tokio::spawn(async move { this.run_connect_cycle().await });
                matches!(settled.wait().await, Some(ConnectionEvent::Connected))
            }
        }
    }

    fn begin_connect(&self) -> BeginConnect {
        let mut state = self.state.lock();
        match *state {
            ConnectionState::Connected => BeginConnect::AlreadyConnected,
            ConnectionState::Connecting | ConnectionState::Reconnecting => BeginConnect::InFlight,
            ConnectionState::Disconnected => {
                *state = ConnectionState::Connecting;
                drop(state);
                self.announce(ConnectionState::Connecting);
                BeginConnect::Started
            }
        }
    }

    /// One full connect cycle: open a fresh transport, run the handshake,
    /// settle into `Connected` or `Disconnected`. A transport-level connect
    /// timeout discards the attempt and retries after `reconnect_delay`; a
    /// hard transport error or a rejected handshake is terminal.
    async fn run_connect_cycle(self: Arc<Self>) {
        loop {
            if self.disposed.load(Ordering::Acquire) {
                self.transition(ConnectionState::Disconnected);
                return;
            }

            let attempt = tokio::time::timeout(
                self.config.connect_timeout,
                self.connector.connect(&self.endpoint),
            )
            .await;

            match attempt {
                Err(_) => {
                    debug!(
                        endpoint = %self.endpoint,
                        "transport connect timed out; retrying in {:?}",
                        self.config.reconnect_delay
                    );
                    tokio::time::sleep(self.config.reconnect_delay).await;
                }
                Ok(Err(e)) => {
                    warn!(endpoint = %self.endpoint, "transport connect failed: {e}");
                    self.transition(ConnectionState::Disconnected);
                    return;
                }
                Ok(Ok(channel)) => {
                    if self.disposed.load(Ordering::Acquire) {
                        self.transition(ConnectionState::Disconnected);
                        return;
                    }
                    let (epoch, cancel) = self.install_transport(channel.outbound);
                    tokio::spawn(Arc::clone(&self).run_read_loop(
                        channel.inbound,
                        cancel,
                        epoch,
                    ));

                    if self.handshake().await {
                        self.transition(ConnectionState::Connected);
                    } else {
                        warn!(endpoint = %self.endpoint, "session handshake failed");
                        self.teardown_transport(epoch);
                        self.transition(ConnectionState::Disconnected);
                    }
                    return;
                }
            }
        }
    }

    /// The `init` exchange that (re)establishes the session key after a
    /// transport-level connect.
    async fn handshake(&self) -> bool {
        let mut params = serde_json::Map::new();
        params.insert("key".into(), Value::String(self.session_key()));
        if let Some(tag) = &self.session_tag {
            params.insert("rs".into(), Value::String(tag.clone()));
        }

        let Some(ack) = self
            .request(protocol::INIT_EVENT, vec![Value::Object(params)])
            .await
        else {
            return false;
        };

        match ack.get("key").and_then(Value::as_str) {
            Some(key) => {
                *self.session_key.lock() = key.to_string();
                debug!(endpoint = %self.endpoint, "session initialized");
                true
            }
            None => false,
        }
    }

    /// Issues a correlated request carrying `[name] + args` and awaits the
    /// acknowledgement.
    ///
    /// Resolves to `None` on timeout, on a missing transport, and on a torn
    /// down pending slot; none of these fault the connection. A result
    /// arriving after the timeout is silently discarded, never applied.
    pub async fn send_command(&self, name: &str, args: Vec<Value>) -> Option<Value> {
        self.request(name, args).await
    }

    async fn request(&self, name: &str, args: Vec<Value>) -> Option<Value> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let outbound = self
            .transport
            .lock()
            .as_ref()
            .map(|ctl| ctl.outbound.clone());
        match outbound {
            Some(outbound) => {
                let frame = Frame::Request {
                    id,
                    name: name.to_string(),
                    args,
                };
                if outbound.send(frame).await.is_err() {
                    debug!(endpoint = %self.endpoint, request = id, "request not written; transport gone");
                }
            }
            None => {
                debug!(endpoint = %self.endpoint, request = id, "request issued without transport; waiting out the ack window");
            }
        }

        let result = tokio::time::timeout(self.config.request_timeout, rx).await;
        self.pending.remove(&id);
        match result {
            Ok(Ok(payload)) => Some(payload),
            _ => None,
        }
    }

    fn install_transport(&self, outbound: mpsc::Sender<Frame>) -> (u64, CancellationToken) {
        let epoch = self.next_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let prior = self.transport.lock().replace(TransportCtl {
            outbound,
            cancel: cancel.clone(),
            epoch,
        });
        if let Some(prior) = prior {
            prior.cancel.cancel();
        }
        (epoch, cancel)
    }

    fn teardown_transport(&self, epoch: u64) {
        let mut transport = self.transport.lock();
        if transport.as_ref().is_some_and(|ctl| ctl.epoch == epoch) {
            if let Some(ctl) = transport.take() {
                ctl.cancel.cancel();
            }
        }
    }

    /// Consumes inbound frames for one transport instance until the channel
    /// closes (transport-level disconnect) or the instance is torn down.
    async fn run_read_loop(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<Frame>,
        cancel: CancellationToken,
        epoch: u64,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                frame = inbound.recv() => match frame {
                    Some(Frame::Ack { id, payload }) => {
                        if let Some((_, tx)) = self.pending.remove(&id) {
                            let _ = tx.send(payload);
                        } else {
                            debug!(endpoint = %self.endpoint, request = id, "dropping late or duplicate acknowledgement");
                        }
                    }
                    Some(Frame::Event { name, payload }) => {
                        if name == protocol::ERROR_EVENT {
                            warn!(endpoint = %self.endpoint, "server error event: {payload}");
                        }
                        self.bus.emit(ConnectionEvent::ServerEvent { name, payload });
                    }
                    Some(Frame::Request { id, name, .. }) => {
                        debug!(endpoint = %self.endpoint, request = id, "ignoring unexpected inbound request '{name}'");
                    }
                    None => break,
                }
            }
        }
        self.on_transport_closed(epoch);
    }

    /// Transport-level disconnect. Reconnects on its own only when the
    /// policy flag says so and the session was fully established.
    fn on_transport_closed(self: &Arc<Self>, epoch: u64) {
        {
            let mut transport = self.transport.lock();
            match transport.as_ref() {
                Some(ctl) if ctl.epoch == epoch => {
                    transport.take();
                }
                _ => return,
            }
        }

        if self.disposed.load(Ordering::Acquire)
            || !self.config.reconnect_on_disconnect
            || self.state() != ConnectionState::Connected
        {
            debug!(endpoint = %self.endpoint, "transport closed");
            self.transition(ConnectionState::Disconnected);
            return;
        }

        debug!(endpoint = %self.endpoint, "transport dropped while connected; reconnecting");
        self.transition(ConnectionState::Reconnecting);
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_connect_cycle().await });
    }

    fn transition(&self, next: ConnectionState) {
        {
            let mut state = self.state.lock();
            if *state == next {
                return;
            }
            *state = next;
        }
        self.announce(next);
    }

    fn announce(&self, next: ConnectionState) {
        debug!(endpoint = %self.endpoint, state = %next, "connection state changed");
        self.bus.emit(ConnectionEvent::StateChanged(next));
        match next {
            ConnectionState::Connected => self.bus.emit(ConnectionEvent::Connected),
            ConnectionState::Disconnected => self.bus.emit(ConnectionEvent::Disconnected),
            _ => {}
        }
    }

    /// Closes the transport and leaves the connection in `Disconnected`.
    /// Safe to call more than once.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(endpoint = %self.endpoint, "dispose");
        let ctl = self.transport.lock().take();
        if let Some(ctl) = ctl {
            ctl.cancel.cancel();
        }
        self.transition(ConnectionState::Disconnected);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.dispose();
    }
}
