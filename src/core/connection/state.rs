// src/core/connection/state.rs

//! Connection lifecycle states and the events published on a connection's bus.

use serde_json::Value;
use std::fmt;

use crate::core::events::BusEvent;

/// Lifecycle of one endpoint session.
///
/// `Reconnecting` is entered from `Connected` when the transport drops and
/// the session group's reconnect policy is set; without the policy, a drop
/// goes straight to `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(label)
    }
}

/// Events published on a connection's bus.
///
/// `StateChanged` fires on every transition; `Connected` and `Disconnected`
/// are convenience events fired on entering the matching state. `ServerEvent`
/// carries fire-and-forget named events pushed by the server (watch
/// notifications, error broadcasts).
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    Connected,
    Disconnected,
    ServerEvent { name: String, payload: Value },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEventKind {
    StateChanged,
    Connected,
    Disconnected,
    ServerEvent,
}

impl BusEvent for ConnectionEvent {
    type Kind = ConnectionEventKind;

    fn kind(&self) -> ConnectionEventKind {
        match self {
            ConnectionEvent::StateChanged(_) => ConnectionEventKind::StateChanged,
            ConnectionEvent::Connected => ConnectionEventKind::Connected,
            ConnectionEvent::Disconnected => ConnectionEventKind::Disconnected,
            ConnectionEvent::ServerEvent { .. } => ConnectionEventKind::ServerEvent,
        }
    }
}
