// src/core/protocol/mod.rs

pub mod frame;

pub use frame::{Frame, FrameCodec};

/// The handshake request that (re)establishes a session key after a
/// transport-level connect.
pub const INIT_EVENT: &str = "init";

/// The server-pushed error event.
pub const ERROR_EVENT: &str = "keysync-error";

/// Prefix of the per-watch notification events. The remote watch id follows
/// the prefix, e.g. `watch:::df31a9`.
pub const WATCH_EVENT_PREFIX: &str = "watch:::";

/// Extracts the remote watch id from a per-watch notification event name.
pub fn watch_event_id(name: &str) -> Option<&str> {
    name.strip_prefix(WATCH_EVENT_PREFIX)
        .filter(|id| !id.is_empty())
}
