// src/lib.rs

pub mod client;
pub mod config;
pub mod core;

// Re-export
pub use crate::client::{ClientEvent, ClientStatus, KeySyncClient};
pub use crate::config::Config;
pub use crate::core::KeySyncError;
pub use crate::core::session::SessionGroup;
pub use crate::core::transport::Endpoint;
pub use crate::core::watch::ReactiveKey;
