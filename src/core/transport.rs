// src/core/transport.rs

//! The transport seam between a connection and the network.
//!
//! A [`Connector`] opens one fresh [`TransportChannel`] per connect attempt;
//! the channel is a plain pair of frame queues, so alternative transports
//! (in-memory pairs for tests, tunneled streams) plug in without touching the
//! connection state machine. The production [`TcpConnector`] frames
//! [`FrameCodec`] over a TCP stream.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, warn};
use url::Url;

use crate::core::KeySyncError;
use crate::core::protocol::{Frame, FrameCodec};

/// Port assumed when an endpoint URL does not carry one.
const DEFAULT_PORT: u16 = 7379;

/// Depth of the per-transport frame queues.
const TRANSPORT_QUEUE_CAPACITY: usize = 64;

/// One network address of the redundant session transport. Immutable once
/// constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Endpoint {
    url: Url,
}

impl Endpoint {
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The `host:port` pair a stream transport dials.
    pub fn authority(&self) -> Result<String, KeySyncError> {
        let host = self
            .url
            .host_str()
            .ok_or_else(|| KeySyncError::InvalidEndpoint(self.url.to_string()))?;
        let port = self.url.port().unwrap_or(DEFAULT_PORT);
        Ok(format!("{host}:{port}"))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.url.fmt(f)
    }
}

/// The two frame queues of one live transport instance.
///
/// Dropping `outbound` shuts the write side down; the transport closing (for
/// any reason) closes `inbound`, which is the only disconnect signal the
/// connection layer relies on.
pub struct TransportChannel {
    pub outbound: mpsc::Sender<Frame>,
    pub inbound: mpsc::Receiver<Frame>,
}

/// Opens transport instances. One call per connect attempt; a connection
/// never reuses a channel across attempts.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<TransportChannel, KeySyncError>;
}

/// The production connector: `FrameCodec` over TCP.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<TransportChannel, KeySyncError> {
        let addr = endpoint.authority()?;
        let stream = TcpStream::connect(&addr).await?;
        debug!(%endpoint, "transport connected");

        let framed = Framed::new(stream, FrameCodec);
        let (mut sink, mut source) = framed.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(TRANSPORT_QUEUE_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Frame>(TRANSPORT_QUEUE_CAPACITY);

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = sink.send(frame).await {
                    debug!("transport write failed: {e}");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let endpoint_label = endpoint.to_string();
        tokio::spawn(async move {
            while let Some(result) = source.next().await {
                match result {
                    Ok(frame) => {
                        if inbound_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(endpoint = %endpoint_label, "transport read failed: {e}");
                        break;
                    }
                }
            }
            // Dropping inbound_tx closes the inbound queue, which the
            // connection observes as a transport-level disconnect.
        });

        Ok(TransportChannel {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
