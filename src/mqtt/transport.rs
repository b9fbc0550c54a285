//! Transport capability set consumed by the panel core
//!
//! The core never talks to a broker library directly. A [`Transport`] only
//! has to connect, publish and manage subscriptions; everything it observes
//! (acks, interruptions, inbound messages) is pushed back through the
//! [`TransportSink`] handed to it on connect.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Logical broker channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Plain broker on the local network
    #[default]
    Local,
    /// TLS broker reached over the internet
    Cloud,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChannelKind::Local => write!(f, "local"),
            ChannelKind::Cloud => write!(f, "cloud"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

/// Certificate material for mutually authenticated TLS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub ca: PathBuf,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
}

/// Everything needed to open a broker session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub credentials: Option<Credentials>,
    pub tls: Option<TlsFiles>,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub reconnect_backoff: Duration,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            credentials: None,
            tls: None,
            keep_alive: Duration::from_secs(60),
            clean_session: true,
            reconnect_backoff: Duration::from_secs(2),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.credentials {
            Some(c) => write!(f, "{}@{}:{}", c.user, self.host, self.port),
            None => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

/// What a transport observed, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// First acknowledgement of a connect attempt
    Connected { session_present: bool },
    /// The connect attempt was refused or could not reach the broker
    ConnectFailed { reason: String },
    /// An established session dropped; the transport keeps retrying
    Interrupted { reason: String },
    /// A dropped session was re-established
    Resumed { session_present: bool },
    /// The transport stopped for good (broker disconnect or teardown)
    Closed,
    Message { topic: String, payload: Vec<u8> },
}

/// Envelope tagging a transport event with the attempt that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundTransport {
    pub channel: ChannelKind,
    pub attempt: u64,
    pub event: TransportEvent,
}

/// Where a transport delivers its events
///
/// Each connect attempt gets its own sink, so events from an abandoned
/// attempt can be told apart from the current one.
#[derive(Debug, Clone)]
pub struct TransportSink {
    channel: ChannelKind,
    attempt: u64,
    tx: mpsc::Sender<InboundTransport>,
}

impl TransportSink {
    pub fn new(channel: ChannelKind, attempt: u64, tx: mpsc::Sender<InboundTransport>) -> Self {
        Self {
            channel,
            attempt,
            tx,
        }
    }

    /// Returns false once the receiving side is gone
    pub async fn emit(&self, event: TransportEvent) -> bool {
        let inbound = InboundTransport {
            channel: self.channel,
            attempt: self.attempt,
            event,
        };
        if self.tx.send(inbound).await.is_err() {
            debug!("Transport sink for {} closed", self.channel);
            return false;
        }
        true
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("unsubscribe failed: {0}")]
    Unsubscribe(String),

    #[error("disconnect failed: {0}")]
    Disconnect(String),

    #[error("not connected")]
    NotConnected,

    #[error("tls setup failed: {0}")]
    Tls(String),
}

/// Minimal broker client the core depends on
///
/// `connect` only starts a session; its outcome arrives later through the
/// sink as [`TransportEvent::Connected`] or [`TransportEvent::ConnectFailed`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&mut self, endpoint: &Endpoint, sink: TransportSink)
        -> Result<(), TransportError>;

    async fn disconnect(&mut self) -> Result<(), TransportError>;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;
}
