//! Connection state machine for one broker channel
//!
//! ```text
//!              connect()              ack ok / resumed
//! Disconnected ─────────► Connecting ─────────────────► Connected
//!      ▲                      │                            │
//!      └──────────────────────┴────────────────────────────┘
//!        ack failed, transport error, interrupted, disconnect()
//! ```
//!
//! Every connect bumps the attempt counter. Transport events carry the
//! attempt they belong to, so a late ack from an attempt that `disconnect()`
//! already abandoned cannot resurrect the session.
//!
//! An interrupted session shows as `Disconnected` while the transport keeps
//! reconnecting underneath. The machine remembers that the transport is
//! still live, so `disconnect()` tears it down in that state too.

use super::transport::{
    ChannelKind, Endpoint, InboundTransport, Transport, TransportError, TransportEvent,
    TransportSink,
};
use std::fmt;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("channel is already {0}")]
    AlreadyActive(ConnectionState),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Effect of a transport event on the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkChange {
    /// Session is up; `session_present` is set when the broker kept the
    /// previous session's subscriptions
    Established { session_present: bool },
    /// Connect attempt was rejected
    Failed { reason: String },
    /// Established session dropped
    Lost { reason: String },
}

#[derive(Debug)]
pub struct ConnectionStateMachine {
    channel: ChannelKind,
    state: ConnectionState,
    attempt: u64,
    /// The transport holds a client, connected or reconnecting
    transport_live: bool,
    state_tx: watch::Sender<ConnectionState>,
}

fn event_session_present(event: &TransportEvent) -> bool {
    match event {
        TransportEvent::Connected { session_present } | TransportEvent::Resumed { session_present } => {
            *session_present
        }
        _ => false,
    }
}

impl ConnectionStateMachine {
    pub fn new(channel: ChannelKind) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            channel,
            state: ConnectionState::Disconnected,
            attempt: 0,
            transport_live: false,
            state_tx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("{} channel: {} -> {}", self.channel, self.state, state);
        }
        self.state = state;
        self.state_tx.send_replace(state);
    }

    fn validate(&self, endpoint: &Endpoint) -> Result<(), ConnectionError> {
        if endpoint.host.trim().is_empty() || endpoint.port == 0 {
            return Err(ConnectionError::InvalidEndpoint(
                "broker host and port are required".to_string(),
            ));
        }
        if self.channel == ChannelKind::Cloud && endpoint.client_id.trim().is_empty() {
            return Err(ConnectionError::InvalidEndpoint(
                "a client id is required for the cloud broker".to_string(),
            ));
        }
        Ok(())
    }

    /// Starts a connect attempt and returns its attempt number
    ///
    /// The machine stays in `Connecting` until the transport reports the
    /// outcome through [`Self::on_transport_event`].
    pub async fn connect(
        &mut self,
        transport: &mut dyn Transport,
        endpoint: &Endpoint,
        events: mpsc::Sender<InboundTransport>,
    ) -> Result<u64, ConnectionError> {
        if self.state != ConnectionState::Disconnected {
            return Err(ConnectionError::AlreadyActive(self.state));
        }
        self.validate(endpoint)?;

        self.attempt += 1;
        self.set_state(ConnectionState::Connecting);
        info!(
            "Connecting {} channel to {} (attempt {})",
            self.channel, endpoint, self.attempt
        );

        let sink = TransportSink::new(self.channel, self.attempt, events);
        self.transport_live = true;
        match transport.connect(endpoint, sink).await {
            Ok(()) => Ok(self.attempt),
            Err(e) => {
                warn!("Connect on {} channel failed: {}", self.channel, e);
                self.transport_live = false;
                self.set_state(ConnectionState::Disconnected);
                Err(e.into())
            }
        }
    }

    /// Tears the session down, best effort
    ///
    /// Also stops a transport that is reconnecting after an interruption.
    /// Returns false if there was nothing to tear down.
    pub async fn disconnect(&mut self, transport: &mut dyn Transport) -> bool {
        if self.state == ConnectionState::Disconnected && !self.transport_live {
            debug!("{} channel already disconnected", self.channel);
            return false;
        }

        // Anything still in flight from the old attempt is stale from here on
        self.attempt += 1;
        if let Err(e) = transport.disconnect().await {
            warn!("Error while disconnecting {} channel: {}", self.channel, e);
        }
        self.transport_live = false;
        self.set_state(ConnectionState::Disconnected);
        info!("{} channel disconnected", self.channel);
        true
    }

    /// Applies a transport-reported lifecycle event
    pub fn on_transport_event(&mut self, attempt: u64, event: &TransportEvent) -> Option<LinkChange> {
        if attempt != self.attempt {
            debug!(
                "Ignoring event from stale attempt {} on {} channel (current {})",
                attempt, self.channel, self.attempt
            );
            return None;
        }

        match (self.state, event) {
            (ConnectionState::Connecting, TransportEvent::Connected { .. })
            | (ConnectionState::Connecting, TransportEvent::Resumed { .. }) => {
                self.set_state(ConnectionState::Connected);
                Some(LinkChange::Established {
                    session_present: event_session_present(event),
                })
            }
            (ConnectionState::Connecting, TransportEvent::ConnectFailed { reason }) => {
                self.transport_live = false;
                self.set_state(ConnectionState::Disconnected);
                Some(LinkChange::Failed {
                    reason: reason.clone(),
                })
            }
            (ConnectionState::Connected, TransportEvent::Interrupted { reason }) => {
                self.set_state(ConnectionState::Disconnected);
                Some(LinkChange::Lost {
                    reason: reason.clone(),
                })
            }
            (ConnectionState::Disconnected, TransportEvent::Resumed { session_present })
            | (ConnectionState::Disconnected, TransportEvent::Connected { session_present })
                if self.transport_live =>
            {
                self.set_state(ConnectionState::Connected);
                Some(LinkChange::Established {
                    session_present: *session_present,
                })
            }
            (ConnectionState::Disconnected, TransportEvent::Closed) => {
                // Gave up reconnecting after an interruption
                self.transport_live = false;
                None
            }
            (_, TransportEvent::Closed) => {
                self.transport_live = false;
                self.set_state(ConnectionState::Disconnected);
                Some(LinkChange::Lost {
                    reason: "connection closed".to_string(),
                })
            }
            (_, TransportEvent::Message { .. }) => None,
            (state, event) => {
                debug!("No transition from {} on {:?}", state, event);
                None
            }
        }
    }
}
