use crate::fleet::registry::PresenceChange;
use crate::mqtt::connection::ConnectionState;
use crate::mqtt::message_manager::TrafficRecord;
use crate::mqtt::transport::ChannelKind;
use std::fmt;

/// Notification for the presentation layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanelEvent {
    ConnectionStateChanged {
        channel: ChannelKind,
        state: ConnectionState,
    },
    DevicePresenceChanged(PresenceChange),
    Traffic(TrafficRecord),
    /// Operator-facing diagnostic line
    Log(String),
}

impl fmt::Display for PanelEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PanelEvent::ConnectionStateChanged { channel, state } => {
                write!(f, "[{}] {}", channel, state)
            }
            PanelEvent::DevicePresenceChanged(change) => {
                write!(f, "{}: {} / {}", change.device, change.status, change.state)
            }
            PanelEvent::Traffic(record) => write!(f, "{}", record.render()),
            PanelEvent::Log(message) => write!(f, "{}", message),
        }
    }
}

/// Snapshot of one channel for status displays
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelStatus {
    pub connection_state: ConnectionState,
    pub subscribed_topic: Option<String>,
    /// Topic waiting for the next session, when it differs from the
    /// subscribed one
    pub pending_topic: Option<String>,
    pub publish_topic: Option<String>,
    pub error_messages: Vec<String>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<chrono::DateTime<chrono::Local>>,
}
