//! Single-topic subscription tracking for one broker channel
//!
//! At most one topic is active per channel. Switching topics always
//! unsubscribes the old one before subscribing the new one, otherwise
//! overlapping patterns deliver the same report twice.

use super::transport::{Transport, TransportError};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("could not unsubscribe from {topic}: {source}")]
    Unsubscribe {
        topic: String,
        #[source]
        source: TransportError,
    },

    #[error("could not subscribe to {topic}: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: TransportError,
    },
}

/// Tracks the topic the operator wants and the one the broker holds
///
/// The two differ while the channel is offline, after a failed switch and
/// right after a session comes up. [`Self::on_session`] brings them back
/// together.
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    active_topic: Option<String>,
    wanted_topic: Option<String>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Topic the broker currently delivers
    pub fn current_topic(&self) -> Option<&str> {
        self.active_topic.as_deref()
    }

    pub fn wanted_topic(&self) -> Option<&str> {
        self.wanted_topic.as_deref()
    }

    /// Replaces the active topic on a live transport
    ///
    /// `current_topic` always mirrors what the broker holds: a failed
    /// unsubscribe keeps the old topic, a failed subscribe leaves none.
    pub async fn set_topic(
        &mut self,
        transport: &dyn Transport,
        new_topic: &str,
    ) -> Result<(), SubscriptionError> {
        self.wanted_topic = Some(new_topic.to_string());
        self.reconcile(transport).await
    }

    /// Records the topic without touching the broker
    ///
    /// Used while the channel is offline; [`Self::on_session`] applies it
    /// once a session exists.
    pub fn remember(&mut self, topic: &str) {
        self.wanted_topic = Some(topic.to_string());
    }

    /// Brings the broker in line with the wanted topic after a session
    /// came up
    ///
    /// Without a kept session the broker holds nothing, so the wanted topic
    /// is subscribed from scratch. A kept session still holds the old
    /// topic, which is swapped out if the operator changed it meanwhile.
    pub async fn on_session(
        &mut self,
        transport: &dyn Transport,
        session_present: bool,
    ) -> Result<(), SubscriptionError> {
        if !session_present {
            self.active_topic = None;
        }
        self.reconcile(transport).await
    }

    async fn reconcile(&mut self, transport: &dyn Transport) -> Result<(), SubscriptionError> {
        let Some(wanted) = self.wanted_topic.clone() else {
            return Ok(());
        };
        if self.active_topic.as_deref() == Some(wanted.as_str()) {
            debug!("Already subscribed to {}", wanted);
            return Ok(());
        }

        if let Some(old) = self.active_topic.as_deref() {
            transport
                .unsubscribe(old)
                .await
                .map_err(|source| SubscriptionError::Unsubscribe {
                    topic: old.to_string(),
                    source,
                })?;
            debug!("Unsubscribed from {}", old);
            self.active_topic = None;
        }

        match transport.subscribe(&wanted).await {
            Ok(()) => {
                info!("Subscribed to {}", wanted);
                self.active_topic = Some(wanted);
                Ok(())
            }
            Err(source) => {
                warn!("Subscribe to {} failed: {}", wanted, source);
                Err(SubscriptionError::Subscribe {
                    topic: wanted,
                    source,
                })
            }
        }
    }
}
