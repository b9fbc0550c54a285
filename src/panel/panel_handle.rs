use super::dispatcher::PanelAction;
use super::error::PanelError;
use super::events::ChannelStatus;
use crate::fleet::registry::Device;
use crate::mqtt::codec::{Action, Target};
use crate::mqtt::connection::ConnectionState;
use crate::mqtt::message_manager::TrafficRecord;
use crate::mqtt::transport::{ChannelKind, Endpoint};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::warn;

/// Cloneable handle to the dispatcher task
///
/// Commands that change state are queued and return once accepted;
/// queries wait for the dispatcher's answer.
#[derive(Clone, Debug)]
pub struct PanelHandle {
    action_tx: mpsc::Sender<PanelAction>,
    connect_timeout: Duration,
}

impl PanelHandle {
    pub(crate) fn new(action_tx: mpsc::Sender<PanelAction>, connect_timeout: Duration) -> Self {
        Self {
            action_tx,
            connect_timeout,
        }
    }

    async fn send(&self, action: PanelAction) -> Result<(), PanelError> {
        self.action_tx
            .send(action)
            .await
            .map_err(|_| PanelError::DispatcherGone)
    }

    async fn request<T>(
        &self,
        action: impl FnOnce(oneshot::Sender<T>) -> PanelAction,
    ) -> Result<T, PanelError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(action(response_tx)).await?;
        Ok(response_rx.await?)
    }

    /// Connects the active channel to its configured broker
    ///
    /// Resolves with the state the channel left `Connecting` for. If the
    /// broker stays silent past the connect timeout the attempt is
    /// abandoned and [`PanelError::ConnectTimeout`] returned.
    pub async fn connect(&self) -> Result<ConnectionState, PanelError> {
        self.connect_with(None).await
    }

    /// Like [`Self::connect`], with an operator supplied endpoint
    pub async fn connect_to(&self, endpoint: Endpoint) -> Result<ConnectionState, PanelError> {
        self.connect_with(Some(endpoint)).await
    }

    async fn connect_with(&self, endpoint: Option<Endpoint>) -> Result<ConnectionState, PanelError> {
        let (channel, mut state_rx) = self
            .request(|response_tx| PanelAction::Connect {
                endpoint,
                response_tx,
            })
            .await??;

        // Copy the state out so no watch guard lives across the next await
        let settled = tokio::time::timeout(
            self.connect_timeout,
            state_rx.wait_for(|state| *state != ConnectionState::Connecting),
        )
        .await
        .map(|waited| waited.map(|state| *state));

        match settled {
            Ok(Ok(state)) => Ok(state),
            Ok(Err(_)) => Err(PanelError::DispatcherGone),
            Err(_) => {
                warn!(
                    "No connect acknowledgement on {} within {:?}",
                    channel, self.connect_timeout
                );
                // The operator may have switched channels meanwhile
                self.disconnect_channel(Some(channel)).await?;
                Err(PanelError::ConnectTimeout(self.connect_timeout))
            }
        }
    }

    /// Disconnects the active channel; false if it was not connected
    pub async fn disconnect(&self) -> Result<bool, PanelError> {
        self.disconnect_channel(None).await
    }

    async fn disconnect_channel(&self, channel: Option<ChannelKind>) -> Result<bool, PanelError> {
        self.request(|response_tx| PanelAction::Disconnect {
            channel,
            response_tx,
        })
        .await
    }

    pub async fn select_channel(&self, channel: ChannelKind) -> Result<(), PanelError> {
        self.send(PanelAction::SelectChannel(channel)).await
    }

    pub async fn active_channel(&self) -> Result<ChannelKind, PanelError> {
        self.request(|response_tx| PanelAction::ActiveChannel { response_tx })
            .await
    }

    pub async fn set_subscribe_topic(&self, topic: impl Into<String>) -> Result<(), PanelError> {
        self.send(PanelAction::SetSubscribeTopic(topic.into())).await
    }

    pub async fn set_publish_topic(&self, topic: impl Into<String>) -> Result<(), PanelError> {
        self.send(PanelAction::SetPublishTopic(topic.into())).await
    }

    pub async fn control_device(&self, device: &str, action: Action) -> Result<(), PanelError> {
        self.send(PanelAction::Control {
            target: Target::Device(device.to_string()),
            action,
        })
        .await
    }

    pub async fn control_all(&self, action: Action) -> Result<(), PanelError> {
        self.send(PanelAction::Control {
            target: Target::All,
            action,
        })
        .await
    }

    /// Publishes free text unchanged on the active channel
    pub async fn send_raw(&self, text: impl Into<String>) -> Result<(), PanelError> {
        self.send(PanelAction::SendRaw(text.into())).await
    }

    pub async fn start_polling(&self) -> Result<(), PanelError> {
        self.request(|response_tx| PanelAction::StartPolling { response_tx })
            .await
    }

    /// Returns once no further status request or sweep can happen
    pub async fn stop_polling(&self) -> Result<(), PanelError> {
        self.request(|response_tx| PanelAction::StopPolling { response_tx })
            .await
    }

    pub async fn devices(&self) -> Result<Vec<Device>, PanelError> {
        self.request(|response_tx| PanelAction::Devices { response_tx })
            .await
    }

    pub async fn traffic(&self) -> Result<Vec<TrafficRecord>, PanelError> {
        self.request(|response_tx| PanelAction::Traffic { response_tx })
            .await
    }

    pub async fn channel_status(&self, channel: ChannelKind) -> Result<ChannelStatus, PanelError> {
        self.request(|response_tx| PanelAction::ChannelStatus {
            channel,
            response_tx,
        })
        .await
    }

    pub async fn connection_state(
        &self,
        channel: ChannelKind,
    ) -> Result<watch::Receiver<ConnectionState>, PanelError> {
        self.request(|response_tx| PanelAction::WatchConnection {
            channel,
            response_tx,
        })
        .await
    }

    /// Stops polling, disconnects both channels and ends the dispatcher
    pub async fn shutdown(&self) -> Result<(), PanelError> {
        self.request(|response_tx| PanelAction::Shutdown { response_tx })
            .await
    }
}
