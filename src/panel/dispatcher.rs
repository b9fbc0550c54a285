//! Dispatcher actor
//!
//! One task owns both broker channels, the device registry, the status poller
//! and the traffic log. Everything that mutates them arrives through one of
//! three queues:
//!
//! ```text
//! PanelHandle ──► PanelAction ──┐
//! TransportSink ─► Inbound ─────┼──► Dispatcher ──► PanelEvent
//! StatusPoller ──► PollTick ────┘
//! ```
//!
//! Since only this task touches the registry, a report and a liveness sweep
//! can never interleave, and events are sent after the mutation finished.
//!
//! Presence changes are never dropped. While the event queue is full they
//! wait in a per-device slot, newest change wins, and go out as soon as the
//! presentation layer makes room.

use super::events::{ChannelStatus, PanelEvent};
use super::panel_handle::PanelHandle;
use crate::config::PanelConfig;
use crate::fleet::poller::{PollTick, StatusPoller};
use crate::fleet::registry::{Device, DeviceRegistry, PresenceChange};
use crate::mqtt::codec::{self, Action, Target, BROADCAST_TARGET};
use crate::mqtt::config::MqttConfig;
use crate::mqtt::connection::{ConnectionError, ConnectionState, ConnectionStateMachine, LinkChange};
use crate::mqtt::message_manager::{Direction, TrafficLog, TrafficRecord};
use crate::mqtt::subscription::SubscriptionManager;
use crate::mqtt::transport::{
    ChannelKind, Endpoint, InboundTransport, Transport, TransportError, TransportEvent,
};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const MAX_CHANNEL_ERRORS: usize = 10;

macro_rules! respond {
    ($response_tx:expr, $value:expr) => {
        if $response_tx.send($value).is_err() {
            debug!("Caller went away before the response was sent");
        }
    };
}

/// Channel a connect went out on, and its state to wait on
pub(crate) type ConnectReply = (ChannelKind, watch::Receiver<ConnectionState>);

#[derive(Debug)]
pub(crate) enum PanelAction {
    Connect {
        endpoint: Option<Endpoint>,
        response_tx: oneshot::Sender<Result<ConnectReply, ConnectionError>>,
    },
    /// `channel` of `None` means the active channel
    Disconnect {
        channel: Option<ChannelKind>,
        response_tx: oneshot::Sender<bool>,
    },
    SelectChannel(ChannelKind),
    SetSubscribeTopic(String),
    SetPublishTopic(String),
    Control {
        target: Target,
        action: Action,
    },
    SendRaw(String),
    StartPolling {
        response_tx: oneshot::Sender<()>,
    },
    StopPolling {
        response_tx: oneshot::Sender<()>,
    },
    Devices {
        response_tx: oneshot::Sender<Vec<Device>>,
    },
    Traffic {
        response_tx: oneshot::Sender<Vec<TrafficRecord>>,
    },
    ChannelStatus {
        channel: ChannelKind,
        response_tx: oneshot::Sender<ChannelStatus>,
    },
    WatchConnection {
        channel: ChannelKind,
        response_tx: oneshot::Sender<watch::Receiver<ConnectionState>>,
    },
    ActiveChannel {
        response_tx: oneshot::Sender<ChannelKind>,
    },
    Shutdown {
        response_tx: oneshot::Sender<()>,
    },
}

/// Non-blocking event output
///
/// A presentation layer that stops draining must not stall the dispatcher,
/// so a full queue drops log, traffic and state events. Presence changes
/// go through [`Dispatcher::notify_presence`] instead.
#[derive(Clone)]
struct Notifier {
    tx: mpsc::Sender<PanelEvent>,
}

impl Notifier {
    fn emit(&self, event: PanelEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => warn!("Event queue full, dropping {:?}", event),
            Err(TrySendError::Closed(_)) => debug!("No listener for panel events"),
        }
    }

    fn note(&self, message: String) {
        info!("{}", message);
        self.emit(PanelEvent::Log(message));
    }

    fn problem(&self, message: String) {
        warn!("{}", message);
        self.emit(PanelEvent::Log(message));
    }
}

/// One broker channel with everything that belongs to it
struct ChannelLink {
    kind: ChannelKind,
    transport: Box<dyn Transport>,
    connection: ConnectionStateMachine,
    subscriptions: SubscriptionManager,
    endpoint: Endpoint,
    publish_topic: Option<String>,
    reported_state: ConnectionState,
    stats: ChannelStatus,
    notifier: Notifier,
}

impl ChannelLink {
    fn new(kind: ChannelKind, config: &MqttConfig, transport: Box<dyn Transport>, notifier: Notifier) -> Self {
        let mut subscriptions = SubscriptionManager::new();
        if let Some(topic) = config.subscribe_topic() {
            subscriptions.remember(topic);
        }

        Self {
            kind,
            transport,
            connection: ConnectionStateMachine::new(kind),
            subscriptions,
            endpoint: config.endpoint(),
            publish_topic: config.publish_topic().map(str::to_string),
            reported_state: ConnectionState::Disconnected,
            stats: ChannelStatus::default(),
            notifier,
        }
    }

    fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    fn report_state(&mut self) {
        let state = self.connection.state();
        if state != self.reported_state {
            self.reported_state = state;
            self.notifier.emit(PanelEvent::ConnectionStateChanged {
                channel: self.kind,
                state,
            });
        }
    }

    fn record_error(&mut self, message: String) {
        if self.stats.error_messages.len() >= MAX_CHANNEL_ERRORS {
            self.stats.error_messages.remove(0);
        }
        self.stats.error_messages.push(message.clone());
        self.notifier.problem(message);
    }

    fn touch(&mut self) {
        self.stats.last_activity = Some(chrono::Local::now());
    }

    async fn connect(
        &mut self,
        endpoint: Option<Endpoint>,
        inbound_tx: mpsc::Sender<InboundTransport>,
    ) -> Result<watch::Receiver<ConnectionState>, ConnectionError> {
        let endpoint = endpoint.unwrap_or_else(|| self.endpoint.clone());
        let result = self
            .connection
            .connect(self.transport.as_mut(), &endpoint, inbound_tx)
            .await;

        match &result {
            Ok(_) => self
                .notifier
                .note(format!("Connecting to the {} broker at {}", self.kind, endpoint)),
            Err(e) => self.record_error(format!("Failed to connect to the {} broker: {}", self.kind, e)),
        }
        self.report_state();
        result.map(|_| self.connection.subscribe())
    }

    async fn disconnect(&mut self) -> bool {
        let torn_down = self.connection.disconnect(self.transport.as_mut()).await;
        if torn_down {
            self.notifier
                .note(format!("Disconnected from the {} broker", self.kind));
        }
        self.report_state();
        torn_down
    }

    async fn on_connection_event(&mut self, attempt: u64, event: &TransportEvent) {
        let change = self.connection.on_transport_event(attempt, event);
        self.report_state();

        match change {
            Some(LinkChange::Established { session_present }) => {
                self.notifier
                    .note(format!("Connected to the {} broker", self.kind));
                if let Err(e) = self
                    .subscriptions
                    .on_session(self.transport.as_ref(), session_present)
                    .await
                {
                    self.record_error(format!("Failed to subscribe on {}: {}", self.kind, e));
                }
            }
            Some(LinkChange::Failed { reason }) => {
                self.record_error(format!("Failed to connect to the {} broker: {}", self.kind, reason));
            }
            Some(LinkChange::Lost { reason }) => {
                self.record_error(format!("Lost the {} broker: {}", self.kind, reason));
            }
            None => {}
        }
    }

    async fn set_subscribe_topic(&mut self, topic: &str) {
        let topic = topic.trim();
        if topic.is_empty() {
            self.notifier
                .problem("Subscribe topic must not be empty".to_string());
            return;
        }

        if self.state() == ConnectionState::Connected {
            match self.subscriptions.set_topic(self.transport.as_ref(), topic).await {
                Ok(()) => self
                    .notifier
                    .note(format!("Subscribed to topic on {}: {}", self.kind, topic)),
                Err(e) => self.record_error(format!("Failed to subscribe on {}: {}", self.kind, e)),
            }
        } else {
            self.subscriptions.remember(topic);
            self.notifier.note(format!(
                "Will subscribe to {} once the {} broker is connected",
                topic, self.kind
            ));
        }
    }

    fn set_publish_topic(&mut self, topic: &str) {
        let topic = topic.trim();
        if topic.is_empty() {
            self.publish_topic = None;
            self.notifier
                .note(format!("Publishing on {} disabled, no topic set", self.kind));
        } else {
            self.publish_topic = Some(topic.to_string());
            self.notifier
                .note(format!("Publish to topic on {}: {}", self.kind, topic));
        }
    }

    async fn publish(&mut self, payload: Vec<u8>) -> Option<TrafficRecord> {
        let result = match (self.state(), self.publish_topic.clone()) {
            (ConnectionState::Connected, Some(topic)) => {
                let record = TrafficRecord::new(self.kind, Direction::Published, &topic, &payload);
                self.transport.publish(&topic, payload).await.map(|()| record)
            }
            (ConnectionState::Connected, None) => {
                Err(TransportError::Publish("no publish topic set".to_string()))
            }
            _ => Err(TransportError::NotConnected),
        };

        match result {
            Ok(record) => {
                self.stats.messages_sent += 1;
                self.touch();
                Some(record)
            }
            Err(e) => {
                self.record_error(format!("Failed to publish on {}: {}", self.kind, e));
                None
            }
        }
    }

    fn status(&self) -> ChannelStatus {
        ChannelStatus {
            connection_state: self.state(),
            subscribed_topic: self.subscriptions.current_topic().map(str::to_string),
            pending_topic: self
                .subscriptions
                .wanted_topic()
                .filter(|wanted| Some(*wanted) != self.subscriptions.current_topic())
                .map(str::to_string),
            publish_topic: self.publish_topic.clone(),
            ..self.stats.clone()
        }
    }
}

struct Links {
    local: ChannelLink,
    cloud: ChannelLink,
}

impl Links {
    fn get(&self, kind: ChannelKind) -> &ChannelLink {
        match kind {
            ChannelKind::Local => &self.local,
            ChannelKind::Cloud => &self.cloud,
        }
    }

    fn get_mut(&mut self, kind: ChannelKind) -> &mut ChannelLink {
        match kind {
            ChannelKind::Local => &mut self.local,
            ChannelKind::Cloud => &mut self.cloud,
        }
    }
}

pub struct Dispatcher {
    controller_id: String,
    links: Links,
    active: ChannelKind,
    registry: DeviceRegistry,
    poller: StatusPoller,
    liveness_timeout: Duration,
    traffic: TrafficLog,
    notifier: Notifier,
    /// Presence changes waiting for room in the event queue, one per device
    pending_presence: BTreeMap<String, PresenceChange>,
    action_rx: mpsc::Receiver<PanelAction>,
    inbound_tx: mpsc::Sender<InboundTransport>,
    inbound_rx: mpsc::Receiver<InboundTransport>,
    tick_rx: mpsc::Receiver<PollTick>,
}

impl Dispatcher {
    /// Starts the dispatcher task
    ///
    /// Returns the handle for issuing commands and the receiving end of the
    /// event stream for the presentation layer.
    pub fn spawn(
        config: &PanelConfig,
        local: Box<dyn Transport>,
        cloud: Box<dyn Transport>,
    ) -> (PanelHandle, mpsc::Receiver<PanelEvent>, JoinHandle<()>) {
        let capacity = config.dispatch.queue_capacity.max(1);
        let (action_tx, action_rx) = mpsc::channel(capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (tick_tx, tick_rx) = mpsc::channel(capacity);
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let notifier = Notifier { tx: event_tx };

        let dispatcher = Dispatcher {
            controller_id: config.controller_id.clone(),
            links: Links {
                local: ChannelLink::new(ChannelKind::Local, &config.local, local, notifier.clone()),
                cloud: ChannelLink::new(ChannelKind::Cloud, &config.cloud, cloud, notifier.clone()),
            },
            active: config.dispatch.active_channel,
            registry: DeviceRegistry::with_fleet(&config.fleet.devices),
            poller: StatusPoller::new(config.fleet.poll_period(), tick_tx),
            liveness_timeout: config.fleet.liveness_timeout(),
            traffic: TrafficLog::new(config.dispatch.traffic_history),
            notifier,
            pending_presence: BTreeMap::new(),
            action_rx,
            inbound_tx,
            inbound_rx,
            tick_rx,
        };

        let task = tokio::spawn(dispatcher.run());
        let handle = PanelHandle::new(action_tx, config.dispatch.connect_timeout());
        (handle, event_rx, task)
    }

    async fn run(mut self) {
        info!(
            "Dispatcher running with {} known devices, active channel {}",
            self.registry.len(),
            self.active
        );

        loop {
            tokio::select! {
                action = self.action_rx.recv() => match action {
                    Some(PanelAction::Shutdown { response_tx }) => {
                        self.shutdown().await;
                        respond!(response_tx, ());
                        break;
                    }
                    Some(action) => self.handle_action(action).await,
                    None => {
                        debug!("All panel handles dropped");
                        self.shutdown().await;
                        break;
                    }
                },
                Some(inbound) = self.inbound_rx.recv() => self.on_inbound(inbound).await,
                Some(tick) = self.tick_rx.recv() => self.on_tick(tick).await,
                permit = self.notifier.tx.clone().reserve_owned(), if !self.pending_presence.is_empty() => {
                    match permit {
                        Ok(permit) => {
                            if let Some((_, change)) = self.pending_presence.pop_first() {
                                permit.send(PanelEvent::DevicePresenceChanged(change));
                            }
                        }
                        Err(_) => {
                            debug!("No listener for panel events");
                            self.pending_presence.clear();
                        }
                    }
                }
            }
        }

        info!("Dispatcher stopped");
    }

    async fn handle_action(&mut self, action: PanelAction) {
        match action {
            PanelAction::Connect {
                endpoint,
                response_tx,
            } => {
                let inbound_tx = self.inbound_tx.clone();
                let channel = self.active;
                let result = self.links.get_mut(channel).connect(endpoint, inbound_tx).await;
                respond!(response_tx, result.map(|state_rx| (channel, state_rx)));
            }
            PanelAction::Disconnect {
                channel,
                response_tx,
            } => {
                let channel = channel.unwrap_or(self.active);
                let torn_down = self.links.get_mut(channel).disconnect().await;
                respond!(response_tx, torn_down);
            }
            PanelAction::SelectChannel(kind) => {
                self.active = kind;
                self.notifier.note(format!("Active channel: {}", kind));
            }
            PanelAction::SetSubscribeTopic(topic) => {
                self.links.get_mut(self.active).set_subscribe_topic(&topic).await;
            }
            PanelAction::SetPublishTopic(topic) => {
                self.links.get_mut(self.active).set_publish_topic(&topic);
            }
            PanelAction::Control { target, action } => {
                let payload = codec::encode(&self.controller_id, &target, &action);
                self.publish_active(payload).await;
            }
            PanelAction::SendRaw(text) => self.publish_active(text.into_bytes()).await,
            PanelAction::StartPolling { response_tx } => {
                self.poller.start().await;
                self.notifier.note("Task Schedule ON".to_string());
                respond!(response_tx, ());
            }
            PanelAction::StopPolling { response_tx } => {
                self.poller.stop().await;
                self.notifier.note("Task Schedule OFF".to_string());
                respond!(response_tx, ());
            }
            PanelAction::Devices { response_tx } => respond!(response_tx, self.registry.snapshot()),
            PanelAction::Traffic { response_tx } => respond!(response_tx, self.traffic.records()),
            PanelAction::ChannelStatus {
                channel,
                response_tx,
            } => respond!(response_tx, self.links.get(channel).status()),
            PanelAction::WatchConnection {
                channel,
                response_tx,
            } => respond!(response_tx, self.links.get(channel).connection.subscribe()),
            PanelAction::ActiveChannel { response_tx } => respond!(response_tx, self.active),
            PanelAction::Shutdown { .. } => error!("Shutdown must be handled by the run loop"),
        }
    }

    async fn publish_active(&mut self, payload: Vec<u8>) {
        if let Some(record) = self.links.get_mut(self.active).publish(payload).await {
            self.record_traffic(record);
        }
    }

    fn record_traffic(&mut self, record: TrafficRecord) {
        self.traffic.push(record.clone());
        self.notifier.emit(PanelEvent::Traffic(record));
    }

    async fn on_inbound(&mut self, inbound: InboundTransport) {
        let InboundTransport {
            channel,
            attempt,
            event,
        } = inbound;

        match event {
            TransportEvent::Message { topic, payload } => {
                let link = self.links.get_mut(channel);
                if attempt != link.connection.attempt() {
                    debug!("Dropping message from stale {} attempt {}", channel, attempt);
                    return;
                }
                link.stats.messages_received += 1;
                link.touch();

                self.record_traffic(TrafficRecord::new(channel, Direction::Received, &topic, &payload));
                self.on_transport_message(&topic, &payload);
            }
            event => self.links.get_mut(channel).on_connection_event(attempt, &event).await,
        }
    }

    /// Feeds a device report into the registry, dropping anything undecodable
    fn on_transport_message(&mut self, topic: &str, payload: &[u8]) {
        let report = match codec::decode(payload) {
            Ok(report) => report,
            Err(e) => {
                warn!("Dropping message on {}: {}", topic, e);
                return;
            }
        };

        if report.device == BROADCAST_TARGET {
            debug!("Ignoring echoed broadcast on {}", topic);
            return;
        }

        if let Some(change) = self.registry.record_report(report, Instant::now()) {
            info!("{} is now {} / {}", change.device, change.status, change.state);
            self.notify_presence(change);
        }
    }

    /// Queues a presence change, replacing any undelivered one for the same
    /// device, and sends what fits
    fn notify_presence(&mut self, change: PresenceChange) {
        self.pending_presence.insert(change.device.clone(), change);
        self.flush_presence();
    }

    fn flush_presence(&mut self) {
        while !self.pending_presence.is_empty() {
            let permit = match self.notifier.tx.try_reserve() {
                Ok(permit) => permit,
                Err(TrySendError::Full(())) => {
                    debug!(
                        "Event queue full, holding {} presence changes",
                        self.pending_presence.len()
                    );
                    return;
                }
                Err(TrySendError::Closed(())) => {
                    debug!("No listener for panel events");
                    self.pending_presence.clear();
                    return;
                }
            };
            if let Some((_, change)) = self.pending_presence.pop_first() {
                permit.send(PanelEvent::DevicePresenceChanged(change));
            }
        }
    }

    /// Broadcasts a status request, then marks silent devices disconnected
    async fn on_tick(&mut self, tick: PollTick) {
        if !self.poller.accepts(tick) {
            debug!("Discarding tick from epoch {}", tick.epoch);
            return;
        }

        if self.links.get(self.active).state() == ConnectionState::Connected {
            let payload = codec::encode(&self.controller_id, &Target::All, &Action::Status);
            self.publish_active(payload).await;
        } else {
            debug!("{} channel not connected, skipping status request", self.active);
        }

        for change in self.registry.sweep_timeouts(Instant::now(), self.liveness_timeout) {
            self.notify_presence(change);
        }
    }

    async fn shutdown(&mut self) {
        self.poller.stop().await;
        self.links.local.disconnect().await;
        self.links.cloud.disconnect().await;
    }
}
