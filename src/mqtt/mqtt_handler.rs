use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    TlsConfiguration,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::transport::{Endpoint, TlsFiles, Transport, TransportError, TransportEvent, TransportSink};

/// Pending requests rumqttc buffers between client and event loop
const REQUEST_CAPACITY: usize = 100;
/// How long a graceful disconnect may take before the event loop is aborted
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);
/// rumqttc refuses keep-alive intervals below this
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// [`Transport`] backed by a rumqttc client and its event loop task
#[derive(Default)]
pub struct MqttHandler {
    client: Option<AsyncClient>,
    event_task: Option<JoinHandle<()>>,
}

impl MqttHandler {
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self) -> Result<&AsyncClient, TransportError> {
        self.client.as_ref().ok_or(TransportError::NotConnected)
    }

    fn abort_event_loop(&mut self) {
        if let Some(task) = self.event_task.take() {
            task.abort();
        }
    }
}

impl Drop for MqttHandler {
    fn drop(&mut self) {
        self.abort_event_loop();
    }
}

async fn load_tls(files: &TlsFiles) -> Result<TlsConfiguration, TransportError> {
    let ca = tokio::fs::read(&files.ca)
        .await
        .map_err(|e| TransportError::Tls(format!("{}: {}", files.ca.display(), e)))?;

    let client_auth = match (&files.client_cert, &files.client_key) {
        (Some(cert_path), Some(key_path)) => {
            let cert = tokio::fs::read(cert_path)
                .await
                .map_err(|e| TransportError::Tls(format!("{}: {}", cert_path.display(), e)))?;
            let key = tokio::fs::read(key_path)
                .await
                .map_err(|e| TransportError::Tls(format!("{}: {}", key_path.display(), e)))?;
            Some((cert, key))
        }
        (None, None) => None,
        _ => {
            return Err(TransportError::Tls(
                "client certificate and key must be given together".to_string(),
            ))
        }
    };

    Ok(TlsConfiguration::Simple {
        ca,
        alpn: None,
        client_auth,
    })
}

async fn build_options(endpoint: &Endpoint) -> Result<MqttOptions, TransportError> {
    // MqttOptions::new panics on these
    if endpoint.client_id.is_empty() || endpoint.client_id.starts_with(' ') {
        return Err(TransportError::Connect(format!(
            "invalid client id {:?}",
            endpoint.client_id
        )));
    }

    let mut options = MqttOptions::new(
        endpoint.client_id.clone(),
        endpoint.host.clone(),
        endpoint.port,
    );
    options
        .set_keep_alive(endpoint.keep_alive.max(MIN_KEEP_ALIVE))
        .set_clean_session(endpoint.clean_session);

    if let Some(credentials) = &endpoint.credentials {
        options.set_credentials(credentials.user.clone(), credentials.password.clone());
    }

    if let Some(files) = &endpoint.tls {
        let tls = load_tls(files).await?;
        options.set_transport(rumqttc::Transport::tls_with_config(tls));
    }

    Ok(options)
}

/// Pumps the rumqttc event loop and translates what it sees
///
/// Before the first ConnAck any error ends the attempt. Afterwards errors
/// are interruptions: the loop backs off and polls again, which makes
/// rumqttc reconnect.
async fn drive_event_loop(mut eventloop: EventLoop, sink: TransportSink, backoff: Duration) {
    let mut established = false;
    let mut online = false;

    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                online = true;
                if established {
                    info!("Broker session resumed");
                    TransportEvent::Resumed {
                        session_present: ack.session_present,
                    }
                } else {
                    established = true;
                    TransportEvent::Connected {
                        session_present: ack.session_present,
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => TransportEvent::Message {
                topic: publish.topic.clone(),
                payload: publish.payload.to_vec(),
            },
            Ok(Event::Incoming(Packet::Disconnect)) => {
                sink.emit(TransportEvent::Closed).await;
                break;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Disconnect sent, stopping event loop");
                break;
            }
            Ok(_) => continue,
            Err(ConnectionError::RequestsDone) => {
                debug!("Client dropped, stopping event loop");
                break;
            }
            Err(e) if !established => {
                error!("Connect failed: {}", e);
                sink.emit(TransportEvent::ConnectFailed {
                    reason: e.to_string(),
                })
                .await;
                break;
            }
            Err(e) => {
                let was_online = online;
                online = false;
                tokio::time::sleep(backoff).await;
                if was_online {
                    warn!("Broker connection interrupted: {}", e);
                    TransportEvent::Interrupted {
                        reason: e.to_string(),
                    }
                } else {
                    debug!("Reconnect attempt failed: {}", e);
                    continue;
                }
            }
        };

        if !sink.emit(event).await {
            break;
        }
    }
}

#[async_trait]
impl Transport for MqttHandler {
    async fn connect(
        &mut self,
        endpoint: &Endpoint,
        sink: TransportSink,
    ) -> Result<(), TransportError> {
        // A previous session that was never disconnected is simply dropped
        self.client = None;
        self.abort_event_loop();

        let options = build_options(endpoint).await?;
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let backoff = endpoint.reconnect_backoff;

        self.event_task = Some(tokio::spawn(drive_event_loop(eventloop, sink, backoff)));
        self.client = Some(client);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let result = match self.client.take() {
            Some(client) => client
                .disconnect()
                .await
                .map_err(|e| TransportError::Disconnect(e.to_string())),
            None => Ok(()),
        };

        if let Some(mut task) = self.event_task.take() {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut task).await.is_err() {
                warn!("Event loop did not stop in time, aborting");
                task.abort();
            }
        }
        result
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.client()?
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.client()?
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.client()?
            .unsubscribe(topic)
            .await
            .map_err(|e| TransportError::Unsubscribe(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn publish_without_session_is_not_connected() {
        let handler = MqttHandler::new();
        let err = handler.publish("fleet/control", b"{}".to_vec()).await.unwrap_err();
        assert_eq!(err, TransportError::NotConnected);

        let err = handler.subscribe("fleet/status").await.unwrap_err();
        assert_eq!(err, TransportError::NotConnected);
    }

    #[tokio::test]
    async fn empty_client_id_is_rejected() {
        let err = build_options(&Endpoint::new("localhost", 1883, "")).await.unwrap_err();
        assert!(matches!(err, TransportError::Connect(_)));
    }

    #[tokio::test]
    async fn missing_ca_file_is_a_tls_error() {
        let mut endpoint = Endpoint::new("iot.example.com", 8883, "master_device");
        endpoint.tls = Some(TlsFiles {
            ca: PathBuf::from("/nonexistent/root-CA.crt"),
            client_cert: None,
            client_key: None,
        });

        let err = build_options(&endpoint).await.unwrap_err();
        assert!(matches!(err, TransportError::Tls(_)));
    }

    #[tokio::test]
    async fn half_configured_client_auth_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ca = dir.path().join("root-CA.crt");
        std::fs::write(&ca, b"not really a certificate").unwrap();

        let files = TlsFiles {
            ca,
            client_cert: Some(dir.path().join("panel.cert.pem")),
            client_key: None,
        };
        let err = load_tls(&files).await.unwrap_err();
        assert!(matches!(err, TransportError::Tls(_)));
    }

    #[tokio::test]
    async fn plain_options_point_at_broker() {
        let mut endpoint = Endpoint::new("localhost", 1883, "fleetpanel");
        endpoint.credentials = Some(crate::mqtt::transport::Credentials {
            user: "operator".into(),
            password: "secret".into(),
        });

        let options = build_options(&endpoint).await.unwrap();
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
        assert_eq!(options.client_id(), "fleetpanel");
    }
}
