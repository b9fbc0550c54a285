use super::transport::{Credentials, Endpoint, TlsFiles};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Broker settings of one logical channel as stored in the config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub keep_alive_secs: u64,
    pub clean_session: bool,
    pub reconnect_backoff_secs: u64,
    /// Topic commands are published to
    pub publish_topic: String,
    /// Topic device reports arrive on
    pub subscribe_topic: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self::local()
    }
}

impl MqttConfig {
    pub fn local() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "fleetpanel".to_string(),
            user: None,
            password: None,
            ca_file: None,
            cert_file: None,
            key_file: None,
            keep_alive_secs: 60,
            clean_session: true,
            reconnect_backoff_secs: 2,
            publish_topic: "ESP32bootcamp_control".to_string(),
            subscribe_topic: "ESP32bootcamp_com".to_string(),
        }
    }

    pub fn cloud() -> Self {
        let package = PathBuf::from("connect_device_package");
        Self {
            host: String::new(),
            port: 8883,
            client_id: "master_device".to_string(),
            ca_file: Some(package.join("root-CA.crt")),
            cert_file: Some(package.join("master_pc.cert.pem")),
            key_file: Some(package.join("master_pc.private.key")),
            keep_alive_secs: 30,
            ..Self::local()
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        let credentials = self.user.as_ref().map(|user| Credentials {
            user: user.clone(),
            password: self.password.clone().unwrap_or_default(),
        });
        let tls = self.ca_file.as_ref().map(|ca| TlsFiles {
            ca: ca.clone(),
            client_cert: self.cert_file.clone(),
            client_key: self.key_file.clone(),
        });

        Endpoint {
            host: self.host.clone(),
            port: self.port,
            client_id: self.client_id.clone(),
            credentials,
            tls,
            keep_alive: Duration::from_secs(self.keep_alive_secs),
            clean_session: self.clean_session,
            reconnect_backoff: Duration::from_secs(self.reconnect_backoff_secs),
        }
    }

    pub fn publish_topic(&self) -> Option<&str> {
        non_empty(&self.publish_topic)
    }

    pub fn subscribe_topic(&self) -> Option<&str> {
        non_empty(&self.subscribe_topic)
    }
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_endpoint_is_plain() {
        let endpoint = MqttConfig::local().endpoint();
        assert_eq!(endpoint.host, "localhost");
        assert_eq!(endpoint.port, 1883);
        assert!(endpoint.tls.is_none());
        assert!(endpoint.credentials.is_none());
    }

    #[test]
    fn cloud_endpoint_uses_mutual_tls() {
        let endpoint = MqttConfig::cloud().endpoint();
        let tls = endpoint.tls.unwrap();
        assert!(tls.client_cert.is_some());
        assert!(tls.client_key.is_some());
        assert_eq!(endpoint.keep_alive, Duration::from_secs(30));
    }

    #[test]
    fn blank_topics_count_as_unset() {
        let config = MqttConfig {
            publish_topic: "  ".into(),
            ..MqttConfig::local()
        };
        assert_eq!(config.publish_topic(), None);
        assert_eq!(config.subscribe_topic(), Some("ESP32bootcamp_com"));
    }
}
