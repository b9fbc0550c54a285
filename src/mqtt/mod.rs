//! # MQTT Integration Module
//!
//! Everything the panel needs to talk to its broker channels. The panel core
//! depends only on the [`transport::Transport`] capability set; the rumqttc
//! client lives behind it in [`mqtt_handler`].
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Per-channel broker settings and endpoint building
//! ├── codec.rs            - Control envelope and device report JSON
//! ├── transport.rs        - Transport trait, events and per-attempt sinks
//! ├── mqtt_handler.rs     - rumqttc-backed transport and event loop driver
//! ├── subscription.rs     - At-most-one subscription per channel
//! ├── connection.rs       - Connection state machine
//! └── message_manager.rs  - Traffic records and bounded traffic log
//! ```
//!
//! ## Channels
//!
//! The panel knows two logical channels, a plain broker on the local network
//! and a TLS broker in the cloud. Each has its own connection state,
//! subscription and publish topic; the operator picks which one commands go
//! out on.

pub mod codec;
pub mod config;
pub mod connection;
pub mod message_manager;
pub mod mqtt_handler;
pub mod subscription;
pub mod transport;

#[cfg(test)]
pub mod mock_transport;
