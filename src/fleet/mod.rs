//! Fleet subsystem: who is out there and how we keep asking
//!
//! 1. [`registry`] - presence records and the liveness sweep
//! 2. [`poller`] - periodic ticks driving status requests and sweeps
//!
//! ```text
//! reports ──► DeviceRegistry ◄── sweep ◄── PollTick ◄── StatusPoller
//!                   │
//!                   ▼
//!            PresenceChange
//! ```

pub mod poller;
pub mod registry;
