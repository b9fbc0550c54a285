//! Device presence registry
//!
//! Presence is inferred from message arrival only. A device is whatever last
//! reported about itself, until it stays silent for longer than the liveness
//! timeout and a sweep marks it Disconnected/OFF.
//!
//! The registry itself does no locking and emits nothing. It is owned by the
//! dispatcher task, which serializes reports and sweeps, and every mutation
//! returns the [`PresenceChange`]s it caused so they can be delivered after
//! the mutation finished.

use crate::mqtt::codec::{DeviceReport, PowerState, PresenceStatus};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: String,
    pub status: PresenceStatus,
    pub state: PowerState,
    /// Arrival time of the last report, `None` if never heard from
    pub last_seen: Option<Instant>,
}

impl Device {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            status: PresenceStatus::Disconnected,
            state: PowerState::Off,
            last_seen: None,
        }
    }

    fn is_silent(&self, now: Instant, threshold: Duration) -> bool {
        match self.last_seen {
            Some(seen) => now.saturating_duration_since(seen) > threshold,
            None => true,
        }
    }
}

/// Presence notification for the presentation layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceChange {
    pub device: String,
    pub status: PresenceStatus,
    pub state: PowerState,
}

impl From<&Device> for PresenceChange {
    fn from(device: &Device) -> Self {
        Self {
            device: device.id.clone(),
            status: device.status,
            state: device.state,
        }
    }
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<String, Device>,
}

impl DeviceRegistry {
    /// Registry pre-populated with a known fleet, all Disconnected/OFF
    pub fn with_fleet<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let devices = ids
            .into_iter()
            .map(|id| {
                let device = Device::new(id.as_ref());
                (device.id.clone(), device)
            })
            .collect();
        Self { devices }
    }

    /// Applies a report received at `now`
    ///
    /// Unknown devices are created on the fly and always announced once.
    /// Known devices only produce a change when status or state differs.
    pub fn record_report(&mut self, report: DeviceReport, now: Instant) -> Option<PresenceChange> {
        let mut created = false;
        let device = self
            .devices
            .entry(report.device.clone())
            .or_insert_with(|| {
                created = true;
                Device::new(&report.device)
            });

        let changed = device.status != report.status || device.state != report.state;
        device.status = report.status;
        device.state = report.state;
        device.last_seen = Some(now);

        if created {
            info!("New device {} ({}, {})", device.id, device.status, device.state);
        }
        if created || changed {
            debug!("{} is now {} / {}", device.id, device.status, device.state);
            Some(PresenceChange::from(&*device))
        } else {
            None
        }
    }

    /// Marks every device silent for longer than `threshold` as gone
    ///
    /// A device is only reported on the sweep that actually disconnects it.
    pub fn sweep_timeouts(&mut self, now: Instant, threshold: Duration) -> Vec<PresenceChange> {
        let mut changes = Vec::new();
        for device in self.devices.values_mut() {
            if device.status != PresenceStatus::Disconnected && device.is_silent(now, threshold) {
                device.status = PresenceStatus::Disconnected;
                device.state = PowerState::Off;
                info!("{} timed out", device.id);
                changes.push(PresenceChange::from(&*device));
            }
        }
        changes
    }

    pub fn get(&self, id: &str) -> Option<&Device> {
        self.devices.get(id)
    }

    pub fn snapshot(&self) -> Vec<Device> {
        self.devices.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }
}
