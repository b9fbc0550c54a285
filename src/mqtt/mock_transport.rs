//! Recording transport double used by the unit tests

use super::transport::{Endpoint, Transport, TransportError, TransportEvent, TransportSink};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect(String),
    Disconnect,
    Publish(String, Vec<u8>),
    Subscribe(String),
    Unsubscribe(String),
}

#[derive(Default)]
struct Shared {
    calls: Vec<Call>,
    sink: Option<TransportSink>,
    /// Survives `disconnect`, like a sender clone held by a task that has
    /// not noticed the teardown yet
    last_sink: Option<TransportSink>,
    fail_connect: bool,
    fail_publish: bool,
    fail_subscribe: bool,
    fail_unsubscribe: bool,
}

/// Cloneable view on a [`MockTransport`] kept by the test after the
/// transport itself was moved into the code under test
#[derive(Clone, Default)]
pub struct MockProbe {
    shared: Arc<Mutex<Shared>>,
}

impl MockProbe {
    pub fn calls(&self) -> Vec<Call> {
        self.shared.lock().unwrap().calls.clone()
    }

    pub fn clear(&self) {
        self.shared.lock().unwrap().calls.clear();
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Publish(topic, payload) => Some((topic, payload)),
                _ => None,
            })
            .collect()
    }

    pub fn fail_connect(&self, fail: bool) {
        self.shared.lock().unwrap().fail_connect = fail;
    }

    pub fn fail_publish(&self, fail: bool) {
        self.shared.lock().unwrap().fail_publish = fail;
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.shared.lock().unwrap().fail_subscribe = fail;
    }

    pub fn fail_unsubscribe(&self, fail: bool) {
        self.shared.lock().unwrap().fail_unsubscribe = fail;
    }

    /// Sink handed over by the most recent connect, even after disconnect
    pub fn last_sink(&self) -> Option<TransportSink> {
        self.shared.lock().unwrap().last_sink.clone()
    }

    /// Pushes an event as if the broker produced it
    pub async fn inject(&self, event: TransportEvent) -> bool {
        let sink = self.shared.lock().unwrap().sink.clone();
        match sink {
            Some(sink) => sink.emit(event).await,
            None => false,
        }
    }
}

pub struct MockTransport {
    shared: Arc<Mutex<Shared>>,
}

impl MockTransport {
    pub fn new() -> (Self, MockProbe) {
        let probe = MockProbe::default();
        (
            Self {
                shared: probe.shared.clone(),
            },
            probe,
        )
    }

    fn record(&self, call: Call) {
        self.shared.lock().unwrap().calls.push(call);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &mut self,
        endpoint: &Endpoint,
        sink: TransportSink,
    ) -> Result<(), TransportError> {
        self.record(Call::Connect(endpoint.to_string()));
        let mut shared = self.shared.lock().unwrap();
        if shared.fail_connect {
            return Err(TransportError::Connect("refused by mock".into()));
        }
        shared.last_sink = Some(sink.clone());
        shared.sink = Some(sink);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.record(Call::Disconnect);
        self.shared.lock().unwrap().sink = None;
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.shared.lock().unwrap().fail_publish {
            return Err(TransportError::Publish("mock".into()));
        }
        self.record(Call::Publish(topic.to_string(), payload));
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        if self.shared.lock().unwrap().fail_subscribe {
            return Err(TransportError::Subscribe("mock".into()));
        }
        self.record(Call::Subscribe(topic.to_string()));
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        if self.shared.lock().unwrap().fail_unsubscribe {
            return Err(TransportError::Unsubscribe("mock".into()));
        }
        self.record(Call::Unsubscribe(topic.to_string()));
        Ok(())
    }
}
