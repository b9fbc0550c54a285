use chrono::NaiveDateTime;
use std::collections::VecDeque;
use std::fmt;

use super::transport::ChannelKind;

/// Direction of a payload relative to the panel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Published,
    Received,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Direction::Published => write!(f, "publish"),
            Direction::Received => write!(f, "subscribed"),
        }
    }
}

/// One payload that crossed a broker channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficRecord {
    pub channel: ChannelKind,
    pub direction: Direction,
    pub topic: String,
    pub content: String,
    pub timestamp: NaiveDateTime,
}

impl fmt::Display for TrafficRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = self.content.chars().take(40).collect();
        write!(f, "{} - {}", self.timestamp.format("%H:%M:%S"), preview)
    }
}

impl TrafficRecord {
    pub fn new(channel: ChannelKind, direction: Direction, topic: &str, payload: &[u8]) -> Self {
        TrafficRecord {
            channel,
            direction,
            topic: topic.to_string(),
            content: String::from_utf8_lossy(payload).into_owned(),
            timestamp: chrono::Local::now().naive_local(),
        }
    }

    pub fn render(&self) -> String {
        format!(
            "{} [{} {}] {}\n{}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.channel,
            self.direction,
            self.topic,
            self.content
        )
    }
}

/// Bounded history of recent traffic, oldest entries dropped first
#[derive(Debug)]
pub struct TrafficLog {
    records: VecDeque<TrafficRecord>,
    capacity: usize,
}

impl TrafficLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn push(&mut self, record: TrafficRecord) {
        if self.capacity == 0 {
            return;
        }
        while self.records.len() >= self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn records(&self) -> Vec<TrafficRecord> {
        self.records.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_drops_oldest_entries() {
        let mut log = TrafficLog::new(2);
        for n in 0..3 {
            log.push(TrafficRecord::new(
                ChannelKind::Local,
                Direction::Received,
                "fleet",
                format!("{n}").as_bytes(),
            ));
        }

        let contents: Vec<_> = log.records().into_iter().map(|r| r.content).collect();
        assert_eq!(contents, vec!["1", "2"]);
    }

    #[test]
    fn non_utf8_payload_is_rendered_lossy() {
        let record = TrafficRecord::new(ChannelKind::Cloud, Direction::Published, "t", &[0xff, b'A']);
        assert!(record.content.ends_with('A'));
        assert!(record.render().contains("[cloud publish] t"));
    }

    #[test]
    fn display_shortens_long_payloads() {
        let long = "x".repeat(100);
        let record = TrafficRecord::new(ChannelKind::Local, Direction::Received, "t", long.as_bytes());
        assert!(record.to_string().len() < 60);
    }
}
