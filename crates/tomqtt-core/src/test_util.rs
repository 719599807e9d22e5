//! Test doubles shared by the bridge crates' unit and integration tests.
//!
//! [`MockTransport`] records written command lines and serves scripted
//! incoming chunks; [`RecordingSink`] captures every publish so tests can
//! assert on topics, payloads and retain flags.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{BridgeError, Result};
use crate::publish::MqttSink;
use crate::transport::Transport;

/// Shared handle onto the lines a [`MockTransport`] wrote.
pub type WrittenLines = Arc<Mutex<Vec<String>>>;

/// In-memory transport double.
#[derive(Debug, Default)]
pub struct MockTransport {
    written: WrittenLines,
    incoming: VecDeque<Bytes>,
    connected: bool,
    /// When set, every write fails with this many consecutive blocks seen
    pub fail_writes_blocked: bool,
}

impl MockTransport {
    /// Create a disconnected mock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle to the written-lines log, for assertions after the
    /// transport was moved into a bridge.
    pub fn written(&self) -> WrittenLines {
        Arc::clone(&self.written)
    }

    /// Queue a chunk for a later `read_chunk` call.
    pub fn push_incoming(&mut self, data: impl AsRef<[u8]>) {
        self.incoming.push_back(Bytes::copy_from_slice(data.as_ref()));
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    async fn read_chunk(&mut self) -> Result<Bytes> {
        match self.incoming.pop_front() {
            Some(data) => Ok(data),
            // A live transport pends until data arrives; tests drive the
            // dispatchers directly, so an empty script never resolves.
            None => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        if self.fail_writes_blocked {
            return Err(BridgeError::WriteBlocked { consecutive: 1 });
        }
        self.written.lock().unwrap().push(line.to_string());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// One captured publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    /// Full topic
    pub topic: String,
    /// Payload as text
    pub payload: String,
    /// Retain flag
    pub retain: bool,
}

/// Sink double capturing every publish in order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    /// Captured messages, oldest first
    pub messages: Vec<Published>,
}

impl RecordingSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last payload published on `topic`.
    pub fn last(&self, topic: &str) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.topic == topic)
            .map(|m| m.payload.as_str())
    }

    /// Every payload published on `topic`, oldest first.
    pub fn all(&self, topic: &str) -> Vec<&str> {
        self.messages
            .iter()
            .filter(|m| m.topic == topic)
            .map(|m| m.payload.as_str())
            .collect()
    }

    /// Number of publishes on `topic`.
    pub fn count(&self, topic: &str) -> usize {
        self.messages.iter().filter(|m| m.topic == topic).count()
    }

    /// Retain flag of the last publish on `topic`.
    pub fn last_retain(&self, topic: &str) -> Option<bool> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.topic == topic)
            .map(|m| m.retain)
    }

    /// Forget everything captured so far.
    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

impl MqttSink for RecordingSink {
    fn publish(&mut self, topic: &str, payload: &str, retain: bool) {
        self.messages.push(Published {
            topic: topic.to_string(),
            payload: payload.to_string(),
            retain,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_transport_scripts_and_records() {
        let mut t = MockTransport::new();
        t.connect().await.unwrap();
        t.push_incoming(b"OK\r\n");
        assert_eq!(t.read_chunk().await.unwrap().as_ref(), b"OK\r\n");
        t.write_line("AT+CSQ").await.unwrap();
        assert_eq!(*t.written().lock().unwrap(), vec!["AT+CSQ".to_string()]);
    }

    #[test]
    fn recording_sink_queries() {
        let mut sink = RecordingSink::new();
        sink.publish("a/b", "1", true);
        sink.publish("a/b", "2", true);
        sink.publish("a/c", "x", false);
        assert_eq!(sink.last("a/b"), Some("2"));
        assert_eq!(sink.all("a/b"), vec!["1", "2"]);
        assert_eq!(sink.count("a/c"), 1);
        assert_eq!(sink.last_retain("a/c"), Some(false));
    }
}
