//! Publish-on-change state cache and the clean-shutdown drain.
//!
//! Every derived property has a retained topic and a cache of the last
//! value the broker received for it. Publication compares against the
//! cache and stays silent on equality, so a flapping poller never floods
//! the broker. Raw passthroughs (`raw/at`, `tmp/<iface>/wpa`, `fail`,
//! `warn`, scan results) bypass the cache and are never retained.
//!
//! On clean shutdown every retained topic with a non-empty cache is
//! published empty, clearing the broker-side last-value cache, before the
//! self-sync barrier confirms the broker caught up.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

/// Publishing seam between dispatchers and the MQTT session.
///
/// Dispatchers only ever talk to this trait; the live implementation
/// queues into the rumqttc client, tests record.
pub trait MqttSink {
    /// Publish `payload` on `topic` with the session QoS.
    fn publish(&mut self, topic: &str, payload: &str, retain: bool);
}

/// Last-published-value cache over every retained topic of the session.
#[derive(Debug, Default)]
pub struct StateCache {
    values: HashMap<String, String>,
}

impl StateCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish retained, suppressed when `value` equals the cached value.
    pub fn publish_if_changed(&mut self, sink: &mut dyn MqttSink, topic: &str, value: &str) {
        let cached = self.values.get(topic).map(String::as_str).unwrap_or("");
        if cached == value {
            return;
        }
        sink.publish(topic, value, true);
        self.values.insert(topic.to_string(), value.to_string());
    }

    /// Last value the broker received for `topic`, if any was published.
    pub fn cached(&self, topic: &str) -> Option<&str> {
        self.values.get(topic).map(String::as_str)
    }

    /// Publish the empty string to every topic whose cache is non-empty.
    /// Called once from the draining state.
    pub fn clear_all(&mut self, sink: &mut dyn MqttSink) {
        let mut topics: Vec<String> = self
            .values
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(t, _)| t.clone())
            .collect();
        topics.sort();
        for topic in topics {
            sink.publish(&topic, "", true);
            self.values.insert(topic, String::new());
        }
    }
}

/// The self-sync shutdown barrier.
///
/// A process-unique token is published to [`SelfSync::TOPIC`]; the process
/// subscribes to the same topic and treats reception of its own token as
/// "broker caught up", guaranteeing every prior publish was committed.
#[derive(Debug)]
pub struct SelfSync {
    token: String,
}

impl SelfSync {
    /// Topic shared by the whole tomqtt family.
    pub const TOPIC: &'static str = "tmp/selfsync";

    /// Generate a process-unique token.
    pub fn new() -> Self {
        let unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let token = format!(
            "{}-{}-{}",
            std::process::id(),
            unix,
            rand::thread_rng().gen::<u32>()
        );
        Self { token }
    }

    /// The token to publish on [`SelfSync::TOPIC`].
    pub fn token(&self) -> &str {
        &self.token
    }

    /// True when an inbound message is our own token coming back.
    pub fn matches(&self, topic: &str, payload: &[u8]) -> bool {
        topic == Self::TOPIC && payload == self.token.as_bytes()
    }
}

impl Default for SelfSync {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::RecordingSink;

    #[test]
    fn second_identical_publish_is_suppressed() {
        let mut cache = StateCache::new();
        let mut sink = RecordingSink::new();
        cache.publish_if_changed(&mut sink, "net/wlan0/rssi", "-55");
        cache.publish_if_changed(&mut sink, "net/wlan0/rssi", "-55");
        assert_eq!(sink.count("net/wlan0/rssi"), 1);
        cache.publish_if_changed(&mut sink, "net/wlan0/rssi", "-60");
        assert_eq!(sink.count("net/wlan0/rssi"), 2);
        assert_eq!(cache.cached("net/wlan0/rssi"), Some("-60"));
    }

    #[test]
    fn empty_equals_absent() {
        let mut cache = StateCache::new();
        let mut sink = RecordingSink::new();
        cache.publish_if_changed(&mut sink, "net/wlan0/ssid", "");
        assert_eq!(sink.count("net/wlan0/ssid"), 0);
    }

    #[test]
    fn clear_all_blanks_only_nonempty_topics() {
        let mut cache = StateCache::new();
        let mut sink = RecordingSink::new();
        cache.publish_if_changed(&mut sink, "net/wlan0/ssid", "Home");
        cache.publish_if_changed(&mut sink, "net/wlan0/level", "-55");
        cache.publish_if_changed(&mut sink, "net/wlan0/freq", "2.412G");
        cache.publish_if_changed(&mut sink, "net/wlan0/freq", "");
        sink.clear();

        cache.clear_all(&mut sink);
        assert_eq!(sink.last("net/wlan0/ssid"), Some(""));
        assert_eq!(sink.last("net/wlan0/level"), Some(""));
        assert_eq!(sink.count("net/wlan0/freq"), 0);
        assert!(sink.messages.iter().all(|m| m.retain));
    }

    #[test]
    fn self_sync_matches_own_token_only() {
        let sync = SelfSync::new();
        assert!(sync.matches(SelfSync::TOPIC, sync.token().as_bytes()));
        assert!(!sync.matches(SelfSync::TOPIC, b"1-2-3"));
        assert!(!sync.matches("tmp/other", sync.token().as_bytes()));
    }
}
