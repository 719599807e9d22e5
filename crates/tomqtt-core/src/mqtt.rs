//! MQTT session bootstrap.
//!
//! Thin layer over rumqttc: option building from a `host[:port]` CLI
//! argument, the QoS-by-broker-locality rule, the live [`MqttSink`]
//! implementation and the shutdown barrier loop. The rumqttc event loop
//! performs its own keepalive and socket maintenance, so no periodic
//! maintenance tick exists on our side.

use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tracing::{error, warn};

use crate::error::Result;
use crate::publish::{MqttSink, SelfSync};

/// Broker connection parameters.
#[derive(Debug, Clone)]
pub struct MqttSettings {
    /// Broker host
    pub host: String,
    /// Broker TCP port
    pub port: u16,
    /// Session QoS for every publish and subscription
    pub qos: QoS,
    /// Client identifier, `<name>-<pid>` by convention
    pub client_id: String,
}

impl MqttSettings {
    /// Build settings from a `host[:port]` argument. QoS defaults to 0
    /// against localhost and 1 otherwise; pass `qos` to override.
    pub fn new(host_arg: &str, name: &str, qos: Option<QoS>) -> Self {
        let (host, port) = split_host_port(host_arg);
        let qos = qos.unwrap_or(if host == "localhost" {
            QoS::AtMostOnce
        } else {
            QoS::AtLeastOnce
        });
        Self {
            host,
            port,
            qos,
            client_id: format!("{}-{}", name, std::process::id()),
        }
    }

    /// Open the broker session.
    pub fn session(&self) -> (AsyncClient, EventLoop) {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(Duration::from_secs(10));
        AsyncClient::new(options, 64)
    }
}

/// Split `host[:port]`, unwrapping bracketed IPv6 literals.
fn split_host_port(arg: &str) -> (String, u16) {
    if let Some(rest) = arg.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            if let Some(port) = tail.strip_prefix(':').and_then(|p| p.parse().ok()) {
                return (host.to_string(), port);
            }
            return (host.to_string(), 1883);
        }
    }
    if let Some((host, port)) = arg.rsplit_once(':') {
        if !host.contains(':') {
            if let Ok(port) = port.parse() {
                return (host.to_string(), port);
            }
        }
    }
    (arg.to_string(), 1883)
}

/// Live sink queueing into the rumqttc client.
///
/// `try_publish` never blocks the event loop; an overflowing request
/// queue is logged and the publish dropped, matching the original's
/// fire-and-forget `mosquitto_publish`.
pub struct RumqttcSink {
    client: AsyncClient,
    qos: QoS,
}

impl RumqttcSink {
    /// Wrap a connected client with the session QoS.
    pub fn new(client: AsyncClient, qos: QoS) -> Self {
        Self { client, qos }
    }
}

impl MqttSink for RumqttcSink {
    fn publish(&mut self, topic: &str, payload: &str, retain: bool) {
        if let Err(e) = self.client.try_publish(topic, self.qos, retain, payload) {
            error!(topic, error = %e, "publish failed");
        }
    }
}

/// Run the self-sync barrier: subscribe, publish the token, then spin the
/// event loop until the token echoes back. Returns once the broker has
/// demonstrably committed everything published before the call.
pub async fn self_sync_barrier(
    client: &AsyncClient,
    eventloop: &mut EventLoop,
    qos: QoS,
) -> Result<()> {
    let sync = SelfSync::new();
    client.subscribe(SelfSync::TOPIC, qos).await?;
    client
        .publish(SelfSync::TOPIC, qos, false, sync.token())
        .await?;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(msg))) => {
                if sync.matches(&msg.topic, &msg.payload) {
                    return Ok(());
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "broker lost during shutdown barrier");
                return Err(e.into());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_parsing() {
        assert_eq!(split_host_port("localhost"), ("localhost".into(), 1883));
        assert_eq!(split_host_port("broker.lan:2883"), ("broker.lan".into(), 2883));
        assert_eq!(split_host_port("[::1]"), ("::1".into(), 1883));
        assert_eq!(split_host_port("[::1]:2883"), ("::1".into(), 2883));
        assert_eq!(split_host_port("fe80::1"), ("fe80::1".into(), 1883));
    }

    #[test]
    fn qos_defaults_by_locality() {
        assert_eq!(
            MqttSettings::new("localhost", "attomqtt", None).qos,
            QoS::AtMostOnce
        );
        assert_eq!(
            MqttSettings::new("broker.lan", "attomqtt", None).qos,
            QoS::AtLeastOnce
        );
        assert_eq!(
            MqttSettings::new("localhost", "attomqtt", Some(QoS::AtLeastOnce)).qos,
            QoS::AtLeastOnce
        );
    }

    #[test]
    fn client_id_carries_pid() {
        let settings = MqttSettings::new("localhost", "wifitomqtt", None);
        assert!(settings.client_id.starts_with("wifitomqtt-"));
    }
}
