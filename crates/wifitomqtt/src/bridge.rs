//! The supplicant bridge: command plumbing, aggregates, event loop.
//!
//! `WifiBridge` owns every moving part - transport, command FIFO, timer
//! wheel, publish cache, domain model - and is driven from exactly one
//! task. The record and topic handlers live in [`crate::dispatch`] and
//! [`crate::ingress`]; this module provides the plumbing they share and
//! the `run` loop that multiplexes the control socket, the MQTT event
//! loop, signals and the timer wheel.

use std::time::{Duration, Instant};

use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, Packet, QoS};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use tomqtt_core::error::{BridgeError, Result};
use tomqtt_core::mqtt::self_sync_barrier;
use tomqtt_core::publish::{MqttSink, StateCache};
use tomqtt_core::queue::{CommandQueue, MAX_CONSECUTIVE_TIMEOUTS};
use tomqtt_core::timer::TimerWheel;
use tomqtt_core::transport::Transport;

use crate::station::{Mode, Network, StationState};

/// Supplicant commands answer within this, or count as timed out.
pub const CMD_TIMEOUT: Duration = Duration::from_secs(3);

/// Idle gap after the last write before a keepalive probe goes out.
pub const KEEPALIVE: Duration = Duration::from_secs(5);

/// Delay before reattempting a blocked write.
pub const WRITE_RETRY: Duration = Duration::from_secs(1);

/// Timer-wheel keys of this bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiTimer {
    /// The in-flight command's response deadline
    CmdTimeout,
    /// Keepalive probe
    Keepalive,
    /// Retry of a blocked transport write
    WriteRetry,
}

/// The wpa_supplicant-to-MQTT bridge core.
pub struct WifiBridge<S: MqttSink> {
    iface: String,
    noapbgscan: bool,
    /// Publish seam; exposed so tests can inspect a recording sink
    pub sink: S,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) queue: CommandQueue,
    pub(crate) timers: TimerWheel<WifiTimer>,
    pub(crate) cache: StateCache,
    pub(crate) st: StationState,
    lost: Option<String>,
}

enum LoopEvent {
    Chunk(Bytes),
    Inbound(String, Vec<u8>),
    Signal,
    Tick,
    Nothing,
}

impl<S: MqttSink> WifiBridge<S> {
    /// Build a bridge for `iface` over the given transport.
    pub fn new(iface: impl Into<String>, noapbgscan: bool, sink: S, transport: Box<dyn Transport>) -> Self {
        Self {
            iface: iface.into(),
            noapbgscan,
            sink,
            transport,
            queue: CommandQueue::new(),
            timers: TimerWheel::new(),
            cache: StateCache::new(),
            st: StationState::new(),
            lost: None,
        }
    }

    /// Interface this bridge controls.
    pub fn iface(&self) -> &str {
        &self.iface
    }

    /// The `--no-ap-bgscan` switch.
    pub(crate) fn noapbgscan(&self) -> bool {
        self.noapbgscan
    }

    /// Domain model, for tests.
    pub fn state(&self) -> &StationState {
        &self.st
    }

    /// Command FIFO, for tests.
    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// Set once the transport is given up; the loop then drains and exits.
    pub fn lost_reason(&self) -> Option<&str> {
        self.lost.as_deref()
    }

    // ---- topics ------------------------------------------------------

    pub(crate) fn topic(&self, suffix: &str) -> String {
        format!("net/{}/{}", self.iface, suffix)
    }

    pub(crate) fn bss_topic(&self, bssid: &str, name: &str) -> String {
        format!("net/{}/bss/{}/{}", self.iface, bssid, name)
    }

    /// Retained, publish-on-change.
    pub(crate) fn publish_state(&mut self, suffix: &str, value: &str) {
        let topic = self.topic(suffix);
        self.cache.publish_if_changed(&mut self.sink, &topic, value);
    }

    /// Retained per-BSS property, publish-on-change.
    pub(crate) fn publish_bss(&mut self, bssid: &str, name: &str, value: &str) {
        let topic = self.bss_topic(bssid, name);
        self.cache.publish_if_changed(&mut self.sink, &topic, value);
    }

    /// Non-retained diagnostic on `net/<iface>/fail`.
    pub(crate) fn publish_fail(&mut self, value: &str) {
        let topic = self.topic("fail");
        self.sink.publish(&topic, value, false);
    }

    /// Clear the four retained topics of a BSS.
    pub(crate) fn hide_bss(&mut self, bssid: &str) {
        for name in ["freq", "level", "flags", "ssid"] {
            self.publish_bss(bssid, name, "");
        }
    }

    // ---- command plumbing --------------------------------------------

    /// Queue a command; written immediately when it became head.
    pub(crate) async fn send(&mut self, line: String) {
        if self.queue.push(line, CMD_TIMEOUT) {
            self.write_head().await;
        }
    }

    /// Queue a command unless the identical line already sits in the FIFO.
    pub(crate) async fn send_unique(&mut self, line: String) {
        if !self.queue.contains(&line) {
            self.send(line).await;
        }
    }

    /// Write the current head, once, and arm its deadline plus the
    /// keepalive. A head already in flight is left alone.
    pub(crate) async fn write_head(&mut self) {
        if self.queue.is_in_flight() {
            return;
        }
        let Some(head) = self.queue.head() else {
            self.timers.remove(&WifiTimer::CmdTimeout);
            return;
        };
        let line = head.line.clone();
        let deadline = head.timeout;

        match self.transport.write_line(&line).await {
            Ok(()) => {
                self.queue.mark_in_flight();
                let now = Instant::now();
                self.timers.add(now, deadline, WifiTimer::CmdTimeout);
                self.timers.add(now, KEEPALIVE, WifiTimer::Keepalive);
            }
            Err(e) if !e.is_fatal() => {
                warn!(line, error = %e, "write blocked, retrying");
                self.timers
                    .add(Instant::now(), WRITE_RETRY, WifiTimer::WriteRetry);
            }
            Err(e) => {
                self.publish_fail(&format!("send '{line}': {e}"));
                warn!(line, error = %e, "transport write failed");
                self.lost = Some(e.to_string());
            }
        }
    }

    /// Queue the initial ATTACH; the OK reply kicks off the state fetch.
    pub async fn attach(&mut self) {
        self.send("ATTACH".into()).await;
    }

    /// Timer-wheel callback.
    pub async fn handle_timer(&mut self, key: WifiTimer) {
        match key {
            WifiTimer::CmdTimeout => {
                self.publish_fail("timeout");
                if let Some((cmd, count)) = self.queue.timeout_head() {
                    warn!(cmd = %cmd.line, count, "command timeout");
                    if count >= MAX_CONSECUTIVE_TIMEOUTS {
                        self.lost =
                            Some(format!("last {count} commands got timeout, supplicant lost"));
                        return;
                    }
                }
                self.write_head().await;
            }
            WifiTimer::Keepalive => {
                if self.st.curr_mode == Mode::Station {
                    self.send_unique("SIGNAL_POLL".into()).await;
                    if !self.st.curr_bssid.is_empty() {
                        let bssid = self.st.curr_bssid.clone();
                        self.send_unique(format!("BSS {bssid}")).await;
                    } else {
                        self.send_unique("PING".into()).await;
                    }
                } else {
                    self.send_unique("PING".into()).await;
                }
            }
            WifiTimer::WriteRetry => self.write_head().await,
        }
    }

    // ---- aggregated state --------------------------------------------

    /// Track the observed wifi state and publish the effective one; all
    /// networks of the selected mode disabled reads as `off`.
    pub(crate) fn set_wifi_state(&mut self, state: &'static str) {
        self.st.real_state = state;
        if state == "station" {
            if self.st.saved_speed != 0 {
                self.publish_state("speed", "");
            }
            self.st.saved_speed = 0;
            if self.st.saved_rssi != 0 {
                self.publish_state("rssi", "");
            }
            self.st.saved_rssi = 0;
        }
        let effective = if self.st.is_mode_off() { "off" } else { state };
        if self.st.published_state.as_deref() == Some(effective) {
            return;
        }
        info!(
            from = self.st.published_state.as_deref().unwrap_or(""),
            to = effective,
            "wifi state"
        );
        self.publish_state("wifistate", effective);
        self.st.published_state = Some(effective.to_string());
    }

    /// Re-evaluate the wifi state after enable/disable churn.
    pub(crate) fn nets_enabled_changed(&mut self) {
        self.set_wifi_state(self.st.real_state);
    }

    /// Publish the station counter; negative means "not applicable".
    pub(crate) fn set_stations(&mut self, n: i32) {
        self.st.nstations = n;
        let value = if n < 0 { String::new() } else { n.to_string() };
        self.publish_state("stations", &value);
    }

    /// SIGNAL_POLL rssi, published only when the integer value moved.
    pub(crate) fn publish_rssi(&mut self, raw: &str) {
        let value: i32 = raw.trim().parse().unwrap_or(0);
        if value == self.st.saved_rssi {
            return;
        }
        self.st.saved_rssi = value;
        self.publish_state("rssi", &value.to_string());
    }

    /// SIGNAL_POLL link speed, published only when the value moved.
    pub(crate) fn publish_speed(&mut self, raw: &str) {
        let value: i32 = raw.trim().parse().unwrap_or(0);
        if value == self.st.saved_speed {
            return;
        }
        self.st.saved_speed = value;
        self.publish_state("speed", &value.to_string());
    }

    /// A network appeared, changed or is going away: refresh the flag
    /// masks of matching BSSes and the `lastAP`/`lastmesh` topics.
    pub(crate) fn network_changed(&mut self, ssid: &str, removing: bool) {
        let net: Option<Network> = if removing {
            None
        } else {
            self.st.networks.get(ssid).cloned()
        };

        let mut flag_updates = Vec::new();
        for (bssid, bss) in self.st.bsss.iter_mut() {
            if bss.ssid != ssid {
                continue;
            }
            let before = bss.flags;
            bss.flags.set_network(net.as_ref());
            if before != bss.flags {
                flag_updates.push((bssid.clone(), bss.flags.render()));
            }
        }
        for (bssid, mask) in flag_updates {
            self.publish_bss(&bssid, "flags", &mask);
        }

        let exclude = removing.then_some(ssid);
        let last_ap = self
            .st
            .last_of_mode(Mode::Ap, exclude)
            .map(|n| (n.id, n.ssid.clone()));
        let new_id = last_ap.as_ref().and_then(|(id, _)| *id);
        if new_id != self.st.last_ap_id {
            self.st.last_ap_id = new_id;
            let value = last_ap.map(|(_, s)| s).unwrap_or_default();
            self.publish_state("lastAP", &value);
        }

        let last_mesh = self
            .st
            .last_of_mode(Mode::Mesh, exclude)
            .map(|n| (n.id, n.ssid.clone()));
        let new_id = last_mesh.as_ref().and_then(|(id, _)| *id);
        if new_id != self.st.last_mesh_id {
            self.st.last_mesh_id = new_id;
            let value = last_mesh.map(|(_, s)| s).unwrap_or_default();
            self.publish_state("lastmesh", &value);
        }
    }

    /// Send SAVE_CONFIG once no config-mutating command is queued anymore.
    pub(crate) async fn save_config_maybe(&mut self) {
        const CONFIG_CMDS: [&str; 6] = [
            "SET_NETWORK",
            "ENABLE_NETWORK",
            "DISABLE_NETWORK",
            "SELECT_NETWORK",
            "REMOVE_NETWORK",
            "ADD_NETWORK",
        ];
        let busy = self
            .queue
            .any(|line| CONFIG_CMDS.iter().any(|p| line.starts_with(p)));
        if !busy {
            self.send("SAVE_CONFIG".into()).await;
        }
    }

    /// Publish the empty string to every non-empty retained topic.
    /// The draining step of a clean shutdown.
    pub fn clear_retained(&mut self) {
        self.cache.clear_all(&mut self.sink);
    }

    // ---- event loop --------------------------------------------------

    /// Attach, subscribe and run until a signal arrives or the transport
    /// is lost; then drain retained state and run the self-sync barrier.
    pub async fn run(
        mut self,
        client: AsyncClient,
        mut eventloop: EventLoop,
        qos: QoS,
    ) -> Result<()> {
        self.transport.connect().await?;

        for filter in [
            self.topic("ssid/+"),
            self.topic("ssid/config/+"),
            self.topic("wifi/config/+"),
            self.topic("wifistate/set"),
        ] {
            client.subscribe(filter, qos).await?;
        }

        self.attach().await;

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        loop {
            if self.lost.is_some() {
                break;
            }
            let wait = self.timers.wait_time(Instant::now());
            let ev = {
                let transport = &mut self.transport;
                tokio::select! {
                    chunk = transport.read_chunk() => match chunk {
                        Ok(data) => LoopEvent::Chunk(data),
                        Err(e) => {
                            warn!(error = %e, "supplicant socket lost");
                            self.lost = Some(e.to_string());
                            LoopEvent::Nothing
                        }
                    },
                    event = eventloop.poll() => match event {
                        Ok(Event::Incoming(Packet::Publish(msg))) => {
                            LoopEvent::Inbound(msg.topic.clone(), msg.payload.to_vec())
                        }
                        Ok(_) => LoopEvent::Nothing,
                        // No use publishing anything further.
                        Err(e) => return Err(e.into()),
                    },
                    _ = sigterm.recv() => LoopEvent::Signal,
                    _ = sigint.recv() => LoopEvent::Signal,
                    _ = idle(wait) => LoopEvent::Tick,
                }
            };

            match ev {
                LoopEvent::Chunk(data) => self.handle_datagram(&data).await,
                LoopEvent::Inbound(topic, payload) => {
                    let payload = String::from_utf8_lossy(&payload).into_owned();
                    self.handle_mqtt(&topic, &payload).await;
                }
                LoopEvent::Signal => {
                    info!("signal received, draining");
                    break;
                }
                LoopEvent::Tick => {
                    let now = Instant::now();
                    for key in self.timers.flush(now) {
                        self.handle_timer(key).await;
                    }
                }
                LoopEvent::Nothing => {}
            }
        }

        self.clear_retained();
        self_sync_barrier(&client, &mut eventloop, qos).await?;

        match self.lost.take() {
            Some(reason) => Err(BridgeError::TransportLost(reason)),
            None => Ok(()),
        }
    }
}

async fn idle(wait: Option<Duration>) {
    match wait {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}
