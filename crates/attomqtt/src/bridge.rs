//! The AT bridge: command plumbing, pollers, event loop.

use std::time::{Duration, Instant};

use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, Packet, QoS};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use tomqtt_core::error::{BridgeError, Result};
use tomqtt_core::mqtt::self_sync_barrier;
use tomqtt_core::parser::{LineBuffer, ResponseAccumulator};
use tomqtt_core::publish::{MqttSink, StateCache};
use tomqtt_core::queue::{CommandQueue, MAX_CONSECUTIVE_TIMEOUTS};
use tomqtt_core::timer::TimerWheel;
use tomqtt_core::transport::Transport;

use crate::modem::{ModemState, Quirks};

/// Plain commands answer within this, or count as timed out.
pub const CMD_TIMEOUT: Duration = Duration::from_secs(5);

/// `AT+COPS` set/query deadline.
pub const COPS_TIMEOUT: Duration = Duration::from_secs(60);

/// `AT+COPS=?` full operator scan deadline.
pub const COPS_SCAN_TIMEOUT: Duration = Duration::from_secs(180);

/// Idle gap after the last write before the `AT` keepalive goes out.
pub const KEEPALIVE: Duration = Duration::from_secs(5);

/// Delay before reattempting a blocked write.
pub const WRITE_RETRY: Duration = Duration::from_secs(1);

/// Periodic state pollers, selectable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poller {
    /// Signal quality
    Csq,
    /// Network registration
    Creg,
    /// GPRS registration
    Cgreg,
    /// Current operator
    Cops,
    /// Network technology (vendor `*CNTI`)
    Cnti,
}

impl Poller {
    /// The command this poller enqueues.
    pub fn command(self) -> &'static str {
        match self {
            Poller::Csq => "AT+CSQ",
            Poller::Creg => "AT+CREG?",
            Poller::Cgreg => "AT+CGREG?",
            Poller::Cops => "AT+COPS?",
            Poller::Cnti => "AT*CNTI=0",
        }
    }
}

/// Timer-wheel keys of this bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtTimer {
    /// The in-flight command's response deadline
    CmdTimeout,
    /// Keepalive probe
    Keepalive,
    /// Retry of a blocked transport write
    WriteRetry,
    /// Periodic poller tick
    Poll(Poller),
}

/// Runtime options: enabled pollers with periods, forced quirks.
#[derive(Debug, Clone, Default)]
pub struct AtOptions {
    /// Enabled pollers and their periods
    pub pollers: Vec<(Poller, Duration)>,
    /// Quirks forced on regardless of brand/model detection
    pub forced: Quirks,
}

/// The AT-modem-to-MQTT bridge core.
pub struct AtBridge<S: MqttSink> {
    prefix: String,
    /// Publish seam; exposed so tests can inspect a recording sink
    pub sink: S,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) queue: CommandQueue,
    pub(crate) timers: TimerWheel<AtTimer>,
    pub(crate) cache: StateCache,
    pub(crate) linebuf: LineBuffer,
    pub(crate) body: ResponseAccumulator,
    pub(crate) modem: ModemState,
    options: AtOptions,
    lost: Option<String>,
}

enum LoopEvent {
    Chunk(Bytes),
    Inbound(String, Vec<u8>),
    Signal,
    Tick,
    Nothing,
}

impl<S: MqttSink> AtBridge<S> {
    /// Build a bridge publishing under `prefix` (a trailing `/` is added
    /// when missing) over the given transport.
    pub fn new(prefix: impl Into<String>, options: AtOptions, sink: S, transport: Box<dyn Transport>) -> Self {
        let mut prefix = prefix.into();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        Self {
            prefix,
            sink,
            transport,
            queue: CommandQueue::new(),
            timers: TimerWheel::new(),
            cache: StateCache::new(),
            linebuf: LineBuffer::new(),
            body: ResponseAccumulator::new(),
            modem: ModemState::new(options.forced),
            options,
            lost: None,
        }
    }

    /// Topic prefix, trailing slash included.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Modem domain model, for tests.
    pub fn modem(&self) -> &ModemState {
        &self.modem
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
        format!("{}{}", self.prefix, suffix)
    }

    /// Retained, publish-on-change.
    pub(crate) fn publish_state(&mut self, suffix: &str, value: &str) {
        let topic = self.topic(suffix);
        self.cache.publish_if_changed(&mut self.sink, &topic, value);
    }

    /// Non-retained raw passthrough on `raw/at`.
    pub(crate) fn publish_raw(&mut self, value: &str) {
        let topic = self.topic("raw/at");
        self.sink.publish(&topic, value, false);
    }

    /// Non-retained diagnostic on `fail`.
    pub(crate) fn publish_fail(&mut self, value: &str) {
        let topic = self.topic("fail");
        self.sink.publish(&topic, value, false);
    }

    /// Non-retained diagnostic on `warn`.
    pub(crate) fn publish_warn(&mut self, value: &str) {
        let topic = self.topic("warn");
        self.sink.publish(&topic, value, false);
    }

    // ---- command plumbing --------------------------------------------

    /// Deadline for a command line; operator scans run much longer than
    /// anything else.
    fn timeout_for(line: &str) -> Duration {
        let uc = line.to_ascii_uppercase();
        if uc.starts_with("AT+COPS=?") {
            COPS_SCAN_TIMEOUT
        } else if uc.starts_with("AT+COPS") {
            COPS_TIMEOUT
        } else {
            CMD_TIMEOUT
        }
    }

    /// Queue a command; written immediately when it became head.
    pub(crate) async fn send(&mut self, line: String) {
        let timeout = Self::timeout_for(&line);
        if self.queue.push(line, timeout) {
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
            self.timers.remove(&AtTimer::CmdTimeout);
            return;
        };
        let line = head.line.clone();
        let deadline = head.timeout;

        match self.transport.write_line(&line).await {
            Ok(()) => {
                self.queue.mark_in_flight();
                let now = Instant::now();
                self.timers.add(now, deadline, AtTimer::CmdTimeout);
                self.timers.add(now, KEEPALIVE, AtTimer::Keepalive);
            }
            Err(e) if !e.is_fatal() => {
                warn!(line, error = %e, "write blocked, retrying");
                self.timers
                    .add(Instant::now(), WRITE_RETRY, AtTimer::WriteRetry);
            }
            Err(e) => {
                self.publish_fail(&format!("send '{line}': {e}"));
                warn!(line, error = %e, "transport write failed");
                self.lost = Some(e.to_string());
            }
        }
    }

    /// Timer-wheel callback.
    pub async fn handle_timer(&mut self, key: AtTimer) {
        match key {
            AtTimer::CmdTimeout => {
                self.publish_fail("timeout");
                self.body.take();
                if let Some((cmd, count)) = self.queue.timeout_head() {
                    warn!(cmd = %cmd.line, count, "AT command timeout");
                    if count >= MAX_CONSECUTIVE_TIMEOUTS {
                        self.lost =
                            Some(format!("last {count} commands got timeout, modem lost"));
                        return;
                    }
                }
                self.write_head().await;
            }
            AtTimer::Keepalive => {
                self.send_unique("AT".into()).await;
            }
            AtTimer::WriteRetry => self.write_head().await,
            AtTimer::Poll(poller) => {
                self.send_unique(poller.command().into()).await;
                if let Some((_, period)) = self
                    .options
                    .pollers
                    .iter()
                    .find(|(p, _)| *p == poller)
                    .copied()
                {
                    self.timers
                        .add(Instant::now(), period, AtTimer::Poll(poller));
                }
            }
        }
    }

    /// Enable command echo, read the modem identity, kick the pollers.
    pub async fn start(&mut self) {
        self.send("ATE1".into()).await;
        for cmd in ["AT+CGMI", "AT+CGMM", "AT+CGMR", "AT+CGSN", "AT+CPIN?"] {
            self.send(cmd.into()).await;
        }
        let now = Instant::now();
        for (poller, period) in self.options.pollers.clone() {
            self.send_unique(poller.command().into()).await;
            self.timers.add(now, period, AtTimer::Poll(poller));
        }
    }

    // ---- MQTT ingress ------------------------------------------------

    /// Route one inbound message below the prefix.
    pub async fn handle_mqtt(&mut self, topic: &str, payload: &str) {
        let Some(suffix) = topic.strip_prefix(&self.prefix) else {
            return;
        };
        match suffix {
            "raw/send" | "at/set" => {
                let line = payload.trim_end_matches(['\r', '\n']);
                if !line.is_empty() {
                    self.send(line.to_string()).await;
                }
            }
            "ops/scan" => {
                if self.modem.quirks.detached_scan {
                    // this modem only scans while detached
                    self.send("AT+COPS=2".into()).await;
                }
                self.send("AT+COPS=?".into()).await;
            }
            _ => {}
        }
    }

    /// Publish the empty string to every non-empty retained topic.
    /// The draining step of a clean shutdown.
    pub fn clear_retained(&mut self) {
        self.cache.clear_all(&mut self.sink);
    }

    // ---- event loop --------------------------------------------------

    /// Open the tty, subscribe and run until a signal arrives or the
    /// transport is lost; then drain retained state and run the
    /// self-sync barrier.
    pub async fn run(
        mut self,
        client: AsyncClient,
        mut eventloop: EventLoop,
        qos: QoS,
    ) -> Result<()> {
        self.transport.connect().await?;

        for suffix in ["raw/send", "at/set", "ops/scan"] {
            client.subscribe(self.topic(suffix), qos).await?;
        }

        self.start().await;

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
                            warn!(error = %e, "modem tty lost");
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
                LoopEvent::Chunk(data) => self.handle_chunk(&data).await?,
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
