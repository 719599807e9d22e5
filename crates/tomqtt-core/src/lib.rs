//! Shared bridge core for the tomqtt family of control-plane bridges.
//!
//! A tomqtt bridge sits between a serial-like byte stream (a modem's AT
//! interface, the wpa_supplicant control socket) and an MQTT session. The
//! moving parts are the same on both sides, so they live here:
//!
//! - [`transport`] - non-blocking byte I/O on a tty or UNIX datagram socket
//! - [`queue`] - FIFO of in-flight commands with per-command deadlines
//! - [`parser`] - line accumulation and response-body collection
//! - [`timer`] - cooperative timer wheel driving keepalive, timeouts, pollers
//! - [`publish`] - publish-on-change state cache and the shutdown drain
//! - [`mqtt`] - rumqttc session bootstrap and the self-sync barrier
//!
//! Each bridge binary owns one event loop task that multiplexes the
//! transport, the MQTT event loop, a signal stream and the timer wheel.
//! All state is owned by that loop; nothing here needs a lock.

pub mod error;
pub mod mqtt;
pub mod parser;
pub mod publish;
pub mod queue;
pub mod test_util;
pub mod timer;
pub mod transport;

pub use error::{BridgeError, Result};
pub use publish::{MqttSink, StateCache};
pub use transport::Transport;
