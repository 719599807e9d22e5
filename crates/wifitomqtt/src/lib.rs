//! wpa_supplicant to MQTT bridge.
//!
//! Attaches to the supplicant control socket of one interface and mirrors
//! its state as retained topics under `net/<iface>/`: connection state,
//! current BSS, scan results, configured networks. Inbound messages under
//! `net/<iface>/ssid/...` and friends turn into supplicant commands.
//!
//! The heavy lifting (command FIFO, timer wheel, publish-on-change cache,
//! transports) lives in `tomqtt-core`; this crate owns the supplicant
//! dialect: record classification, URC handlers, response correlation and
//! the network/BSS domain model.

pub mod bridge;
pub mod dispatch;
pub mod ingress;
pub mod psk;
pub mod station;

pub use bridge::WifiBridge;
