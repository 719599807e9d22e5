//! AT-modem to MQTT bridge.
//!
//! Talks to a cellular modem over its AT command tty and mirrors the
//! derived state - signal quality, registration, operator, SIM identity -
//! as retained topics under a configurable prefix. Inbound messages on
//! `<prefix>raw/send` / `<prefix>at/set` feed raw AT lines into the
//! command FIFO; `<prefix>ops/scan` starts an operator scan.
//!
//! Protocol plumbing (FIFO, timers, publish cache, transports) comes from
//! `tomqtt-core`; this crate owns the AT dialect: terminator detection,
//! unsolicited result codes, response correlation by command prefix and
//! the modem domain model.

pub mod bridge;
pub mod dispatch;
pub mod modem;

pub use bridge::AtBridge;
