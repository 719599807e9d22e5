//! Transport implementations for the control-plane side of a bridge.
//!
//! Two variants exist behind one trait:
//!
//! - [`TtyTransport`] - a modem tty in raw mode, written as `"<line>\r"`,
//!   read as an unframed byte stream (the line parser does the framing)
//! - [`UnixDgramTransport`] - the wpa_supplicant control socket, where one
//!   datagram is one logical record
//!
//! Writes are non-blocking. A write that stalls counts against a
//! consecutive-block budget; after [`MAX_CONSECUTIVE_BLOCKS`] stalled
//! attempts the transport is reported lost. Any successful write resets
//! the budget.

use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixDatagram as StdUnixDatagram};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixDatagram;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, trace, warn};

use crate::error::{BridgeError, Result};

/// Read chunk size for both transports.
const READ_BUFFER_SIZE: usize = 4096;

/// Consecutive stalled writes tolerated before the transport is lost.
pub const MAX_CONSECUTIVE_BLOCKS: u32 = 10;

/// How long a single write may stall before it counts as blocked.
const WRITE_STALL: Duration = Duration::from_millis(250);

/// Byte I/O on the device side of a bridge.
#[async_trait]
pub trait Transport: Send {
    /// Open the device or socket.
    async fn connect(&mut self) -> Result<()>;

    /// Read the next chunk of bytes.
    ///
    /// Returns `Err(Disconnected)` on end-of-file. The future stays
    /// pending while no data is available.
    async fn read_chunk(&mut self) -> Result<Bytes>;

    /// Write one command line, including any protocol terminator.
    async fn write_line(&mut self, line: &str) -> Result<()>;

    /// Check if currently connected.
    fn is_connected(&self) -> bool;

    /// Transport name for logging.
    fn name(&self) -> &str;
}

/// Tracks consecutive stalled writes; shared by both transports.
#[derive(Debug, Default)]
struct BlockBudget {
    consecutive: u32,
}

impl BlockBudget {
    fn blocked(&mut self) -> BridgeError {
        self.consecutive += 1;
        if self.consecutive >= MAX_CONSECUTIVE_BLOCKS {
            BridgeError::TransportLost(format!(
                "write blocked {} consecutive times",
                self.consecutive
            ))
        } else {
            BridgeError::WriteBlocked {
                consecutive: self.consecutive,
            }
        }
    }

    fn reset(&mut self) {
        self.consecutive = 0;
    }
}

/// Serial tty transport for the AT bridge.
///
/// The serialport stack opens the device non-blocking with all input and
/// output processing disabled (raw mode); stale buffers are flushed on
/// connect so the first exchange starts clean.
pub struct TtyTransport {
    path: PathBuf,
    baud_rate: u32,
    stream: Option<SerialStream>,
    budget: BlockBudget,
    name: String,
}

impl TtyTransport {
    /// Create a transport for the given tty device.
    pub fn new(path: impl AsRef<Path>, baud_rate: u32) -> Self {
        let path = path.as_ref().to_path_buf();
        let name = format!("tty:{}", path.display());
        Self {
            path,
            baud_rate,
            stream: None,
            budget: BlockBudget::default(),
            name,
        }
    }

    /// Device path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Transport for TtyTransport {
    async fn connect(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        info!(path = %self.path.display(), baud = self.baud_rate, "opening tty");
        let stream = tokio_serial::new(self.path.to_string_lossy(), self.baud_rate)
            .open_native_async()
            .map_err(|e| BridgeError::OpenFailed {
                path: self.path.display().to_string(),
                reason: e.to_string(),
            })?;

        // Flush whatever a previous user left in the driver queues.
        use tokio_serial::{ClearBuffer, SerialPort};
        if let Err(e) = SerialPort::clear(&stream, ClearBuffer::All) {
            warn!(error = %e, "could not flush tty buffers");
        }

        self.stream = Some(stream);
        self.budget.reset();
        Ok(())
    }

    async fn read_chunk(&mut self) -> Result<Bytes> {
        let stream = self.stream.as_mut().ok_or(BridgeError::Disconnected)?;
        let mut buf = [0u8; READ_BUFFER_SIZE];

        match stream.read(&mut buf).await {
            Ok(0) => {
                self.stream = None;
                Err(BridgeError::Disconnected)
            }
            Ok(n) => {
                trace!(bytes = n, "tty read");
                Ok(Bytes::copy_from_slice(&buf[..n]))
            }
            Err(e) => {
                self.stream = None;
                Err(BridgeError::Read(e.to_string()))
            }
        }
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(BridgeError::Disconnected)?;

        let mut framed = Vec::with_capacity(line.len() + 1);
        framed.extend_from_slice(line.as_bytes());
        framed.push(b'\r');

        debug!(line, "tty write");
        match tokio::time::timeout(WRITE_STALL, stream.write_all(&framed)).await {
            Ok(Ok(())) => {
                self.budget.reset();
                Ok(())
            }
            Ok(Err(e)) => {
                self.stream = None;
                Err(BridgeError::Write(e.to_string()))
            }
            Err(_elapsed) => Err(self.budget.blocked()),
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// UNIX datagram transport for the supplicant bridge.
///
/// Connects to `/var/run/wpa_supplicant/<iface>` and binds an abstract
/// address `wpa-mqtt-<iface>-<pid>` so both command replies and
/// unsolicited events come back to us.
pub struct UnixDgramTransport {
    ctrl_path: PathBuf,
    iface: String,
    sock: Option<UnixDatagram>,
    budget: BlockBudget,
    name: String,
}

impl UnixDgramTransport {
    /// Create a transport for the supplicant control socket of `iface`.
    pub fn new(iface: impl Into<String>) -> Self {
        let iface = iface.into();
        Self {
            ctrl_path: PathBuf::from(format!("/var/run/wpa_supplicant/{iface}")),
            name: format!("wpa:{iface}"),
            iface,
            sock: None,
            budget: BlockBudget::default(),
        }
    }

    /// Override the control socket path (for non-default supplicant setups).
    pub fn with_ctrl_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ctrl_path = path.into();
        self
    }
}

#[async_trait]
impl Transport for UnixDgramTransport {
    async fn connect(&mut self) -> Result<()> {
        if self.sock.is_some() {
            return Ok(());
        }

        let local = format!("wpa-mqtt-{}-{}", self.iface, std::process::id());
        let addr = SocketAddr::from_abstract_name(local.as_bytes())?;
        let sock = StdUnixDatagram::bind_addr(&addr).map_err(|e| BridgeError::OpenFailed {
            path: format!("@{local}"),
            reason: e.to_string(),
        })?;
        sock.connect(&self.ctrl_path)
            .map_err(|e| BridgeError::OpenFailed {
                path: self.ctrl_path.display().to_string(),
                reason: e.to_string(),
            })?;
        sock.set_nonblocking(true)?;

        info!(path = %self.ctrl_path.display(), local, "attached to supplicant socket");
        self.sock = Some(UnixDatagram::from_std(sock)?);
        self.budget.reset();
        Ok(())
    }

    async fn read_chunk(&mut self) -> Result<Bytes> {
        let sock = self.sock.as_mut().ok_or(BridgeError::Disconnected)?;
        let mut buf = [0u8; READ_BUFFER_SIZE];

        match sock.recv(&mut buf).await {
            Ok(n) => {
                trace!(bytes = n, "wpa recv");
                Ok(Bytes::copy_from_slice(&buf[..n]))
            }
            Err(e) => {
                self.sock = None;
                Err(BridgeError::Read(e.to_string()))
            }
        }
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        let sock = self.sock.as_mut().ok_or(BridgeError::Disconnected)?;

        debug!(line, "wpa send");
        match sock.try_send(line.as_bytes()) {
            Ok(n) if n == line.len() => {
                self.budget.reset();
                Ok(())
            }
            Ok(n) => Err(BridgeError::ShortWrite {
                wrote: n,
                len: line.len(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(self.budget.blocked()),
            Err(e) => {
                self.sock = None;
                Err(BridgeError::Write(e.to_string()))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.sock.is_some()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_budget_trips_after_limit() {
        let mut budget = BlockBudget::default();
        for n in 1..MAX_CONSECUTIVE_BLOCKS {
            match budget.blocked() {
                BridgeError::WriteBlocked { consecutive } => assert_eq!(consecutive, n),
                other => panic!("unexpected error {other}"),
            }
        }
        assert!(matches!(budget.blocked(), BridgeError::TransportLost(_)));
    }

    #[test]
    fn block_budget_resets_on_success() {
        let mut budget = BlockBudget::default();
        let _ = budget.blocked();
        let _ = budget.blocked();
        budget.reset();
        assert!(matches!(
            budget.blocked(),
            BridgeError::WriteBlocked { consecutive: 1 }
        ));
    }

    #[test]
    fn transport_names() {
        assert_eq!(TtyTransport::new("/dev/ttyUSB0", 115200).name(), "tty:/dev/ttyUSB0");
        assert_eq!(UnixDgramTransport::new("wlan0").name(), "wpa:wlan0");
    }
}
