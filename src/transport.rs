//! The device link used by the flashing workflows
//!
//! Serial framing and the OTA handshake live behind [`Transport`]. The orchestrator treats every
//! call as a suspension point that may fail or hang, and bounds each one with a timeout.

pub mod emulated;

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

pub use emulated::{EmulatedDevice, EmulatedDeviceConfig};

/// A contiguous range of device flash.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct Region {
    pub offset: u32,
    pub length: usize,
}

impl Region {
    pub fn new(offset: u32, length: usize) -> Region {
        Region { offset, length }
    }

    /// The first offset past the end of the region.
    pub fn end(&self) -> usize {
        self.offset as usize + self.length
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}..{:#010x}", self.offset, self.end())
    }
}

/// The device's acknowledgement of a write.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Ack {
    /// Number of bytes the device accepted
    pub written: usize,
}

/// What the device reports when a link is established.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DeviceInfo {
    /// Human readable description of the device
    pub name: String,
    /// Size of the device's flash in bytes
    pub flash_size: usize,
    /// The application partition OTA updates are written to
    pub ota_region: Region,
}

/// Identifies the transport call that failed.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TransportOp {
    Connect,
    Read,
    Write,
    Erase,
    Activate,
    Abort,
    Disconnect,
}

impl fmt::Display for TransportOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportOp::Connect => "connect",
            TransportOp::Read => "read",
            TransportOp::Write => "write",
            TransportOp::Erase => "erase",
            TransportOp::Activate => "activate",
            TransportOp::Abort => "abort",
            TransportOp::Disconnect => "disconnect",
        };

        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("No device connected")]
    NoDevice,
    #[error("The device link is not open")]
    NotConnected,
    #[error("Device {} timed out after {:?}", _0, _1)]
    Timeout(TransportOp, Duration),
    #[error(
        "Short write at {:#010x} - device acknowledged {} of {} bytes",
        offset,
        acknowledged,
        expected
    )]
    ShortWrite {
        offset: u32,
        acknowledged: usize,
        expected: usize,
    },
    #[error("Region {} is outside of the {} byte flash", _0, _1)]
    OutOfRange(Region, usize),
    #[error("Verification failed at {:#010x}", _0)]
    VerifyMismatch(u32),
    #[error("Device {} failed: {}", _0, _1)]
    Failed(TransportOp, String),
    #[error("I/O error: {}", _0)]
    IoError(#[from] io::Error),
}

/// A link to the reader's flash.
///
/// Implementations are driven by a single workflow at a time and never concurrently.
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// Opens the link and returns what the device reports about itself.
    ///
    /// Fails with [`TransportError::NoDevice`] if there is no device to talk to.
    async fn connect(&mut self) -> Result<DeviceInfo, TransportError>;

    /// Reads `length` bytes of flash starting at `offset`.
    async fn read(&mut self, offset: u32, length: usize) -> Result<Vec<u8>, TransportError>;

    /// Writes `data` to flash at `offset`.
    async fn write(&mut self, offset: u32, data: &[u8]) -> Result<Ack, TransportError>;

    /// Erases `region`.
    async fn erase(&mut self, region: Region) -> Result<(), TransportError>;

    /// Makes the image written to `region` the one the device boots, and waits for the device to
    /// confirm it.
    async fn activate(&mut self, region: Region) -> Result<(), TransportError>;

    /// Aborts the operation in progress.
    ///
    /// Returns `true` if the device confirmed a clean abort. Links that cannot abort report
    /// `false`.
    async fn abort(&mut self) -> Result<bool, TransportError> {
        Ok(false)
    }

    async fn disconnect(&mut self) -> Result<(), TransportError>;
}
