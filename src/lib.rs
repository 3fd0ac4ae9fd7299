//! Firmware identification and flashing for Xteink e-ink readers.
//!
//! The crate is split into two halves:
//!
//! * [`firmware`] classifies an arbitrary firmware binary into one of the known firmware families
//!   and extracts its embedded version string. It is synchronous and never fails.
//! * [`flash`] drives the flashing workflows (full flash save/write over a direct link, and fast
//!   OTA flashing of official firmware) as an explicit state machine that publishes the status of
//!   every step while it runs.
//!
//! Device and network I/O happen behind the [`Transport`] and [`FirmwareFetcher`] traits.

pub mod cancel;
mod error;
pub mod fetch;
pub mod firmware;
pub mod flash;
pub mod transport;

pub use cancel::CancelToken;
pub use error::{Error, ErrorKind};
pub use fetch::{FetchError, FirmwareFetcher, FirmwareKey, HttpFetcher};
pub use firmware::{
    identify_firmware, is_identification_successful, FirmwareBinary, FirmwareFamily, FirmwareInfo,
};
pub use flash::{ErasePolicy, FlashConfig, Orchestrator};
pub use transport::{Transport, TransportError};
