//! Firmware classification

pub mod image;
mod signature;
mod version;

use std::fmt;
use std::ops::Deref;

use log::debug;
use serde::Serialize;
use sha2::{Digest, Sha256};

pub use signature::{classify, contains_signature, SIGNATURES};
pub use version::{extract_version, UNKNOWN_VERSION};

/// An immutable firmware image held in memory.
///
/// The binary is owned by whoever acquired it (file selection or network retrieval) and handed to
/// the classifier and the orchestrator by reference.
#[derive(PartialEq, Eq)]
pub struct FirmwareBinary {
    data: Vec<u8>,
}

impl FirmwareBinary {
    pub fn new(data: Vec<u8>) -> FirmwareBinary {
        FirmwareBinary { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consumes `self` and returns the inner bytes.
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Returns the lowercase hex SHA-256 digest of the binary.
    pub fn sha256(&self) -> String {
        format!("{:x}", Sha256::digest(&self.data))
    }
}

impl From<Vec<u8>> for FirmwareBinary {
    fn from(data: Vec<u8>) -> FirmwareBinary {
        FirmwareBinary::new(data)
    }
}

impl Deref for FirmwareBinary {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl AsRef<[u8]> for FirmwareBinary {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for FirmwareBinary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirmwareBinary")
            .field("len", &self.data.len())
            .finish()
    }
}

/// The known firmware families.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize)]
pub enum FirmwareFamily {
    #[serde(rename = "official-english")]
    OfficialEnglish,
    #[serde(rename = "official-chinese")]
    OfficialChinese,
    #[serde(rename = "crosspoint")]
    CrossPoint,
    #[serde(rename = "unknown")]
    Unknown,
}

impl FirmwareFamily {
    /// The machine-readable name of the family.
    pub fn as_str(self) -> &'static str {
        match self {
            FirmwareFamily::OfficialEnglish => "official-english",
            FirmwareFamily::OfficialChinese => "official-chinese",
            FirmwareFamily::CrossPoint => "crosspoint",
            FirmwareFamily::Unknown => "unknown",
        }
    }

    /// The label shown to users.
    pub fn display_name(self) -> &'static str {
        match self {
            FirmwareFamily::OfficialEnglish => "Official English",
            FirmwareFamily::OfficialChinese => "Official Chinese",
            FirmwareFamily::CrossPoint => "CrossPoint Community Reader",
            FirmwareFamily::Unknown => "Custom/Unknown Firmware",
        }
    }
}

impl fmt::Display for FirmwareFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// The classification verdict for a firmware binary.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct FirmwareInfo {
    #[serde(rename = "type")]
    pub family: FirmwareFamily,
    /// A `MAJOR.MINOR.PATCH` triple (possibly `V`-prefixed), or `"unknown"`
    pub version: String,
    #[serde(rename = "displayName")]
    pub display_name: &'static str,
}

/// Identifies the firmware family of `data` and extracts its version.
///
/// The family and the version are determined independently: a recognized family may still carry
/// an `"unknown"` version, and a version may be found in an unrecognized binary.
pub fn identify_firmware(data: &[u8]) -> FirmwareInfo {
    let family = classify(data);
    let version = extract_version(data);

    debug!(
        "Identified {} byte binary as {} (version {})",
        data.len(),
        family.as_str(),
        version
    );

    FirmwareInfo {
        family,
        version,
        display_name: family.display_name(),
    }
}

/// Returns true if the binary belonged to one of the known families.
///
/// The version is not taken into account.
pub fn is_identification_successful(info: &FirmwareInfo) -> bool {
    info.family != FirmwareFamily::Unknown
}
