//! Retrieval of official firmware releases

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use log::{debug, info};
use thiserror::Error;

use crate::firmware::{FirmwareBinary, FirmwareFamily};

/// The official firmware releases that can be downloaded.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum FirmwareKey {
    /// Official English firmware 3.1.0
    V3_1_0_En,
    /// Official Chinese firmware 3.0.8
    V3_0_8_Ch,
}

impl FirmwareKey {
    pub const ALL: [FirmwareKey; 2] = [FirmwareKey::V3_1_0_En, FirmwareKey::V3_0_8_Ch];

    pub fn as_str(self) -> &'static str {
        match self {
            FirmwareKey::V3_1_0_En => "3.1.0-EN",
            FirmwareKey::V3_0_8_Ch => "3.0.8-CH",
        }
    }

    /// The download location of the release.
    pub fn url(self) -> &'static str {
        match self {
            FirmwareKey::V3_1_0_En => {
                "http://gotaserver.xteink.com/api/download/ESP32C3/V3.1.0/V3.1.0-EN.bin"
            }
            FirmwareKey::V3_0_8_Ch => {
                "http://47.122.74.33:5000/api/download/ESP32C3/V3.0.8/V3.0.8-CH.bin"
            }
        }
    }

    /// The family the downloaded binary must be classified as.
    pub fn expected_family(self) -> FirmwareFamily {
        match self {
            FirmwareKey::V3_1_0_En => FirmwareFamily::OfficialEnglish,
            FirmwareKey::V3_0_8_Ch => FirmwareFamily::OfficialChinese,
        }
    }
}

impl fmt::Display for FirmwareKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
#[error("Unknown firmware {:?} - expected one of 3.1.0-EN, 3.0.8-CH", _0)]
pub struct ParseFirmwareKeyError(String);

impl FromStr for FirmwareKey {
    type Err = ParseFirmwareKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FirmwareKey::ALL
            .iter()
            .copied()
            .find(|key| key.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseFirmwareKeyError(s.to_string()))
    }
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP request failed: {}", _0)]
    Http(#[from] reqwest::Error),
    #[error("Server responded with status {}", _0)]
    Status(reqwest::StatusCode),
    #[error("Server returned an empty firmware image")]
    EmptyBody,
    #[error("Download timed out after {:?}", _0)]
    Timeout(Duration),
}

/// Retrieves firmware releases by key.
#[allow(async_fn_in_trait)]
pub trait FirmwareFetcher {
    async fn fetch(&self, key: FirmwareKey) -> Result<FirmwareBinary, FetchError>;
}

/// Downloads firmware releases over HTTP.
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> HttpFetcher {
        HttpFetcher::default()
    }

    pub fn with_client(client: reqwest::Client) -> HttpFetcher {
        HttpFetcher { client }
    }
}

impl FirmwareFetcher for HttpFetcher {
    async fn fetch(&self, key: FirmwareKey) -> Result<FirmwareBinary, FetchError> {
        let url = key.url();
        debug!("Requesting {} from {}", key, url);

        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(FetchError::Status(response.status()));
        }

        let body = response.bytes().await?;

        if body.is_empty() {
            return Err(FetchError::EmptyBody);
        }

        info!("Downloaded {} ({} bytes)", key, body.len());

        Ok(FirmwareBinary::new(body.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_should_parse_firmware_keys() {
        assert_eq!("3.1.0-EN".parse(), Ok(FirmwareKey::V3_1_0_En));
        assert_eq!("3.0.8-ch".parse(), Ok(FirmwareKey::V3_0_8_Ch));
        assert!("3.0.8-EN".parse::<FirmwareKey>().is_err());
    }

    #[test]
    fn it_should_expect_the_matching_family() {
        assert_eq!(
            FirmwareKey::V3_1_0_En.expected_family(),
            FirmwareFamily::OfficialEnglish
        );
        assert_eq!(
            FirmwareKey::V3_0_8_Ch.expected_family(),
            FirmwareFamily::OfficialChinese
        );
    }

    #[test]
    fn it_should_point_at_release_binaries() {
        for key in FirmwareKey::ALL.iter() {
            assert!(key.url().ends_with(&format!("V{}.bin", key.as_str())));
        }
    }
}
