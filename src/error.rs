use std::fmt;

use thiserror::Error;

use crate::fetch::FetchError;
use crate::firmware::FirmwareFamily;
use crate::transport::TransportError;

/// Errors that can end a flashing workflow.
#[derive(Debug, Error)]
pub enum Error {
    #[error("No device connected")]
    NoDeviceConnected,
    #[error("Transport failure: {}", _0)]
    Transport(TransportError),
    #[error("No firmware file selected")]
    NoFileSelected,
    #[error("Could not fetch firmware: {}", _0)]
    NetworkFetch(#[from] FetchError),
    #[error("Firmware mismatch - expected {} but the binary is {}", expected, found)]
    FirmwareMismatch {
        expected: FirmwareFamily,
        found: FirmwareFamily,
    },
    #[error("Cancelled by user")]
    CancelledByUser,
    #[error("Firmware of {} bytes does not fit in the {} byte target region", size, capacity)]
    ImageTooLarge { size: usize, capacity: usize },
    #[error("Another flash operation is already running")]
    Busy,
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Error {
        match err {
            TransportError::NoDevice => Error::NoDeviceConnected,
            err => Error::Transport(err),
        }
    }
}

/// The kind of an [`Error`], without its payload.
///
/// Step records store this together with the rendered message so that they can be cloned and
/// published freely.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    NoDeviceConnected,
    TransportFailure,
    NoFileSelected,
    NetworkFetchFailure,
    FirmwareMismatch,
    CancelledByUser,
    Busy,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NoDeviceConnected => ErrorKind::NoDeviceConnected,
            // An image that does not fit is reported by the step that tried to put it on the device
            Error::Transport(_) | Error::ImageTooLarge { .. } => ErrorKind::TransportFailure,
            Error::NoFileSelected => ErrorKind::NoFileSelected,
            Error::NetworkFetch(_) => ErrorKind::NetworkFetchFailure,
            Error::FirmwareMismatch { .. } => ErrorKind::FirmwareMismatch,
            Error::CancelledByUser => ErrorKind::CancelledByUser,
            Error::Busy => ErrorKind::Busy,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NoDeviceConnected => "no device connected",
            ErrorKind::TransportFailure => "transport failure",
            ErrorKind::NoFileSelected => "no file selected",
            ErrorKind::NetworkFetchFailure => "network fetch failure",
            ErrorKind::FirmwareMismatch => "firmware mismatch",
            ErrorKind::CancelledByUser => "cancelled by user",
            ErrorKind::Busy => "busy",
        };

        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportOp;
    use std::time::Duration;

    #[test]
    fn it_should_map_missing_device_to_its_own_kind() {
        let err = Error::from(TransportError::NoDevice);

        assert!(matches!(err, Error::NoDeviceConnected));
        assert_eq!(err.kind(), ErrorKind::NoDeviceConnected);
    }

    #[test]
    fn it_should_classify_timeouts_as_transport_failures() {
        let err = Error::from(TransportError::Timeout(
            TransportOp::Write,
            Duration::from_secs(1),
        ));

        assert_eq!(err.kind(), ErrorKind::TransportFailure);
        assert!(err.to_string().contains("timed out"));
    }
}
