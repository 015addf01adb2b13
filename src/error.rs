use std::time::Duration;

/// Errors returned by the protocol codec, the transports and the client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No byte arrived before the transport deadline. The exchange may be retried.
    #[error("No data received within {0:?}")]
    Timeout(Duration),
    /// A frame marker byte (start, or end in strict mode) had an unexpected value.
    #[error("Invalid frame marker - expected={expected:#04X} received={received:#04X}")]
    Framing { expected: u8, received: u8 },
    /// The device answered a different command than the one requested.
    #[error("Command mismatch - expected={expected:#04X} received={received:#04X}")]
    CommandMismatch { expected: u8, received: u8 },
    /// The device reported a non-zero status for the command.
    #[error("Device rejected command with status {0:#04X}")]
    DeviceStatus(u8),
    /// The transmitted checksum does not match the one calculated over the frame.
    #[error("Checksum mismatch - calculated={calculated:#06X} received={received:#06X}")]
    ChecksumMismatch { calculated: u16, received: u16 },
    /// The payload does not have the structure its decoder requires.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
    /// A request payload longer than a single length byte can describe.
    #[error("Request payload of {0} bytes exceeds 255 bytes")]
    PayloadTooLarge(usize),
    /// A buffered response frame ended before its declared length.
    #[error("Incomplete frame - required={expected} received={received}")]
    IncompleteFrame { expected: usize, received: usize },
    /// The producer side of a byte queue has gone away.
    #[error("Transport disconnected")]
    Disconnected,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "tokio-serial-async")]
    #[error("Tokio serial error: {0}")]
    TokioSerial(#[from] tokio_serial::Error),
    #[cfg(feature = "ble")]
    #[error("Bluetooth error: {0}")]
    Ble(#[from] btleplug::Error),
    #[cfg(feature = "ble")]
    #[error("No Bluetooth adapter found")]
    NoAdapter,
    #[cfg(feature = "ble")]
    #[error("Device '{0}' not found")]
    DeviceNotFound(String),
    #[cfg(feature = "ble")]
    #[error("Characteristic {0} not found")]
    MissingCharacteristic(String),
}

impl Error {
    /// `true` when the error is a transport timeout, which callers may retry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// `true` when only the current exchange failed and the link stays usable.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::Framing { .. }
                | Error::CommandMismatch { .. }
                | Error::DeviceStatus(_)
                | Error::ChecksumMismatch { .. }
                | Error::MalformedPayload(_)
                | Error::IncompleteFrame { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
