//! Error taxonomy for the driver.
//!
//! Two layers: [`FrameError`] covers wire-level problems found while decoding
//! or encoding a single frame, and [`CBusError`] is the top-level surface
//! covering transport failures, protocol misuse, and connection setup.
//!
//! "No message yet" is not an error anywhere in this crate: the frame
//! recognizer reports it as `Ok(None)` and callers simply poll again.

use std::io;

use thiserror::Error;

/// Wire-level errors raised while encoding or decoding a single frame.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// A frame with no payload where one is required.
    #[error("empty frame")]
    Empty,

    /// A hex-encoded payload with an odd number of digits.
    #[error("odd-length hex payload ({length} digits)")]
    OddHexLength {
        /// Number of hex digits present.
        length: usize,
    },

    /// A byte that is not a hex digit inside a hex-encoded region.
    #[error("invalid hex digit {digit:#04x} at offset {offset}")]
    InvalidHexDigit {
        /// The offending byte.
        digit: u8,
        /// Offset within the hex region.
        offset: usize,
    },

    /// Serial checksum mismatch (`srchk` sessions only).
    #[error("checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch {
        /// Checksum carried by the frame.
        expected: u8,
        /// Checksum computed over the payload.
        actual: u8,
    },

    /// A confirmation frame carrying an unknown code byte.
    #[error("unknown confirmation code {code:#04x}")]
    UnknownConfirmationCode {
        /// The unrecognised code byte.
        code: u8,
    },

    /// A CAL payload starting with an unknown command container.
    #[error("unknown CAL command container {container:#04x}")]
    UnknownCalContainer {
        /// The unrecognised container byte.
        container: u8,
    },

    /// A lighting SAL payload starting with an unknown command byte.
    #[error("unknown SAL command {command:#04x}")]
    UnknownSalCommand {
        /// The unrecognised command byte.
        command: u8,
    },

    /// An extended status reply with an unknown coding byte.
    #[error("unknown status coding {coding:#04x}")]
    UnknownStatusCoding {
        /// The unrecognised coding byte.
        coding: u8,
    },

    /// Level-information entry with an invalid marker byte.
    #[error("invalid level information marker {marker:#04x}")]
    InvalidLevelMarker {
        /// The unrecognised marker byte.
        marker: u8,
    },

    /// Fewer bytes than the container or header requires.
    #[error("truncated frame: need {need} bytes, have {have}")]
    Truncated {
        /// Bytes required.
        need: usize,
        /// Bytes present.
        have: usize,
    },

    /// A frame starting with a byte that matches no known frame shape.
    #[error("unrecognised frame prefix {prefix:#04x}")]
    UnrecognisedPrefix {
        /// The first byte of the frame.
        prefix: u8,
    },
}

/// Connection-setup steps, used to report which step a failed handshake
/// aborted at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetupStep {
    /// The initial reset exchange.
    Reset,
    /// Writing the first monitored-application filter.
    ApplicationFilter1,
    /// Writing the second monitored-application filter.
    ApplicationFilter2,
    /// Writing interface options 3.
    InterfaceOptions3,
    /// Writing the power-up settings copy of interface options 1.
    InterfaceOptions1PowerUp,
    /// Writing interface options 1.
    InterfaceOptions1,
}

impl std::fmt::Display for SetupStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Reset => "reset",
            Self::ApplicationFilter1 => "application filter 1",
            Self::ApplicationFilter2 => "application filter 2",
            Self::InterfaceOptions3 => "interface options 3",
            Self::InterfaceOptions1PowerUp => "interface options 1 power-up settings",
            Self::InterfaceOptions1 => "interface options 1",
        };
        f.write_str(name)
    }
}

/// Top-level error surface of the driver.
#[derive(Debug, Error)]
pub enum CBusError {
    /// An error in the underlying byte channel.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    /// A frame that could not be encoded for sending.
    #[error("malformed frame: {0}")]
    Frame(#[from] FrameError),

    /// An attempt to send a message kind the PCI cannot accept.
    #[error("message type cannot be sent to the PCI")]
    UnsupportedMessage,

    /// No correlated reply arrived within the exchange TTL.
    #[error("request timed out")]
    RequestTimeout,

    /// The caller's cancellation token fired while awaiting a reply.
    #[error("request cancelled")]
    Cancelled,

    /// An operation that needs a running connection engine found none.
    #[error("connection engine is not running")]
    NotRunning,

    /// `connect` called on a connection whose engine is already running.
    #[error("connection engine is already running")]
    AlreadyRunning,

    /// More correlated requests in one batch than there are alpha characters.
    #[error("batch of {requested} requests exceeds the limit of {limit}")]
    BatchTooLarge {
        /// Number of requests submitted.
        requested: usize,
        /// Maximum correlated requests per batch.
        limit: usize,
    },

    /// A handshake step failed; the remaining steps were not attempted.
    #[error("connection setup failed at {step}: {source}")]
    Setup {
        /// The step that failed.
        step: SetupStep,
        /// The underlying failure.
        #[source]
        source: Box<CBusError>,
    },
}

impl CBusError {
    /// Wrap an error as a setup failure at `step`.
    #[must_use]
    pub fn at_setup_step(self, step: SetupStep) -> Self {
        CBusError::Setup {
            step,
            source: Box::new(self),
        }
    }
}
