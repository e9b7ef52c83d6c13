//! The C-Bus wire model: a closed set of message kinds plus the hex frame
//! codec that maps them to and from the PCI's ASCII framing.
//!
//! Requests travel as `\`-prefixed (or `@`-prefixed for direct command
//! access) upper-case hex terminated by CR; replies are hex terminated by
//! CR LF, optionally preceded by an alpha confirmation pair. Decoding is
//! biased by the current [`RequestContext`] and the session
//! [`CBusOptions`], because several reply shapes are only distinguishable
//! by knowing what was just asked.

use crate::{context::RequestContext, error::FrameError, options::CBusOptions};

pub mod cal;
pub mod reply;
pub mod request;
pub mod sal;

pub use cal::{
    Attribute,
    CalData,
    GavState,
    LevelInformation,
    Parameter,
    StatusByte,
    StatusCoding,
    StatusPayload,
};
pub use reply::{
    CalReply,
    ConfirmationCode,
    EncodedReply,
    MonitoredSal,
    NetworkRoute,
    Reply,
    ReplyAddress,
};
pub use request::{CBusCommand, MultiPointPayload, Request, StatusRequest};
pub use sal::{LightingData, RampRate, SalData};

/// Carriage return, the request terminator.
pub const CR: u8 = 0x0D;
/// Line feed, the unambiguous end-of-response marker.
pub const LF: u8 = 0x0A;
/// In-stream server error marker.
pub const ERROR_MARKER: u8 = b'!';
/// Prefix of a correlated request frame.
pub const REQUEST_PREFIX: u8 = b'\\';
/// Prefix of a direct command access frame.
pub const DIRECT_PREFIX: u8 = b'@';
/// Reset character; a reset frame repeats it, e.g. `~~~\r`.
pub const RESET_CHAR: u8 = b'~';
/// Power-up notification prefix.
pub const POWER_UP: u8 = b'+';

/// Address of a directly reachable unit on the local network.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnitAddress(pub u8);

impl std::fmt::Display for UnitAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "u{}", self.0)
    }
}

/// Address of a network bridge on a multi-hop route.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BridgeAddress(pub u8);

impl std::fmt::Display for BridgeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "b{}", self.0)
    }
}

/// C-Bus application identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ApplicationId(pub u8);

impl ApplicationId {
    /// Temperature broadcast application.
    pub const TEMPERATURE_BROADCAST: ApplicationId = ApplicationId(0x19);
    /// Default lighting application.
    pub const LIGHTING: ApplicationId = ApplicationId(0x38);
    /// Air conditioning application.
    pub const AIR_CONDITIONING: ApplicationId = ApplicationId(0xAC);
    /// Trigger control application.
    pub const TRIGGER_CONTROL: ApplicationId = ApplicationId(0xCA);
    /// Enable control application.
    pub const ENABLE_CONTROL: ApplicationId = ApplicationId(0xCB);
    /// Security application.
    pub const SECURITY: ApplicationId = ApplicationId(0xD0);
    /// Metering application.
    pub const METERING: ApplicationId = ApplicationId(0xD1);
    /// Clock and timekeeping application.
    pub const CLOCK_AND_TIMEKEEPING: ApplicationId = ApplicationId(0xDF);
    /// Telephony status and control application.
    pub const TELEPHONY: ApplicationId = ApplicationId(0xE0);
    /// Measurement application.
    pub const MEASUREMENT: ApplicationId = ApplicationId(0xE4);

    /// Lighting occupies a whole block of application ids, not just the
    /// default `0x38`.
    #[must_use]
    pub fn is_lighting(self) -> bool { (0x30..=0x5F).contains(&self.0) }

    /// Human-readable application name used in event addresses.
    #[must_use]
    pub fn name(self) -> String {
        if self.is_lighting() {
            return "lighting".to_owned();
        }
        match self {
            Self::TEMPERATURE_BROADCAST => "temperatureBroadcast".to_owned(),
            Self::AIR_CONDITIONING => "airConditioning".to_owned(),
            Self::TRIGGER_CONTROL => "triggerControl".to_owned(),
            Self::ENABLE_CONTROL => "enableControl".to_owned(),
            Self::SECURITY => "security".to_owned(),
            Self::METERING => "metering".to_owned(),
            Self::CLOCK_AND_TIMEKEEPING => "clockAndTimekeeping".to_owned(),
            Self::TELEPHONY => "telephony".to_owned(),
            Self::MEASUREMENT => "measurement".to_owned(),
            ApplicationId(raw) => format!("app{raw:#04x}"),
        }
    }
}

impl std::fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}

/// How the recognizer classified the frame being decoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameDirection {
    /// CR LF terminated: a reply from the PCI.
    Response,
    /// CR terminated: a PCI-initiated request, or the echo of one of ours.
    Request,
}

/// A complete protocol message, either direction.
#[derive(Clone, Debug, PartialEq)]
pub enum CBusMessage {
    /// A request travelling to the PCI (or its echo coming back).
    ToServer(Request),
    /// A reply travelling from the PCI.
    ToClient(Reply),
}

impl CBusMessage {
    /// Decode a sanitized frame (termination and error markers already
    /// stripped) according to its classification.
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] when the bytes fit no known frame shape
    /// under the given context and options.
    pub fn decode(
        bytes: &[u8],
        direction: FrameDirection,
        context: RequestContext,
        options: CBusOptions,
    ) -> Result<CBusMessage, FrameError> {
        match direction {
            FrameDirection::Request => Request::decode(bytes, options).map(CBusMessage::ToServer),
            FrameDirection::Response => {
                Reply::decode(bytes, context, options).map(CBusMessage::ToClient)
            }
        }
    }

    /// Encode the message to raw frame bytes, including termination.
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] if the message cannot be represented on the
    /// wire.
    pub fn encode(&self, options: CBusOptions) -> Result<Vec<u8>, FrameError> {
        match self {
            CBusMessage::ToServer(request) => request.encode(options),
            CBusMessage::ToClient(reply) => {
                let mut bytes = reply.encode(options)?;
                bytes.push(CR);
                bytes.push(LF);
                Ok(bytes)
            }
        }
    }
}

/// Two's-complement checksum over a binary payload; the sum of payload and
/// checksum is zero modulo 256.
#[must_use]
pub(crate) fn checksum(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0u8, |sum, &b| sum.wrapping_add(b))
        .wrapping_neg()
}

pub(crate) fn encode_hex(bytes: &[u8], out: &mut Vec<u8>) {
    const DIGITS: &[u8; 16] = b"0123456789ABCDEF";
    for &byte in bytes {
        out.push(DIGITS[usize::from(byte >> 4)]);
        out.push(DIGITS[usize::from(byte & 0x0F)]);
    }
}

pub(crate) fn decode_hex(ascii: &[u8]) -> Result<Vec<u8>, FrameError> {
    if ascii.len() % 2 != 0 {
        return Err(FrameError::OddHexLength {
            length: ascii.len(),
        });
    }
    let digit = |byte: u8, offset: usize| match byte {
        b'0'..=b'9' => Ok(byte - b'0'),
        b'A'..=b'F' => Ok(byte - b'A' + 10),
        b'a'..=b'f' => Ok(byte - b'a' + 10),
        other => Err(FrameError::InvalidHexDigit {
            digit: other,
            offset,
        }),
    };
    let mut decoded = Vec::with_capacity(ascii.len() / 2);
    for (index, pair) in ascii.chunks_exact(2).enumerate() {
        decoded.push((digit(pair[0], index * 2)? << 4) | digit(pair[1], index * 2 + 1)?);
    }
    Ok(decoded)
}

/// Verify and strip a trailing checksum byte when `srchk` is active.
pub(crate) fn strip_checksum(
    mut payload: Vec<u8>,
    options: CBusOptions,
) -> Result<Vec<u8>, FrameError> {
    if !options.srchk {
        return Ok(payload);
    }
    let Some(expected) = payload.pop() else {
        return Err(FrameError::Empty);
    };
    let actual = checksum(&payload);
    if expected != actual {
        return Err(FrameError::ChecksumMismatch { expected, actual });
    }
    Ok(payload)
}
