//! CAL (device management) commands and replies.
//!
//! Every CAL payload starts with a command container byte whose upper bits
//! select the command family and whose low five bits carry the payload
//! length for the variable-length families:
//!
//! | container        | family                      |
//! |------------------|-----------------------------|
//! | `0x1A`           | parameter recall            |
//! | `0x21`           | identify                    |
//! | `0x32`           | parameter acknowledge       |
//! | `0x80..=0x9F`    | reply / identify reply      |
//! | `0xA0..=0xBF`    | parameter write             |
//! | `0xC0..=0xDF`    | status                      |
//! | `0xE0..=0xFF`    | extended status             |
//!
//! Reply containers are ambiguous on their own: whether `0x80..=0x9F` holds
//! an identify reply, and whether a standard status payload carries binary
//! state or levels, depends on the request that was just sent. The
//! [`RequestContext`] supplies that bias.

use crate::{context::RequestContext, error::FrameError, wire::ApplicationId};

const RECALL_CONTAINER: u8 = 0x1A;
const IDENTIFY_CONTAINER: u8 = 0x21;
const ACKNOWLEDGE_CONTAINER: u8 = 0x32;

/// PCI configuration parameter numbers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Parameter {
    /// First monitored-application filter.
    ApplicationAddress1,
    /// Second monitored-application filter.
    ApplicationAddress2,
    /// Interface options 1.
    InterfaceOptions1,
    /// Baud rate selector.
    BaudRateSelector,
    /// Interface options 2.
    InterfaceOptions2,
    /// Power-up copy of interface options 1.
    InterfaceOptions1PowerUpSettings,
    /// Interface options 3.
    InterfaceOptions3,
    /// Any parameter number this driver does not use.
    Unknown(u8),
}

impl Parameter {
    #[must_use]
    pub fn from_byte(byte: u8) -> Parameter {
        match byte {
            0x21 => Self::ApplicationAddress1,
            0x22 => Self::ApplicationAddress2,
            0x30 => Self::InterfaceOptions1,
            0x3B => Self::BaudRateSelector,
            0x3E => Self::InterfaceOptions2,
            0x41 => Self::InterfaceOptions1PowerUpSettings,
            0x42 => Self::InterfaceOptions3,
            other => Self::Unknown(other),
        }
    }

    #[must_use]
    pub fn as_byte(self) -> u8 {
        match self {
            Self::ApplicationAddress1 => 0x21,
            Self::ApplicationAddress2 => 0x22,
            Self::InterfaceOptions1 => 0x30,
            Self::BaudRateSelector => 0x3B,
            Self::InterfaceOptions2 => 0x3E,
            Self::InterfaceOptions1PowerUpSettings => 0x41,
            Self::InterfaceOptions3 => 0x42,
            Self::Unknown(byte) => byte,
        }
    }
}

impl std::fmt::Display for Parameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApplicationAddress1 => f.write_str("applicationAddress1"),
            Self::ApplicationAddress2 => f.write_str("applicationAddress2"),
            Self::InterfaceOptions1 => f.write_str("interfaceOptions1"),
            Self::BaudRateSelector => f.write_str("baudRateSelector"),
            Self::InterfaceOptions2 => f.write_str("interfaceOptions2"),
            Self::InterfaceOptions1PowerUpSettings => {
                f.write_str("interfaceOptions1PowerUpSettings")
            }
            Self::InterfaceOptions3 => f.write_str("interfaceOptions3"),
            Self::Unknown(byte) => write!(f, "parameter{byte:#04x}"),
        }
    }
}

/// Attributes a unit can be asked to identify.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Attribute {
    Manufacturer,
    Type,
    FirmwareVersion,
    Summary,
    ExtendedDiagnosticSummary,
    NetworkTerminalLevels,
    TerminalLevel,
    NetworkVoltage,
    GavValuesCurrent,
    GavValuesStored,
    GavPhysicalAddresses,
    LogicalAssignment,
    Delays,
    MinimumLevels,
    MaximumLevels,
    CurrentSenseLevels,
    OutputUnitSummary,
    DsiStatus,
    /// Any attribute this driver does not map.
    Unknown(u8),
}

impl Attribute {
    #[must_use]
    pub fn from_byte(byte: u8) -> Attribute {
        match byte {
            0x00 => Self::Manufacturer,
            0x01 => Self::Type,
            0x02 => Self::FirmwareVersion,
            0x03 => Self::Summary,
            0x04 => Self::ExtendedDiagnosticSummary,
            0x05 => Self::NetworkTerminalLevels,
            0x06 => Self::TerminalLevel,
            0x07 => Self::NetworkVoltage,
            0x08 => Self::GavValuesCurrent,
            0x09 => Self::GavValuesStored,
            0x0A => Self::GavPhysicalAddresses,
            0x0B => Self::LogicalAssignment,
            0x0C => Self::Delays,
            0x0D => Self::MinimumLevels,
            0x0E => Self::MaximumLevels,
            0x0F => Self::CurrentSenseLevels,
            0x10 => Self::OutputUnitSummary,
            0x11 => Self::DsiStatus,
            other => Self::Unknown(other),
        }
    }

    #[must_use]
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Manufacturer => 0x00,
            Self::Type => 0x01,
            Self::FirmwareVersion => 0x02,
            Self::Summary => 0x03,
            Self::ExtendedDiagnosticSummary => 0x04,
            Self::NetworkTerminalLevels => 0x05,
            Self::TerminalLevel => 0x06,
            Self::NetworkVoltage => 0x07,
            Self::GavValuesCurrent => 0x08,
            Self::GavValuesStored => 0x09,
            Self::GavPhysicalAddresses => 0x0A,
            Self::LogicalAssignment => 0x0B,
            Self::Delays => 0x0C,
            Self::MinimumLevels => 0x0D,
            Self::MaximumLevels => 0x0E,
            Self::CurrentSenseLevels => 0x0F,
            Self::OutputUnitSummary => 0x10,
            Self::DsiStatus => 0x11,
            Self::Unknown(byte) => byte,
        }
    }
}

/// State of a single group address variable inside a binary status reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GavState {
    DoesNotExist,
    On,
    Off,
    Error,
}

impl GavState {
    fn from_bits(bits: u8) -> GavState {
        match bits & 0b11 {
            0b00 => Self::DoesNotExist,
            0b01 => Self::On,
            0b10 => Self::Off,
            _ => Self::Error,
        }
    }

    /// Name used when status replies are rendered into values.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::DoesNotExist => "doesNotExist",
            Self::On => "on",
            Self::Off => "off",
            Self::Error => "error",
        }
    }
}

/// Four two-bit group states packed into one status byte, most significant
/// pair first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusByte {
    pub gav0: GavState,
    pub gav1: GavState,
    pub gav2: GavState,
    pub gav3: GavState,
}

impl StatusByte {
    #[must_use]
    pub fn from_byte(byte: u8) -> StatusByte {
        StatusByte {
            gav0: GavState::from_bits(byte >> 6),
            gav1: GavState::from_bits(byte >> 4),
            gav2: GavState::from_bits(byte >> 2),
            gav3: GavState::from_bits(byte),
        }
    }

    #[must_use]
    pub fn as_byte(self) -> u8 {
        let bits = |state: GavState| match state {
            GavState::DoesNotExist => 0u8,
            GavState::On => 1,
            GavState::Off => 2,
            GavState::Error => 3,
        };
        (bits(self.gav0) << 6) | (bits(self.gav1) << 4) | (bits(self.gav2) << 2) | bits(self.gav3)
    }

    /// The four states in group order.
    #[must_use]
    pub fn states(self) -> [GavState; 4] { [self.gav0, self.gav1, self.gav2, self.gav3] }
}

/// Per-group level information inside a level status reply. Each entry is a
/// marker byte followed by the level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LevelInformation {
    /// The group does not exist.
    Absent,
    /// Current level of the group.
    Normal(u8),
    /// The level report was corrupted on the network.
    Corrupted,
}

impl LevelInformation {
    const ABSENT_MARKER: u8 = 0x00;
    const NORMAL_MARKER: u8 = 0x01;
    const CORRUPTED_MARKER: u8 = 0x02;

    fn decode(pair: &[u8]) -> Result<LevelInformation, FrameError> {
        match pair[0] {
            Self::ABSENT_MARKER => Ok(Self::Absent),
            Self::NORMAL_MARKER => Ok(Self::Normal(pair[1])),
            Self::CORRUPTED_MARKER => Ok(Self::Corrupted),
            marker => Err(FrameError::InvalidLevelMarker { marker }),
        }
    }

    fn encode(self, out: &mut Vec<u8>) {
        match self {
            Self::Absent => out.extend_from_slice(&[Self::ABSENT_MARKER, 0x00]),
            Self::Normal(level) => out.extend_from_slice(&[Self::NORMAL_MARKER, level]),
            Self::Corrupted => out.extend_from_slice(&[Self::CORRUPTED_MARKER, 0x00]),
        }
    }
}

/// Coding byte of an extended status reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusCoding {
    BinaryByThisSerialInterface,
    BinaryByElsewhere,
    LevelByThisSerialInterface,
    LevelByElsewhere,
}

impl StatusCoding {
    fn from_byte(byte: u8) -> Result<StatusCoding, FrameError> {
        match byte {
            0x00 => Ok(Self::BinaryByThisSerialInterface),
            0x40 => Ok(Self::BinaryByElsewhere),
            0x07 => Ok(Self::LevelByThisSerialInterface),
            0x47 => Ok(Self::LevelByElsewhere),
            coding => Err(FrameError::UnknownStatusCoding { coding }),
        }
    }

    #[must_use]
    pub fn as_byte(self) -> u8 {
        match self {
            Self::BinaryByThisSerialInterface => 0x00,
            Self::BinaryByElsewhere => 0x40,
            Self::LevelByThisSerialInterface => 0x07,
            Self::LevelByElsewhere => 0x47,
        }
    }

    /// Whether the payload carries levels rather than binary state.
    #[must_use]
    pub fn is_level(self) -> bool {
        matches!(self, Self::LevelByThisSerialInterface | Self::LevelByElsewhere)
    }
}

/// Payload of a status reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StatusPayload {
    /// Packed binary group states.
    Binary(Vec<StatusByte>),
    /// Per-group levels.
    Levels(Vec<LevelInformation>),
}

impl StatusPayload {
    fn decode(bytes: &[u8], level: bool) -> Result<StatusPayload, FrameError> {
        if level {
            if bytes.len() % 2 != 0 {
                return Err(FrameError::Truncated {
                    need: bytes.len() + 1,
                    have: bytes.len(),
                });
            }
            let levels = bytes
                .chunks_exact(2)
                .map(LevelInformation::decode)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(StatusPayload::Levels(levels))
        } else {
            Ok(StatusPayload::Binary(
                bytes.iter().copied().map(StatusByte::from_byte).collect(),
            ))
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            StatusPayload::Binary(bytes) => {
                out.extend(bytes.iter().map(|status| status.as_byte()));
            }
            StatusPayload::Levels(levels) => {
                for level in levels {
                    level.encode(out);
                }
            }
        }
    }
}

/// A CAL command or reply payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CalData {
    /// Write a configuration parameter.
    Write {
        parameter: Parameter,
        code: u8,
        value: Vec<u8>,
    },
    /// Ask a unit to identify one of its attributes.
    Identify { attribute: Attribute },
    /// Recall the stored value of a parameter.
    Recall { parameter: Parameter, count: u8 },
    /// Acknowledge of a parameter write.
    Acknowledge { parameter: Parameter, code: u8 },
    /// Generic reply payload the driver does not interpret further.
    Reply { data: Vec<u8> },
    /// Reply to an identify request.
    IdentifyReply { attribute: Attribute, data: Vec<u8> },
    /// Standard-format status reply.
    Status {
        application: ApplicationId,
        block_start: u8,
        payload: StatusPayload,
    },
    /// Extended-format status reply.
    StatusExtended {
        coding: StatusCoding,
        application: ApplicationId,
        block_start: u8,
        payload: StatusPayload,
    },
}

impl CalData {
    /// Decode a CAL payload. The request context decides whether reply
    /// containers hold identify replies and whether standard status payloads
    /// carry levels.
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] on an unknown container or truncated payload.
    pub fn decode(bytes: &[u8], context: RequestContext) -> Result<CalData, FrameError> {
        let (&container, rest) = bytes.split_first().ok_or(FrameError::Empty)?;
        let need = |need: usize| {
            if rest.len() < need {
                Err(FrameError::Truncated {
                    need: need + 1,
                    have: bytes.len(),
                })
            } else {
                Ok(())
            }
        };
        match container {
            RECALL_CONTAINER => {
                need(2)?;
                Ok(CalData::Recall {
                    parameter: Parameter::from_byte(rest[0]),
                    count: rest[1],
                })
            }
            IDENTIFY_CONTAINER => {
                need(1)?;
                Ok(CalData::Identify {
                    attribute: Attribute::from_byte(rest[0]),
                })
            }
            ACKNOWLEDGE_CONTAINER => {
                need(2)?;
                Ok(CalData::Acknowledge {
                    parameter: Parameter::from_byte(rest[0]),
                    code: rest[1],
                })
            }
            0x80..=0x9F => {
                let length = usize::from(container & 0x1F);
                need(length)?;
                let data = &rest[..length];
                if context.expect_identify_reply_first {
                    let (&attribute, data) = data.split_first().ok_or(FrameError::Truncated {
                        need: 2,
                        have: bytes.len(),
                    })?;
                    Ok(CalData::IdentifyReply {
                        attribute: Attribute::from_byte(attribute),
                        data: data.to_vec(),
                    })
                } else {
                    Ok(CalData::Reply {
                        data: data.to_vec(),
                    })
                }
            }
            0xA0..=0xBF => {
                let length = usize::from(container & 0x1F);
                need(length)?;
                if length < 2 {
                    return Err(FrameError::Truncated {
                        need: 3,
                        have: bytes.len(),
                    });
                }
                Ok(CalData::Write {
                    parameter: Parameter::from_byte(rest[0]),
                    code: rest[1],
                    value: rest[2..length].to_vec(),
                })
            }
            0xC0..=0xDF => {
                let length = usize::from(container & 0x1F);
                need(length)?;
                if length < 2 {
                    return Err(FrameError::Truncated {
                        need: 3,
                        have: bytes.len(),
                    });
                }
                Ok(CalData::Status {
                    application: ApplicationId(rest[0]),
                    block_start: rest[1],
                    payload: StatusPayload::decode(
                        &rest[2..length],
                        context.expect_level_status_reply,
                    )?,
                })
            }
            0xE0..=0xFF => {
                let length = usize::from(container & 0x1F);
                need(length)?;
                if length < 3 {
                    return Err(FrameError::Truncated {
                        need: 4,
                        have: bytes.len(),
                    });
                }
                let coding = StatusCoding::from_byte(rest[0])?;
                Ok(CalData::StatusExtended {
                    coding,
                    application: ApplicationId(rest[1]),
                    block_start: rest[2],
                    payload: StatusPayload::decode(&rest[3..length], coding.is_level())?,
                })
            }
            container => Err(FrameError::UnknownCalContainer { container }),
        }
    }

    /// Encode the CAL payload, container byte included.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            CalData::Write {
                parameter,
                code,
                value,
            } => {
                out.push(0xA0 | ((value.len() as u8 + 2) & 0x1F));
                out.push(parameter.as_byte());
                out.push(*code);
                out.extend_from_slice(value);
            }
            CalData::Identify { attribute } => {
                out.push(IDENTIFY_CONTAINER);
                out.push(attribute.as_byte());
            }
            CalData::Recall { parameter, count } => {
                out.push(RECALL_CONTAINER);
                out.push(parameter.as_byte());
                out.push(*count);
            }
            CalData::Acknowledge { parameter, code } => {
                out.push(ACKNOWLEDGE_CONTAINER);
                out.push(parameter.as_byte());
                out.push(*code);
            }
            CalData::Reply { data } => {
                out.push(0x80 | (data.len() as u8 & 0x1F));
                out.extend_from_slice(data);
            }
            CalData::IdentifyReply { attribute, data } => {
                out.push(0x80 | ((data.len() as u8 + 1) & 0x1F));
                out.push(attribute.as_byte());
                out.extend_from_slice(data);
            }
            CalData::Status {
                application,
                block_start,
                payload,
            } => {
                let mut body = vec![application.0, *block_start];
                payload.encode(&mut body);
                out.push(0xC0 | (body.len() as u8 & 0x1F));
                out.extend_from_slice(&body);
            }
            CalData::StatusExtended {
                coding,
                application,
                block_start,
                payload,
            } => {
                let mut body = vec![coding.as_byte(), application.0, *block_start];
                payload.encode(&mut body);
                out.push(0xE0 | (body.len() as u8 & 0x1F));
                out.extend_from_slice(&body);
            }
        }
        out
    }
}
