//! Requests travelling from the driver to the PCI.
//!
//! The PCI echoes every request back before confirming it, so these shapes
//! are decoded as well as encoded: a frame classified as PCI-initiated is
//! parsed with the same rules the driver used to build it.
//!
//! Wire shapes (hex region shown decoded):
//!
//! - reset: `~~~` CR
//! - direct command access: `@` CAL bytes \[alpha\] CR
//! - correlated command: `\` header route/application payload \[checksum\]
//!   \[alpha\] CR

use crate::{
    alpha::is_alpha,
    error::FrameError,
    options::CBusOptions,
    wire::{
        self,
        ApplicationId,
        BridgeAddress,
        CalData,
        SalData,
        UnitAddress,
        cal,
        checksum,
        decode_hex,
        encode_hex,
    },
};

/// Header byte of a point-to-point-to-multipoint command.
const HEADER_POINT_TO_POINT_TO_MULTI_POINT: u8 = 0x03;
/// Header byte of a point-to-multipoint command.
const HEADER_POINT_TO_MULTI_POINT: u8 = 0x05;
/// Header byte of a point-to-point command.
const HEADER_POINT_TO_POINT: u8 = 0x06;
/// Application slot used when a multipoint frame carries a status request
/// instead of SAL data.
const STATUS_APPLICATION_SLOT: u8 = 0xFF;

const STATUS_BINARY: u8 = 0x7A;
const STATUS_LEVEL: u8 = 0x73;
const STATUS_LEVEL_RESERVED: u8 = 0x07;

/// A request to the network's status reporting machinery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusRequest {
    /// Request packed binary group state.
    BinaryState { application: ApplicationId },
    /// Request per-group levels for a block of 32 groups.
    Level {
        application: ApplicationId,
        block_start: u8,
    },
}

impl StatusRequest {
    fn encode(self, out: &mut Vec<u8>) {
        match self {
            Self::BinaryState { application } => {
                out.extend_from_slice(&[STATUS_BINARY, application.0, 0x00]);
            }
            Self::Level {
                application,
                block_start,
            } => {
                out.extend_from_slice(&[
                    STATUS_LEVEL,
                    STATUS_LEVEL_RESERVED,
                    application.0,
                    block_start,
                ]);
            }
        }
    }

    fn decode(bytes: &[u8]) -> Result<StatusRequest, FrameError> {
        match bytes {
            [STATUS_BINARY, application, 0x00] => Ok(Self::BinaryState {
                application: ApplicationId(*application),
            }),
            [STATUS_LEVEL, STATUS_LEVEL_RESERVED, application, block_start] => Ok(Self::Level {
                application: ApplicationId(*application),
                block_start: *block_start,
            }),
            [] => Err(FrameError::Empty),
            bytes => Err(FrameError::UnrecognisedPrefix { prefix: bytes[0] }),
        }
    }

    /// Whether this asks for levels rather than binary state.
    #[must_use]
    pub fn is_level(self) -> bool { matches!(self, Self::Level { .. }) }
}

/// Payload of a multipoint command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MultiPointPayload {
    /// Application data for every listening unit.
    Sal(SalData),
    /// A status request.
    Status(StatusRequest),
}

/// A command addressed onto the C-Bus network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CBusCommand {
    /// Device-management command for one unit, optionally via bridges.
    PointToPoint {
        unit: UnitAddress,
        bridges: Vec<BridgeAddress>,
        cal: CalData,
    },
    /// Application command or status request for the local network.
    PointToMultiPoint { payload: MultiPointPayload },
    /// Application command or status request sent across bridges.
    PointToPointToMultiPoint {
        bridges: Vec<BridgeAddress>,
        payload: MultiPointPayload,
    },
}

/// A request frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    /// PCI reset.
    Reset,
    /// Direct command access: device management addressed at the PCI itself.
    /// Setup traffic carries no alpha; an alpha here would make the PCI
    /// auto-switch modes.
    DirectCommand { cal: CalData, alpha: Option<u8> },
    /// A command onto the network, usually correlated by an alpha.
    Command {
        command: CBusCommand,
        alpha: Option<u8>,
    },
}

impl Request {
    /// Encode the request into a complete CR-terminated frame.
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] if the bridge route is too long to encode.
    pub fn encode(&self, options: CBusOptions) -> Result<Vec<u8>, FrameError> {
        let mut out = Vec::new();
        match self {
            Request::Reset => out.extend_from_slice(&[wire::RESET_CHAR; 3]),
            Request::DirectCommand { cal, alpha } => {
                out.push(wire::DIRECT_PREFIX);
                encode_hex(&cal.encode(), &mut out);
                if let Some(alpha) = alpha {
                    out.push(*alpha);
                }
            }
            Request::Command { command, alpha } => {
                out.push(wire::REQUEST_PREFIX);
                let body = encode_command(command)?;
                encode_hex(&body, &mut out);
                if options.srchk {
                    encode_hex(&[checksum(&body)], &mut out);
                }
                if let Some(alpha) = alpha {
                    out.push(*alpha);
                }
            }
        }
        out.push(wire::CR);
        Ok(out)
    }

    /// Decode a CR-terminated (already stripped) request frame.
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] when the bytes are not a request the driver
    /// knows how to build.
    pub fn decode(bytes: &[u8], options: CBusOptions) -> Result<Request, FrameError> {
        let (&prefix, rest) = bytes.split_first().ok_or(FrameError::Empty)?;
        match prefix {
            wire::RESET_CHAR => {
                if rest.iter().all(|&b| b == wire::RESET_CHAR) {
                    Ok(Request::Reset)
                } else {
                    Err(FrameError::UnrecognisedPrefix { prefix })
                }
            }
            wire::DIRECT_PREFIX => {
                let (hex, alpha) = split_alpha(rest);
                let cal = CalData::decode(
                    &decode_hex(hex)?,
                    crate::context::RequestContext::NEUTRAL,
                )?;
                Ok(Request::DirectCommand { cal, alpha })
            }
            wire::REQUEST_PREFIX => {
                let (hex, alpha) = split_alpha(rest);
                let body = wire::strip_checksum(decode_hex(hex)?, options)?;
                Ok(Request::Command {
                    command: decode_command(&body)?,
                    alpha,
                })
            }
            prefix => Err(FrameError::UnrecognisedPrefix { prefix }),
        }
    }

    /// The correlation alpha this request carries, if any.
    #[must_use]
    pub fn alpha(&self) -> Option<u8> {
        match self {
            Request::Reset => None,
            Request::DirectCommand { alpha, .. } | Request::Command { alpha, .. } => *alpha,
        }
    }
}

fn split_alpha(bytes: &[u8]) -> (&[u8], Option<u8>) {
    match bytes.split_last() {
        Some((&last, head)) if is_alpha(last) => (head, Some(last)),
        _ => (bytes, None),
    }
}

fn encode_route(bridges: &[BridgeAddress], out: &mut Vec<u8>) -> Result<(), FrameError> {
    // Route control byte counts the bridges on the path.
    let count = u8::try_from(bridges.len()).map_err(|_| FrameError::Truncated {
        need: usize::from(u8::MAX),
        have: bridges.len(),
    })?;
    out.push(bridges[0].0);
    out.push(count);
    for bridge in &bridges[1..] {
        out.push(bridge.0);
    }
    Ok(())
}

fn encode_command(command: &CBusCommand) -> Result<Vec<u8>, FrameError> {
    let mut body = Vec::new();
    match command {
        CBusCommand::PointToPoint { unit, bridges, cal } => {
            body.push(HEADER_POINT_TO_POINT);
            if bridges.is_empty() {
                body.push(unit.0);
                body.push(0x00);
            } else {
                encode_route(bridges, &mut body)?;
                body.push(unit.0);
            }
            body.extend_from_slice(&cal.encode());
        }
        CBusCommand::PointToMultiPoint { payload } => {
            body.push(HEADER_POINT_TO_MULTI_POINT);
            encode_multi_point(payload, &mut body);
        }
        CBusCommand::PointToPointToMultiPoint { bridges, payload } => {
            body.push(HEADER_POINT_TO_POINT_TO_MULTI_POINT);
            if bridges.is_empty() {
                return Err(FrameError::Empty);
            }
            encode_route(bridges, &mut body)?;
            encode_multi_point(payload, &mut body);
        }
    }
    Ok(body)
}

fn encode_multi_point(payload: &MultiPointPayload, out: &mut Vec<u8>) {
    match payload {
        MultiPointPayload::Sal(sal) => {
            let application = match sal {
                SalData::Lighting(_) => ApplicationId::LIGHTING,
                SalData::Raw { .. } => ApplicationId(0x00),
            };
            out.push(application.0);
            out.push(0x00);
            out.extend_from_slice(&sal.encode());
        }
        MultiPointPayload::Status(status) => {
            out.push(STATUS_APPLICATION_SLOT);
            out.push(0x00);
            status.encode(out);
        }
    }
}

fn decode_command(body: &[u8]) -> Result<CBusCommand, FrameError> {
    let (&header, rest) = body.split_first().ok_or(FrameError::Empty)?;
    match header {
        HEADER_POINT_TO_POINT => {
            if rest.len() < 2 {
                return Err(FrameError::Truncated {
                    need: 3,
                    have: body.len(),
                });
            }
            if rest[1] == 0x00 {
                Ok(CBusCommand::PointToPoint {
                    unit: UnitAddress(rest[0]),
                    bridges: Vec::new(),
                    cal: CalData::decode(
                        &rest[2..],
                        crate::context::RequestContext::NEUTRAL,
                    )?,
                })
            } else {
                let (bridges, rest) = decode_route(rest)?;
                let (&unit, cal_bytes) = rest.split_first().ok_or(FrameError::Truncated {
                    need: body.len() + 1,
                    have: body.len(),
                })?;
                Ok(CBusCommand::PointToPoint {
                    unit: UnitAddress(unit),
                    bridges,
                    cal: CalData::decode(cal_bytes, crate::context::RequestContext::NEUTRAL)?,
                })
            }
        }
        HEADER_POINT_TO_MULTI_POINT => {
            let payload = decode_multi_point(rest, body.len())?;
            Ok(CBusCommand::PointToMultiPoint { payload })
        }
        HEADER_POINT_TO_POINT_TO_MULTI_POINT => {
            let (bridges, rest) = decode_route(rest)?;
            let payload = decode_multi_point(rest, body.len())?;
            Ok(CBusCommand::PointToPointToMultiPoint { bridges, payload })
        }
        prefix => Err(FrameError::UnrecognisedPrefix { prefix }),
    }
}

fn decode_route(bytes: &[u8]) -> Result<(Vec<BridgeAddress>, &[u8]), FrameError> {
    if bytes.len() < 2 {
        return Err(FrameError::Truncated {
            need: 2,
            have: bytes.len(),
        });
    }
    let first = BridgeAddress(bytes[0]);
    let count = usize::from(bytes[1]);
    if count == 0 || bytes.len() < 1 + count {
        return Err(FrameError::Truncated {
            need: 1 + count.max(1),
            have: bytes.len(),
        });
    }
    let mut bridges = vec![first];
    bridges.extend(bytes[2..=count].iter().map(|&b| BridgeAddress(b)));
    Ok((bridges, &bytes[1 + count..]))
}

fn decode_multi_point(bytes: &[u8], frame_len: usize) -> Result<MultiPointPayload, FrameError> {
    if bytes.len() < 3 {
        return Err(FrameError::Truncated {
            need: 4,
            have: frame_len,
        });
    }
    let application = ApplicationId(bytes[0]);
    let payload = &bytes[2..];
    if application.0 == STATUS_APPLICATION_SLOT {
        Ok(MultiPointPayload::Status(StatusRequest::decode(payload)?))
    } else {
        Ok(MultiPointPayload::Sal(SalData::decode(
            application,
            payload,
        )?))
    }
}

/// Convenience for setup traffic: the parameter-write direct command used by
/// every handshake step.
#[must_use]
pub fn parameter_write(parameter: cal::Parameter, value: u8) -> Request {
    Request::DirectCommand {
        cal: CalData::Write {
            parameter,
            code: 0x00,
            value: vec![value],
        },
        alpha: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Parameter;

    #[test]
    fn reset_frame_matches_documented_echo() {
        let encoded = Request::Reset.encode(CBusOptions::NEUTRAL).unwrap();
        assert_eq!(encoded, b"~~~\r");
        assert_eq!(
            Request::decode(b"~~~", CBusOptions::NEUTRAL).unwrap(),
            Request::Reset
        );
    }

    #[test]
    fn application_filter_write_matches_documented_frame() {
        let request = parameter_write(Parameter::ApplicationAddress1, 0xFF);
        let encoded = request.encode(CBusOptions::NEUTRAL).unwrap();
        assert_eq!(encoded, b"@A32100FF\r");
        assert_eq!(
            Request::decode(b"@A32100FF", CBusOptions::NEUTRAL).unwrap(),
            request
        );
    }

    #[test]
    fn correlated_command_round_trips_with_alpha() {
        let request = Request::Command {
            command: CBusCommand::PointToMultiPoint {
                payload: MultiPointPayload::Sal(SalData::Lighting(vec![
                    crate::wire::LightingData::On { group: 8 },
                ])),
            },
            alpha: Some(b'g'),
        };
        let encoded = request.encode(CBusOptions::NEUTRAL).unwrap();
        assert_eq!(encoded, b"\\0538007908g\r");
        let stripped = &encoded[..encoded.len() - 1];
        assert_eq!(
            Request::decode(stripped, CBusOptions::NEUTRAL).unwrap(),
            request
        );
    }

    #[test]
    fn srchk_appends_verifiable_checksum() {
        let options = CBusOptions {
            srchk: true,
            ..CBusOptions::NEUTRAL
        };
        let request = Request::Command {
            command: CBusCommand::PointToMultiPoint {
                payload: MultiPointPayload::Sal(SalData::Lighting(vec![
                    crate::wire::LightingData::On { group: 8 },
                ])),
            },
            alpha: Some(b'h'),
        };
        let encoded = request.encode(options).unwrap();
        let stripped = &encoded[..encoded.len() - 1];
        assert_eq!(Request::decode(stripped, options).unwrap(), request);

        // Flipping one hex digit must fail the checksum, not decode.
        let mut corrupted = stripped.to_vec();
        corrupted[1] = b'1';
        assert!(matches!(
            Request::decode(&corrupted, options),
            Err(FrameError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn bridged_status_request_round_trips() {
        let request = Request::Command {
            command: CBusCommand::PointToPointToMultiPoint {
                bridges: vec![BridgeAddress(2), BridgeAddress(3)],
                payload: MultiPointPayload::Status(StatusRequest::Level {
                    application: ApplicationId::LIGHTING,
                    block_start: 0x20,
                }),
            },
            alpha: Some(b'j'),
        };
        let encoded = request.encode(CBusOptions::NEUTRAL).unwrap();
        let stripped = &encoded[..encoded.len() - 1];
        assert_eq!(
            Request::decode(stripped, CBusOptions::NEUTRAL).unwrap(),
            request
        );
    }
}
