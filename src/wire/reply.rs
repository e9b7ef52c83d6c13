//! Replies travelling from the PCI to the driver.
//!
//! A response frame is one of:
//!
//! - an alpha confirmation pair (`g.`, `h#`, ...), optionally followed by an
//!   embedded encoded reply;
//! - a power-up notification (`+`);
//! - an encoded reply: hex bytes holding a CAL reply (short or `0x86` long
//!   form) or monitored SAL traffic;
//! - a synthetic server error, produced by the frame recognizer for each
//!   in-stream `!` marker rather than parsed from payload bytes.
//!
//! Long-form frames carry the origin address: either a unit on the local
//! network or a bridged route, rendered as `u<n>` or `b<n>[-b<n>...]-u<n>`.

use crate::{
    alpha::is_alpha,
    context::RequestContext,
    error::FrameError,
    options::CBusOptions,
    wire::{
        self,
        ApplicationId,
        BridgeAddress,
        CalData,
        SalData,
        UnitAddress,
        decode_hex,
        encode_hex,
    },
};

/// Leading byte of a long-form CAL reply.
const CAL_LONG_FORM: u8 = 0x86;
/// Leading byte of a long-form monitored SAL frame.
const SAL_LONG_FORM: u8 = 0x05;

/// Single-byte confirmation codes the PCI appends to an alpha.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfirmationCode {
    /// Transmitted successfully.
    Success,
    /// Dropped after too many retransmissions.
    TooManyRetransmissions,
    /// Dropped because of network corruption.
    Corruption,
    /// Dropped after losing clock sync.
    SyncLoss,
    /// Dropped because the request was too long.
    TooLong,
}

impl ConfirmationCode {
    /// Map a wire byte to its confirmation code.
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<ConfirmationCode> {
        match byte {
            b'.' => Some(Self::Success),
            b'#' => Some(Self::TooManyRetransmissions),
            b'$' => Some(Self::Corruption),
            b'%' => Some(Self::SyncLoss),
            b'\'' => Some(Self::TooLong),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Success => b'.',
            Self::TooManyRetransmissions => b'#',
            Self::Corruption => b'$',
            Self::SyncLoss => b'%',
            Self::TooLong => b'\'',
        }
    }

    /// Whether the request made it onto the network.
    #[must_use]
    pub fn is_success(self) -> bool { matches!(self, Self::Success) }
}

/// Route of additional bridges between the first bridge and the unit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NetworkRoute {
    pub additional_bridges: Vec<BridgeAddress>,
}

/// Origin of a long-form reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplyAddress {
    /// A unit on the local network.
    Unit(UnitAddress),
    /// A unit reached through one or more bridges.
    Bridged {
        bridge: BridgeAddress,
        route: NetworkRoute,
        unit: UnitAddress,
    },
}

impl ReplyAddress {
    /// Render the textual path used in subscription events.
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            ReplyAddress::Unit(unit) => unit.to_string(),
            ReplyAddress::Bridged {
                bridge,
                route,
                unit,
            } => {
                let mut path = bridge.to_string();
                for hop in &route.additional_bridges {
                    path.push('-');
                    path.push_str(&hop.to_string());
                }
                path.push('-');
                path.push_str(&unit.to_string());
                path
            }
        }
    }
}

/// Decode the shared long-form address section: either
/// `[unit][extra][0x00]` or `[bridge][extra][count][hops...][unit]`.
///
/// `extra` is the serial interface address on CAL replies and the
/// application id on monitored SAL.
fn decode_long_address(bytes: &[u8]) -> Result<(ReplyAddress, u8, &[u8]), FrameError> {
    if bytes.len() < 3 {
        return Err(FrameError::Truncated {
            need: 3,
            have: bytes.len(),
        });
    }
    let extra = bytes[1];
    if bytes[2] == 0x00 {
        return Ok((ReplyAddress::Unit(UnitAddress(bytes[0])), extra, &bytes[3..]));
    }
    let count = usize::from(bytes[2]);
    // count hops beyond the first bridge, then the unit itself
    let need = 3 + count;
    if bytes.len() < need {
        return Err(FrameError::Truncated {
            need,
            have: bytes.len(),
        });
    }
    let additional_bridges = bytes[3..3 + count - 1]
        .iter()
        .map(|&b| BridgeAddress(b))
        .collect();
    Ok((
        ReplyAddress::Bridged {
            bridge: BridgeAddress(bytes[0]),
            route: NetworkRoute { additional_bridges },
            unit: UnitAddress(bytes[2 + count]),
        },
        extra,
        &bytes[3 + count..],
    ))
}

fn encode_long_address(address: &ReplyAddress, extra: u8, out: &mut Vec<u8>) {
    match address {
        ReplyAddress::Unit(unit) => out.extend_from_slice(&[unit.0, extra, 0x00]),
        ReplyAddress::Bridged {
            bridge,
            route,
            unit,
        } => {
            out.push(bridge.0);
            out.push(extra);
            out.push(route.additional_bridges.len() as u8 + 1);
            for hop in &route.additional_bridges {
                out.push(hop.0);
            }
            out.push(unit.0);
        }
    }
}

/// A CAL reply, the payload of device-management answers and monitored MMI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CalReply {
    /// Short form: bare CAL data, no origin address.
    Short { cal: CalData },
    /// Long form: origin address and serial interface address included.
    Long {
        address: ReplyAddress,
        serial_interface: u8,
        cal: CalData,
    },
}

impl CalReply {
    /// The CAL payload regardless of form.
    #[must_use]
    pub fn cal(&self) -> &CalData {
        match self {
            CalReply::Short { cal } | CalReply::Long { cal, .. } => cal,
        }
    }

    /// Textual origin path; short-form replies always come from unit 0.
    #[must_use]
    pub fn source_path(&self) -> String {
        match self {
            CalReply::Short { .. } => "u0".to_owned(),
            CalReply::Long { address, .. } => address.render(),
        }
    }

    fn decode(bytes: &[u8], context: RequestContext) -> Result<CalReply, FrameError> {
        match bytes.first() {
            Some(&CAL_LONG_FORM) => {
                let (address, serial_interface, cal_bytes) = decode_long_address(&bytes[1..])?;
                Ok(CalReply::Long {
                    address,
                    serial_interface,
                    cal: CalData::decode(cal_bytes, context)?,
                })
            }
            Some(_) => Ok(CalReply::Short {
                cal: CalData::decode(bytes, context)?,
            }),
            None => Err(FrameError::Empty),
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            CalReply::Short { cal } => out.extend_from_slice(&cal.encode()),
            CalReply::Long {
                address,
                serial_interface,
                cal,
            } => {
                out.push(CAL_LONG_FORM);
                encode_long_address(address, *serial_interface, out);
                out.extend_from_slice(&cal.encode());
            }
        }
    }
}

/// Monitored SAL traffic pushed by the PCI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MonitoredSal {
    /// Short form, basic mode: application byte then payload.
    Short {
        application: ApplicationId,
        sal: SalData,
    },
    /// Long form, smart mode: origin address included.
    Long {
        address: ReplyAddress,
        application: ApplicationId,
        sal: SalData,
    },
}

impl MonitoredSal {
    /// The application the event belongs to.
    #[must_use]
    pub fn application(&self) -> ApplicationId {
        match self {
            MonitoredSal::Short { application, .. } | MonitoredSal::Long { application, .. } => {
                *application
            }
        }
    }

    /// The SAL payload.
    #[must_use]
    pub fn sal(&self) -> &SalData {
        match self {
            MonitoredSal::Short { sal, .. } | MonitoredSal::Long { sal, .. } => sal,
        }
    }

    /// Textual origin path; short-form frames always come from unit 0.
    #[must_use]
    pub fn source_path(&self) -> String {
        match self {
            MonitoredSal::Short { .. } => "u0".to_owned(),
            MonitoredSal::Long { address, .. } => address.render(),
        }
    }

    fn decode(bytes: &[u8]) -> Result<MonitoredSal, FrameError> {
        match bytes.first() {
            Some(&SAL_LONG_FORM) => {
                let (address, application, sal_bytes) = decode_long_address(&bytes[1..])?;
                let application = ApplicationId(application);
                Ok(MonitoredSal::Long {
                    address,
                    application,
                    sal: SalData::decode(application, sal_bytes)?,
                })
            }
            Some(&application) => Ok(MonitoredSal::Short {
                application: ApplicationId(application),
                sal: SalData::decode(ApplicationId(application), &bytes[1..])?,
            }),
            None => Err(FrameError::Empty),
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            MonitoredSal::Short { application, sal } => {
                out.push(application.0);
                out.extend_from_slice(&sal.encode());
            }
            MonitoredSal::Long {
                address,
                application,
                sal,
            } => {
                out.push(SAL_LONG_FORM);
                encode_long_address(address, application.0, out);
                out.extend_from_slice(&sal.encode());
            }
        }
    }
}

/// The hex-encoded portion of a response frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EncodedReply {
    /// A CAL reply: solicited device management answers and monitored MMI.
    CalReply(CalReply),
    /// Monitored SAL traffic.
    MonitoredSal(MonitoredSal),
}

impl EncodedReply {
    fn decode(
        bytes: &[u8],
        context: RequestContext,
        options: CBusOptions,
    ) -> Result<EncodedReply, FrameError> {
        let payload = wire::strip_checksum(decode_hex(bytes)?, options)?;
        let first = *payload.first().ok_or(FrameError::Empty)?;
        // A pending CAL exchange biases everything towards CAL; otherwise
        // only the 0x86 long form is unmistakably MMI and the rest is
        // monitored SAL.
        if context.expect_cal_reply
            || context.expect_identify_reply_first
            || first == CAL_LONG_FORM
        {
            CalReply::decode(&payload, context).map(EncodedReply::CalReply)
        } else {
            MonitoredSal::decode(&payload).map(EncodedReply::MonitoredSal)
        }
    }

    fn encode(&self, options: CBusOptions, out: &mut Vec<u8>) {
        let mut payload = Vec::new();
        match self {
            EncodedReply::CalReply(reply) => reply.encode(&mut payload),
            EncodedReply::MonitoredSal(sal) => sal.encode(&mut payload),
        }
        if options.srchk {
            payload.push(wire::checksum(&payload));
        }
        encode_hex(&payload, out);
    }
}

/// A reply frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    /// Alpha confirmation, optionally carrying the reply it confirms.
    Confirmation {
        alpha: u8,
        code: ConfirmationCode,
        embedded: Option<Box<Reply>>,
    },
    /// Power-up notification.
    PowerUp,
    /// Synthetic reply for an in-stream `!` error marker.
    ServerError,
    /// Hex-encoded reply payload.
    Encoded(EncodedReply),
}

impl Reply {
    /// Decode a response frame (termination already stripped).
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] when the bytes match no reply shape under
    /// the given context and options.
    pub fn decode(
        bytes: &[u8],
        context: RequestContext,
        options: CBusOptions,
    ) -> Result<Reply, FrameError> {
        let (&first, rest) = bytes.split_first().ok_or(FrameError::Empty)?;
        if first == wire::POWER_UP {
            return Ok(Reply::PowerUp);
        }
        if is_alpha(first) {
            let (&code, rest) = rest.split_first().ok_or(FrameError::Truncated {
                need: 2,
                have: bytes.len(),
            })?;
            let code = ConfirmationCode::from_byte(code)
                .ok_or(FrameError::UnknownConfirmationCode { code })?;
            let embedded = if rest.is_empty() {
                None
            } else {
                Some(Box::new(Reply::decode(rest, context, options)?))
            };
            return Ok(Reply::Confirmation {
                alpha: first,
                code,
                embedded,
            });
        }
        EncodedReply::decode(bytes, context, options).map(Reply::Encoded)
    }

    /// Encode the reply without termination.
    ///
    /// # Errors
    ///
    /// Currently infallible for all constructible replies; the `Result`
    /// keeps the signature aligned with [`crate::wire::Request::encode`].
    pub fn encode(&self, options: CBusOptions) -> Result<Vec<u8>, FrameError> {
        let mut out = Vec::new();
        self.encode_into(options, &mut out)?;
        Ok(out)
    }

    fn encode_into(&self, options: CBusOptions, out: &mut Vec<u8>) -> Result<(), FrameError> {
        match self {
            Reply::Confirmation {
                alpha,
                code,
                embedded,
            } => {
                out.push(*alpha);
                out.push(code.as_byte());
                if let Some(embedded) = embedded {
                    embedded.encode_into(options, out)?;
                }
            }
            Reply::PowerUp => out.push(wire::POWER_UP),
            Reply::ServerError => out.push(wire::ERROR_MARKER),
            Reply::Encoded(encoded) => encoded.encode(options, out),
        }
        Ok(())
    }

    /// The confirmation alpha, if this reply is (or wraps) a confirmation.
    #[must_use]
    pub fn confirmation_alpha(&self) -> Option<u8> {
        match self {
            Reply::Confirmation { alpha, .. } => Some(*alpha),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{GavState, LightingData, StatusPayload};

    fn neutral() -> (RequestContext, CBusOptions) { (RequestContext::NEUTRAL, CBusOptions::NEUTRAL) }

    #[test]
    fn confirmation_without_payload() {
        let (context, options) = neutral();
        let reply = Reply::decode(b"i.", context, options).unwrap();
        match reply {
            Reply::Confirmation {
                alpha,
                code,
                embedded,
            } => {
                assert_eq!(alpha, b'i');
                assert!(code.is_success());
                assert!(embedded.is_none());
            }
            other => panic!("expected confirmation, got {other:?}"),
        }
    }

    #[test]
    fn failed_confirmation_codes_map() {
        let (context, options) = neutral();
        for (byte, code) in [
            (b'#', ConfirmationCode::TooManyRetransmissions),
            (b'$', ConfirmationCode::Corruption),
            (b'%', ConfirmationCode::SyncLoss),
            (b'\'', ConfirmationCode::TooLong),
        ] {
            let frame = [b'g', byte];
            match Reply::decode(&frame, context, options).unwrap() {
                Reply::Confirmation { code: got, .. } => assert_eq!(got, code),
                other => panic!("expected confirmation, got {other:?}"),
            }
        }
    }

    #[test]
    fn confirmation_with_embedded_cal_reply() {
        let context = RequestContext {
            expect_cal_reply: true,
            ..RequestContext::NEUTRAL
        };
        let embedded = Reply::Encoded(EncodedReply::CalReply(CalReply::Short {
            cal: CalData::Acknowledge {
                parameter: crate::wire::Parameter::InterfaceOptions1,
                code: 0x00,
            },
        }));
        let mut frame = vec![b'g', b'.'];
        frame.extend(embedded.encode(CBusOptions::NEUTRAL).unwrap());

        match Reply::decode(&frame, context, CBusOptions::NEUTRAL).unwrap() {
            Reply::Confirmation {
                embedded: Some(inner),
                ..
            } => assert_eq!(*inner, embedded),
            other => panic!("expected confirmation with payload, got {other:?}"),
        }
    }

    #[test]
    fn monitored_sal_long_form_decodes_with_unit_source() {
        let (context, options) = neutral();
        let sal = MonitoredSal::Long {
            address: ReplyAddress::Unit(UnitAddress(49)),
            application: ApplicationId::LIGHTING,
            sal: SalData::Lighting(vec![LightingData::On { group: 4 }]),
        };
        let reply = Reply::Encoded(EncodedReply::MonitoredSal(sal.clone()));
        let frame = reply.encode(options).unwrap();
        assert_eq!(Reply::decode(&frame, context, options).unwrap(), reply);
        assert_eq!(sal.source_path(), "u49");
    }

    #[test]
    fn bridged_reply_renders_route_path() {
        let address = ReplyAddress::Bridged {
            bridge: BridgeAddress(2),
            route: NetworkRoute {
                additional_bridges: vec![BridgeAddress(3)],
            },
            unit: UnitAddress(5),
        };
        assert_eq!(address.render(), "b2-b3-u5");

        let (context, options) = neutral();
        let reply = Reply::Encoded(EncodedReply::MonitoredSal(MonitoredSal::Long {
            address,
            application: ApplicationId::LIGHTING,
            sal: SalData::Lighting(vec![LightingData::Off { group: 1 }]),
        }));
        let frame = reply.encode(options).unwrap();
        assert_eq!(Reply::decode(&frame, context, options).unwrap(), reply);
    }

    #[test]
    fn mmi_long_form_is_cal_even_without_context() {
        let (context, options) = neutral();
        let reply = Reply::Encoded(EncodedReply::CalReply(CalReply::Long {
            address: ReplyAddress::Unit(UnitAddress(4)),
            serial_interface: 2,
            cal: CalData::StatusExtended {
                coding: crate::wire::StatusCoding::BinaryByElsewhere,
                application: ApplicationId::LIGHTING,
                block_start: 0,
                payload: StatusPayload::Binary(vec![crate::wire::StatusByte::from_byte(0x01)]),
            },
        }));
        let frame = reply.encode(options).unwrap();
        match Reply::decode(&frame, context, options).unwrap() {
            Reply::Encoded(EncodedReply::CalReply(CalReply::Long { cal, .. })) => {
                match cal {
                    CalData::StatusExtended { payload, .. } => match payload {
                        StatusPayload::Binary(bytes) => {
                            assert_eq!(bytes[0].gav3, GavState::On);
                        }
                        StatusPayload::Levels(_) => panic!("binary coding expected"),
                    },
                    other => panic!("expected extended status, got {other:?}"),
                }
            }
            other => panic!("expected long CAL reply, got {other:?}"),
        }
    }
}
