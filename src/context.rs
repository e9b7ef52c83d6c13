//! Parsing bias derived from the last sent request.
//!
//! The PCI's replies are not self-describing: the same reply container can
//! hold an identify reply or a generic reply, and a standard status payload
//! can carry binary state or levels. The only way to know is to remember
//! what was just asked. [`derive_request_context`] is recomputed on every
//! successful send; the frame recognizer retains the result as its bias for
//! the next receive, and drops back to [`RequestContext::NEUTRAL`] once a
//! device-initiated frame shows the turn is over.

use crate::wire::{CBusCommand, CBusMessage, CalData, MultiPointPayload, Request};

/// What shape of reply to expect from the next non-confirmation frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// A device-management reply is pending.
    pub expect_cal_reply: bool,
    /// A level-format status reply is pending.
    pub expect_level_status_reply: bool,
    /// The first pending reply answers an identify request.
    pub expect_identify_reply_first: bool,
}

impl RequestContext {
    /// No bias: the device may push anything. Passed explicitly wherever a
    /// neutral baseline is needed, never shared as mutable state.
    pub const NEUTRAL: RequestContext = RequestContext {
        expect_cal_reply: false,
        expect_level_status_reply: false,
        expect_identify_reply_first: false,
    };

    fn for_cal(cal: &CalData) -> RequestContext {
        RequestContext {
            expect_cal_reply: true,
            expect_level_status_reply: false,
            expect_identify_reply_first: matches!(cal, CalData::Identify { .. }),
        }
    }

    fn for_multi_point(payload: &MultiPointPayload) -> RequestContext {
        match payload {
            MultiPointPayload::Status(request) if request.is_level() => RequestContext {
                expect_level_status_reply: true,
                ..RequestContext::NEUTRAL
            },
            MultiPointPayload::Status(_) | MultiPointPayload::Sal(_) => RequestContext::NEUTRAL,
        }
    }
}

/// Derive the parsing bias an outgoing message leaves behind.
///
/// Messages arriving *from* the device always derive the neutral context:
/// monitored traffic can be pushed at any time, so no bias survives a turn
/// of the conversation.
#[must_use]
pub fn derive_request_context(message: &CBusMessage) -> RequestContext {
    match message {
        CBusMessage::ToServer(request) => match request {
            Request::Reset => RequestContext::NEUTRAL,
            Request::DirectCommand { cal, .. } => RequestContext::for_cal(cal),
            Request::Command { command, .. } => match command {
                CBusCommand::PointToPoint { cal, .. } => RequestContext::for_cal(cal),
                CBusCommand::PointToMultiPoint { payload }
                | CBusCommand::PointToPointToMultiPoint { payload, .. } => {
                    RequestContext::for_multi_point(payload)
                }
            },
        },
        CBusMessage::ToClient(_) => RequestContext::NEUTRAL,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{
        ApplicationId,
        Attribute,
        Parameter,
        SalData,
        StatusRequest,
        UnitAddress,
        request::parameter_write,
    };

    #[test]
    fn identify_direct_command_expects_identify_then_cal() {
        let message = CBusMessage::ToServer(Request::DirectCommand {
            cal: CalData::Identify {
                attribute: Attribute::Manufacturer,
            },
            alpha: None,
        });
        let context = derive_request_context(&message);
        assert!(context.expect_cal_reply);
        assert!(context.expect_identify_reply_first);
        assert!(!context.expect_level_status_reply);
    }

    #[test]
    fn other_direct_commands_expect_cal_only() {
        let message = CBusMessage::ToServer(parameter_write(Parameter::InterfaceOptions3, 0x02));
        let context = derive_request_context(&message);
        assert!(context.expect_cal_reply);
        assert!(!context.expect_identify_reply_first);
    }

    #[test]
    fn point_to_point_identify_behaves_like_direct() {
        let message = CBusMessage::ToServer(Request::Command {
            command: CBusCommand::PointToPoint {
                unit: UnitAddress(12),
                bridges: Vec::new(),
                cal: CalData::Identify {
                    attribute: Attribute::Type,
                },
            },
            alpha: Some(b'g'),
        });
        let context = derive_request_context(&message);
        assert!(context.expect_cal_reply);
        assert!(context.expect_identify_reply_first);
    }

    #[test]
    fn level_status_request_sets_level_bias() {
        let message = CBusMessage::ToServer(Request::Command {
            command: CBusCommand::PointToMultiPoint {
                payload: MultiPointPayload::Status(StatusRequest::Level {
                    application: ApplicationId::LIGHTING,
                    block_start: 0,
                }),
            },
            alpha: Some(b'h'),
        });
        assert_eq!(
            derive_request_context(&message),
            RequestContext {
                expect_level_status_reply: true,
                ..RequestContext::NEUTRAL
            }
        );
    }

    #[test]
    fn binary_status_and_sal_stay_neutral() {
        let binary = CBusMessage::ToServer(Request::Command {
            command: CBusCommand::PointToMultiPoint {
                payload: MultiPointPayload::Status(StatusRequest::BinaryState {
                    application: ApplicationId::LIGHTING,
                }),
            },
            alpha: Some(b'i'),
        });
        assert_eq!(derive_request_context(&binary), RequestContext::NEUTRAL);

        let sal = CBusMessage::ToServer(Request::Command {
            command: CBusCommand::PointToMultiPoint {
                payload: MultiPointPayload::Sal(SalData::Lighting(vec![
                    crate::wire::LightingData::On { group: 1 },
                ])),
            },
            alpha: Some(b'j'),
        });
        assert_eq!(derive_request_context(&sal), RequestContext::NEUTRAL);
    }

    #[test]
    fn messages_from_the_device_are_neutral() {
        let message = CBusMessage::ToClient(crate::wire::Reply::PowerUp);
        assert_eq!(derive_request_context(&message), RequestContext::NEUTRAL);
    }
}
