//! Typed read operations over the correlated exchange.
//!
//! Each command allocates an alpha, passes the transaction gate, sends a
//! correlated request, and waits for the confirmation carrying the same
//! alpha (or a server error reply). Confirmation codes map onto response
//! codes; a confirmed request with no embedded reply reads as "not found",
//! and a timed-out exchange reads as a timeout response rather than an
//! error.

use std::collections::BTreeMap;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    connection::{Connection, ReplyMatcher},
    error::CBusError,
    value::{ResponseCode, Value},
    wire::{
        ApplicationId,
        Attribute,
        BridgeAddress,
        CBusCommand,
        CBusMessage,
        CalData,
        ConfirmationCode,
        EncodedReply,
        MultiPointPayload,
        Parameter,
        Reply,
        Request,
        StatusPayload,
        StatusRequest,
        UnitAddress,
    },
};

/// Letters `'g'..='z'`: the most correlated requests a batch can hold.
pub const MAX_BATCH: usize = 20;

/// A single read operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadCommand {
    /// Ask a unit to identify an attribute.
    Identify {
        unit: UnitAddress,
        bridges: Vec<BridgeAddress>,
        attribute: Attribute,
    },
    /// Recall a stored parameter from a unit.
    RecallParameter {
        unit: UnitAddress,
        bridges: Vec<BridgeAddress>,
        parameter: Parameter,
        count: u8,
    },
    /// Request group status for an application.
    Status {
        application: ApplicationId,
        block_start: u8,
        level: bool,
        bridges: Vec<BridgeAddress>,
    },
}

/// Outcome of one read.
#[derive(Clone, Debug, PartialEq)]
pub struct ReadResult {
    /// How the exchange concluded.
    pub code: ResponseCode,
    /// Decoded value when the exchange succeeded with a payload.
    pub value: Option<Value>,
}

/// Read-side API of a connection.
pub struct Reader<'a> {
    connection: &'a Connection,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(connection: &'a Connection) -> Reader<'a> { Reader { connection } }

    /// Execute a batch of named reads sequentially (the gate enforces
    /// one-at-a-time submission).
    ///
    /// # Errors
    ///
    /// [`CBusError::BatchTooLarge`] when more commands than alpha characters
    /// are submitted; transport failures abort the batch. Per-command
    /// timeouts and server errors are reported in the result map instead.
    pub async fn read(
        &self,
        cancel: &CancellationToken,
        commands: Vec<(String, ReadCommand)>,
    ) -> Result<BTreeMap<String, ReadResult>, CBusError> {
        if commands.len() > MAX_BATCH {
            return Err(CBusError::BatchTooLarge {
                requested: commands.len(),
                limit: MAX_BATCH,
            });
        }
        let mut results = BTreeMap::new();
        for (name, command) in commands {
            if cancel.is_cancelled() {
                return Err(CBusError::Cancelled);
            }
            let result = self.read_one(cancel, &command).await?;
            results.insert(name, result);
        }
        Ok(results)
    }

    async fn read_one(
        &self,
        cancel: &CancellationToken,
        command: &ReadCommand,
    ) -> Result<ReadResult, CBusError> {
        let alpha = self.connection.alpha().next_alpha();
        let message = build_read_message(command, alpha);
        let matcher = confirmation_matcher(alpha);

        let transaction = self.connection.gate().begin().await;
        trace!(alpha = %(alpha as char), "read admitted");
        let outcome = self
            .connection
            .send_request(message, matcher, self.connection.request_ttl(), cancel)
            .await;
        drop(transaction);

        match outcome {
            Ok(reply) => Ok(map_reply(&reply)),
            Err(CBusError::RequestTimeout) => Ok(ReadResult {
                code: ResponseCode::RequestTimeout,
                value: None,
            }),
            Err(err) => Err(err),
        }
    }
}

/// Matcher shared by reads and writes: the server error reply, or the
/// confirmation echoing `alpha`.
pub(crate) fn confirmation_matcher(alpha: u8) -> ReplyMatcher {
    Box::new(move |message| match message {
        CBusMessage::ToClient(Reply::ServerError) => true,
        CBusMessage::ToClient(Reply::Confirmation {
            alpha: confirmed, ..
        }) => *confirmed == alpha,
        _ => false,
    })
}

/// Map a failed confirmation onto its response code.
pub(crate) fn failure_code(code: ConfirmationCode) -> ResponseCode {
    match code {
        ConfirmationCode::Success => ResponseCode::Ok,
        ConfirmationCode::TooManyRetransmissions => ResponseCode::RemoteError,
        ConfirmationCode::Corruption => ResponseCode::InvalidData,
        ConfirmationCode::SyncLoss => ResponseCode::RemoteBusy,
        ConfirmationCode::TooLong => ResponseCode::InvalidData,
    }
}

fn build_read_message(command: &ReadCommand, alpha: u8) -> CBusMessage {
    let request = match command {
        ReadCommand::Identify {
            unit,
            bridges,
            attribute,
        } => Request::Command {
            command: CBusCommand::PointToPoint {
                unit: *unit,
                bridges: bridges.clone(),
                cal: CalData::Identify {
                    attribute: *attribute,
                },
            },
            alpha: Some(alpha),
        },
        ReadCommand::RecallParameter {
            unit,
            bridges,
            parameter,
            count,
        } => Request::Command {
            command: CBusCommand::PointToPoint {
                unit: *unit,
                bridges: bridges.clone(),
                cal: CalData::Recall {
                    parameter: *parameter,
                    count: *count,
                },
            },
            alpha: Some(alpha),
        },
        ReadCommand::Status {
            application,
            block_start,
            level,
            bridges,
        } => {
            let status = if *level {
                StatusRequest::Level {
                    application: *application,
                    block_start: *block_start,
                }
            } else {
                StatusRequest::BinaryState {
                    application: *application,
                }
            };
            let payload = MultiPointPayload::Status(status);
            let command = if bridges.is_empty() {
                CBusCommand::PointToMultiPoint { payload }
            } else {
                CBusCommand::PointToPointToMultiPoint {
                    bridges: bridges.clone(),
                    payload,
                }
            };
            Request::Command {
                command,
                alpha: Some(alpha),
            }
        }
    };
    CBusMessage::ToServer(request)
}

fn map_reply(message: &CBusMessage) -> ReadResult {
    let CBusMessage::ToClient(reply) = message else {
        return ReadResult {
            code: ResponseCode::InternalError,
            value: None,
        };
    };
    match reply {
        Reply::ServerError => {
            debug!("read answered by a server failure");
            ReadResult {
                code: ResponseCode::InvalidData,
                value: None,
            }
        }
        Reply::Confirmation {
            code, embedded, ..
        } => {
            if !code.is_success() {
                return ReadResult {
                    code: failure_code(*code),
                    value: None,
                };
            }
            match embedded.as_deref() {
                None => ReadResult {
                    // Confirmed but no data came back with it.
                    code: ResponseCode::NotFound,
                    value: None,
                },
                Some(Reply::Encoded(EncodedReply::CalReply(cal_reply))) => ReadResult {
                    code: ResponseCode::Ok,
                    value: Some(cal_value(cal_reply.cal())),
                },
                Some(other) => {
                    debug!(?other, "confirmation embedded an unexpected reply");
                    ReadResult {
                        code: ResponseCode::InvalidData,
                        value: None,
                    }
                }
            }
        }
        other => {
            debug!(?other, "read matched an unexpected reply");
            ReadResult {
                code: ResponseCode::InternalError,
                value: None,
            }
        }
    }
}

fn cal_value(cal: &CalData) -> Value {
    match cal {
        CalData::IdentifyReply { attribute, data } => identify_value(*attribute, data),
        CalData::Reply { data } => Value::Bytes(data.clone()),
        CalData::Acknowledge { code, .. } => Value::Byte(*code),
        CalData::Status { payload, .. } | CalData::StatusExtended { payload, .. } => {
            status_value(payload)
        }
        other => Value::Bytes(other.encode()),
    }
}

fn identify_value(attribute: Attribute, data: &[u8]) -> Value {
    match attribute {
        // Text attributes arrive space padded.
        Attribute::Manufacturer | Attribute::Type | Attribute::FirmwareVersion => {
            Value::Str(String::from_utf8_lossy(data).trim().to_owned())
        }
        _ => Value::Bytes(data.to_vec()),
    }
}

fn status_value(payload: &StatusPayload) -> Value {
    match payload {
        StatusPayload::Binary(status_bytes) => Value::List(
            status_bytes
                .iter()
                .flat_map(|status| status.states())
                .map(|state| Value::Str(state.name().to_owned()))
                .collect(),
        ),
        StatusPayload::Levels(levels) => Value::List(
            levels
                .iter()
                .map(|level| match level {
                    crate::wire::LevelInformation::Normal(level) => Value::Byte(*level),
                    crate::wire::LevelInformation::Absent => Value::Str("is absent".to_owned()),
                    crate::wire::LevelInformation::Corrupted => Value::Str("corrupted".to_owned()),
                })
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirmation_codes_map_to_response_codes() {
        assert_eq!(
            failure_code(ConfirmationCode::TooManyRetransmissions),
            ResponseCode::RemoteError
        );
        assert_eq!(
            failure_code(ConfirmationCode::Corruption),
            ResponseCode::InvalidData
        );
        assert_eq!(
            failure_code(ConfirmationCode::SyncLoss),
            ResponseCode::RemoteBusy
        );
        assert_eq!(
            failure_code(ConfirmationCode::TooLong),
            ResponseCode::InvalidData
        );
    }

    #[test]
    fn confirm_only_reply_reads_as_not_found() {
        let reply = CBusMessage::ToClient(Reply::Confirmation {
            alpha: b'g',
            code: ConfirmationCode::Success,
            embedded: None,
        });
        assert_eq!(map_reply(&reply).code, ResponseCode::NotFound);
    }

    #[test]
    fn identify_text_attributes_are_trimmed() {
        assert_eq!(
            identify_value(Attribute::Manufacturer, b"CLIPSAL "),
            Value::Str("CLIPSAL".to_owned())
        );
    }

    #[test]
    fn matcher_requires_the_same_alpha() {
        let matcher = confirmation_matcher(b'h');
        let confirmed = |alpha| {
            CBusMessage::ToClient(Reply::Confirmation {
                alpha,
                code: ConfirmationCode::Success,
                embedded: None,
            })
        };
        assert!(matcher(&confirmed(b'h')));
        assert!(!matcher(&confirmed(b'i')));
        assert!(matcher(&CBusMessage::ToClient(Reply::ServerError)));
    }
}
