//! Typed write operations over the correlated exchange.
//!
//! Writes share the read path's correlation machinery: alpha allocation,
//! the transaction gate, and the confirmation-to-response-code mapping. A
//! write is done once its confirmation arrives; any embedded reply payload
//! is ignored.

use std::collections::BTreeMap;

use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{
    connection::Connection,
    error::CBusError,
    reader::{MAX_BATCH, confirmation_matcher, failure_code},
    value::ResponseCode,
    wire::{
        BridgeAddress,
        CBusCommand,
        CBusMessage,
        CalData,
        LightingData,
        MultiPointPayload,
        Parameter,
        Reply,
        Request,
        SalData,
        UnitAddress,
    },
};

/// A single write operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteCommand {
    /// Issue a lighting command to the network.
    Lighting {
        bridges: Vec<BridgeAddress>,
        command: LightingData,
    },
    /// Write a configuration parameter on a unit.
    WriteParameter {
        unit: UnitAddress,
        bridges: Vec<BridgeAddress>,
        parameter: Parameter,
        value: Vec<u8>,
    },
}

/// Write-side API of a connection.
pub struct Writer<'a> {
    connection: &'a Connection,
}

impl<'a> Writer<'a> {
    pub(crate) fn new(connection: &'a Connection) -> Writer<'a> { Writer { connection } }

    /// Execute a batch of named writes sequentially, reporting a response
    /// code per name.
    ///
    /// # Errors
    ///
    /// [`CBusError::BatchTooLarge`] when more commands than alpha characters
    /// are submitted; transport failures abort the batch. Per-command
    /// timeouts and failed confirmations are reported in the result map.
    pub async fn write(
        &self,
        cancel: &CancellationToken,
        commands: Vec<(String, WriteCommand)>,
    ) -> Result<BTreeMap<String, ResponseCode>, CBusError> {
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
            let code = self.write_one(cancel, &command).await?;
            results.insert(name, code);
        }
        Ok(results)
    }

    async fn write_one(
        &self,
        cancel: &CancellationToken,
        command: &WriteCommand,
    ) -> Result<ResponseCode, CBusError> {
        let alpha = self.connection.alpha().next_alpha();
        let message = build_write_message(command, alpha);
        let matcher = confirmation_matcher(alpha);

        let transaction = self.connection.gate().begin().await;
        trace!(alpha = %(alpha as char), "write admitted");
        let outcome = self
            .connection
            .send_request(message, matcher, self.connection.request_ttl(), cancel)
            .await;
        drop(transaction);

        match outcome {
            Ok(CBusMessage::ToClient(Reply::ServerError)) => Ok(ResponseCode::InvalidData),
            Ok(CBusMessage::ToClient(Reply::Confirmation { code, .. })) => {
                Ok(if code.is_success() {
                    ResponseCode::Ok
                } else {
                    failure_code(code)
                })
            }
            Ok(_) => Ok(ResponseCode::InternalError),
            Err(CBusError::RequestTimeout) => Ok(ResponseCode::RequestTimeout),
            Err(err) => Err(err),
        }
    }
}

fn build_write_message(command: &WriteCommand, alpha: u8) -> CBusMessage {
    let request = match command {
        WriteCommand::Lighting { bridges, command } => {
            let payload = MultiPointPayload::Sal(SalData::Lighting(vec![*command]));
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
        WriteCommand::WriteParameter {
            unit,
            bridges,
            parameter,
            value,
        } => Request::Command {
            command: CBusCommand::PointToPoint {
                unit: *unit,
                bridges: bridges.clone(),
                cal: CalData::Write {
                    parameter: *parameter,
                    code: 0x00,
                    value: value.clone(),
                },
            },
            alpha: Some(alpha),
        },
    };
    CBusMessage::ToServer(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lighting_write_builds_a_multipoint_frame() {
        let message = build_write_message(
            &WriteCommand::Lighting {
                bridges: Vec::new(),
                command: LightingData::On { group: 8 },
            },
            b'g',
        );
        let encoded = message
            .encode(crate::options::CBusOptions::NEUTRAL)
            .unwrap();
        assert_eq!(encoded, b"\\0538007908g\r");
    }

    #[test]
    fn bridged_lighting_write_routes_through_bridges() {
        let message = build_write_message(
            &WriteCommand::Lighting {
                bridges: vec![BridgeAddress(2)],
                command: LightingData::Off { group: 1 },
            },
            b'h',
        );
        match message {
            CBusMessage::ToServer(Request::Command {
                command: CBusCommand::PointToPointToMultiPoint { bridges, .. },
                alpha,
            }) => {
                assert_eq!(bridges, vec![BridgeAddress(2)]);
                assert_eq!(alpha, Some(b'h'));
            }
            other => panic!("expected bridged multipoint, got {other:?}"),
        }
    }
}
