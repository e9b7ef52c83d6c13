//! SAL (application level) payloads carried by point-to-multipoint commands
//! and monitored traffic.
//!
//! Lighting is decoded into typed commands; every other application's
//! payload is preserved as raw bytes so monitored traffic still reaches
//! subscribers even when the driver has no structured mapping for it.

use crate::{error::FrameError, wire::ApplicationId};

const OFF_COMMAND: u8 = 0x01;
const ON_COMMAND: u8 = 0x79;
const TERMINATE_RAMP_COMMAND: u8 = 0x09;

/// Ramp duration selector for lighting ramp commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RampRate {
    Instant,
    Over4Seconds,
    Over8Seconds,
    Over12Seconds,
    Over20Seconds,
    Over30Seconds,
    Over40Seconds,
    Over60Seconds,
}

impl RampRate {
    fn from_byte(byte: u8) -> Option<RampRate> {
        match byte {
            0x02 => Some(Self::Instant),
            0x0A => Some(Self::Over4Seconds),
            0x12 => Some(Self::Over8Seconds),
            0x1A => Some(Self::Over12Seconds),
            0x22 => Some(Self::Over20Seconds),
            0x2A => Some(Self::Over30Seconds),
            0x32 => Some(Self::Over40Seconds),
            0x3A => Some(Self::Over60Seconds),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Instant => 0x02,
            Self::Over4Seconds => 0x0A,
            Self::Over8Seconds => 0x12,
            Self::Over12Seconds => 0x1A,
            Self::Over20Seconds => 0x22,
            Self::Over30Seconds => 0x2A,
            Self::Over40Seconds => 0x32,
            Self::Over60Seconds => 0x3A,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Instant => "instant",
            Self::Over4Seconds => "4s",
            Self::Over8Seconds => "8s",
            Self::Over12Seconds => "12s",
            Self::Over20Seconds => "20s",
            Self::Over30Seconds => "30s",
            Self::Over40Seconds => "40s",
            Self::Over60Seconds => "60s",
        }
    }
}

/// A single lighting application command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LightingData {
    /// Switch a group off.
    Off { group: u8 },
    /// Switch a group on.
    On { group: u8 },
    /// Ramp a group to a level over the selected duration.
    RampToLevel { rate: RampRate, group: u8, level: u8 },
    /// Stop a ramp in progress.
    TerminateRamp { group: u8 },
}

impl LightingData {
    /// Command name used in event addresses.
    #[must_use]
    pub fn command_name(self) -> &'static str {
        match self {
            Self::Off { .. } => "off",
            Self::On { .. } => "on",
            Self::RampToLevel { .. } => "rampToLevel",
            Self::TerminateRamp { .. } => "terminateRamp",
        }
    }

    /// The group the command addresses.
    #[must_use]
    pub fn group(self) -> u8 {
        match self {
            Self::Off { group }
            | Self::On { group }
            | Self::RampToLevel { group, .. }
            | Self::TerminateRamp { group } => group,
        }
    }

    fn encode(self, out: &mut Vec<u8>) {
        match self {
            Self::Off { group } => out.extend_from_slice(&[OFF_COMMAND, group]),
            Self::On { group } => out.extend_from_slice(&[ON_COMMAND, group]),
            Self::RampToLevel { rate, group, level } => {
                out.extend_from_slice(&[rate.as_byte(), group, level]);
            }
            Self::TerminateRamp { group } => {
                out.extend_from_slice(&[TERMINATE_RAMP_COMMAND, group]);
            }
        }
    }
}

/// SAL payload of one point-to-multipoint frame. Lighting frames may chain
/// several commands back to back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SalData {
    /// Typed lighting commands.
    Lighting(Vec<LightingData>),
    /// Unmapped application payload, kept verbatim.
    Raw { bytes: Vec<u8> },
}

impl SalData {
    /// Decode a SAL payload for `application`.
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] if a lighting payload is truncated or uses an
    /// unknown command byte.
    pub fn decode(application: ApplicationId, bytes: &[u8]) -> Result<SalData, FrameError> {
        if !application.is_lighting() {
            return Ok(SalData::Raw {
                bytes: bytes.to_vec(),
            });
        }
        let mut commands = Vec::new();
        let mut remaining = bytes;
        while let Some((&command, rest)) = remaining.split_first() {
            let take = |n: usize| -> Result<&[u8], FrameError> {
                rest.get(..n).ok_or(FrameError::Truncated {
                    need: n + 1,
                    have: remaining.len(),
                })
            };
            let (decoded, consumed) = match command {
                OFF_COMMAND => (LightingData::Off { group: take(1)?[0] }, 2),
                ON_COMMAND => (LightingData::On { group: take(1)?[0] }, 2),
                TERMINATE_RAMP_COMMAND => (LightingData::TerminateRamp { group: take(1)?[0] }, 2),
                byte => match RampRate::from_byte(byte) {
                    Some(rate) => {
                        let args = take(2)?;
                        (
                            LightingData::RampToLevel {
                                rate,
                                group: args[0],
                                level: args[1],
                            },
                            3,
                        )
                    }
                    None => return Err(FrameError::UnknownSalCommand { command: byte }),
                },
            };
            commands.push(decoded);
            remaining = &remaining[consumed..];
        }
        if commands.is_empty() {
            return Err(FrameError::Empty);
        }
        Ok(SalData::Lighting(commands))
    }

    /// Encode the payload back to bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            SalData::Lighting(commands) => {
                let mut out = Vec::new();
                for command in commands {
                    command.encode(&mut out);
                }
                out
            }
            SalData::Raw { bytes } => bytes.clone(),
        }
    }

    /// Name of the leading command, used in event addresses.
    #[must_use]
    pub fn command_name(&self) -> &'static str {
        match self {
            SalData::Lighting(commands) => commands
                .first()
                .map_or("unknown", |command| command.command_name()),
            SalData::Raw { .. } => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lighting_on_round_trips() {
        let sal = SalData::decode(ApplicationId::LIGHTING, &[0x79, 0x08]).unwrap();
        assert_eq!(sal, SalData::Lighting(vec![LightingData::On { group: 8 }]));
        assert_eq!(sal.encode(), vec![0x79, 0x08]);
        assert_eq!(sal.command_name(), "on");
    }

    #[test]
    fn chained_commands_decode_in_order() {
        let bytes = [0x01, 0x03, 0x02, 0x04, 0x80];
        match SalData::decode(ApplicationId::LIGHTING, &bytes).unwrap() {
            SalData::Lighting(commands) => {
                assert_eq!(
                    commands,
                    vec![
                        LightingData::Off { group: 3 },
                        LightingData::RampToLevel {
                            rate: RampRate::Instant,
                            group: 4,
                            level: 0x80,
                        },
                    ]
                );
            }
            other => panic!("expected lighting, got {other:?}"),
        }
    }

    #[test]
    fn non_lighting_payload_is_preserved_raw() {
        let sal = SalData::decode(ApplicationId::METERING, &[0xDE, 0xAD]).unwrap();
        assert_eq!(
            sal,
            SalData::Raw {
                bytes: vec![0xDE, 0xAD],
            }
        );
    }

    #[test]
    fn truncated_ramp_is_rejected() {
        assert!(SalData::decode(ApplicationId::LIGHTING, &[0x02, 0x04]).is_err());
    }
}
