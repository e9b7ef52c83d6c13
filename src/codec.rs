//! The frame recognizer and parser.
//!
//! C-Bus frames have no length field and several ambiguous terminators: a
//! response ends in CR LF, a PCI-initiated request ends in a bare CR, a
//! confirmation may arrive with no terminator at all, and `!` markers can be
//! spliced into the stream at any position. The codec therefore works on a
//! peek-only view of the transport buffer and commits to a frame boundary
//! only once it is certain — or once the repeat-hash heuristic decides the
//! buffered bytes are never going to grow a terminator.
//!
//! "No message yet" is a normal return; the caller re-drives the codec by
//! polling. [`MessageCodec::wait_for_terminator`] bounds the idle time
//! between polls by blocking until a terminator-shaped byte arrives.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::{
    channel::ByteChannel,
    context::{RequestContext, derive_request_context},
    error::CBusError,
    options::CBusOptions,
    wire::{self, CBusMessage, ConfirmationCode, FrameDirection, Reply},
};

/// How many identical polls of an unterminated buffer the codec tolerates
/// before reinterpreting the bytes. Calibrated for a ~10 ms poll interval,
/// giving roughly 150 ms of grace.
pub const DEFAULT_GIVE_UP_THRESHOLD: u32 = 15;

/// How a read attempt classified the buffered bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Classification {
    /// CR LF terminated reply; length includes the LF.
    Response(usize),
    /// CR terminated PCI-initiated frame; length includes the CR.
    RequestFrame(usize),
    /// Confirmation-only bytes committed after the give-up threshold.
    ConfirmationOnly(usize),
    /// LF with no preceding CR: drop everything and resync.
    Garbage,
    /// Not enough evidence yet.
    Pending,
}

/// Stateful frame codec bound to one byte channel.
///
/// The hash and error counters are per-connection state; every connection
/// owns an independent codec so deduplication never leaks across
/// connections.
pub struct MessageCodec<C> {
    channel: C,
    request_context: RequestContext,
    options: CBusOptions,
    give_up_threshold: u32,
    last_package_hash: AtomicU32,
    hash_encountered: AtomicU32,
    reported_server_errors: AtomicU32,
}

impl<C: ByteChannel> MessageCodec<C> {
    /// Create a codec over `channel` with the given session options.
    pub fn new(channel: C, options: CBusOptions) -> MessageCodec<C> {
        Self::with_give_up_threshold(channel, options, DEFAULT_GIVE_UP_THRESHOLD)
    }

    /// Create a codec with a custom repeat-hash give-up threshold.
    pub fn with_give_up_threshold(
        channel: C,
        options: CBusOptions,
        give_up_threshold: u32,
    ) -> MessageCodec<C> {
        MessageCodec {
            channel,
            request_context: RequestContext::NEUTRAL,
            options,
            give_up_threshold,
            last_package_hash: AtomicU32::new(0),
            hash_encountered: AtomicU32::new(0),
            reported_server_errors: AtomicU32::new(0),
        }
    }

    /// The parsing bias left behind by the last send.
    pub fn request_context(&self) -> RequestContext { self.request_context }

    /// Session options currently applied to encode and decode.
    pub fn options(&self) -> CBusOptions { self.options }

    /// Replace the session options (the handshake negotiates them in steps).
    pub fn set_options(&mut self, options: CBusOptions) { self.options = options; }

    /// Access the underlying channel.
    pub fn channel_mut(&mut self) -> &mut C { &mut self.channel }

    /// Serialize and transmit a message, recording the request context it
    /// leaves behind.
    ///
    /// # Errors
    ///
    /// [`CBusError::UnsupportedMessage`] for message kinds the PCI cannot
    /// accept; encode or transport errors otherwise. Rejection happens
    /// before any side effect.
    pub async fn send(&mut self, message: &CBusMessage) -> Result<(), CBusError> {
        let CBusMessage::ToServer(_) = message else {
            return Err(CBusError::UnsupportedMessage);
        };
        let bytes = message.encode(self.options)?;
        trace!(frame = %String::from_utf8_lossy(&bytes).trim_end(), "sending frame");
        self.channel.send(&bytes).await?;
        // Only a send that actually reached the wire may bias the next
        // receive.
        self.request_context = derive_request_context(message);
        Ok(())
    }

    /// Block until a terminator-shaped byte is buffered or `timeout`
    /// elapses. Used by the poll loop to pace receive attempts.
    ///
    /// # Errors
    ///
    /// Propagates transport errors.
    pub async fn wait_for_terminator(&mut self, timeout: Duration) -> Result<(), CBusError> {
        self.channel
            .fill_until(&|b| b == wire::CR || b == wire::LF, timeout)
            .await?;
        Ok(())
    }

    /// Attempt to recognize and decode one frame.
    ///
    /// Returns `Ok(None)` whenever the buffered bytes do not yet amount to a
    /// frame; this is the normal idle result and never an error.
    ///
    /// # Errors
    ///
    /// Only transport failures surface as errors. Undecodable frames are
    /// logged and dropped.
    pub async fn receive(&mut self) -> Result<Option<CBusMessage>, CBusError> {
        self.channel.fill().await?;
        let available = self.channel.available();
        if available == 0 {
            return Ok(None);
        }

        // An isolated checksum-failure marker at the front of the buffer is
        // reported immediately, without waiting for a terminator.
        if self.channel.peek(1)[0] == wire::ERROR_MARKER {
            self.channel.consume(1);
            debug!("leading error marker, synthesizing server error reply");
            return Ok(Some(CBusMessage::ToClient(Reply::ServerError)));
        }

        let buffered = self.channel.peek(available).to_vec();
        let classification = self.classify(&buffered);
        trace!(?classification, available, "classified buffered bytes");

        if classification == Classification::Pending {
            return Ok(None);
        }

        // Surface one synthetic error per un-reported marker before the
        // frame itself is handed out. The counter deliberately spans the
        // connection lifetime, not a single frame window.
        let markers: u32 = buffered
            .iter()
            .filter(|&&b| b == wire::ERROR_MARKER)
            .count()
            .try_into()
            .unwrap_or(u32::MAX);
        let reported = self.reported_server_errors.load(Ordering::Acquire);
        if markers > reported {
            self.reported_server_errors
                .store(reported + 1, Ordering::Release);
            debug!(
                markers,
                reported = reported + 1,
                "reporting in-stream error marker"
            );
            return Ok(Some(CBusMessage::ToClient(Reply::ServerError)));
        } else if reported > 0 {
            self.reported_server_errors.store(0, Ordering::Release);
        }

        let (length, direction) = match classification {
            Classification::Garbage => {
                let discarded = self.channel.consume(available);
                warn!(
                    discarded = %String::from_utf8_lossy(&discarded).escape_debug(),
                    "line feed without preceding carriage return, dropping buffer to resync"
                );
                return Ok(None);
            }
            Classification::Response(length) | Classification::ConfirmationOnly(length) => {
                (length, FrameDirection::Response)
            }
            Classification::RequestFrame(length) => (length, FrameDirection::Request),
            Classification::Pending => unreachable!("pending handled above"),
        };

        let raw = self.channel.consume(length);
        let sanitized: Vec<u8> = raw
            .iter()
            .copied()
            .filter(|&b| b != wire::ERROR_MARKER && b != wire::CR && b != wire::LF)
            .collect();
        Ok(self.decode_with_fallback(&sanitized, direction))
    }

    fn classify(&self, buffered: &[u8]) -> Classification {
        let mut index_of_cr = None;
        let mut index_of_lf = None;
        let mut saw_confirmation = false;
        let mut second_cr = false;
        for (index, &byte) in buffered.iter().enumerate() {
            match byte {
                wire::CR => {
                    if index_of_cr.is_some() {
                        // A second CR without an LF in between: the PCI has
                        // started a new request before terminating the last
                        // bytes.
                        second_cr = true;
                        break;
                    }
                    index_of_cr = Some(index);
                }
                wire::LF => {
                    index_of_lf = Some(index);
                    break;
                }
                byte if ConfirmationCode::from_byte(byte).is_some() => saw_confirmation = true,
                _ => {}
            }
        }

        let classification = match (index_of_cr, index_of_lf) {
            (Some(cr), Some(lf)) if lf == cr + 1 => Classification::Response(lf + 1),
            (Some(cr), Some(_)) => Classification::RequestFrame(cr + 1),
            (Some(cr), None) if second_cr || buffered.len() > cr + 1 => {
                Classification::RequestFrame(cr + 1)
            }
            (Some(_), None) | (None, None) => Classification::Pending,
            (None, Some(_)) => Classification::Garbage,
        };
        if classification != Classification::Pending {
            return classification;
        }

        // No boundary resolved: distinguish "still arriving" from "will
        // never terminate" by hashing the buffer across polls.
        let hash = crc32fast::hash(buffered);
        if hash == self.last_package_hash.load(Ordering::Acquire) {
            self.hash_encountered.fetch_add(1, Ordering::AcqRel);
        } else {
            self.last_package_hash.store(hash, Ordering::Release);
            self.hash_encountered.store(0, Ordering::Release);
        }
        if self.hash_encountered.load(Ordering::Acquire) < self.give_up_threshold {
            return Classification::Pending;
        }
        self.hash_encountered.store(0, Ordering::Release);
        debug!("giving up waiting for a line feed, reinterpreting buffered bytes");
        match index_of_cr {
            Some(cr) => Classification::RequestFrame(cr + 1),
            None if saw_confirmation => Classification::ConfirmationOnly(buffered.len()),
            None => Classification::Pending,
        }
    }

    /// Decode under the current context, then retry under a neutral context
    /// (unsolicited monitored SAL while a reply was expected), then retry as
    /// a response with neutral context and default options (monitored MMI).
    fn decode_with_fallback(
        &mut self,
        sanitized: &[u8],
        direction: FrameDirection,
    ) -> Option<CBusMessage> {
        let context = self.request_context;
        if matches!(direction, FrameDirection::Request) {
            // The device spoke out of turn; whatever bias the last request
            // left behind no longer applies.
            self.request_context = RequestContext::NEUTRAL;
        }
        let attempts: [(FrameDirection, RequestContext, CBusOptions); 3] = [
            (direction, context, self.options),
            (direction, RequestContext::NEUTRAL, self.options),
            (
                FrameDirection::Response,
                RequestContext::NEUTRAL,
                CBusOptions::NEUTRAL,
            ),
        ];
        for (attempt, (direction, context, options)) in attempts.into_iter().enumerate() {
            match CBusMessage::decode(sanitized, direction, context, options) {
                Ok(message) => return Some(message),
                Err(err) => {
                    debug!(
                        attempt,
                        %err,
                        frame = %String::from_utf8_lossy(sanitized),
                        "decode attempt failed"
                    );
                }
            }
        }
        warn!(
            frame = %String::from_utf8_lossy(sanitized),
            "frame not decodable under any hypothesis, dropping"
        );
        None
    }
}
