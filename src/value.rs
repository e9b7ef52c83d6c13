//! Decoded values and response codes surfaced to callers.
//!
//! Replies and monitored events are mapped into a small dynamic [`Value`]
//! type rather than raw protocol structs, so consumers of read results and
//! subscription events do not need to understand the wire model.

use std::collections::BTreeMap;

/// Outcome of a single correlated request, derived from the confirmation
/// code the PCI returned (or the lack of one).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseCode {
    /// The request was confirmed and, where applicable, answered.
    Ok,
    /// The request was confirmed but carried no reply payload.
    NotFound,
    /// The request or its reply was corrupt, or the PCI reported a server
    /// error for it.
    InvalidData,
    /// The PCI gave up after too many retransmissions.
    RemoteError,
    /// The PCI lost network sync while transmitting.
    RemoteBusy,
    /// No correlated reply arrived in time.
    RequestTimeout,
    /// The driver failed internally before a confirmation was seen.
    InternalError,
}

impl ResponseCode {
    /// Returns true for [`ResponseCode::Ok`].
    #[must_use]
    pub fn is_ok(self) -> bool { matches!(self, Self::Ok) }
}

/// Dynamically typed value carried by read results and subscription events.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Boolean flag.
    Bool(bool),
    /// Single byte.
    Byte(u8),
    /// Text, already trimmed of padding.
    Str(String),
    /// Raw bytes for payloads the driver does not interpret further.
    Bytes(Vec<u8>),
    /// Ordered list of values.
    List(Vec<Value>),
    /// Named fields.
    Struct(BTreeMap<String, Value>),
}

impl Value {
    /// Build a [`Value::Struct`] from `(name, value)` pairs.
    #[must_use]
    pub fn structure<const N: usize>(fields: [(&str, Value); N]) -> Self {
        Value::Struct(
            fields
                .into_iter()
                .map(|(name, value)| (name.to_owned(), value))
                .collect(),
        )
    }
}
