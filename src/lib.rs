//! Async client driver for the Clipsal C-Bus PCI serial protocol.
//!
//! The PCI ("PC Interface") bridges a host to a C-Bus network over a
//! byte-stream transport (serial, or serial tunneled through TCP). The wire
//! protocol is half-duplex, human-readable hex with no length fields and
//! several ambiguous terminators; this crate turns it into reliable,
//! correlated request/response exchanges plus a stream of decoded
//! asynchronous status events fanned out to subscribers.
//!
//! The moving parts:
//!
//! - [`codec::MessageCodec`] recovers discrete frames from the byte stream
//!   and decodes them under the current [`context::RequestContext`] bias;
//! - [`connection::Connection`] runs the engine and dispatch tasks, the
//!   connect-time configuration handshake, and correlated exchanges;
//! - [`alpha::AlphaGenerator`] supplies the single-character request
//!   identifiers that tie confirmations back to requests;
//! - [`subscriber::SubscriberRegistry`] fans monitored SAL/MMI traffic out
//!   to registered consumers;
//! - [`reader::Reader`] and [`writer::Writer`] expose typed operations on
//!   top of the exchange machinery.

pub mod alpha;
pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod exchange;
pub mod options;
pub mod reader;
pub mod subscriber;
pub mod value;
pub mod wire;
pub mod writer;

pub use alpha::AlphaGenerator;
pub use channel::{ByteChannel, MemoryChannel, MemoryHandle, TcpChannel};
pub use codec::MessageCodec;
pub use config::Config;
pub use connection::Connection;
pub use context::{RequestContext, derive_request_context};
pub use error::{CBusError, FrameError, SetupStep};
pub use exchange::TransactionGate;
pub use options::CBusOptions;
pub use reader::{ReadCommand, ReadResult, Reader};
pub use subscriber::{
    EventConsumer,
    MonitorFilter,
    SubscriberRegistry,
    SubscriptionEvent,
    SubscriptionHandle,
};
pub use value::{ResponseCode, Value};
pub use writer::{WriteCommand, Writer};
