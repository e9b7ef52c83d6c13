//! Session-wide protocol option flags.
//!
//! `CBusOptions` captures the interface option registers negotiated during
//! connection setup. The flags bias how replies are parsed (checksums,
//! extended status format) and are otherwise immutable for the life of the
//! session. A named neutral constant is passed explicitly wherever a
//! "no options" baseline is needed, so unrelated call sites never share
//! mutable defaults.

/// Negotiated feature flags for a PCI session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CBusOptions {
    /// CONNECT mode: the PCI forwards all network traffic.
    pub connect: bool,
    /// SMART mode: long-form addressing on monitored frames.
    pub smart: bool,
    /// Unit identify monitoring.
    pub idmon: bool,
    /// Extended status format for status replies.
    pub exstat: bool,
    /// Bus monitor mode.
    pub monitor: bool,
    /// Monitor every application regardless of filters.
    pub monall: bool,
    /// Power-up notification.
    pub pun: bool,
    /// Parameter-change notification.
    pub pcn: bool,
    /// Serial checksums on requests and replies.
    pub srchk: bool,
}

impl CBusOptions {
    /// All flags off. The baseline before setup negotiates anything, and the
    /// final fallback during the decode retry chain.
    pub const NEUTRAL: CBusOptions = CBusOptions {
        connect: false,
        smart: false,
        idmon: false,
        exstat: false,
        monitor: false,
        monall: false,
        pun: false,
        pcn: false,
        srchk: false,
    };
}
