//! Connection configuration.
//!
//! Covers the PCI option registers written during setup, the application
//! filters, and the timing knobs of the protocol engine. The repeat-hash
//! give-up threshold and the poll interval are deliberately configured
//! together: the threshold is a cycle count whose wall-clock meaning depends
//! on how often the engine polls.

use std::time::Duration;

use crate::options::CBusOptions;

/// Monitor every application (the filter wildcard).
pub const MONITOR_ALL_APPLICATIONS: u8 = 0xFF;

/// Settings for one PCI connection.
#[derive(Clone, Debug)]
pub struct Config {
    /// First monitored-application filter written during setup.
    pub monitored_application_1: u8,
    /// Second monitored-application filter written during setup.
    pub monitored_application_2: u8,

    /// CONNECT mode bit of interface options 1.
    pub connect: bool,
    /// SMART mode bit of interface options 1.
    pub smart: bool,
    /// IDMON bit of interface options 1.
    pub idmon: bool,
    /// MONITOR bit of interface options 1.
    pub monitor: bool,
    /// SRCHK bit of interface options 1: serial checksums.
    pub srchk: bool,
    /// XON/XOFF flow control bit of interface options 1.
    pub xon_xoff: bool,
    /// EXSTAT bit of interface options 3: extended status replies.
    pub exstat: bool,
    /// PUN bit of interface options 3: power-up notification.
    pub pun: bool,
    /// LOCAL_SAL bit of interface options 3.
    pub local_sal: bool,
    /// PCN bit of interface options 3: parameter-change notification.
    pub pcn: bool,

    /// When false, `connect` reports success before setup finishes. Testing
    /// only; the connection logs a loud warning.
    pub await_setup_complete: bool,

    /// Cadence of the receive poll loop.
    pub poll_interval: Duration,
    /// Identical polls tolerated before the recognizer reinterprets an
    /// unterminated buffer.
    pub give_up_threshold: u32,
    /// Pause after each acknowledged setup step; the PCI needs time to apply
    /// the setting and flush its own echo.
    pub settle_delay: Duration,
    /// How long to wait for the reset echo.
    pub reset_timeout: Duration,
    /// How long to wait for a parameter-write acknowledge.
    pub acknowledge_timeout: Duration,
    /// Default TTL of a correlated request/response exchange.
    pub request_ttl: Duration,
    /// Correlated requests admitted concurrently. The protocol is
    /// half-duplex; leave this at 1 unless alpha correlation alone is
    /// trusted.
    pub max_concurrent_exchanges: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            monitored_application_1: MONITOR_ALL_APPLICATIONS,
            monitored_application_2: MONITOR_ALL_APPLICATIONS,
            connect: false,
            smart: true,
            idmon: false,
            monitor: true,
            srchk: false,
            xon_xoff: false,
            exstat: true,
            pun: false,
            local_sal: false,
            pcn: false,
            await_setup_complete: true,
            poll_interval: Duration::from_millis(10),
            give_up_threshold: crate::codec::DEFAULT_GIVE_UP_THRESHOLD,
            settle_delay: Duration::from_millis(100),
            reset_timeout: Duration::from_millis(500),
            acknowledge_timeout: Duration::from_secs(2),
            request_ttl: Duration::from_secs(1),
            max_concurrent_exchanges: 1,
        }
    }
}

impl Config {
    /// Interface options 1 register value.
    ///
    /// Bit layout: connect `0x01`, xon/xoff `0x02`, srchk `0x04`,
    /// smart `0x08`, monitor `0x10`, idmon `0x20`.
    #[must_use]
    pub fn interface_options_1(&self) -> u8 {
        let mut value = 0;
        if self.connect {
            value |= 0x01;
        }
        if self.xon_xoff {
            value |= 0x02;
        }
        if self.srchk {
            value |= 0x04;
        }
        if self.smart {
            value |= 0x08;
        }
        if self.monitor {
            value |= 0x10;
        }
        if self.idmon {
            value |= 0x20;
        }
        value
    }

    /// Interface options 3 register value.
    ///
    /// Bit layout: pcn `0x01`, local_sal `0x02`, pun `0x04`, exstat `0x08`.
    #[must_use]
    pub fn interface_options_3(&self) -> u8 {
        let mut value = 0;
        if self.pcn {
            value |= 0x01;
        }
        if self.local_sal {
            value |= 0x02;
        }
        if self.pun {
            value |= 0x04;
        }
        if self.exstat {
            value |= 0x08;
        }
        value
    }

    /// Session options once interface options 3 has been acknowledged.
    #[must_use]
    pub fn options_after_interface_options_3(&self) -> CBusOptions {
        CBusOptions {
            exstat: self.exstat,
            pun: self.pun,
            pcn: self.pcn,
            ..CBusOptions::NEUTRAL
        }
    }

    /// Fully negotiated session options, applied once interface options 1 is
    /// acknowledged.
    #[must_use]
    pub fn negotiated_options(&self) -> CBusOptions {
        CBusOptions {
            connect: self.connect,
            smart: self.smart,
            idmon: self.idmon,
            exstat: self.exstat,
            monitor: self.monitor,
            monall: false,
            pun: self.pun,
            pcn: self.pcn,
            srchk: self.srchk,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_monitors_everything() {
        let config = Config::default();
        assert_eq!(config.monitored_application_1, MONITOR_ALL_APPLICATIONS);
        assert_eq!(config.monitored_application_2, MONITOR_ALL_APPLICATIONS);
        assert!(config.await_setup_complete);
    }

    #[test]
    fn option_registers_pack_their_bits() {
        let config = Config {
            connect: true,
            smart: true,
            idmon: true,
            monitor: true,
            exstat: true,
            pcn: true,
            ..Config::default()
        };
        assert_eq!(config.interface_options_1(), 0x39);
        assert_eq!(config.interface_options_3(), 0x09);
    }

    #[test]
    fn negotiated_options_mirror_the_registers() {
        let config = Config::default();
        let options = config.negotiated_options();
        assert!(options.smart);
        assert!(options.monitor);
        assert!(options.exstat);
        assert!(!options.srchk);
    }
}
