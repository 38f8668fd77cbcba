//! Load-time transport configuration.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;

/// Address/route resolution and connect handshake timeout.
pub const CONNECT_TIMEOUT_MS: u32 = 1000;

/// Maximum scatter-gather segments per request.
pub const MAX_SEGMENTS: u32 = 256;

/// Maximum in-capsule data segments appended to a command SEND.
pub const MAX_INLINE_SEGMENTS: usize = 1;

/// Upper bound on pages backing a single fast-registration MR.
pub const MAX_PAGES_PER_MR: u32 = 512;

/// Default delay between reconnect attempts, in seconds.
pub const DEF_RECONNECT_DELAY: u64 = 20;

/// Fabrics admin queue depth.
pub const AQ_DEPTH: usize = 32;

/// Async event commands are handled by the transport itself and never enter
/// the tag space the block layer sees.
pub const NR_AEN_COMMANDS: usize = 1;

/// Admin tag-set depth: the admin queue minus the reserved AEN slot.
pub const AQ_BLKMQ_DEPTH: usize = AQ_DEPTH - NR_AEN_COMMANDS;

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: u32 = 12;

/// Request timeouts handed to the tag sets; their owner runs the clock.
pub const ADMIN_TIMEOUT: Duration = Duration::from_secs(60);
pub const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// One send in every `SEND_SIG_INTERVAL` is posted signaled so the send
/// queue keeps draining; see the submit path for the flush exception.
pub const SEND_SIG_INTERVAL: u32 = 32;

/// Process-wide transport knobs, fixed once the transport is built.
///
/// Loadable from a TOML table of the same shape:
///
/// ```toml
/// register_always = true
/// reconnect_delay_secs = 5
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Use memory registration even for contiguous single-segment payloads.
    /// When set, no bulk DMA MR is allocated per device.
    pub register_always: bool,

    /// Default reconnect delay for controllers that do not override it.
    pub reconnect_delay_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            register_always: false,
            reconnect_delay_secs: DEF_RECONNECT_DELAY,
        }
    }
}

impl TransportConfig {
    /// Parse a configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Load a configuration file. Missing file means defaults.
    pub fn load_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(s) => Self::from_toml_str(&s),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = TransportConfig::default();
        assert!(!cfg.register_always);
        assert_eq!(cfg.reconnect_delay_secs, DEF_RECONNECT_DELAY);
    }

    #[test]
    fn test_parse() {
        let cfg =
            TransportConfig::from_toml_str("register_always = true\nreconnect_delay_secs = 3\n")
                .unwrap();
        assert!(cfg.register_always);
        assert_eq!(cfg.reconnect_delay_secs, 3);
    }

    #[test]
    fn test_partial_parse() {
        let cfg = TransportConfig::from_toml_str("register_always = true\n").unwrap();
        assert!(cfg.register_always);
        assert_eq!(cfg.reconnect_delay_secs, DEF_RECONNECT_DELAY);
    }
}
