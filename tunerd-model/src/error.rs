//! Error types shared by the tunerd engine.

use thiserror::Error;

/// Per-request errors returned by the tuner arbiter and tuner devices.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TunerError {
    /// No tuner could serve the request after bounded retries.
    #[error("No available tuners")]
    NoAvailableTuners,

    /// Takeover blocked by an equal-or-higher priority holder.
    #[error("Priority conflict: requested={requested}, holder={holder}")]
    PriorityConflict { requested: i32, holder: i32 },

    /// The device is in terminal fault state.
    #[error("Tuner device #{0} is in fault state")]
    DeviceFault(usize),

    /// Capture process could not be spawned.
    #[error("Failed to spawn capture process: {0}")]
    SpawnFailed(String),

    /// Requested channel is not configured.
    #[error("Channel not found")]
    ChannelNotFound,

    /// Request fields that cannot be served together.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// I/O failure while talking to a device or remote host.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TunerError {
    fn from(e: std::io::Error) -> Self {
        TunerError::Io(e.to_string())
    }
}

/// Errors returned by packet filters.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterError {
    /// The filter was closed; no more writes are accepted.
    #[error("Filter closed")]
    Closed,
}

/// Decode failures of packets, tables and descriptors.
///
/// These never leave the demultiplexer; callers log and continue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Input shorter than the structure requires.
    #[error("Truncated {what}: need {need} bytes, got {got}")]
    Truncated {
        what: &'static str,
        need: usize,
        got: usize,
    },

    /// Sync byte missing.
    #[error("Invalid sync byte: 0x{0:02X}")]
    InvalidSync(u8),

    /// Unexpected table id.
    #[error("Unexpected table id: 0x{0:02X}")]
    UnexpectedTableId(u8),

    /// CRC32 mismatch.
    #[error("CRC mismatch: expected 0x{expected:08X}, got 0x{actual:08X}")]
    CrcMismatch { expected: u32, actual: u32 },

    /// Structurally invalid content.
    #[error("Malformed {0}")]
    Malformed(&'static str),
}

impl DecodeError {
    pub fn truncated(what: &'static str, need: usize, got: usize) -> Self {
        DecodeError::Truncated { what, need, got }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = TunerError::PriorityConflict {
            requested: 10,
            holder: 20,
        };
        assert_eq!(e.to_string(), "Priority conflict: requested=10, holder=20");
        assert_eq!(FilterError::Closed.to_string(), "Filter closed");
        assert_eq!(
            DecodeError::truncated("PAT", 12, 3).to_string(),
            "Truncated PAT: need 12 bytes, got 3"
        );
    }
}
