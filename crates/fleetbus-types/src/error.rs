use thiserror::Error;

/// Errors from the file-backed message bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("invalid session id '{0}'")]
    InvalidSessionId(String),

    #[error("timed out waiting for bus lock at {0}")]
    LockTimeout(String),
}

/// Errors from the WebSocket frame codec and handshake.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame payload of {len} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { len: u64, limit: u64 },

    #[error("text payload is not valid utf-8")]
    InvalidUtf8,

    #[error("unsupported opcode 0x{0:x}")]
    UnsupportedOpcode(u8),

    #[error("continuation frame without a preceding data frame")]
    UnexpectedContinuation,

    #[error("data frame started before the fragmented message finished")]
    InterleavedDataFrame,

    #[error("fragmented message of {len} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { len: u64, limit: u64 },

    #[error("control frame must be final and carry at most 125 bytes, got {len}")]
    InvalidControlFrame { len: u64 },

    #[error("client frame is not masked")]
    UnmaskedClientFrame,

    #[error("server frame is masked")]
    MaskedServerFrame,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from hub lifecycle operations.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("no free port in {start}..{end}")]
    PortsExhausted { start: u16, end: u32 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}

/// Errors from the PM brain.
#[derive(Debug, Error)]
pub enum BrainError {
    #[error("PM brain is not available")]
    Unavailable,

    #[error("PM brain failed: {0}")]
    Failed(String),
}

/// Errors from session id validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("sessionId required")]
    Missing,

    #[error("invalid sessionId '{0}'")]
    InvalidId(String),

    #[error("unknown session '{0}'")]
    Unknown(String),
}

/// Errors from a connector transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("hub unreachable: {0}")]
    Unreachable(String),

    #[error("hub returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid hub response: {0}")]
    InvalidResponse(String),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}

impl TransportError {
    /// Whether the failure means the hub went away (as opposed to rejecting us).
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Unreachable(_))
            || matches!(self, TransportError::Status { status, .. } if *status >= 500)
    }
}

/// Errors surfaced by the agent-side connector.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("connector is not connected")]
    NotConnected,

    #[error("connector has been disconnected")]
    Disconnected,

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_too_large_display() {
        let err = BusError::PayloadTooLarge {
            size: 70_000,
            limit: 65_536,
        };
        assert_eq!(
            err.to_string(),
            "payload of 70000 bytes exceeds the 65536 byte limit"
        );
    }

    #[test]
    fn transient_transport_errors() {
        assert!(TransportError::Unreachable("refused".into()).is_transient());
        assert!(
            TransportError::Status {
                status: 503,
                body: String::new()
            }
            .is_transient()
        );
        assert!(
            !TransportError::Status {
                status: 403,
                body: String::new()
            }
            .is_transient()
        );
    }

    #[test]
    fn session_error_messages() {
        assert_eq!(SessionError::Missing.to_string(), "sessionId required");
        assert!(
            SessionError::InvalidId("../x".into())
                .to_string()
                .contains("../x")
        );
    }
}
