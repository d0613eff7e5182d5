use core::fmt;

use ssh_mux_proto::ReasonCode;

/// Errors surfaced by the multiplexer, its child channels and their
/// completion handles.
///
/// `Clone` so a single cause (e.g. transport shutdown) can fan out to every
/// pending completion.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum MuxError {
    /// The peer sent a malformed or out-of-state message.
    ///
    /// Fatal to the channel it was addressed to, never to the multiplexer.
    ProtocolViolation { reason: String },
    /// The open handshake failed, at either end.
    ChannelSetupRejected {
        reason_code: ReasonCode,
        description: String,
    },
    /// The transport connection went away.
    TcpShutdown,
    /// Write or flush after the multiplexer lost its transport handler, or on
    /// a channel that is already terminally closed.
    IoOnClosedChannel,
    /// Write after the output side was half-closed.
    OutputClosed,
    OperationUnsupported { operation: &'static str },
    /// Second close request on a channel that is already past the point of
    /// no return.
    AlreadyClosed,
}

impl MuxError {
    pub(crate) fn protocol_violation(reason: impl Into<String>) -> Self {
        MuxError::ProtocolViolation { reason: reason.into() }
    }
}

impl std::error::Error for MuxError {}

impl fmt::Display for MuxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MuxError::ProtocolViolation { reason } => write!(f, "protocol violation: {reason}"),
            MuxError::ChannelSetupRejected {
                reason_code,
                description,
            } => {
                write!(f, "channel setup rejected: {description} [{reason_code}]")
            }
            MuxError::TcpShutdown => write!(f, "transport connection was shut down"),
            MuxError::IoOnClosedChannel => write!(f, "I/O operation on closed channel"),
            MuxError::OutputClosed => write!(f, "write after local end-of-file"),
            MuxError::OperationUnsupported { operation } => write!(f, "operation unsupported: {operation}"),
            MuxError::AlreadyClosed => write!(f, "channel already closed"),
        }
    }
}
