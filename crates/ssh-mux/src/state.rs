//! Per-channel lifecycle state machine.

use crate::error::MuxError;

/// Channel lifecycle states.
///
/// `Idle → Opening → Active`, then through the half-closed states to
/// `Closed`. `RemoteClosing` is transient: the reply close is emitted within
/// the same dispatch that received the peer's close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelState {
    Idle,
    Opening,
    Active,
    /// Our output is half-closed (EOF requested locally).
    SentEof,
    /// The peer half-closed its output.
    RecvEof,
    /// We emitted `channelClose` and are waiting for the peer's.
    LocalClosing,
    /// The peer's `channelClose` arrived and ours is being emitted.
    RemoteClosing,
    Closed,
}

/// Outcome of registering an EOF (either direction).
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum EofDisposition {
    /// One direction is now half-closed; the channel stays up.
    HalfClosed,
    /// Both directions are done; the caller must emit `channelClose`.
    ReadyToClose,
    /// Close is already under way; the event is only delivered upward.
    InFlight,
}

/// Outcome of the peer's `channelClose`.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum CloseDisposition {
    /// We have not sent our close yet; the caller must emit one.
    MustReply,
    /// Our close was already on the wire; the exchange is complete.
    Complete,
}

#[derive(Debug)]
pub(crate) struct ChannelStateMachine {
    state: ChannelState,
}

impl ChannelStateMachine {
    pub(crate) fn new() -> Self {
        Self {
            state: ChannelState::Idle,
        }
    }

    pub(crate) fn state(&self) -> ChannelState {
        self.state
    }

    pub(crate) fn is_closing(&self) -> bool {
        matches!(
            self.state,
            ChannelState::LocalClosing | ChannelState::RemoteClosing | ChannelState::Closed
        )
    }

    /// Local open: `channelOpen` is about to be emitted.
    pub(crate) fn begin_open(&mut self) -> Result<(), MuxError> {
        match self.state {
            ChannelState::Idle => {
                self.state = ChannelState::Opening;
                Ok(())
            }
            _ => Err(MuxError::protocol_violation("open on a channel that is not idle")),
        }
    }

    /// Peer-initiated open accepted: the channel becomes active without a
    /// confirmation round-trip on our side.
    pub(crate) fn activate_inbound(&mut self) -> Result<(), MuxError> {
        match self.state {
            ChannelState::Idle => {
                self.state = ChannelState::Active;
                Ok(())
            }
            _ => Err(MuxError::protocol_violation("activation of a channel that is not idle")),
        }
    }

    pub(crate) fn open_confirmed(&mut self) -> Result<(), MuxError> {
        match self.state {
            ChannelState::Opening => {
                self.state = ChannelState::Active;
                Ok(())
            }
            _ => Err(MuxError::protocol_violation(
                "open confirmation for a channel that is not opening",
            )),
        }
    }

    pub(crate) fn open_failed(&mut self) -> Result<(), MuxError> {
        match self.state {
            ChannelState::Opening => {
                self.state = ChannelState::Closed;
                Ok(())
            }
            _ => Err(MuxError::protocol_violation(
                "open failure for a channel that is not opening",
            )),
        }
    }

    /// Gate for user writes (data only; EOF and close have their own paths).
    pub(crate) fn check_outbound_data(&self) -> Result<(), MuxError> {
        match self.state {
            // Writes issued before activation are queued and drain later.
            ChannelState::Idle | ChannelState::Opening | ChannelState::Active | ChannelState::RecvEof => Ok(()),
            ChannelState::SentEof => Err(MuxError::OutputClosed),
            ChannelState::LocalClosing | ChannelState::RemoteClosing | ChannelState::Closed => {
                Err(MuxError::IoOnClosedChannel)
            }
        }
    }

    /// Gate for outbound channel requests and request replies.
    pub(crate) fn check_outbound_request(&self) -> Result<(), MuxError> {
        match self.state {
            ChannelState::Active | ChannelState::SentEof | ChannelState::RecvEof => Ok(()),
            ChannelState::Idle | ChannelState::Opening => Err(MuxError::protocol_violation(
                "channel request before the channel is active",
            )),
            ChannelState::LocalClosing | ChannelState::RemoteClosing | ChannelState::Closed => {
                Err(MuxError::IoOnClosedChannel)
            }
        }
    }

    /// Local half-close of the output direction.
    pub(crate) fn send_eof(&mut self) -> Result<EofDisposition, MuxError> {
        match self.state {
            ChannelState::Active => {
                self.state = ChannelState::SentEof;
                Ok(EofDisposition::HalfClosed)
            }
            ChannelState::RecvEof => {
                // Both directions are done once our EOF drains.
                self.state = ChannelState::SentEof;
                Ok(EofDisposition::ReadyToClose)
            }
            ChannelState::SentEof => Err(MuxError::OutputClosed),
            ChannelState::Idle | ChannelState::Opening => Err(MuxError::OperationUnsupported {
                operation: "half-close before the channel is active",
            }),
            ChannelState::LocalClosing | ChannelState::RemoteClosing | ChannelState::Closed => {
                Err(MuxError::AlreadyClosed)
            }
        }
    }

    /// Gate for inbound data and extended data.
    pub(crate) fn check_inbound_data(&self) -> Result<(), MuxError> {
        match self.state {
            // Data may legitimately race with our own close until the peer's
            // close arrives.
            ChannelState::Active | ChannelState::SentEof | ChannelState::LocalClosing => Ok(()),
            ChannelState::RecvEof => Err(MuxError::protocol_violation("data after EOF")),
            ChannelState::Idle | ChannelState::Opening => {
                Err(MuxError::protocol_violation("data before open confirmation"))
            }
            ChannelState::RemoteClosing | ChannelState::Closed => {
                Err(MuxError::protocol_violation("data on a closed channel"))
            }
        }
    }

    /// Gate for inbound channel requests and replies.
    pub(crate) fn check_inbound_request(&self) -> Result<(), MuxError> {
        match self.state {
            ChannelState::Active | ChannelState::SentEof | ChannelState::RecvEof | ChannelState::LocalClosing => Ok(()),
            ChannelState::Idle | ChannelState::Opening => Err(MuxError::protocol_violation(
                "channel request before open confirmation",
            )),
            ChannelState::RemoteClosing | ChannelState::Closed => {
                Err(MuxError::protocol_violation("channel request on a closed channel"))
            }
        }
    }

    pub(crate) fn recv_eof(&mut self) -> Result<EofDisposition, MuxError> {
        match self.state {
            ChannelState::Active => {
                self.state = ChannelState::RecvEof;
                Ok(EofDisposition::HalfClosed)
            }
            ChannelState::SentEof => Ok(EofDisposition::ReadyToClose),
            ChannelState::RecvEof => Err(MuxError::protocol_violation("duplicate EOF")),
            ChannelState::LocalClosing => Ok(EofDisposition::InFlight),
            ChannelState::Idle | ChannelState::Opening => {
                Err(MuxError::protocol_violation("EOF before open confirmation"))
            }
            ChannelState::RemoteClosing | ChannelState::Closed => {
                Err(MuxError::protocol_violation("EOF on a closed channel"))
            }
        }
    }

    pub(crate) fn recv_close(&mut self) -> Result<CloseDisposition, MuxError> {
        match self.state {
            ChannelState::Active | ChannelState::SentEof | ChannelState::RecvEof => {
                self.state = ChannelState::RemoteClosing;
                Ok(CloseDisposition::MustReply)
            }
            ChannelState::LocalClosing => {
                self.state = ChannelState::Closed;
                Ok(CloseDisposition::Complete)
            }
            ChannelState::Idle | ChannelState::Opening => {
                Err(MuxError::protocol_violation("close before open confirmation"))
            }
            ChannelState::RemoteClosing | ChannelState::Closed => {
                Err(MuxError::protocol_violation("close on a closed channel"))
            }
        }
    }

    /// Our `channelClose` was handed to the transport.
    pub(crate) fn close_sent(&mut self) {
        match self.state {
            ChannelState::RemoteClosing => self.state = ChannelState::Closed,
            ChannelState::Closed => {}
            _ => self.state = ChannelState::LocalClosing,
        }
    }

    /// Gate for a user-initiated full close.
    pub(crate) fn check_local_close(&self) -> Result<(), MuxError> {
        match self.state {
            ChannelState::LocalClosing | ChannelState::RemoteClosing | ChannelState::Closed => {
                Err(MuxError::AlreadyClosed)
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use super::*;

    fn active() -> ChannelStateMachine {
        let mut sm = ChannelStateMachine::new();
        sm.begin_open().unwrap();
        sm.open_confirmed().unwrap();
        sm
    }

    #[test]
    fn opening_admits_only_handshake_replies() {
        let mut sm = ChannelStateMachine::new();
        sm.begin_open().unwrap();

        assert!(sm.check_inbound_data().is_err());
        assert!(sm.recv_eof().is_err());
        assert!(sm.recv_close().is_err());

        sm.open_confirmed().unwrap();
        assert_eq!(ChannelState::Active, sm.state());
    }

    #[test]
    fn duplicate_open_confirmation_is_a_violation() {
        let mut sm = active();
        assert!(sm.open_confirmed().is_err());
    }

    #[test]
    fn sent_eof_blocks_writes_but_admits_data() {
        let mut sm = active();
        assert_eq!(EofDisposition::HalfClosed, sm.send_eof().unwrap());

        assert_eq!(Err(MuxError::OutputClosed), sm.check_outbound_data());
        assert!(sm.check_inbound_data().is_ok());
    }

    #[test]
    fn recv_eof_still_permits_writes() {
        let mut sm = active();
        assert_eq!(EofDisposition::HalfClosed, sm.recv_eof().unwrap());
        assert!(sm.check_outbound_data().is_ok());
    }

    #[test]
    fn duplicate_eof_is_a_violation() {
        let mut sm = active();
        sm.recv_eof().unwrap();
        assert!(sm.recv_eof().is_err());
    }

    #[test]
    fn both_eofs_trigger_close() {
        let mut sm = active();
        sm.send_eof().unwrap();
        assert_eq!(EofDisposition::ReadyToClose, sm.recv_eof().unwrap());

        let mut sm = active();
        sm.recv_eof().unwrap();
        assert_eq!(EofDisposition::ReadyToClose, sm.send_eof().unwrap());
    }

    #[test]
    fn close_exchange_initiated_locally() {
        let mut sm = active();
        sm.check_local_close().unwrap();
        sm.close_sent();
        assert_eq!(ChannelState::LocalClosing, sm.state());

        assert_eq!(CloseDisposition::Complete, sm.recv_close().unwrap());
        assert_eq!(ChannelState::Closed, sm.state());
    }

    #[test]
    fn close_exchange_initiated_remotely() {
        let mut sm = active();
        assert_eq!(CloseDisposition::MustReply, sm.recv_close().unwrap());
        sm.close_sent();
        assert_eq!(ChannelState::Closed, sm.state());
    }

    #[test]
    fn second_local_close_reports_already_closed() {
        let mut sm = active();
        sm.close_sent();
        assert_eq!(Err(MuxError::AlreadyClosed), sm.check_local_close());
    }
}
