//! User-facing channel callbacks.

use ssh_mux_proto::{Bytes, ChannelRequest, DataType};

use crate::error::MuxError;

/// Callbacks installed on a child channel by its initializer.
///
/// Every callback runs on the multiplexer's executor, synchronously within
/// the dispatch that produced it; implementations must not block. Payload
/// delivery respects the channel's read gating: `data_received` and
/// `eof_received` fire in arrival order within a delivery batch, and
/// `read_complete` marks the end of one batch.
pub trait ChannelObserver: Send {
    /// The open handshake completed and the channel may carry data.
    fn channel_active(&mut self) {}

    /// One inbound payload (main stream or extended stream).
    fn data_received(&mut self, data: Bytes, data_type: DataType) {
        let _ = (data, data_type);
    }

    /// End of one delivery batch.
    fn read_complete(&mut self) {}

    /// The peer half-closed its output. Only delivered when the channel
    /// allows remote half-closure; otherwise the channel closes instead.
    fn eof_received(&mut self) {}

    /// A channel request from the peer, routed unchanged.
    fn request_received(&mut self, request: ChannelRequest) {
        let _ = request;
    }

    /// Reply to a previously sent channel request.
    fn request_reply_received(&mut self, success: bool) {
        let _ = success;
    }

    fn writability_changed(&mut self, is_writable: bool) {
        let _ = is_writable;
    }

    fn error_caught(&mut self, error: &MuxError) {
        let _ = error;
    }

    /// Terminal notification; fired at most once, after any remaining
    /// buffered events were delivered.
    fn channel_closed(&mut self) {}
}
