//! Per-channel record owned by the multiplexer.

use std::collections::VecDeque;

use ssh_mux_proto::{Bytes, ChannelType, DataType, DistantChannelId, LocalChannelId};

use crate::config::MuxConfig;
use crate::delegate::{Completion, WriteCompletion};
use crate::error::MuxError;
use crate::event::ChannelObserver;
use crate::flow::{FlowController, WriteQueue};
use crate::state::ChannelStateMachine;

/// Inbound event awaiting a read signal.
///
/// Close is not queued: it force-drains this queue and is notified last.
#[derive(Debug)]
pub(crate) enum InboundEvent {
    Data { data: Bytes, data_type: DataType },
    Eof,
}

/// One logical channel. Owned by the multiplexer's channel map; the rest of
/// the system refers to it by its local ID only.
pub(crate) struct ChildChannel {
    pub(crate) local_id: LocalChannelId,
    /// Set once the open handshake has bound both sides.
    pub(crate) peer_id: Option<DistantChannelId>,
    pub(crate) channel_type: ChannelType,
    pub(crate) state: ChannelStateMachine,
    pub(crate) flow: FlowController,
    pub(crate) writes: WriteQueue,
    pub(crate) pending_deliveries: VecDeque<InboundEvent>,
    pub(crate) auto_read: bool,
    pub(crate) allow_remote_half_closure: bool,
    /// Manual-mode read issued while the buffer was empty; the next
    /// `readComplete` delivers.
    pub(crate) read_armed: bool,
    /// Full close requested while the open handshake was still pending.
    pub(crate) pending_close: bool,
    /// Our EOF marker reached the transport.
    pub(crate) eof_sent: bool,
    /// Emit `channelClose` as soon as the EOF marker drains (both
    /// directions are done).
    pub(crate) close_after_eof: bool,
    pub(crate) observer: Option<Box<dyn ChannelObserver>>,
    pub(crate) open_completion: Option<Completion<LocalChannelId>>,
    pub(crate) close_completions: Vec<WriteCompletion>,
}

impl ChildChannel {
    pub(crate) fn new(local_id: LocalChannelId, channel_type: ChannelType, cfg: &MuxConfig) -> Self {
        Self {
            local_id,
            peer_id: None,
            channel_type,
            state: ChannelStateMachine::new(),
            flow: FlowController::new(cfg.initial_window_size, cfg.maximum_packet_size),
            writes: WriteQueue::new(cfg.write_high_watermark, cfg.write_low_watermark),
            pending_deliveries: VecDeque::new(),
            auto_read: true,
            allow_remote_half_closure: false,
            read_armed: false,
            pending_close: false,
            eof_sent: false,
            close_after_eof: false,
            observer: None,
            open_completion: None,
            close_completions: Vec::new(),
        }
    }

    pub(crate) fn notify_active(&mut self) {
        if let Some(observer) = self.observer.as_mut() {
            observer.channel_active();
        }
    }

    pub(crate) fn notify_data(&mut self, data: Bytes, data_type: DataType) {
        if let Some(observer) = self.observer.as_mut() {
            observer.data_received(data, data_type);
        }
    }

    pub(crate) fn notify_read_complete(&mut self) {
        if let Some(observer) = self.observer.as_mut() {
            observer.read_complete();
        }
    }

    pub(crate) fn notify_eof(&mut self) {
        if let Some(observer) = self.observer.as_mut() {
            observer.eof_received();
        }
    }

    pub(crate) fn notify_request(&mut self, request: ssh_mux_proto::ChannelRequest) {
        if let Some(observer) = self.observer.as_mut() {
            observer.request_received(request);
        }
    }

    pub(crate) fn notify_request_reply(&mut self, success: bool) {
        if let Some(observer) = self.observer.as_mut() {
            observer.request_reply_received(success);
        }
    }

    pub(crate) fn notify_writability(&mut self, is_writable: bool) {
        if let Some(observer) = self.observer.as_mut() {
            observer.writability_changed(is_writable);
        }
    }

    pub(crate) fn notify_error(&mut self, error: &MuxError) {
        if let Some(observer) = self.observer.as_mut() {
            observer.error_caught(error);
        }
    }

    pub(crate) fn notify_closed(&mut self) {
        if let Some(observer) = self.observer.as_mut() {
            observer.channel_closed();
        }
    }
}

/// Mutable view of a channel handed to its initializer, before the channel
/// becomes active.
pub struct ChannelSetup<'a> {
    pub(crate) channel: &'a mut ChildChannel,
}

impl ChannelSetup<'_> {
    pub fn local_id(&self) -> LocalChannelId {
        self.channel.local_id
    }

    pub fn channel_type(&self) -> &ChannelType {
        &self.channel.channel_type
    }

    /// Installs the user pipeline endpoint.
    pub fn set_observer(&mut self, observer: Box<dyn ChannelObserver>) {
        self.channel.observer = Some(observer);
    }

    /// Defaults to `true`: deliveries happen on every `readComplete`.
    pub fn set_auto_read(&mut self, auto_read: bool) {
        self.channel.auto_read = auto_read;
    }

    /// Defaults to `false`: a peer EOF closes the whole channel.
    pub fn set_allow_remote_half_closure(&mut self, allow: bool) {
        self.channel.allow_remote_half_closure = allow;
    }
}
