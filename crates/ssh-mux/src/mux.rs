//! The connection-layer channel multiplexer.

use std::collections::{HashMap, HashSet};

use ssh_mux_proto::{
    Bytes, ChannelClose, ChannelEof, ChannelOpen, ChannelOpenConfirmation, ChannelOpenFailure, ChannelRequest,
    ChannelType, ChannelWindowAdjust, DataType, DistantChannelId, LocalChannelId, Message, ReasonCode,
};

use crate::channel::{ChannelSetup, ChildChannel, InboundEvent};
use crate::config::MuxConfig;
use crate::delegate::{complete, Completion, MuxDelegate, WriteCompletion};
use crate::error::MuxError;
use crate::id_allocator::IdAllocator;
use crate::state::{ChannelState, CloseDisposition, EofDisposition};

/// Initializer invoked for every peer-initiated channel open.
pub type InboundInitializer = Box<dyn FnMut(&mut ChannelSetup<'_>) -> Result<(), MuxError> + Send>;

/// How much of a channel to close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Full bidirectional close.
    All,
    /// Half-close our output (sends EOF).
    Output,
    /// Unsupported; present for interface completeness.
    Input,
}

/// Per-channel options settable after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOption {
    AutoRead(bool),
    AllowRemoteHalfClosure(bool),
}

/// Multiplexes many logical channels over one transport.
///
/// Every operation is synchronous and runs to completion on the owning
/// executor; asynchronous outcomes surface through completion handles.
/// Inbound messages enter through [`Multiplexer::receive`] and batched
/// delivery is driven by [`Multiplexer::read_complete`].
pub struct Multiplexer<D> {
    cfg: MuxConfig,
    delegate: D,
    channels: HashMap<LocalChannelId, ChildChannel>,
    ids: IdAllocator<LocalChannelId>,
    /// IDs torn down locally whose peer close has not arrived yet. Late
    /// messages for them are dropped instead of failing the transport.
    grace: HashSet<LocalChannelId>,
    inbound_initializer: Option<InboundInitializer>,
    parent_active: bool,
    handler_removed: bool,
}

impl<D: MuxDelegate> Multiplexer<D> {
    pub fn new(cfg: MuxConfig, delegate: D) -> Self {
        Self {
            cfg,
            delegate,
            channels: HashMap::new(),
            ids: IdAllocator::new(),
            grace: HashSet::new(),
            inbound_initializer: None,
            parent_active: true,
            handler_removed: false,
        }
    }

    /// Registers the initializer for peer-initiated channels. Without one,
    /// every inbound `channelOpen` is rejected as administratively
    /// prohibited.
    pub fn set_inbound_initializer(&mut self, initializer: InboundInitializer) {
        self.inbound_initializer = Some(initializer);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    // === transport-facing surface === //

    /// Dispatches one parsed connection-layer message.
    ///
    /// Fails only when the message cannot be attributed to a channel
    /// (unknown ID, or a handshake message out of phase). Violations on a
    /// live channel tear that channel down without failing the multiplexer,
    /// and messages for IDs in the post-close grace window are dropped.
    pub fn receive(&mut self, msg: Message) -> Result<(), MuxError> {
        trace!(?msg, "Received channel message");

        match msg {
            Message::Open(msg) => {
                self.handle_open(msg);
                Ok(())
            }
            Message::OpenConfirmation(msg) => self.handle_open_confirmation(msg),
            Message::OpenFailure(msg) => self.handle_open_failure(msg),
            Message::WindowAdjust(msg) => self.handle_window_adjust(msg),
            Message::Data(msg) => {
                let id = LocalChannelId::from(msg.recipient_channel_id);
                self.handle_data(id, msg.transfer_data, DataType::Channel)
            }
            Message::ExtendedData(msg) => {
                let id = LocalChannelId::from(msg.recipient_channel_id);
                let data_type = DataType::from_extended_code(msg.data_type_code);
                self.handle_data(id, msg.transfer_data, data_type)
            }
            Message::Eof(msg) => self.handle_eof(msg),
            Message::Close(msg) => self.handle_close(msg),
            Message::Request(msg) => self.handle_request(msg),
            Message::Success(msg) => self.handle_request_reply(LocalChannelId::from(msg.recipient_channel_id), true),
            Message::Failure(msg) => self.handle_request_reply(LocalChannelId::from(msg.recipient_channel_id), false),
        }
    }

    /// End of a transport read burst: delivers buffered events to every
    /// channel that is ready to read.
    pub fn read_complete(&mut self) {
        let ready: Vec<LocalChannelId> = self
            .channels
            .iter()
            .filter(|(_, ch)| (ch.auto_read || ch.read_armed) && !ch.pending_deliveries.is_empty())
            .map(|(id, _)| *id)
            .collect();

        for id in ready {
            if let Some(ch) = self.channels.get_mut(&id) {
                deliver_batch(ch, &mut self.delegate);
            }
        }
    }

    /// The transport went away: every child closes with `TcpShutdown`.
    pub fn parent_inactive(&mut self) {
        if !self.parent_active {
            return;
        }
        self.parent_active = false;

        info!("Parent channel inactive; closing all child channels");

        for (id, mut ch) in std::mem::take(&mut self.channels) {
            complete(ch.open_completion.take(), Err(MuxError::TcpShutdown));
            ch.writes.fail_pending(&MuxError::TcpShutdown);
            for completion in ch.close_completions.drain(..) {
                let _ = completion.send(Err(MuxError::TcpShutdown));
            }
            ch.notify_error(&MuxError::TcpShutdown);
            ch.notify_closed();
            self.ids.free(id);
        }

        for id in std::mem::take(&mut self.grace) {
            self.ids.free(id);
        }
    }

    /// The transport handler detached: writes now fail and no new channel
    /// can be created, but existing bookkeeping stays intact.
    pub fn parent_handler_removed(&mut self) {
        debug!("Parent handler removed");
        self.handler_removed = true;
    }

    // === user-facing surface === //

    /// Opens a channel towards the peer.
    ///
    /// The initializer runs synchronously against the not-yet-active
    /// channel; when it fails, `completion` resolves with its error and
    /// nothing is emitted on the wire. Otherwise `completion` is held until
    /// the peer confirms or rejects the open (or the parent goes away).
    pub fn create_child_channel(
        &mut self,
        channel_type: ChannelType,
        initializer: impl FnOnce(&mut ChannelSetup<'_>) -> Result<(), MuxError>,
        completion: Completion<LocalChannelId>,
    ) {
        if self.handler_removed {
            complete(
                Some(completion),
                Err(MuxError::protocol_violation("transport handler removed")),
            );
            return;
        }
        if !self.parent_active {
            complete(Some(completion), Err(MuxError::TcpShutdown));
            return;
        }

        let Some(local_id) = self.ids.alloc() else {
            complete(
                Some(completion),
                Err(MuxError::ChannelSetupRejected {
                    reason_code: ReasonCode::RESOURCE_SHORTAGE,
                    description: "no local channel identifier available".to_owned(),
                }),
            );
            return;
        };
        trace!("Allocated local ID {}", local_id);

        let mut channel = ChildChannel::new(local_id, channel_type, &self.cfg);

        let mut setup = ChannelSetup { channel: &mut channel };
        if let Err(error) = initializer(&mut setup) {
            debug!(%local_id, %error, "Channel initializer failed; nothing was emitted");
            complete(Some(completion), Err(error));
            self.ids.free(local_id);
            return;
        }

        if let Err(error) = channel.state.begin_open() {
            complete(Some(completion), Err(error));
            self.ids.free(local_id);
            return;
        }
        channel.open_completion = Some(completion);

        debug!(%local_id, channel_type = %channel.channel_type, "Requesting channel open");
        self.delegate.write_from_parent(
            Message::open(
                local_id,
                self.cfg.initial_window_size,
                self.cfg.maximum_packet_size,
                channel.channel_type.clone(),
            ),
            None,
        );
        self.delegate.flush_from_parent();

        self.channels.insert(local_id, channel);
    }

    /// Queues a write; nothing reaches the wire before [`Multiplexer::flush`].
    pub fn write(&mut self, id: LocalChannelId, data: Bytes, data_type: DataType, completion: Option<WriteCompletion>) {
        if self.handler_removed {
            complete(completion, Err(MuxError::IoOnClosedChannel));
            return;
        }
        let Some(ch) = self.channels.get_mut(&id) else {
            complete(completion, Err(unknown_channel(id)));
            return;
        };
        if let Err(error) = ch.state.check_outbound_data() {
            complete(completion, Err(error));
            return;
        }
        if let Some(edge) = ch.writes.push_data(data, data_type, completion) {
            ch.notify_writability(edge);
        }
    }

    /// Pushes flushed writes through flow control and to the transport.
    pub fn flush(&mut self, id: LocalChannelId) {
        if self.handler_removed {
            return;
        }
        if let Some(ch) = self.channels.get_mut(&id) {
            ch.writes.mark_flushed();
            if drain_writes(ch, &mut self.delegate) {
                self.delegate.flush_from_parent();
            }
        }
    }

    /// Drains exactly one batch of buffered inbound events; with an empty
    /// buffer, arms delivery for the next `readComplete`.
    pub fn read(&mut self, id: LocalChannelId) -> Result<(), MuxError> {
        let ch = self.channels.get_mut(&id).ok_or_else(|| unknown_channel(id))?;
        if ch.pending_deliveries.is_empty() {
            ch.read_armed = true;
        } else {
            deliver_batch(ch, &mut self.delegate);
        }
        Ok(())
    }

    /// Closes a channel, entirely or output-only.
    pub fn close(&mut self, id: LocalChannelId, mode: CloseMode, completion: Option<WriteCompletion>) {
        match mode {
            CloseMode::Input => {
                complete(
                    completion,
                    Err(MuxError::OperationUnsupported {
                        operation: "half-closing the input side",
                    }),
                );
            }
            CloseMode::Output => self.close_output(id, completion),
            CloseMode::All => self.close_all(id, completion),
        }
    }

    pub fn set_option(&mut self, id: LocalChannelId, option: ChannelOption) -> Result<(), MuxError> {
        let ch = self.channels.get_mut(&id).ok_or_else(|| unknown_channel(id))?;
        match option {
            ChannelOption::AutoRead(value) => ch.auto_read = value,
            ChannelOption::AllowRemoteHalfClosure(value) => ch.allow_remote_half_closure = value,
        }
        Ok(())
    }

    pub fn auto_read(&self, id: LocalChannelId) -> Result<bool, MuxError> {
        Ok(self.channel(id)?.auto_read)
    }

    pub fn allow_remote_half_closure(&self, id: LocalChannelId) -> Result<bool, MuxError> {
        Ok(self.channel(id)?.allow_remote_half_closure)
    }

    /// The channel type negotiated at open time.
    pub fn channel_type(&self, id: LocalChannelId) -> Result<&ChannelType, MuxError> {
        Ok(&self.channel(id)?.channel_type)
    }

    /// The peer's maximum message length for this channel (zero until the
    /// open handshake completed).
    pub fn peer_maximum_message_length(&self, id: LocalChannelId) -> Result<u32, MuxError> {
        Ok(self.channel(id)?.flow.outbound_maximum_packet())
    }

    pub fn is_writable(&self, id: LocalChannelId) -> Result<bool, MuxError> {
        Ok(self.channel(id)?.writes.is_writable())
    }

    /// Sends a channel request; replies come back through the observer.
    pub fn send_request(
        &mut self,
        id: LocalChannelId,
        request_type: &str,
        want_reply: bool,
        type_specific: Bytes,
    ) -> Result<(), MuxError> {
        if self.handler_removed {
            return Err(MuxError::IoOnClosedChannel);
        }
        let ch = self.channels.get_mut(&id).ok_or_else(|| unknown_channel(id))?;
        ch.state.check_outbound_request()?;
        let peer_id = expect_peer(ch)?;
        self.delegate
            .write_from_parent(Message::request(peer_id, request_type, want_reply, type_specific), None);
        self.delegate.flush_from_parent();
        Ok(())
    }

    /// Replies to a peer request that asked for a reply.
    pub fn send_request_reply(&mut self, id: LocalChannelId, success: bool) -> Result<(), MuxError> {
        if self.handler_removed {
            return Err(MuxError::IoOnClosedChannel);
        }
        let ch = self.channels.get_mut(&id).ok_or_else(|| unknown_channel(id))?;
        ch.state.check_outbound_request()?;
        let peer_id = expect_peer(ch)?;
        let msg = if success {
            Message::success(peer_id)
        } else {
            Message::failure(peer_id)
        };
        self.delegate.write_from_parent(msg, None);
        self.delegate.flush_from_parent();
        Ok(())
    }

    // === routing === //

    fn handle_open(&mut self, msg: ChannelOpen) {
        let peer_id = DistantChannelId::from(msg.sender_channel_id);

        let Some(initializer) = self.inbound_initializer.as_mut() else {
            debug!(%peer_id, "No inbound initializer registered; rejecting channel open");
            self.delegate.write_from_parent(
                Message::open_failure(
                    peer_id,
                    ReasonCode::ADMINISTRATIVELY_PROHIBITED,
                    "channel opens are not accepted",
                ),
                None,
            );
            self.delegate.flush_from_parent();
            return;
        };

        let Some(local_id) = self.ids.alloc() else {
            warn!(%peer_id, "No local channel identifier available for peer request");
            self.delegate.write_from_parent(
                Message::open_failure(peer_id, ReasonCode::RESOURCE_SHORTAGE, "no more channel identifiers"),
                None,
            );
            self.delegate.flush_from_parent();
            return;
        };
        trace!("Allocated ID {} for peer {}", local_id, peer_id);

        let mut channel = ChildChannel::new(local_id, msg.channel_type, &self.cfg);
        channel.peer_id = Some(peer_id);
        channel.flow.set_outbound(msg.initial_window_size, msg.maximum_packet_size);

        let mut setup = ChannelSetup { channel: &mut channel };
        match initializer(&mut setup) {
            Ok(()) => {
                // Freshly idle; activation cannot fail.
                let _ = channel.state.activate_inbound();
                self.delegate.write_from_parent(
                    Message::open_confirmation(
                        peer_id,
                        local_id,
                        self.cfg.initial_window_size,
                        self.cfg.maximum_packet_size,
                    ),
                    None,
                );
                self.delegate.flush_from_parent();
                channel.notify_active();
                debug!(%local_id, %peer_id, "Channel accepted");
                self.channels.insert(local_id, channel);
            }
            Err(error) => {
                debug!(%local_id, %peer_id, %error, "Inbound channel rejected by initializer");
                let rejection = MuxError::ChannelSetupRejected {
                    reason_code: ReasonCode::CONNECT_FAILED,
                    description: error.to_string(),
                };
                channel.notify_error(&rejection);
                self.delegate.write_from_parent(
                    Message::open_failure(peer_id, ReasonCode::CONNECT_FAILED, error.to_string()),
                    None,
                );
                self.delegate.flush_from_parent();
                self.ids.free(local_id);
            }
        }
    }

    fn handle_open_confirmation(&mut self, msg: ChannelOpenConfirmation) -> Result<(), MuxError> {
        let local_id = LocalChannelId::from(msg.recipient_channel_id);
        let Some(ch) = self.channels.get_mut(&local_id) else {
            return self.drop_or_reject(local_id);
        };

        if let Err(error) = ch.state.open_confirmed() {
            self.teardown_with_error(local_id, error.clone());
            return Err(error);
        }

        let peer_id = DistantChannelId::from(msg.sender_channel_id);
        ch.peer_id = Some(peer_id);
        ch.flow.set_outbound(msg.initial_window_size, msg.maximum_packet_size);

        complete(ch.open_completion.take(), Ok(local_id));
        ch.notify_active();
        debug!(%local_id, %peer_id, "Channel open confirmed");

        if ch.pending_close {
            // A close was requested while the handshake was in flight.
            perform_local_close(ch, &mut self.delegate);
        } else if drain_writes(ch, &mut self.delegate) {
            self.delegate.flush_from_parent();
        }

        Ok(())
    }

    fn handle_open_failure(&mut self, msg: ChannelOpenFailure) -> Result<(), MuxError> {
        let local_id = LocalChannelId::from(msg.recipient_channel_id);
        let Some(ch) = self.channels.get_mut(&local_id) else {
            return self.drop_or_reject(local_id);
        };

        if let Err(error) = ch.state.open_failed() {
            self.teardown_with_error(local_id, error.clone());
            return Err(error);
        }

        warn!(%local_id, reason = %msg.reason_code, "Channel open failed: {}", msg.description);

        let Some(mut ch) = self.channels.remove(&local_id) else {
            return Ok(());
        };
        let error = MuxError::ChannelSetupRejected {
            reason_code: msg.reason_code,
            description: msg.description,
        };
        complete(ch.open_completion.take(), Err(error.clone()));
        for completion in ch.close_completions.drain(..) {
            let _ = completion.send(Err(error.clone()));
        }
        ch.writes.fail_pending(&error);
        ch.notify_error(&error);
        self.ids.free(local_id);

        Ok(())
    }

    fn handle_window_adjust(&mut self, msg: ChannelWindowAdjust) -> Result<(), MuxError> {
        let local_id = LocalChannelId::from(msg.recipient_channel_id);
        let Some(ch) = self.channels.get_mut(&local_id) else {
            return self.drop_or_reject(local_id);
        };

        match ch.flow.add_outbound_window(msg.bytes_to_add) {
            Ok(()) => {
                if drain_writes(ch, &mut self.delegate) {
                    self.delegate.flush_from_parent();
                }
                Ok(())
            }
            Err(error) => {
                self.teardown_with_error(local_id, error);
                Ok(())
            }
        }
    }

    fn handle_data(&mut self, local_id: LocalChannelId, data: Bytes, data_type: DataType) -> Result<(), MuxError> {
        let Some(ch) = self.channels.get_mut(&local_id) else {
            return self.drop_or_reject(local_id);
        };

        let admission = ch
            .state
            .check_inbound_data()
            .and_then(|()| ch.flow.on_inbound_data(data.len()));
        match admission {
            Ok(()) => {
                ch.pending_deliveries.push_back(InboundEvent::Data { data, data_type });
                Ok(())
            }
            Err(error) => {
                self.teardown_with_error(local_id, error);
                Ok(())
            }
        }
    }

    fn handle_eof(&mut self, msg: ChannelEof) -> Result<(), MuxError> {
        let local_id = LocalChannelId::from(msg.recipient_channel_id);
        let Some(ch) = self.channels.get_mut(&local_id) else {
            return self.drop_or_reject(local_id);
        };

        match ch.state.recv_eof() {
            Ok(disposition) => {
                debug!(%local_id, "Distant peer EOFed");
                ch.pending_deliveries.push_back(InboundEvent::Eof);

                if disposition == EofDisposition::ReadyToClose {
                    // Our own EOF marker may still be queued behind writes;
                    // the close must not overtake it.
                    if ch.eof_sent {
                        if let Some(peer_id) = ch.peer_id {
                            self.delegate.write_from_parent(Message::close(peer_id), None);
                            self.delegate.flush_from_parent();
                        }
                        ch.state.close_sent();
                    } else {
                        ch.close_after_eof = true;
                    }
                }
                Ok(())
            }
            Err(error) => {
                self.teardown_with_error(local_id, error);
                Ok(())
            }
        }
    }

    fn handle_close(&mut self, msg: ChannelClose) -> Result<(), MuxError> {
        let local_id = LocalChannelId::from(msg.recipient_channel_id);

        if self.grace.remove(&local_id) {
            trace!(%local_id, "Peer close retired the grace entry");
            self.ids.free(local_id);
            return Ok(());
        }

        let Some(ch) = self.channels.get_mut(&local_id) else {
            return Err(unknown_channel(local_id));
        };

        let disposition = match ch.state.recv_close() {
            Ok(disposition) => disposition,
            Err(error) => {
                self.teardown_with_error(local_id, error);
                return Ok(());
            }
        };

        let Some(mut ch) = self.channels.remove(&local_id) else {
            return Ok(());
        };
        debug!(%local_id, "Distant peer closed");

        // Buffered events are forced out before the close notification.
        deliver_batch(&mut ch, &mut self.delegate);

        if disposition == CloseDisposition::MustReply {
            ch.writes.fail_pending(&MuxError::IoOnClosedChannel);
            if let Some(peer_id) = ch.peer_id {
                self.delegate.write_from_parent(Message::close(peer_id), None);
                self.delegate.flush_from_parent();
            }
            ch.state.close_sent();
        }

        for completion in ch.close_completions.drain(..) {
            let _ = completion.send(Ok(()));
        }
        ch.notify_closed();
        self.ids.free(local_id);
        trace!(%local_id, "Channel closed");

        Ok(())
    }

    fn handle_request(&mut self, msg: ChannelRequest) -> Result<(), MuxError> {
        let local_id = LocalChannelId::from(msg.recipient_channel_id);
        let Some(ch) = self.channels.get_mut(&local_id) else {
            return self.drop_or_reject(local_id);
        };

        match ch.state.check_inbound_request() {
            Ok(()) => {
                ch.notify_request(msg);
                Ok(())
            }
            Err(error) => {
                self.teardown_with_error(local_id, error);
                Ok(())
            }
        }
    }

    fn handle_request_reply(&mut self, local_id: LocalChannelId, success: bool) -> Result<(), MuxError> {
        let Some(ch) = self.channels.get_mut(&local_id) else {
            return self.drop_or_reject(local_id);
        };

        match ch.state.check_inbound_request() {
            Ok(()) => {
                ch.notify_request_reply(success);
                Ok(())
            }
            Err(error) => {
                self.teardown_with_error(local_id, error);
                Ok(())
            }
        }
    }

    // === close paths === //

    fn close_output(&mut self, id: LocalChannelId, completion: Option<WriteCompletion>) {
        if self.handler_removed {
            complete(completion, Err(MuxError::IoOnClosedChannel));
            return;
        }
        let Some(ch) = self.channels.get_mut(&id) else {
            complete(completion, Err(unknown_channel(id)));
            return;
        };

        match ch.state.send_eof() {
            Ok(disposition) => {
                // The EOF marker rides behind every pending write; its
                // completion resolves strictly after theirs.
                ch.writes.push_eof(completion);
                if disposition == EofDisposition::ReadyToClose {
                    ch.close_after_eof = true;
                }
                ch.writes.mark_flushed();
                if drain_writes(ch, &mut self.delegate) {
                    self.delegate.flush_from_parent();
                }
            }
            Err(error) => complete(completion, Err(error)),
        }
    }

    fn close_all(&mut self, id: LocalChannelId, completion: Option<WriteCompletion>) {
        if self.handler_removed {
            complete(completion, Err(MuxError::IoOnClosedChannel));
            return;
        }
        let Some(ch) = self.channels.get_mut(&id) else {
            complete(completion, Err(unknown_channel(id)));
            return;
        };

        if ch.state.state() == ChannelState::Opening {
            // Deferred until the confirmation or failure arrives.
            trace!(%id, "Close requested while opening; deferred");
            ch.pending_close = true;
            if let Some(completion) = completion {
                ch.close_completions.push(completion);
            }
            return;
        }

        if let Err(error) = ch.state.check_local_close() {
            complete(completion, Err(error));
            return;
        }

        if let Some(completion) = completion {
            ch.close_completions.push(completion);
        }
        perform_local_close(ch, &mut self.delegate);
    }

    // === plumbing === //

    fn channel(&self, id: LocalChannelId) -> Result<&ChildChannel, MuxError> {
        self.channels.get(&id).ok_or_else(|| unknown_channel(id))
    }

    /// Unattributable message: dropped when the ID is in its grace window,
    /// rejected otherwise.
    fn drop_or_reject(&self, id: LocalChannelId) -> Result<(), MuxError> {
        if self.grace.contains(&id) {
            trace!(%id, "Dropping message for channel in grace period");
            Ok(())
        } else {
            Err(unknown_channel(id))
        }
    }

    /// Error path: surfaces the error on the child, closes it on the wire
    /// and parks the ID in the grace set until the peer's close arrives.
    fn teardown_with_error(&mut self, id: LocalChannelId, error: MuxError) {
        let Some(mut ch) = self.channels.remove(&id) else {
            return;
        };

        warn!(%id, %error, "Tearing down channel");

        complete(ch.open_completion.take(), Err(error.clone()));
        ch.writes.fail_pending(&error);
        for completion in ch.close_completions.drain(..) {
            let _ = completion.send(Err(error.clone()));
        }
        ch.notify_error(&error);
        ch.notify_closed();

        match ch.peer_id {
            Some(peer_id) => {
                let close_already_sent = matches!(ch.state.state(), ChannelState::LocalClosing | ChannelState::Closed);
                if !close_already_sent {
                    self.delegate.write_from_parent(Message::close(peer_id), None);
                    self.delegate.flush_from_parent();
                }
                self.grace.insert(id);
            }
            // Never bound on the wire; nothing can be in flight for it.
            None => self.ids.free(id),
        }
    }
}

fn unknown_channel(id: LocalChannelId) -> MuxError {
    MuxError::protocol_violation(format!("unknown channel {id}"))
}

fn expect_peer(ch: &ChildChannel) -> Result<DistantChannelId, MuxError> {
    ch.peer_id
        .ok_or_else(|| MuxError::protocol_violation("channel has no peer binding yet"))
}

/// Emits flushed writes as far as the window allows, follows up with the
/// close that may be waiting on the EOF marker, and reports writability
/// edges. Returns whether anything was handed to the delegate.
fn drain_writes<D: MuxDelegate>(ch: &mut ChildChannel, delegate: &mut D) -> bool {
    let Some(peer_id) = ch.peer_id else {
        return false;
    };

    let outcome = ch.writes.drain(&mut ch.flow, peer_id);
    let mut emitted = !outcome.messages.is_empty();
    for (msg, completion) in outcome.messages {
        delegate.write_from_parent(msg, completion);
    }

    if outcome.eof_emitted {
        ch.eof_sent = true;
        if ch.close_after_eof && !ch.state.is_closing() {
            delegate.write_from_parent(Message::close(peer_id), None);
            ch.state.close_sent();
            emitted = true;
        }
    }

    if let Some(edge) = ch.writes.update_writability() {
        if !ch.state.is_closing() {
            ch.notify_writability(edge);
        }
    }

    emitted
}

/// Drains one delivery batch into the user pipeline, replenishes the inbound
/// window, and applies the no-half-closure close rule.
fn deliver_batch<D: MuxDelegate>(ch: &mut ChildChannel, delegate: &mut D) {
    if ch.pending_deliveries.is_empty() {
        return;
    }

    // Events arriving while the batch runs belong to the next batch.
    let events: Vec<InboundEvent> = ch.pending_deliveries.drain(..).collect();
    ch.read_armed = false;

    let mut close_channel = false;
    for event in events {
        match event {
            InboundEvent::Data { data, data_type } => ch.notify_data(data, data_type),
            InboundEvent::Eof => {
                if ch.allow_remote_half_closure {
                    ch.notify_eof();
                } else {
                    close_channel = true;
                }
            }
        }
    }
    ch.notify_read_complete();

    // Closing channels do not refresh their window.
    if !ch.state.is_closing() {
        if let Some(peer_id) = ch.peer_id {
            if let Some(delta) = ch.flow.replenish_after_delivery() {
                trace!(local_id = %ch.local_id, delta, "Replenishing inbound window");
                delegate.write_from_parent(Message::window_adjust(peer_id, delta), None);
                delegate.flush_from_parent();
            }
        }
    }

    if close_channel && ch.state.check_local_close().is_ok() {
        debug!(local_id = %ch.local_id, "Peer EOF without remote half-closure; closing channel");
        perform_local_close(ch, delegate);
    }
}

/// Full local close: flushed writes drain as far as the window allows, the
/// window-starved remainder fails, then `channelClose` goes out.
fn perform_local_close<D: MuxDelegate>(ch: &mut ChildChannel, delegate: &mut D) {
    ch.writes.mark_flushed();
    drain_writes(ch, delegate);
    ch.writes.fail_pending(&MuxError::IoOnClosedChannel);

    if !ch.state.is_closing() {
        if let Some(peer_id) = ch.peer_id {
            delegate.write_from_parent(Message::close(peer_id), None);
        }
        ch.state.close_sent();
    }
    delegate.flush_from_parent();
}
