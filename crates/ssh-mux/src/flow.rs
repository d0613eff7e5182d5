//! Windowed flow control and the outbound write queue.

use std::collections::VecDeque;

use ssh_mux_proto::{Bytes, DataType, DistantChannelId, Message};

use crate::delegate::{complete, WriteCompletion};
use crate::error::MuxError;

/// Byte accounting for one channel, both directions.
///
/// The outbound side is unknown until the open handshake finishes and is
/// installed with [`FlowController::set_outbound`].
#[derive(Debug)]
pub(crate) struct FlowController {
    outbound_window: u32,
    outbound_maximum_packet: u32,
    inbound_window: u32,
    inbound_initial_window: u32,
    local_maximum_packet: u32,
}

impl FlowController {
    pub(crate) fn new(local_initial_window: u32, local_maximum_packet: u32) -> Self {
        Self {
            outbound_window: 0,
            outbound_maximum_packet: 0,
            inbound_window: local_initial_window,
            inbound_initial_window: local_initial_window,
            local_maximum_packet,
        }
    }

    pub(crate) fn set_outbound(&mut self, window: u32, maximum_packet: u32) {
        self.outbound_window = window;
        self.outbound_maximum_packet = maximum_packet;
    }

    pub(crate) fn outbound_window(&self) -> u32 {
        self.outbound_window
    }

    pub(crate) fn outbound_maximum_packet(&self) -> u32 {
        self.outbound_maximum_packet
    }

    /// Applies a `channelWindowAdjust` from the peer.
    pub(crate) fn add_outbound_window(&mut self, increment: u32) -> Result<(), MuxError> {
        self.outbound_window = self
            .outbound_window
            .checked_add(increment)
            .ok_or_else(|| MuxError::protocol_violation("window adjust overflows the outbound window"))?;
        Ok(())
    }

    fn consume_outbound(&mut self, len: u32) {
        debug_assert!(len <= self.outbound_window);
        self.outbound_window -= len;
    }

    /// Accounts one inbound payload against our advertised window.
    pub(crate) fn on_inbound_data(&mut self, len: usize) -> Result<(), MuxError> {
        if len > self.local_maximum_packet as usize {
            return Err(MuxError::protocol_violation("data exceeds the maximum packet size"));
        }
        let len = u32::try_from(len).map_err(|_| MuxError::protocol_violation("data length does not fit in u32"))?;
        self.inbound_window = self
            .inbound_window
            .checked_sub(len)
            .ok_or_else(|| MuxError::protocol_violation("data exceeds the inbound window"))?;
        Ok(())
    }

    /// Called after payloads were handed to the user pipeline.
    ///
    /// Once the remaining window has fallen to half the advertised initial
    /// window, it is topped back up and the delta to announce is returned.
    pub(crate) fn replenish_after_delivery(&mut self) -> Option<u32> {
        if self.inbound_window <= self.inbound_initial_window / 2 {
            let delta = self.inbound_initial_window - self.inbound_window;
            self.inbound_window = self.inbound_initial_window;
            Some(delta)
        } else {
            None
        }
    }
}

#[derive(Debug)]
enum PendingWrite {
    Data {
        data: Bytes,
        data_type: DataType,
        completion: Option<WriteCompletion>,
        flushed: bool,
    },
    /// Local half-close marker; always the last item of the queue.
    Eof {
        completion: Option<WriteCompletion>,
        flushed: bool,
    },
}

/// What a drain pass produced, in emission order.
#[derive(Debug, Default)]
pub(crate) struct DrainOutcome {
    pub(crate) messages: Vec<(Message, Option<WriteCompletion>)>,
    pub(crate) eof_emitted: bool,
}

/// Outbound write queue with watermark-based writability tracking.
///
/// Writes enter unflushed; a flush marks everything currently queued. A
/// drain pass emits flushed items in FIFO order as far as the window allows,
/// splitting items against both the window and the peer's maximum packet
/// size. A window-starved item stays at the head and is split further on the
/// next pass.
#[derive(Debug)]
pub(crate) struct WriteQueue {
    items: VecDeque<PendingWrite>,
    queued_bytes: usize,
    high_watermark: usize,
    low_watermark: usize,
    is_writable: bool,
}

impl WriteQueue {
    pub(crate) fn new(high_watermark: usize, low_watermark: usize) -> Self {
        Self {
            items: VecDeque::new(),
            queued_bytes: 0,
            high_watermark,
            low_watermark,
            is_writable: true,
        }
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.is_writable
    }

    pub(crate) fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Queues a write. Returns the new writability when an edge was crossed.
    pub(crate) fn push_data(
        &mut self,
        data: Bytes,
        data_type: DataType,
        completion: Option<WriteCompletion>,
    ) -> Option<bool> {
        self.queued_bytes += data.len();
        self.items.push_back(PendingWrite::Data {
            data,
            data_type,
            completion,
            flushed: false,
        });
        self.update_writability()
    }

    pub(crate) fn push_eof(&mut self, completion: Option<WriteCompletion>) {
        self.items.push_back(PendingWrite::Eof {
            completion,
            flushed: false,
        });
    }

    pub(crate) fn mark_flushed(&mut self) {
        for item in &mut self.items {
            match item {
                PendingWrite::Data { flushed, .. } | PendingWrite::Eof { flushed, .. } => *flushed = true,
            }
        }
    }

    /// Emits flushed items as far as the outbound window allows.
    pub(crate) fn drain(&mut self, flow: &mut FlowController, peer_id: DistantChannelId) -> DrainOutcome {
        let mut outcome = DrainOutcome::default();

        loop {
            let Some(front) = self.items.front_mut() else { break };

            match front {
                PendingWrite::Data { flushed: false, .. } | PendingWrite::Eof { flushed: false, .. } => break,
                PendingWrite::Data {
                    data,
                    data_type,
                    completion,
                    ..
                } => {
                    if data.is_empty() {
                        // Nothing to put on the wire; resolve in order.
                        complete(completion.take(), Ok(()));
                        self.items.pop_front();
                        continue;
                    }

                    let budget = (flow.outbound_window() as usize).min(flow.outbound_maximum_packet() as usize);
                    if budget == 0 {
                        break;
                    }

                    let chunk_len = data.len().min(budget);
                    let chunk = data.split_to(chunk_len);
                    #[allow(clippy::cast_possible_truncation, reason = "chunk_len is bounded by a u32 window")]
                    flow.consume_outbound(chunk_len as u32);
                    self.queued_bytes -= chunk_len;

                    let is_last_chunk = data.is_empty();
                    let completion = if is_last_chunk { completion.take() } else { None };

                    let msg = match data_type.extended_code() {
                        None => Message::data(peer_id, chunk),
                        Some(code) => Message::extended_data(peer_id, code, chunk),
                    };
                    outcome.messages.push((msg, completion));

                    if is_last_chunk {
                        self.items.pop_front();
                    }
                }
                PendingWrite::Eof { completion, .. } => {
                    // EOF consumes no window and follows every prior write.
                    let completion = completion.take();
                    outcome.messages.push((Message::eof(peer_id), completion));
                    outcome.eof_emitted = true;
                    self.items.pop_front();
                }
            }
        }

        outcome
    }

    /// Fails everything still queued, e.g. on close or teardown.
    pub(crate) fn fail_pending(&mut self, error: &MuxError) {
        for item in self.items.drain(..) {
            match item {
                PendingWrite::Data { completion, .. } | PendingWrite::Eof { completion, .. } => {
                    complete(completion, Err(error.clone()));
                }
            }
        }
        self.queued_bytes = 0;
    }

    /// Re-evaluates writability; `Some` when an edge was crossed.
    pub(crate) fn update_writability(&mut self) -> Option<bool> {
        if self.is_writable && self.queued_bytes > self.high_watermark {
            self.is_writable = false;
            Some(false)
        } else if !self.is_writable && self.queued_bytes < self.low_watermark {
            self.is_writable = true;
            Some(true)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use super::*;

    fn payload_lengths(outcome: &DrainOutcome) -> Vec<usize> {
        outcome
            .messages
            .iter()
            .map(|(msg, _)| match msg {
                Message::Data(data) => data.transfer_data.len(),
                Message::ExtendedData(data) => data.transfer_data.len(),
                Message::Eof(_) => 0,
                other => panic!("unexpected message in drain outcome: {other:?}"),
            })
            .collect()
    }

    #[test]
    fn drain_chunks_against_window_and_packet_size() {
        let mut flow = FlowController::new(1024, 1024);
        flow.set_outbound(5, 3);
        let mut queue = WriteQueue::new(5, 2);

        queue.push_data(Bytes::from_static(&[0; 6]), DataType::Channel, None);
        queue.mark_flushed();

        let outcome = queue.drain(&mut flow, DistantChannelId::from(1));
        assert_eq!(vec![3, 2], payload_lengths(&outcome));
        assert_eq!(0, flow.outbound_window());
        assert_eq!(1, queue.queued_bytes());
    }

    #[test]
    fn window_adjust_splits_the_head_item_further() {
        let mut flow = FlowController::new(1024, 1024);
        flow.set_outbound(0, 4);
        let mut queue = WriteQueue::new(1024, 512);

        queue.push_data(Bytes::from_static(&[0; 10]), DataType::Channel, None);
        queue.mark_flushed();
        assert!(queue.drain(&mut flow, DistantChannelId::from(1)).messages.is_empty());

        flow.add_outbound_window(3).unwrap();
        let outcome = queue.drain(&mut flow, DistantChannelId::from(1));
        assert_eq!(vec![3], payload_lengths(&outcome));

        flow.add_outbound_window(100).unwrap();
        let outcome = queue.drain(&mut flow, DistantChannelId::from(1));
        assert_eq!(vec![4, 3], payload_lengths(&outcome));
        assert_eq!(0, queue.queued_bytes());
    }

    #[test]
    fn unflushed_writes_never_drain() {
        let mut flow = FlowController::new(1024, 1024);
        flow.set_outbound(100, 100);
        let mut queue = WriteQueue::new(1024, 512);

        queue.push_data(Bytes::from_static(&[0; 10]), DataType::Channel, None);
        assert!(queue.drain(&mut flow, DistantChannelId::from(1)).messages.is_empty());
        assert_eq!(10, queue.queued_bytes());
    }

    #[test]
    fn eof_marker_follows_all_writes_and_consumes_no_window() {
        let mut flow = FlowController::new(1024, 1024);
        flow.set_outbound(10, 10);
        let mut queue = WriteQueue::new(1024, 512);

        queue.push_data(Bytes::from_static(&[0; 4]), DataType::Channel, None);
        queue.push_eof(None);
        queue.mark_flushed();

        let outcome = queue.drain(&mut flow, DistantChannelId::from(1));
        assert_eq!(vec![4, 0], payload_lengths(&outcome));
        assert!(outcome.eof_emitted);
        assert!(matches!(outcome.messages[1].0, Message::Eof(_)));
        assert_eq!(6, flow.outbound_window());
    }

    #[test]
    fn eof_marker_waits_for_window_starved_writes() {
        let mut flow = FlowController::new(1024, 1024);
        flow.set_outbound(2, 10);
        let mut queue = WriteQueue::new(1024, 512);

        queue.push_data(Bytes::from_static(&[0; 4]), DataType::Channel, None);
        queue.push_eof(None);
        queue.mark_flushed();

        let outcome = queue.drain(&mut flow, DistantChannelId::from(1));
        assert_eq!(vec![2], payload_lengths(&outcome));
        assert!(!outcome.eof_emitted);

        flow.add_outbound_window(2).unwrap();
        let outcome = queue.drain(&mut flow, DistantChannelId::from(1));
        assert!(outcome.eof_emitted);
    }

    #[test]
    fn writability_toggles_at_the_edges_only() {
        let mut queue = WriteQueue::new(5, 2);

        assert_eq!(None, queue.push_data(Bytes::from_static(&[0; 4]), DataType::Channel, None));
        assert!(queue.is_writable());

        assert_eq!(
            Some(false),
            queue.push_data(Bytes::from_static(&[0; 4]), DataType::Channel, None)
        );
        assert!(!queue.is_writable());

        let mut flow = FlowController::new(1024, 1024);
        flow.set_outbound(7, 16);
        queue.mark_flushed();
        let _ = queue.drain(&mut flow, DistantChannelId::from(1));

        // One byte left queued: below the low watermark again.
        assert_eq!(1, queue.queued_bytes());
        assert_eq!(Some(true), queue.update_writability());
    }

    #[test]
    fn outbound_window_overflow_is_a_violation() {
        let mut flow = FlowController::new(1024, 1024);
        flow.set_outbound(u32::MAX - 1, 1024);
        assert!(flow.add_outbound_window(2).is_err());
    }

    #[test]
    fn inbound_window_underflow_is_a_violation() {
        let mut flow = FlowController::new(4, 1024);
        flow.on_inbound_data(3).unwrap();
        assert!(flow.on_inbound_data(2).is_err());
    }

    #[test]
    fn oversized_inbound_data_is_a_violation() {
        let mut flow = FlowController::new(1 << 20, 16);
        assert!(flow.on_inbound_data(17).is_err());
    }

    #[test]
    fn replenishment_restores_the_initial_window_at_half() {
        let mut flow = FlowController::new(100, 1024);

        flow.on_inbound_data(40).unwrap();
        assert_eq!(None, flow.replenish_after_delivery());

        flow.on_inbound_data(20).unwrap();
        assert_eq!(Some(60), flow.replenish_after_delivery());
        flow.on_inbound_data(100).unwrap();
        assert_eq!(Some(100), flow.replenish_after_delivery());
    }
}
