#![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

//! Channel lifecycle and routing behavior of the multiplexer.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use common::*;
use ssh_mux::{
    ChannelOption, ChannelType, CloseMode, DataType, DistantChannelId, LocalChannelId, Message, MuxConfig, MuxError,
    Multiplexer,
};
use ssh_mux_proto::{
    Bytes, ChannelClose, ChannelEof, ChannelOpenConfirmation, ChannelOpenFailure, ChannelRequest, ChannelSuccess,
    ChannelWindowAdjust, ReasonCode,
};
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

const WIN: u32 = 1 << 24;

fn new_mux() -> (Multiplexer<RecordingDelegate>, RecordingDelegate) {
    let delegate = RecordingDelegate::new();
    let mux = Multiplexer::new(MuxConfig::default(), delegate.clone());
    (mux, delegate)
}

/// Peer-side view of one of our local channel IDs.
fn as_peer(id: LocalChannelId) -> DistantChannelId {
    DistantChannelId::from(u32::from(id))
}

fn peer_data(id: LocalChannelId, bytes: &'static [u8]) -> Message {
    Message::data(as_peer(id), Bytes::from_static(bytes))
}

fn peer_eof(id: LocalChannelId) -> Message {
    Message::Eof(ChannelEof {
        recipient_channel_id: u32::from(id),
    })
}

fn peer_close(id: LocalChannelId) -> Message {
    Message::Close(ChannelClose {
        recipient_channel_id: u32::from(id),
    })
}

fn peer_window_adjust(id: LocalChannelId, bytes_to_add: u32) -> Message {
    Message::WindowAdjust(ChannelWindowAdjust {
        recipient_channel_id: u32::from(id),
        bytes_to_add,
    })
}

fn confirmation(id: LocalChannelId, peer_id: u32, window: u32, max_packet: u32) -> Message {
    Message::OpenConfirmation(ChannelOpenConfirmation {
        recipient_channel_id: u32::from(id),
        sender_channel_id: peer_id,
        initial_window_size: window,
        maximum_packet_size: max_packet,
    })
}

/// Opens a local channel and returns its ID, observer log and open promise.
fn open_local(
    mux: &mut Multiplexer<RecordingDelegate>,
    delegate: &RecordingDelegate,
) -> (
    LocalChannelId,
    EventLog,
    ssh_mux::CompletionReceiver<LocalChannelId>,
) {
    let observer = RecordingObserver::new();
    let log = observer.handle();
    let (completion, rx) = oneshot::channel();
    mux.create_child_channel(
        ChannelType::Session,
        move |setup| {
            setup.set_observer(Box::new(observer));
            Ok(())
        },
        completion,
    );

    let sent = delegate.take();
    let id = match &sent[..] {
        [Message::Open(open)] => {
            assert_eq!(WIN, open.initial_window_size);
            assert_eq!(WIN, open.maximum_packet_size);
            LocalChannelId::from(open.sender_channel_id)
        }
        other => panic!("expected exactly one channelOpen, got {other:?}"),
    };

    (id, log, rx)
}

/// Opens a local channel and brings it active with the given peer window.
fn open_active(
    mux: &mut Multiplexer<RecordingDelegate>,
    delegate: &RecordingDelegate,
    window: u32,
    max_packet: u32,
) -> (LocalChannelId, EventLog) {
    let (id, log, mut rx) = open_local(mux, delegate);
    mux.receive(confirmation(id, 99, window, max_packet)).unwrap();
    assert_eq!(Ok(id), rx.try_recv().unwrap());
    assert_eq!(vec![Event::Active], log.take());
    (id, log)
}

/// Registers an inbound initializer and lets the peer open a channel.
fn open_inbound(
    mux: &mut Multiplexer<RecordingDelegate>,
    delegate: &RecordingDelegate,
    auto_read: bool,
    allow_remote_half_closure: bool,
) -> (LocalChannelId, EventLog) {
    let slot = Arc::new(Mutex::new(None));
    mux.set_inbound_initializer(observing_initializer(Arc::clone(&slot), move |setup| {
        setup.set_auto_read(auto_read);
        setup.set_allow_remote_half_closure(allow_remote_half_closure);
    }));

    mux.receive(Message::open(LocalChannelId::from(7), WIN, WIN, ChannelType::Session))
        .unwrap();

    let sent = delegate.take();
    let id = match &sent[..] {
        [Message::OpenConfirmation(confirmation)] => {
            assert_eq!(7, confirmation.recipient_channel_id);
            LocalChannelId::from(confirmation.sender_channel_id)
        }
        other => panic!("expected exactly one channelOpenConfirmation, got {other:?}"),
    };

    let log = slot.lock().unwrap().take().unwrap();
    assert_eq!(vec![Event::Active], log.take());
    (id, log)
}

// === open handshake === //

#[test]
fn inbound_open_is_confirmed_once() {
    let (mut mux, delegate) = new_mux();
    let slot = Arc::new(Mutex::new(None));
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&invocations);
    mux.set_inbound_initializer(observing_initializer(Arc::clone(&slot), move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    mux.receive(Message::open(LocalChannelId::from(1), WIN, WIN, ChannelType::Session))
        .unwrap();

    let sent = delegate.take();
    match &sent[..] {
        [Message::OpenConfirmation(msg)] => {
            assert_eq!(1, msg.recipient_channel_id);
            assert_eq!(0, msg.sender_channel_id);
            assert_eq!(WIN, msg.initial_window_size);
            assert_eq!(WIN, msg.maximum_packet_size);
        }
        other => panic!("expected channelOpenConfirmation, got {other:?}"),
    }
    assert_eq!(1, invocations.load(Ordering::SeqCst));
    assert_eq!(1, mux.channel_count());
}

#[test]
fn inbound_open_rejected_by_initializer() {
    let (mut mux, delegate) = new_mux();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in_init = Arc::clone(&seen);
    mux.set_inbound_initializer(Box::new(move |setup| {
        let observer = RecordingObserver::new();
        seen_in_init.lock().unwrap().push(observer.handle());
        setup.set_observer(Box::new(observer));
        Err(MuxError::OperationUnsupported {
            operation: "sessions are not served here",
        })
    }));

    mux.receive(Message::open(LocalChannelId::from(4), WIN, WIN, ChannelType::Session))
        .unwrap();

    let sent = delegate.take();
    match &sent[..] {
        [Message::OpenFailure(failure)] => {
            assert_eq!(4, failure.recipient_channel_id);
            assert_eq!(ReasonCode::CONNECT_FAILED, failure.reason_code);
        }
        other => panic!("expected channelOpenFailure, got {other:?}"),
    }

    let log = seen.lock().unwrap().pop().unwrap();
    match &log.take()[..] {
        [Event::Error(MuxError::ChannelSetupRejected { reason_code, .. })] => {
            assert_eq!(&ReasonCode::CONNECT_FAILED, reason_code);
        }
        other => panic!("expected a setup-rejected error event, got {other:?}"),
    }
    assert_eq!(0, mux.channel_count());
}

#[test]
fn inbound_open_without_initializer_is_administratively_prohibited() {
    let (mut mux, delegate) = new_mux();

    mux.receive(Message::open(LocalChannelId::from(9), WIN, WIN, ChannelType::Session))
        .unwrap();

    let sent = delegate.take();
    match &sent[..] {
        [Message::OpenFailure(failure)] => {
            assert_eq!(9, failure.recipient_channel_id);
            assert_eq!(ReasonCode::ADMINISTRATIVELY_PROHIBITED, failure.reason_code);
        }
        other => panic!("expected channelOpenFailure, got {other:?}"),
    }
}

#[test]
fn local_open_completes_on_confirmation() {
    let (mut mux, delegate) = new_mux();
    let (id, log, mut rx) = open_local(&mut mux, &delegate);

    // The promise is held until the peer answers.
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

    mux.receive(confirmation(id, 42, 2048, 1024)).unwrap();
    assert_eq!(Ok(id), rx.try_recv().unwrap());
    assert_eq!(vec![Event::Active], log.take());
    assert_eq!(Ok(1024), mux.peer_maximum_message_length(id));
    assert_eq!(Ok(&ChannelType::Session), mux.channel_type(id));
}

#[test]
fn local_open_failure_rejects_the_promise() {
    let (mut mux, delegate) = new_mux();
    let (id, log, mut rx) = open_local(&mut mux, &delegate);

    mux.receive(Message::OpenFailure(ChannelOpenFailure::new(
        as_peer(id),
        ReasonCode::ADMINISTRATIVELY_PROHIBITED,
        "not allowed",
    )))
    .unwrap();

    match rx.try_recv().unwrap() {
        Err(MuxError::ChannelSetupRejected {
            reason_code,
            description,
        }) => {
            assert_eq!(ReasonCode::ADMINISTRATIVELY_PROHIBITED, reason_code);
            assert_eq!("not allowed", description);
        }
        other => panic!("expected setup rejection, got {other:?}"),
    }

    match &log.take()[..] {
        [Event::Error(MuxError::ChannelSetupRejected { .. })] => {}
        other => panic!("expected an error event, got {other:?}"),
    }
    assert_eq!(0, mux.channel_count());
    assert!(delegate.is_empty());
}

#[test]
fn failing_initializer_emits_nothing() {
    let (mut mux, delegate) = new_mux();
    let (completion, mut rx) = oneshot::channel();

    mux.create_child_channel(
        ChannelType::Session,
        |_setup| {
            Err(MuxError::OperationUnsupported {
                operation: "nope",
            })
        },
        completion,
    );

    assert!(delegate.is_empty());
    assert!(matches!(
        rx.try_recv().unwrap(),
        Err(MuxError::OperationUnsupported { .. })
    ));
    assert_eq!(0, mux.channel_count());
}

#[test]
fn duplicate_open_confirmation_is_rejected() {
    let (mut mux, delegate) = new_mux();
    let (id, log) = open_active(&mut mux, &delegate, WIN, WIN);

    let result = mux.receive(confirmation(id, 99, WIN, WIN));
    assert!(matches!(result, Err(MuxError::ProtocolViolation { .. })));

    // The channel was torn down and closed on the wire.
    assert!(matches!(&delegate.take()[..], [Message::Close(_)]));
    let events = log.take();
    assert!(matches!(events[..], [Event::Error(_), Event::Closed]));
}

// === data and read gating === //

#[test]
fn data_is_gated_until_read_complete() {
    let (mut mux, delegate) = new_mux();
    let (id, log) = open_inbound(&mut mux, &delegate, true, false);

    mux.receive(peer_data(id, b"one")).unwrap();
    mux.receive(peer_data(id, b"two")).unwrap();
    assert!(log.is_empty());

    mux.read_complete();
    assert_eq!(
        vec![
            Event::Data(b"one".to_vec(), DataType::Channel),
            Event::Data(b"two".to_vec(), DataType::Channel),
            Event::ReadComplete,
        ],
        log.take()
    );
}

#[test]
fn extended_data_types_are_preserved() {
    let (mut mux, delegate) = new_mux();
    let (id, log) = open_inbound(&mut mux, &delegate, true, false);

    mux.receive(Message::extended_data(as_peer(id), 1, Bytes::from_static(b"err")))
        .unwrap();
    mux.receive(Message::extended_data(as_peer(id), 99, Bytes::from_static(b"odd")))
        .unwrap();
    mux.read_complete();

    assert_eq!(
        vec![
            Event::Data(b"err".to_vec(), DataType::Stderr),
            Event::Data(b"odd".to_vec(), DataType::Other(99)),
            Event::ReadComplete,
        ],
        log.take()
    );
}

#[test]
fn unknown_channel_is_a_protocol_violation() {
    let (mut mux, _delegate) = new_mux();
    let result = mux.receive(peer_data(LocalChannelId::from(42), b"stray"));
    assert!(matches!(result, Err(MuxError::ProtocolViolation { .. })));
}

#[test]
fn data_after_peer_eof_is_a_violation() {
    let (mut mux, delegate) = new_mux();
    let (id, log) = open_inbound(&mut mux, &delegate, true, true);

    mux.receive(peer_eof(id)).unwrap();
    mux.receive(peer_data(id, b"late")).unwrap();

    // Channel-level violation: torn down, multiplexer unaffected.
    assert!(matches!(&delegate.take()[..], [Message::Close(_)]));
    let events = log.take();
    assert!(matches!(events[..], [Event::Error(MuxError::ProtocolViolation { .. }), Event::Closed]));
}

#[test]
fn inbound_window_underflow_closes_the_channel() {
    let delegate = RecordingDelegate::new();
    let cfg = MuxConfig {
        initial_window_size: 4,
        ..MuxConfig::default()
    };
    let mut mux = Multiplexer::new(cfg, delegate.clone());
    let (id, log) = open_inbound(&mut mux, &delegate, true, false);

    mux.receive(peer_data(id, b"abc")).unwrap();
    mux.receive(peer_data(id, b"de")).unwrap();

    assert!(matches!(&delegate.take()[..], [Message::Close(_)]));
    let events = log.take();
    assert!(matches!(events[..], [Event::Error(MuxError::ProtocolViolation { .. }), Event::Closed]));
}

#[test]
fn oversized_inbound_packet_closes_the_channel() {
    let delegate = RecordingDelegate::new();
    let cfg = MuxConfig {
        maximum_packet_size: 4,
        ..MuxConfig::default()
    };
    let mut mux = Multiplexer::new(cfg, delegate.clone());
    let (id, log) = open_inbound(&mut mux, &delegate, true, false);

    mux.receive(peer_data(id, b"toolong")).unwrap();

    assert!(matches!(&delegate.take()[..], [Message::Close(_)]));
    assert!(matches!(log.take()[..], [Event::Error(_), Event::Closed]));
}

// === EOF semantics === //

#[test]
fn remote_half_closure_delivers_eof_and_keeps_output_open() {
    let (mut mux, delegate) = new_mux();
    let (id, log) = open_inbound(&mut mux, &delegate, true, true);

    mux.receive(peer_data(id, b"tail")).unwrap();
    mux.receive(peer_eof(id)).unwrap();
    mux.read_complete();

    assert_eq!(
        vec![
            Event::Data(b"tail".to_vec(), DataType::Channel),
            Event::Eof,
            Event::ReadComplete,
        ],
        log.take()
    );

    // The output direction is still usable.
    mux.write(id, Bytes::from_static(b"reply"), DataType::Channel, None);
    mux.flush(id);
    assert_eq!(b"reply".to_vec(), payload(&delegate.take()[0]));
}

#[test]
fn peer_eof_without_half_closure_closes_the_channel() {
    let (mut mux, delegate) = new_mux();
    let (id, log) = open_inbound(&mut mux, &delegate, true, false);

    mux.receive(peer_data(id, b"last")).unwrap();
    mux.receive(peer_eof(id)).unwrap();
    mux.read_complete();

    // Data is still delivered first, then the channel closes on the wire.
    assert_eq!(
        vec![Event::Data(b"last".to_vec(), DataType::Channel), Event::ReadComplete],
        log.take()
    );
    assert!(matches!(&delegate.take()[..], [Message::Close(_)]));

    mux.receive(peer_close(id)).unwrap();
    assert_eq!(vec![Event::Closed], log.take());
    assert_eq!(0, mux.channel_count());
}

#[test]
fn duplicate_eof_is_a_violation() {
    let (mut mux, delegate) = new_mux();
    let (id, log) = open_inbound(&mut mux, &delegate, true, true);

    mux.receive(peer_eof(id)).unwrap();
    mux.receive(peer_eof(id)).unwrap();

    assert!(matches!(&delegate.take()[..], [Message::Close(_)]));
    assert!(matches!(log.take()[..], [Event::Error(_), Event::Closed]));
}

// === close sequencing === //

#[test]
fn local_close_exchange_completes_once() {
    let (mut mux, delegate) = new_mux();
    let (id, log) = open_active(&mut mux, &delegate, WIN, WIN);

    let (completion, mut close_rx) = oneshot::channel();
    mux.close(id, CloseMode::All, Some(completion));

    assert!(matches!(&delegate.take()[..], [Message::Close(_)]));
    assert!(matches!(close_rx.try_recv(), Err(TryRecvError::Empty)));

    // A second user close surfaces AlreadyClosed without another message.
    let (completion, mut second_rx) = oneshot::channel();
    mux.close(id, CloseMode::All, Some(completion));
    assert_eq!(Err(MuxError::AlreadyClosed), second_rx.try_recv().unwrap());
    assert!(delegate.is_empty());

    mux.receive(peer_close(id)).unwrap();
    assert_eq!(Ok(()), close_rx.try_recv().unwrap());
    assert_eq!(vec![Event::Closed], log.take());
    assert_eq!(0, mux.channel_count());
}

#[test]
fn peer_initiated_close_forces_delivery_first() {
    let (mut mux, delegate) = new_mux();
    let (id, log) = open_inbound(&mut mux, &delegate, false, true);

    mux.receive(peer_data(id, b"buffered")).unwrap();
    mux.receive(peer_eof(id)).unwrap();
    mux.receive(peer_close(id)).unwrap();

    // Buffered data, then EOF, then the close notification, in one dispatch.
    assert_eq!(
        vec![
            Event::Data(b"buffered".to_vec(), DataType::Channel),
            Event::Eof,
            Event::ReadComplete,
            Event::Closed,
        ],
        log.take()
    );
    assert!(matches!(&delegate.take()[..], [Message::Close(_)]));
    assert_eq!(0, mux.channel_count());
}

#[test]
fn close_requested_while_opening_is_deferred() {
    let (mut mux, delegate) = new_mux();
    let (id, _log, mut open_rx) = open_local(&mut mux, &delegate);

    let (completion, mut close_rx) = oneshot::channel();
    mux.close(id, CloseMode::All, Some(completion));
    assert!(delegate.is_empty());

    mux.receive(confirmation(id, 23, WIN, WIN)).unwrap();
    assert_eq!(Ok(id), open_rx.try_recv().unwrap());
    assert!(matches!(&delegate.take()[..], [Message::Close(_)]));

    mux.receive(peer_close(id)).unwrap();
    assert_eq!(Ok(()), close_rx.try_recv().unwrap());
}

#[test]
fn close_after_open_failure_is_rejected() {
    let (mut mux, delegate) = new_mux();
    let (id, _log, mut open_rx) = open_local(&mut mux, &delegate);

    let (completion, mut close_rx) = oneshot::channel();
    mux.close(id, CloseMode::All, Some(completion));

    mux.receive(Message::OpenFailure(ChannelOpenFailure::new(
        as_peer(id),
        ReasonCode::CONNECT_FAILED,
        "unreachable",
    )))
    .unwrap();

    assert!(matches!(
        open_rx.try_recv().unwrap(),
        Err(MuxError::ChannelSetupRejected { .. })
    ));
    assert!(matches!(
        close_rx.try_recv().unwrap(),
        Err(MuxError::ChannelSetupRejected { .. })
    ));
}

#[test]
fn close_input_is_unsupported() {
    let (mut mux, delegate) = new_mux();
    let (id, _log) = open_active(&mut mux, &delegate, WIN, WIN);

    let (completion, mut rx) = oneshot::channel();
    mux.close(id, CloseMode::Input, Some(completion));
    assert!(matches!(
        rx.try_recv().unwrap(),
        Err(MuxError::OperationUnsupported { .. })
    ));
}

// === grace period === //

#[test]
fn window_overflow_closes_channel_and_enters_grace() {
    let (mut mux, delegate) = new_mux();
    let (id, log) = open_active(&mut mux, &delegate, u32::MAX - 8, WIN);

    // Scenario: the adjust would push the outbound window past 2^32 - 1.
    mux.receive(peer_window_adjust(id, 16)).unwrap();

    assert!(matches!(&delegate.take()[..], [Message::Close(_)]));
    assert!(matches!(log.take()[..], [Event::Error(MuxError::ProtocolViolation { .. }), Event::Closed]));

    // Late in-flight messages for the ID are absorbed...
    mux.receive(peer_data(id, b"stale")).unwrap();
    mux.receive(peer_window_adjust(id, 1)).unwrap();
    assert!(delegate.is_empty());

    // ...until the peer's close retires the entry.
    mux.receive(peer_close(id)).unwrap();
    let result = mux.receive(peer_data(id, b"too late"));
    assert!(matches!(result, Err(MuxError::ProtocolViolation { .. })));
}

#[test]
fn grace_does_not_leak_into_fresh_ids() {
    let (mut mux, delegate) = new_mux();
    let (id, _log) = open_active(&mut mux, &delegate, u32::MAX, WIN);
    mux.receive(peer_window_adjust(id, 1)).unwrap();
    delegate.take();

    // The next allocation moves on to a fresh ID.
    let (next_id, _log, _rx) = open_local(&mut mux, &delegate);
    assert_ne!(id, next_id);
}

// === requests === //

#[test]
fn requests_and_replies_are_routed_unchanged() {
    let (mut mux, delegate) = new_mux();
    let (id, log) = open_active(&mut mux, &delegate, WIN, WIN);

    mux.receive(Message::Request(ChannelRequest {
        recipient_channel_id: u32::from(id),
        request_type: "exec".into(),
        want_reply: true,
        type_specific: Bytes::from_static(&[0, 0, 0, 2, 108, 115]),
    }))
    .unwrap();
    assert_eq!(vec![Event::Request("exec".to_owned())], log.take());

    mux.send_request_reply(id, true).unwrap();
    assert!(matches!(&delegate.take()[..], [Message::Success(_)]));

    mux.send_request(id, "env", false, Bytes::new()).unwrap();
    match &delegate.take()[..] {
        [Message::Request(request)] => {
            assert_eq!(99, request.recipient_channel_id);
            assert_eq!("env", request.request_type);
            assert!(!request.want_reply);
        }
        other => panic!("expected channelRequest, got {other:?}"),
    }

    mux.receive(Message::Success(ChannelSuccess {
        recipient_channel_id: u32::from(id),
    }))
    .unwrap();
    assert_eq!(vec![Event::Reply(true)], log.take());
}

// === multiplexer-wide lifecycle === //

#[test]
fn parent_inactive_during_open_fails_everything_with_tcp_shutdown() {
    let (mut mux, delegate) = new_mux();
    let (id, log, mut open_rx) = open_local(&mut mux, &delegate);

    let (completion, mut close_rx) = oneshot::channel();
    mux.close(id, CloseMode::All, Some(completion));

    mux.parent_inactive();

    assert_eq!(Err(MuxError::TcpShutdown), open_rx.try_recv().unwrap());
    assert_eq!(Err(MuxError::TcpShutdown), close_rx.try_recv().unwrap());
    assert_eq!(vec![Event::Error(MuxError::TcpShutdown), Event::Closed], log.take());
    assert_eq!(0, mux.channel_count());
}

#[test]
fn parent_inactive_does_not_cascade_between_live_channels() {
    let (mut mux, delegate) = new_mux();
    let (first, first_log) = open_active(&mut mux, &delegate, WIN, WIN);
    let (second, second_log) = open_active(&mut mux, &delegate, WIN, WIN);
    assert_ne!(first, second);

    mux.parent_inactive();

    assert_eq!(
        vec![Event::Error(MuxError::TcpShutdown), Event::Closed],
        first_log.take()
    );
    assert_eq!(
        vec![Event::Error(MuxError::TcpShutdown), Event::Closed],
        second_log.take()
    );
}

#[test]
fn channel_error_does_not_poison_siblings() {
    let (mut mux, delegate) = new_mux();
    let (bad, bad_log) = open_active(&mut mux, &delegate, WIN, WIN);
    let (good, good_log) = open_active(&mut mux, &delegate, WIN, WIN);

    mux.receive(peer_window_adjust(bad, u32::MAX)).unwrap();
    assert!(matches!(bad_log.take()[..], [Event::Error(_), Event::Closed]));

    mux.receive(peer_data(good, b"fine")).unwrap();
    mux.read_complete();
    assert_eq!(
        vec![Event::Data(b"fine".to_vec(), DataType::Channel), Event::ReadComplete],
        good_log.take()
    );
}

#[test]
fn parent_handler_removed_fails_new_work() {
    let (mut mux, delegate) = new_mux();
    let (id, _log) = open_active(&mut mux, &delegate, WIN, WIN);

    mux.parent_handler_removed();

    let (completion, mut write_rx) = oneshot::channel();
    mux.write(id, Bytes::from_static(b"x"), DataType::Channel, Some(completion));
    assert_eq!(Err(MuxError::IoOnClosedChannel), write_rx.try_recv().unwrap());

    let (completion, mut open_rx) = oneshot::channel();
    mux.create_child_channel(ChannelType::Session, |_| Ok(()), completion);
    assert!(matches!(
        open_rx.try_recv().unwrap(),
        Err(MuxError::ProtocolViolation { .. })
    ));
    assert!(delegate.is_empty());
}

// === options === //

#[test]
fn options_are_stored_and_read_back() {
    let (mut mux, delegate) = new_mux();
    let (id, _log) = open_active(&mut mux, &delegate, WIN, 4096);

    assert_eq!(Ok(true), mux.auto_read(id));
    assert_eq!(Ok(false), mux.allow_remote_half_closure(id));

    mux.set_option(id, ChannelOption::AutoRead(false)).unwrap();
    mux.set_option(id, ChannelOption::AllowRemoteHalfClosure(true)).unwrap();

    assert_eq!(Ok(false), mux.auto_read(id));
    assert_eq!(Ok(true), mux.allow_remote_half_closure(id));
    assert_eq!(Ok(4096), mux.peer_maximum_message_length(id));
    assert!(mux.is_writable(id).unwrap());
}

#[test]
fn direct_tcpip_channel_type_is_kept() {
    let (mut mux, delegate) = new_mux();
    let ty = ChannelType::DirectTcpIp {
        target_host: "10.1.2.3".into(),
        target_port: 443,
        originator_host: "127.0.0.1".into(),
        originator_port: 50000,
    };

    let (completion, _rx) = oneshot::channel();
    mux.create_child_channel(ty.clone(), |_| Ok(()), completion);

    let sent = delegate.take();
    let id = match &sent[..] {
        [Message::Open(open)] => {
            assert_eq!(ty, open.channel_type);
            LocalChannelId::from(open.sender_channel_id)
        }
        other => panic!("expected channelOpen, got {other:?}"),
    };
    mux.receive(confirmation(id, 5, WIN, WIN)).unwrap();
    assert_eq!(Ok(&ty), mux.channel_type(id));
}
