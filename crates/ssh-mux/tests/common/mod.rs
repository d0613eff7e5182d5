#![allow(clippy::unwrap_used, reason = "test code can panic on errors")]
#![allow(dead_code, reason = "not every test binary uses every helper")]

use std::sync::{Arc, Mutex};

use ssh_mux::{ChannelObserver, ChannelSetup, DataType, Message, MuxDelegate, MuxError, WriteCompletion};
use ssh_mux_proto::{Bytes, ChannelRequest};

/// Delegate recording every emitted message and completing writes inline.
#[derive(Clone, Default)]
pub struct RecordingDelegate {
    sent: Arc<Mutex<Vec<Message>>>,
}

impl RecordingDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes every message emitted since the last call.
    pub fn take(&self) -> Vec<Message> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn is_empty(&self) -> bool {
        self.sent.lock().unwrap().is_empty()
    }
}

impl MuxDelegate for RecordingDelegate {
    fn write_from_parent(&mut self, msg: Message, completion: Option<WriteCompletion>) {
        self.sent.lock().unwrap().push(msg);
        if let Some(completion) = completion {
            let _ = completion.send(Ok(()));
        }
    }

    fn flush_from_parent(&mut self) {}
}

/// Everything a channel observer can see, in callback order.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Active,
    Data(Vec<u8>, DataType),
    ReadComplete,
    Eof,
    Request(String),
    Reply(bool),
    Writable(bool),
    Error(MuxError),
    Closed,
}

#[derive(Clone, Default)]
pub struct RecordingObserver {
    events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> EventLog {
        EventLog {
            events: Arc::clone(&self.events),
        }
    }
}

/// Cheap cloneable view over an observer's event list.
#[derive(Clone)]
pub struct EventLog {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventLog {
    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    pub fn peek(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().unwrap().is_empty()
    }
}

impl ChannelObserver for RecordingObserver {
    fn channel_active(&mut self) {
        self.events.lock().unwrap().push(Event::Active);
    }

    fn data_received(&mut self, data: Bytes, data_type: DataType) {
        self.events.lock().unwrap().push(Event::Data(data.to_vec(), data_type));
    }

    fn read_complete(&mut self) {
        self.events.lock().unwrap().push(Event::ReadComplete);
    }

    fn eof_received(&mut self) {
        self.events.lock().unwrap().push(Event::Eof);
    }

    fn request_received(&mut self, request: ChannelRequest) {
        self.events
            .lock()
            .unwrap()
            .push(Event::Request(request.request_type.to_string()));
    }

    fn request_reply_received(&mut self, success: bool) {
        self.events.lock().unwrap().push(Event::Reply(success));
    }

    fn writability_changed(&mut self, is_writable: bool) {
        self.events.lock().unwrap().push(Event::Writable(is_writable));
    }

    fn error_caught(&mut self, error: &MuxError) {
        self.events.lock().unwrap().push(Event::Error(error.clone()));
    }

    fn channel_closed(&mut self) {
        self.events.lock().unwrap().push(Event::Closed);
    }
}

/// Installs a fresh recording observer and applies extra setup.
pub fn observing_initializer(
    log_slot: Arc<Mutex<Option<EventLog>>>,
    configure: impl Fn(&mut ChannelSetup<'_>) + Send + 'static,
) -> Box<dyn FnMut(&mut ChannelSetup<'_>) -> Result<(), MuxError> + Send> {
    Box::new(move |setup| {
        let observer = RecordingObserver::new();
        *log_slot.lock().unwrap() = Some(observer.handle());
        setup.set_observer(Box::new(observer));
        configure(setup);
        Ok(())
    })
}

pub fn payload(msg: &Message) -> Vec<u8> {
    match msg {
        Message::Data(data) => data.transfer_data.to_vec(),
        Message::ExtendedData(data) => data.transfer_data.to_vec(),
        other => panic!("expected a data message, got {other:?}"),
    }
}
