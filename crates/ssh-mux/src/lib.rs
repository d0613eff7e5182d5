//! SSH connection-layer channel multiplexer (RFC 4254, channel subset).
//!
//! The synchronous core is [`Multiplexer`]: it owns every child channel,
//! routes parsed connection-layer messages, enforces per-channel state and
//! flow control, and serializes outbound messages through a [`MuxDelegate`].
//! [`MuxDriver`] wraps the core in a pair of tasks (scheduler + sender) that
//! bridge it to a message `Stream`/`Sink` transport and to an API request
//! queue for callers living on other tasks.

#[macro_use]
extern crate tracing;

mod channel;
mod config;
mod delegate;
mod error;
mod event;
mod flow;
mod id_allocator;
mod mux;
mod state;

pub use self::channel::ChannelSetup;
pub use self::config::{MuxConfig, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAXIMUM_PACKET_SIZE};
pub use self::delegate::{Completion, CompletionReceiver, MuxDelegate, WriteCompletion};
pub use self::error::MuxError;
pub use self::event::ChannelObserver;
pub use self::mux::{ChannelOption, CloseMode, InboundInitializer, Multiplexer};
pub use ssh_mux_proto::{
    Bytes, ChannelRequest, ChannelType, DataType, DistantChannelId, LocalChannelId, Message, ReasonCode,
};

use std::io;

use anyhow::Context as _;
use futures_util::{FutureExt as _, Sink, SinkExt as _, Stream, StreamExt as _};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{Instrument as _, Span};

pub type ApiRequestSender = mpsc::Sender<ApiRequest>;
pub type ApiRequestReceiver = mpsc::Receiver<ApiRequest>;

/// Initializer for a locally-requested channel.
pub type ChannelInitializer = Box<dyn FnOnce(&mut ChannelSetup<'_>) -> Result<(), MuxError> + Send>;

/// A multiplexer operation hopped onto the scheduler task.
///
/// This is the cross-thread entry point: callers never touch the
/// [`Multiplexer`] directly, they enqueue a request and await its completion.
pub enum ApiRequest {
    OpenChannel {
        channel_type: ChannelType,
        initializer: ChannelInitializer,
        completion: Completion<LocalChannelId>,
    },
    Write {
        id: LocalChannelId,
        data: Bytes,
        data_type: DataType,
        completion: Option<WriteCompletion>,
    },
    Flush {
        id: LocalChannelId,
    },
    Read {
        id: LocalChannelId,
    },
    Close {
        id: LocalChannelId,
        mode: CloseMode,
        completion: Option<WriteCompletion>,
    },
    SetOption {
        id: LocalChannelId,
        option: ChannelOption,
        completion: Completion<()>,
    },
    SendRequest {
        id: LocalChannelId,
        request_type: String,
        want_reply: bool,
        type_specific: Bytes,
        completion: Completion<()>,
    },
    RequestReply {
        id: LocalChannelId,
        success: bool,
        completion: Completion<()>,
    },
}

/// Cloneable async handle over the API request queue.
#[derive(Clone)]
pub struct MuxApi {
    request_tx: ApiRequestSender,
}

impl MuxApi {
    pub fn new(request_tx: ApiRequestSender) -> Self {
        Self { request_tx }
    }

    async fn send(&self, request: ApiRequest) -> Result<(), MuxError> {
        self.request_tx.send(request).await.map_err(|_| MuxError::TcpShutdown)
    }

    pub async fn open_channel(
        &self,
        channel_type: ChannelType,
        initializer: ChannelInitializer,
    ) -> Result<LocalChannelId, MuxError> {
        let (completion, rx) = oneshot::channel();
        self.send(ApiRequest::OpenChannel {
            channel_type,
            initializer,
            completion,
        })
        .await?;
        rx.await.map_err(|_| MuxError::TcpShutdown)?
    }

    /// Writes and flushes; resolves once the data reached the transport.
    pub async fn write(&self, id: LocalChannelId, data: Bytes, data_type: DataType) -> Result<(), MuxError> {
        let (completion, rx) = oneshot::channel();
        self.send(ApiRequest::Write {
            id,
            data,
            data_type,
            completion: Some(completion),
        })
        .await?;
        self.send(ApiRequest::Flush { id }).await?;
        rx.await.map_err(|_| MuxError::TcpShutdown)?
    }

    pub async fn read(&self, id: LocalChannelId) -> Result<(), MuxError> {
        self.send(ApiRequest::Read { id }).await
    }

    pub async fn close(&self, id: LocalChannelId, mode: CloseMode) -> Result<(), MuxError> {
        let (completion, rx) = oneshot::channel();
        self.send(ApiRequest::Close {
            id,
            mode,
            completion: Some(completion),
        })
        .await?;
        rx.await.map_err(|_| MuxError::TcpShutdown)?
    }

    pub async fn set_option(&self, id: LocalChannelId, option: ChannelOption) -> Result<(), MuxError> {
        let (completion, rx) = oneshot::channel();
        self.send(ApiRequest::SetOption { id, option, completion }).await?;
        rx.await.map_err(|_| MuxError::TcpShutdown)?
    }

    pub async fn send_request(
        &self,
        id: LocalChannelId,
        request_type: impl Into<String>,
        want_reply: bool,
        type_specific: Bytes,
    ) -> Result<(), MuxError> {
        let (completion, rx) = oneshot::channel();
        self.send(ApiRequest::SendRequest {
            id,
            request_type: request_type.into(),
            want_reply,
            type_specific,
            completion,
        })
        .await?;
        rx.await.map_err(|_| MuxError::TcpShutdown)?
    }

    pub async fn send_request_reply(&self, id: LocalChannelId, success: bool) -> Result<(), MuxError> {
        let (completion, rx) = oneshot::channel();
        self.send(ApiRequest::RequestReply { id, success, completion }).await?;
        rx.await.map_err(|_| MuxError::TcpShutdown)?
    }
}

/// Runs a [`Multiplexer`] against a transport-provided message stream/sink.
///
/// The scheduler task is the single executor for the multiplexer and all of
/// its children; the sender task serializes outbound messages into the sink
/// in emission order.
pub struct MuxDriver<S, K> {
    cfg: MuxConfig,
    api_request_rx: Option<ApiRequestReceiver>,
    inbound_initializer: Option<InboundInitializer>,
    msg_stream: S,
    msg_sink: K,
}

impl<S, K> MuxDriver<S, K> {
    pub fn new(msg_stream: S, msg_sink: K) -> Self {
        Self {
            cfg: MuxConfig::default(),
            api_request_rx: None,
            inbound_initializer: None,
            msg_stream,
            msg_sink,
        }
    }

    pub fn with_config(mut self, cfg: MuxConfig) -> Self {
        self.cfg = cfg;
        self
    }

    /// Attaches the queue that [`MuxApi`] handles feed.
    pub fn with_requester_api(mut self, api_request_rx: ApiRequestReceiver) -> Self {
        self.api_request_rx = Some(api_request_rx);
        self
    }

    /// Accept peer-initiated channels through `initializer`.
    pub fn with_inbound_initializer(mut self, initializer: InboundInitializer) -> Self {
        self.inbound_initializer = Some(initializer);
        self
    }
}

impl<S, K, E> MuxDriver<S, K>
where
    S: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
    K: Sink<Message> + Unpin + Send + 'static,
    K::Error: std::error::Error + Send + Sync + 'static,
{
    pub fn spawn(self) -> JoinHandle<anyhow::Result<()>> {
        let fut = self.run();
        tokio::spawn(fut)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let span = Span::current();
        run_driver_impl(self, span.clone()).instrument(span).await
    }
}

async fn run_driver_impl<S, K, E>(driver: MuxDriver<S, K>, span: Span) -> anyhow::Result<()>
where
    S: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
    K: Sink<Message> + Unpin + Send + 'static,
    K::Error: std::error::Error + Send + Sync + 'static,
{
    let MuxDriver {
        cfg,
        api_request_rx,
        inbound_initializer,
        msg_stream,
        msg_sink,
    } = driver;

    let (command_tx, command_rx) = mpsc::unbounded_channel::<SenderCommand>();

    let api_request_rx = api_request_rx.unwrap_or_else(|| mpsc::channel(1).1);

    let sender = MuxSenderTask { msg_sink, command_rx };
    let scheduler = MuxSchedulerTask {
        cfg,
        msg_stream,
        command_tx,
        api_request_rx,
        inbound_initializer,
    };

    let tasks = DriverTasks {
        scheduler: tokio::spawn(scheduler_task_impl(scheduler).instrument(span.clone())),
        sender: tokio::spawn(sender.run().instrument(span)),
    };

    match tasks.join().await? {
        (Err(scheduler_error), Err(sender_error)) => {
            anyhow::bail!("scheduler failed ({scheduler_error:#}) and sender failed ({sender_error:#})")
        }
        (Err(error), Ok(())) | (Ok(()), Err(error)) => {
            // One half outliving the other is the normal shutdown order.
            debug!(error = format!("{error:#}"), "Driver task ended with an error");
            Ok(())
        }
        (Ok(()), Ok(())) => Ok(()),
    }
}

// === internal tasks === //

#[derive(Debug)]
enum SenderCommand {
    Message(Message, Option<WriteCompletion>),
    Flush,
}

/// The only writer of the transport sink; preserves emission order.
struct MuxSenderTask<K> {
    msg_sink: K,
    command_rx: mpsc::UnboundedReceiver<SenderCommand>,
}

impl<K> MuxSenderTask<K>
where
    K: Sink<Message> + Unpin + Send + 'static,
    K::Error: std::error::Error + Send + Sync + 'static,
{
    #[instrument("sender", skip_all)]
    async fn run(self) -> anyhow::Result<()> {
        let Self {
            mut msg_sink,
            mut command_rx,
        } = self;

        while let Some(command) = command_rx.recv().await {
            match command {
                SenderCommand::Message(msg, completion) => {
                    trace!(?msg, "Send channel message");
                    match msg_sink.feed(msg).await {
                        Ok(()) => {
                            if let Some(completion) = completion {
                                let _ = completion.send(Ok(()));
                            }
                        }
                        Err(error) => {
                            if let Some(completion) = completion {
                                let _ = completion.send(Err(MuxError::TcpShutdown));
                            }
                            return Err(anyhow::Error::new(error).context("couldn't feed message into transport sink"));
                        }
                    }
                }
                SenderCommand::Flush => {
                    msg_sink.flush().await.context("couldn't flush transport sink")?;
                }
            }
        }

        info!("Closing multiplexer sender task...");

        Ok(())
    }
}

/// Delegate handing emitted messages to the sender task.
struct SenderDelegate {
    command_tx: mpsc::UnboundedSender<SenderCommand>,
}

impl MuxDelegate for SenderDelegate {
    fn write_from_parent(&mut self, msg: Message, completion: Option<WriteCompletion>) {
        if let Err(mpsc::error::SendError(command)) = self.command_tx.send(SenderCommand::Message(msg, completion)) {
            if let SenderCommand::Message(_, Some(completion)) = command {
                let _ = completion.send(Err(MuxError::TcpShutdown));
            }
        }
    }

    fn flush_from_parent(&mut self) {
        let _ = self.command_tx.send(SenderCommand::Flush);
    }
}

struct MuxSchedulerTask<S> {
    cfg: MuxConfig,
    msg_stream: S,
    command_tx: mpsc::UnboundedSender<SenderCommand>,
    api_request_rx: ApiRequestReceiver,
    inbound_initializer: Option<InboundInitializer>,
}

#[instrument("scheduler", skip_all)]
async fn scheduler_task_impl<S, E>(task: MuxSchedulerTask<S>) -> anyhow::Result<()>
where
    S: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let MuxSchedulerTask {
        cfg,
        mut msg_stream,
        command_tx,
        mut api_request_rx,
        inbound_initializer,
    } = task;

    let mut mux = Multiplexer::new(cfg, SenderDelegate { command_tx });
    if let Some(initializer) = inbound_initializer {
        mux.set_inbound_initializer(initializer);
    }

    // A transport that keeps yielding errors instead of terminating would
    // spin this loop forever; failed reads are capped per streak.
    const PIPE_ERROR_STREAK_LIMIT: u8 = 5;
    let mut pipe_error_streak: u8 = 0;

    loop {
        // NOTE: this task is the multiplexer's executor. It must process
        // requests and messages run-to-completion: no `await` is allowed
        // inside this select block, and `?` is reserved for unrecoverable
        // failures.

        tokio::select! {
            Some(request) = api_request_rx.recv() => {
                handle_api_request(&mut mux, request);
            }
            msg = msg_stream.next() => {
                let msg = match msg {
                    Some(msg) => msg,
                    None => {
                        info!("Transport message stream ended");
                        mux.parent_inactive();
                        break;
                    }
                };

                let msg = match msg {
                    Ok(msg) => {
                        pipe_error_streak = 0;
                        msg
                    }
                    Err(error) => {
                        pipe_error_streak += 1;
                        log_pipe_error(&error, pipe_error_streak);
                        if pipe_error_streak >= PIPE_ERROR_STREAK_LIMIT {
                            anyhow::bail!("transport produced {pipe_error_streak} failed reads in a row");
                        }
                        continue;
                    }
                };

                dispatch_inbound(&mut mux, msg);

                // Drain the rest of the read burst without yielding, then
                // signal the end of the burst.
                let mut pipe_closed = false;
                loop {
                    match msg_stream.next().now_or_never() {
                        Some(Some(Ok(msg))) => dispatch_inbound(&mut mux, msg),
                        Some(Some(Err(error))) => {
                            debug!(%error, "Pipe error inside a read burst");
                            break;
                        }
                        Some(None) => {
                            pipe_closed = true;
                            break;
                        }
                        None => break,
                    }
                }

                mux.read_complete();

                if pipe_closed {
                    info!("Transport message stream ended");
                    mux.parent_inactive();
                    break;
                }
            }
        }
    }

    info!("Closing multiplexer scheduler task...");

    Ok(())
}

fn dispatch_inbound<D: MuxDelegate>(mux: &mut Multiplexer<D>, msg: Message) {
    if let Err(error) = mux.receive(msg) {
        warn!(%error, "Dropped an unroutable channel message");
    }
}

fn handle_api_request<D: MuxDelegate>(mux: &mut Multiplexer<D>, request: ApiRequest) {
    match request {
        ApiRequest::OpenChannel {
            channel_type,
            initializer,
            completion,
        } => mux.create_child_channel(channel_type, initializer, completion),
        ApiRequest::Write {
            id,
            data,
            data_type,
            completion,
        } => mux.write(id, data, data_type, completion),
        ApiRequest::Flush { id } => mux.flush(id),
        ApiRequest::Read { id } => {
            if let Err(error) = mux.read(id) {
                warn!(%error, "Read request for an unknown channel");
            }
        }
        ApiRequest::Close { id, mode, completion } => mux.close(id, mode, completion),
        ApiRequest::SetOption { id, option, completion } => {
            let _ = completion.send(mux.set_option(id, option));
        }
        ApiRequest::SendRequest {
            id,
            request_type,
            want_reply,
            type_specific,
            completion,
        } => {
            let _ = completion.send(mux.send_request(id, &request_type, want_reply, type_specific));
        }
        ApiRequest::RequestReply { id, success, completion } => {
            let _ = completion.send(mux.send_request_reply(id, success));
        }
    }
}

/// The two running halves of a driver.
///
/// Neither half is useful without the other: dropping the pair (including
/// mid-`join`, when one half panicked) aborts whichever task is still
/// running.
struct DriverTasks {
    scheduler: JoinHandle<anyhow::Result<()>>,
    sender: JoinHandle<anyhow::Result<()>>,
}

impl DriverTasks {
    /// Waits for both halves. A panicked or cancelled task is fatal; the
    /// halves' own errors are returned for the caller to interpret.
    async fn join(mut self) -> anyhow::Result<(anyhow::Result<()>, anyhow::Result<()>)> {
        tokio::try_join!(&mut self.scheduler, &mut self.sender).context("driver task panicked")
    }
}

impl Drop for DriverTasks {
    fn drop(&mut self) {
        self.scheduler.abort();
        self.sender.abort();
    }
}

fn log_pipe_error(error: &(dyn std::error::Error + 'static), streak: u8) {
    if is_benign_disconnect(error) {
        info!(reason = %error, streak, "Transport read failed with a benign disconnect");
    } else {
        error!(%error, streak, "Transport read failed");
    }
}

/// Resets, aborts and truncated reads are how TCP peers routinely vanish;
/// a match anywhere in the error's source chain counts.
fn is_benign_disconnect(error: &(dyn std::error::Error + 'static)) -> bool {
    let mut cause = Some(error);
    while let Some(current) = cause {
        match current.downcast_ref::<io::Error>().map(io::Error::kind) {
            Some(io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::UnexpectedEof) => {
                return true;
            }
            _ => cause = current.source(),
        }
    }
    false
}
