use ssh_mux_proto::Message;
use tokio::sync::oneshot;

use crate::error::MuxError;

/// One-shot completion handle for an asynchronous multiplexer operation.
pub type Completion<T> = oneshot::Sender<Result<T, MuxError>>;
pub type CompletionReceiver<T> = oneshot::Receiver<Result<T, MuxError>>;
pub type WriteCompletion = Completion<()>;

pub(crate) fn complete<T>(completion: Option<Completion<T>>, result: Result<T, MuxError>) {
    if let Some(completion) = completion {
        // The caller may have dropped the receiving end; that is fine.
        let _ = completion.send(result);
    }
}

/// Boundary between the multiplexer and the transport below it.
///
/// The transport must preserve the order in which messages are handed over,
/// and must not assume anything about which channel they belong to. The
/// multiplexer never retains a payload after handing it over.
pub trait MuxDelegate {
    /// Hand one connection-layer message to the transport for serialization.
    ///
    /// `completion` resolves once the message has actually been written out
    /// (or fails with the reason it never will be).
    fn write_from_parent(&mut self, msg: Message, completion: Option<WriteCompletion>);

    /// End of a write burst; the transport should flush coalesced writes now.
    fn flush_from_parent(&mut self);
}
