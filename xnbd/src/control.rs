//! Synchronous-style control RPCs over a connection's single control slot.
//!
//! A caller takes the connection's control gate, posts the command to the reactor and
//! waits on a oneshot. The reactor encodes the command into its slot, tags the request
//! with the slot's generation and, when the answer comes back on the reactor thread,
//! hands it to exactly the one waiter of that generation.

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use xnbd_proto::{Answer, Command, CommandKind, RemoteStat, Reply};

use crate::metrics::{MetricsStorage, GLOBAL_STORAGE};
use crate::session::reactor::ReactorCommand;
use crate::transport::{Request, RequestContext, SendError, TransportConnection};
use crate::{topology, ConnectionHandle, Error};

/// Which connection of a session carries control RPCs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlPolicy {
    /// The connection whose index is the cpu the caller runs on, modulo the pool size.
    #[default]
    CallerCpu,
    /// Always the same connection, modulo the pool size.
    Fixed(usize),
}

impl ControlPolicy {
    pub(crate) fn select(&self, nr_connections: usize) -> usize {
        let n = nr_connections.max(1);
        match self {
            ControlPolicy::CallerCpu => topology::current_cpu().unwrap_or(0) % n,
            ControlPolicy::Fixed(index) => index % n,
        }
    }
}

/// Caller-side state of the control slot, guarded by the per-connection exclusion lock.
#[derive(Debug, Default)]
pub(crate) struct ControlGate {
    poisoned: bool,
}

type ReplySender = oneshot::Sender<Result<Reply, Error>>;

/// Travels with a control request so that its answer can be matched to the call.
struct ControlTag(u64);

struct PendingControl {
    generation: u64,
    kind: CommandKind,
    reply: ReplySender,
}

/// Reactor-side state: one reusable header buffer and at most one outstanding call.
pub(crate) struct ControlSlot {
    header: Vec<u8>,
    generation: u64,
    pending: Option<PendingControl>,
}

impl ControlSlot {
    pub(crate) fn new() -> Self {
        ControlSlot {
            header: Vec::with_capacity(xnbd_proto::MAX_MSG_LEN),
            generation: 0,
            pending: None,
        }
    }

    /// Forget the previous call. Its answer, should it still arrive, no longer matches.
    pub(crate) fn reset(&mut self) {
        self.header.clear();
        self.pending = None;
        self.generation = self.generation.wrapping_add(1);
    }

    pub(crate) fn issue(
        &mut self,
        command: &Command,
        reply: ReplySender,
        connection: &mut dyn TransportConnection,
    ) {
        self.reset();
        if let Err(e) = command.encode(&mut self.header) {
            let _ = reply.send(Err(e.into()));
            return;
        }
        let context: RequestContext = Box::new(ControlTag(self.generation));
        let request = Request {
            header: Bytes::copy_from_slice(&self.header),
            data: None,
            inbound_len: 0,
            context: Some(context),
        };
        self.pending = Some(PendingControl {
            generation: self.generation,
            kind: command.kind(),
            reply,
        });
        if let Err(SendError { error, .. }) = connection.send(request) {
            if let Some(pending) = self.pending.take() {
                let _ = pending.reply.send(Err(error.into()));
            }
        }
    }

    pub(crate) fn on_answer(&mut self, header: &[u8], context: Option<RequestContext>) {
        let tag = context
            .and_then(|c| c.downcast::<ControlTag>().ok())
            .map(|tag| tag.0);
        let matches = match (&self.pending, tag) {
            (Some(pending), Some(generation)) => pending.generation == generation,
            // transport did not carry the tag back, trust it to answer in order
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            warn!(?tag, generation = self.generation, "discarding stale control answer");
            return;
        }
        let Some(pending) = self.pending.take() else {
            return;
        };
        let result = Reply::decode_expecting(header, pending.kind).map_err(Error::from);
        if pending.reply.send(result).is_err() {
            debug!(kind = ?pending.kind, "control waiter went away before its answer");
        }
    }

    /// Drop the outstanding call, if any. Its waiter sees the connection as closed.
    pub(crate) fn abandon(&mut self) {
        self.pending = None;
    }

    #[cfg(test)]
    fn header_buffer(&self) -> (*const u8, usize) {
        (self.header.as_ptr(), self.header.capacity())
    }
}

impl ConnectionHandle {
    /// Run one control RPC and wait for its answer.
    ///
    /// Calls on the same connection are serialized. If the returned future is dropped
    /// before the answer arrives, the connection refuses further control RPCs with
    /// [`Error::ControlPoisoned`] until [`Self::reset_control`] is called.
    pub async fn call(&self, command: Command) -> Result<Reply, Error> {
        let index = self.index();
        let mut gate = self.inner.control.lock().await;
        if gate.poisoned {
            return Err(Error::ControlPoisoned { index });
        }
        let kind = command.kind();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.post(ReactorCommand::Control {
            command,
            reply: reply_tx,
        })
        .map_err(|_| Error::ConnectionClosed { index })?;
        MetricsStorage::inc(&GLOBAL_STORAGE.control_rpcs);
        debug!(index, ?kind, "control rpc issued");

        let poison_if_dropped = scopeguard::guard(&mut *gate, |gate| {
            warn!(index, ?kind, "control wait interrupted, poisoning control slot");
            gate.poisoned = true;
        });
        let answer = reply_rx.await;
        scopeguard::ScopeGuard::into_inner(poison_if_dropped);
        match answer {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionClosed { index }),
        }
    }

    /// Clear a poisoned control slot. An answer to the interrupted call is discarded.
    pub async fn reset_control(&self) -> Result<(), Error> {
        let index = self.index();
        let mut gate = self.inner.control.lock().await;
        let (done_tx, done_rx) = oneshot::channel();
        self.post(ReactorCommand::ResetControl { done: done_tx })
            .map_err(|_| Error::ConnectionClosed { index })?;
        done_rx
            .await
            .map_err(|_| Error::ConnectionClosed { index })?;
        gate.poisoned = false;
        debug!(index, "control slot reset");
        Ok(())
    }

    pub async fn is_control_poisoned(&self) -> bool {
        self.inner.control.lock().await.poisoned
    }

    /// Open `path` on the remote server, returning the remote descriptor.
    pub async fn open(&self, path: &str, flags: i32) -> Result<i32, Error> {
        let command = Command::Open {
            path: path.to_owned(),
            flags,
        };
        match expect_success(self.call(command).await?)? {
            Answer::Open { fd } => Ok(fd),
            _ => Err(Error::MissingAnswer {
                kind: CommandKind::Open,
            }),
        }
    }

    pub async fn stat(&self, fd: i32) -> Result<RemoteStat, Error> {
        match expect_success(self.call(Command::Fstat { fd }).await?)? {
            Answer::Fstat(stat) => Ok(stat),
            _ => Err(Error::MissingAnswer {
                kind: CommandKind::Fstat,
            }),
        }
    }

    /// Announce the queue depth the device will submit with.
    pub async fn setup(&self, fd: i32, queue_depth: u32) -> Result<(), Error> {
        match expect_success(self.call(Command::Setup { fd, queue_depth }).await?)? {
            Answer::Setup => Ok(()),
            _ => Err(Error::MissingAnswer {
                kind: CommandKind::IoSetup,
            }),
        }
    }
}

fn expect_success(reply: Reply) -> Result<Answer, Error> {
    if !reply.is_success() {
        return Err(Error::RemoteControl {
            kind: reply.kind,
            errno: reply.ret_errno,
        });
    }
    reply.answer.ok_or(Error::MissingAnswer { kind: reply.kind })
}
