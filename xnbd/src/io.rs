//! The data plane: block requests in, IO_SUBMIT commands out, completions back.
//!
//! Submission never blocks. A request becomes an [`IoUnit`] that owns its buffer and
//! its completion; the unit itself travels with the request as the transport context and
//! comes back with the answer, so no lookup table is needed to find the request again.

use std::fmt;

use bytes::{Bytes, BytesMut};
use tokio::sync::{oneshot, OwnedSemaphorePermit, TryAcquireError};
use tracing::{error, trace, warn};
use xnbd_proto::{Answer, CommandKind, IoOpcode, Reply, SubmitCommand, SUBMIT_BLOCK_SIZE};

use crate::metrics::{MetricsStorage, GLOBAL_STORAGE};
use crate::session::reactor::ReactorCommand;
use crate::transport::{Request, RequestContext, SendError, TransportConnection};
use crate::{ConnectionHandle, Error};

/// The buffer of a block request: filled by a read, drained by a write.
pub enum Payload {
    Read(BytesMut),
    Write(Bytes),
}

impl Payload {
    /// A zeroed buffer of `len` bytes to read into.
    pub fn read(len: usize) -> Self {
        Payload::Read(BytesMut::zeroed(len))
    }

    pub fn write(data: impl Into<Bytes>) -> Self {
        Payload::Write(data.into())
    }

    pub fn len(&self) -> usize {
        match self {
            Payload::Read(buf) => buf.len(),
            Payload::Write(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn opcode(&self) -> IoOpcode {
        match self {
            Payload::Read(_) => IoOpcode::Read,
            Payload::Write(_) => IoOpcode::Write,
        }
    }

    /// The filled read buffer, if this was a read.
    pub fn into_read(self) -> Option<BytesMut> {
        match self {
            Payload::Read(buf) => Some(buf),
            Payload::Write(_) => None,
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Read(buf) => f.debug_tuple("Read").field(&buf.len()).finish(),
            Payload::Write(data) => f.debug_tuple("Write").field(&data.len()).finish(),
        }
    }
}

/// Handed back to the submitter exactly once per request.
#[derive(Debug)]
pub struct IoCompletion {
    pub payload: Option<Payload>,
    /// Bytes transferred. A short read leaves the tail of the buffer untouched.
    pub result: Result<usize, Error>,
}

pub trait CompleteRequest: Send + 'static {
    fn complete(self: Box<Self>, completion: IoCompletion);
}

impl<F> CompleteRequest for F
where
    F: FnOnce(IoCompletion) + Send + 'static,
{
    fn complete(self: Box<Self>, completion: IoCompletion) {
        (*self)(completion)
    }
}

pub struct BlockRequest {
    pub offset: u64,
    pub payload: Option<Payload>,
    completion: Box<dyn CompleteRequest>,
}

impl BlockRequest {
    pub fn new(offset: u64, payload: Option<Payload>, completion: impl CompleteRequest) -> Self {
        BlockRequest {
            offset,
            payload,
            completion: Box::new(completion),
        }
    }

    /// A request whose completion is delivered through a oneshot channel.
    pub fn with_channel(
        offset: u64,
        payload: Option<Payload>,
    ) -> (Self, oneshot::Receiver<IoCompletion>) {
        let (tx, rx) = oneshot::channel();
        let request = Self::new(offset, payload, move |completion: IoCompletion| {
            let _ = tx.send(completion);
        });
        (request, rx)
    }

    pub fn len(&self) -> usize {
        self.payload.as_ref().map_or(0, Payload::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn complete(self, result: Result<usize, Error>) {
        self.completion.complete(IoCompletion {
            payload: self.payload,
            result,
        })
    }
}

impl fmt::Debug for BlockRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockRequest")
            .field("offset", &self.offset)
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}

/// A request that was not accepted. No completion was or will be issued for it.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("connection {index} has its full queue depth in flight")]
    Busy { index: usize, request: BlockRequest },
    #[error("connection {index} is closed")]
    Closed { index: usize, request: BlockRequest },
    #[error("device has no hardware queue {queue}")]
    NoSuchQueue { queue: usize, request: BlockRequest },
}

impl SubmitError {
    pub fn into_request(self) -> BlockRequest {
        match self {
            SubmitError::Busy { request, .. }
            | SubmitError::Closed { request, .. }
            | SubmitError::NoSuchQueue { request, .. } => request,
        }
    }

    /// Drop the request, keeping only the reason.
    pub fn into_error(self) -> Error {
        match self {
            SubmitError::Busy { index, .. } => Error::Busy { index },
            SubmitError::Closed { index, .. } => Error::ConnectionClosed { index },
            SubmitError::NoSuchQueue { queue, .. } => Error::NoSuchQueue { queue },
        }
    }
}

/// One in-flight transfer. Completes its request when answered, failed, or dropped.
pub(crate) struct IoUnit {
    fd: i32,
    offset: u64,
    payload: Option<Payload>,
    completion: Option<Box<dyn CompleteRequest>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl IoUnit {
    fn command(&self) -> SubmitCommand {
        let (opcode, len) = match &self.payload {
            Some(payload) => (payload.opcode(), payload.len()),
            None => (IoOpcode::Read, 0),
        };
        SubmitCommand {
            fd: self.fd,
            opcode,
            offset: self.offset,
            len: len as u32,
        }
    }

    fn into_request(self) -> Request {
        let mut header = BytesMut::with_capacity(32);
        self.command().encode(&mut header);
        let (data, inbound_len) = match &self.payload {
            Some(Payload::Write(data)) => (Some(data.clone()), 0),
            Some(Payload::Read(buf)) => (None, buf.len()),
            None => (None, 0),
        };
        let context: RequestContext = Box::new(self);
        Request {
            header: header.freeze(),
            data,
            inbound_len,
            context: Some(context),
        }
    }

    /// Take the request back out of a unit that was never sent.
    fn into_block_request(mut self) -> BlockRequest {
        BlockRequest {
            offset: self.offset,
            payload: self.payload.take(),
            completion: self
                .completion
                .take()
                .expect("completion is only taken on delivery"),
        }
    }

    fn on_reply(mut self, reply: Reply, data: Option<Bytes>) {
        if !reply.is_success() {
            return self.deliver(Err(Error::RemoteIo {
                ret: reply.ret,
                errno: reply.ret_errno,
            }));
        }
        let Some(Answer::Submit { data_len }) = reply.answer else {
            return self.deliver(Err(Error::MissingAnswer {
                kind: CommandKind::IoSubmit,
            }));
        };
        let transferred = match &mut self.payload {
            Some(Payload::Read(buf)) => {
                let data = data.unwrap_or_default();
                let n = (data_len as usize).min(data.len()).min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                n
            }
            Some(Payload::Write(written)) => (data_len as usize).min(written.len()),
            None => 0,
        };
        self.deliver(Ok(transferred));
    }

    pub(crate) fn fail(mut self, error: Error) {
        self.deliver(Err(error));
    }

    fn deliver(&mut self, result: Result<usize, Error>) {
        let Some(completion) = self.completion.take() else {
            return;
        };
        // free the queue slot before the submitter hears back, it may resubmit right away
        drop(self.permit.take());
        match &result {
            Ok(n) => {
                trace!(offset = self.offset, n, "io completed");
                MetricsStorage::inc(&GLOBAL_STORAGE.ios_completed);
            }
            Err(e) => {
                trace!(offset = self.offset, error = %e, "io failed");
                MetricsStorage::inc(&GLOBAL_STORAGE.ios_failed);
            }
        }
        completion.complete(IoCompletion {
            payload: self.payload.take(),
            result,
        });
    }
}

impl Drop for IoUnit {
    fn drop(&mut self) {
        self.deliver(Err(Error::Discarded));
    }
}

/// Queue `request` on `connection` without blocking.
///
/// Empty requests complete successfully right away, requests larger than one transfer
/// unit complete with [`Error::Unsupported`]. Neither issues a command.
pub(crate) fn submit(
    connection: &ConnectionHandle,
    fd: i32,
    request: BlockRequest,
) -> Result<(), SubmitError> {
    let index = connection.index();
    let len = request.len();
    if len == 0 {
        request.complete(Ok(0));
        return Ok(());
    }
    if len > SUBMIT_BLOCK_SIZE {
        request.complete(Err(Error::Unsupported {
            len,
            max: SUBMIT_BLOCK_SIZE,
        }));
        return Ok(());
    }
    let permit = match connection.inner.inflight.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(TryAcquireError::NoPermits) => return Err(SubmitError::Busy { index, request }),
        Err(TryAcquireError::Closed) => return Err(SubmitError::Closed { index, request }),
    };
    let BlockRequest {
        offset,
        payload,
        completion,
    } = request;
    let unit = IoUnit {
        fd,
        offset,
        payload,
        completion: Some(completion),
        permit: Some(permit),
    };
    match connection.post(ReactorCommand::Io(unit)) {
        Ok(()) => {
            MetricsStorage::inc(&GLOBAL_STORAGE.ios_submitted);
            Ok(())
        }
        Err(ReactorCommand::Io(unit)) => Err(SubmitError::Closed {
            index,
            request: unit.into_block_request(),
        }),
        Err(_) => unreachable!("posted an io command"),
    }
}

/// Reactor side: send a unit, failing it if the transport refuses.
pub(crate) fn dispatch(unit: IoUnit, connection: &mut dyn TransportConnection) {
    if let Err(SendError { request, error }) = connection.send(unit.into_request()) {
        warn!(error = %error, "io submission refused by transport");
        match request.context.map(|context| context.downcast::<IoUnit>()) {
            Some(Ok(unit)) => (*unit).fail(Error::Transport(error)),
            // the context is dropped right here, which completes the unit if it was one
            _ => error!("transport handed back a refused submission without its context"),
        }
    }
}

/// Reactor side: complete the unit an IO_SUBMIT answer belongs to.
pub(crate) fn on_submit_answer(header: &[u8], data: Option<Bytes>, context: Option<RequestContext>) {
    let unit = match context.map(|context| context.downcast::<IoUnit>()) {
        Some(Ok(unit)) => *unit,
        Some(Err(_)) => {
            error!("submit answer carries a foreign context");
            MetricsStorage::inc(&GLOBAL_STORAGE.orphan_completions);
            return;
        }
        None => {
            error!("submit answer without a request back-reference");
            MetricsStorage::inc(&GLOBAL_STORAGE.orphan_completions);
            return;
        }
    };
    match Reply::decode_expecting(header, CommandKind::IoSubmit) {
        Ok(reply) => unit.on_reply(reply, data),
        Err(e) => unit.fail(Error::Protocol(e)),
    }
}
