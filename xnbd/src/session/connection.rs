//! One connection of a session and the dedicated thread that owns it.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::reactor::{Reactor, ReactorCommand};
use super::SessionShared;
use crate::control::ControlGate;
use crate::transport::EventSink;
use crate::{topology, Error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Opening,
    Open,
    /// The transport reported the peer gone. The reactor keeps running until told to stop.
    Disconnected,
    Destroyed,
}

/// Cheap to clone. All clones address the same connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub(crate) inner: Arc<ConnectionShared>,
}

pub(crate) struct ConnectionShared {
    pub(crate) index: usize,
    pub(crate) queue_depth: u32,
    pub(crate) state: Mutex<ConnectionState>,
    pub(crate) control: tokio::sync::Mutex<ControlGate>,
    pub(crate) inflight: Arc<Semaphore>,
    mailbox: mpsc::UnboundedSender<ReactorCommand>,
}

impl ConnectionHandle {
    pub fn index(&self) -> usize {
        self.inner.index
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().unwrap()
    }

    pub fn queue_depth(&self) -> u32 {
        self.inner.queue_depth
    }

    /// IO units submitted on this connection that have not completed yet.
    pub fn in_flight(&self) -> usize {
        (self.inner.queue_depth as usize).saturating_sub(self.inner.inflight.available_permits())
    }

    /// Hand a command to the reactor. Gives it back if the reactor has exited.
    pub(crate) fn post(&self, command: ReactorCommand) -> Result<(), ReactorCommand> {
        self.inner
            .mailbox
            .send(command)
            .map_err(|mpsc::error::SendError(command)| command)
    }
}

impl ConnectionShared {
    pub(crate) fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("index", &self.inner.index)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// The owner's grip on a connection thread.
pub(crate) struct Worker {
    index: usize,
    stop: CancellationToken,
    exited: Option<oneshot::Receiver<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn stop(&self) {
        self.stop.cancel();
    }

    /// Wait for the thread to exit. Does not stop it.
    pub(crate) async fn join(mut self) {
        if let Some(exited) = self.exited.take() {
            // Err means the thread is gone without signalling, i.e. it panicked
            let _ = exited.await;
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(index = self.index, "connection thread panicked");
            }
        }
        debug!(index = self.index, "connection thread joined");
    }
}

/// A worker nobody waits for any more still has to stop, e.g. when a `Session::create`
/// future is dropped half way.
impl Drop for Worker {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

pub(crate) struct Spawned {
    pub(crate) handle: ConnectionHandle,
    pub(crate) worker: Worker,
    /// Resolves once the connection is established, or failed to be.
    pub(crate) ready: oneshot::Receiver<Result<(), Error>>,
}

struct ThreadArgs {
    session: Arc<SessionShared>,
    shared: Arc<ConnectionShared>,
    stop: CancellationToken,
    mailbox: mpsc::UnboundedReceiver<ReactorCommand>,
    ready: oneshot::Sender<Result<(), Error>>,
    exited: oneshot::Sender<()>,
    pin_to: Option<usize>,
}

pub(crate) fn spawn(
    session: &Arc<SessionShared>,
    index: usize,
    pin_to: Option<usize>,
    queue_depth: u32,
) -> Result<Spawned, Error> {
    let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = oneshot::channel();
    let (exited_tx, exited_rx) = oneshot::channel();
    let stop = session.stop.child_token();
    let shared = Arc::new(ConnectionShared {
        index,
        queue_depth,
        state: Mutex::new(ConnectionState::Opening),
        control: tokio::sync::Mutex::new(ControlGate::default()),
        inflight: Arc::new(Semaphore::new(queue_depth as usize)),
        mailbox: mailbox_tx,
    });
    let args = ThreadArgs {
        session: Arc::clone(session),
        shared: Arc::clone(&shared),
        stop: stop.clone(),
        mailbox: mailbox_rx,
        ready: ready_tx,
        exited: exited_tx,
        pin_to,
    };
    session.thread_starting();
    let thread = std::thread::Builder::new()
        .name(format!("xnbd-conn-{index}"))
        .spawn(move || run(args))
        .map_err(|e| {
            session.thread_never_started();
            Error::Allocation(format!("spawn thread for connection {index}: {e}"))
        })?;
    Ok(Spawned {
        handle: ConnectionHandle { inner: shared },
        worker: Worker {
            index,
            stop,
            exited: Some(exited_rx),
            thread: Some(thread),
        },
        ready: ready_rx,
    })
}

fn run(args: ThreadArgs) {
    let ThreadArgs {
        session,
        shared,
        stop,
        mailbox,
        ready,
        exited,
        pin_to,
    } = args;
    let span = info_span!("connection", portal = %session.portal, index = shared.index);
    let _entered = span.enter(); // safe to use here because we use new_current_thread
    scopeguard::defer! {
        shared.set_state(ConnectionState::Destroyed);
        session.connection_exited();
        let _ = exited.send(());
    }

    if let Some(cpu) = pin_to {
        match topology::pin_current_thread(cpu) {
            Ok(()) => debug!(cpu, "pinned connection thread"),
            Err(e) => warn!(cpu, error = %e, "failed to pin connection thread, running unpinned"),
        }
    }

    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            let _ = ready.send(Err(Error::Allocation(format!("reactor runtime: {e}"))));
            return;
        }
    };

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let sink = EventSink::new(shared.index, events_tx);
    let connection = match session.transport.connect(shared.index, sink) {
        Ok(connection) => connection,
        Err(e) => {
            warn!(error = %e, "connection establishment failed");
            let _ = ready.send(Err(e.into()));
            return;
        }
    };
    shared.set_state(ConnectionState::Open);
    info!("connection established");
    let _ = ready.send(Ok(()));

    let reactor = Reactor::new(
        Arc::clone(&shared),
        Arc::clone(&session),
        connection,
        events_rx,
        mailbox,
        stop,
    );
    rt.block_on(reactor.run().instrument(info_span!("reactor")));
}
