//! An in-process remote endpoint.
//!
//! Requests are served synchronously from a [`RemoteStore`] inside `send`, and the answers
//! are pushed into the requesting connection's [`EventSink`], so they are handled later on
//! that connection's reactor like any network answer would be. The knobs on
//! [`LoopbackTransport`] inject the failures a real server or network produces.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use nix::errno::Errno;
use tracing::{debug, trace};
use xnbd_proto::{Answer, Command, CommandKind, IoOpcode, Reply};

use super::store::RemoteStore;
use super::{
    EventSink, Request, Response, SendError, Transport, TransportConnection, TransportError,
    TransportEvent, TransportSession,
};

pub struct LoopbackTransport {
    server: Arc<Server>,
    sessions: Mutex<HashMap<String, Arc<PortalInner>>>,
}

struct Server {
    store: Box<dyn RemoteStore>,
    faults: Mutex<Faults>,
}

#[derive(Default)]
struct Faults {
    refuse_sessions: bool,
    refuse_connect: HashSet<usize>,
    connect_delay: Option<Duration>,
    release_reversed: bool,
    hold_control: bool,
    hold_io: bool,
    fail: HashMap<CommandKind, Errno>,
    strip_io_contexts: usize,
}

/// What the client holds; connections share the state directly.
struct PortalSession {
    inner: Arc<PortalInner>,
}

struct PortalInner {
    portal: String,
    server: Arc<Server>,
    state: Mutex<PortalState>,
}

#[derive(Default)]
struct PortalState {
    destroyed: bool,
    sinks: BTreeMap<usize, EventSink>,
    held: Vec<HeldAnswer>,
    submits: HashMap<usize, u64>,
    destroyed_connections: Vec<usize>,
}

struct HeldAnswer {
    index: usize,
    kind: CommandKind,
    response: Response,
}

struct LoopbackConnection {
    index: usize,
    session: Arc<PortalInner>,
    sink: EventSink,
}

impl LoopbackTransport {
    pub fn new(store: impl RemoteStore + 'static) -> Self {
        LoopbackTransport {
            server: Arc::new(Server {
                store: Box::new(store),
                faults: Mutex::new(Faults::default()),
            }),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn refuse_sessions(&self, refuse: bool) {
        self.server.faults.lock().unwrap().refuse_sessions = refuse;
    }

    /// Make establishment of the connection with this index fail, in every session.
    pub fn refuse_connect_on(&self, index: usize) {
        self.server.faults.lock().unwrap().refuse_connect.insert(index);
    }

    /// Make every connection establishment take `delay` on the connecting thread.
    pub fn delay_connects(&self, delay: Option<Duration>) {
        self.server.faults.lock().unwrap().connect_delay = delay;
    }

    /// Deliver released answers newest first instead of in arrival order.
    pub fn release_held_in_reverse(&self, reverse: bool) {
        self.server.faults.lock().unwrap().release_reversed = reverse;
    }

    /// While holding, control answers are kept back. Turning it off delivers them.
    pub fn hold_control_answers(&self, hold: bool) {
        self.server.faults.lock().unwrap().hold_control = hold;
        if !hold {
            self.release_held(|kind| kind.is_control());
        }
    }

    /// Like [`Self::hold_control_answers`], for IO_SUBMIT answers.
    pub fn hold_io_answers(&self, hold: bool) {
        self.server.faults.lock().unwrap().hold_io = hold;
        if !hold {
            self.release_held(|kind| !kind.is_control());
        }
    }

    /// Answer every command of `kind` with a failure carrying `errno`, or stop doing so.
    pub fn fail_command(&self, kind: CommandKind, errno: Option<Errno>) {
        let mut faults = self.server.faults.lock().unwrap();
        match errno {
            Some(errno) => faults.fail.insert(kind, errno),
            None => faults.fail.remove(&kind),
        };
    }

    /// Answer the next `n` IO_SUBMITs without the context of their request.
    pub fn strip_io_contexts(&self, n: usize) {
        self.server.faults.lock().unwrap().strip_io_contexts = n;
    }

    /// Raise a session teardown on the lowest-indexed live connection of `portal`.
    pub fn raise_session_teardown(&self, portal: &str) -> bool {
        let Some(session) = self.session(portal) else {
            return false;
        };
        let sink = session.state.lock().unwrap().sinks.values().next().cloned();
        match sink {
            Some(sink) => sink.deliver(TransportEvent::SessionTeardown).is_ok(),
            None => false,
        }
    }

    pub fn raise_connection_teardown(&self, portal: &str, index: usize) -> bool {
        self.raise_on(portal, index, TransportEvent::ConnectionTeardown)
    }

    pub fn raise_disconnect(&self, portal: &str, index: usize) -> bool {
        self.raise_on(portal, index, TransportEvent::Disconnected)
    }

    /// Number of answers currently held back for `portal`.
    pub fn held_answers(&self, portal: &str) -> usize {
        self.session(portal)
            .map(|s| s.state.lock().unwrap().held.len())
            .unwrap_or(0)
    }

    /// How many IO_SUBMITs arrived on the connection with this index.
    pub fn submits_on(&self, portal: &str, index: usize) -> u64 {
        self.session(portal)
            .and_then(|s| s.state.lock().unwrap().submits.get(&index).copied())
            .unwrap_or(0)
    }

    pub fn live_connections(&self, portal: &str) -> usize {
        self.session(portal)
            .map(|s| s.state.lock().unwrap().sinks.len())
            .unwrap_or(0)
    }

    /// Connection indexes in the order their connections were destroyed.
    pub fn destroyed_connections(&self, portal: &str) -> Vec<usize> {
        self.session(portal)
            .map(|s| s.state.lock().unwrap().destroyed_connections.clone())
            .unwrap_or_default()
    }

    /// `None` if no session for `portal` was ever created.
    pub fn is_session_destroyed(&self, portal: &str) -> Option<bool> {
        self.session(portal)
            .map(|s| s.state.lock().unwrap().destroyed)
    }

    fn session(&self, portal: &str) -> Option<Arc<PortalInner>> {
        self.sessions.lock().unwrap().get(portal).cloned()
    }

    fn raise_on(&self, portal: &str, index: usize, event: TransportEvent) -> bool {
        let Some(session) = self.session(portal) else {
            return false;
        };
        let sink = session.state.lock().unwrap().sinks.get(&index).cloned();
        match sink {
            Some(sink) => sink.deliver(event).is_ok(),
            None => false,
        }
    }

    fn release_held(&self, select: impl Fn(CommandKind) -> bool) {
        let sessions: Vec<_> = self.sessions.lock().unwrap().values().cloned().collect();
        for session in sessions {
            let (mut released, sinks) = {
                let mut state = session.state.lock().unwrap();
                let (released, kept) = std::mem::take(&mut state.held)
                    .into_iter()
                    .partition::<Vec<_>, _>(|held| select(held.kind));
                state.held = kept;
                (released, state.sinks.clone())
            };
            if self.server.faults.lock().unwrap().release_reversed {
                released.reverse();
            }
            for held in released {
                trace!(portal = %session.portal, index = held.index, kind = ?held.kind, "releasing held answer");
                if let Some(sink) = sinks.get(&held.index) {
                    let _ = sink.deliver(TransportEvent::Response(held.response));
                }
            }
        }
    }
}

impl Transport for LoopbackTransport {
    fn create_session(&self, portal: &str) -> Result<Arc<dyn TransportSession>, TransportError> {
        if self.server.faults.lock().unwrap().refuse_sessions {
            return Err(TransportError::SessionRefused {
                portal: portal.to_owned(),
                reason: "refused by loopback endpoint".to_owned(),
            });
        }
        let inner = Arc::new(PortalInner {
            portal: portal.to_owned(),
            server: Arc::clone(&self.server),
            state: Mutex::new(PortalState::default()),
        });
        self.sessions
            .lock()
            .unwrap()
            .insert(portal.to_owned(), Arc::clone(&inner));
        debug!(portal, "loopback session created");
        Ok(Arc::new(PortalSession { inner }))
    }
}

impl TransportSession for PortalSession {
    fn connect(
        &self,
        index: usize,
        events: EventSink,
    ) -> Result<Box<dyn TransportConnection>, TransportError> {
        let inner = &self.inner;
        let (refused, delay) = {
            let faults = inner.server.faults.lock().unwrap();
            (faults.refuse_connect.contains(&index), faults.connect_delay)
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if refused {
            return Err(TransportError::ConnectRefused {
                index,
                reason: "refused by loopback endpoint".to_owned(),
            });
        }
        let mut state = inner.state.lock().unwrap();
        if state.destroyed {
            return Err(TransportError::Closed);
        }
        state.sinks.insert(index, events.clone());
        debug!(portal = %inner.portal, index, "loopback connection established");
        Ok(Box::new(LoopbackConnection {
            index,
            session: Arc::clone(inner),
            sink: events,
        }))
    }

    fn destroy(&self) {
        let held = {
            let mut state = self.inner.state.lock().unwrap();
            state.destroyed = true;
            state.sinks.clear();
            std::mem::take(&mut state.held)
        };
        debug!(portal = %self.inner.portal, dropped_answers = held.len(), "loopback session destroyed");
        // outside the lock: dropping a context may run a completion
        drop(held);
    }
}

impl TransportConnection for LoopbackConnection {
    fn send(&mut self, mut request: Request) -> Result<(), SendError> {
        if self.session.state.lock().unwrap().destroyed {
            return Err(SendError {
                request,
                error: TransportError::Closed,
            });
        }
        let (kind, reply, data) = match self.session.server.serve(&request) {
            Ok(served) => served,
            Err(error) => return Err(SendError { request, error }),
        };
        let mut header = BytesMut::with_capacity(xnbd_proto::MAX_MSG_LEN);
        reply.encode(&mut header);

        let (hold, strip) = {
            let mut faults = self.session.server.faults.lock().unwrap();
            if kind.is_control() {
                (faults.hold_control, false)
            } else {
                let strip = faults.strip_io_contexts > 0;
                if strip {
                    faults.strip_io_contexts -= 1;
                }
                (faults.hold_io, strip)
            }
        };
        let context = request.context.take();
        let response = Response {
            header: header.freeze(),
            data,
            context: if strip { None } else { context },
        };
        trace!(index = self.index, ?kind, ret = reply.ret, "served");

        let mut state = self.session.state.lock().unwrap();
        if kind == CommandKind::IoSubmit {
            *state.submits.entry(self.index).or_default() += 1;
        }
        if hold {
            state.held.push(HeldAnswer {
                index: self.index,
                kind,
                response,
            });
            return Ok(());
        }
        drop(state);
        // a connection whose reactor is gone drops the answer
        let _ = self.sink.deliver(TransportEvent::Response(response));
        Ok(())
    }

    fn destroy(self: Box<Self>) {
        let mut state = self.session.state.lock().unwrap();
        state.sinks.remove(&self.index);
        state.destroyed_connections.push(self.index);
        debug!(portal = %self.session.portal, index = self.index, "loopback connection destroyed");
    }
}

impl Server {
    fn serve(&self, request: &Request) -> Result<(CommandKind, Reply, Option<Bytes>), TransportError> {
        let command = Command::decode(&request.header)?;
        let kind = command.kind();
        if let Some(errno) = self.faults.lock().unwrap().fail.get(&kind).copied() {
            return Ok((kind, Reply::failure(kind, errno as i32), None));
        }
        let store = &self.store;
        let served = match command {
            Command::Open { path, flags } => store
                .open(&path, flags)
                .map(|fd| (Reply::success(Answer::Open { fd }), None)),
            Command::Fstat { fd } => store
                .fstat(fd)
                .map(|stat| (Reply::success(Answer::Fstat(stat)), None)),
            Command::Setup { fd, queue_depth } => store
                .setup(fd, queue_depth)
                .map(|()| (Reply::success(Answer::Setup), None)),
            Command::Submit(submit) => match submit.opcode {
                IoOpcode::Read => {
                    let len = (submit.len as usize).min(request.inbound_len);
                    store.read_at(submit.fd, submit.offset, len).map(|data| {
                        let answer = Answer::Submit {
                            data_len: data.len() as u32,
                        };
                        (Reply::success(answer), Some(data))
                    })
                }
                IoOpcode::Write => {
                    let data = request.data.as_deref().unwrap_or_default();
                    if data.len() != submit.len as usize {
                        Err(Errno::EINVAL)
                    } else {
                        store.write_at(submit.fd, submit.offset, data).map(|()| {
                            let answer = Answer::Submit {
                                data_len: submit.len,
                            };
                            (Reply::success(answer), None)
                        })
                    }
                }
            },
        };
        Ok(match served {
            Ok((reply, data)) => (kind, reply, data),
            Err(errno) => (kind, Reply::failure(kind, errno as i32), None),
        })
    }
}
