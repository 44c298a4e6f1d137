//! The event loop of one connection: transport events in, commands from submitters in.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use xnbd_proto::{Command, Reply};

use super::connection::{ConnectionShared, ConnectionState};
use super::SessionShared;
use crate::control::ControlSlot;
use crate::io::{self, IoUnit};
use crate::transport::{Response, TransportConnection, TransportEvent};
use crate::Error;

pub(crate) enum ReactorCommand {
    Control {
        command: Command,
        reply: oneshot::Sender<Result<Reply, Error>>,
    },
    ResetControl {
        done: oneshot::Sender<()>,
    },
    Io(IoUnit),
}

enum Flow {
    Continue,
    Exit,
}

pub(super) struct Reactor {
    shared: Arc<ConnectionShared>,
    session: Arc<SessionShared>,
    connection: Option<Box<dyn TransportConnection>>,
    slot: ControlSlot,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    mailbox: mpsc::UnboundedReceiver<ReactorCommand>,
    stop: CancellationToken,
}

impl Reactor {
    pub(super) fn new(
        shared: Arc<ConnectionShared>,
        session: Arc<SessionShared>,
        connection: Box<dyn TransportConnection>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        mailbox: mpsc::UnboundedReceiver<ReactorCommand>,
        stop: CancellationToken,
    ) -> Self {
        Reactor {
            shared,
            session,
            connection: Some(connection),
            slot: ControlSlot::new(),
            events,
            mailbox,
            stop,
        }
    }

    pub(super) async fn run(mut self) {
        info!("reactor running");
        scopeguard::defer_on_success! {tracing::info!("reactor exited")};
        scopeguard::defer_on_unwind! {tracing::error!("reactor panic")};
        loop {
            // answers before new work, so completions free queue depth first
            let flow = tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    debug!("stop requested");
                    Flow::Exit
                }
                Some(event) = self.events.recv() => self.on_event(event),
                Some(command) = self.mailbox.recv() => self.on_command(command),
                else => Flow::Exit,
            };
            if let Flow::Exit = flow {
                break;
            }
        }
        self.finish();
    }

    fn on_event(&mut self, event: TransportEvent) -> Flow {
        match event {
            TransportEvent::Response(response) => {
                self.on_response(response);
                Flow::Continue
            }
            TransportEvent::SessionTeardown => {
                info!("session teardown event");
                self.session.on_teardown_event();
                Flow::Exit
            }
            TransportEvent::ConnectionTeardown => {
                info!("connection teardown event");
                Flow::Exit
            }
            TransportEvent::Disconnected => {
                warn!("connection disconnected");
                self.shared.set_state(ConnectionState::Disconnected);
                Flow::Continue
            }
        }
    }

    fn on_response(&mut self, response: Response) {
        let Response {
            header,
            data,
            context,
        } = response;
        let kind = match xnbd_proto::peek_kind(&header) {
            Ok(kind) => kind,
            Err(e) => {
                error!(error = %e, "dropping undecodable answer");
                return;
            }
        };
        trace!(?kind, "answer");
        if kind.is_control() {
            self.slot.on_answer(&header, context);
        } else {
            io::on_submit_answer(&header, data, context);
        }
    }

    fn on_command(&mut self, command: ReactorCommand) -> Flow {
        match command {
            ReactorCommand::Control { command, reply } => match self.connection.as_deref_mut() {
                Some(connection) => self.slot.issue(&command, reply, connection),
                None => {
                    let _ = reply.send(Err(Error::ConnectionClosed {
                        index: self.shared.index,
                    }));
                }
            },
            ReactorCommand::ResetControl { done } => {
                self.slot.reset();
                let _ = done.send(());
            }
            ReactorCommand::Io(unit) => match self.connection.as_deref_mut() {
                Some(connection) => io::dispatch(unit, connection),
                None => unit.fail(Error::ConnectionClosed {
                    index: self.shared.index,
                }),
            },
        }
        Flow::Continue
    }

    /// Everything still pending here fails: waiters see their reply sender dropped,
    /// IO units complete as discarded when dropped.
    fn finish(&mut self) {
        self.slot.abandon();
        if let Some(connection) = self.connection.take() {
            connection.destroy();
        }
        self.shared.set_state(ConnectionState::Destroyed);
        self.mailbox.close();
        let mut dropped = 0usize;
        while let Ok(command) = self.mailbox.try_recv() {
            drop(command);
            dropped += 1;
        }
        self.events.close();
        while let Ok(event) = self.events.try_recv() {
            drop(event);
            dropped += 1;
        }
        debug!(dropped, "reactor finished");
    }
}
