use std::fmt;

use xnbd_proto::{CodecError, CommandKind};

use crate::transport::TransportError;

/// The step of a device open that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStage {
    Open,
    Stat,
    Setup,
}

impl fmt::Display for SetupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SetupStage::Open => "open",
            SetupStage::Stat => "stat",
            SetupStage::Setup => "io setup",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("allocation failed: {0}")]
    Allocation(String),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("protocol: {0}")]
    Protocol(#[from] CodecError),
    #[error("remote io failed with ret {ret}, errno {errno}")]
    RemoteIo { ret: i32, errno: i32 },
    #[error("remote {kind:?} failed with errno {errno}")]
    RemoteControl { kind: CommandKind, errno: i32 },
    #[error("{kind:?} answered without a body")]
    MissingAnswer { kind: CommandKind },
    #[error("device {stage} failed")]
    Setup {
        stage: SetupStage,
        #[source]
        source: Box<Error>,
    },
    #[error("connection {index} is closed")]
    ConnectionClosed { index: usize },
    #[error("control slot of connection {index} is poisoned by an interrupted call")]
    ControlPoisoned { index: usize },
    #[error("connection {index} has its full queue depth in flight")]
    Busy { index: usize },
    #[error("device has no hardware queue {queue}")]
    NoSuchQueue { queue: usize },
    #[error("invalid session config: {0}")]
    InvalidConfig(&'static str),
    #[error("session is torn down")]
    SessionTornDown,
    #[error("transfer of {len} bytes exceeds the {max} byte transfer unit")]
    Unsupported { len: usize, max: usize },
    #[error("a session for portal {0:?} already exists")]
    DuplicatePortal(String),
    #[error("invalid portal {0:?}")]
    InvalidPortal(String),
    #[error("request was discarded before the remote answered")]
    Discarded,
}

impl Error {
    pub(crate) fn setup(stage: SetupStage, source: Error) -> Self {
        Error::Setup {
            stage,
            source: Box::new(source),
        }
    }

    /// The remote errno, if this error (or the setup step it wraps) came from the server.
    pub fn remote_errno(&self) -> Option<i32> {
        match self {
            Error::RemoteIo { errno, .. } | Error::RemoteControl { errno, .. } => Some(*errno),
            Error::Setup { source, .. } => source.remote_errno(),
            _ => None,
        }
    }
}
