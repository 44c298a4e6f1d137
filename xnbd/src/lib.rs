//! Expose a file on a remote storage server as a local block device.
//!
//! Every read and write is relayed through an asynchronous, connection-oriented message
//! transport (see [`transport`]). This crate is the request-multiplexing layer between
//! the local block interface and that transport:
//!
//! - a [`Session`] per remote portal owns one connection per CPU, each driven by a
//!   dedicated single-threaded reactor thread;
//! - a control-plane bridge turns the transport's asynchronous answers into
//!   synchronous-style `open` / `stat` / `setup` calls, see [`ConnectionHandle::call`];
//! - a data-plane dispatcher submits reads and writes without blocking and completes
//!   them from the owning reactor, see [`HwQueue::submit`];
//! - a NUMA-aware mapper binds each hardware queue of a [`Device`] to one connection,
//!   see [`QueueAssignment`].
//!
//! # Usage
//!
//! ```no_run
//! # async fn doc() -> Result<(), xnbd::Error> {
//! use xnbd::{transport::loopback::LoopbackTransport, transport::store::MemoryStore};
//! use xnbd::{BlockRequest, Payload, SessionConfig, SessionRegistry};
//!
//! let store = MemoryStore::new();
//! store.insert("/exports/disk0.img", vec![0; 1 << 20]);
//! let transport = LoopbackTransport::new(store);
//!
//! let mut registry = SessionRegistry::new();
//! let session = registry
//!     .create_session(&transport, "rdma://10.0.0.1:1234", SessionConfig::default())
//!     .await?;
//! let device = session.open_device("/exports/disk0.img").await?;
//!
//! let (request, done) = BlockRequest::with_channel(0, Some(Payload::read(4096)));
//! device.submit(0, request).map_err(|e| e.into_error())?;
//! let completion = done.await.expect("every request completes exactly once");
//! assert_eq!(completion.result?, 4096);
//!
//! registry.shutdown_all().await;
//! # Ok(())
//! # }
//! ```

pub mod control;
pub mod device;
mod error;
pub mod io;
pub mod metrics;
pub mod session;
pub mod topology;
pub mod transport;

pub use control::ControlPolicy;
pub use device::{Device, HwQueue, QueueAssignment, QueueBinding};
pub use error::{Error, SetupStage};
pub use io::{BlockRequest, CompleteRequest, IoCompletion, Payload, SubmitError};
pub use session::{
    ConnectionHandle, ConnectionState, Session, SessionConfig, SessionRegistry, SessionState,
};
pub use topology::Topology;

/// Size of a sector as the local block layer counts capacity.
pub const KERNEL_SECTOR_SIZE: u64 = 512;

/// Hardware queue depth used when neither the config nor the environment says otherwise.
pub const DEFAULT_HW_QUEUE_DEPTH: u32 = 64;

#[doc(hidden)]
pub mod env_tunables {
    pub(crate) static HW_QUEUE_DEPTH: once_cell::sync::Lazy<u32> =
        once_cell::sync::Lazy::new(|| {
            std::env::var("XNBD_HW_QUEUE_DEPTH")
                .map(|v| match v.parse::<u32>() {
                    Ok(depth) if depth > 0 => depth,
                    _ => panic!("XNBD_HW_QUEUE_DEPTH must be a positive integer, got {v:?}"),
                })
                .unwrap_or_else(|e| match e {
                    std::env::VarError::NotPresent => crate::DEFAULT_HW_QUEUE_DEPTH,
                    std::env::VarError::NotUnicode(_) => {
                        panic!("XNBD_HW_QUEUE_DEPTH must be a unicode string")
                    }
                })
        });
    pub(crate) static PIN_CONNECTION_THREADS: once_cell::sync::Lazy<bool> =
        once_cell::sync::Lazy::new(|| {
            std::env::var("XNBD_PIN_CONNECTION_THREADS")
                .map(|v| v == "1")
                .unwrap_or_else(|e| match e {
                    std::env::VarError::NotPresent => true, // default-on
                    std::env::VarError::NotUnicode(_) => {
                        panic!("XNBD_PIN_CONNECTION_THREADS must be a unicode string")
                    }
                })
        });
    pub(crate) static NR_CONNECTIONS: once_cell::sync::Lazy<Option<usize>> =
        once_cell::sync::Lazy::new(|| {
            std::env::var("XNBD_NR_CONNECTIONS")
                .map(|v| match v.parse::<usize>() {
                    Ok(n) if n > 0 => Some(n),
                    _ => panic!("XNBD_NR_CONNECTIONS must be a positive integer, got {v:?}"),
                })
                .unwrap_or_else(|e| match e {
                    std::env::VarError::NotPresent => None, // one per online cpu
                    std::env::VarError::NotUnicode(_) => {
                        panic!("XNBD_NR_CONNECTIONS must be a unicode string")
                    }
                })
        });
    pub fn assert_no_unknown_env_vars() {
        std::env::vars()
            .filter_map(|(v, _)| {
                if v.starts_with("XNBD_") {
                    Some(v)
                } else {
                    None
                }
            })
            .for_each(|v| match v.as_str() {
                "XNBD_HW_QUEUE_DEPTH" | "XNBD_PIN_CONNECTION_THREADS" | "XNBD_NR_CONNECTIONS" => {}
                x => panic!("env var starts with XNBD_ but is not an env_tunable: {x:?}"),
            });
    }
}
