//! Remote files opened as block devices.

mod queue;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Weak;

use tracing::{debug, info};
use xnbd_proto::{RemoteStat, OPEN_FLAGS_RDWR};

pub use queue::{HwQueue, QueueAssignment, QueueBinding};

use crate::io::{BlockRequest, SubmitError};
use crate::session::{Session, SessionShared, SessionState};
use crate::{Error, SetupStage, KERNEL_SECTOR_SIZE};

static NEXT_DEVICE_INDEX: AtomicUsize = AtomicUsize::new(0);

pub struct Device {
    index: usize,
    name: String,
    path: String,
    fd: i32,
    stat: RemoteStat,
    queue_depth: u32,
    assignment: QueueAssignment,
    queues: Vec<HwQueue>,
    session: Weak<SessionShared>,
}

impl Device {
    /// Process-wide, never reused.
    pub fn index(&self) -> usize {
        self.index
    }

    /// `xnbd<index>`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The remote path the device was opened from.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }

    /// Taken once at open and never refreshed.
    pub fn stat(&self) -> &RemoteStat {
        &self.stat
    }

    pub fn capacity_sectors(&self) -> u64 {
        self.stat.size / KERNEL_SECTOR_SIZE
    }

    pub fn queue_depth(&self) -> u32 {
        self.queue_depth
    }

    pub fn assignment(&self) -> &QueueAssignment {
        &self.assignment
    }

    pub fn queues(&self) -> &[HwQueue] {
        &self.queues
    }

    pub fn queue(&self, index: usize) -> Option<&HwQueue> {
        self.queues.get(index)
    }

    /// State of the owning session, `None` once it is gone.
    pub fn session_state(&self) -> Option<SessionState> {
        self.session.upgrade().map(|s| s.state())
    }

    pub fn submit(&self, queue: usize, request: BlockRequest) -> Result<(), SubmitError> {
        match self.queues.get(queue) {
            Some(hw_queue) => hw_queue.submit(request),
            None => Err(SubmitError::NoSuchQueue { queue, request }),
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("fd", &self.fd)
            .field("capacity_sectors", &self.capacity_sectors())
            .field("queues", &self.queues.len())
            .finish()
    }
}

/// Open, stat and set up `path` over the session's control connection, then bind one
/// hardware queue per connection. Nothing is kept if any step fails.
pub(crate) async fn open(session: &Session, path: &str) -> Result<Device, Error> {
    let nr_queues = session.connections().len();
    let queue_depth = session.config().queue_depth;
    let mut queues = Vec::new();
    queues
        .try_reserve_exact(nr_queues)
        .map_err(|e| Error::Allocation(format!("hardware queues: {e}")))?;

    let control = session.control_connection();
    debug!(path, control = control.index(), "opening remote file");
    let fd = control
        .open(path, OPEN_FLAGS_RDWR)
        .await
        .map_err(|e| Error::setup(SetupStage::Open, e))?;
    let stat = control
        .stat(fd)
        .await
        .map_err(|e| Error::setup(SetupStage::Stat, e))?;
    control
        .setup(fd, queue_depth)
        .await
        .map_err(|e| Error::setup(SetupStage::Setup, e))?;

    let assignment = QueueAssignment::compute(nr_queues, session.topology().online_nodes());
    for binding in assignment.bindings() {
        let connection = session.connections()[binding.connection].clone();
        queues.push(HwQueue::new(*binding, connection, fd));
    }

    let index = NEXT_DEVICE_INDEX.fetch_add(1, Ordering::Relaxed);
    let device = Device {
        index,
        name: format!("xnbd{index}"),
        path: path.to_owned(),
        fd,
        stat,
        queue_depth,
        assignment,
        queues,
        session: std::sync::Arc::downgrade(session.shared()),
    };
    info!(
        portal = session.portal(),
        device = %device.name,
        path,
        fd,
        capacity_sectors = device.capacity_sectors(),
        nr_queues,
        "device registered"
    );
    Ok(device)
}
