//! A session with one remote portal: the connection pool and the devices opened over it.

mod connection;
pub(crate) mod reactor;
mod registry;

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use connection::{ConnectionHandle, ConnectionState};
pub use registry::SessionRegistry;

use self::connection::{Spawned, Worker};
use crate::control::ControlPolicy;
use crate::device::{self, Device};
use crate::metrics::{MetricsStorage, GLOBAL_STORAGE};
use crate::transport::{Transport, TransportSession};
use crate::{env_tunables, Error, Topology};

/// Longest portal address accepted.
pub const MAX_PORTAL_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    TearingDown,
    Closed,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Connections, and thereby hardware queues per device.
    pub nr_connections: usize,
    /// IO units in flight per connection.
    pub queue_depth: u32,
    pub pin_threads: bool,
    pub control_policy: ControlPolicy,
}

impl Default for SessionConfig {
    /// One connection per online cpu, the rest from the `XNBD_*` environment.
    fn default() -> Self {
        let nr_connections = (*env_tunables::NR_CONNECTIONS)
            .unwrap_or_else(|| Topology::detect().online_cpus().len());
        SessionConfig {
            nr_connections,
            queue_depth: *env_tunables::HW_QUEUE_DEPTH,
            pin_threads: *env_tunables::PIN_CONNECTION_THREADS,
            control_policy: ControlPolicy::default(),
        }
    }
}

impl SessionConfig {
    fn validate(&self) -> Result<(), Error> {
        if self.nr_connections == 0 {
            return Err(Error::InvalidConfig("a session needs at least one connection"));
        }
        if self.queue_depth == 0 {
            return Err(Error::InvalidConfig("queue depth must be positive"));
        }
        Ok(())
    }
}

/// What the connection threads share with the owner.
pub(crate) struct SessionShared {
    pub(crate) portal: String,
    pub(crate) transport: Arc<dyn TransportSession>,
    pub(crate) stop: CancellationToken,
    state: Mutex<SessionState>,
    transport_destroyed: AtomicBool,
    live_threads: AtomicUsize,
}

impl SessionShared {
    pub(crate) fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    fn activate(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == SessionState::Connecting {
            *state = SessionState::Active;
            true
        } else {
            false
        }
    }

    fn begin_teardown(&self) {
        let mut state = self.state.lock().unwrap();
        if matches!(*state, SessionState::Connecting | SessionState::Active) {
            *state = SessionState::TearingDown;
        }
    }

    /// A session teardown arrived on one of the reactors.
    pub(crate) fn on_teardown_event(&self) {
        self.begin_teardown();
        self.destroy_transport();
        self.stop.cancel();
    }

    fn destroy_transport(&self) {
        if !self.transport_destroyed.swap(true, Ordering::AcqRel) {
            self.transport.destroy();
            debug!(portal = %self.portal, "transport session destroyed");
        }
    }

    pub(crate) fn thread_starting(&self) {
        self.live_threads.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn thread_never_started(&self) {
        self.live_threads.fetch_sub(1, Ordering::AcqRel);
    }

    /// Called by every connection thread on its way out. The last one closes the session.
    pub(crate) fn connection_exited(&self) {
        if self.live_threads.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        self.destroy_transport();
        self.close();
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap();
        if *state != SessionState::Closed {
            *state = SessionState::Closed;
            MetricsStorage::inc(&GLOBAL_STORAGE.sessions_destroyed);
            info!(portal = %self.portal, "session closed");
        }
    }
}

pub struct Session {
    shared: Arc<SessionShared>,
    config: SessionConfig,
    topology: Topology,
    connections: Vec<ConnectionHandle>,
    workers: Vec<Worker>,
    devices: Vec<Arc<Device>>,
}

impl Session {
    /// Connect to `portal` with one connection per `config.nr_connections`, on the
    /// topology of this host.
    pub async fn create(
        transport: &dyn Transport,
        portal: &str,
        config: SessionConfig,
    ) -> Result<Session, Error> {
        Self::create_with_topology(transport, portal, config, Topology::detect()).await
    }

    /// Like [`Session::create`]. Either every connection is established, or every one that
    /// was is torn down again, last first, and the error of the first failure returned.
    pub async fn create_with_topology(
        transport: &dyn Transport,
        portal: &str,
        config: SessionConfig,
        topology: Topology,
    ) -> Result<Session, Error> {
        validate_portal(portal)?;
        config.validate()?;
        let transport_session = transport.create_session(portal)?;
        let shared = Arc::new(SessionShared {
            portal: portal.to_owned(),
            transport: transport_session,
            stop: CancellationToken::new(),
            state: Mutex::new(SessionState::Connecting),
            transport_destroyed: AtomicBool::new(false),
            live_threads: AtomicUsize::new(0),
        });
        MetricsStorage::inc(&GLOBAL_STORAGE.sessions_created);

        let mut spawned = Vec::with_capacity(config.nr_connections);
        let mut failure = None;
        for index in 0..config.nr_connections {
            let pin_to = config
                .pin_threads
                .then(|| topology.cpu_for_connection(index));
            match connection::spawn(&shared, index, pin_to, config.queue_depth) {
                Ok(s) => spawned.push(s),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let mut connections = Vec::with_capacity(spawned.len());
        let mut workers = Vec::with_capacity(spawned.len());
        for Spawned {
            handle,
            worker,
            ready,
        } in spawned
        {
            if failure.is_none() {
                match ready.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => failure = Some(e),
                    Err(_) => {
                        failure = Some(Error::ConnectionClosed {
                            index: handle.index(),
                        })
                    }
                }
            }
            connections.push(handle);
            workers.push(worker);
        }
        if failure.is_none() && !shared.activate() {
            failure = Some(Error::SessionTornDown);
        }
        if let Some(e) = failure {
            warn!(portal, error = %e, "session establishment failed, unwinding");
            unwind(&shared, workers).await;
            return Err(e);
        }

        info!(
            portal,
            nr_connections = config.nr_connections,
            queue_depth = config.queue_depth,
            "session established"
        );
        Ok(Session {
            shared,
            config,
            topology,
            connections,
            workers,
            devices: Vec::new(),
        })
    }

    pub fn portal(&self) -> &str {
        &self.shared.portal
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn connections(&self) -> &[ConnectionHandle] {
        &self.connections
    }

    pub fn connection(&self, index: usize) -> Option<&ConnectionHandle> {
        self.connections.get(index)
    }

    /// The connection control RPCs go to, per [`SessionConfig::control_policy`].
    pub fn control_connection(&self) -> &ConnectionHandle {
        let index = self.config.control_policy.select(self.connections.len());
        &self.connections[index]
    }

    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    pub fn device(&self, index: usize) -> Option<&Arc<Device>> {
        self.devices.iter().find(|d| d.index() == index)
    }

    /// Open `path` on the remote server and register it as a device of this session.
    pub async fn open_device(&mut self, path: &str) -> Result<Arc<Device>, Error> {
        if self.state() != SessionState::Active {
            return Err(Error::SessionTornDown);
        }
        let device = Arc::new(device::open(self, path).await?);
        self.devices.push(Arc::clone(&device));
        Ok(device)
    }

    /// Unregister a device. In-flight requests still complete.
    pub fn remove_device(&mut self, index: usize) -> Option<Arc<Device>> {
        let position = self.devices.iter().position(|d| d.index() == index)?;
        let device = self.devices.remove(position);
        info!(portal = %self.shared.portal, device = %device.name(), "device removed");
        Some(device)
    }

    pub(crate) fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }

    /// Stop every connection, wait for their threads, and destroy the transport session.
    pub async fn shutdown(mut self) {
        info!(portal = %self.shared.portal, "session shutting down");
        self.devices.clear();
        let workers = std::mem::take(&mut self.workers);
        self.shared.begin_teardown();
        self.shared.stop.cancel();
        for worker in workers.into_iter().rev() {
            worker.join().await;
        }
        self.shared.destroy_transport();
        self.shared.close();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        // not awaited: the threads finish on their own
        debug!(portal = %self.shared.portal, "session dropped without shutdown");
        self.shared.begin_teardown();
        self.shared.stop.cancel();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("portal", &self.shared.portal)
            .field("state", &self.state())
            .field("connections", &self.connections.len())
            .field("devices", &self.devices.len())
            .finish()
    }
}

async fn unwind(shared: &Arc<SessionShared>, workers: Vec<Worker>) {
    shared.begin_teardown();
    for worker in workers.into_iter().rev() {
        worker.stop();
        worker.join().await;
    }
    shared.destroy_transport();
    shared.close();
}

pub(crate) fn validate_portal(portal: &str) -> Result<(), Error> {
    if portal.is_empty()
        || portal.len() > MAX_PORTAL_LEN
        || portal.chars().any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(Error::InvalidPortal(portal.to_owned()));
    }
    Ok(())
}
