use std::collections::BTreeMap;

use tracing::info;

use super::{validate_portal, Session, SessionConfig, SessionState};
use crate::transport::Transport;
use crate::{Error, Topology};

/// All sessions of this client, at most one per portal.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: BTreeMap<String, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_session(
        &mut self,
        transport: &dyn Transport,
        portal: &str,
        config: SessionConfig,
    ) -> Result<&mut Session, Error> {
        self.create_session_with_topology(transport, portal, config, Topology::detect())
            .await
    }

    pub async fn create_session_with_topology(
        &mut self,
        transport: &dyn Transport,
        portal: &str,
        config: SessionConfig,
        topology: Topology,
    ) -> Result<&mut Session, Error> {
        validate_portal(portal)?;
        if self.sessions.contains_key(portal) {
            return Err(Error::DuplicatePortal(portal.to_owned()));
        }
        let session = Session::create_with_topology(transport, portal, config, topology).await?;
        Ok(self.sessions.entry(portal.to_owned()).or_insert(session))
    }

    pub fn session(&self, portal: &str) -> Option<&Session> {
        self.sessions.get(portal)
    }

    pub fn session_mut(&mut self, portal: &str) -> Option<&mut Session> {
        self.sessions.get_mut(portal)
    }

    pub fn portals(&self) -> impl Iterator<Item = &str> {
        self.sessions.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Unregister and shut down the session for `portal`. False if there was none.
    pub async fn remove_session(&mut self, portal: &str) -> bool {
        match self.sessions.remove(portal) {
            Some(session) => {
                session.shutdown().await;
                info!(portal, "session unregistered");
                true
            }
            None => false,
        }
    }

    /// Unregister sessions the remote end has torn down. Returns their portals.
    pub async fn prune_closed(&mut self) -> Vec<String> {
        let closed: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| matches!(s.state(), SessionState::TearingDown | SessionState::Closed))
            .map(|(portal, _)| portal.clone())
            .collect();
        for portal in &closed {
            self.remove_session(portal).await;
        }
        closed
    }

    /// Shut every session down concurrently.
    pub async fn shutdown_all(&mut self) {
        let sessions = std::mem::take(&mut self.sessions);
        futures::future::join_all(sessions.into_iter().map(|(portal, session)| async move {
            session.shutdown().await;
            info!(portal = %portal, "session unregistered");
        }))
        .await;
    }
}
