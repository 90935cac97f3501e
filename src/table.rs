//! Concurrent session table keyed by the flow 4-tuple

use crate::config::EngineConfig;
use crate::error::{Result, StackError};
use crate::session::{Session, SessionKind, TcpFlow};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowProto {
    Tcp,
    Udp,
}

/// Flow identity: device-side socket, remote socket, protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub proto: FlowProto,
}

impl std::fmt::Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let proto = match self.proto {
            FlowProto::Tcp => "tcp",
            FlowProto::Udp => "udp",
        };
        write!(f, "{} {} -> {}", proto, self.local, self.remote)
    }
}

/// Owns every live [`Session`]. Lookups run in parallel; create and
/// remove are linearized per key by the underlying map.
pub struct SessionTable {
    sessions: DashMap<FlowKey, Arc<Session>>,
    max_sessions: usize,
}

impl SessionTable {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_sessions,
        }
    }

    pub fn get(&self, key: &FlowKey) -> Option<Arc<Session>> {
        self.sessions.get(key).map(|entry| entry.value().clone())
    }

    /// Insert a fresh TCP session. If a concurrent creation races for
    /// the same tuple, the first insert wins and the loser gets it.
    pub fn create_tcp(&self, key: FlowKey, flow: TcpFlow) -> Result<Arc<Session>> {
        self.check_capacity()?;
        match self.sessions.entry(key) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let session = Arc::new(Session::tcp(key, flow));
                entry.insert(session.clone());
                Ok(session)
            }
        }
    }

    /// Insert a fresh UDP session with the same race discipline.
    pub fn create_udp(&self, key: FlowKey) -> Result<Arc<Session>> {
        self.check_capacity()?;
        match self.sessions.entry(key) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let session = Arc::new(Session::udp(key));
                entry.insert(session.clone());
                Ok(session)
            }
        }
    }

    pub fn remove(&self, key: &FlowKey) -> Option<Arc<Session>> {
        self.sessions.remove(key).map(|(_, session)| session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn check_capacity(&self) -> Result<()> {
        if self.sessions.len() >= self.max_sessions {
            return Err(StackError::SessionTableFull(self.max_sessions));
        }
        Ok(())
    }

    /// Remove sessions idle past their protocol's timeout. Keys are
    /// collected first so the sweep never holds shard locks while
    /// removing. Returns the evicted sessions for teardown.
    pub fn evict_idle(&self, config: &EngineConfig) -> Vec<Arc<Session>> {
        let expired: Vec<FlowKey> = self
            .sessions
            .iter()
            .filter(|entry| {
                let timeout = match entry.kind {
                    SessionKind::Tcp(_) => config.tcp.idle_timeout,
                    SessionKind::Udp(_) => config.udp.idle_timeout,
                };
                entry.idle_for() > timeout
            })
            .map(|entry| *entry.key())
            .collect();

        let mut evicted = Vec::with_capacity(expired.len());
        for key in expired {
            if let Some((_, session)) = self.sessions.remove(&key) {
                debug!(%key, "evicting idle session");
                session.abort();
                evicted.push(session);
            }
        }
        evicted
    }

    /// Abort every session, for engine shutdown.
    pub fn drain_all(&self) -> Vec<Arc<Session>> {
        let keys: Vec<FlowKey> = self.sessions.iter().map(|entry| *entry.key()).collect();
        let mut drained = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, session)) = self.sessions.remove(&key) {
                session.abort();
                drained.push(session);
            }
        }
        drained
    }
}
