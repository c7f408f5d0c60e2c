//! Live session registry
//!
//! Owns every in-flight session, keyed by an arena handle, with a secondary
//! index by measurement id. Enforces the two concurrency limits: at most one
//! outbound session, and at most `max_inbound` inbound ones.

use std::collections::HashMap;
use thiserror::Error;

use crate::session::Session;
use crate::types::{Direction, SessionHandle, SessionId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("An outbound session is already active")]
    OutboundBusy,
    #[error("Inbound session limit reached ({0})")]
    InboundFull(usize),
    #[error("Duplicate measurement id: {0}")]
    DuplicateId(SessionId),
}

pub struct SessionRegistry {
    next_handle: u64,
    sessions: HashMap<SessionHandle, Session>,
    by_id: HashMap<SessionId, SessionHandle>,
    outbound: Option<SessionHandle>,
    max_inbound: usize,
}

impl SessionRegistry {
    pub fn new(max_inbound: usize) -> Self {
        Self {
            next_handle: 0,
            sessions: HashMap::new(),
            by_id: HashMap::new(),
            outbound: None,
            max_inbound,
        }
    }

    /// Reserve a fresh handle; never returns one that was used before
    pub fn mint_handle(&mut self) -> SessionHandle {
        self.next_handle += 1;
        SessionHandle(self.next_handle)
    }

    /// Check the limits a new session of `direction` would hit
    pub fn check_admission(
        &self,
        id: &SessionId,
        direction: Direction,
    ) -> Result<(), RegistryError> {
        if self.by_id.contains_key(id) {
            return Err(RegistryError::DuplicateId(id.clone()));
        }
        match direction {
            Direction::Outbound if self.outbound.is_some() => Err(RegistryError::OutboundBusy),
            Direction::Inbound if !self.has_inbound_capacity() => {
                Err(RegistryError::InboundFull(self.max_inbound))
            }
            _ => Ok(()),
        }
    }

    /// Register a session. On error the session is handed back so the caller
    /// can release it.
    pub fn insert(&mut self, session: Session) -> Result<SessionHandle, (RegistryError, Session)> {
        if let Err(e) = self.check_admission(&session.id, session.direction) {
            return Err((e, session));
        }
        let handle = session.handle;
        if session.direction == Direction::Outbound {
            self.outbound = Some(handle);
        }
        self.by_id.insert(session.id.clone(), handle);
        self.sessions.insert(handle, session);
        Ok(handle)
    }

    pub fn get(&self, handle: SessionHandle) -> Option<&Session> {
        self.sessions.get(&handle)
    }

    pub fn get_mut(&mut self, handle: SessionHandle) -> Option<&mut Session> {
        self.sessions.get_mut(&handle)
    }

    pub fn lookup(&self, id: &SessionId) -> Option<SessionHandle> {
        self.by_id.get(id).copied()
    }

    pub fn outbound(&self) -> Option<SessionHandle> {
        self.outbound
    }

    /// The outbound session, only if it carries this measurement id
    pub fn outbound_matching(&self, id: &SessionId) -> Option<SessionHandle> {
        self.outbound
            .filter(|h| self.sessions.get(h).map(|s| &s.id == id).unwrap_or(false))
    }

    pub fn inbound_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|s| s.direction == Direction::Inbound)
            .count()
    }

    pub fn has_inbound_capacity(&self) -> bool {
        self.inbound_count() < self.max_inbound
    }

    /// Remove a session. Returns it only the first time, so teardown work
    /// keyed on the result runs exactly once.
    pub fn teardown(&mut self, handle: SessionHandle) -> Option<Session> {
        let session = self.sessions.remove(&handle)?;
        self.by_id.remove(&session.id);
        if self.outbound == Some(handle) {
            self.outbound = None;
        }
        Some(session)
    }

    /// Remove every session
    pub fn drain(&mut self) -> Vec<Session> {
        self.by_id.clear();
        self.outbound = None;
        self.sessions.drain().map(|(_, s)| s).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
