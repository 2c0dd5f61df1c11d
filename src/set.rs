//! The set of active sessions.
//!
//! Sessions are keyed by RFCOMM channel id with secondary lookups by peer
//! address and SCO handle. Iteration is in insertion order, which keeps
//! multi-session traces readable.

use heapless::Vec;

use crate::config::MAX_SESSIONS;
use crate::error::Error;
use crate::session::Session;
use crate::transport::{BdAddr, ChannelId, ScoHandle};

#[derive(Default)]
pub(crate) struct SessionSet {
    sessions: Vec<Session, MAX_SESSIONS>,
}

impl SessionSet {
    pub fn new() -> Self {
        Self {
            sessions: Vec::new(),
        }
    }

    pub fn add(&mut self, session: Session) -> Result<(), Error> {
        self.sessions
            .push(session)
            .map_err(|_| Error::SessionSetFull)
    }

    pub fn remove_by_channel(&mut self, channel: ChannelId) -> Option<Session> {
        let position = self
            .sessions
            .iter()
            .position(|session| session.channel == channel)?;
        Some(self.sessions.remove(position))
    }

    pub fn by_channel_mut(&mut self, channel: ChannelId) -> Option<&mut Session> {
        self.sessions
            .iter_mut()
            .find(|session| session.channel == channel)
    }

    pub fn by_addr_mut(&mut self, addr: BdAddr) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|session| session.addr == addr)
    }

    pub fn by_sco_mut(&mut self, handle: ScoHandle) -> Option<&mut Session> {
        self.sessions
            .iter_mut()
            .find(|session| session.sco_handle == Some(handle))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.iter_mut()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}
