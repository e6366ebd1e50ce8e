use crate::session_id::{find_weak, SessionId128};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

/// Result of routing an inbound packet's session id to a session object.
#[derive(Debug, PartialEq, Eq)]
pub enum Lookup<'a, V> {
    /// Strong match, or a weak match verified strong.
    Match(&'a V),
    /// An entry shares the 64-bit shortform but differs on full comparison.
    ///  This is a genuine cookie collision and must be treated as 'not the
    ///  same session' - reject or create fresh, never assume identity.
    Collision,
    /// No entry shares even the shortform.
    Miss,
}

/// Demultiplexes inbound packets to sessions by their session id.
///
/// Strong (full-byte) lookup is tried first; a weak (shortform) fallback
///  covers packet types that carry a truncated 64-bit representation of a
///  wider id. The table itself is single-threaded; a dispatcher shared
///  between I/O threads wraps it in one lock or shards it by shortform.
pub struct SessionTable<V> {
    sessions: FxHashMap<SessionId128, V>,
}

impl<V> SessionTable<V> {
    pub fn new() -> SessionTable<V> {
        SessionTable {
            sessions: FxHashMap::default(),
        }
    }

    pub fn insert(&mut self, id: SessionId128, session: V) -> Option<V> {
        debug!("registering session {}", id);
        self.sessions.insert(id, session)
    }

    /// Removes a session on teardown, discarding its reliability state.
    pub fn remove(&mut self, id: &SessionId128) -> Option<V> {
        debug!("discarding session {}", id);
        self.sessions.remove(id)
    }

    pub fn get_mut(&mut self, id: &SessionId128) -> Option<&mut V> {
        self.sessions.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Routes `id` to a session: strong equality first, then the weak
    ///  fallback with an explicit collision verdict.
    pub fn lookup(&self, id: &SessionId128) -> Lookup<'_, V> {
        if let Some(session) = self.sessions.get(id) {
            return Lookup::Match(session);
        }
        match find_weak(&self.sessions, id, true) {
            Some((stored, _)) => {
                warn!("session id {} collides on shortform with established session {}", id, stored);
                Lookup::Collision
            }
            None => Lookup::Miss,
        }
    }
}

impl<V> Default for SessionTable<V> {
    fn default() -> Self {
        Self::new()
    }
}
