//! Session registry.
//!
//! Transport callbacks carry a `u64` context, not a reference. The context
//! is a generation-checked token into this registry, so an event that
//! arrives after its session was dropped resolves to nothing instead of
//! touching freed state.

use crate::async_websocket::SessionShared;

use ovio_core::arena::Arena;
use ovio_core::error::Result;
use ovio_core::token::Token;

use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};

/// Upper bound on live asynchronous sessions per registry.
pub const MAX_SESSIONS: usize = 65_536;

/// Handle of a registered session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionToken(Token);

impl SessionToken {
    #[inline]
    pub fn to_u64(self) -> u64 {
        self.0.to_u64()
    }

    #[inline]
    pub fn from_u64(raw: u64) -> Self {
        SessionToken(Token::from_u64(raw))
    }
}

pub struct SessionRegistry {
    sessions: Mutex<Arena<Arc<SessionShared>>>,
}

static GLOBAL: OnceLock<Arc<SessionRegistry>> = OnceLock::new();

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_capacity(MAX_SESSIONS)
    }

    pub fn with_capacity(max: usize) -> Self {
        Self { sessions: Mutex::new(Arena::new(max)) }
    }

    /// Process-wide registry used by `AsyncWebSocket::new`.
    pub fn global() -> Arc<SessionRegistry> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(SessionRegistry::new())))
    }

    pub(crate) fn insert(&self, session: Arc<SessionShared>) -> Result<SessionToken> {
        self.sessions.lock().insert(session).map(SessionToken)
    }

    /// `None` once the session has been removed.
    pub(crate) fn get(&self, token: SessionToken) -> Option<Arc<SessionShared>> {
        self.sessions.lock().get(token.0).cloned()
    }

    pub(crate) fn remove(&self, token: SessionToken) -> bool {
        self.sessions.lock().remove(token.0).is_some()
    }

    pub fn contains(&self, token: SessionToken) -> bool {
        self.sessions.lock().contains(token.0)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry").field("len", &self.len()).finish()
    }
}
