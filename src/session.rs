//! Connection tokens and the server-side session registry.
//!
//! A [`ConnectionToken`] is the opaque credential a client carries on every
//! request after the `authenticate` handshake. The server maps it to a
//! [`Session`] holding per-connection state: the authenticated principal,
//! the optional client id, the delivery-enabled flag, and the temporary
//! destinations owned by the session. Tokens are invalidated at
//! `connection_closing` or when the connection tears down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::message::Destination;

/// Opaque session credential. Zero means "no session yet" and is never
/// issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionToken(pub u64);

impl ConnectionToken {
    /// The pre-handshake placeholder carried on handshake opcodes.
    pub const NONE: ConnectionToken = ConnectionToken(0);

    /// Whether this is a real, issued token.
    pub fn is_set(&self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for ConnectionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Per-session state held by the server.
#[derive(Debug, Default)]
pub struct Session {
    /// Authenticated principal.
    pub user: String,
    /// Client id, set via `check_id` or assigned via `get_id`.
    pub client_id: Option<String>,
    /// Whether asynchronous delivery to this session is enabled.
    pub enabled: bool,
    /// Temporary destinations owned by this session, reaped on close.
    pub temporaries: Vec<Destination>,
}

/// Registry of live sessions, keyed by token.
///
/// One coarse lock: entries are touched once per request, contention is
/// bounded by request throughput.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<ConnectionToken, Session>>,
    serial: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            serial: AtomicU64::new(1),
        }
    }

    /// Issue a token for an authenticated principal.
    pub fn open(&self, user: &str) -> ConnectionToken {
        let token = ConnectionToken(self.next_token_value());
        let session = Session {
            user: user.to_string(),
            ..Session::default()
        };
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(token, session);
        token
    }

    /// Whether the token names a live session.
    pub fn is_valid(&self, token: ConnectionToken) -> bool {
        token.is_set()
            && self
                .sessions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains_key(&token)
    }

    /// Run `f` against the session for `token`, if it exists.
    pub fn with_session<R>(
        &self,
        token: ConnectionToken,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Option<R> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&token)
            .map(f)
    }

    /// Invalidate a token, returning the closed session's state (for
    /// temporary-destination reaping).
    pub fn close(&self, token: ConnectionToken) -> Option<Session> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&token)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Token values mix a serial with clock noise so they are unique within
    /// a server and not guessable from each other.
    fn next_token_value(&self) -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        let serial = self.serial.fetch_add(1, Ordering::Relaxed);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let mixed = nanos.wrapping_mul(0x517cc1b727220a95) ^ (serial << 32);
        // Never issue the reserved zero value.
        if mixed == 0 {
            1
        } else {
            mixed
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_validate_close() {
        let registry = SessionRegistry::new();
        let token = registry.open("guest");

        assert!(token.is_set());
        assert!(registry.is_valid(token));
        assert_eq!(registry.len(), 1);

        let session = registry.close(token).unwrap();
        assert_eq!(session.user, "guest");
        assert!(!registry.is_valid(token));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_zero_token_never_valid() {
        let registry = SessionRegistry::new();
        registry.open("guest");
        assert!(!registry.is_valid(ConnectionToken::NONE));
    }

    #[test]
    fn test_tokens_unique() {
        let registry = SessionRegistry::new();
        let a = registry.open("u1");
        let b = registry.open("u2");
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_with_session_mutation() {
        let registry = SessionRegistry::new();
        let token = registry.open("guest");

        registry
            .with_session(token, |s| {
                s.client_id = Some("client-7".to_string());
                s.enabled = true;
            })
            .unwrap();

        let id = registry
            .with_session(token, |s| s.client_id.clone())
            .unwrap();
        assert_eq!(id.as_deref(), Some("client-7"));

        assert!(registry
            .with_session(ConnectionToken(12345), |_| ())
            .is_none());
    }

    #[test]
    fn test_close_returns_temporaries() {
        let registry = SessionRegistry::new();
        let token = registry.open("guest");
        registry
            .with_session(token, |s| {
                s.temporaries
                    .push(Destination::TemporaryQueue("t-1".into()));
            })
            .unwrap();

        let session = registry.close(token).unwrap();
        assert_eq!(session.temporaries.len(), 1);
    }
}
