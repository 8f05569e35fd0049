//! Session id validation.
//!
//! A session id names a file on disk, so it is checked for a safe charset
//! before anything touches the filesystem, then checked for existence.

use fleetbus_types::error::SessionError;

/// Longest accepted session id.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Answers whether a session exists. Implemented over the sessions directory.
pub trait SessionDirectory: Send + Sync {
    fn exists(&self, session_id: &str) -> bool;
}

/// Reject empty ids and anything outside `[A-Za-z0-9_-]`.
pub fn validate_session_id(session_id: &str) -> Result<(), SessionError> {
    if session_id.is_empty() {
        return Err(SessionError::Missing);
    }
    let safe = session_id.len() <= MAX_SESSION_ID_LEN
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if safe {
        Ok(())
    } else {
        Err(SessionError::InvalidId(session_id.to_string()))
    }
}

/// Full check used by registration: safe charset and a real session.
pub fn check_session(
    sessions: &dyn SessionDirectory,
    session_id: &str,
) -> Result<(), SessionError> {
    validate_session_id(session_id)?;
    if sessions.exists(session_id) {
        Ok(())
    } else {
        Err(SessionError::Unknown(session_id.to_string()))
    }
}
