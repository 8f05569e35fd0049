//! Session directory: `{dir}/{session_id}.json` marks a live agent session.

use std::path::{Path, PathBuf};

use fleetbus_core::session::{SessionDirectory, validate_session_id};

/// Looks up sessions as files in a directory.
#[derive(Debug, Clone)]
pub struct SessionFiles {
    dir: PathBuf,
}

impl SessionFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a session file. Only call with an id that passed validation.
    pub fn session_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.json"))
    }
}

impl SessionDirectory for SessionFiles {
    fn exists(&self, session_id: &str) -> bool {
        validate_session_id(session_id).is_ok() && self.session_path(session_id).is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetbus_core::session::check_session;
    use fleetbus_types::error::SessionError;
    use tempfile::TempDir;

    #[test]
    fn existing_session_file_is_accepted() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("S-1.json"), "{}").unwrap();
        let sessions = SessionFiles::new(tmp.path());

        assert!(sessions.exists("S-1"));
        assert!(!sessions.exists("S-2"));
        assert!(check_session(&sessions, "S-1").is_ok());
    }

    #[test]
    fn traversal_never_reaches_the_filesystem() {
        let tmp = TempDir::new().unwrap();
        let nested = tmp.path().join("sessions");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(tmp.path().join("outside.json"), "{}").unwrap();
        let sessions = SessionFiles::new(&nested);

        assert!(!sessions.exists("../outside"));
        assert!(matches!(
            check_session(&sessions, "../../../etc/passwd"),
            Err(SessionError::InvalidId(_))
        ));
    }
}
