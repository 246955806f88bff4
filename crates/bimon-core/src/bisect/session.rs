//! Persisted bisect marks, so an interrupted session can be resumed.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::BisectError;
use crate::domain::{BimonError, CommitId, Result};
use crate::store::index::write_json_atomic;

pub const SESSION_FILE: &str = "session.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMarks {
    pub good: BTreeSet<CommitId>,
    pub bad: BTreeSet<CommitId>,
    pub skip: BTreeSet<CommitId>,
}

impl SessionMarks {
    pub fn is_empty(&self) -> bool {
        self.good.is_empty() && self.bad.is_empty() && self.skip.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub marks: SessionMarks,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4().to_string(),
            marks: SessionMarks::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn path(root: &Path) -> PathBuf {
        root.join(SESSION_FILE)
    }

    pub fn load(root: &Path) -> Result<Self> {
        let path = Self::path(root);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BisectError::NoSession(path.display().to_string()).into())
            }
            Err(e) => return Err(BimonError::Io(e)),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn save(&mut self, root: &Path, marks: SessionMarks) -> Result<()> {
        self.marks = marks;
        self.updated_at = Utc::now();
        write_json_atomic(&Self::path(root), self)?;
        Ok(())
    }

    /// Remove the saved session; a missing file is fine.
    pub fn clear(root: &Path) -> Result<()> {
        match std::fs::remove_file(Self::path(root)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BimonError::Io(e)),
        }
    }
}

impl Default for SessionRecord {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_clear() {
        let dir = tempfile::tempdir().unwrap();
        let mut record = SessionRecord::new();
        let marks = SessionMarks {
            good: BTreeSet::from([CommitId::new("aaaa1111").unwrap()]),
            bad: BTreeSet::from([CommitId::new("bbbb2222").unwrap()]),
            skip: BTreeSet::new(),
        };
        record.save(dir.path(), marks.clone()).unwrap();

        let loaded = SessionRecord::load(dir.path()).unwrap();
        assert_eq!(loaded.marks, marks);
        assert_eq!(loaded.session_id, record.session_id);

        SessionRecord::clear(dir.path()).unwrap();
        SessionRecord::clear(dir.path()).unwrap();
        assert!(matches!(
            SessionRecord::load(dir.path()),
            Err(BimonError::Bisect(BisectError::NoSession(_)))
        ));
    }
}
