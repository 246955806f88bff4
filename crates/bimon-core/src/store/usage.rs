//! Recency tracking and retention for derived working copies.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::CommitId;

use super::index::write_json_atomic;
use super::{Result, StoreError};

/// File recording working-copy recency inside the store root.
pub const USAGE_FILE: &str = "usage.json";

/// Most-recently-used order of extracted working copies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageLog {
    /// Most recent first.
    pub order: Vec<CommitId>,
}

impl UsageLog {
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(USAGE_FILE);
        match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                path,
                reason: format!("unreadable usage log: {e}"),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        write_json_atomic(&root.join(USAGE_FILE), self)
    }

    /// Move `commit` to the front.
    pub fn touch(&mut self, commit: &CommitId) {
        self.order.retain(|c| c != commit);
        self.order.insert(0, commit.clone());
    }

    pub fn forget(&mut self, commit: &CommitId) {
        self.order.retain(|c| c != commit);
    }
}

/// Pick which of `present` working copies to delete so that only the
/// `keep` most recently used remain.
///
/// Copies missing from the usage log count as least recently used; ties
/// among them are broken by commit id for determinism.
pub fn select_evictions(present: &[CommitId], usage: &UsageLog, keep: usize) -> Vec<CommitId> {
    let rank: HashMap<&CommitId, usize> = usage
        .order
        .iter()
        .enumerate()
        .map(|(i, c)| (c, i))
        .collect();
    let mut ordered: Vec<&CommitId> = present.iter().collect();
    ordered.sort_by(|a, b| {
        let ra = rank.get(a).copied().unwrap_or(usize::MAX);
        let rb = rank.get(b).copied().unwrap_or(usize::MAX);
        ra.cmp(&rb).then_with(|| a.cmp(b))
    });
    ordered.into_iter().skip(keep).cloned().collect()
}
