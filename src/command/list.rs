use std::{collections::HashSet, time::UNIX_EPOCH};

use serde::Serialize;

use crate::metadata::{Snapshot, SnapshotSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotSummary {
    /// Seconds since the Unix epoch.
    pub time: u64,
    pub files: usize,
    pub total_bytes: u64,
    pub chunks: usize,
    pub unique_chunks: usize,
}

impl From<&Snapshot> for SnapshotSummary {
    fn from(snapshot: &Snapshot) -> Self {
        let chunks = snapshot.files.values().flat_map(|f| f.chunks.iter());
        let unique = chunks.clone().map(|c| c.key()).collect::<HashSet<_>>();

        Self {
            time: snapshot
                .time
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            files: snapshot.files.len(),
            total_bytes: snapshot.total_size(),
            chunks: chunks.count(),
            unique_chunks: unique.len(),
        }
    }
}

/// One summary per snapshot, oldest first.
pub fn list(set: &SnapshotSet) -> Vec<SnapshotSummary> {
    set.snapshots().iter().map(SnapshotSummary::from).collect()
}
