use serde::Serialize;

use crate::registry::RegistrySnapshot;

/// Wire shape of `GET /debug`.
#[derive(Debug, Serialize)]
pub(super) struct DebugView {
    #[serde(rename = "nbTotal")]
    nb_total: u64,
    #[serde(rename = "nbPending")]
    nb_pending: usize,
    /// Live request ids in admission order, as strings.
    queue: Vec<String>,
}

impl DebugView {
    pub(super) fn from_snapshot(snapshot: RegistrySnapshot) -> Self {
        Self {
            nb_total: snapshot.total_issued,
            nb_pending: snapshot.active_ids.len(),
            queue: snapshot
                .active_ids
                .iter()
                .map(|id| id.to_string())
                .collect(),
        }
    }
}
