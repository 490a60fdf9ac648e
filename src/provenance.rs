//! Provenance tracking for the containers launched during a job.
//!
//! Grounded in `JobRunner/JobRunner.py::_update_prov`: each launched
//! container appends one [`ProvenanceAction`] to an append-only list, and
//! the Callback Endpoint reads a point-in-time snapshot of that list
//! (`spec.md` §3, §4.1, §8).

use serde::Deserialize;
use serde::Serialize;

/// A single provenance record for one launched container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceAction {
    /// The module name.
    pub name: String,
    /// The resolved module version, if known.
    pub ver: Option<String>,
    /// The module's git URL.
    pub code_url: String,
    /// The git commit hash the module was built from.
    pub commit: String,
}

/// An append-only accumulator of [`ProvenanceAction`]s for a single job.
///
/// Owned exclusively by the Supervisor Loop (`spec.md` §5: "the live
/// container count... the provenance list and container-handle list" are
/// supervisor-owned state mutated only from the loop). Cloning a snapshot
/// never observes a partially-appended action, since `add` and `snapshot`
/// both take `&mut self`/`&self` on the same owner.
#[derive(Debug, Clone, Default)]
pub struct ProvenanceAggregator {
    /// The ordered list of actions recorded so far.
    actions: Vec<ProvenanceAction>,
}

impl ProvenanceAggregator {
    /// Creates an empty aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a new action.
    pub fn add(&mut self, action: ProvenanceAction) {
        self.actions.push(action);
    }

    /// Returns a consistent snapshot of all actions recorded so far.
    pub fn snapshot(&self) -> Vec<ProvenanceAction> {
        self.actions.clone()
    }

    /// Returns the number of actions recorded so far.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Returns `true` if no actions have been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(name: &str) -> ProvenanceAction {
        ProvenanceAction {
            name: name.to_string(),
            ver: Some(String::from("1.0.0")),
            code_url: format!("https://github.com/kbase/{name}"),
            commit: String::from("deadbeef"),
        }
    }

    #[test]
    fn snapshot_reflects_actions_recorded_before_it_was_taken() {
        let mut prov = ProvenanceAggregator::new();
        prov.add(action("module_a"));
        let snapshot = prov.snapshot();
        prov.add(action("module_b"));

        assert_eq!(snapshot, vec![action("module_a")]);
        assert_eq!(prov.snapshot().len(), 2);
    }

    #[test]
    fn empty_aggregator_has_empty_snapshot() {
        let prov = ProvenanceAggregator::new();
        assert!(prov.is_empty());
        assert!(prov.snapshot().is_empty());
    }
}
