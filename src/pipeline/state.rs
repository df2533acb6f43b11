use serde::Serialize;
use std::collections::BTreeMap;

/// Where a relation stands within one run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum RelationState {
    Absent,
    Staged,
    Dimensioned,
    Facted,
    Failed,
}

impl RelationState {
    pub fn as_str(&self) -> &str {
        match self {
            RelationState::Absent => "Absent",
            RelationState::Staged => "Staged",
            RelationState::Dimensioned => "Dimensioned",
            RelationState::Facted => "Facted",
            RelationState::Failed => "Failed",
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, RelationState::Failed)
    }
}

/// State of every relation the run touches, keyed by configured name.
#[derive(Debug, Default, Clone, Serialize)]
#[serde(transparent)]
pub struct RelationStates(BTreeMap<String, RelationState>);

impl RelationStates {
    pub fn get(&self, relation: &str) -> RelationState {
        self.0.get(relation).copied().unwrap_or(RelationState::Absent)
    }

    pub fn set(&mut self, relation: &str, state: RelationState) {
        self.0.insert(relation.to_string(), state);
    }

    /// First of `deps` that failed, if any.
    pub fn failed_dependency<'d>(&self, deps: impl IntoIterator<Item = &'d str>) -> Option<&'d str> {
        deps.into_iter().find(|d| self.get(d).is_failed())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, RelationState)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}
