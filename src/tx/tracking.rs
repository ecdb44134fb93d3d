//! Per-session change tracking.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::model::Identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackingState {
    Added,
    Modified,
    Removed,
}

/// One identity touched by a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingEntry {
    pub id: Identity,
    /// Schema identity of the element.
    pub schema: Identity,
    pub state: TrackingState,
}

/// All identities touched by a session chain, in first-touch order.
#[derive(Debug, Clone, Default)]
pub struct TrackingSet {
    entries: HashMap<Identity, TrackingEntry>,
    order: Vec<Identity>,
}

impl TrackingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a change into the set.
    ///
    /// `Added` and `Removed` replace whatever was recorded. `Modified` only
    /// lands on an identity that is not already `Added` or `Removed`.
    pub fn record(&mut self, id: &Identity, schema: &Identity, state: TrackingState) {
        match self.entries.get_mut(id) {
            Some(entry) => match state {
                TrackingState::Added | TrackingState::Removed => {
                    entry.state = state;
                    entry.schema = schema.clone();
                }
                TrackingState::Modified => {}
            },
            None => {
                self.order.push(id.clone());
                self.entries.insert(
                    id.clone(),
                    TrackingEntry { id: id.clone(), schema: schema.clone(), state },
                );
            }
        }
    }

    pub fn get(&self, id: &Identity) -> Option<&TrackingEntry> {
        self.entries.get(id)
    }

    pub fn state_of(&self, id: &Identity) -> Option<TrackingState> {
        self.entries.get(id).map(|e| e.state)
    }

    /// Entries in first-touch order.
    pub fn entries(&self) -> impl Iterator<Item = &TrackingEntry> {
        self.order.iter().filter_map(|id| self.entries.get(id))
    }

    pub fn removed(&self) -> impl Iterator<Item = &Identity> {
        self.with_state(TrackingState::Removed)
    }

    pub fn added(&self) -> impl Iterator<Item = &Identity> {
        self.with_state(TrackingState::Added)
    }

    fn with_state(&self, state: TrackingState) -> impl Iterator<Item = &Identity> {
        self.entries().filter(move |e| e.state == state).map(|e| &e.id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(key: &str) -> Identity {
        Identity::new("lib", key)
    }

    #[test]
    fn test_modified_never_downgrades_added() {
        let schema = id("Book");
        let mut set = TrackingSet::new();
        set.record(&id("1"), &schema, TrackingState::Added);
        set.record(&id("1"), &schema, TrackingState::Modified);
        assert_eq!(set.state_of(&id("1")), Some(TrackingState::Added));
    }

    #[test]
    fn test_removed_and_readded_win() {
        let schema = id("Book");
        let mut set = TrackingSet::new();
        set.record(&id("1"), &schema, TrackingState::Modified);
        set.record(&id("1"), &schema, TrackingState::Removed);
        assert_eq!(set.state_of(&id("1")), Some(TrackingState::Removed));
        set.record(&id("1"), &schema, TrackingState::Modified);
        assert_eq!(set.state_of(&id("1")), Some(TrackingState::Removed));
        set.record(&id("1"), &schema, TrackingState::Added);
        assert_eq!(set.state_of(&id("1")), Some(TrackingState::Added));
    }

    #[test]
    fn test_first_touch_order() {
        let schema = id("Book");
        let mut set = TrackingSet::new();
        set.record(&id("b"), &schema, TrackingState::Added);
        set.record(&id("a"), &schema, TrackingState::Removed);
        set.record(&id("b"), &schema, TrackingState::Removed);
        let order: Vec<_> = set.entries().map(|e| e.id.key().to_string()).collect();
        assert_eq!(order, vec!["b", "a"]);
        assert_eq!(set.removed().count(), 2);
        assert_eq!(set.added().count(), 0);
    }
}
