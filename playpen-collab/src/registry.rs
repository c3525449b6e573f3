//! Collaborator roster, partitioned by buffer kind.
//!
//! Subscribers are called synchronously, with the full roster, every
//! time membership or a visible field changes. Heartbeats that change
//! nothing visible do not notify.

use std::collections::BTreeMap;

use playpen_core::BufferKind;
use uuid::Uuid;

use crate::presence::{Cursor, Participant, PresenceChange};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collaborator {
    pub id: Uuid,
    pub name: String,
    pub color: String,
    pub buffer: BufferKind,
    pub cursor: Option<Cursor>,
}

impl From<&Participant> for Collaborator {
    fn from(p: &Participant) -> Self {
        Self {
            id: p.id,
            name: p.name.clone(),
            color: p.color.clone(),
            buffer: p.buffer,
            cursor: p.cursor,
        }
    }
}

/// Everyone present, per buffer kind, ordered by name.
pub type Roster = BTreeMap<BufferKind, Vec<Collaborator>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Box<dyn FnMut(&Roster) + Send>;

#[derive(Default)]
pub struct CollaboratorRegistry {
    members: BTreeMap<BufferKind, BTreeMap<Uuid, Collaborator>>,
    subscribers: Vec<(SubscriptionId, Callback)>,
    next_subscription: u64,
}

impl CollaboratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, callback: impl FnMut(&Roster) + Send + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.subscribers.push((id, Box::new(callback)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sub, _)| *sub != id);
        self.subscribers.len() != before
    }

    /// Apply a presence change on `kind`. Returns whether the roster changed.
    pub fn apply(&mut self, kind: BufferKind, change: &PresenceChange) -> bool {
        let members = self.members.entry(kind).or_default();
        let changed = match change {
            PresenceChange::Joined(p) | PresenceChange::Updated(p) => {
                let entry = Collaborator::from(p);
                members.insert(entry.id, entry.clone()) != Some(entry)
            }
            PresenceChange::Left(id) | PresenceChange::Evicted(id) => members.remove(id).is_some(),
        };

        if changed {
            self.notify();
        }
        changed
    }

    /// Drop every collaborator on `kind`, e.g. when the local session on
    /// that buffer closes.
    pub fn clear_kind(&mut self, kind: BufferKind) -> bool {
        let changed = self
            .members
            .remove(&kind)
            .is_some_and(|members| !members.is_empty());
        if changed {
            self.notify();
        }
        changed
    }

    pub fn for_kind(&self, kind: BufferKind) -> Vec<Collaborator> {
        let mut list: Vec<Collaborator> = self
            .members
            .get(&kind)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        list.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        list
    }

    pub fn roster(&self) -> Roster {
        self.members
            .iter()
            .filter(|(_, members)| !members.is_empty())
            .map(|(kind, _)| (*kind, self.for_kind(*kind)))
            .collect()
    }

    /// Total collaborators across all kinds.
    pub fn len(&self) -> usize {
        self.members.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn notify(&mut self) {
        let roster = self.roster();
        for (_, callback) in &mut self.subscribers {
            callback(&roster);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    fn participant(name: &str, buffer: BufferKind) -> Participant {
        Participant {
            id: Uuid::new_v4(),
            name: name.into(),
            color: "#336699".into(),
            buffer,
            cursor: None,
            last_seen: Instant::now(),
        }
    }

    fn recording(registry: &mut CollaboratorRegistry) -> Arc<Mutex<Vec<Roster>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        registry.subscribe(move |roster| sink.lock().unwrap().push(roster.clone()));
        seen
    }

    #[test]
    fn test_notifies_on_join_and_leave() {
        let mut registry = CollaboratorRegistry::new();
        let seen = recording(&mut registry);
        let bob = participant("Bob", BufferKind::Script);

        assert!(registry.apply(BufferKind::Script, &PresenceChange::Joined(bob.clone())));
        assert!(registry.apply(BufferKind::Script, &PresenceChange::Evicted(bob.id)));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0][&BufferKind::Script][0].name, "Bob");
        assert!(seen[1].is_empty());
    }

    #[test]
    fn test_no_notification_without_visible_change() {
        let mut registry = CollaboratorRegistry::new();
        let bob = participant("Bob", BufferKind::Style);
        registry.apply(BufferKind::Style, &PresenceChange::Joined(bob.clone()));

        let seen = recording(&mut registry);
        assert!(!registry.apply(BufferKind::Style, &PresenceChange::Updated(bob.clone())));
        assert!(!registry.apply(BufferKind::Style, &PresenceChange::Left(Uuid::new_v4())));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_cursor_move_notifies() {
        let mut registry = CollaboratorRegistry::new();
        let mut bob = participant("Bob", BufferKind::Script);
        registry.apply(BufferKind::Script, &PresenceChange::Joined(bob.clone()));
        let seen = recording(&mut registry);

        bob.cursor = Some((0, 3));
        assert!(registry.apply(BufferKind::Script, &PresenceChange::Updated(bob)));

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0][&BufferKind::Script][0].cursor, Some((0, 3)));
    }

    #[test]
    fn test_kinds_are_partitioned() {
        let mut registry = CollaboratorRegistry::new();
        let scripter = participant("Sam", BufferKind::Script);
        registry.apply(BufferKind::Script, &PresenceChange::Joined(scripter));

        assert!(registry.for_kind(BufferKind::Markup).is_empty());
        assert_eq!(registry.for_kind(BufferKind::Script).len(), 1);
        let roster = registry.roster();
        assert!(!roster.contains_key(&BufferKind::Markup));
    }

    #[test]
    fn test_clear_kind() {
        let mut registry = CollaboratorRegistry::new();
        registry.apply(
            BufferKind::Markup,
            &PresenceChange::Joined(participant("Ann", BufferKind::Markup)),
        );
        registry.apply(
            BufferKind::Style,
            &PresenceChange::Joined(participant("Cy", BufferKind::Style)),
        );
        let seen = recording(&mut registry);

        assert!(registry.clear_kind(BufferKind::Markup));
        assert!(!registry.clear_kind(BufferKind::Markup));
        assert_eq!(registry.len(), 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let mut registry = CollaboratorRegistry::new();
        let count = Arc::new(Mutex::new(0));
        let sink = count.clone();
        let id = registry.subscribe(move |_| *sink.lock().unwrap() += 1);

        assert!(registry.unsubscribe(id));
        assert!(!registry.unsubscribe(id));
        registry.apply(
            BufferKind::Script,
            &PresenceChange::Joined(participant("Bob", BufferKind::Script)),
        );
        assert_eq!(*count.lock().unwrap(), 0);
    }
}
