//! World merge: folds facts into a [`World`].
//!
//! The merge is monotonic: it adds entities, memberships and labels but
//! never removes them. Every mutation is guarded by a presence check, so
//! applying the same facts again leaves the world unchanged.

use tracing::debug;

use crate::fact::{Fact, FactKind};
use crate::world::{Character, World};

/// Names that stand in for an unidentified party and never become characters.
pub const DEFAULT_PLACEHOLDERS: [&str; 4] = ["someone", "somebody", "something", "unknown"];

/// Outcome counts of one merge call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Facts that were dispatched to a handler.
    pub applied: usize,
    /// Facts of a kind the merger does not track.
    pub ignored: usize,
}

/// Applies facts to a world.
#[derive(Debug, Clone)]
pub struct WorldMerger {
    placeholders: Vec<String>,
}

impl Default for WorldMerger {
    fn default() -> Self {
        Self {
            placeholders: DEFAULT_PLACEHOLDERS.iter().map(ToString::to_string).collect(),
        }
    }
}

impl WorldMerger {
    /// Create a merger with the default placeholder names.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a merger with a custom placeholder list.
    #[must_use]
    pub fn with_placeholders(placeholders: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            placeholders: placeholders.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether `name` is a generic stand-in rather than a real character.
    #[must_use]
    pub fn is_placeholder(&self, name: &str) -> bool {
        self.placeholders.iter().any(|p| p.eq_ignore_ascii_case(name))
    }

    /// Apply every fact in order.
    pub fn apply_facts(&self, world: &mut World, facts: &[Fact]) -> MergeReport {
        let mut report = MergeReport::default();
        for fact in facts {
            if self.apply_fact(world, fact) {
                report.applied += 1;
            } else {
                report.ignored += 1;
            }
        }
        debug!(
            applied = report.applied,
            ignored = report.ignored,
            characters = world.characters.len(),
            "Merged facts into world"
        );
        report
    }

    /// Apply one fact. Returns `false` for kinds the world does not track.
    pub fn apply_fact(&self, world: &mut World, fact: &Fact) -> bool {
        match fact.kind() {
            FactKind::Possession => {
                merge_possession(world, fact.subject(), fact.object());
                true
            }
            FactKind::Location => {
                merge_location(world, fact.subject(), fact.object());
                true
            }
            FactKind::Relationship => {
                self.merge_relationship(world, fact.subject(), fact.predicate(), fact.object());
                true
            }
            FactKind::Property => {
                merge_property(world, fact.subject(), fact.predicate(), fact.object());
                true
            }
            FactKind::Action => false,
        }
    }

    fn merge_relationship(&self, world: &mut World, subject: &str, predicate: &str, object: &str) {
        let forward = format!("{predicate} {object}");
        let subject_entry = ensure_character(world, subject);
        if !subject_entry.relationships.contains(&forward) {
            subject_entry.relationships.insert(forward);
        }

        if self.is_placeholder(object) || object == subject {
            return;
        }
        let reciprocal = format!("{predicate} {subject}");
        let object_entry = ensure_character(world, object);
        if !object_entry.relationships.contains(&reciprocal) {
            object_entry.relationships.insert(reciprocal);
        }
    }
}

fn ensure_character<'w>(world: &'w mut World, name: &str) -> &'w mut Character {
    world.characters.entry(name.to_string()).or_default()
}

fn merge_possession(world: &mut World, owner: &str, item: &str) {
    let entry = world.items.entry(item.to_string()).or_default();
    if entry.owner.as_deref() != Some(owner) {
        entry.owner = Some(owner.to_string());
    }
    let character = ensure_character(world, owner);
    if !character.items.contains(item) {
        character.items.insert(item.to_string());
    }
}

fn merge_location(world: &mut World, subject: &str, location: &str) {
    let character = ensure_character(world, subject);
    if character.location.as_deref() != Some(location) {
        character.location = Some(location.to_string());
    }
    let place = world.locations.entry(location.to_string()).or_default();
    if !place.occupants.contains(subject) {
        place.occupants.insert(subject.to_string());
    }
}

fn merge_property(world: &mut World, subject: &str, name: &str, value: &str) {
    let character = ensure_character(world, subject);
    if character.properties.get(name).map(String::as_str) != Some(value) {
        character.properties.insert(name.to_string(), value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fact(kind: FactKind, s: &str, p: &str, o: &str) -> Fact {
        Fact::new(kind, s, p, o, 0.7).expect("valid fact")
    }

    #[test]
    fn possession_into_empty_world() {
        let mut world = World::new();
        WorldMerger::new().apply_facts(&mut world, &[fact(FactKind::Possession, "Alice", "acquires", "key")]);
        assert_eq!(world.item("key").and_then(|i| i.owner()), Some("Alice"));
        assert!(world.character("Alice").expect("alice").items().contains("key"));
        assert!(world.invariant_violations().is_empty());
    }

    #[test]
    fn location_adds_occupant_and_keeps_previous() {
        let mut world = World::new();
        let merger = WorldMerger::new();
        merger.apply_facts(
            &mut world,
            &[
                fact(FactKind::Location, "Bob", "is at", "mill"),
                fact(FactKind::Location, "Bob", "is at", "clearing"),
            ],
        );
        assert_eq!(world.character("Bob").and_then(|c| c.location()), Some("clearing"));
        assert!(world.location("clearing").expect("clearing").occupants().contains("Bob"));
        // Monotonic: the mill keeps its record.
        assert!(world.location("mill").expect("mill").occupants().contains("Bob"));
        assert!(world.invariant_violations().is_empty());
    }

    #[test]
    fn relationship_is_reciprocal_except_for_placeholders() {
        let mut world = World::new();
        let merger = WorldMerger::new();
        merger.apply_facts(
            &mut world,
            &[
                fact(FactKind::Relationship, "Alice", "meets", "Bob"),
                fact(FactKind::Relationship, "Alice", "talks to", "someone"),
            ],
        );
        let alice = world.character("Alice").expect("alice");
        assert!(alice.relationships().contains("meets Bob"));
        assert!(alice.relationships().contains("talks to someone"));
        assert!(world.character("Bob").expect("bob").relationships().contains("meets Alice"));
        assert!(world.character("someone").is_none());
    }

    #[test]
    fn repeated_application_is_idempotent() {
        let facts = vec![
            fact(FactKind::Possession, "Alice", "acquires", "lantern"),
            fact(FactKind::Relationship, "Alice", "meets", "wizard"),
            fact(FactKind::Location, "Alice", "is at", "tower"),
            fact(FactKind::Property, "Alice", "mood", "curious"),
        ];
        let merger = WorldMerger::new();
        let mut once = World::new();
        merger.apply_facts(&mut once, &facts);
        let mut twice = once.clone();
        merger.apply_facts(&mut twice, &facts);
        assert_eq!(once, twice);
    }

    #[test]
    fn action_facts_are_ignored() {
        let mut world = World::new();
        let report = WorldMerger::new().apply_facts(&mut world, &[fact(FactKind::Action, "Alice", "performs", "a bow")]);
        assert_eq!(report, MergeReport { applied: 0, ignored: 1 });
        assert!(world.is_empty());
    }

    #[test]
    fn ownership_transfer_keeps_invariant() {
        let mut world = World::new();
        let merger = WorldMerger::new();
        merger.apply_facts(
            &mut world,
            &[
                fact(FactKind::Possession, "Alice", "acquires", "sword"),
                fact(FactKind::Possession, "Bob", "takes", "sword"),
            ],
        );
        assert_eq!(world.item("sword").and_then(|i| i.owner()), Some("Bob"));
        assert!(world.invariant_violations().is_empty());
    }
}
