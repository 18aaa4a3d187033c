//! The World aggregate: characters, items and locations derived from facts.
//!
//! Fields are private: the world is read freely but only changed through
//! [`crate::merge::WorldMerger`], which keeps the cross-references intact.
//! All collections are ordered so two worlds built from the same facts
//! compare and serialise identically.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// A character known to the world.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Character {
    /// Where the character was last seen.
    pub(crate) location: Option<String>,
    /// Items the character holds.
    pub(crate) items: BTreeSet<String>,
    /// Directed relationship labels, e.g. `"meets Bob"`.
    pub(crate) relationships: BTreeSet<String>,
    /// Free-form characteristics.
    pub(crate) properties: BTreeMap<String, String>,
}

impl Character {
    /// Last known location.
    #[must_use]
    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    /// Items held.
    #[must_use]
    pub fn items(&self) -> &BTreeSet<String> {
        &self.items
    }

    /// Relationship labels.
    #[must_use]
    pub fn relationships(&self) -> &BTreeSet<String> {
        &self.relationships
    }

    /// Characteristics.
    #[must_use]
    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }
}

/// An item known to the world.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Current holder, if any.
    pub(crate) owner: Option<String>,
    /// Free-text description.
    #[serde(default)]
    pub(crate) description: String,
}

impl Item {
    /// Current holder.
    #[must_use]
    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    /// Description text.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }
}

/// A location known to the world.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Place {
    /// Characters who have been placed here.
    pub(crate) occupants: BTreeSet<String>,
    /// Free-text description.
    #[serde(default)]
    pub(crate) description: String,
}

impl Place {
    /// Characters placed here.
    #[must_use]
    pub fn occupants(&self) -> &BTreeSet<String> {
        &self.occupants
    }

    /// Description text.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }
}

/// Structured state of one session's story world.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct World {
    #[serde(default)]
    pub(crate) characters: BTreeMap<String, Character>,
    #[serde(default)]
    pub(crate) items: BTreeMap<String, Item>,
    #[serde(default)]
    pub(crate) locations: BTreeMap<String, Place>,
}

impl World {
    /// Create an empty world.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All characters by name.
    #[must_use]
    pub fn characters(&self) -> &BTreeMap<String, Character> {
        &self.characters
    }

    /// All items by name.
    #[must_use]
    pub fn items(&self) -> &BTreeMap<String, Item> {
        &self.items
    }

    /// All locations by name.
    #[must_use]
    pub fn locations(&self) -> &BTreeMap<String, Place> {
        &self.locations
    }

    /// Look up a character.
    #[must_use]
    pub fn character(&self, name: &str) -> Option<&Character> {
        self.characters.get(name)
    }

    /// Look up an item.
    #[must_use]
    pub fn item(&self, name: &str) -> Option<&Item> {
        self.items.get(name)
    }

    /// Look up a location.
    #[must_use]
    pub fn location(&self, name: &str) -> Option<&Place> {
        self.locations.get(name)
    }

    /// Whether nothing has been merged yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.characters.is_empty() && self.items.is_empty() && self.locations.is_empty()
    }

    /// One-line listing of entity names for prompt building.
    #[must_use]
    pub fn summary(&self) -> String {
        let join = |names: Vec<&String>| {
            names
                .into_iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        };
        format!(
            "Characters: [{}]; Items: [{}]; Locations: [{}]",
            join(self.characters.keys().collect()),
            join(self.items.keys().collect()),
            join(self.locations.keys().collect()),
        )
    }

    /// List every broken cross-reference.
    ///
    /// An owned item must appear in its owner's item set, and a located
    /// character must appear in that location's occupants. An empty result
    /// means the world is consistent.
    #[must_use]
    pub fn invariant_violations(&self) -> Vec<String> {
        let mut violations = Vec::new();
        for (name, item) in &self.items {
            if let Some(owner) = &item.owner {
                let held = self
                    .characters
                    .get(owner)
                    .is_some_and(|c| c.items.contains(name));
                if !held {
                    violations.push(format!("item '{name}' owned by '{owner}' is not in their items"));
                }
            }
        }
        for (name, character) in &self.characters {
            if let Some(location) = &character.location {
                let present = self
                    .locations
                    .get(location)
                    .is_some_and(|p| p.occupants.contains(name));
                if !present {
                    violations.push(format!(
                        "character '{name}' at '{location}' is not among its occupants"
                    ));
                }
            }
        }
        violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_world_is_consistent() {
        let world = World::new();
        assert!(world.is_empty());
        assert!(world.invariant_violations().is_empty());
        assert_eq!(world.summary(), "Characters: []; Items: []; Locations: []");
    }

    #[test]
    fn detects_dangling_owner() {
        let mut world = World::new();
        world.items.insert(
            "key".into(),
            Item {
                owner: Some("Alice".into()),
                description: String::new(),
            },
        );
        assert_eq!(world.invariant_violations().len(), 1);
    }

    #[test]
    fn deserializes_sparse_json() {
        let world: World = serde_json::from_str(r#"{"characters":{"Alice":{"location":null,"items":[],"relationships":[],"properties":{}}}}"#)
            .expect("parse");
        assert!(world.character("Alice").is_some());
        assert!(world.items().is_empty());
    }

    #[test]
    fn character_fields_may_be_omitted() {
        let world: World =
            serde_json::from_str(r#"{"characters":{"Bob":{"location":"mill"},"Cara":{}}}"#).expect("parse");
        let bob = world.character("Bob").expect("bob");
        assert_eq!(bob.location(), Some("mill"));
        assert!(bob.items().is_empty());
        assert!(bob.relationships().is_empty());
        assert_eq!(world.character("Cara"), Some(&Character::default()));
    }
}
