//! Typed facts: subject/predicate/object triples with a certainty score.
//!
//! A [`Fact`] is an immutable value. Every constructor path (direct, JSON,
//! model output) goes through the same validation, so a `Fact` that exists
//! always has non-empty fields and a certainty in `[0, 1]`.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TaleError};
use crate::types::Certainty;

/// Category of a fact, deciding how it is merged into the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactKind {
    /// Someone has or acquires an item.
    Possession,
    /// Someone is at or moves to a place.
    Location,
    /// Someone meets, talks to or otherwise relates to someone else.
    Relationship,
    /// Someone performs an action.
    Action,
    /// Someone has a characteristic.
    Property,
}

impl FactKind {
    /// All kinds, in declaration order.
    pub const ALL: [FactKind; 5] = [
        FactKind::Possession,
        FactKind::Location,
        FactKind::Relationship,
        FactKind::Action,
        FactKind::Property,
    ];

    /// The wire name of this kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FactKind::Possession => "possession",
            FactKind::Location => "location",
            FactKind::Relationship => "relationship",
            FactKind::Action => "action",
            FactKind::Property => "property",
        }
    }

    /// Parse a wire name, case-insensitively.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for FactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated subject-predicate-object triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawFact")]
pub struct Fact {
    #[serde(rename = "type")]
    kind: FactKind,
    subject: String,
    predicate: String,
    object: String,
    certainty: Certainty,
}

/// Identity of a fact for de-duplication. Certainty is not part of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FactKey<'a> {
    /// Fact category.
    pub kind: FactKind,
    /// Subject entity name.
    pub subject: &'a str,
    /// Relation text.
    pub predicate: &'a str,
    /// Object entity or value name.
    pub object: &'a str,
}

impl Fact {
    /// Build a fact, trimming names and validating every field.
    ///
    /// # Errors
    /// Returns [`TaleError::MalformedFact`] if any text field is blank or the
    /// certainty is outside `[0, 1]`.
    pub fn new(
        kind: FactKind,
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<String>,
        certainty: f32,
    ) -> Result<Self> {
        let subject = required("subject", subject.into())?;
        let predicate = required("predicate", predicate.into())?;
        let object = required("object", object.into())?;
        let certainty = Certainty::new(certainty).ok_or_else(|| TaleError::MalformedFact {
            reason: format!("certainty {certainty} outside [0, 1]"),
        })?;
        Ok(Self {
            kind,
            subject,
            predicate,
            object,
            certainty,
        })
    }

    /// Fact category.
    #[must_use]
    pub fn kind(&self) -> FactKind {
        self.kind
    }

    /// Subject entity name.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Relation text.
    #[must_use]
    pub fn predicate(&self) -> &str {
        &self.predicate
    }

    /// Object entity or value name.
    #[must_use]
    pub fn object(&self) -> &str {
        &self.object
    }

    /// Confidence in this fact.
    #[must_use]
    pub fn certainty(&self) -> Certainty {
        self.certainty
    }

    /// De-duplication identity.
    #[must_use]
    pub fn key(&self) -> FactKey<'_> {
        FactKey {
            kind: self.kind,
            subject: &self.subject,
            predicate: &self.predicate,
            object: &self.object,
        }
    }
}

impl fmt::Display for Fact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} {} ({})",
            self.kind, self.subject, self.predicate, self.object, self.certainty
        )
    }
}

fn required(field: &str, value: String) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(TaleError::MalformedFact {
            reason: format!("missing {field}"),
        });
    }
    if trimmed.len() == value.len() {
        Ok(value)
    } else {
        Ok(trimmed.to_string())
    }
}

/// Loosely-typed fact as it arrives from model output or JSON files.
///
/// Every field is optional so a single bad record can be rejected on its
/// own instead of failing the whole payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawFact {
    /// Fact category name.
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    /// Subject entity name.
    #[serde(default)]
    pub subject: Option<String>,
    /// Relation text.
    #[serde(default)]
    pub predicate: Option<String>,
    /// Object entity or value name.
    #[serde(default)]
    pub object: Option<String>,
    /// Confidence.
    #[serde(default)]
    pub certainty: Option<f64>,
}

impl TryFrom<RawFact> for Fact {
    type Error = TaleError;

    fn try_from(raw: RawFact) -> Result<Self> {
        let kind_name = raw.kind.ok_or_else(|| TaleError::MalformedFact {
            reason: "missing type".into(),
        })?;
        let kind = FactKind::parse(&kind_name).ok_or_else(|| TaleError::MalformedFact {
            reason: format!("unknown fact type '{kind_name}'"),
        })?;
        let certainty = raw.certainty.ok_or_else(|| TaleError::MalformedFact {
            reason: "missing certainty".into(),
        })?;
        #[allow(clippy::cast_possible_truncation)]
        let certainty = certainty as f32;
        Fact::new(
            kind,
            raw.subject.unwrap_or_default(),
            raw.predicate.unwrap_or_default(),
            raw.object.unwrap_or_default(),
            certainty,
        )
    }
}

/// Drop facts whose [`FactKey`] was already seen, keeping the first occurrence.
#[must_use]
pub fn dedup_facts(facts: Vec<Fact>) -> Vec<Fact> {
    let mut seen: HashSet<(FactKind, String, String, String)> = HashSet::with_capacity(facts.len());
    facts
        .into_iter()
        .filter(|f| {
            seen.insert((
                f.kind,
                f.subject.clone(),
                f.predicate.clone(),
                f.object.clone(),
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_trims_and_validates() {
        let fact = Fact::new(FactKind::Possession, "  Alice ", "acquires", "key", 0.6)
            .expect("valid fact");
        assert_eq!(fact.subject(), "Alice");
        assert!(Fact::new(FactKind::Possession, " ", "acquires", "key", 0.6).is_err());
        assert!(Fact::new(FactKind::Possession, "Alice", "acquires", "key", 1.2).is_err());
    }

    #[test]
    fn key_ignores_certainty() {
        let a = Fact::new(FactKind::Location, "Bob", "is at", "mill", 0.7).expect("valid");
        let b = Fact::new(FactKind::Location, "Bob", "is at", "mill", 0.3).expect("valid");
        assert_eq!(a.key(), b.key());
        assert_ne!(a, b);
        assert_eq!(dedup_facts(vec![a.clone(), b]), vec![a]);
    }

    #[test]
    fn deserialize_uses_wire_names() {
        let json = r#"{"type":"relationship","subject":"Alice","predicate":"meets","object":"Bob","certainty":0.8}"#;
        let fact: Fact = serde_json::from_str(json).expect("parse");
        assert_eq!(fact.kind(), FactKind::Relationship);
        let back = serde_json::to_value(&fact).expect("serialize");
        assert_eq!(back["type"], "relationship");
    }

    #[test]
    fn deserialize_rejects_unknown_kind_and_missing_fields() {
        let unknown = r#"{"type":"rumour","subject":"A","predicate":"p","object":"B","certainty":0.5}"#;
        assert!(serde_json::from_str::<Fact>(unknown).is_err());
        let missing = r#"{"type":"location","subject":"A","predicate":"is at","certainty":0.5}"#;
        assert!(serde_json::from_str::<Fact>(missing).is_err());
    }
}
