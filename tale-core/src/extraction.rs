//! Fact extraction from narrative text.
//!
//! Two paths produce facts:
//!
//! 1. **Structured**: the model returned an `extracted_facts` array as part
//!    of a schema-validated payload. Each record is validated on its own;
//!    bad records are dropped and counted.
//! 2. **Heuristic**: a best-effort trigger-phrase matcher used when no
//!    structured facts are available. It is a fixed, ordered table of
//!    phrases per category with a fixed certainty per category. It is not
//!    NLP: false positives and negatives are expected. The only guarantee
//!    is that the same input always yields the same facts.
//!
//! The heuristic works sentence by sentence. Several categories may fire on
//! the same sentence, and each category contributes at most one fact per
//! sentence (the first trigger in table order wins).

use serde_json::Value;
use tracing::debug;

use crate::config::ExtractionConfig;
use crate::fact::{Fact, FactKind, RawFact, dedup_facts};

/// Certainty assigned to acquisition facts.
pub const POSSESSION_CERTAINTY: f32 = 0.6;
/// Certainty assigned to discovery facts.
pub const DISCOVERY_CERTAINTY: f32 = 0.5;
/// Certainty assigned to movement facts.
pub const LOCATION_CERTAINTY: f32 = 0.7;
/// Certainty assigned to direct meeting verbs.
pub const MEETING_CERTAINTY: f32 = 0.8;
/// Certainty assigned to speech facts.
pub const SPEECH_CERTAINTY: f32 = 0.7;
/// Certainty assigned to loose co-occurrence facts.
pub const PRESENCE_CERTAINTY: f32 = 0.6;

const POSSESSION_TRIGGERS: &[&str] = &[
    "picks up",
    "pick up",
    "picks",
    "pick it",
    "lift it",
    "lifts",
    "lift",
    "retrieves",
    "retrieve",
    "closing around",
    "close around",
    "grabs",
    "grab",
    "takes",
    "take",
    "pockets",
    "pocket",
];

const DISCOVERY_TRIGGERS: &[&str] = &[
    "reveals", "reveal", "finds", "find", "discovers", "discover", "uncovers", "uncover",
];

const LOCATION_TRIGGERS: &[&str] = &[
    "goes to", "go to", "walks to", "walk to", "heads to", "head to", "enters", "enter",
];

const MEETING_TRIGGERS: &[&str] = &[
    "meets",
    "meet",
    "encounters",
    "encounter",
    "sees",
    "it's an",
    "it is an",
    "they are",
];

const SPEECH_TRIGGERS: &[&str] = &[
    "says", "say", "tells", "tell", "talks", "talk", "speaks", "speak",
];

const BEINGS: &[&str] = &["elf", "wizard", "person", "figure"];
const PLAYER_REFS: &[&str] = &["you", "player"];
const APPROACH_VERBS: &[&str] = &[
    "see", "sees", "meet", "meets", "encounter", "encounters", "approach", "approaches", "emerge",
    "emerges",
];

const CLAUSE_BREAKS: &[&str] = &[",", ";", ":", " and ", " but ", " then ", " while "];
const ENTITY_BREAKS: &[&str] = &[" near ", " at ", " in ", " with ", " by ", " from ", " on "];
const LEADING_FILLERS: &[&str] = &[
    "the", "a", "an", "some", "her", "his", "their", "its", "your", "my", "it", "up", "out",
    "them", "this", "that",
];
const NOT_A_SUBJECT: &[&str] = &[
    "you", "the", "a", "an", "he", "she", "they", "it", "we", "i", "as", "then", "but", "and",
    "with", "in", "on", "at", "suddenly", "there", "this", "that", "your", "his", "her", "their",
    "its", "when", "while", "after", "before", "now", "finally", "meanwhile",
];

/// Facts produced from one extraction call, plus how many records were rejected.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    /// Valid, de-duplicated facts.
    pub facts: Vec<Fact>,
    /// Structured records dropped as malformed.
    pub dropped: usize,
    /// Whether the heuristic path produced these facts.
    pub heuristic: bool,
}

/// Converts model output or raw narrative into facts.
#[derive(Debug, Clone)]
pub struct FactExtractor {
    default_subject: String,
    known_items: Vec<String>,
    environment_words: Vec<String>,
}

impl Default for FactExtractor {
    fn default() -> Self {
        Self::from_config(&ExtractionConfig::default())
    }
}

impl FactExtractor {
    /// Create an extractor with the default tables.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an extractor from configuration.
    #[must_use]
    pub fn from_config(config: &ExtractionConfig) -> Self {
        Self {
            default_subject: config.default_subject.clone(),
            known_items: config.known_items.iter().map(|s| s.to_ascii_lowercase()).collect(),
            environment_words: config
                .environment_words
                .iter()
                .map(|s| s.to_ascii_lowercase())
                .collect(),
        }
    }

    /// Pick the extraction path: structured records when the model supplied
    /// them, otherwise the heuristic over `text`.
    ///
    /// `cast` lists character names already known to the world; they are
    /// preferred as subjects by the heuristic.
    #[must_use]
    pub fn resolve(&self, structured: Option<&[Value]>, text: &str, cast: &[&str]) -> Extraction {
        match structured {
            Some(records) => self.from_structured(records),
            None => Extraction {
                facts: self.extract_with_cast(text, cast),
                dropped: 0,
                heuristic: true,
            },
        }
    }

    /// Validate structured fact records, dropping malformed ones individually.
    #[must_use]
    pub fn from_structured(&self, records: &[Value]) -> Extraction {
        let mut facts = Vec::with_capacity(records.len());
        let mut dropped = 0;
        for record in records {
            let parsed = serde_json::from_value::<RawFact>(record.clone())
                .map_err(crate::TaleError::from)
                .and_then(Fact::try_from);
            match parsed {
                Ok(fact) => facts.push(fact),
                Err(e) => {
                    debug!(error = %e, "Dropping malformed structured fact");
                    dropped += 1;
                }
            }
        }
        Extraction {
            facts: dedup_facts(facts),
            dropped,
            heuristic: false,
        }
    }

    /// Heuristic extraction with no known cast.
    #[must_use]
    pub fn extract(&self, text: &str) -> Vec<Fact> {
        self.extract_with_cast(text, &[])
    }

    /// Heuristic extraction, preferring names in `cast` as subjects.
    #[must_use]
    pub fn extract_with_cast(&self, text: &str, cast: &[&str]) -> Vec<Fact> {
        let mut facts = Vec::new();
        let mut carried: Option<String> = None;

        for sentence in text.split(['.', '!', '?', '\n']) {
            let sentence = sentence.trim();
            if sentence.is_empty() {
                continue;
            }
            let view = Sentence::new(sentence);
            let mut explicit: Option<String> = None;

            let mut push = |at: usize, kind: FactKind, predicate: &str, object: String, certainty: f32| {
                let subject = match self.named_subject(&view, at, cast) {
                    Some(name) => {
                        explicit.get_or_insert_with(|| name.clone());
                        name
                    }
                    None => carried
                        .clone()
                        .unwrap_or_else(|| self.default_subject.clone()),
                };
                match Fact::new(kind, subject, predicate, object, certainty) {
                    Ok(fact) => facts.push(fact),
                    Err(e) => debug!(error = %e, "Heuristic produced an unusable fact"),
                }
            };

            if let Some((at, after)) = view.first_trigger(POSSESSION_TRIGGERS) {
                if let Some(object) = self.item_object(&view, after, 2) {
                    push(at, FactKind::Possession, "acquires", object, POSSESSION_CERTAINTY);
                }
            }

            if let Some((at, after)) = view.first_trigger(DISCOVERY_TRIGGERS) {
                if !self.is_scenery(after) {
                    if let Some(object) = self.item_object(&view, after, 3) {
                        push(at, FactKind::Possession, "discovers", object, DISCOVERY_CERTAINTY);
                    }
                }
            }

            if let Some((at, after)) = view.first_trigger(LOCATION_TRIGGERS) {
                if let Some(place) = phrase_object(clause(after, &[]), true) {
                    push(at, FactKind::Location, "is at", place, LOCATION_CERTAINTY);
                }
            }

            if let Some((at, after)) = view.first_trigger(MEETING_TRIGGERS) {
                if let Some(other) = phrase_object(clause(after, ENTITY_BREAKS), false) {
                    push(at, FactKind::Relationship, "meets", other, MEETING_CERTAINTY);
                }
            } else if let Some(at) = view.find("standing").filter(|_| view.has_word("figure")) {
                push(
                    at,
                    FactKind::Relationship,
                    "meets",
                    "mysterious figure".to_string(),
                    MEETING_CERTAINTY,
                );
            }

            if let Some((at, _)) = view.first_trigger(SPEECH_TRIGGERS) {
                push(at, FactKind::Relationship, "talks to", "someone".to_string(), SPEECH_CERTAINTY);
            }

            if view.has_any_word(PLAYER_REFS) && view.has_any_word(APPROACH_VERBS) {
                if let Some(being) = BEINGS.iter().find(|b| view.has_word(b)) {
                    push(
                        view.len(),
                        FactKind::Relationship,
                        "interacts with",
                        (*being).to_string(),
                        PRESENCE_CERTAINTY,
                    );
                }
            }

            if let Some(name) = explicit {
                carried = Some(name);
            }
        }

        dedup_facts(facts)
    }

    /// Whether a discovery is about the surroundings rather than an object.
    fn is_scenery(&self, after: &str) -> bool {
        after
            .split_whitespace()
            .take(3)
            .map(|w| trim_word(w).to_ascii_lowercase())
            .any(|w| self.environment_words.iter().any(|env| *env == w))
    }

    /// Known item in the clause, then in the sentence, then the first word
    /// of the clause if it is at least `min_len` long.
    fn item_object(&self, view: &Sentence<'_>, after: &str, min_len: usize) -> Option<String> {
        let clause = clause(after, ENTITY_BREAKS);
        let clause_lower = clause.to_ascii_lowercase();
        let clause_words: Vec<&str> = clause_lower.split_whitespace().map(trim_word).collect();

        if let Some(item) = self.known_items.iter().find(|i| clause_words.contains(&i.as_str())) {
            return Some(item.clone());
        }
        if let Some(item) = self.known_items.iter().find(|i| view.has_word(i)) {
            return Some(item.clone());
        }
        clause_words
            .into_iter()
            .find(|w| !w.is_empty() && !LEADING_FILLERS.contains(w))
            .filter(|w| w.chars().count() >= min_len)
            .map(ToString::to_string)
    }

    /// Cast member or capitalised name appearing before byte offset `at`.
    fn named_subject(&self, view: &Sentence<'_>, at: usize, cast: &[&str]) -> Option<String> {
        let before = &view.original[..at];
        let before_lower = &view.lower[..at];
        if let Some(name) = cast
            .iter()
            .find(|name| find_phrase(before_lower, &name.to_ascii_lowercase()).is_some())
        {
            return Some((*name).to_string());
        }
        before
            .split_whitespace()
            .map(trim_word)
            .filter(|w| {
                w.chars().next().is_some_and(char::is_uppercase)
                    && w.chars().all(char::is_alphabetic)
                    && !NOT_A_SUBJECT.contains(&w.to_ascii_lowercase().as_str())
            })
            .last()
            .map(ToString::to_string)
    }
}

/// A sentence with an ASCII-lower-cased twin sharing byte offsets.
struct Sentence<'a> {
    original: &'a str,
    lower: String,
}

impl<'a> Sentence<'a> {
    fn new(original: &'a str) -> Self {
        Self {
            original,
            lower: original.to_ascii_lowercase(),
        }
    }

    fn len(&self) -> usize {
        self.original.len()
    }

    fn find(&self, phrase: &str) -> Option<usize> {
        find_phrase(&self.lower, phrase)
    }

    fn has_word(&self, word: &str) -> bool {
        self.find(word).is_some()
    }

    fn has_any_word(&self, words: &[&str]) -> bool {
        words.iter().any(|w| self.has_word(w))
    }

    /// First trigger in table order, with its offset and the original text after it.
    fn first_trigger(&self, triggers: &[&str]) -> Option<(usize, &'a str)> {
        let original = self.original;
        triggers.iter().find_map(|trigger| {
            self.find(trigger)
                .map(|at| (at, original[at + trigger.len()..].trim()))
        })
    }
}

/// Byte offset of `phrase` in `haystack` where it starts and ends on word boundaries.
fn find_phrase(haystack: &str, phrase: &str) -> Option<usize> {
    if phrase.is_empty() {
        return None;
    }
    haystack.match_indices(phrase).map(|(i, _)| i).find(|&i| {
        let before_ok = haystack[..i]
            .chars()
            .next_back()
            .is_none_or(|c| !c.is_alphanumeric());
        let after_ok = haystack[i + phrase.len()..]
            .chars()
            .next()
            .is_none_or(|c| !c.is_alphanumeric());
        before_ok && after_ok
    })
}

/// Cut `text` at the earliest clause break (and any extra `breaks`).
fn clause<'t>(text: &'t str, breaks: &[&str]) -> &'t str {
    let lower = text.to_ascii_lowercase();
    let end = CLAUSE_BREAKS
        .iter()
        .chain(breaks)
        .filter_map(|b| lower.find(b))
        .min()
        .unwrap_or(text.len());
    text[..end].trim()
}

/// Remaining words of a clause after leading fillers, joined by spaces.
fn phrase_object(clause: &str, lowercase: bool) -> Option<String> {
    let words: Vec<&str> = clause
        .split_whitespace()
        .map(trim_word)
        .filter(|w| !w.is_empty())
        .skip_while(|w| LEADING_FILLERS.contains(&w.to_ascii_lowercase().as_str()))
        .collect();
    if words.is_empty() {
        return None;
    }
    let joined = words.join(" ");
    Some(if lowercase { joined.to_ascii_lowercase() } else { joined })
}

fn trim_word(word: &str) -> &str {
    word.trim_matches(|c: char| !c.is_alphanumeric() && c != '\'' && c != '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn has(facts: &[Fact], kind: FactKind, subject: &str, object: &str) -> bool {
        facts
            .iter()
            .any(|f| f.kind() == kind && f.subject() == subject && f.object() == object)
    }

    #[test]
    fn picks_up_and_walks_to() {
        let facts = FactExtractor::new().extract("Alice picks up the lantern and walks to the clearing");
        assert!(has(&facts, FactKind::Possession, "Alice", "lantern"), "{facts:?}");
        assert!(has(&facts, FactKind::Location, "Alice", "clearing"), "{facts:?}");
        let possession = facts
            .iter()
            .find(|f| f.kind() == FactKind::Possession)
            .expect("possession");
        assert_eq!(possession.predicate(), "acquires");
        assert!((possession.certainty().value() - POSSESSION_CERTAINTY).abs() < f32::EPSILON);
    }

    #[test]
    fn defaults_to_player_without_a_name() {
        let facts = FactExtractor::new().extract("You grab the rusty sword.");
        assert!(has(&facts, FactKind::Possession, "Player", "sword"), "{facts:?}");
    }

    #[test]
    fn first_word_when_no_known_item() {
        let facts = FactExtractor::new().extract("You take the amulet from the altar.");
        assert!(has(&facts, FactKind::Possession, "Player", "amulet"), "{facts:?}");
    }

    #[test]
    fn discovery_skips_scenery() {
        let extractor = FactExtractor::new();
        assert!(extractor.extract("You find the path ahead blocked.").is_empty());
        let facts = extractor.extract("Alice discovers an old compass.");
        let discovery = facts.iter().find(|f| f.predicate() == "discovers").expect("discovery");
        assert_eq!(discovery.object(), "compass");
        assert!((discovery.certainty().value() - DISCOVERY_CERTAINTY).abs() < f32::EPSILON);
    }

    #[test]
    fn meeting_keeps_name_case() {
        let facts = FactExtractor::new().extract("Alice meets Bob near the well.");
        assert!(has(&facts, FactKind::Relationship, "Alice", "Bob"), "{facts:?}");
    }

    #[test]
    fn standing_figure_and_presence_both_fire() {
        let facts = FactExtractor::new()
            .extract("A figure is standing by the gate and you approach slowly.");
        assert!(has(&facts, FactKind::Relationship, "Player", "mysterious figure"), "{facts:?}");
        assert!(facts.iter().any(|f| f.predicate() == "interacts with" && f.object() == "figure"));
    }

    #[test]
    fn speech_targets_placeholder() {
        let facts = FactExtractor::new().extract("The old man says nothing.");
        assert!(has(&facts, FactKind::Relationship, "Player", "someone"), "{facts:?}");
    }

    #[test]
    fn trigger_needs_word_boundary() {
        // "center" must not match "enter"; "mistake" must not match "take".
        assert!(FactExtractor::new().extract("The center of the hall was a mistake").is_empty());
    }

    #[test]
    fn subject_carries_across_sentences() {
        let facts = FactExtractor::new().extract("Alice enters the old mill. She picks up a key.");
        assert!(has(&facts, FactKind::Location, "Alice", "old mill"), "{facts:?}");
        assert!(has(&facts, FactKind::Possession, "Alice", "key"), "{facts:?}");
    }

    #[test]
    fn cast_members_are_preferred() {
        let facts = FactExtractor::new().extract_with_cast("Then mira takes the coin.", &["Mira"]);
        assert!(has(&facts, FactKind::Possession, "Mira", "coin"), "{facts:?}");
    }

    #[test]
    fn heuristic_is_deterministic() {
        let text = "Alice meets a wizard. The wizard says hello. Alice grabs the book and enters the tower.";
        let extractor = FactExtractor::new();
        assert_eq!(extractor.extract(text), extractor.extract(text));
    }

    #[test]
    fn structured_drops_bad_records_individually() {
        let records = vec![
            json!({"type":"possession","subject":"Alice","predicate":"has","object":"key","certainty":0.9}),
            json!({"type":"location","subject":"Alice","predicate":"is at","certainty":0.5}),
            json!({"type":"relationship","subject":"Alice","predicate":"meets","object":"Bob","certainty":1.5}),
            json!("not an object"),
            json!({"type":"possession","subject":"Alice","predicate":"has","object":"key","certainty":0.4}),
        ];
        let extraction = FactExtractor::new().from_structured(&records);
        assert_eq!(extraction.facts.len(), 1);
        assert_eq!(extraction.dropped, 3);
        assert!(!extraction.heuristic);
    }

    #[test]
    fn resolve_prefers_structured() {
        let records = vec![json!({"type":"property","subject":"Alice","predicate":"mood","object":"calm","certainty":0.7})];
        let extractor = FactExtractor::new();
        let structured = extractor.resolve(Some(records.as_slice()), "Alice grabs the key", &[]);
        assert_eq!(structured.facts.len(), 1);
        assert_eq!(structured.facts[0].kind(), FactKind::Property);
        let heuristic = extractor.resolve(None, "Alice grabs the key", &[]);
        assert!(heuristic.heuristic);
        assert!(has(&heuristic.facts, FactKind::Possession, "Alice", "key"));
    }
}
