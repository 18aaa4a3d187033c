//! Property-based tests for the world model.
//!
//! Uses `proptest` to check merge invariants under random fact sequences:
//! idempotence, monotonicity, cross-reference consistency, and determinism
//! of the heuristic extractor.

use proptest::prelude::*;

use tale_core::extraction::FactExtractor;
use tale_core::fact::{Fact, FactKind};
use tale_core::merge::WorldMerger;
use tale_core::world::World;

// ---------------------------------------------------------------------------
// Strategy helpers
// ---------------------------------------------------------------------------

fn arb_name() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("Alice".to_string()),
        Just("Bob".to_string()),
        Just("Mira".to_string()),
        Just("someone".to_string()),
        "[a-z]{3,8}",
    ]
}

fn arb_kind() -> impl Strategy<Value = FactKind> {
    prop_oneof![
        Just(FactKind::Possession),
        Just(FactKind::Location),
        Just(FactKind::Relationship),
        Just(FactKind::Action),
        Just(FactKind::Property),
    ]
}

fn arb_fact() -> impl Strategy<Value = Fact> {
    (arb_kind(), arb_name(), "[a-z]{2,6}( [a-z]{2,4})?", arb_name(), 0.0..=1.0f32).prop_map(
        |(kind, subject, predicate, object, certainty)| {
            Fact::new(kind, subject, predicate, object, certainty).expect("generated fact is valid")
        },
    )
}

fn total_entries(world: &World) -> usize {
    world
        .characters()
        .values()
        .map(|c| c.items().len() + c.relationships().len() + c.properties().len())
        .sum::<usize>()
        + world.items().len()
        + world.locations().values().map(|l| l.occupants().len()).sum::<usize>()
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn merge_is_idempotent(facts in prop::collection::vec(arb_fact(), 0..40)) {
        let merger = WorldMerger::new();
        let mut once = World::new();
        merger.apply_facts(&mut once, &facts);
        let mut twice = once.clone();
        merger.apply_facts(&mut twice, &facts);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn merged_world_keeps_cross_references(facts in prop::collection::vec(arb_fact(), 0..40)) {
        let mut world = World::new();
        WorldMerger::new().apply_facts(&mut world, &facts);
        let violations = world.invariant_violations();
        prop_assert!(violations.is_empty(), "{:?}", violations);
    }

    #[test]
    fn merge_never_removes_entities(
        first in prop::collection::vec(arb_fact(), 0..20),
        second in prop::collection::vec(arb_fact(), 0..20),
    ) {
        let merger = WorldMerger::new();
        let mut world = World::new();
        merger.apply_facts(&mut world, &first);
        let characters: Vec<String> = world.characters().keys().cloned().collect();
        let items: Vec<String> = world.items().keys().cloned().collect();
        let before = total_entries(&world);

        merger.apply_facts(&mut world, &second);
        for name in &characters {
            prop_assert!(world.character(name).is_some());
        }
        for name in &items {
            prop_assert!(world.item(name).is_some());
        }
        prop_assert!(total_entries(&world) >= before);
    }

    #[test]
    fn placeholders_never_become_characters_through_relationships(
        subject in "[A-Z][a-z]{2,6}",
        predicate in "[a-z]{3,8}",
    ) {
        let fact = Fact::new(FactKind::Relationship, subject, predicate, "someone", 0.7)
            .expect("valid fact");
        let mut world = World::new();
        WorldMerger::new().apply_facts(&mut world, &[fact]);
        prop_assert!(world.character("someone").is_none());
    }

    #[test]
    fn heuristic_extraction_is_deterministic(text in "[A-Za-z ,.!?']{0,200}") {
        let extractor = FactExtractor::new();
        prop_assert_eq!(extractor.extract(&text), extractor.extract(&text));
    }

    #[test]
    fn heuristic_certainties_are_fixed(text in "(Alice|You) (picks up|finds|walks to|meets|says) (the|a) [a-z]{3,8}\\.") {
        let allowed = [0.5f32, 0.6, 0.7, 0.8];
        for fact in FactExtractor::new().extract(&text) {
            let c = fact.certainty().value();
            prop_assert!(allowed.iter().any(|a| (a - c).abs() < f32::EPSILON), "{}", fact);
        }
    }
}
