//! Property-based tests for the routing function
//!
//! These tests verify key invariants hold across all possible inputs.

use super::state::*;
use super::transition::*;
use super::StatePatch;
use proptest::prelude::*;

// ============================================================================
// Arbitrary Generators
// ============================================================================

fn arb_stage() -> impl Strategy<Value = StageId> {
    prop_oneof![
        Just(StageId::Greeting),
        Just(StageId::Analytics),
        Just(StageId::Validation),
        Just(StageId::Execution),
    ]
}

fn arb_decision_point() -> impl Strategy<Value = DecisionPoint> {
    prop_oneof![
        Just(DecisionPoint::Entry),
        arb_stage().prop_map(DecisionPoint::After),
    ]
}

fn arb_state() -> impl Strategy<Value = SessionState> {
    (
        proptest::option::of(arb_stage()),
        "[a-z ]{0,20}",
        prop_oneof![Just(String::new()), Just("  ".to_string()), "[a-z{}\\[\\]$: ]{1,30}"],
        any::<bool>(),
    )
        .prop_map(|(route, user_query, generated_query, query_correct)| SessionState {
            current_route: route,
            user_query,
            generated_query,
            query_correct,
            ..Default::default()
        })
}

fn arb_patch() -> impl Strategy<Value = StatePatch> {
    (
        proptest::option::of(arb_stage()),
        proptest::option::of("[a-z]{0,10}"),
        proptest::option::of("[a-z]{0,10}"),
        proptest::option::of(any::<bool>()),
    )
        .prop_map(|(route, user_query, generated_query, query_correct)| StatePatch {
            current_route: route,
            user_query,
            generated_query,
            query_correct,
            query_result: None,
        })
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    /// Routing is a pure function of its inputs
    #[test]
    fn prop_routing_is_deterministic(point in arb_decision_point(), state in arb_state()) {
        prop_assert_eq!(next_stage(point, &state), next_stage(point, &state.clone()));
    }

    /// A turn never starts in Validation or Execution
    #[test]
    fn prop_entry_never_resumes_downstream(state in arb_state()) {
        let route = next_stage(DecisionPoint::Entry, &state);
        prop_assert!(matches!(
            route,
            Route::Stage(StageId::Greeting | StageId::Analytics)
        ));
    }

    /// Execution is only reachable from a validation that passed
    #[test]
    fn prop_execution_requires_validated_query(
        point in arb_decision_point(),
        state in arb_state(),
    ) {
        if next_stage(point, &state) == Route::Stage(StageId::Execution) {
            prop_assert_eq!(point, DecisionPoint::After(StageId::Validation));
            prop_assert_eq!(state.current_route, Some(StageId::Validation));
            prop_assert!(state.query_correct);
        }
    }

    /// Validation only follows an Analytics pass that produced a query
    #[test]
    fn prop_validation_requires_generated_query(
        point in arb_decision_point(),
        state in arb_state(),
    ) {
        if next_stage(point, &state) == Route::Stage(StageId::Validation) {
            prop_assert_eq!(point, DecisionPoint::After(StageId::Analytics));
            prop_assert!(!state.generated_query.trim().is_empty());
        }
    }

    /// Only Greeting and Analytics can end a turn
    #[test]
    fn prop_terminal_only_after_greeting_or_analytics(
        point in arb_decision_point(),
        state in arb_state(),
    ) {
        if next_stage(point, &state) == Route::Terminal {
            prop_assert!(matches!(
                point,
                DecisionPoint::After(StageId::Greeting | StageId::Analytics)
            ));
        }
    }

    /// Applying a patch never touches the transcript and leaves unset keys alone
    #[test]
    fn prop_apply_preserves_unset_keys(state in arb_state(), patch in arb_patch()) {
        let before = state.clone().with_message(Message::user("hi"));
        let after = before.clone().apply(patch.clone());

        prop_assert_eq!(&after.messages, &before.messages);
        if patch.current_route.is_none() {
            prop_assert_eq!(after.current_route, before.current_route);
        }
        if patch.generated_query.is_none() {
            prop_assert_eq!(&after.generated_query, &before.generated_query);
        }
        if patch.query_correct.is_none() {
            prop_assert_eq!(after.query_correct, before.query_correct);
        }
        prop_assert_eq!(&after.query_result, &before.query_result);
    }

    /// Applying a merged patch equals applying both in order
    #[test]
    fn prop_merge_matches_sequential_apply(
        state in arb_state(),
        first in arb_patch(),
        second in arb_patch(),
    ) {
        let sequential = state.clone().apply(first.clone()).apply(second.clone());
        let merged = state.apply(first.merge(second));
        prop_assert_eq!(sequential, merged);
    }
}
