//! Pure routing function
//!
//! Given the point in the turn and the current session state, decide which
//! stage runs next or whether the turn is over. No I/O, no clock.

use super::{SessionState, StageId};

/// Stage a brand new thread starts in
pub const ENTRY_STAGE: StageId = StageId::Greeting;

/// Where in a turn a routing decision is being made
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionPoint {
    /// A user message was just appended
    Entry,
    /// The given stage just completed
    After(StageId),
}

/// Outcome of a routing decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Stage(StageId),
    /// End the turn and reply to the user
    Terminal,
}

/// Decide what runs next.
///
/// A turn never resumes in Validation or Execution: a stored route pointing at
/// either collapses to Analytics so a stale query is regenerated instead of
/// being re-validated or re-run.
pub fn next_stage(point: DecisionPoint, state: &SessionState) -> Route {
    match point {
        DecisionPoint::Entry => resume_route(state.current_route),

        DecisionPoint::After(StageId::Greeting) => match state.current_route {
            None | Some(StageId::Greeting) => Route::Terminal,
            other => resume_route(other),
        },

        DecisionPoint::After(StageId::Analytics) => {
            if state.current_route == Some(StageId::Analytics) && state.has_generated_query() {
                Route::Stage(StageId::Validation)
            } else {
                Route::Terminal
            }
        }

        DecisionPoint::After(StageId::Validation) => {
            if state.current_route == Some(StageId::Validation) && state.query_correct {
                Route::Stage(StageId::Execution)
            } else {
                Route::Stage(StageId::Analytics)
            }
        }

        DecisionPoint::After(StageId::Execution) => Route::Stage(StageId::Analytics),
    }
}

fn resume_route(route: Option<StageId>) -> Route {
    match route {
        None => Route::Stage(ENTRY_STAGE),
        Some(StageId::Validation | StageId::Execution) => Route::Stage(StageId::Analytics),
        Some(stage) => Route::Stage(stage),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_route(route: Option<StageId>) -> SessionState {
        SessionState {
            current_route: route,
            ..Default::default()
        }
    }

    #[test]
    fn test_entry_routing() {
        let cases = [
            (None, StageId::Greeting),
            (Some(StageId::Greeting), StageId::Greeting),
            (Some(StageId::Analytics), StageId::Analytics),
            (Some(StageId::Validation), StageId::Analytics),
            (Some(StageId::Execution), StageId::Analytics),
        ];
        for (route, expected) in cases {
            assert_eq!(
                next_stage(DecisionPoint::Entry, &with_route(route)),
                Route::Stage(expected),
                "entry with route {route:?}"
            );
        }
    }

    #[test]
    fn test_after_greeting_without_redirect_ends_turn() {
        let point = DecisionPoint::After(StageId::Greeting);
        assert_eq!(next_stage(point, &with_route(None)), Route::Terminal);
        assert_eq!(
            next_stage(point, &with_route(Some(StageId::Greeting))),
            Route::Terminal
        );
        assert_eq!(
            next_stage(point, &with_route(Some(StageId::Analytics))),
            Route::Stage(StageId::Analytics)
        );
        assert_eq!(
            next_stage(point, &with_route(Some(StageId::Execution))),
            Route::Stage(StageId::Analytics)
        );
    }

    #[test]
    fn test_after_analytics_requires_route_and_query() {
        let point = DecisionPoint::After(StageId::Analytics);

        let mut state = with_route(Some(StageId::Analytics));
        assert_eq!(next_stage(point, &state), Route::Terminal);

        state.generated_query = "   ".to_string();
        assert_eq!(next_stage(point, &state), Route::Terminal);

        state.generated_query = "[{\"$count\": \"n\"}]".to_string();
        assert_eq!(next_stage(point, &state), Route::Stage(StageId::Validation));

        state.current_route = Some(StageId::Greeting);
        assert_eq!(next_stage(point, &state), Route::Terminal);
    }

    #[test]
    fn test_after_validation() {
        let point = DecisionPoint::After(StageId::Validation);

        let mut state = with_route(Some(StageId::Validation));
        state.query_correct = true;
        assert_eq!(next_stage(point, &state), Route::Stage(StageId::Execution));

        state.query_correct = false;
        assert_eq!(next_stage(point, &state), Route::Stage(StageId::Analytics));

        state.query_correct = true;
        state.current_route = Some(StageId::Analytics);
        assert_eq!(next_stage(point, &state), Route::Stage(StageId::Analytics));
    }

    #[test]
    fn test_after_execution_always_analytics() {
        let mut state = with_route(Some(StageId::Execution));
        state.query_correct = true;
        assert_eq!(
            next_stage(DecisionPoint::After(StageId::Execution), &state),
            Route::Stage(StageId::Analytics)
        );
    }
}
