use proptest::prelude::*;
use slicekit_print::step::{downstream, topological_order, PipelineStep, StepNode, StepState, STEP_EDGES};
use slicekit_print::{PrintObjectStep, PrintStep};

#[test]
fn test_topological_order_respects_edges() {
    let order = topological_order();
    assert_eq!(order.len(), PrintObjectStep::ALL.len() + PrintStep::ALL.len());
    let pos = |n: &StepNode| order.iter().position(|m| m == n).unwrap();
    for (from, to) in STEP_EDGES {
        assert!(pos(from) < pos(to), "{from:?} must precede {to:?}");
    }
}

#[test]
fn test_every_object_step_reaches_export() {
    for &step in PrintObjectStep::ALL {
        let reached = downstream(StepNode::Object(step));
        assert!(reached.contains(&StepNode::Print(PrintStep::GCodeExport)), "{step:?}");
    }
}

proptest! {
    #[test]
    fn invalidating_clears_exactly_the_downstream_steps(
        done in proptest::collection::vec(any::<bool>(), PrintObjectStep::ALL.len()),
        pick in 0..PrintObjectStep::ALL.len(),
    ) {
        let mut state = StepState::<PrintObjectStep>::new();
        for (&step, &is_done) in PrintObjectStep::ALL.iter().zip(&done) {
            if is_done {
                state.set_done(step);
            }
        }
        let target = PrintObjectStep::ALL[pick];
        state.invalidate(target);

        let cleared = downstream(StepNode::Object(target));
        for (&step, &was_done) in PrintObjectStep::ALL.iter().zip(&done) {
            if cleared.contains(&StepNode::Object(step)) {
                prop_assert!(!state.is_done(step));
            } else {
                prop_assert_eq!(state.is_done(step), was_done);
            }
        }
    }

    #[test]
    fn print_invalidation_is_monotone(pick in 0..PrintStep::ALL.len()) {
        let mut state = StepState::<PrintStep>::new();
        for &step in PrintStep::ALL {
            state.set_done(step);
        }
        let target = PrintStep::ALL[pick];
        state.invalidate(target);
        // Once a step is cleared, nothing after it in the chain stays done.
        let first_cleared = PrintStep::ALL.iter().position(|&s| !state.is_done(s));
        prop_assert_eq!(first_cleared, Some(pick));
        for &step in &PrintStep::ALL[pick..] {
            prop_assert!(!state.is_done(step));
        }
    }
}
