//! Pipeline steps and their dependency graph.
//!
//! Steps belong to one of two owners: a [`PrintObject`](crate::PrintObject)
//! runs the [`PrintObjectStep`]s, the [`Print`](crate::Print) runs the
//! [`PrintStep`]s. Edges in [`STEP_EDGES`] say which step consumes which;
//! invalidating a step invalidates everything reachable from it, across
//! owners.

use std::collections::{BTreeSet, VecDeque};
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{PrintError, Result};

/// Steps of one owner.
pub trait PipelineStep: Copy + Ord + Debug + Send + Sync + 'static {
    /// Every step in execution order.
    const ALL: &'static [Self];

    /// Position in [`PipelineStep::ALL`].
    fn index(self) -> usize;
}

/// Per-object steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PrintObjectStep {
    /// Slice meshes and split the slices into regions.
    Slice,
    /// Generate walls.
    Perimeters,
    /// Classify surfaces into top, bottom and internal.
    PrepareInfill,
    /// Generate infill.
    Infill,
    /// Generate ironing passes.
    Ironing,
    /// Generate support and raft.
    SupportMaterial,
    /// Find overhangs that need a lift on travel.
    DetectOverhangsForLift,
    /// Simplify wall paths.
    SimplifyWall,
    /// Simplify infill paths.
    SimplifyInfill,
    /// Simplify support paths.
    SimplifySupportPath,
}

impl PipelineStep for PrintObjectStep {
    const ALL: &'static [Self] = &[
        PrintObjectStep::Slice,
        PrintObjectStep::Perimeters,
        PrintObjectStep::PrepareInfill,
        PrintObjectStep::Infill,
        PrintObjectStep::Ironing,
        PrintObjectStep::SupportMaterial,
        PrintObjectStep::DetectOverhangsForLift,
        PrintObjectStep::SimplifyWall,
        PrintObjectStep::SimplifyInfill,
        PrintObjectStep::SimplifySupportPath,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Whole-plate steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PrintStep {
    /// Tool ordering and wipe tower.
    WipeTower,
    /// Skirt and brim. Geometry is final once this is done.
    SkirtBrim,
    /// Hand the toolpaths to the G-code exporter.
    GCodeExport,
    /// Look for colliding paths between objects.
    ConflictCheck,
}

impl PrintStep {
    /// Last step that changes geometry.
    pub const SLICING_FINISHED: PrintStep = PrintStep::SkirtBrim;
}

impl PipelineStep for PrintStep {
    const ALL: &'static [Self] = &[
        PrintStep::WipeTower,
        PrintStep::SkirtBrim,
        PrintStep::GCodeExport,
        PrintStep::ConflictCheck,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// A node of the step graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StepNode {
    /// Step of one print object.
    Object(PrintObjectStep),
    /// Step of the print.
    Print(PrintStep),
}

use PrintObjectStep as O;
use PrintStep as P;
use StepNode::{Object as Obj, Print as Prn};

/// `(producer, consumer)` edges of the step graph.
pub const STEP_EDGES: &[(StepNode, StepNode)] = &[
    (Obj(O::Slice), Obj(O::Perimeters)),
    (Obj(O::Slice), Obj(O::SupportMaterial)),
    (Obj(O::Perimeters), Obj(O::PrepareInfill)),
    (Obj(O::Perimeters), Obj(O::SimplifyWall)),
    (Obj(O::PrepareInfill), Obj(O::Infill)),
    (Obj(O::Infill), Obj(O::Ironing)),
    (Obj(O::Infill), Obj(O::SimplifyInfill)),
    // Support runs after ironing so the execution order stays total.
    (Obj(O::Ironing), Obj(O::SupportMaterial)),
    (Obj(O::SupportMaterial), Obj(O::DetectOverhangsForLift)),
    (Obj(O::SupportMaterial), Obj(O::SimplifySupportPath)),
    (Obj(O::DetectOverhangsForLift), Obj(O::SimplifyWall)),
    (Obj(O::SimplifyWall), Obj(O::SimplifyInfill)),
    (Obj(O::SimplifyInfill), Obj(O::SimplifySupportPath)),
    // Tool ordering reads the extrusions of every object.
    (Obj(O::Slice), Prn(P::WipeTower)),
    (Obj(O::Perimeters), Prn(P::WipeTower)),
    (Obj(O::Infill), Prn(P::WipeTower)),
    (Obj(O::Ironing), Prn(P::WipeTower)),
    (Obj(O::SupportMaterial), Prn(P::WipeTower)),
    (Obj(O::DetectOverhangsForLift), Prn(P::GCodeExport)),
    (Obj(O::SimplifyWall), Prn(P::GCodeExport)),
    (Obj(O::SimplifyInfill), Prn(P::GCodeExport)),
    (Obj(O::SimplifySupportPath), Prn(P::GCodeExport)),
    (Prn(P::WipeTower), Prn(P::SkirtBrim)),
    (Prn(P::SkirtBrim), Prn(P::GCodeExport)),
    (Prn(P::GCodeExport), Prn(P::ConflictCheck)),
];

/// `node` and everything downstream of it, producers before consumers.
pub fn downstream(node: StepNode) -> Vec<StepNode> {
    let mut reached = BTreeSet::new();
    let mut queue = VecDeque::from([node]);
    while let Some(n) = queue.pop_front() {
        if reached.insert(n) {
            queue.extend(STEP_EDGES.iter().filter(|(from, _)| *from == n).map(|(_, to)| *to));
        }
    }
    topological_order()
        .into_iter()
        .filter(|n| reached.contains(n))
        .collect()
}

/// Every node, producers before consumers (Kahn's algorithm, ties by
/// declaration order).
pub fn topological_order() -> Vec<StepNode> {
    let nodes: Vec<StepNode> = PrintObjectStep::ALL
        .iter()
        .map(|&s| Obj(s))
        .chain(PrintStep::ALL.iter().map(|&s| Prn(s)))
        .collect();
    let mut indegree: Vec<usize> = nodes
        .iter()
        .map(|n| STEP_EDGES.iter().filter(|(_, to)| to == n).count())
        .collect();
    let mut order = Vec::with_capacity(nodes.len());
    let mut ready: BTreeSet<usize> = (0..nodes.len()).filter(|&i| indegree[i] == 0).collect();
    while let Some(i) = ready.pop_first() {
        order.push(nodes[i]);
        for (_, to) in STEP_EDGES.iter().filter(|(from, _)| *from == nodes[i]) {
            if let Some(j) = nodes.iter().position(|n| n == to) {
                indegree[j] -= 1;
                if indegree[j] == 0 {
                    ready.insert(j);
                }
            }
        }
    }
    order
}

/// Object steps downstream of `step`, including it.
pub fn object_closure(step: PrintObjectStep) -> Vec<PrintObjectStep> {
    downstream(Obj(step))
        .into_iter()
        .filter_map(|n| match n {
            Obj(s) => Some(s),
            Prn(_) => None,
        })
        .collect()
}

/// Print steps downstream of object step `step`.
pub fn print_closure_of_object(step: PrintObjectStep) -> Vec<PrintStep> {
    print_steps(downstream(Obj(step)))
}

/// Print steps downstream of `step`, including it.
pub fn print_closure(step: PrintStep) -> Vec<PrintStep> {
    print_steps(downstream(Prn(step)))
}

fn print_steps(nodes: Vec<StepNode>) -> Vec<PrintStep> {
    nodes
        .into_iter()
        .filter_map(|n| match n {
            Prn(s) => Some(s),
            Obj(_) => None,
        })
        .collect()
}

/// Started/done flags for the steps of one owner.
#[derive(Debug, Clone)]
pub struct StepState<S: PipelineStep> {
    started: Vec<bool>,
    done: Vec<bool>,
    _marker: std::marker::PhantomData<S>,
}

impl<S: PipelineStep> Default for StepState<S> {
    fn default() -> Self {
        Self {
            started: vec![false; S::ALL.len()],
            done: vec![false; S::ALL.len()],
            _marker: std::marker::PhantomData,
        }
    }
}

impl<S: PipelineStep> StepState<S> {
    /// All steps pending.
    pub fn new() -> Self {
        Self::default()
    }

    /// True once `step` finished and was not invalidated since.
    pub fn is_done(&self, step: S) -> bool {
        self.done[step.index()]
    }

    /// True while `step` runs or after it finished.
    pub fn is_started(&self, step: S) -> bool {
        self.started[step.index()]
    }

    /// Mark `step` as running. Returns false if it is already done and
    /// should be skipped.
    pub fn set_started(&mut self, step: S) -> bool {
        if self.is_done(step) {
            return false;
        }
        self.started[step.index()] = true;
        true
    }

    /// Mark `step` as finished.
    pub fn set_done(&mut self, step: S) {
        self.started[step.index()] = true;
        self.done[step.index()] = true;
    }

    /// Clear the given steps. Returns true if any was started or done.
    pub fn invalidate_many(&mut self, steps: &[S]) -> bool {
        let mut changed = false;
        for &s in steps {
            let i = s.index();
            changed |= self.started[i] || self.done[i];
            self.started[i] = false;
            self.done[i] = false;
        }
        changed
    }

    /// Clear every step.
    pub fn invalidate_all(&mut self) -> bool {
        self.invalidate_many(S::ALL)
    }

    /// Steps currently done, in order.
    pub fn done_steps(&self) -> Vec<S> {
        S::ALL.iter().copied().filter(|&s| self.is_done(s)).collect()
    }
}

impl StepState<PrintObjectStep> {
    /// Clear `step` and every object step downstream of it.
    pub fn invalidate(&mut self, step: PrintObjectStep) -> bool {
        self.invalidate_many(&object_closure(step))
    }
}

impl StepState<PrintStep> {
    /// Clear `step` and every print step downstream of it.
    pub fn invalidate(&mut self, step: PrintStep) -> bool {
        self.invalidate_many(&print_closure(step))
    }
}

/// Cooperative cancellation flag shared with a background worker.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Fresh, not canceled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Clear a previous request.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// True once [`CancelToken::cancel`] was called.
    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Canceled)` if cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_canceled() {
            Err(PrintError::Canceled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_is_acyclic_and_matches_declaration_order() {
        let order = topological_order();
        assert_eq!(order.len(), PrintObjectStep::ALL.len() + PrintStep::ALL.len());
        let objects: Vec<_> = order
            .iter()
            .filter_map(|n| match n {
                Obj(s) => Some(*s),
                _ => None,
            })
            .collect();
        assert_eq!(objects, PrintObjectStep::ALL);
        let prints: Vec<_> = order
            .iter()
            .filter_map(|n| match n {
                Prn(s) => Some(*s),
                _ => None,
            })
            .collect();
        assert_eq!(prints, PrintStep::ALL);
    }

    #[test]
    fn test_infill_invalidates_skirt_brim() {
        let print = print_closure_of_object(PrintObjectStep::Infill);
        assert!(print.contains(&PrintStep::WipeTower));
        assert!(print.contains(&PrintStep::SkirtBrim));
        assert!(print.contains(&PrintStep::ConflictCheck));
    }

    #[test]
    fn test_simplify_only_touches_export() {
        let print = print_closure_of_object(PrintObjectStep::SimplifyInfill);
        assert_eq!(print, vec![PrintStep::GCodeExport, PrintStep::ConflictCheck]);
        assert_eq!(
            object_closure(PrintObjectStep::SimplifyInfill),
            vec![PrintObjectStep::SimplifyInfill, PrintObjectStep::SimplifySupportPath]
        );
    }

    #[test]
    fn test_invalidate_reports_flips() {
        let mut state = StepState::<PrintObjectStep>::new();
        assert!(!state.invalidate(PrintObjectStep::Slice));
        for &s in PrintObjectStep::ALL {
            state.set_done(s);
        }
        assert!(state.invalidate(PrintObjectStep::Infill));
        assert!(state.is_done(PrintObjectStep::PrepareInfill));
        assert!(!state.is_done(PrintObjectStep::Infill));
        assert!(!state.is_done(PrintObjectStep::SimplifySupportPath));
        assert!(!state.invalidate(PrintObjectStep::Ironing));
    }

    #[test]
    fn test_set_started_skips_done() {
        let mut state = StepState::<PrintStep>::new();
        assert!(state.set_started(PrintStep::WipeTower));
        state.set_done(PrintStep::WipeTower);
        assert!(!state.set_started(PrintStep::WipeTower));
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        let shared = token.clone();
        assert!(token.check().is_ok());
        shared.cancel();
        assert!(matches!(token.check(), Err(PrintError::Canceled)));
        token.reset();
        assert!(!shared.is_canceled());
    }
}
