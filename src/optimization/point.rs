use super::constraint::ConstraintResult;
use super::gradient::PartialStencil;
use super::quantity::QuantityValue;
use super::stop::StopCriterion;
use crate::core::{EvaluationError, NamedValues};
use crate::simulation::RawOutputs;
use indexmap::IndexMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Lifecycle of one evaluation, in strict forward order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Initializing,
    GeometryUpdating,
    FiniteElementRunning,
    OutputsInitializing,
    ObjectiveCalculating,
    GradientsRunning,
    Ended,
}

impl Phase {
    /// Phases a point may pass over on its way to `Ended`.
    pub fn is_optional(self) -> bool {
        matches!(self, Self::FiniteElementRunning | Self::GradientsRunning)
    }

    const ORDER: [Phase; 7] = [
        Self::Initializing,
        Self::GeometryUpdating,
        Self::FiniteElementRunning,
        Self::OutputsInitializing,
        Self::ObjectiveCalculating,
        Self::GradientsRunning,
        Self::Ended,
    ];

    /// Whether moving from `self` to `next` only skips optional phases.
    pub fn can_advance_to(self, next: Phase) -> bool {
        if next <= self {
            return false;
        }
        Self::ORDER
            .iter()
            .filter(|p| **p > self && **p < next)
            .all(|p| p.is_optional())
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Initializing => "Initializing",
            Self::GeometryUpdating => "Updating geometry",
            Self::FiniteElementRunning => "Running finite-element analysis",
            Self::OutputsInitializing => "Reading outputs",
            Self::ObjectiveCalculating => "Calculating objective function",
            Self::GradientsRunning => "Computing gradients",
            Self::Ended => "Ended",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PointKind {
    Main,
    /// Sampled only to estimate one partial derivative.
    GradientSample { dimension: usize },
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Timings {
    pub evaluation: Duration,
    pub fe_solve: Duration,
    pub gradient: Duration,
    pub total: Duration,
}

/// One evaluated sample of the problem.
///
/// The input vector is copied at construction and never changes. Two points
/// are equal when their input vectors are equal element for element.
#[derive(Clone, Debug)]
pub struct SolutionPoint {
    input: Vec<f64>,
    values: NamedValues,
    kind: PointKind,
    phase: Phase,
    raw: RawOutputs,
    quantities: IndexMap<String, QuantityValue>,
    objective: Option<f64>,
    gradient: Option<Vec<f64>>,
    partials: Vec<PartialStencil>,
    constraints: IndexMap<String, ConstraintResult>,
    pub(crate) timings: Timings,
    since_start: Duration,
    index: Option<usize>,
    previous: Option<usize>,
    stop_criteria: Vec<StopCriterion>,
}

impl PartialEq for SolutionPoint {
    fn eq(&self, other: &Self) -> bool {
        self.input == other.input
    }
}

impl SolutionPoint {
    pub fn new(input: &[f64], values: NamedValues, kind: PointKind) -> Self {
        Self {
            input: input.to_vec(),
            values,
            kind,
            phase: Phase::Initializing,
            raw: RawOutputs::default(),
            quantities: IndexMap::new(),
            objective: None,
            gradient: None,
            partials: Vec::new(),
            constraints: IndexMap::new(),
            timings: Timings::default(),
            since_start: Duration::ZERO,
            index: None,
            previous: None,
            stop_criteria: Vec::new(),
        }
    }

    pub fn input(&self) -> &[f64] {
        &self.input
    }

    pub fn values(&self) -> &NamedValues {
        &self.values
    }

    pub fn kind(&self) -> PointKind {
        self.kind
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn raw_outputs(&self) -> &RawOutputs {
        &self.raw
    }

    pub fn quantity_values(&self) -> &IndexMap<String, QuantityValue> {
        &self.quantities
    }

    pub fn objective(&self) -> Option<f64> {
        self.objective
    }

    /// Objective value, NaN until computed.
    pub fn objective_value(&self) -> f64 {
        self.objective.unwrap_or(f64::NAN)
    }

    pub fn gradient(&self) -> Option<&[f64]> {
        self.gradient.as_deref()
    }

    pub fn partials(&self) -> &[PartialStencil] {
        &self.partials
    }

    pub fn constraints(&self) -> &IndexMap<String, ConstraintResult> {
        &self.constraints
    }

    pub fn constraint(&self, name: &str) -> Option<&ConstraintResult> {
        self.constraints.get(name)
    }

    pub fn all_constraints_respected(&self) -> bool {
        self.constraints.values().all(ConstraintResult::is_respected)
    }

    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    /// Wall-clock time from the start of the solve to the end of this evaluation.
    pub fn since_start(&self) -> Duration {
        self.since_start
    }

    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn previous_index(&self) -> Option<usize> {
        self.previous
    }

    pub fn stop_criteria(&self) -> &[StopCriterion] {
        &self.stop_criteria
    }

    pub fn is_ended(&self) -> bool {
        self.phase == Phase::Ended
    }

    pub(crate) fn advance(&mut self, next: Phase) -> Result<(), EvaluationError> {
        if !self.phase.can_advance_to(next) {
            return Err(EvaluationError::PhaseOrder {
                from: self.phase.to_string(),
                to: next.to_string(),
            });
        }
        self.phase = next;
        Ok(())
    }

    fn require_phase(&self, phase: Phase) -> Result<(), EvaluationError> {
        if self.phase != phase {
            return Err(EvaluationError::PhaseOrder {
                from: self.phase.to_string(),
                to: phase.to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn set_raw_outputs(&mut self, raw: RawOutputs) {
        self.raw = raw;
    }

    pub(crate) fn set_quantity_values(&mut self, quantities: IndexMap<String, QuantityValue>) {
        self.quantities = quantities;
    }

    /// Stores the objective. Allowed once, while calculating it.
    pub(crate) fn set_objective(&mut self, value: f64) -> Result<(), EvaluationError> {
        self.require_phase(Phase::ObjectiveCalculating)?;
        if self.objective.is_some() {
            return Err(EvaluationError::PhaseOrder {
                from: self.phase.to_string(),
                to: self.phase.to_string(),
            });
        }
        self.objective = Some(value);
        Ok(())
    }

    pub(crate) fn set_gradient(
        &mut self,
        gradient: Vec<f64>,
        partials: Vec<PartialStencil>,
    ) -> Result<(), EvaluationError> {
        self.require_phase(Phase::GradientsRunning)?;
        self.gradient = Some(gradient);
        self.partials = partials;
        Ok(())
    }

    /// Returns the cached result for `name`, computing it on first request.
    pub fn constraint_or_try_insert_with<F>(
        &mut self,
        name: &str,
        compute: F,
    ) -> Result<&ConstraintResult, EvaluationError>
    where
        F: FnOnce(&SolutionPoint) -> Result<ConstraintResult, EvaluationError>,
    {
        if !self.constraints.contains_key(name) {
            let result = compute(self)?;
            self.constraints.insert(name.to_string(), result);
        }
        Ok(&self.constraints[name])
    }

    pub(crate) fn constraint_mut(&mut self, name: &str) -> Option<&mut ConstraintResult> {
        self.constraints.get_mut(name)
    }

    pub(crate) fn set_since_start(&mut self, elapsed: Duration) {
        self.since_start = elapsed;
    }

    pub(crate) fn link(&mut self, index: usize, previous: Option<usize>) {
        self.index = Some(index);
        self.previous = previous;
    }

    pub(crate) fn set_stop_criteria(&mut self, criteria: Vec<StopCriterion>) {
        self.stop_criteria = criteria;
    }
}

type SharedPoints = Arc<RwLock<Vec<Arc<SolutionPoint>>>>;

/// Creates an empty evaluation history and its single writer.
pub fn history() -> (HistoryWriter, HistoryView) {
    let points = SharedPoints::default();
    (
        HistoryWriter {
            points: Arc::clone(&points),
        },
        HistoryView { points },
    )
}

/// Append-only handle owned by the solve loop.
#[derive(Debug)]
pub struct HistoryWriter {
    points: SharedPoints,
}

impl HistoryWriter {
    pub fn view(&self) -> HistoryView {
        HistoryView {
            points: Arc::clone(&self.points),
        }
    }

    pub fn len(&self) -> usize {
        self.view().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a finished point, assigning its index and previous link.
    pub fn push(&self, mut point: SolutionPoint) -> Arc<SolutionPoint> {
        let mut points = self.points.write().unwrap_or_else(PoisonError::into_inner);
        let index = points.len();
        point.link(index, index.checked_sub(1));
        let point = Arc::new(point);
        points.push(Arc::clone(&point));
        point
    }

    /// Removes every point, used when a run restarts with new bounds.
    pub fn clear(&self) {
        self.points.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

/// Read-only, cloneable view of the evaluation history.
#[derive(Clone, Debug, Default)]
pub struct HistoryView {
    points: SharedPoints,
}

impl HistoryView {
    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<SolutionPoint>>> {
        self.points.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Arc<SolutionPoint>> {
        self.read().get(index).cloned()
    }

    pub fn last(&self) -> Option<Arc<SolutionPoint>> {
        self.read().last().cloned()
    }

    pub fn snapshot(&self) -> Vec<Arc<SolutionPoint>> {
        self.read().clone()
    }

    /// Most recent point whose input vector equals `input` exactly.
    pub fn find(&self, input: &[f64]) -> Option<Arc<SolutionPoint>> {
        self.read().iter().rev().find(|p| p.input() == input).cloned()
    }

    /// Point with the lowest objective so far.
    pub fn best(&self) -> Option<Arc<SolutionPoint>> {
        self.read()
            .iter()
            .filter(|p| p.objective().is_some_and(|v| !v.is_nan()))
            .min_by(|a, b| a.objective_value().total_cmp(&b.objective_value()))
            .cloned()
    }
}
