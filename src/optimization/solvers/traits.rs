use crate::optimization::termination::{NativeResult, TerminationSignal};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Objective or constraint callback: value at `x`, filling `grad` when the
/// solver asks for it. An `Err` aborts the solve.
pub type SolverCallback<'a> = Box<dyn FnMut(&[f64], Option<&mut [f64]>) -> Result<f64, TerminationSignal> + 'a>;

/// Shared flag that makes the solver return at its next callback.
#[derive(Clone, Debug, Default)]
pub struct ForceStop(Arc<AtomicBool>);

impl ForceStop {
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Stop thresholds the solver enforces natively. `None` disables one.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StopThresholds {
    pub stopval: Option<f64>,
    pub ftol_abs: Option<f64>,
    pub ftol_rel: Option<f64>,
    pub xtol_abs: Option<Vec<f64>>,
    pub xtol_rel: Option<f64>,
    pub maxeval: Option<usize>,
    pub maxtime: Option<Duration>,
}

#[derive(Clone, Debug)]
pub struct SolverRun {
    pub result: NativeResult,
    pub best_param: Option<Vec<f64>>,
    pub best_cost: f64,
    pub evaluations: usize,
    /// Library-specific explanation of the result, if any.
    pub detail: Option<String>,
}

/// Bound-constrained nonlinear minimizer driven through callbacks.
///
/// Callbacks run synchronously on the calling thread, one at a time.
pub trait SolverBackend<'a> {
    fn name(&self) -> &str;

    fn dimension(&self) -> usize;

    fn set_lower_bounds(&mut self, lower: &[f64]) -> Result<(), NativeResult>;

    fn set_upper_bounds(&mut self, upper: &[f64]) -> Result<(), NativeResult>;

    fn set_min_objective(&mut self, objective: SolverCallback<'a>);

    fn add_equality_constraint(&mut self, constraint: SolverCallback<'a>, tolerance: f64) -> Result<(), NativeResult>;

    fn add_inequality_constraint(&mut self, constraint: SolverCallback<'a>, tolerance: f64)
    -> Result<(), NativeResult>;

    fn set_stop_thresholds(&mut self, thresholds: StopThresholds);

    fn force_stop_handle(&self) -> ForceStop;

    /// Whether objective callbacks will be asked for a gradient.
    fn uses_gradient(&self) -> bool;

    /// Runs from `start`. A callback's `Err` comes back unchanged as `Err`.
    fn optimize(&mut self, start: &[f64]) -> Result<SolverRun, TerminationSignal>;
}
