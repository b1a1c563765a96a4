use super::callback::StatusReporter;
use super::constraint::{ConstraintRegistration, evaluate_constraint};
use super::gradient::{Stencil, compute_gradient, constraint_gradient};
use super::objective::objective_value;
use super::point::{HistoryView, HistoryWriter, Phase, PointKind, SolutionPoint, history};
use super::problem::{OptimizationProblem, StopOptions};
use super::solvers::{ForceStop, SolverCallback, StopThresholds, select_backend};
use super::stop::{evaluate_stop_criteria, first_triggered};
use super::termination::{TerminationCode, TerminationOutcome, TerminationSignal};
use crate::core::{ConfigError, EvaluationError, ParameterLayout};
use crate::simulation::{ExternalEvaluator, RawOutputs};
use rand::Rng;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

type Reporters = Vec<Box<dyn StatusReporter + Send>>;

/// Cooperative cancellation flag, polled at the start of every solver callback.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
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

/// Runs one configured problem against an [`ExternalEvaluator`].
///
/// The driver owns the evaluation history and is the only writer to it.
/// Every run produces exactly one [`TerminationOutcome`]; configuration
/// problems are returned as `Err` before the solver starts.
pub struct Driver<E> {
    evaluator: E,
    problem: Option<OptimizationProblem>,
    reporters: Reporters,
    cancel: CancelToken,
    writer: HistoryWriter,
    view: HistoryView,
    outcome: TerminationOutcome,
}

impl<E: ExternalEvaluator> Driver<E> {
    pub fn new(evaluator: E) -> Self {
        let (writer, view) = history();
        Self {
            evaluator,
            problem: None,
            reporters: Vec::new(),
            cancel: CancelToken::default(),
            writer,
            view,
            outcome: TerminationOutcome::not_started(),
        }
    }

    pub fn configure(&mut self, problem: OptimizationProblem) {
        self.problem = Some(problem);
        self.outcome = TerminationOutcome::not_started();
    }

    pub fn with_problem(mut self, problem: OptimizationProblem) -> Self {
        self.configure(problem);
        self
    }

    pub fn with_status_reporter(mut self, reporter: impl StatusReporter + Send + 'static) -> Self {
        self.add_status_reporter(reporter);
        self
    }

    /// Shares `token` with whoever else needs to request cancellation.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn add_status_reporter(&mut self, reporter: impl StatusReporter + Send + 'static) {
        self.reporters.push(Box::new(reporter));
    }

    pub(crate) fn pop_status_reporter(&mut self) -> Option<Box<dyn StatusReporter + Send>> {
        self.reporters.pop()
    }

    pub fn problem(&self) -> Option<&OptimizationProblem> {
        self.problem.as_ref()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn request_cancel(&self) {
        self.cancel.request();
    }

    pub fn history(&self) -> HistoryView {
        self.view.clone()
    }

    /// Outcome of the last run, `NotStarted` before the first one.
    pub fn outcome(&self) -> &TerminationOutcome {
        &self.outcome
    }

    pub fn evaluator(&self) -> &E {
        &self.evaluator
    }

    pub fn evaluator_mut(&mut self) -> &mut E {
        &mut self.evaluator
    }

    pub fn into_evaluator(self) -> E {
        self.evaluator
    }

    /// Solves from `start`, which must lie within the problem's bounds.
    pub fn run(&mut self, start: &[f64]) -> Result<TerminationOutcome, ConfigError> {
        let problem = self.problem.clone().ok_or(ConfigError::NotConfigured)?;
        let (outcome, _) = self.attempt(&problem, start)?;
        Ok(self.finish(outcome))
    }

    /// Solves from the parameters' start positions, narrowing the search box
    /// and restarting whenever the finite-element solve fails to converge.
    pub fn run_with_retry<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<TerminationOutcome, ConfigError> {
        let base = self.problem.clone().ok_or(ConfigError::NotConfigured)?;
        let limit = base.retry_limit();
        let mut problem = base.clone();
        let mut start = base.layout().start_vector(rng);
        let mut note: Option<String> = None;
        let mut retries = 0;

        loop {
            let (mut outcome, failed_input) = self.attempt(&problem, &start)?;
            if let Some(note) = note.take() {
                outcome = outcome.with_additional_message(note);
            }

            let not_converged = outcome.code == TerminationCode::Failed
                && outcome.cause.as_ref().is_some_and(|c| c.is_fe_not_converged());
            if !not_converged || retries >= limit {
                return Ok(self.finish(outcome));
            }

            let successful: Vec<Vec<f64>> = self.view.snapshot().iter().map(|p| p.input().to_vec()).collect();
            let failed = failed_input.unwrap_or_else(|| start.clone());
            let narrowed = narrow_bounds(
                problem.layout(),
                problem.lower_bounds(),
                problem.upper_bounds(),
                &start,
                &failed,
                &successful,
            )
            .and_then(|b| Ok((problem.with_bounds(b.lower, b.upper)?, b.start)));
            let (narrowed, new_start) = match narrowed {
                Ok(next) => next,
                Err(err) => {
                    let message = match outcome.additional_message.take() {
                        Some(note) => format!("{}\n{}", note, err),
                        None => err.to_string(),
                    };
                    return Ok(self.finish(outcome.with_additional_message(message)));
                }
            };

            retries += 1;
            let message = format!(
                "FE analysis did not converge for point #{}. Retrying with more restrictive bounds. Retry {} of {}.",
                successful.len() + 1,
                retries,
                limit
            );
            warn!(
                retry = retries,
                limit,
                points = successful.len(),
                "finite-element solve did not converge, narrowing bounds"
            );
            problem = narrowed;
            start = new_start;
            note = Some(message);
        }
    }

    /// Publishes the outcome and re-arms the cancel token for the next run.
    fn finish(&mut self, outcome: TerminationOutcome) -> TerminationOutcome {
        for reporter in self.reporters.iter_mut() {
            reporter.finished(&outcome);
        }
        self.cancel.reset();
        self.outcome = outcome.clone();
        outcome
    }

    /// One solver run on a fresh history. Also returns the input that was
    /// being evaluated when the run failed, if any.
    fn attempt(
        &mut self,
        problem: &OptimizationProblem,
        start: &[f64],
    ) -> Result<(TerminationOutcome, Option<Vec<f64>>), ConfigError> {
        check_start(problem, start)?;
        let stencil = Stencil::from_options(problem.gradient())?;
        self.writer.clear();

        let (mut backend, reason) = select_backend(problem.solver(), problem.dimension(), problem.has_constraints());
        info!(solver = backend.name(), dimension = problem.dimension(), %reason, "starting optimization");

        if let Err(native) = backend.set_lower_bounds(problem.lower_bounds()) {
            return Ok((native.to_outcome(), None));
        }
        if let Err(native) = backend.set_upper_bounds(problem.upper_bounds()) {
            return Ok((native.to_outcome(), None));
        }

        let context = Rc::new(RefCell::new(SolveContext {
            evaluator: &mut self.evaluator,
            problem,
            reporters: &mut self.reporters,
            writer: &self.writer,
            cancel: &self.cancel,
            force_stop: backend.force_stop_handle(),
            stencil,
            started: Instant::now(),
            in_flight: None,
        }));

        let ctx = Rc::clone(&context);
        backend.set_min_objective(Box::new(move |x: &[f64], grad: Option<&mut [f64]>| {
            ctx.borrow_mut().objective(x, grad)
        }));

        for (quantity, spec) in problem.constraint_quantities() {
            let ctx = Rc::clone(&context);
            let name = quantity.name.clone();
            let callback: SolverCallback<'_> = Box::new(move |x: &[f64], grad: Option<&mut [f64]>| {
                ctx.borrow_mut().constraint(&name, x, grad)
            });
            let registered = match ConstraintRegistration::for_spec(&spec) {
                ConstraintRegistration::EqualZero { tolerance } => backend.add_equality_constraint(callback, tolerance),
                ConstraintRegistration::LessOrEqualZero { tolerance } => {
                    backend.add_inequality_constraint(callback, tolerance)
                }
            };
            if let Err(native) = registered {
                warn!(constraint = %quantity.name, ?native, "solver rejected constraint");
                let outcome = native
                    .to_outcome()
                    .with_additional_message(format!("Could not register constraint {}.", quantity.name));
                return Ok((outcome, None));
            }
        }

        backend.set_stop_thresholds(native_thresholds(problem.stop()));

        let outcome = match backend.optimize(start) {
            Ok(run) => {
                debug!(result = ?run.result, evaluations = run.evaluations, best = run.best_cost, "solver returned");
                let outcome = run.result.to_outcome();
                match run.detail {
                    Some(detail) => outcome.with_additional_message(detail),
                    None => outcome,
                }
            }
            Err(signal) => signal.into(),
        };
        drop(backend);

        let failed_input = context.borrow_mut().in_flight.take();
        Ok((outcome, failed_input))
    }
}

fn check_start(problem: &OptimizationProblem, start: &[f64]) -> Result<(), ConfigError> {
    if start.len() != problem.dimension() {
        return Err(ConfigError::LengthMismatch {
            what: "start vector".into(),
            expected: problem.dimension(),
            actual: start.len(),
        });
    }
    let bounds = problem.lower_bounds().iter().zip(problem.upper_bounds());
    for (i, (&x, (&min, &max))) in start.iter().zip(bounds).enumerate() {
        if !(x >= min && x <= max) {
            return Err(ConfigError::StartOutOfBounds {
                name: problem.layout().variable_name(i).unwrap_or_default(),
                start: x,
                min,
                max,
            });
        }
    }
    Ok(())
}

/// Thresholds handed to the solver so it also stops on its own.
fn native_thresholds(stop: &StopOptions) -> StopThresholds {
    StopThresholds {
        stopval: stop.stop_value.enabled.then_some(stop.stop_value.limit),
        ftol_abs: stop
            .function_absolute_change
            .enabled
            .then_some(stop.function_absolute_change.limit),
        ftol_rel: stop
            .function_relative_change
            .enabled
            .then_some(stop.function_relative_change.limit),
        xtol_abs: stop
            .parameter_absolute_change
            .enabled
            .then(|| stop.parameter_absolute_change.limit.clone()),
        xtol_rel: stop
            .parameter_relative_change
            .enabled
            .then_some(stop.parameter_relative_change.limit),
        // The driver's own check fires first, on the point with index == limit.
        maxeval: stop
            .max_iterations
            .enabled
            .then_some(stop.max_iterations.limit.saturating_add(1)),
        maxtime: stop
            .max_time
            .enabled
            .then(|| Duration::from_secs_f64(stop.max_time.limit)),
    }
}

/// Search box and start for the next attempt after a non-converged FE solve.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryBounds {
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
    pub start: Vec<f64>,
}

/// Narrows the search box around the region that evaluated successfully.
///
/// With no successful point, each dimension keeps the half of its range
/// farther from `start`. Otherwise only dimensions where `failed` lies
/// outside the successful span are cropped.
pub fn narrow_bounds(
    layout: &ParameterLayout,
    lower: &[f64],
    upper: &[f64],
    start: &[f64],
    failed: &[f64],
    successful: &[Vec<f64>],
) -> Result<RetryBounds, ConfigError> {
    let n = lower.len();
    let mut next = RetryBounds {
        lower: lower.to_vec(),
        upper: upper.to_vec(),
        start: start.to_vec(),
    };
    let middle = |lo: f64, hi: f64| (hi - lo) / 2.0 + lo;

    if successful.is_empty() {
        for i in 0..n {
            let to_lower = (start[i] - lower[i]).abs();
            let to_upper = (start[i] - upper[i]).abs();
            if to_lower == to_upper {
                return Err(ConfigError::Retry(format!(
                    "Parameter {}: cannot retry with different search bounds because the first point failed \
                     and its start value is at the middle of the range.",
                    layout.variable_name(i).unwrap_or_default()
                )));
            }
            if to_lower > to_upper {
                next.upper[i] = start[i];
            } else {
                next.lower[i] = start[i];
            }
            next.start[i] = middle(next.lower[i], next.upper[i]);
        }
        return Ok(next);
    }

    for i in 0..n {
        let (min_ok, max_ok) = successful
            .iter()
            .filter_map(|p| p.get(i).copied())
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
        let x = failed[i];
        if x >= min_ok && x <= max_ok {
            continue;
        }

        let near_lower = lower[i] + (lower[i] * 0.05).abs();
        let near_upper = upper[i] - (upper[i] * 0.05).abs();
        if x < near_lower {
            next.lower[i] = near_lower;
        } else if x > near_upper {
            next.upper[i] = near_upper;
        } else if x > max_ok {
            next.upper[i] = x - (x * 0.05).abs();
        } else {
            next.lower[i] = x + (x * 0.05).abs();
        }
        next.start[i] = middle(next.lower[i], next.upper[i]);
    }
    Ok(next)
}

/// State shared by the objective and constraint callbacks of one run.
struct SolveContext<'d, E> {
    evaluator: &'d mut E,
    problem: &'d OptimizationProblem,
    reporters: &'d mut Reporters,
    writer: &'d HistoryWriter,
    cancel: &'d CancelToken,
    force_stop: ForceStop,
    stencil: Stencil,
    started: Instant,
    /// Input of the main point under evaluation.
    in_flight: Option<Vec<f64>>,
}

impl<E: ExternalEvaluator> SolveContext<'_, E> {
    fn objective(&mut self, x: &[f64], grad: Option<&mut [f64]>) -> Result<f64, TerminationSignal> {
        self.precheck(x)?;
        let point = self.point_for(x, grad.is_some())?;
        if let (Some(grad), Some(gradient)) = (grad, point.gradient()) {
            grad.copy_from_slice(gradient);
        }

        if let Some(criterion) = first_triggered(point.stop_criteria()) {
            self.force_stop.request();
            info!(
                criterion = %criterion.kind,
                name = %criterion.name,
                value = criterion.criteria_value,
                limit = criterion.limit,
                "stop criterion reached"
            );
            return Err(TerminationSignal::converged(criterion.message()));
        }
        Ok(point.objective_value())
    }

    fn constraint(&mut self, name: &str, x: &[f64], grad: Option<&mut [f64]>) -> Result<f64, TerminationSignal> {
        self.precheck(x)?;
        let point = self.point_for(x, grad.is_some())?;
        let result = point.constraint(name).ok_or_else(|| {
            self.force_stop.request();
            TerminationSignal::new(TerminationCode::Failed, format!("Constraint {} was not evaluated.", name))
        })?;
        if let (Some(grad), Some(gradient)) = (grad, result.gradient()) {
            grad.copy_from_slice(gradient);
        }
        Ok(result.solver_value())
    }

    fn precheck(&self, x: &[f64]) -> Result<(), TerminationSignal> {
        if x.iter().any(|v| v.is_nan()) {
            self.force_stop.request();
            warn!("solver proposed a NaN input");
            return Err(TerminationSignal::new(
                TerminationCode::Failed,
                "The solver gave Not A Number (NaN) as input to the objective function.",
            ));
        }
        if self.cancel.is_requested() {
            self.force_stop.request();
            warn!("cancellation requested, stopping the solver");
            return Err(TerminationSignal::forced_stop());
        }
        Ok(())
    }

    /// Recorded point for `x`, evaluating it when the history has none that fits.
    fn point_for(&mut self, x: &[f64], with_gradient: bool) -> Result<Arc<SolutionPoint>, TerminationSignal> {
        if let Some(point) = self.writer.view().find(x) {
            if !with_gradient || point.gradient().is_some() {
                debug!(index = ?point.index(), "reusing evaluated point");
                return Ok(point);
            }
        }
        self.evaluate_main(x, with_gradient).map_err(|err| {
            self.force_stop.request();
            warn!(error = %err, "point evaluation failed");
            TerminationSignal::failed("Failed in the calculation of the Function Point.", err)
        })
    }

    fn enter(&mut self, point: &mut SolutionPoint, phase: Phase) -> Result<(), EvaluationError> {
        point.advance(phase)?;
        for reporter in self.reporters.iter_mut() {
            reporter.phase(phase.description());
        }
        Ok(())
    }

    /// Runs the pipeline up to the objective and constraint values.
    fn evaluate_point(&mut self, x: &[f64], kind: PointKind) -> Result<SolutionPoint, EvaluationError> {
        let problem = self.problem;
        let values = problem.layout().decode(x)?;
        let mut point = SolutionPoint::new(x, values, kind);
        let started = Instant::now();

        self.enter(&mut point, Phase::GeometryUpdating)?;
        let geometry = self.evaluator.update_geometry(point.values(), problem.outputs())?;
        let fe = if self.evaluator.has_fe_pass() {
            self.enter(&mut point, Phase::FiniteElementRunning)?;
            let fe_started = Instant::now();
            let results = self.evaluator.run_fe(&geometry)?;
            point.timings.fe_solve = fe_started.elapsed();
            Some(results)
        } else {
            None
        };

        self.enter(&mut point, Phase::OutputsInitializing)?;
        point.set_raw_outputs(RawOutputs { geometry, fe });
        let quantities = problem
            .quantities()
            .iter()
            .map(|q| (q.name.clone(), q.resolve(point.raw_outputs())))
            .collect();
        point.set_quantity_values(quantities);

        self.enter(&mut point, Phase::ObjectiveCalculating)?;
        let value = objective_value(problem, point.quantity_values())?;
        if value.is_nan() {
            return Err(EvaluationError::NanObjective);
        }
        point.set_objective(value)?;
        for (quantity, spec) in problem.constraint_quantities() {
            point.constraint_or_try_insert_with(&quantity.name, |p| {
                evaluate_constraint(&quantity.name, spec, p.quantity_values())
            })?;
        }

        point.timings.evaluation = started.elapsed();
        Ok(point)
    }

    /// Evaluates a main point, its gradient if asked, and records it.
    fn evaluate_main(&mut self, x: &[f64], with_gradient: bool) -> Result<Arc<SolutionPoint>, EvaluationError> {
        self.in_flight = Some(x.to_vec());
        let started = Instant::now();
        let mut point = self.evaluate_point(x, PointKind::Main)?;

        if with_gradient {
            self.enter(&mut point, Phase::GradientsRunning)?;
            let gradient_started = Instant::now();
            let stencil = self.stencil.clone();
            let options = *self.problem.gradient();
            let center = point.objective_value();
            let (gradient, partials) = compute_gradient(&stencil, &options, x, center, |dimension, input| {
                let mut sample = self.evaluate_point(input, PointKind::GradientSample { dimension })?;
                sample.advance(Phase::Ended)?;
                Ok(sample)
            })?;

            let names: Vec<String> = point.constraints().keys().cloned().collect();
            for name in names {
                if let Some(result) = point.constraint_mut(&name) {
                    let center = result.solver_value();
                    result.set_gradient(constraint_gradient(&partials, center, &name));
                }
            }
            point.set_gradient(gradient, partials)?;
            point.timings.gradient = gradient_started.elapsed();
        }

        self.enter(&mut point, Phase::Ended)?;
        let elapsed = self.started.elapsed();
        point.timings.total = started.elapsed();
        point.set_since_start(elapsed);

        let previous = self.writer.view().last();
        let criteria = evaluate_stop_criteria(
            self.problem.stop(),
            self.problem.layout(),
            self.writer.len(),
            elapsed,
            &point,
            previous.as_deref(),
        );
        point.set_stop_criteria(criteria);

        let point = self.writer.push(point);
        self.in_flight = None;
        debug!(index = ?point.index(), objective = point.objective_value(), "point recorded");
        for reporter in self.reporters.iter_mut() {
            reporter.point_completed(&point);
        }
        Ok(point)
    }
}
