use super::traits::{ForceStop, SolverBackend, SolverCallback, SolverRun, StopThresholds};
use crate::optimization::constraint::ConstraintRegistration;
use crate::optimization::problem::{Algorithm, SolverOptions};
use crate::optimization::termination::{NativeResult, TerminationSignal};
use argmin::core::{CostFunction, Executor, Gradient, State, TerminationReason, TerminationStatus};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::neldermead::NelderMead;
use argmin::solver::quasinewton::LBFGS;
use std::cell::{Cell, RefCell};
use std::time::Instant;
use tracing::{debug, warn};

/// Why an evaluation ended the solve.
#[derive(Debug)]
enum Halt {
    Native(NativeResult),
    Signal(TerminationSignal),
}

/// Returned to argmin once a [`Halt`] is latched. The halt itself is read
/// back from the evaluator after the executor returns.
#[derive(Debug, thiserror::Error)]
#[error("solve halted")]
struct Halted;

struct Registered<'a> {
    kind: ConstraintRegistration,
    callback: SolverCallback<'a>,
}

/// [`SolverBackend`] over argmin's Nelder-Mead and L-BFGS solvers.
///
/// Bounds are enforced by clamping every proposal. Constraints are folded
/// into the objective as a quadratic penalty on the part of the violation
/// that exceeds the tolerance.
pub struct ArgminBackend<'a> {
    options: SolverOptions,
    dimension: usize,
    lower: Vec<f64>,
    upper: Vec<f64>,
    objective: Option<SolverCallback<'a>>,
    constraints: Vec<Registered<'a>>,
    thresholds: StopThresholds,
    force_stop: ForceStop,
}

impl<'a> ArgminBackend<'a> {
    pub fn new(dimension: usize, options: SolverOptions) -> Self {
        Self {
            options,
            dimension,
            lower: vec![f64::NEG_INFINITY; dimension],
            upper: vec![f64::INFINITY; dimension],
            objective: None,
            constraints: Vec::new(),
            thresholds: StopThresholds::default(),
            force_stop: ForceStop::default(),
        }
    }

    fn add_constraint(
        &mut self,
        kind: ConstraintRegistration,
        callback: SolverCallback<'a>,
    ) -> Result<(), NativeResult> {
        if !self.options.use_lagrangian {
            return Err(NativeResult::InvalidArgs);
        }
        if !(kind.tolerance() >= 0.0) {
            return Err(NativeResult::InvalidArgs);
        }
        self.constraints.push(Registered { kind, callback });
        Ok(())
    }

    fn initial_simplex(&self, start: &[f64]) -> Vec<Vec<f64>> {
        let mut simplex = vec![start.to_vec()];
        for i in 0..start.len() {
            let range = self.upper[i] - self.lower[i];
            let step = if range.is_finite() && range > 0.0 {
                self.options.simplex_scale * range
            } else {
                self.options.simplex_scale * start[i].abs().max(1.0)
            };
            let mut vertex = start.to_vec();
            vertex[i] = if start[i] + step <= self.upper[i] {
                start[i] + step
            } else {
                start[i] - step
            };
            simplex.push(vertex);
        }
        simplex
    }

    fn has_tolerance(&self) -> (bool, bool) {
        let t = &self.thresholds;
        (
            t.ftol_abs.is_some() || t.ftol_rel.is_some(),
            t.xtol_abs.is_some() || t.xtol_rel.is_some(),
        )
    }

    fn map_status(&self, status: &TerminationStatus) -> (NativeResult, Option<String>) {
        let (ftol, xtol) = self.has_tolerance();
        let TerminationStatus::Terminated(reason) = status else {
            return (NativeResult::Success, Some(status.to_string()));
        };
        match reason {
            TerminationReason::MaxItersReached => (NativeResult::MaxevalReached, None),
            TerminationReason::TargetCostReached => (NativeResult::StopvalReached, None),
            TerminationReason::SolverConverged if ftol => (NativeResult::FtolReached, None),
            TerminationReason::SolverConverged if xtol => (NativeResult::XtolReached, None),
            TerminationReason::SolverConverged => (NativeResult::Success, None),
            TerminationReason::Interrupt => (NativeResult::ForcedStop, None),
            _ => (NativeResult::Success, Some(status.to_string())),
        }
    }
}

#[derive(Clone, Debug)]
struct Evaluation {
    x: Vec<f64>,
    cost: f64,
    gradient: Option<Vec<f64>>,
}

struct Evaluator<'s, 'a> {
    objective: RefCell<&'s mut SolverCallback<'a>>,
    constraints: RefCell<&'s mut [Registered<'a>]>,
    lower: &'s [f64],
    upper: &'s [f64],
    thresholds: &'s StopThresholds,
    force_stop: &'s ForceStop,
    penalty: f64,
    wants_gradient: bool,
    started: Instant,
    evaluations: Cell<usize>,
    /// Cost calls the solver makes during initialization, which argmin's
    /// Nelder-Mead does not let fail.
    init_calls: usize,
    calls: Cell<usize>,
    halt: RefCell<Option<Halt>>,
    best: RefCell<Option<(Vec<f64>, f64)>>,
    last: RefCell<Option<Evaluation>>,
}

impl Evaluator<'_, '_> {
    fn clamp(&self, x: &[f64]) -> Vec<f64> {
        x.iter()
            .zip(self.lower.iter().zip(self.upper))
            .map(|(&v, (&lo, &hi))| v.clamp(lo, hi))
            .collect()
    }

    fn check_native_limits(&self) -> Result<(), Halt> {
        if self.force_stop.is_requested() {
            return Err(Halt::Native(NativeResult::ForcedStop));
        }
        if let Some(max) = self.thresholds.maxeval {
            if self.evaluations.get() >= max {
                return Err(Halt::Native(NativeResult::MaxevalReached));
            }
        }
        if let Some(limit) = self.thresholds.maxtime {
            if self.started.elapsed() >= limit {
                return Err(Halt::Native(NativeResult::MaxtimeReached));
            }
        }
        Ok(())
    }

    /// Latches the first halt. While the solver is still initializing, an
    /// infinite cost stands in for the error; afterwards argmin gets `Err`.
    fn evaluate(&self, raw: &[f64], need_gradient: bool) -> Result<Evaluation, argmin::core::Error> {
        let call = self.calls.get();
        self.calls.set(call + 1);

        if self.halt.borrow().is_none() {
            match self.try_evaluate(raw, need_gradient) {
                Ok(evaluation) => return Ok(evaluation),
                Err(halt) => {
                    debug!(?halt, call, "solve halted");
                    self.force_stop.request();
                    *self.halt.borrow_mut() = Some(halt);
                }
            }
        }

        if call < self.init_calls {
            Ok(Evaluation {
                x: raw.to_vec(),
                cost: f64::INFINITY,
                gradient: need_gradient.then(|| vec![0.0; raw.len()]),
            })
        } else {
            Err(Halted.into())
        }
    }

    fn try_evaluate(&self, raw: &[f64], need_gradient: bool) -> Result<Evaluation, Halt> {
        let x = self.clamp(raw);
        if let Some(last) = self.last.borrow().as_ref() {
            if last.x == x && (!need_gradient || last.gradient.is_some()) {
                return Ok(last.clone());
            }
        }
        self.check_native_limits()?;

        let dim = x.len();
        let mut grad = need_gradient.then(|| vec![0.0; dim]);
        let mut cost = {
            let mut objective = self.objective.borrow_mut();
            (**objective)(&x, grad.as_deref_mut()).map_err(Halt::Signal)?
        };

        let mut constraints = self.constraints.borrow_mut();
        let mut constraint_grad = need_gradient.then(|| vec![0.0; dim]);
        for registered in constraints.iter_mut() {
            let g = (registered.callback)(&x, constraint_grad.as_deref_mut()).map_err(Halt::Signal)?;
            let (violation, sign) = match registered.kind {
                ConstraintRegistration::EqualZero { tolerance } => ((g.abs() - tolerance).max(0.0), g.signum()),
                ConstraintRegistration::LessOrEqualZero { tolerance } => ((g - tolerance).max(0.0), 1.0),
            };
            if violation > 0.0 {
                cost += self.penalty * violation * violation;
                if let (Some(grad), Some(cg)) = (grad.as_mut(), constraint_grad.as_ref()) {
                    for (gi, ci) in grad.iter_mut().zip(cg) {
                        *gi += 2.0 * self.penalty * violation * sign * ci;
                    }
                }
            }
        }
        drop(constraints);

        // Projected gradient: no descent direction through an active bound.
        if let Some(grad) = grad.as_mut() {
            for i in 0..dim {
                if (raw[i] <= self.lower[i] && grad[i] > 0.0) || (raw[i] >= self.upper[i] && grad[i] < 0.0) {
                    grad[i] = 0.0;
                }
            }
        }

        self.evaluations.set(self.evaluations.get() + 1);
        {
            let mut best = self.best.borrow_mut();
            if best.as_ref().is_none_or(|(_, c)| cost < *c) {
                *best = Some((x.clone(), cost));
            }
        }

        let evaluation = Evaluation {
            x,
            cost,
            gradient: grad,
        };
        *self.last.borrow_mut() = Some(evaluation.clone());

        if let Some(stopval) = self.thresholds.stopval {
            if cost <= stopval {
                return Err(Halt::Native(NativeResult::StopvalReached));
            }
        }
        Ok(evaluation)
    }
}

impl CostFunction for &Evaluator<'_, '_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, param: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
        Ok(self.evaluate(param, self.wants_gradient)?.cost)
    }
}

impl Gradient for &Evaluator<'_, '_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, param: &Self::Param) -> Result<Self::Gradient, argmin::core::Error> {
        self.evaluate(param, true)?
            .gradient
            .ok_or_else(|| argmin::core::Error::msg("objective returned no gradient"))
    }
}

impl<'a> SolverBackend<'a> for ArgminBackend<'a> {
    fn name(&self) -> &str {
        match self.options.algorithm {
            Algorithm::NelderMead => "NelderMead",
            Algorithm::Lbfgs => "L-BFGS",
        }
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn set_lower_bounds(&mut self, lower: &[f64]) -> Result<(), NativeResult> {
        if lower.len() != self.dimension {
            return Err(NativeResult::InvalidArgs);
        }
        self.lower = lower.to_vec();
        Ok(())
    }

    fn set_upper_bounds(&mut self, upper: &[f64]) -> Result<(), NativeResult> {
        if upper.len() != self.dimension {
            return Err(NativeResult::InvalidArgs);
        }
        self.upper = upper.to_vec();
        Ok(())
    }

    fn set_min_objective(&mut self, objective: SolverCallback<'a>) {
        self.objective = Some(objective);
    }

    fn add_equality_constraint(&mut self, constraint: SolverCallback<'a>, tolerance: f64) -> Result<(), NativeResult> {
        self.add_constraint(ConstraintRegistration::EqualZero { tolerance }, constraint)
    }

    fn add_inequality_constraint(
        &mut self,
        constraint: SolverCallback<'a>,
        tolerance: f64,
    ) -> Result<(), NativeResult> {
        self.add_constraint(ConstraintRegistration::LessOrEqualZero { tolerance }, constraint)
    }

    fn set_stop_thresholds(&mut self, thresholds: StopThresholds) {
        self.thresholds = thresholds;
    }

    fn force_stop_handle(&self) -> ForceStop {
        self.force_stop.clone()
    }

    fn uses_gradient(&self) -> bool {
        self.options.algorithm.needs_gradient()
    }

    fn optimize(&mut self, start: &[f64]) -> Result<SolverRun, TerminationSignal> {
        let invalid = |detail: &str| SolverRun {
            result: NativeResult::InvalidArgs,
            best_param: None,
            best_cost: f64::NAN,
            evaluations: 0,
            detail: Some(detail.to_string()),
        };
        if start.len() != self.dimension {
            return Ok(invalid("start vector length does not match the dimension"));
        }
        if self.lower.iter().zip(&self.upper).any(|(lo, hi)| !(lo <= hi)) {
            return Ok(invalid("lower bound exceeds upper bound"));
        }

        let simplex = self.initial_simplex(start);
        let (ftol_abs, ftol_rel) = (self.thresholds.ftol_abs, self.thresholds.ftol_rel);
        let wants_gradient = self.uses_gradient();
        let algorithm = self.options.algorithm;
        let penalty = self.options.penalty;
        let memory = self.options.lbfgs_memory;
        let x0: Vec<f64> = start
            .iter()
            .zip(self.lower.iter().zip(&self.upper))
            .map(|(&v, (&lo, &hi))| v.clamp(lo, hi))
            .collect();

        let Some(objective) = self.objective.as_mut() else {
            return Ok(invalid("no objective registered"));
        };
        let evaluator = Evaluator {
            objective: RefCell::new(objective),
            constraints: RefCell::new(self.constraints.as_mut_slice()),
            lower: &self.lower,
            upper: &self.upper,
            thresholds: &self.thresholds,
            force_stop: &self.force_stop,
            penalty,
            wants_gradient,
            started: Instant::now(),
            evaluations: Cell::new(0),
            init_calls: match algorithm {
                Algorithm::NelderMead => simplex.len(),
                Algorithm::Lbfgs => 0,
            },
            calls: Cell::new(0),
            halt: RefCell::new(None),
            best: RefCell::new(None),
            last: RefCell::new(None),
        };

        let status = match algorithm {
            Algorithm::NelderMead => NelderMead::new(simplex)
                .with_sd_tolerance(ftol_abs.unwrap_or(f64::EPSILON))
                .and_then(|solver| {
                    Executor::new(&evaluator, solver)
                        .configure(|state| state.max_iters(u64::MAX))
                        .run()
                })
                .map(|res| res.state().get_termination_status().clone()),
            Algorithm::Lbfgs => LBFGS::new(MoreThuenteLineSearch::new(), memory)
                .with_tolerance_grad(1e-10)
                .and_then(|solver| solver.with_tolerance_cost(ftol_rel.unwrap_or(f64::EPSILON)))
                .and_then(|solver| {
                    Executor::new(&evaluator, solver)
                        .configure(|state| state.param(x0).max_iters(u64::MAX))
                        .run()
                })
                .map(|res| res.state().get_termination_status().clone()),
        };

        let evaluations = evaluator.evaluations.get();
        let halt = evaluator.halt.into_inner();
        let best = evaluator.best.into_inner();

        // A latched halt wins over whatever argmin reported.
        let (result, detail) = match (halt, status) {
            (Some(Halt::Signal(signal)), _) => return Err(signal),
            (Some(Halt::Native(native)), _) => (native, None),
            (None, Ok(status)) => self.map_status(&status),
            (None, Err(err)) => {
                warn!(error = %err, "argmin solver failed");
                (NativeResult::Failure, Some(err.to_string()))
            }
        };

        debug!(solver = self.name(), ?result, evaluations, "solver returned");
        Ok(SolverRun {
            result,
            best_cost: best.as_ref().map_or(f64::NAN, |(_, c)| *c),
            best_param: best.map(|(x, _)| x),
            evaluations,
            detail,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimization::termination::TerminationCode;
    use approx::assert_abs_diff_eq;

    fn paraboloid(x: &[f64], grad: Option<&mut [f64]>) -> Result<f64, TerminationSignal> {
        if let Some(grad) = grad {
            grad[0] = 2.0 * (x[0] - 1.0);
            grad[1] = 2.0 * (x[1] + 2.0);
        }
        Ok((x[0] - 1.0).powi(2) + (x[1] + 2.0).powi(2))
    }

    fn backend<'a>(algorithm: Algorithm) -> ArgminBackend<'a> {
        let mut b = ArgminBackend::new(
            2,
            SolverOptions {
                algorithm,
                ..SolverOptions::default()
            },
        );
        b.set_lower_bounds(&[-5.0, -5.0]).unwrap();
        b.set_upper_bounds(&[5.0, 5.0]).unwrap();
        b
    }

    #[test]
    fn nelder_mead_finds_minimum() {
        let mut b = backend(Algorithm::NelderMead);
        b.set_min_objective(Box::new(paraboloid));
        b.set_stop_thresholds(StopThresholds {
            ftol_abs: Some(1e-12),
            maxeval: Some(2000),
            ..StopThresholds::default()
        });
        let run = b.optimize(&[3.0, 3.0]).unwrap();
        let best = run.best_param.unwrap();
        assert_abs_diff_eq!(best[0], 1.0, epsilon = 1e-3);
        assert_abs_diff_eq!(best[1], -2.0, epsilon = 1e-3);
        assert!(matches!(run.result, NativeResult::FtolReached | NativeResult::MaxevalReached));
    }

    #[test]
    fn lbfgs_uses_gradient() {
        let mut b = backend(Algorithm::Lbfgs);
        assert!(b.uses_gradient());
        let mut grad_calls = 0;
        b.set_min_objective(Box::new(|x: &[f64], grad: Option<&mut [f64]>| {
            if grad.is_some() {
                grad_calls += 1;
            }
            paraboloid(x, grad)
        }));
        b.set_stop_thresholds(StopThresholds {
            maxeval: Some(200),
            ..StopThresholds::default()
        });
        let run = b.optimize(&[3.0, 3.0]).unwrap();
        drop(b);
        assert!(grad_calls > 0);
        assert_abs_diff_eq!(run.best_cost, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn maxeval_stops_the_solver() {
        let mut b = backend(Algorithm::NelderMead);
        b.set_min_objective(Box::new(paraboloid));
        b.set_stop_thresholds(StopThresholds {
            maxeval: Some(5),
            ..StopThresholds::default()
        });
        let run = b.optimize(&[3.0, 3.0]).unwrap();
        assert_eq!(run.result, NativeResult::MaxevalReached);
        assert_eq!(run.evaluations, 5);
    }

    #[test]
    fn stopval_and_force_stop() {
        let mut b = backend(Algorithm::NelderMead);
        b.set_min_objective(Box::new(paraboloid));
        b.set_stop_thresholds(StopThresholds {
            stopval: Some(100.0),
            ..StopThresholds::default()
        });
        assert_eq!(b.optimize(&[3.0, 3.0]).unwrap().result, NativeResult::StopvalReached);

        let mut b = backend(Algorithm::NelderMead);
        let handle = b.force_stop_handle();
        b.set_min_objective(Box::new(move |x: &[f64], g: Option<&mut [f64]>| {
            handle.request();
            paraboloid(x, g)
        }));
        let run = b.optimize(&[3.0, 3.0]).unwrap();
        assert_eq!(run.result, NativeResult::ForcedStop);
        assert_eq!(run.evaluations, 1);
    }

    #[test]
    fn callback_signal_is_returned_unchanged() {
        let mut b = backend(Algorithm::NelderMead);
        b.set_min_objective(Box::new(|_: &[f64], _: Option<&mut [f64]>| {
            Err(TerminationSignal::converged("Stop value of the objective function has been reached."))
        }));
        let signal = b.optimize(&[0.0, 0.0]).unwrap_err();
        assert_eq!(signal.code, TerminationCode::Converged);
    }

    #[test]
    fn halt_during_simplex_setup_skips_remaining_vertices() {
        let mut b = backend(Algorithm::NelderMead);
        let mut calls = 0;
        b.set_min_objective(Box::new(|x: &[f64], g: Option<&mut [f64]>| {
            calls += 1;
            if calls == 2 {
                return Err(TerminationSignal::forced_stop());
            }
            paraboloid(x, g)
        }));
        let signal = b.optimize(&[3.0, 3.0]).unwrap_err();
        drop(b);
        assert_eq!(signal.code, TerminationCode::ForcedStop);
        assert_eq!(calls, 2);

        let mut b = backend(Algorithm::NelderMead);
        b.set_min_objective(Box::new(paraboloid));
        b.force_stop_handle().request();
        let run = b.optimize(&[3.0, 3.0]).unwrap();
        assert_eq!(run.result, NativeResult::ForcedStop);
        assert_eq!(run.evaluations, 0);
    }

    #[test]
    fn constraints_require_lagrangian_folding() {
        let mut b = ArgminBackend::new(
            2,
            SolverOptions {
                use_lagrangian: false,
                ..SolverOptions::default()
            },
        );
        let result = b.add_inequality_constraint(Box::new(|x: &[f64], _: Option<&mut [f64]>| Ok(x[0])), 0.0);
        assert_eq!(result, Err(NativeResult::InvalidArgs));
    }

    #[test]
    fn folded_constraint_moves_the_optimum() {
        let mut b = backend(Algorithm::NelderMead);
        b.set_min_objective(Box::new(paraboloid));
        // x0 >= 2, expressed as 2 - x0 <= 0.
        b.add_inequality_constraint(Box::new(|x: &[f64], _: Option<&mut [f64]>| Ok(2.0 - x[0])), 0.0)
            .unwrap();
        b.set_stop_thresholds(StopThresholds {
            ftol_abs: Some(1e-12),
            maxeval: Some(3000),
            ..StopThresholds::default()
        });
        let best = b.optimize(&[4.0, 0.0]).unwrap().best_param.unwrap();
        assert_abs_diff_eq!(best[0], 2.0, epsilon = 1e-2);
        assert_abs_diff_eq!(best[1], -2.0, epsilon = 1e-2);
    }
}
