#![allow(dead_code)]

use shapeopt::{
    Aggregation, CancelToken, Component, ConstraintRelation, ConstraintSpec, Driver, EvaluationAdapter, EvaluationError,
    FeResultSet, FeSolver, GeometryEvaluator, GeometrySnapshot, ObjectiveKind, OptimizationProblem, OutputDef,
    ParameterDef, ProblemConfig, ProblemQuantity, QuantityRole, QuantitySource, SolverOptions, StopOptions, TypedValue,
    ValueKind,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

/// Geometry stub exposing `f = x² + y²` and the raw `x` input.
#[derive(Default)]
pub struct Paraboloid {
    pub x: f64,
    pub y: f64,
    pub recomputes: Arc<AtomicUsize>,
    /// Requests cancellation once this many recomputes have run.
    pub cancel_after: Option<(usize, CancelToken)>,
    /// Reports NaN for `f` on every read.
    pub nan_output: bool,
    pub delay: Option<Duration>,
}

impl Paraboloid {
    pub fn counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.recomputes)
    }
}

impl GeometryEvaluator for Paraboloid {
    fn write_input(&mut self, name: &str, value: &TypedValue) -> Result<(), EvaluationError> {
        let TypedValue::Scalar(v) = value else {
            return Err(EvaluationError::WriteInput {
                name: name.into(),
                message: format!("unexpected {}", value.kind()),
            });
        };
        match name {
            "x" => self.x = *v,
            "y" => self.y = *v,
            _ => {
                return Err(EvaluationError::WriteInput {
                    name: name.into(),
                    message: "unknown input".into(),
                });
            }
        }
        Ok(())
    }

    fn recompute(&mut self) -> Result<(), EvaluationError> {
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        let done = self.recomputes.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((after, token)) = &self.cancel_after {
            if done >= *after {
                token.request();
            }
        }
        Ok(())
    }

    fn read_output(&mut self, name: &str, _kind: ValueKind) -> Result<TypedValue, EvaluationError> {
        match name {
            "f" if self.nan_output => Ok(TypedValue::Scalar(f64::NAN)),
            "f" => Ok(TypedValue::Scalar(self.x * self.x + self.y * self.y)),
            "x" => Ok(TypedValue::Scalar(self.x)),
            _ => Err(EvaluationError::ReadOutput {
                name: name.into(),
                message: "unknown output".into(),
            }),
        }
    }
}

/// FE stub that fails to converge whenever `x` exceeds `limit`.
pub struct FragileSolver {
    pub limit: f64,
}

impl FeSolver for FragileSolver {
    type Model = f64;

    fn build_model(&mut self, geometry: &GeometrySnapshot) -> Result<f64, EvaluationError> {
        match geometry.get("x") {
            Some(TypedValue::Scalar(x)) => Ok(*x),
            _ => Err(EvaluationError::FeModel("geometry has no x".into())),
        }
    }

    fn run_analysis(&mut self, model: &f64) -> Result<FeResultSet, EvaluationError> {
        if *model > self.limit {
            return Err(EvaluationError::FeAnalysis {
                message: format!("x = {} did not converge", model),
                not_converged: true,
            });
        }
        Ok(FeResultSet::new().with("Stress", vec![*model]))
    }
}

fn geometry(output: &str) -> QuantitySource {
    QuantitySource::Geometry {
        output: output.into(),
        component: Component::Value,
    }
}

pub fn config(stop: StopOptions, solver: SolverOptions) -> ProblemConfig {
    ProblemConfig::new(vec![
        ParameterDef::scalar("x", -10.0, 10.0, 5.0),
        ParameterDef::scalar("y", -10.0, 10.0, 5.0),
    ])
    .with_output(OutputDef::new("f", ValueKind::Scalar))
    .with_output(OutputDef::new("x", ValueKind::Scalar))
    .with_quantity(ProblemQuantity::new(
        "f",
        geometry("f"),
        Aggregation::default(),
        QuantityRole::Objective {
            objective: ObjectiveKind::Minimize,
        },
    ))
    .with_stop(stop)
    .with_solver(solver)
}

pub fn problem(stop: StopOptions, solver: SolverOptions) -> OptimizationProblem {
    OptimizationProblem::from_config(config(stop, solver)).unwrap()
}

/// Adds the constraint `x >= 1` (within `tolerance`).
pub fn with_x_floor(config: ProblemConfig, tolerance: f64) -> ProblemConfig {
    config.with_quantity(ProblemQuantity::new(
        "x_floor",
        geometry("x"),
        Aggregation::default(),
        QuantityRole::Constraint {
            constraint: ConstraintSpec {
                relation: ConstraintRelation::HigherThanOrEqual,
                compare_value: 1.0,
                tolerance,
            },
        },
    ))
}

pub fn iterations(limit: usize) -> StopOptions {
    let mut stop = StopOptions::none();
    stop.max_iterations.enabled = true;
    stop.max_iterations.limit = limit;
    stop
}

pub fn paraboloid_driver(problem: OptimizationProblem) -> Driver<EvaluationAdapter<Paraboloid>> {
    Driver::new(EvaluationAdapter::new(Paraboloid::default())).with_problem(problem)
}
