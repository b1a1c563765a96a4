use super::quantity::{ConstraintSpec, ObjectiveKind, ProblemQuantity, QuantitySource};
use super::stop::StopCriterionKind;
use crate::core::{ConfigError, ParameterDef, ParameterLayout};
use crate::simulation::OutputDef;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// How objective contributions are summed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SumPolicy {
    Simple,
    #[default]
    Squares,
}

/// Finite-difference stencil used when the solver asks for a gradient.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GradientOptions {
    /// Samples per partial derivative, the center point included when it lies on the stencil.
    pub points: usize,
    /// Symmetric stencil around the center instead of a forward one.
    pub centered: bool,
    pub step: f64,
    /// Scale the step by `max(|x_i|, 1)`.
    pub relative_step: bool,
}

impl Default for GradientOptions {
    fn default() -> Self {
        Self {
            points: 2,
            centered: false,
            step: 1e-6,
            relative_step: true,
        }
    }
}

/// A stop criterion's user toggle and limit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Toggle<T> {
    pub enabled: bool,
    pub limit: T,
}

impl<T> Toggle<T> {
    pub fn on(limit: T) -> Self {
        Self { enabled: true, limit }
    }

    pub fn off(limit: T) -> Self {
        Self { enabled: false, limit }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopOptions {
    pub max_iterations: Toggle<usize>,
    /// Seconds.
    pub max_time: Toggle<f64>,
    pub stop_value: Toggle<f64>,
    pub function_absolute_change: Toggle<f64>,
    pub function_relative_change: Toggle<f64>,
    /// One limit per dimension. Left empty, each parameter's default tolerance is used.
    pub parameter_absolute_change: Toggle<Vec<f64>>,
    pub parameter_relative_change: Toggle<f64>,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self {
            max_iterations: Toggle::on(10_000),
            max_time: Toggle::off(3600.0),
            stop_value: Toggle::off(1e-6),
            function_absolute_change: Toggle::off(1e-6),
            function_relative_change: Toggle::off(1e-3),
            parameter_absolute_change: Toggle::off(Vec::new()),
            parameter_relative_change: Toggle::off(1e-3),
        }
    }
}

impl StopOptions {
    /// Only the criteria switched on here are active.
    pub fn none() -> Self {
        let mut options = Self::default();
        options.max_iterations.enabled = false;
        options
    }

    pub fn any_enabled(&self) -> bool {
        self.max_iterations.enabled
            || self.max_time.enabled
            || self.stop_value.enabled
            || self.function_absolute_change.enabled
            || self.function_relative_change.enabled
            || self.parameter_absolute_change.enabled
            || self.parameter_relative_change.enabled
    }

    fn validate(&mut self, layout: &ParameterLayout) -> Result<(), ConfigError> {
        if !self.any_enabled() {
            return Err(ConfigError::NoActiveStopCriterion);
        }

        let positive = |kind: StopCriterionKind, enabled: bool, limit: f64| {
            if enabled && !(limit > 0.0) {
                Err(ConfigError::NonPositiveLimit {
                    name: kind.to_string(),
                    limit,
                })
            } else {
                Ok(())
            }
        };
        positive(
            StopCriterionKind::Iterations,
            self.max_iterations.enabled,
            self.max_iterations.limit as f64,
        )?;
        positive(StopCriterionKind::Time, self.max_time.enabled, self.max_time.limit)?;
        positive(
            StopCriterionKind::FunctionAbsoluteChange,
            self.function_absolute_change.enabled,
            self.function_absolute_change.limit,
        )?;
        positive(
            StopCriterionKind::FunctionRelativeChange,
            self.function_relative_change.enabled,
            self.function_relative_change.limit,
        )?;
        positive(
            StopCriterionKind::ParameterRelativeChange,
            self.parameter_relative_change.enabled,
            self.parameter_relative_change.limit,
        )?;
        if self.stop_value.enabled && !self.stop_value.limit.is_finite() {
            return Err(ConfigError::NonPositiveLimit {
                name: StopCriterionKind::FunctionValue.to_string(),
                limit: self.stop_value.limit,
            });
        }

        let limits = &mut self.parameter_absolute_change.limit;
        if limits.is_empty() {
            *limits = layout.default_tolerances();
        }
        if limits.len() != layout.dimension() {
            return Err(ConfigError::LengthMismatch {
                what: "parameter absolute change limits".into(),
                expected: layout.dimension(),
                actual: limits.len(),
            });
        }
        if self.parameter_absolute_change.enabled {
            for &limit in limits.iter() {
                positive(StopCriterionKind::ParameterAbsoluteChange, true, limit)?;
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Derivative-free simplex search.
    #[default]
    NelderMead,
    /// Quasi-Newton search. Requests gradients on every evaluation.
    Lbfgs,
}

impl Algorithm {
    pub fn needs_gradient(&self) -> bool {
        matches!(self, Self::Lbfgs)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    pub algorithm: Algorithm,
    /// Fold constraints into the objective instead of handing them to the solver.
    pub use_lagrangian: bool,
    /// Weight of the squared constraint violation in the folded objective.
    pub penalty: f64,
    /// Initial simplex edge as a fraction of each dimension's range.
    pub simplex_scale: f64,
    pub lbfgs_memory: usize,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::NelderMead,
            use_lagrangian: true,
            penalty: 1e3,
            simplex_scale: 0.1,
            lbfgs_memory: 7,
        }
    }
}

fn default_retry_limit() -> usize {
    10
}

/// Serializable description of an optimization problem.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProblemConfig {
    pub parameters: Vec<ParameterDef>,
    #[serde(default)]
    pub outputs: Vec<OutputDef>,
    #[serde(default)]
    pub quantities: Vec<ProblemQuantity>,
    #[serde(default)]
    pub sum_policy: SumPolicy,
    #[serde(default)]
    pub gradient: GradientOptions,
    #[serde(default)]
    pub stop: StopOptions,
    #[serde(default)]
    pub solver: SolverOptions,
    /// Restarts allowed after a finite-element solve fails to converge.
    #[serde(default = "default_retry_limit")]
    pub retry_limit: usize,
}

impl ProblemConfig {
    pub fn new(parameters: Vec<ParameterDef>) -> Self {
        Self {
            parameters,
            outputs: Vec::new(),
            quantities: Vec::new(),
            sum_policy: SumPolicy::default(),
            gradient: GradientOptions::default(),
            stop: StopOptions::default(),
            solver: SolverOptions::default(),
            retry_limit: default_retry_limit(),
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn with_output(mut self, output: OutputDef) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn with_quantity(mut self, quantity: ProblemQuantity) -> Self {
        self.quantities.push(quantity);
        self
    }

    pub fn with_sum_policy(mut self, policy: SumPolicy) -> Self {
        self.sum_policy = policy;
        self
    }

    pub fn with_gradient(mut self, gradient: GradientOptions) -> Self {
        self.gradient = gradient;
        self
    }

    pub fn with_stop(mut self, stop: StopOptions) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_solver(mut self, solver: SolverOptions) -> Self {
        self.solver = solver;
        self
    }
}

/// Validated problem definition. Immutable for the duration of a run.
#[derive(Clone, Debug)]
pub struct OptimizationProblem {
    layout: ParameterLayout,
    lower: Vec<f64>,
    upper: Vec<f64>,
    outputs: Vec<OutputDef>,
    quantities: Vec<ProblemQuantity>,
    sum_policy: SumPolicy,
    gradient: GradientOptions,
    stop: StopOptions,
    solver: SolverOptions,
    retry_limit: usize,
}

impl OptimizationProblem {
    pub fn from_config(config: ProblemConfig) -> Result<Self, ConfigError> {
        let layout = ParameterLayout::new(config.parameters)?;

        let output_names: HashSet<&str> = config.outputs.iter().map(|o| o.name.as_str()).collect();
        let mut quantity_names = HashSet::new();
        for quantity in &config.quantities {
            if !quantity_names.insert(quantity.name.as_str()) {
                return Err(ConfigError::DuplicateQuantity(quantity.name.clone()));
            }
            if let QuantitySource::Geometry { output, .. } = &quantity.source {
                if !output_names.contains(output.as_str()) {
                    return Err(ConfigError::UnknownOutput {
                        quantity: quantity.name.clone(),
                        output: output.clone(),
                    });
                }
            }
            if let Some(spec) = quantity.constraint() {
                if !(spec.tolerance >= 0.0) {
                    return Err(ConfigError::NegativeTolerance(quantity.name.clone()));
                }
            }
        }
        if !config.quantities.iter().any(|q| q.objective().is_some()) {
            return Err(ConfigError::NoObjective);
        }

        let gradient = config.gradient;
        if gradient.points < 2 {
            return Err(ConfigError::InvalidStencil(format!(
                "at least two points are required, got {}",
                gradient.points
            )));
        }
        if !(gradient.step > 0.0) {
            return Err(ConfigError::InvalidStencil(format!(
                "step must be positive, got {}",
                gradient.step
            )));
        }

        let solver = config.solver;
        if !(solver.penalty > 0.0) {
            return Err(ConfigError::InvalidSolverOption("penalty must be positive".into()));
        }
        if !(solver.simplex_scale > 0.0) {
            return Err(ConfigError::InvalidSolverOption("simplex scale must be positive".into()));
        }
        if solver.lbfgs_memory == 0 {
            return Err(ConfigError::InvalidSolverOption("L-BFGS memory must be at least 1".into()));
        }

        let mut stop = config.stop;
        stop.validate(&layout)?;

        Ok(Self {
            lower: layout.lower_bounds(),
            upper: layout.upper_bounds(),
            layout,
            outputs: config.outputs,
            quantities: config.quantities,
            sum_policy: config.sum_policy,
            gradient,
            stop,
            solver,
            retry_limit: config.retry_limit,
        })
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Self::from_config(ProblemConfig::from_json_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_config(ProblemConfig::from_path(path)?)
    }

    /// Copy of this problem with a narrower search box.
    pub fn with_bounds(&self, lower: Vec<f64>, upper: Vec<f64>) -> Result<Self, ConfigError> {
        let dim = self.dimension();
        for (what, v) in [("lower bounds", &lower), ("upper bounds", &upper)] {
            if v.len() != dim {
                return Err(ConfigError::LengthMismatch {
                    what: what.into(),
                    expected: dim,
                    actual: v.len(),
                });
            }
        }
        for (i, (&lo, &hi)) in lower.iter().zip(&upper).enumerate() {
            if !(lo <= hi) {
                return Err(ConfigError::InvalidBounds {
                    name: self.layout.variable_name(i).unwrap_or_default(),
                    min: lo,
                    max: hi,
                });
            }
        }
        Ok(Self {
            lower,
            upper,
            ..self.clone()
        })
    }

    pub fn dimension(&self) -> usize {
        self.layout.dimension()
    }

    pub fn layout(&self) -> &ParameterLayout {
        &self.layout
    }

    pub fn lower_bounds(&self) -> &[f64] {
        &self.lower
    }

    pub fn upper_bounds(&self) -> &[f64] {
        &self.upper
    }

    pub fn outputs(&self) -> &[OutputDef] {
        &self.outputs
    }

    pub fn quantities(&self) -> &[ProblemQuantity] {
        &self.quantities
    }

    pub fn objective_quantities(&self) -> impl Iterator<Item = (&ProblemQuantity, ObjectiveKind)> {
        self.quantities.iter().filter_map(|q| q.objective().map(|k| (q, k)))
    }

    pub fn constraint_quantities(&self) -> impl Iterator<Item = (&ProblemQuantity, ConstraintSpec)> {
        self.quantities.iter().filter_map(|q| q.constraint().map(|c| (q, c)))
    }

    pub fn has_constraints(&self) -> bool {
        self.constraint_quantities().next().is_some()
    }

    pub fn sum_policy(&self) -> SumPolicy {
        self.sum_policy
    }

    pub fn gradient(&self) -> &GradientOptions {
        &self.gradient
    }

    pub fn stop(&self) -> &StopOptions {
        &self.stop
    }

    pub fn solver(&self) -> &SolverOptions {
        &self.solver
    }

    pub fn retry_limit(&self) -> usize {
        self.retry_limit
    }
}
