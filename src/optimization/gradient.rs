use super::point::SolutionPoint;
use super::problem::GradientOptions;
use crate::core::{ConfigError, EvaluationError};

/// Finite-difference stencil: sample offsets in units of the step, and the
/// weights that turn the samples into a first derivative.
#[derive(Clone, Debug, PartialEq)]
pub struct Stencil {
    offsets: Vec<f64>,
    weights: Vec<f64>,
}

impl Stencil {
    /// Forward stencil `0, 1, .., n-1`, or a symmetric one when `centered`.
    pub fn new(points: usize, centered: bool) -> Result<Self, ConfigError> {
        if points < 2 {
            return Err(ConfigError::InvalidStencil(format!(
                "at least two points are required, got {}",
                points
            )));
        }
        let n = points as f64;
        let offsets: Vec<f64> = (0..points)
            .map(|k| {
                let k = k as f64;
                match (centered, points % 2) {
                    (false, _) => k,
                    (true, 1) => k - (n - 1.0) / 2.0,
                    (true, _) => 2.0 * k - (n - 1.0),
                }
            })
            .collect();
        let weights = derivative_weights(&offsets);
        Ok(Self { offsets, weights })
    }

    pub fn from_options(options: &GradientOptions) -> Result<Self, ConfigError> {
        Self::new(options.points, options.centered)
    }

    pub fn offsets(&self) -> &[f64] {
        &self.offsets
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }
}

/// Lagrange weights `L_k'(0)` for the nodes `t`.
fn derivative_weights(t: &[f64]) -> Vec<f64> {
    (0..t.len())
        .map(|k| {
            let denom: f64 = (0..t.len()).filter(|&j| j != k).map(|j| t[k] - t[j]).product();
            let numer: f64 = (0..t.len())
                .filter(|&m| m != k)
                .map(|m| {
                    (0..t.len())
                        .filter(|&j| j != k && j != m)
                        .map(|j| -t[j])
                        .product::<f64>()
                })
                .sum();
            numer / denom
        })
        .collect()
}

/// One stencil sample along a dimension.
#[derive(Clone, Debug)]
pub struct StencilSample {
    pub offset: f64,
    pub weight: f64,
    /// `None` at offset zero, where the center point's value is reused.
    pub point: Option<SolutionPoint>,
}

/// The samples behind one partial derivative.
#[derive(Clone, Debug)]
pub struct PartialStencil {
    pub dimension: usize,
    pub step: f64,
    pub samples: Vec<StencilSample>,
}

impl PartialStencil {
    /// Combines the samples using `value_of` to read each stencil point.
    pub fn combine<F>(&self, center_value: f64, value_of: F) -> f64
    where
        F: Fn(&SolutionPoint) -> f64,
    {
        let sum: f64 = self
            .samples
            .iter()
            .map(|s| {
                let value = s.point.as_ref().map_or(center_value, &value_of);
                s.weight * value
            })
            .sum();
        sum / self.step
    }
}

pub fn step_size(options: &GradientOptions, x: f64) -> f64 {
    if options.relative_step {
        options.step * x.abs().max(1.0)
    } else {
        options.step
    }
}

/// Estimates the objective gradient at `center`.
///
/// `evaluate(dimension, input)` runs the full evaluation pipeline and returns
/// an ended stencil point. Every stencil is returned for diagnostics.
pub fn compute_gradient<F>(
    stencil: &Stencil,
    options: &GradientOptions,
    center: &[f64],
    center_value: f64,
    mut evaluate: F,
) -> Result<(Vec<f64>, Vec<PartialStencil>), EvaluationError>
where
    F: FnMut(usize, &[f64]) -> Result<SolutionPoint, EvaluationError>,
{
    let mut gradient = Vec::with_capacity(center.len());
    let mut partials = Vec::with_capacity(center.len());

    for dimension in 0..center.len() {
        let step = step_size(options, center[dimension]);
        let mut samples = Vec::with_capacity(stencil.offsets.len());
        for (&offset, &weight) in stencil.offsets.iter().zip(&stencil.weights) {
            let point = if offset == 0.0 {
                None
            } else {
                let mut input = center.to_vec();
                input[dimension] += offset * step;
                Some(evaluate(dimension, &input)?)
            };
            samples.push(StencilSample { offset, weight, point });
        }
        let partial = PartialStencil {
            dimension,
            step,
            samples,
        };
        gradient.push(partial.combine(center_value, SolutionPoint::objective_value));
        partials.push(partial);
    }

    Ok((gradient, partials))
}

/// Gradient of a constraint's solver value, reusing the objective stencils.
pub fn constraint_gradient(partials: &[PartialStencil], center_value: f64, constraint: &str) -> Vec<f64> {
    partials
        .iter()
        .map(|partial| {
            partial.combine(center_value, |p| {
                p.constraint(constraint).map_or(f64::NAN, |c| c.solver_value())
            })
        })
        .collect()
}
