use super::quantity::{ConstraintRelation, ConstraintSpec, QuantityValue};
use crate::core::EvaluationError;
use indexmap::IndexMap;
use std::sync::OnceLock;

/// How a constraint is handed to the solver.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ConstraintRegistration {
    /// `g(x) = 0` within `tolerance`.
    EqualZero { tolerance: f64 },
    /// `g(x) <= 0` within `tolerance`.
    LessOrEqualZero { tolerance: f64 },
}

impl ConstraintRegistration {
    pub fn for_spec(spec: &ConstraintSpec) -> Self {
        if spec.relation.is_equality() {
            Self::EqualZero {
                tolerance: spec.tolerance,
            }
        } else {
            Self::LessOrEqualZero {
                tolerance: spec.tolerance,
            }
        }
    }

    pub fn tolerance(&self) -> f64 {
        match self {
            Self::EqualZero { tolerance } | Self::LessOrEqualZero { tolerance } => *tolerance,
        }
    }
}

/// Evaluated state of one constraint quantity at one point.
#[derive(Clone, Debug)]
pub struct ConstraintResult {
    quantity: String,
    spec: ConstraintSpec,
    value: f64,
    respected: OnceLock<bool>,
    gradient: Option<Vec<f64>>,
}

impl ConstraintResult {
    pub fn new(quantity: impl Into<String>, spec: ConstraintSpec, value: f64) -> Self {
        Self {
            quantity: quantity.into(),
            spec,
            value,
            respected: OnceLock::new(),
            gradient: None,
        }
    }

    pub fn quantity(&self) -> &str {
        &self.quantity
    }

    pub fn spec(&self) -> &ConstraintSpec {
        &self.spec
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn is_respected(&self) -> bool {
        *self.respected.get_or_init(|| {
            let ConstraintSpec {
                relation,
                compare_value: c,
                tolerance: tol,
            } = self.spec;
            match relation {
                ConstraintRelation::EqualTo => self.value >= c - tol && self.value <= c + tol,
                ConstraintRelation::LowerThanOrEqual => self.value <= c + tol,
                ConstraintRelation::HigherThanOrEqual => self.value >= c - tol,
            }
        })
    }

    /// Value handed to the solver, zero or negative when satisfied.
    pub fn solver_value(&self) -> f64 {
        let delta = self.value - self.spec.compare_value;
        match self.spec.relation {
            ConstraintRelation::HigherThanOrEqual => -delta,
            _ => delta,
        }
    }

    /// Sensitivity of [`solver_value`](Self::solver_value) to each input slot.
    pub fn gradient(&self) -> Option<&[f64]> {
        self.gradient.as_deref()
    }

    pub(crate) fn set_gradient(&mut self, gradient: Vec<f64>) {
        self.gradient = Some(gradient);
    }

    pub fn report(&self) -> String {
        let status = if self.is_respected() { "OK" } else { "FAIL" };
        let lo = self.spec.compare_value - self.spec.tolerance;
        let hi = self.spec.compare_value + self.spec.tolerance;
        match self.spec.relation {
            ConstraintRelation::EqualTo => format!("{} EQUAL {} <= {:+.3e} <= {}", status, lo, self.value, hi),
            ConstraintRelation::LowerThanOrEqual => format!("{} LTorE {:+.3e} <= {}", status, self.value, hi),
            ConstraintRelation::HigherThanOrEqual => format!("{} HTorE {:+.3e} >= {}", status, self.value, lo),
        }
    }
}

/// Builds the result for `name` from the point's resolved quantity values.
pub fn evaluate_constraint(
    name: &str,
    spec: ConstraintSpec,
    quantities: &IndexMap<String, QuantityValue>,
) -> Result<ConstraintResult, EvaluationError> {
    let resolved = quantities.get(name);
    match resolved {
        Some(q) if !q.value.is_nan() => Ok(ConstraintResult::new(name, spec, q.value)),
        _ => {
            let reason = resolved
                .and_then(|q| q.failure.clone())
                .unwrap_or_else(|| "value is NaN".into());
            Err(EvaluationError::InvalidQuantities(vec![format!(
                "{} => Failed to acquire the constraint value: {}",
                name, reason
            )]))
        }
    }
}
