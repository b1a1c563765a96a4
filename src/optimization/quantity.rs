use crate::simulation::{Component, RawOutputs};
use serde::{Deserialize, Serialize};

/// Where a quantity's raw list of numbers comes from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum QuantitySource {
    Geometry {
        output: String,
        #[serde(default)]
        component: Component,
    },
    FeResult {
        result: String,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateKind {
    #[default]
    Max,
    Min,
    Mean,
    StandardDeviation,
    Sum,
    Product,
}

/// Reduces a raw list to one number.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    #[serde(default)]
    pub kind: AggregateKind,
    #[serde(default)]
    pub use_absolute_values: bool,
    /// Maps `[lo, hi]` linearly onto `[0, 1]` after reduction.
    #[serde(default)]
    pub scale_range: Option<(f64, f64)>,
}

impl Aggregation {
    pub fn new(kind: AggregateKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    pub fn absolute(mut self) -> Self {
        self.use_absolute_values = true;
        self
    }

    pub fn scaled(mut self, lo: f64, hi: f64) -> Self {
        self.scale_range = Some((lo, hi));
        self
    }

    pub fn apply(&self, values: &[f64]) -> Result<f64, String> {
        if values.is_empty() {
            return Err("no values to aggregate".into());
        }
        if values.iter().any(|v| v.is_nan()) {
            return Err("value list contains NaN".into());
        }
        let values: Vec<f64> = if self.use_absolute_values {
            values.iter().map(|v| v.abs()).collect()
        } else {
            values.to_vec()
        };
        let n = values.len() as f64;

        let reduced = match self.kind {
            AggregateKind::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            AggregateKind::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            AggregateKind::Sum => values.iter().sum(),
            AggregateKind::Product => values.iter().product(),
            AggregateKind::Mean => values.iter().sum::<f64>() / n,
            AggregateKind::StandardDeviation => {
                if values.len() < 2 {
                    return Err("standard deviation needs at least two values".into());
                }
                let mean = values.iter().sum::<f64>() / n;
                let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
                var.sqrt()
            }
        };

        Ok(match self.scale_range {
            Some((lo, hi)) => (reduced - lo) / (hi - lo),
            None => reduced,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObjectiveKind {
    Target { value: f64 },
    Minimize,
    Maximize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintRelation {
    EqualTo,
    LowerThanOrEqual,
    HigherThanOrEqual,
}

impl ConstraintRelation {
    pub fn is_equality(&self) -> bool {
        matches!(self, Self::EqualTo)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConstraintSpec {
    pub relation: ConstraintRelation,
    pub compare_value: f64,
    pub tolerance: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum QuantityRole {
    #[default]
    OutputOnly,
    Objective {
        objective: ObjectiveKind,
    },
    Constraint {
        constraint: ConstraintSpec,
    },
}

/// A named, aggregated number derived from the raw outputs of a point.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProblemQuantity {
    pub name: String,
    pub source: QuantitySource,
    #[serde(default)]
    pub aggregation: Aggregation,
    #[serde(default)]
    pub role: QuantityRole,
}

/// Aggregated value of one quantity. NaN carries a failure description.
#[derive(Clone, Debug, PartialEq)]
pub struct QuantityValue {
    pub value: f64,
    pub failure: Option<String>,
}

impl QuantityValue {
    pub fn ok(value: f64) -> Self {
        Self { value, failure: None }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            value: f64::NAN,
            failure: Some(message.into()),
        }
    }
}

impl ProblemQuantity {
    pub fn new(name: impl Into<String>, source: QuantitySource, aggregation: Aggregation, role: QuantityRole) -> Self {
        Self {
            name: name.into(),
            source,
            aggregation,
            role,
        }
    }

    pub fn objective(&self) -> Option<ObjectiveKind> {
        match self.role {
            QuantityRole::Objective { objective } => Some(objective),
            _ => None,
        }
    }

    pub fn constraint(&self) -> Option<ConstraintSpec> {
        match self.role {
            QuantityRole::Constraint { constraint } => Some(constraint),
            _ => None,
        }
    }

    pub fn resolve(&self, raw: &RawOutputs) -> QuantityValue {
        let values = match &self.source {
            QuantitySource::Geometry { output, component } => match raw.geometry.get(output) {
                Some(value) => value.component_values(*component),
                None => Err(format!("output '{}' was not read", output)),
            },
            QuantitySource::FeResult { result } => match raw.fe.as_ref().and_then(|fe| fe.get(result)) {
                Some(values) => Ok(values.to_vec()),
                None => Err(format!("finite-element result '{}' is unavailable", result)),
            },
        };

        match values.and_then(|v| self.aggregation.apply(&v)) {
            Ok(value) if value.is_nan() => QuantityValue::failed("aggregate value is NaN"),
            Ok(value) => QuantityValue::ok(value),
            Err(message) => QuantityValue::failed(message),
        }
    }
}
