use super::error::ConfigError;
use rand::Rng;
use serde::{Deserialize, Serialize};

// ===== GEOMETRY PRIMITIVES =====

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Point3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point3 {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn to_array(self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }

    pub fn from_slice(values: &[f64]) -> Self {
        Self::new(values[0], values[1], values[2])
    }

    pub fn length(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn distance_to(&self, other: &Point3) -> f64 {
        Point3::new(other.x - self.x, other.y - self.y, other.z - self.z).length()
    }
}

// ===== ENUMS =====

/// How the solver's initial value for a parameter is chosen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    Given,
    CenterOfRange,
    #[default]
    Random,
    PercentRandomFromCenter,
    PercentRandomFromGiven,
}

/// A decoded input value, typed by its parameter kind.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputValue {
    Integer(i64),
    Scalar(f64),
    Point(Point3),
}

impl InputValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Scalar(_) => "scalar",
            Self::Integer(_) => "integer",
            Self::Point(_) => "point",
        }
    }
}

// ===== PARAMETER DESCRIPTORS =====

/// Search range and given start value of one input parameter.
///
/// Each variant owns its slice of the flat solver vector: one slot for
/// scalars and integers, three for a point.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParameterKind {
    Scalar { min: f64, max: f64, start: f64 },
    Integer { min: i64, max: i64, start: i64 },
    Point { min: Point3, max: Point3, start: Point3 },
}

impl ParameterKind {
    pub fn variable_count(&self) -> usize {
        match self {
            Self::Scalar { .. } | Self::Integer { .. } => 1,
            Self::Point { .. } => 3,
        }
    }

    pub fn lower_bounds(&self) -> Vec<f64> {
        match self {
            Self::Scalar { min, .. } => vec![*min],
            Self::Integer { min, .. } => vec![*min as f64],
            Self::Point { min, .. } => min.to_array().to_vec(),
        }
    }

    pub fn upper_bounds(&self) -> Vec<f64> {
        match self {
            Self::Scalar { max, .. } => vec![*max],
            Self::Integer { max, .. } => vec![*max as f64],
            Self::Point { max, .. } => max.to_array().to_vec(),
        }
    }

    pub fn given_start(&self) -> Vec<f64> {
        match self {
            Self::Scalar { start, .. } => vec![*start],
            Self::Integer { start, .. } => vec![*start as f64],
            Self::Point { start, .. } => start.to_array().to_vec(),
        }
    }

    /// Default absolute tolerance of each slot, used by the parameter
    /// absolute-change stop criterion.
    pub fn default_tolerance(&self) -> Vec<f64> {
        match self {
            Self::Integer { .. } => vec![0.5],
            _ => self
                .lower_bounds()
                .iter()
                .zip(self.upper_bounds())
                .map(|(lo, hi)| (hi - lo) * 1e-4)
                .collect(),
        }
    }

    /// Appends the flat representation of `value` to `out`.
    pub fn encode(&self, name: &str, value: &InputValue, out: &mut Vec<f64>) -> Result<(), ConfigError> {
        match (self, value) {
            (Self::Scalar { .. }, InputValue::Scalar(v)) => out.push(*v),
            (Self::Scalar { .. }, InputValue::Integer(v)) => out.push(*v as f64),
            (Self::Integer { .. }, InputValue::Integer(v)) => out.push(*v as f64),
            (Self::Point { .. }, InputValue::Point(p)) => out.extend_from_slice(&p.to_array()),
            (_, other) => {
                return Err(ConfigError::InputKindMismatch {
                    name: name.to_string(),
                    actual: other.type_name().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Decodes this parameter's slots. `slots` holds exactly `variable_count` values.
    pub fn decode(&self, slots: &[f64]) -> InputValue {
        match self {
            Self::Scalar { .. } => InputValue::Scalar(slots[0]),
            Self::Integer { .. } => InputValue::Integer(slots[0].round() as i64),
            Self::Point { .. } => InputValue::Point(Point3::from_slice(slots)),
        }
    }
}

fn default_start_percent() -> f64 {
    0.1
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    pub name: String,
    #[serde(flatten)]
    pub kind: ParameterKind,
    #[serde(default)]
    pub start_position: StartPosition,
    #[serde(default = "default_start_percent")]
    pub start_percent: f64,
}

impl ParameterDef {
    pub fn new(name: impl Into<String>, kind: ParameterKind) -> Self {
        Self {
            name: name.into(),
            kind,
            start_position: StartPosition::Given,
            start_percent: default_start_percent(),
        }
    }

    pub fn scalar(name: impl Into<String>, min: f64, max: f64, start: f64) -> Self {
        Self::new(name, ParameterKind::Scalar { min, max, start })
    }

    pub fn integer(name: impl Into<String>, min: i64, max: i64, start: i64) -> Self {
        Self::new(name, ParameterKind::Integer { min, max, start })
    }

    pub fn point(name: impl Into<String>, min: Point3, max: Point3, start: Point3) -> Self {
        Self::new(name, ParameterKind::Point { min, max, start })
    }

    pub fn with_start_position(mut self, position: StartPosition, percent: f64) -> Self {
        self.start_position = position;
        self.start_percent = percent;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }
        let lower = self.kind.lower_bounds();
        let upper = self.kind.upper_bounds();
        let start = self.kind.given_start();
        for ((&min, &max), &s) in lower.iter().zip(&upper).zip(&start) {
            if !(min <= max) {
                return Err(ConfigError::InvalidBounds {
                    name: self.name.clone(),
                    min,
                    max,
                });
            }
            if !(min..=max).contains(&s) {
                return Err(ConfigError::StartOutOfBounds {
                    name: self.name.clone(),
                    start: s,
                    min,
                    max,
                });
            }
        }
        let percent_based = matches!(
            self.start_position,
            StartPosition::PercentRandomFromCenter | StartPosition::PercentRandomFromGiven
        );
        if percent_based && !(self.start_percent > 0.05 && self.start_percent <= 1.0) {
            return Err(ConfigError::InvalidStartPercent {
                name: self.name.clone(),
                percent: self.start_percent,
            });
        }
        Ok(())
    }

    /// Display name of each slot, e.g. `"P - X"` for a point component.
    pub fn variable_names(&self) -> Vec<String> {
        match self.kind {
            ParameterKind::Point { .. } => ["X", "Y", "Z"]
                .iter()
                .map(|axis| format!("{} - {}", self.name, axis))
                .collect(),
            _ => vec![self.name.clone()],
        }
    }

    /// Solver start values for this parameter's slots.
    pub fn start_values<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f64> {
        let lower = self.kind.lower_bounds();
        let upper = self.kind.upper_bounds();
        let given = self.kind.given_start();
        let integer = matches!(self.kind, ParameterKind::Integer { .. });

        let values: Vec<f64> = (0..lower.len())
            .map(|i| {
                let (lo, hi) = (lower[i], upper[i]);
                let center = (lo + hi) / 2.0;
                let raw = match self.start_position {
                    StartPosition::Given => given[i],
                    StartPosition::CenterOfRange => center,
                    StartPosition::Random => rng.gen_range(lo..=hi),
                    StartPosition::PercentRandomFromCenter => {
                        let r = rng.gen_range(-self.start_percent..=self.start_percent);
                        center * (1.0 + r)
                    }
                    StartPosition::PercentRandomFromGiven => {
                        let r = rng.gen_range(-self.start_percent..=self.start_percent);
                        given[i] * (1.0 + r)
                    }
                };
                raw.clamp(lo, hi)
            })
            .collect();

        if integer {
            values.into_iter().map(f64::round).collect()
        } else {
            values
        }
    }
}
