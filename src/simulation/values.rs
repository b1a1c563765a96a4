use crate::core::{InputValue, Point3};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Declared type of a geometry input or output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Scalar,
    Integer,
    Point,
    ScalarList,
    PointList,
    LineList,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Scalar => "scalar",
            Self::Integer => "integer",
            Self::Point => "point",
            Self::ScalarList => "scalar list",
            Self::PointList => "point list",
            Self::LineList => "line list",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Line {
    pub start: Point3,
    pub end: Point3,
}

impl Line {
    pub fn new(start: Point3, end: Point3) -> Self {
        Self { start, end }
    }

    pub fn length(&self) -> f64 {
        self.start.distance_to(&self.end)
    }
}

/// Which number to pull out of each element of an output collection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    #[default]
    Value,
    X,
    Y,
    Z,
    Length,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TypedValue {
    Scalar(f64),
    Integer(i64),
    Point(Point3),
    ScalarList(Vec<f64>),
    PointList(Vec<Point3>),
    LineList(Vec<Line>),
}

impl TypedValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Scalar(_) => ValueKind::Scalar,
            Self::Integer(_) => ValueKind::Integer,
            Self::Point(_) => ValueKind::Point,
            Self::ScalarList(_) => ValueKind::ScalarList,
            Self::PointList(_) => ValueKind::PointList,
            Self::LineList(_) => ValueKind::LineList,
        }
    }

    /// Extracts one number per element. Fails when the component does not
    /// apply to this value type.
    pub fn component_values(&self, component: Component) -> Result<Vec<f64>, String> {
        fn axis(p: &Point3, component: Component) -> Option<f64> {
            match component {
                Component::X => Some(p.x),
                Component::Y => Some(p.y),
                Component::Z => Some(p.z),
                Component::Length => Some(p.length()),
                Component::Value => None,
            }
        }

        let mismatch = || format!("component {:?} does not apply to a {}", component, self.kind());

        match (self, component) {
            (Self::Scalar(v), Component::Value) => Ok(vec![*v]),
            (Self::Integer(v), Component::Value) => Ok(vec![*v as f64]),
            (Self::ScalarList(values), Component::Value) => Ok(values.clone()),
            (Self::Point(p), c) => axis(p, c).map(|v| vec![v]).ok_or_else(mismatch),
            (Self::PointList(points), c) => points
                .iter()
                .map(|p| axis(p, c))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(mismatch),
            (Self::LineList(lines), Component::Length) => Ok(lines.iter().map(Line::length).collect()),
            _ => Err(mismatch()),
        }
    }
}

impl From<InputValue> for TypedValue {
    fn from(value: InputValue) -> Self {
        match value {
            InputValue::Scalar(v) => Self::Scalar(v),
            InputValue::Integer(v) => Self::Integer(v),
            InputValue::Point(p) => Self::Point(p),
        }
    }
}

/// A named geometry output read back after every recomputation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputDef {
    pub name: String,
    pub kind: ValueKind,
}

impl OutputDef {
    pub fn new(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}
