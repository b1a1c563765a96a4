mod adapter;
mod values;

pub use adapter::{
    EvaluationAdapter, ExternalEvaluator, FeResultSet, FeSolver, GeometryEvaluator, GeometrySnapshot, NoFeSolver,
    RawOutputs,
};
pub use values::{Component, Line, OutputDef, TypedValue, ValueKind};
