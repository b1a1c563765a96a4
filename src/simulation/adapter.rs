use super::values::{OutputDef, TypedValue, ValueKind};
use crate::core::{EvaluationError, NamedValues};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Geometry outputs read back after one recomputation, by output name.
pub type GeometrySnapshot = IndexMap<String, TypedValue>;

/// Parametric geometry tool driven one input at a time.
///
/// Implementations are stateful and never called reentrantly.
pub trait GeometryEvaluator {
    fn write_input(&mut self, name: &str, value: &TypedValue) -> Result<(), EvaluationError>;

    fn recompute(&mut self) -> Result<(), EvaluationError>;

    fn read_output(&mut self, name: &str, kind: ValueKind) -> Result<TypedValue, EvaluationError>;
}

/// Named result lists collected from one finite-element analysis.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FeResultSet {
    results: IndexMap<String, Vec<f64>>,
}

impl FeResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, values: Vec<f64>) -> Self {
        self.insert(name, values);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, values: Vec<f64>) {
        self.results.insert(name.into(), values);
    }

    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.results.get(name).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[f64])> {
        self.results.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

pub trait FeSolver {
    type Model;

    fn build_model(&mut self, geometry: &GeometrySnapshot) -> Result<Self::Model, EvaluationError>;

    /// Runs the analysis, blocking until results are available.
    fn run_analysis(&mut self, model: &Self::Model) -> Result<FeResultSet, EvaluationError>;
}

/// Placeholder solver for geometry-only problems.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoFeSolver;

impl FeSolver for NoFeSolver {
    type Model = ();

    fn build_model(&mut self, _geometry: &GeometrySnapshot) -> Result<(), EvaluationError> {
        Err(EvaluationError::FeModel("no finite-element solver configured".into()))
    }

    fn run_analysis(&mut self, _model: &()) -> Result<FeResultSet, EvaluationError> {
        Err(EvaluationError::FeModel("no finite-element solver configured".into()))
    }
}

/// Everything the collaborators produced for one input vector.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawOutputs {
    pub geometry: GeometrySnapshot,
    pub fe: Option<FeResultSet>,
}

/// What the driver needs from the outside world to evaluate a point.
///
/// The two passes are split so the driver can advance the point's phase
/// between them.
pub trait ExternalEvaluator {
    fn has_fe_pass(&self) -> bool;

    fn update_geometry(
        &mut self,
        inputs: &NamedValues,
        outputs: &[OutputDef],
    ) -> Result<GeometrySnapshot, EvaluationError>;

    fn run_fe(&mut self, geometry: &GeometrySnapshot) -> Result<FeResultSet, EvaluationError>;

    fn evaluate(&mut self, inputs: &NamedValues, outputs: &[OutputDef]) -> Result<RawOutputs, EvaluationError> {
        let geometry = self.update_geometry(inputs, outputs)?;
        let fe = if self.has_fe_pass() {
            Some(self.run_fe(&geometry)?)
        } else {
            None
        };
        Ok(RawOutputs { geometry, fe })
    }
}

/// Drives a [`GeometryEvaluator`] and, when configured, an [`FeSolver`].
///
/// Performs no caching.
pub struct EvaluationAdapter<G, F = NoFeSolver> {
    geometry: G,
    fe: Option<F>,
}

impl<G: GeometryEvaluator> EvaluationAdapter<G, NoFeSolver> {
    pub fn new(geometry: G) -> Self {
        Self { geometry, fe: None }
    }
}

impl<G: GeometryEvaluator, F: FeSolver> EvaluationAdapter<G, F> {
    pub fn with_fe_solver<F2: FeSolver>(self, fe: F2) -> EvaluationAdapter<G, F2> {
        EvaluationAdapter {
            geometry: self.geometry,
            fe: Some(fe),
        }
    }

    pub fn geometry(&self) -> &G {
        &self.geometry
    }

    pub fn geometry_mut(&mut self) -> &mut G {
        &mut self.geometry
    }

    pub fn fe_solver(&self) -> Option<&F> {
        self.fe.as_ref()
    }

    pub fn into_parts(self) -> (G, Option<F>) {
        (self.geometry, self.fe)
    }
}

impl<G: GeometryEvaluator, F: FeSolver> ExternalEvaluator for EvaluationAdapter<G, F> {
    fn has_fe_pass(&self) -> bool {
        self.fe.is_some()
    }

    fn update_geometry(
        &mut self,
        inputs: &NamedValues,
        outputs: &[OutputDef],
    ) -> Result<GeometrySnapshot, EvaluationError> {
        for (name, value) in inputs {
            self.geometry.write_input(name, &TypedValue::from(*value))?;
        }
        self.geometry.recompute()?;

        let mut snapshot = GeometrySnapshot::with_capacity(outputs.len());
        for output in outputs {
            let value = self.geometry.read_output(&output.name, output.kind)?;
            if value.kind() != output.kind {
                return Err(EvaluationError::TypeMismatch {
                    name: output.name.clone(),
                    expected: output.kind.to_string(),
                    actual: value.kind().to_string(),
                });
            }
            snapshot.insert(output.name.clone(), value);
        }
        debug!(inputs = inputs.len(), outputs = snapshot.len(), "geometry updated");
        Ok(snapshot)
    }

    fn run_fe(&mut self, geometry: &GeometrySnapshot) -> Result<FeResultSet, EvaluationError> {
        let fe = self
            .fe
            .as_mut()
            .ok_or_else(|| EvaluationError::FeModel("no finite-element solver configured".into()))?;
        let model = fe.build_model(geometry)?;
        let results = fe.run_analysis(&model)?;
        debug!(results = results.iter().count(), "finite-element analysis complete");
        Ok(results)
    }
}
