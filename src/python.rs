use crate::core::{ConfigError, EvaluationError, Point3};
use crate::optimization::{CancelToken, Driver, LogReporter, OptimizationProblem};
use crate::simulation::{EvaluationAdapter, GeometryEvaluator, Line, TypedValue, ValueKind};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;

type Triple = (f64, f64, f64);

fn config_error(err: ConfigError) -> PyErr {
    PyValueError::new_err(format!("Invalid problem: {}", err))
}

fn kind_name(kind: ValueKind) -> &'static str {
    match kind {
        ValueKind::Scalar => "scalar",
        ValueKind::Integer => "integer",
        ValueKind::Point => "point",
        ValueKind::ScalarList => "scalar_list",
        ValueKind::PointList => "point_list",
        ValueKind::LineList => "line_list",
    }
}

fn triple(p: &Point3) -> Triple {
    (p.x, p.y, p.z)
}

fn point((x, y, z): Triple) -> Point3 {
    Point3::new(x, y, z)
}

fn to_python(py: Python<'_>, value: &TypedValue) -> PyObject {
    match value {
        TypedValue::Scalar(v) => v.into_py(py),
        TypedValue::Integer(v) => v.into_py(py),
        TypedValue::Point(p) => triple(p).into_py(py),
        TypedValue::ScalarList(vs) => vs.clone().into_py(py),
        TypedValue::PointList(ps) => ps.iter().map(triple).collect::<Vec<_>>().into_py(py),
        TypedValue::LineList(ls) => ls
            .iter()
            .map(|l| (triple(&l.start), triple(&l.end)))
            .collect::<Vec<_>>()
            .into_py(py),
    }
}

fn from_python(value: &Bound<'_, PyAny>, kind: ValueKind) -> PyResult<TypedValue> {
    Ok(match kind {
        ValueKind::Scalar => TypedValue::Scalar(value.extract()?),
        ValueKind::Integer => TypedValue::Integer(value.extract()?),
        ValueKind::Point => TypedValue::Point(point(value.extract()?)),
        ValueKind::ScalarList => TypedValue::ScalarList(value.extract()?),
        ValueKind::PointList => {
            let points: Vec<Triple> = value.extract()?;
            TypedValue::PointList(points.into_iter().map(point).collect())
        }
        ValueKind::LineList => {
            let lines: Vec<(Triple, Triple)> = value.extract()?;
            TypedValue::LineList(lines.into_iter().map(|(a, b)| Line::new(point(a), point(b))).collect())
        }
    })
}

/// Geometry evaluator backed by a Python object with `write_input`,
/// `recompute` and `read_output` methods.
struct PyGeometryEvaluator {
    object: Py<PyAny>,
    cancel: CancelToken,
}

impl GeometryEvaluator for PyGeometryEvaluator {
    fn write_input(&mut self, name: &str, value: &TypedValue) -> Result<(), EvaluationError> {
        Python::with_gil(|py| {
            let value = to_python(py, value);
            self.object
                .bind(py)
                .call_method1("write_input", (name, value))
                .map(|_| ())
                .map_err(|e| EvaluationError::WriteInput {
                    name: name.to_string(),
                    message: e.to_string(),
                })
        })
    }

    fn recompute(&mut self) -> Result<(), EvaluationError> {
        Python::with_gil(|py| {
            // Ctrl+C stops the solve at the next evaluation boundary.
            if py.check_signals().is_err() {
                self.cancel.request();
            }
            self.object
                .bind(py)
                .call_method0("recompute")
                .map(|_| ())
                .map_err(|e| EvaluationError::Recompute(e.to_string()))
        })
    }

    fn read_output(&mut self, name: &str, kind: ValueKind) -> Result<TypedValue, EvaluationError> {
        Python::with_gil(|py| {
            let read_error = |e: PyErr| EvaluationError::ReadOutput {
                name: name.to_string(),
                message: e.to_string(),
            };
            let value = self
                .object
                .bind(py)
                .call_method1("read_output", (name, kind_name(kind)))
                .map_err(read_error)?;
            from_python(&value, kind).map_err(read_error)
        })
    }
}

#[pyclass]
#[derive(Clone)]
pub struct OptimizationResult {
    #[pyo3(get)]
    pub code: String,
    #[pyo3(get)]
    pub message: String,
    #[pyo3(get)]
    pub success: bool,
    /// Best objective found, `None` when no point was evaluated.
    #[pyo3(get)]
    pub objective: Option<f64>,
    #[pyo3(get)]
    pub parameters: Vec<f64>,
    #[pyo3(get)]
    pub evaluations: usize,
}

#[pymethods]
impl OptimizationResult {
    fn __repr__(&self) -> String {
        format!(
            "OptimizationResult(code='{}', objective={:?}, evaluations={})",
            self.code, self.objective, self.evaluations
        )
    }
}

#[pyclass]
pub struct Optimizer {
    problem: OptimizationProblem,
    #[pyo3(get, set)]
    pub verbose: bool,
}

#[pymethods]
impl Optimizer {
    #[new]
    #[pyo3(signature = (config_json, verbose=false))]
    fn new(config_json: &str, verbose: bool) -> PyResult<Self> {
        let problem = OptimizationProblem::from_json_str(config_json).map_err(config_error)?;
        Ok(Self { problem, verbose })
    }

    #[getter]
    fn dimension(&self) -> usize {
        self.problem.dimension()
    }

    /// Runs from `start`, or from the configured start positions with
    /// finite-element retry when `start` is omitted.
    #[pyo3(signature = (evaluator, start=None, seed=0))]
    fn optimize(&self, evaluator: Py<PyAny>, start: Option<Vec<f64>>, seed: u64) -> PyResult<OptimizationResult> {
        let cancel = CancelToken::default();
        let geometry = PyGeometryEvaluator {
            object: evaluator,
            cancel: cancel.clone(),
        };
        let names = self.problem.layout().variable_names();
        let mut driver = Driver::new(EvaluationAdapter::new(geometry))
            .with_problem(self.problem.clone())
            .with_cancel_token(cancel)
            .with_status_reporter(LogReporter::new(self.verbose, names));

        let outcome = match start {
            Some(start) => driver.run(&start),
            None => driver.run_with_retry(&mut StdRng::seed_from_u64(seed)),
        }
        .map_err(config_error)?;

        let history = driver.history();
        let best = history.best();
        Ok(OptimizationResult {
            code: outcome.code.to_string(),
            message: outcome.complete_message(),
            success: outcome.is_finished_ok(),
            objective: best.as_ref().map(|p| p.objective_value()),
            parameters: best.map(|p| p.input().to_vec()).unwrap_or_default(),
            evaluations: history.len(),
        })
    }
}

#[pymodule]
fn shapeopt(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<Optimizer>()?;
    m.add_class::<OptimizationResult>()?;
    Ok(())
}
