use thiserror::Error;

/// Problems detected before the solve loop starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("problem has no degrees of freedom")]
    EmptyDimension,

    #[error("parameter name must not be empty")]
    EmptyName,

    #[error("duplicate parameter name '{0}'")]
    DuplicateName(String),

    #[error("duplicate quantity name '{0}'")]
    DuplicateQuantity(String),

    #[error("parameter '{name}': lower bound {min} exceeds upper bound {max}")]
    InvalidBounds { name: String, min: f64, max: f64 },

    #[error("parameter '{name}': start value {start} lies outside [{min}, {max}]")]
    StartOutOfBounds {
        name: String,
        start: f64,
        min: f64,
        max: f64,
    },

    #[error("parameter '{name}': start percent {percent} must lie in (0.05, 1]")]
    InvalidStartPercent { name: String, percent: f64 },

    #[error("input '{name}' was given as {actual}, which does not match its declared kind")]
    InputKindMismatch { name: String, actual: String },

    #[error("no value supplied for input '{0}'")]
    MissingInput(String),

    #[error("vector has {actual} entries but {expected} are required")]
    VectorTooShort { expected: usize, actual: usize },

    #[error("{what}: expected {expected} entries, got {actual}")]
    LengthMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },

    #[error("no stop criterion is enabled")]
    NoActiveStopCriterion,

    #[error("stop criterion '{name}' is enabled with non-positive limit {limit}")]
    NonPositiveLimit { name: String, limit: f64 },

    #[error("finite-difference stencil: {0}")]
    InvalidStencil(String),

    #[error("quantity '{quantity}' refers to unknown output '{output}'")]
    UnknownOutput { quantity: String, output: String },

    #[error("quantity '{0}': constraint tolerance must be non-negative")]
    NegativeTolerance(String),

    #[error("no objective quantity is defined")]
    NoObjective,

    #[error("solver option: {0}")]
    InvalidSolverOption(String),

    #[error("bounds retry: {0}")]
    Retry(String),

    #[error("driver has no problem configured")]
    NotConfigured,

    #[error("failed to parse problem configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to read problem configuration: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures raised while evaluating a single point.
#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("failed to write input '{name}': {message}")]
    WriteInput { name: String, message: String },

    #[error("geometry recomputation failed: {0}")]
    Recompute(String),

    #[error("failed to read output '{name}': {message}")]
    ReadOutput { name: String, message: String },

    #[error("output '{name}' has type {actual}, expected {expected}")]
    TypeMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("failed to build finite-element model: {0}")]
    FeModel(String),

    #[error("finite-element analysis failed: {message}")]
    FeAnalysis { message: String, not_converged: bool },

    #[error("{}", .0.join("\n"))]
    InvalidQuantities(Vec<String>),

    #[error("objective function evaluated to NaN")]
    NanObjective,

    #[error("point phase cannot move from {from} to {to}")]
    PhaseOrder { from: String, to: String },

    #[error("failed in the calculation of the function point: {0}")]
    Point(#[source] Box<EvaluationError>),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EvaluationError {
    /// Whether this failure, or any failure it wraps, is an FE solve that did not converge.
    pub fn is_fe_not_converged(&self) -> bool {
        match self {
            Self::FeAnalysis { not_converged, .. } => *not_converged,
            Self::Point(inner) => inner.is_fe_not_converged(),
            _ => false,
        }
    }
}
