pub mod encoding;
pub mod error;
pub mod types;

pub use encoding::{NamedValues, ParameterLayout};
pub use error::{ConfigError, EvaluationError};
pub use types::{InputValue, ParameterDef, ParameterKind, Point3, StartPosition};
