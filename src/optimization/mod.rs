pub mod callback;
pub mod constraint;
pub mod driver;
pub mod gradient;
pub mod manager;
pub mod objective;
pub mod point;
pub mod problem;
pub mod quantity;
pub mod solvers;
pub mod stop;
pub mod termination;

pub use callback::{ChannelReporter, LogReporter, StatusEvent, StatusReporter};
pub use constraint::{ConstraintRegistration, ConstraintResult};
pub use driver::{CancelToken, Driver, RetryBounds, narrow_bounds};
pub use gradient::{PartialStencil, StencilSample, Stencil};
pub use manager::{SolveHandle, SolveManager, SolveResult};
pub use point::{HistoryView, HistoryWriter, Phase, PointKind, SolutionPoint, Timings};
pub use problem::{
    Algorithm, GradientOptions, OptimizationProblem, ProblemConfig, SolverOptions, StopOptions, SumPolicy, Toggle,
};
pub use quantity::{
    AggregateKind, Aggregation, ConstraintRelation, ConstraintSpec, ObjectiveKind, ProblemQuantity, QuantityRole,
    QuantitySource, QuantityValue,
};
pub use solvers::{ArgminBackend, SolverBackend, select_backend};
pub use stop::{StopCriterion, StopCriterionKind};
pub use termination::{NativeResult, TerminationCode, TerminationOutcome, TerminationSignal};
