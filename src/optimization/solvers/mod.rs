mod argmin_backend;
pub mod traits;

pub use argmin_backend::ArgminBackend;
pub use traits::{ForceStop, SolverBackend, SolverCallback, SolverRun, StopThresholds};

use crate::optimization::problem::{Algorithm, SolverOptions};

/// Builds the backend for `options` and a one-line reason for the choice.
pub fn select_backend<'a>(
    options: &SolverOptions,
    dimension: usize,
    has_constraints: bool,
) -> (Box<dyn SolverBackend<'a> + 'a>, String) {
    let reason = match (options.algorithm, has_constraints) {
        (Algorithm::NelderMead, false) => format!("{} params → Nelder-Mead (derivative free)", dimension),
        (Algorithm::NelderMead, true) => format!(
            "{} params, constrained → Nelder-Mead with quadratic penalty {:.1e}",
            dimension, options.penalty
        ),
        (Algorithm::Lbfgs, false) => format!(
            "{} params → L-BFGS (m={}, finite-difference gradients)",
            dimension, options.lbfgs_memory
        ),
        (Algorithm::Lbfgs, true) => format!(
            "{} params, constrained → L-BFGS (m={}) with quadratic penalty {:.1e}",
            dimension, options.lbfgs_memory, options.penalty
        ),
    };
    (Box::new(ArgminBackend::new(dimension, *options)), reason)
}
