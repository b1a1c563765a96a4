mod core;
mod optimization;
mod simulation;

#[cfg(feature = "python")]
mod python;

pub use self::core::*;
pub use optimization::*;
pub use simulation::*;
