use super::stop::StopCriterionKind;
use crate::core::EvaluationError;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TerminationCode {
    NotStarted,
    Optimizing,
    Converged,
    Success,
    ForcedStop,
    Failed,
}

impl fmt::Display for TerminationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "Not Started",
            Self::Optimizing => "Optimizing",
            Self::Converged => "Converged",
            Self::Success => "Success",
            Self::ForcedStop => "Forced Stop",
            Self::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// The single normalized result of one solve attempt.
#[derive(Clone, Debug)]
pub struct TerminationOutcome {
    pub code: TerminationCode,
    pub message: String,
    pub cause: Option<Arc<EvaluationError>>,
    /// Extra context appended by the caller, e.g. a retry note.
    pub additional_message: Option<String>,
}

impl TerminationOutcome {
    pub fn new(code: TerminationCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
            additional_message: None,
        }
    }

    pub fn not_started() -> Self {
        Self::new(TerminationCode::NotStarted, "The optimization has not started.")
    }

    pub fn with_cause(mut self, cause: Arc<EvaluationError>) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn with_additional_message(mut self, message: impl Into<String>) -> Self {
        self.additional_message = Some(message.into());
        self
    }

    /// Whether the run ended without an error.
    pub fn is_finished_ok(&self) -> bool {
        matches!(self.code, TerminationCode::Converged | TerminationCode::Success)
    }

    pub fn complete_message(&self) -> String {
        let mut text = self.message.clone();
        if let Some(extra) = &self.additional_message {
            text.push('\n');
            text.push_str(extra);
        }
        if let Some(cause) = &self.cause {
            text.push_str("\nCause: ");
            text.push_str(&cause.to_string());
        }
        text
    }
}

impl fmt::Display for TerminationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.complete_message())
    }
}

/// The one error type that crosses the solver's callback boundary.
#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct TerminationSignal {
    pub code: TerminationCode,
    pub message: String,
    #[source]
    pub cause: Option<Arc<EvaluationError>>,
}

impl TerminationSignal {
    pub fn new(code: TerminationCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    pub fn failed(message: impl Into<String>, cause: EvaluationError) -> Self {
        Self {
            code: TerminationCode::Failed,
            message: message.into(),
            cause: Some(Arc::new(cause)),
        }
    }

    pub fn forced_stop() -> Self {
        Self::new(TerminationCode::ForcedStop, "User stopped the solver.")
    }

    pub fn converged(message: impl Into<String>) -> Self {
        Self::new(TerminationCode::Converged, message)
    }
}

impl From<TerminationSignal> for TerminationOutcome {
    fn from(signal: TerminationSignal) -> Self {
        Self {
            code: signal.code,
            message: signal.message,
            cause: signal.cause,
            additional_message: None,
        }
    }
}

/// Result vocabulary of the underlying solver library.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NativeResult {
    Failure,
    InvalidArgs,
    OutOfMemory,
    RoundoffLimited,
    ForcedStop,
    Success,
    StopvalReached,
    FtolReached,
    XtolReached,
    MaxevalReached,
    MaxtimeReached,
}

impl NativeResult {
    pub fn to_outcome(self) -> TerminationOutcome {
        use TerminationCode::*;
        let (code, message) = match self {
            Self::Failure => (Failed, "Unknown general solver failure."),
            Self::InvalidArgs => (Failed, "Solver failure - Invalid arguments."),
            Self::OutOfMemory => (Failed, "Solver failure - Out of memory."),
            Self::RoundoffLimited => (Failed, "Solver failure - Round off limited."),
            Self::ForcedStop => (ForcedStop, "User stopped the solver."),
            Self::Success => (Success, "Solver general success."),
            Self::StopvalReached => (Converged, StopCriterionKind::FunctionValue.message()),
            Self::FtolReached => (Converged, StopCriterionKind::FunctionAbsoluteChange.message()),
            Self::XtolReached => (Converged, StopCriterionKind::ParameterAbsoluteChange.message()),
            Self::MaxevalReached => (Converged, StopCriterionKind::Iterations.message()),
            Self::MaxtimeReached => (Converged, StopCriterionKind::Time.message()),
        };
        TerminationOutcome::new(code, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_results_map_onto_taxonomy() {
        let cases = [
            (NativeResult::Failure, TerminationCode::Failed),
            (NativeResult::InvalidArgs, TerminationCode::Failed),
            (NativeResult::OutOfMemory, TerminationCode::Failed),
            (NativeResult::RoundoffLimited, TerminationCode::Failed),
            (NativeResult::ForcedStop, TerminationCode::ForcedStop),
            (NativeResult::Success, TerminationCode::Success),
            (NativeResult::StopvalReached, TerminationCode::Converged),
            (NativeResult::FtolReached, TerminationCode::Converged),
            (NativeResult::XtolReached, TerminationCode::Converged),
            (NativeResult::MaxevalReached, TerminationCode::Converged),
            (NativeResult::MaxtimeReached, TerminationCode::Converged),
        ];
        for (native, code) in cases {
            assert_eq!(native.to_outcome().code, code, "{native:?}");
        }
        assert_eq!(
            NativeResult::MaxtimeReached.to_outcome().message,
            "Maximum total time for the optimization has been reached."
        );
    }

    #[test]
    fn signal_keeps_its_cause() {
        let signal = TerminationSignal::failed(
            "Failed in the calculation of the Function Point.",
            EvaluationError::NanObjective,
        );
        assert!(std::error::Error::source(&signal).is_some());
        let outcome = TerminationOutcome::from(signal).with_additional_message("Attempt 2 of 11.");
        assert_eq!(outcome.code, TerminationCode::Failed);
        let text = outcome.complete_message();
        assert!(text.contains("Attempt 2 of 11."));
        assert!(text.ends_with("objective function evaluated to NaN"));
    }
}
