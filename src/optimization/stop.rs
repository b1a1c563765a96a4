use super::point::SolutionPoint;
use super::problem::StopOptions;
use crate::core::ParameterLayout;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StopCriterionKind {
    Time,
    Iterations,
    FunctionValue,
    FunctionAbsoluteChange,
    FunctionRelativeChange,
    ParameterAbsoluteChange,
    ParameterRelativeChange,
}

impl StopCriterionKind {
    /// Limits on elapsed resources trigger at or above the limit, the rest at or below.
    pub fn reached_at_or_above(self) -> bool {
        matches!(self, Self::Time | Self::Iterations)
    }

    /// Needs a previous point to be meaningful.
    pub fn is_delta(self) -> bool {
        matches!(
            self,
            Self::FunctionAbsoluteChange
                | Self::FunctionRelativeChange
                | Self::ParameterAbsoluteChange
                | Self::ParameterRelativeChange
        )
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::Time => "Maximum total time for the optimization has been reached.",
            Self::Iterations => "Maximum total number of evaluations for the optimization has been reached.",
            Self::FunctionValue => "Stop value of the objective function has been reached.",
            Self::FunctionAbsoluteChange => {
                "Minimum absolute delta of the objective function value has been reached."
            }
            Self::FunctionRelativeChange => {
                "Minimum relative delta of the objective function value has been reached."
            }
            Self::ParameterAbsoluteChange => "Minimum absolute delta of the input parameter value has been reached.",
            Self::ParameterRelativeChange => "Minimum relative delta of the input parameter value has been reached.",
        }
    }
}

impl fmt::Display for StopCriterionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Time => "Time",
            Self::Iterations => "Iterations",
            Self::FunctionValue => "Function Value",
            Self::FunctionAbsoluteChange => "Function Absolute Change",
            Self::FunctionRelativeChange => "Function Relative Change",
            Self::ParameterAbsoluteChange => "Parameter Absolute Change",
            Self::ParameterRelativeChange => "Parameter Relative Change",
        };
        f.write_str(name)
    }
}

/// One stop condition as evaluated at one point.
#[derive(Clone, Debug, PartialEq)]
pub struct StopCriterion {
    pub kind: StopCriterionKind,
    /// Criterion name, or the input variable for parameter criteria.
    pub name: String,
    pub active: bool,
    pub limit: f64,
    pub previous: Option<f64>,
    pub current: f64,
    pub criteria_value: f64,
}

impl StopCriterion {
    /// NaN criteria values never reach a limit.
    pub fn limit_reached(&self) -> bool {
        if self.kind.reached_at_or_above() {
            self.criteria_value >= self.limit
        } else {
            self.criteria_value <= self.limit
        }
    }

    pub fn triggered(&self) -> bool {
        self.active && self.limit_reached()
    }

    pub fn message(&self) -> String {
        match self.kind {
            StopCriterionKind::ParameterAbsoluteChange | StopCriterionKind::ParameterRelativeChange => {
                format!("{} Parameter: {}", self.kind.message(), self.name)
            }
            kind => kind.message().to_string(),
        }
    }
}

fn relative_change(current: f64, previous: f64) -> f64 {
    ((current - previous) / previous).abs()
}

/// Evaluates every stop criterion for the point about to take history slot `index`.
///
/// Delta criteria stay inactive until `index > 1`.
pub fn evaluate_stop_criteria(
    options: &StopOptions,
    layout: &ParameterLayout,
    index: usize,
    elapsed: Duration,
    current: &SolutionPoint,
    previous: Option<&SolutionPoint>,
) -> Vec<StopCriterion> {
    let has_delta = index > 1 && previous.is_some();
    let mut criteria = Vec::with_capacity(5 + 2 * layout.dimension());

    let scalar = |kind: StopCriterionKind, enabled: bool, limit: f64, previous: Option<f64>, current: f64, value: f64| {
        StopCriterion {
            kind,
            name: kind.to_string(),
            active: enabled && (!kind.is_delta() || has_delta),
            limit,
            previous,
            current,
            criteria_value: value,
        }
    };

    let idx = index as f64;
    criteria.push(scalar(
        StopCriterionKind::Iterations,
        options.max_iterations.enabled,
        options.max_iterations.limit as f64,
        None,
        idx,
        idx,
    ));
    let secs = elapsed.as_secs_f64();
    criteria.push(scalar(
        StopCriterionKind::Time,
        options.max_time.enabled,
        options.max_time.limit,
        None,
        secs,
        secs,
    ));

    let f_cur = current.objective_value();
    let f_prev = previous.map(SolutionPoint::objective_value);
    criteria.push(scalar(
        StopCriterionKind::FunctionValue,
        options.stop_value.enabled,
        options.stop_value.limit,
        None,
        f_cur,
        f_cur,
    ));
    criteria.push(scalar(
        StopCriterionKind::FunctionAbsoluteChange,
        options.function_absolute_change.enabled,
        options.function_absolute_change.limit,
        f_prev,
        f_cur,
        f_prev.map_or(f64::NAN, |p| (f_cur - p).abs()),
    ));
    criteria.push(scalar(
        StopCriterionKind::FunctionRelativeChange,
        options.function_relative_change.enabled,
        options.function_relative_change.limit,
        f_prev,
        f_cur,
        f_prev.map_or(f64::NAN, |p| relative_change(f_cur, p)),
    ));

    for (i, &x) in current.input().iter().enumerate().take(layout.dimension()) {
        let name = layout.variable_name(i).unwrap_or_else(|| format!("#{}", i));
        let x_prev = previous.and_then(|p| p.input().get(i).copied());
        let abs_limit = options
            .parameter_absolute_change
            .limit
            .get(i)
            .copied()
            .unwrap_or(f64::NAN);

        criteria.push(StopCriterion {
            kind: StopCriterionKind::ParameterAbsoluteChange,
            name: name.clone(),
            active: options.parameter_absolute_change.enabled && has_delta,
            limit: abs_limit,
            previous: x_prev,
            current: x,
            criteria_value: x_prev.map_or(f64::NAN, |p| (x - p).abs()),
        });
        criteria.push(StopCriterion {
            kind: StopCriterionKind::ParameterRelativeChange,
            name,
            active: options.parameter_relative_change.enabled && has_delta,
            limit: options.parameter_relative_change.limit,
            previous: x_prev,
            current: x,
            criteria_value: x_prev.map_or(f64::NAN, |p| relative_change(x, p)),
        });
    }

    criteria
}

/// First criterion that is both active and reached.
pub fn first_triggered(criteria: &[StopCriterion]) -> Option<&StopCriterion> {
    criteria.iter().find(|c| c.triggered())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{NamedValues, ParameterDef};
    use crate::optimization::point::{Phase, PointKind};
    use crate::optimization::problem::Toggle;

    fn layout() -> ParameterLayout {
        ParameterLayout::new(vec![
            ParameterDef::scalar("a", -10.0, 10.0, 0.0),
            ParameterDef::scalar("b", -10.0, 10.0, 0.0),
        ])
        .unwrap()
    }

    fn point(input: &[f64], objective: f64) -> SolutionPoint {
        let mut p = SolutionPoint::new(input, NamedValues::new(), PointKind::Main);
        p.advance(Phase::GeometryUpdating).unwrap();
        p.advance(Phase::OutputsInitializing).unwrap();
        p.advance(Phase::ObjectiveCalculating).unwrap();
        p.set_objective(objective).unwrap();
        p
    }

    fn find(criteria: &[StopCriterion], kind: StopCriterionKind) -> &StopCriterion {
        criteria.iter().find(|c| c.kind == kind).unwrap()
    }

    #[test]
    fn iterations_reached_at_limit() {
        let mut options = StopOptions::default();
        options.max_iterations = Toggle::on(10);
        let layout = layout();
        let p = point(&[0.0, 0.0], 1.0);
        for (index, expected) in [(9, false), (10, true), (11, true)] {
            let criteria = evaluate_stop_criteria(&options, &layout, index, Duration::ZERO, &p, Some(&p));
            let iterations = find(&criteria, StopCriterionKind::Iterations);
            assert_eq!(iterations.limit_reached(), expected, "index {index}");
        }
    }

    #[test]
    fn parameter_change_inactive_without_history() {
        let mut options = StopOptions::none();
        options.parameter_absolute_change = Toggle::on(vec![100.0, 100.0]);
        let layout = layout();
        let prev = point(&[0.0, 0.0], 1.0);
        let cur = point(&[0.0, 0.0], 1.0);

        for index in [0, 1] {
            let criteria = evaluate_stop_criteria(&options, &layout, index, Duration::ZERO, &cur, Some(&prev));
            assert!(
                criteria
                    .iter()
                    .filter(|c| c.kind == StopCriterionKind::ParameterAbsoluteChange)
                    .all(|c| !c.active)
            );
            assert!(first_triggered(&criteria).is_none());
        }

        let criteria = evaluate_stop_criteria(&options, &layout, 2, Duration::ZERO, &cur, Some(&prev));
        let hit = first_triggered(&criteria).unwrap();
        assert_eq!(hit.kind, StopCriterionKind::ParameterAbsoluteChange);
        assert_eq!(
            hit.message(),
            "Minimum absolute delta of the input parameter value has been reached. Parameter: a"
        );
    }

    #[test]
    fn function_deltas_compare_against_previous() {
        let mut options = StopOptions::none();
        options.function_absolute_change = Toggle::on(0.5);
        options.function_relative_change = Toggle::on(0.05);
        let layout = layout();
        let prev = point(&[0.0, 0.0], 10.0);
        let cur = point(&[1.0, 0.0], 9.6);

        let criteria = evaluate_stop_criteria(&options, &layout, 5, Duration::ZERO, &cur, Some(&prev));
        let abs = find(&criteria, StopCriterionKind::FunctionAbsoluteChange);
        assert!(abs.triggered());
        let rel = find(&criteria, StopCriterionKind::FunctionRelativeChange);
        assert!((rel.criteria_value - 0.04).abs() < 1e-12);
        assert!(rel.triggered());
    }

    #[test]
    fn stop_value_and_time() {
        let mut options = StopOptions::none();
        options.stop_value = Toggle::on(1e-3);
        options.max_time = Toggle::on(2.0);
        let layout = layout();
        let cur = point(&[0.0, 0.0], 1e-4);

        let criteria = evaluate_stop_criteria(&options, &layout, 0, Duration::from_secs(1), &cur, None);
        let hit = first_triggered(&criteria).unwrap();
        assert_eq!(hit.kind, StopCriterionKind::FunctionValue);
        assert!(!find(&criteria, StopCriterionKind::Time).limit_reached());

        let criteria = evaluate_stop_criteria(&options, &layout, 0, Duration::from_secs(2), &cur, None);
        assert_eq!(first_triggered(&criteria).unwrap().kind, StopCriterionKind::Time);
    }

    #[test]
    fn relative_change_from_zero_never_triggers() {
        let mut options = StopOptions::none();
        options.parameter_relative_change = Toggle::on(0.1);
        let layout = layout();
        let prev = point(&[0.0, 1.0], 1.0);
        let cur = point(&[0.0, 5.0], 1.0);
        let criteria = evaluate_stop_criteria(&options, &layout, 3, Duration::ZERO, &cur, Some(&prev));
        assert!(first_triggered(&criteria).is_none());
    }
}
