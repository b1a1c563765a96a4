mod common;

use common::{FragileSolver, Paraboloid, config, iterations, paraboloid_driver, problem, with_x_floor};
use shapeopt::{
    Algorithm, ConfigError, Driver, EvaluationAdapter, EvaluationError, OptimizationProblem, PointKind, SolverOptions,
    StopCriterionKind, TerminationCode,
};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::sync::atomic::Ordering;

fn lbfgs() -> SolverOptions {
    SolverOptions {
        algorithm: Algorithm::Lbfgs,
        ..SolverOptions::default()
    }
}

#[test]
fn nelder_mead_descends_to_the_minimum() {
    let mut driver = paraboloid_driver(problem(iterations(200), SolverOptions::default()));
    let outcome = driver.run(&[5.0, 5.0]).unwrap();
    assert!(outcome.is_finished_ok(), "{}", outcome.complete_message());

    let history = driver.history().snapshot();
    assert!(!history.is_empty());
    for (i, point) in history.iter().enumerate() {
        assert_eq!(point.index(), Some(i));
        assert!(point.is_ended());
        assert_eq!(point.kind(), PointKind::Main);
    }

    let best = driver.history().best().unwrap();
    assert!(best.objective_value() < 1e-2, "best objective {}", best.objective_value());
    assert!(best.objective_value() < history[0].objective_value());
    let first_half_best = history[..history.len() / 2]
        .iter()
        .map(|p| p.objective_value())
        .fold(f64::INFINITY, f64::min);
    let second_half_best = history[history.len() / 2..]
        .iter()
        .map(|p| p.objective_value())
        .fold(f64::INFINITY, f64::min);
    assert!(second_half_best <= first_half_best);
    assert_eq!(driver.outcome().code, outcome.code);
}

#[test]
fn iteration_limit_converges_on_the_limit_point() {
    let mut driver = paraboloid_driver(problem(iterations(10), SolverOptions::default()));
    let outcome = driver.run(&[5.0, 5.0]).unwrap();

    assert_eq!(outcome.code, TerminationCode::Converged);
    assert_eq!(outcome.message, StopCriterionKind::Iterations.message());
    assert_eq!(driver.history().len(), 11);
    let last = driver.history().last().unwrap();
    assert_eq!(last.index(), Some(10));
    assert!(last.stop_criteria().iter().any(|c| c.kind == StopCriterionKind::Iterations && c.triggered()));
}

#[test]
fn cancellation_stops_at_the_next_callback() {
    let mut driver = paraboloid_driver(problem(iterations(200), SolverOptions::default()));
    let token = driver.cancel_token();
    let recomputes = driver.evaluator().geometry().counter();
    driver.evaluator_mut().geometry_mut().cancel_after = Some((3, token));

    let outcome = driver.run(&[5.0, 5.0]).unwrap();
    assert_eq!(outcome.code, TerminationCode::ForcedStop);
    assert_eq!(driver.history().len(), 3);
    assert_eq!(recomputes.load(Ordering::SeqCst), 3);
}

#[test]
fn nan_objective_fails_the_run() {
    let geometry = Paraboloid {
        nan_output: true,
        ..Paraboloid::default()
    };
    let mut driver = Driver::new(EvaluationAdapter::new(geometry))
        .with_problem(problem(iterations(50), SolverOptions::default()));
    let outcome = driver.run(&[5.0, 5.0]).unwrap();

    assert_eq!(outcome.code, TerminationCode::Failed);
    assert_eq!(outcome.message, "Failed in the calculation of the Function Point.");
    let cause = outcome.cause.as_deref().unwrap();
    assert!(matches!(cause, EvaluationError::InvalidQuantities(msgs) if msgs[0].starts_with("f => ")));
    assert!(driver.history().is_empty());
}

#[test]
fn lbfgs_records_gradients_with_stencils() {
    let mut driver = paraboloid_driver(problem(iterations(30), lbfgs()));
    let recomputes = driver.evaluator().geometry().counter();
    let outcome = driver.run(&[5.0, 5.0]).unwrap();
    assert_ne!(outcome.code, TerminationCode::NotStarted);

    let history = driver.history().snapshot();
    assert!(history.len() > 1);
    for point in &history {
        assert_eq!(point.kind(), PointKind::Main);
        assert_eq!(point.gradient().map(<[f64]>::len), Some(2));
        // Forward two-point stencil: the center is reused, one stencil point per dimension.
        assert_eq!(point.partials().len(), 2);
    }
    assert_eq!(recomputes.load(Ordering::SeqCst), 3 * history.len());
    assert!(driver.history().best().unwrap().objective_value() < history[0].objective_value());
}

#[test]
fn repeated_inputs_are_not_reevaluated() {
    let mut driver = paraboloid_driver(problem(iterations(40), SolverOptions::default()));
    let recomputes = driver.evaluator().geometry().counter();
    driver.run(&[5.0, 5.0]).unwrap();

    let history = driver.history().snapshot();
    assert_eq!(recomputes.load(Ordering::SeqCst), history.len());
    for (i, a) in history.iter().enumerate() {
        assert!(history[i + 1..].iter().all(|b| b.input() != a.input()));
    }
}

#[test]
fn configuration_errors_surface_before_solving() {
    let setup = config(shapeopt::StopOptions::none(), SolverOptions::default());
    let err = OptimizationProblem::from_config(setup).unwrap_err();
    assert!(matches!(err, ConfigError::NoActiveStopCriterion));

    let mut driver = Driver::new(EvaluationAdapter::new(Paraboloid::default()));
    assert!(matches!(driver.run(&[0.0, 0.0]), Err(ConfigError::NotConfigured)));

    driver.configure(problem(iterations(5), SolverOptions::default()));
    assert!(matches!(driver.run(&[0.0]), Err(ConfigError::LengthMismatch { .. })));
    assert!(matches!(driver.run(&[0.0, 20.0]), Err(ConfigError::StartOutOfBounds { .. })));
    assert_eq!(driver.outcome().code, TerminationCode::NotStarted);
}

#[test]
fn native_constraints_are_rejected_without_folding() {
    let solver = SolverOptions {
        use_lagrangian: false,
        ..SolverOptions::default()
    };
    let problem = OptimizationProblem::from_config(with_x_floor(config(iterations(50), solver), 0.01)).unwrap();
    let mut driver = paraboloid_driver(problem);
    let outcome = driver.run(&[5.0, 5.0]).unwrap();

    assert_eq!(outcome.code, TerminationCode::Failed);
    assert_eq!(outcome.message, "Solver failure - Invalid arguments.");
    assert!(outcome.complete_message().contains("Could not register constraint x_floor."));
    assert!(driver.history().is_empty());
}

#[test]
fn folded_constraint_keeps_the_search_feasible() {
    let setup = with_x_floor(config(iterations(400), SolverOptions::default()), 0.05);
    let problem = OptimizationProblem::from_config(setup).unwrap();
    let mut driver = paraboloid_driver(problem);
    driver.run(&[5.0, 5.0]).unwrap();

    let last = driver.history().last().unwrap();
    let floor = last.constraint("x_floor").unwrap();
    assert!(floor.value() > 0.9 && floor.value() < 1.3, "x = {}", floor.value());
    assert!(last.input()[1].abs() < 0.3, "y = {}", last.input()[1]);
}

#[test]
fn non_converged_fe_solve_retries_in_a_narrower_box() {
    let adapter = EvaluationAdapter::new(Paraboloid::default()).with_fe_solver(FragileSolver { limit: 2.0 });
    let mut driver = Driver::new(adapter).with_problem(problem(iterations(60), SolverOptions::default()));
    let outcome = driver.run_with_retry(&mut StdRng::seed_from_u64(7)).unwrap();

    let note = outcome.additional_message.as_deref().unwrap_or_default();
    assert!(note.contains("Retrying with more restrictive bounds"), "{}", outcome.complete_message());
    let history = driver.history().snapshot();
    assert!(!history.is_empty());
    assert!(history.iter().all(|p| p.input()[0] <= 5.0 && p.input()[1] <= 5.0));
    assert!(history.iter().all(|p| p.raw_outputs().fe.is_some()));
}

#[test]
fn plain_run_reports_non_convergence_without_retry() {
    let adapter = EvaluationAdapter::new(Paraboloid::default()).with_fe_solver(FragileSolver { limit: 2.0 });
    let mut driver = Driver::new(adapter).with_problem(problem(iterations(20), SolverOptions::default()));
    let outcome = driver.run(&[5.0, 5.0]).unwrap();

    assert_eq!(outcome.code, TerminationCode::Failed);
    assert_eq!(outcome.message, "Failed in the calculation of the Function Point.");
    assert!(outcome.cause.as_ref().is_some_and(|c| c.is_fe_not_converged()));
    assert!(outcome.additional_message.is_none());
    // The start point itself failed, so nothing was recorded.
    assert!(driver.history().is_empty());
}

#[test]
fn cancel_before_run_stops_without_evaluating() {
    let mut driver = paraboloid_driver(problem(iterations(50), SolverOptions::default()));
    let recomputes = driver.evaluator().geometry().counter();
    driver.request_cancel();

    let outcome = driver.run(&[5.0, 5.0]).unwrap();
    assert_eq!(outcome.code, TerminationCode::ForcedStop);
    assert!(driver.history().is_empty());
    assert_eq!(recomputes.load(Ordering::SeqCst), 0);
}

#[test]
fn cancelled_driver_runs_again() {
    let mut driver = paraboloid_driver(problem(iterations(10), SolverOptions::default()));
    let token = driver.cancel_token();
    let recomputes = driver.evaluator().geometry().counter();
    driver.evaluator_mut().geometry_mut().cancel_after = Some((5, token));
    assert_eq!(driver.run(&[5.0, 5.0]).unwrap().code, TerminationCode::ForcedStop);
    assert_eq!(driver.history().len(), 5);

    driver.evaluator_mut().geometry_mut().cancel_after = None;
    let outcome = driver.run(&[5.0, 5.0]).unwrap();
    assert_eq!(outcome.code, TerminationCode::Converged);
    assert_eq!(driver.history().len(), 11);
    assert_eq!(recomputes.load(Ordering::SeqCst), 16);
}

#[test]
fn first_point_failure_narrows_to_the_far_half() {
    // Only the start point at x = 5 fails.
    let adapter = EvaluationAdapter::new(Paraboloid::default()).with_fe_solver(FragileSolver { limit: 4.9 });
    let mut driver = Driver::new(adapter).with_problem(problem(iterations(30), SolverOptions::default()));
    let outcome = driver.run_with_retry(&mut StdRng::seed_from_u64(1)).unwrap();

    let note = outcome.additional_message.as_deref().unwrap_or_default();
    assert!(note.contains("FE analysis did not converge for point #1."), "{}", outcome.complete_message());
    let first = driver.history().get(0).unwrap();
    // Start 5 in [-10, 10] keeps [-10, 5] and restarts from its middle.
    assert_eq!(first.input(), &[-2.5, -2.5]);
}
