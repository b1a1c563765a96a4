use super::point::SolutionPoint;
use super::termination::TerminationOutcome;
use crossbeam::channel::Sender;
use tracing::{debug, info, warn};

/// Progress notifications emitted by the solve loop.
#[derive(Clone, Debug)]
pub enum StatusEvent {
    Phase(String),
    PointCompleted { index: usize, objective: f64 },
    Finished(TerminationOutcome),
}

/// Receives solve progress. Calls come from the solving thread.
pub trait StatusReporter {
    fn phase(&mut self, description: &str);

    fn point_completed(&mut self, point: &SolutionPoint);

    fn finished(&mut self, outcome: &TerminationOutcome);
}

#[derive(Debug, Clone)]
pub struct IterationResult {
    pub params: Vec<f64>,
    pub cost: f64,
}

/// Logs progress through `tracing` and, when verbose, prints a summary at the end.
pub struct LogReporter {
    verbose: bool,
    param_names: Vec<String>,
    history: Vec<IterationResult>,
}

impl LogReporter {
    pub fn new(verbose: bool, param_names: Vec<String>) -> Self {
        Self {
            verbose,
            param_names,
            history: Vec::new(),
        }
    }

    pub fn history(&self) -> &[IterationResult] {
        &self.history
    }

    pub fn print_summary(&self, outcome: &TerminationOutcome) {
        println!("\n{}", "=".repeat(80));
        println!("OPTIMIZATION SUMMARY");
        println!("{}", "=".repeat(80));

        println!(
            "\nStatus: {}",
            if outcome.is_finished_ok() {
                format!("✓ {}", outcome.code)
            } else {
                format!("✗ {}", outcome.code)
            }
        );
        println!("Stop Reason: {}", outcome.complete_message());
        println!("Total Evaluations: {}", self.history.len());

        let best = self
            .history
            .iter()
            .filter(|r| !r.cost.is_nan())
            .min_by(|a, b| a.cost.total_cmp(&b.cost));
        if let Some(best) = best {
            println!("\nBest Objective: {:.6e}", best.cost);
            println!("\nBest Parameters:");
            for (name, &value) in self.param_names.iter().zip(best.params.iter()) {
                println!("  {} = {:.6e}", name, value);
            }
        }

        println!("\nEvaluation History:");
        println!("{:<8} {:<20}", "Eval", "Objective");
        println!("{}", "-".repeat(30));
        for (i, result) in self.history.iter().enumerate() {
            println!("{:<8} {:<20.6e}", i, result.cost);
        }

        println!("\n{}\n", "=".repeat(80));
    }
}

impl StatusReporter for LogReporter {
    fn phase(&mut self, description: &str) {
        debug!(phase = description, "status");
    }

    fn point_completed(&mut self, point: &SolutionPoint) {
        let index = point.index().unwrap_or(self.history.len());
        info!(index, objective = point.objective_value(), "point evaluated");
        for result in point.constraints().values() {
            debug!(constraint = result.quantity(), report = %result.report(), "constraint");
        }
        self.history.push(IterationResult {
            params: point.input().to_vec(),
            cost: point.objective_value(),
        });
    }

    fn finished(&mut self, outcome: &TerminationOutcome) {
        if outcome.is_finished_ok() {
            info!(code = %outcome.code, message = %outcome.message, "optimization finished");
        } else {
            warn!(code = %outcome.code, message = %outcome.complete_message(), "optimization finished");
        }
        if self.verbose {
            self.print_summary(outcome);
        }
    }
}

/// Forwards progress over a channel. A disconnected receiver is ignored.
pub struct ChannelReporter {
    sender: Sender<StatusEvent>,
}

impl ChannelReporter {
    pub fn new(sender: Sender<StatusEvent>) -> Self {
        Self { sender }
    }

    fn send(&self, event: StatusEvent) {
        let _ = self.sender.send(event);
    }
}

impl StatusReporter for ChannelReporter {
    fn phase(&mut self, description: &str) {
        self.send(StatusEvent::Phase(description.to_string()));
    }

    fn point_completed(&mut self, point: &SolutionPoint) {
        self.send(StatusEvent::PointCompleted {
            index: point.index().unwrap_or_default(),
            objective: point.objective_value(),
        });
    }

    fn finished(&mut self, outcome: &TerminationOutcome) {
        self.send(StatusEvent::Finished(outcome.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NamedValues;
    use crate::optimization::point::PointKind;
    use crate::optimization::termination::TerminationCode;
    use crossbeam::channel::unbounded;

    #[test]
    fn channel_reporter_forwards_events() {
        let (tx, rx) = unbounded();
        let mut reporter = ChannelReporter::new(tx);
        reporter.phase("Updating geometry");
        reporter.point_completed(&SolutionPoint::new(&[1.0], NamedValues::new(), PointKind::Main));
        reporter.finished(&TerminationOutcome::new(TerminationCode::Success, "done"));

        assert!(matches!(rx.recv().unwrap(), StatusEvent::Phase(p) if p == "Updating geometry"));
        assert!(matches!(
            rx.recv().unwrap(),
            StatusEvent::PointCompleted { index: 0, objective } if objective.is_nan()
        ));
        assert!(matches!(rx.recv().unwrap(), StatusEvent::Finished(o) if o.code == TerminationCode::Success));
    }

    #[test]
    fn channel_reporter_survives_dropped_receiver() {
        let (tx, rx) = unbounded();
        drop(rx);
        let mut reporter = ChannelReporter::new(tx);
        reporter.phase("Ended");
    }

    #[test]
    fn log_reporter_keeps_history() {
        let mut reporter = LogReporter::new(false, vec!["a".into()]);
        reporter.point_completed(&SolutionPoint::new(&[2.0], NamedValues::new(), PointKind::Main));
        assert_eq!(reporter.history().len(), 1);
        assert_eq!(reporter.history()[0].params, vec![2.0]);
    }
}
