use super::callback::{ChannelReporter, StatusEvent};
use super::driver::{CancelToken, Driver};
use super::point::HistoryView;
use super::termination::TerminationOutcome;
use crate::core::ConfigError;
use crate::simulation::ExternalEvaluator;
use crossbeam::channel::{Receiver, unbounded};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::thread::{self, JoinHandle};
use tracing::debug;

pub type SolveResult<E> = (Driver<E>, Result<TerminationOutcome, ConfigError>);

/// Runs a [`Driver`] on its own thread.
pub struct SolveManager;

impl SolveManager {
    /// Solves from `start` on a dedicated thread.
    pub fn spawn<E>(driver: Driver<E>, start: Vec<f64>) -> SolveHandle<E>
    where
        E: ExternalEvaluator + Send + 'static,
    {
        Self::spawn_with(driver, move |driver| driver.run(&start))
    }

    /// Solves from the parameters' start positions with FE retry, seeding
    /// the random start positions with `seed`.
    pub fn spawn_with_retry<E>(driver: Driver<E>, seed: u64) -> SolveHandle<E>
    where
        E: ExternalEvaluator + Send + 'static,
    {
        Self::spawn_with(driver, move |driver| {
            let mut rng = StdRng::seed_from_u64(seed);
            driver.run_with_retry(&mut rng)
        })
    }

    fn spawn_with<E, F>(mut driver: Driver<E>, solve: F) -> SolveHandle<E>
    where
        E: ExternalEvaluator + Send + 'static,
        F: FnOnce(&mut Driver<E>) -> Result<TerminationOutcome, ConfigError> + Send + 'static,
    {
        let (sender, events) = unbounded();
        driver.add_status_reporter(ChannelReporter::new(sender));
        let cancel = driver.cancel_token();
        let history = driver.history();

        let thread = thread::Builder::new()
            .name("shapeopt-solve".into())
            .spawn(move || {
                let result = solve(&mut driver);
                drop(driver.pop_status_reporter());
                debug!(ok = result.is_ok(), "solve thread finished");
                (driver, result)
            });

        SolveHandle {
            cancel,
            history,
            events,
            thread,
        }
    }
}

/// Observer side of a running solve.
pub struct SolveHandle<E> {
    cancel: CancelToken,
    history: HistoryView,
    events: Receiver<StatusEvent>,
    thread: std::io::Result<JoinHandle<SolveResult<E>>>,
}

impl<E> SolveHandle<E> {
    pub fn cancel(&self) {
        self.cancel.request();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Read-only view of the points recorded so far.
    pub fn history(&self) -> &HistoryView {
        &self.history
    }

    pub fn events(&self) -> &Receiver<StatusEvent> {
        &self.events
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Waits for the solve thread and hands back the driver with its result.
    pub fn join(self) -> thread::Result<SolveResult<E>> {
        match self.thread {
            Ok(handle) => handle.join(),
            Err(err) => Err(Box::new(err)),
        }
    }
}
