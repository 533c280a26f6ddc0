use std::time::Duration;

use tracing::{debug, error};

use tgen_common::Scheduler;

/// A component with a start/stop lifecycle on the simulated clock.
pub trait Application {
    type Error: std::error::Error;

    fn start(&self) -> Result<(), Self::Error>;

    /// Stops the application. Stopping twice is a no-op.
    fn stop(&self);
}

/// Schedules `app` to start at `start_at` and, if given, to stop at `stop_at`.
/// Both times are delays from the scheduler's current time.
///
/// A start error raised from inside the event has no caller to return to, so it
/// is logged.
pub fn schedule_lifetime<S, A>(scheduler: &S, app: A, start_at: Duration, stop_at: Option<Duration>)
where
    S: Scheduler,
    A: Application + Clone + 'static,
{
    let starting = app.clone();
    scheduler.schedule(
        start_at,
        Box::new(move || {
            if let Err(e) = starting.start() {
                error!(error = %e, "Application failed to start");
            }
        }),
    );

    if let Some(stop_at) = stop_at {
        if stop_at < start_at {
            debug!(?start_at, ?stop_at, "Stop scheduled before start");
        }

        scheduler.schedule(stop_at, Box::new(move || app.stop()));
    }
}
