use crate::task::{Outcome, Step, StepResult, Task};
use stockpile_schema::{Progress, ProgressValue};
use std::thread;
use std::time::Duration;
use tracing::warn;

/// Sleep granularity while pausing, so cancellation is noticed quickly.
const PAUSE_SLICE: Duration = Duration::from_millis(100);

/// Which attempt a retried task is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptInfo {
    /// Zero-based attempt index.
    pub attempt: u32,
    /// Highest index that will be tried.
    pub last: u32,
}

impl AttemptInfo {
    pub fn is_last(&self) -> bool {
        self.attempt >= self.last
    }
}

/// Run `attempt` for indices `0..=retries` until it succeeds or is
/// cancelled.
///
/// After each failed attempt except the last, `pause` runs; cancellation
/// is checked before every pause. The step log holds every attempt and
/// every pause in the order they ran.
pub fn retrying<A: 'static>(
    retries: u32,
    pause: Task<()>,
    attempt: impl Fn(AttemptInfo) -> Task<A> + Send + Sync + 'static,
) -> Task<A> {
    Task::new(move |exec| {
        let mut steps = Vec::new();
        for index in 0..=retries {
            let info = AttemptInfo {
                attempt: index,
                last: retries,
            };
            match attempt(info).evaluate(exec) {
                done @ (Outcome::Succeeded { .. } | Outcome::Cancelled { .. }) => {
                    return done.after(steps);
                }
                Outcome::Failed { steps: failed } => {
                    steps.extend(failed);
                }
            }
            if info.is_last() {
                break;
            }
            if exec.is_cancelled() {
                return Outcome::Cancelled { steps };
            }
            warn!("attempt {} of {} failed, retrying", index + 1, retries + 1);
            match pause.evaluate(exec) {
                Outcome::Succeeded { steps: paused, .. } => steps.extend(paused),
                Outcome::Cancelled { steps: paused } => {
                    steps.extend(paused);
                    return Outcome::Cancelled { steps };
                }
                Outcome::Failed { steps: paused } => {
                    steps.extend(paused);
                    return Outcome::Failed { steps };
                }
            }
        }
        Outcome::Failed { steps }
    })
}

/// A cancellable fixed delay that reports its own progress in
/// milliseconds.
pub fn pause(delay: Duration) -> Task<()> {
    Task::new(move |exec| {
        let description = exec.messages().pause(delay);
        let status = exec.messages().status_waiting();
        let total = delay.as_millis() as u64;
        let mut waited = Duration::ZERO;
        loop {
            exec.progress(&Progress::new(
                None,
                ProgressValue::definite(waited.as_millis() as u64, 0, total),
                status.clone(),
            ));
            if waited >= delay {
                break;
            }
            if exec.is_cancelled() {
                return Task::<()>::step(description.clone(), |_| StepResult::Cancelled)
                    .evaluate(exec);
            }
            let slice = PAUSE_SLICE.min(delay - waited);
            thread::sleep(slice);
            waited += slice;
        }
        Outcome::Succeeded {
            value: (),
            steps: vec![Step::new(description).resolved(exec.messages().done())],
        }
    })
}
