//! Step-logging task combinator.
//!
//! A [`Task`] is a lazy computation `Execution -> Outcome<A>`. Tasks are
//! sequenced with [`Task::and_then`], which stops at the first failure or
//! cancellation and concatenates the step logs of everything that ran.
//! Evaluation is synchronous on the calling thread; running independent
//! chains in parallel is the caller's business.

use crate::messages::Messages;
use serde::{Deserialize, Serialize};
use stockpile_installer::Installer;
use stockpile_remote::HttpClient;
use stockpile_schema::{Clock, Progress, SystemClock};
use std::fmt;
use std::sync::Arc;

/// Machine-readable failure attached to a [`Step`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub code: String,
    pub message: String,
}

impl StepError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl From<&stockpile_remote::RemoteError> for StepError {
    fn from(e: &stockpile_remote::RemoteError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

impl From<&crate::CoreError> for StepError {
    fn from(e: &crate::CoreError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

/// One audited unit of work: what was attempted and what came of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub description: String,
    #[serde(default)]
    pub resolution: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    #[serde(default)]
    pub failed: bool,
}

impl Step {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            resolution: String::new(),
            error: None,
            failed: false,
        }
    }

    #[must_use]
    pub fn resolved(mut self, resolution: impl Into<String>) -> Self {
        self.resolution = resolution.into();
        self
    }

    pub fn failure(description: impl Into<String>, error: StepError) -> Self {
        Self {
            description: description.into(),
            resolution: error.message.clone(),
            error: Some(error),
            failed: true,
        }
    }
}

/// Three-way result of evaluating a task, with its step log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<A> {
    Succeeded { value: A, steps: Vec<Step> },
    Failed { steps: Vec<Step> },
    Cancelled { steps: Vec<Step> },
}

/// Tag of an [`Outcome`] without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Succeeded,
    Failed,
    Cancelled,
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl<A> Outcome<A> {
    pub fn succeeded(value: A, steps: Vec<Step>) -> Self {
        Self::Succeeded { value, steps }
    }

    pub fn status(&self) -> OutcomeStatus {
        match self {
            Self::Succeeded { .. } => OutcomeStatus::Succeeded,
            Self::Failed { .. } => OutcomeStatus::Failed,
            Self::Cancelled { .. } => OutcomeStatus::Cancelled,
        }
    }

    pub fn is_succeeded(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    pub fn value(&self) -> Option<&A> {
        match self {
            Self::Succeeded { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn steps(&self) -> &[Step] {
        match self {
            Self::Succeeded { steps, .. } | Self::Failed { steps } | Self::Cancelled { steps } => {
                steps
            }
        }
    }

    pub fn into_steps(self) -> Vec<Step> {
        match self {
            Self::Succeeded { steps, .. } | Self::Failed { steps } | Self::Cancelled { steps } => {
                steps
            }
        }
    }

    /// The last failed step, which carries the user-facing explanation.
    pub fn last_failure(&self) -> Option<&Step> {
        self.steps().iter().rev().find(|s| s.failed)
    }

    pub fn map<B>(self, f: impl FnOnce(A) -> B) -> Outcome<B> {
        match self {
            Self::Succeeded { value, steps } => Outcome::Succeeded {
                value: f(value),
                steps,
            },
            Self::Failed { steps } => Outcome::Failed { steps },
            Self::Cancelled { steps } => Outcome::Cancelled { steps },
        }
    }

    /// Put `earlier` in front of this outcome's steps.
    #[must_use]
    pub fn after(mut self, mut earlier: Vec<Step>) -> Self {
        let steps = self.steps_mut();
        earlier.append(steps);
        *steps = earlier;
        self
    }

    /// Append `later` to this outcome's steps.
    #[must_use]
    pub fn then_steps(mut self, later: impl IntoIterator<Item = Step>) -> Self {
        self.steps_mut().extend(later);
        self
    }

    fn steps_mut(&mut self) -> &mut Vec<Step> {
        match self {
            Self::Succeeded { steps, .. } | Self::Failed { steps } | Self::Cancelled { steps } => {
                steps
            }
        }
    }
}

/// Collaborators available to every task in a chain.
#[derive(Clone)]
pub struct Services {
    pub http: Arc<dyn HttpClient>,
    pub installer: Arc<dyn Installer>,
    pub clock: Arc<dyn Clock>,
    pub messages: Arc<dyn Messages>,
}

impl Services {
    pub fn new(http: Arc<dyn HttpClient>, installer: Arc<dyn Installer>) -> Self {
        Self {
            http,
            installer,
            clock: Arc::new(SystemClock::new()),
            messages: Arc::new(crate::messages::EnglishMessages),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_messages(mut self, messages: Arc<dyn Messages>) -> Self {
        self.messages = messages;
        self
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("installer", &self.installer.name())
            .finish_non_exhaustive()
    }
}

/// Context a task chain is evaluated in.
///
/// Owned by whoever starts the chain and passed by reference through it.
/// Tasks poll [`is_cancelled`](Self::is_cancelled) wherever they would
/// otherwise block; nothing interrupts them.
pub struct Execution<'a> {
    should_cancel: &'a dyn Fn() -> bool,
    on_progress: &'a dyn Fn(&Progress),
    pub services: &'a Services,
}

impl<'a> Execution<'a> {
    pub fn new(
        should_cancel: &'a dyn Fn() -> bool,
        on_progress: &'a dyn Fn(&Progress),
        services: &'a Services,
    ) -> Self {
        Self {
            should_cancel,
            on_progress,
            services,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        (self.should_cancel)()
    }

    pub fn should_cancel(&self) -> &'a dyn Fn() -> bool {
        self.should_cancel
    }

    pub fn progress(&self, progress: &Progress) {
        (self.on_progress)(progress);
    }

    pub fn messages(&self) -> &dyn Messages {
        self.services.messages.as_ref()
    }
}

/// What a single-step body produced. See [`Task::step`].
#[derive(Debug)]
pub enum StepResult<A> {
    Done { value: A, resolution: String },
    Failed(StepError),
    Cancelled,
}

impl<A> StepResult<A> {
    pub fn done(value: A, resolution: impl Into<String>) -> Self {
        Self::Done {
            value,
            resolution: resolution.into(),
        }
    }

    /// Log this result as one step named `description`.
    pub fn into_outcome(
        self,
        description: impl Into<String>,
        messages: &dyn Messages,
    ) -> Outcome<A> {
        let description = description.into();
        match self {
            StepResult::Done { value, resolution } => Outcome::Succeeded {
                value,
                steps: vec![Step::new(description).resolved(resolution)],
            },
            StepResult::Failed(error) => Outcome::Failed {
                steps: vec![Step::failure(description, error)],
            },
            StepResult::Cancelled => Outcome::Cancelled {
                steps: vec![Step::new(description).resolved(messages.cancelled())],
            },
        }
    }
}

type Run<A> = dyn Fn(&Execution<'_>) -> Outcome<A> + Send + Sync;

/// A lazy, composable, cancellable unit of work.
///
/// Tasks are immutable values; cloning shares the underlying closure.
pub struct Task<A> {
    run: Arc<Run<A>>,
}

impl<A> Clone for Task<A> {
    fn clone(&self) -> Self {
        Self {
            run: Arc::clone(&self.run),
        }
    }
}

impl<A> fmt::Debug for Task<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Task")
    }
}

impl<A: 'static> Task<A> {
    pub fn new(run: impl Fn(&Execution<'_>) -> Outcome<A> + Send + Sync + 'static) -> Self {
        Self { run: Arc::new(run) }
    }

    /// A task made of exactly one logged step.
    pub fn step(
        description: impl Into<String>,
        body: impl Fn(&Execution<'_>) -> StepResult<A> + Send + Sync + 'static,
    ) -> Self {
        let description = description.into();
        Self::new(move |exec| body(exec).into_outcome(description.clone(), exec.messages()))
    }

    /// A task that immediately fails with one failed step.
    pub fn fail(
        description: impl Into<String>,
        resolution: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        let step = Step::failure(description, StepError::new(code, resolution));
        Self::new(move |_| Outcome::Failed {
            steps: vec![step.clone()],
        })
    }

    pub fn evaluate(&self, exec: &Execution<'_>) -> Outcome<A> {
        (self.run)(exec)
    }

    /// Transform the success value; failures and cancellations pass through.
    pub fn map<B: 'static>(self, f: impl Fn(A) -> B + Send + Sync + 'static) -> Task<B> {
        Task::new(move |exec| self.evaluate(exec).map(&f))
    }

    /// Sequence `f(value)` after this task in the same execution context.
    ///
    /// `f` is only invoked when this task succeeds. The combined step log
    /// is this task's steps followed by the continuation's.
    pub fn and_then<B: 'static>(self, f: impl Fn(A) -> Task<B> + Send + Sync + 'static) -> Task<B> {
        Task::new(move |exec| match self.evaluate(exec) {
            Outcome::Succeeded { value, steps } => f(value).evaluate(exec).after(steps),
            Outcome::Failed { steps } => Outcome::Failed { steps },
            Outcome::Cancelled { steps } => Outcome::Cancelled { steps },
        })
    }

    /// Always run `cleanup` after this task, whatever its outcome.
    ///
    /// The outcome tag is this task's; `cleanup`'s steps are appended.
    #[must_use]
    pub fn finally(self, cleanup: Task<()>) -> Self {
        Task::new(move |exec| {
            let outcome = self.evaluate(exec);
            let after = cleanup.evaluate(exec).into_steps();
            outcome.then_steps(after)
        })
    }
}

impl<A: Clone + Send + Sync + 'static> Task<A> {
    /// A task that succeeds with `value` and logs nothing.
    pub fn succeed(value: A) -> Self {
        Self::new(move |_| Outcome::Succeeded {
            value: value.clone(),
            steps: Vec::new(),
        })
    }
}
