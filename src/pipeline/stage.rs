//! Long-running consumer loop shared by the triage and extraction stages.
//!
//! Two delays, never conflated: an empty queue waits `idle_delay` for a
//! push, while a failed or panicking iteration sleeps `error_backoff`.
//! The in-flight job of a failed iteration is dropped.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::LoopTiming;
use crate::error::PipelineError;

/// Stop request shared between a spawned task and whoever stops it.
///
/// Loops check `is_requested` between iterations and can `wait` on it while
/// sleeping, so a long tick or backoff does not hold up shutdown.
#[derive(Debug, Default)]
pub struct Shutdown {
    requested: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn request(&self) {
        self.requested.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Resolve once `request` has been called.
    pub async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_requested() {
            return;
        }
        notified.await;
    }
}

/// What one iteration did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing was queued within the idle delay.
    Idle,
    /// One job was taken and finished.
    Handled,
}

/// A consumer stage driven by `spawn_stage`.
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    /// Stage name for logging.
    fn name(&self) -> &'static str;

    /// Take at most one job, waiting up to `idle` for one, and finish it.
    async fn step(&self, idle: Duration) -> Result<StepOutcome, PipelineError>;
}

/// Run one iteration, converting a panic into `PipelineError::Panicked`.
pub async fn run_step<S>(stage: &S, idle: Duration) -> Result<StepOutcome, PipelineError>
where
    S: Stage + ?Sized,
{
    match AssertUnwindSafe(stage.step(idle)).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(PipelineError::Panicked {
            stage: stage.name().to_string(),
            message: panic_message(payload.as_ref()),
        }),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Spawn the stage loop. Returns a `JoinHandle` and shutdown handle.
pub fn spawn_stage<S: Stage>(stage: Arc<S>, timing: LoopTiming) -> (JoinHandle<()>, Arc<Shutdown>) {
    let shutdown = Arc::new(Shutdown::default());
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        let name = stage.name();
        info!(
            stage = name,
            idle_ms = timing.idle_delay.as_millis() as u64,
            backoff_ms = timing.error_backoff.as_millis() as u64,
            "Stage started"
        );

        loop {
            if shutdown.is_requested() {
                info!(stage = name, "Stage shutting down");
                return;
            }

            if let Err(e) = run_step(stage.as_ref(), timing.idle_delay).await {
                error!(
                    stage = name,
                    error = %e,
                    backoff_ms = timing.error_backoff.as_millis() as u64,
                    "Iteration failed, job dropped; backing off"
                );
                tokio::select! {
                    _ = tokio::time::sleep(timing.error_backoff) => {}
                    _ = shutdown.wait() => {}
                }
            }
        }
    });

    (handle, shutdown_flag)
}
