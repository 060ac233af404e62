//! Bounded-concurrency batch execution.
//!
//! A batch admits targets into a fixed-size pool strictly in input order.
//! Each admitted target runs the [`DetectionEngine`] in its own task and keeps
//! its pool slot until the consumer has taken its progress event, so a caller
//! that cancels right after seeing the K-th completion leaves every later
//! target un-started.

use std::{fmt, panic::AssertUnwindSafe, pin::Pin, sync::Arc, time::Duration};

use futures::{FutureExt, Stream, StreamExt};
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot},
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    automation::AutomationResource,
    config::CheckConfiguration,
    detection::DetectionEngine,
    error::{ProbeError, Result, panic_message},
    model::{BatchReport, DetectionOutcome, ProgressEvent, Target, TaskState},
};

/// Item of a batch stream: one `Progress` per target in completion order,
/// then exactly one `Completed`.
#[derive(Clone, Debug)]
pub enum BatchEvent {
    Progress {
        /// Position of the target in the submitted list.
        index: usize,
        state: TaskState,
        outcome: DetectionOutcome,
        progress: ProgressEvent,
    },
    Completed(BatchReport),
}

pub type BatchStream = Pin<Box<dyn Stream<Item = BatchEvent> + Send>>;

/// Message from a finished task to the stream.
struct Finished {
    index: usize,
    outcome: DetectionOutcome,
    /// Released once the consumer has taken the event; the task holds its
    /// pool slot until then.
    consumed: Option<oneshot::Sender<()>>,
}

#[derive(Clone)]
pub struct TaskOrchestrator {
    resource: Arc<dyn AutomationResource>,
}

impl fmt::Debug for TaskOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskOrchestrator")
            .field("resource_connected", &self.resource.is_connected())
            .finish()
    }
}

impl TaskOrchestrator {
    /// The resource is borrowed for every batch; creating and destroying it is
    /// the caller's job.
    pub fn new(resource: Arc<dyn AutomationResource>) -> Self {
        Self { resource }
    }

    pub fn resource(&self) -> Arc<dyn AutomationResource> {
        Arc::clone(&self.resource)
    }

    /// Validate `config` and return the lazy event stream for one batch.
    ///
    /// Nothing starts until the stream is first polled. Dropping the stream
    /// cancels whatever is still outstanding.
    pub fn run(
        &self,
        targets: Vec<Target>,
        config: CheckConfiguration,
        cancel: CancellationToken,
    ) -> Result<BatchStream> {
        config.validate()?;

        let batch_id = Uuid::now_v7();
        let resource = Arc::clone(&self.resource);
        let engine = Arc::new(DetectionEngine::new(config));
        let total = targets.len();

        tracing::info!(
            target: "probe::orchestrator",
            %batch_id,
            total,
            concurrency = config.concurrency_limit,
            "Batch accepted"
        );

        let stream = async_stream::stream! {
            let batch_cancel = cancel.child_token();
            let _cancel_on_drop = batch_cancel.clone().drop_guard();

            if !resource.is_connected() {
                tracing::warn!(
                    target: "probe::orchestrator",
                    %batch_id,
                    "Automation resource unavailable; every target will fail fast"
                );
            }

            let (finished_tx, mut finished_rx) = mpsc::unbounded_channel::<Finished>();
            let admission = tokio::spawn(admit(
                targets.clone(),
                config,
                Arc::clone(&resource),
                engine,
                batch_cancel.clone(),
                finished_tx,
            ));

            let mut outcomes: Vec<Option<DetectionOutcome>> = vec![None; total];
            let mut completed = 0usize;

            while let Some(Finished { index, outcome, consumed }) = finished_rx.recv().await {
                if outcomes.get(index).is_none_or(Option::is_some) {
                    tracing::warn!(target: "probe::orchestrator", %batch_id, index, "Dropping duplicate or unknown completion");
                    continue;
                }
                completed += 1;
                outcomes[index] = Some(outcome.clone());
                yield progress_event(index, outcome, completed, total);
                if let Some(consumed) = consumed {
                    let _ = consumed.send(());
                }
            }

            if let Err(err) = admission.await {
                tracing::error!(target: "probe::orchestrator", %batch_id, error = %err, "Admission loop failed");
            }

            // Anything still missing never reported back; it still gets an outcome.
            for (index, target) in targets.iter().enumerate() {
                if outcomes[index].is_some() {
                    continue;
                }
                completed += 1;
                let outcome = DetectionOutcome::task_failure(target.clone(), "task ended without reporting");
                outcomes[index] = Some(outcome.clone());
                yield progress_event(index, outcome, completed, total);
            }

            let cancelled = cancel.is_cancelled();
            let outcomes: Vec<DetectionOutcome> = outcomes.into_iter().flatten().collect();
            let report = BatchReport::new(batch_id, cancelled, outcomes);
            tracing::info!(
                target: "probe::orchestrator",
                %batch_id,
                cancelled,
                summary = %report.summary(),
                "Batch finished"
            );
            yield BatchEvent::Completed(report);
        };

        Ok(Box::pin(stream))
    }

    /// Drive a batch to the end and return only its report.
    pub async fn run_to_completion(
        &self,
        targets: Vec<Target>,
        config: CheckConfiguration,
        cancel: CancellationToken,
    ) -> Result<BatchReport> {
        let mut events = self.run(targets, config, cancel)?;
        while let Some(event) = events.next().await {
            if let BatchEvent::Completed(report) = event {
                return Ok(report);
            }
        }
        Err(ProbeError::TaskExecution(
            "batch ended without a completion event".into(),
        ))
    }
}

fn progress_event(index: usize, outcome: DetectionOutcome, completed: usize, total: usize) -> BatchEvent {
    let state = TaskState::terminal_for(&outcome);
    let progress = ProgressEvent {
        completed_count: completed,
        total_count: total,
        last_target: outcome.target.clone(),
        last_classification: outcome.classification,
    };
    tracing::info!(
        target: "probe::orchestrator",
        index,
        url = %outcome.target,
        classification = %outcome.classification,
        completed,
        total,
        "Target finished"
    );
    BatchEvent::Progress {
        index,
        state,
        outcome,
        progress,
    }
}

/// How often a queued target rechecks the resource while waiting for a slot.
const RESOURCE_POLL_INTERVAL: Duration = Duration::from_millis(50);

enum Admission {
    Permit(OwnedSemaphorePermit),
    Cancelled,
    Unavailable,
}

/// Hands pool slots to targets in input order. Once cancellation is seen,
/// every target not yet admitted is reported as cancelled before start; once
/// the resource is lost, as resource unavailable. Neither drain takes a slot.
async fn admit(
    targets: Vec<Target>,
    config: CheckConfiguration,
    resource: Arc<dyn AutomationResource>,
    engine: Arc<DetectionEngine>,
    cancel: CancellationToken,
    finished: mpsc::UnboundedSender<Finished>,
) {
    // Never more slots than targets; validation already capped the limit.
    let slots = config.concurrency_limit.min(targets.len()).max(1);
    let pool = Arc::new(Semaphore::new(slots));
    let mut pending = targets.into_iter().enumerate();

    while let Some((index, target)) = pending.next() {
        let permit = match wait_for_slot(&pool, resource.as_ref(), &cancel).await {
            Admission::Permit(permit) => permit,
            refused => {
                let unavailable = matches!(refused, Admission::Unavailable);
                tracing::debug!(
                    target: "probe::orchestrator",
                    first_skipped = index,
                    unavailable,
                    "Skipping remaining targets"
                );
                for (index, target) in std::iter::once((index, target)).chain(pending.by_ref()) {
                    let outcome = if unavailable {
                        DetectionOutcome::resource_unavailable(target)
                    } else {
                        DetectionOutcome::cancelled_before_start(target)
                    };
                    let _ = finished.send(Finished {
                        index,
                        outcome,
                        consumed: None,
                    });
                }
                break;
            }
        };

        tokio::spawn(run_task(
            index,
            target,
            permit,
            Arc::clone(&resource),
            Arc::clone(&engine),
            cancel.clone(),
            finished.clone(),
        ));
    }
}

/// Wait for a pool slot, giving up as soon as the batch is cancelled or the
/// resource disconnects. Cancellation wins over a lost resource.
async fn wait_for_slot(
    pool: &Arc<Semaphore>,
    resource: &dyn AutomationResource,
    cancel: &CancellationToken,
) -> Admission {
    if cancel.is_cancelled() {
        return Admission::Cancelled;
    }
    if !resource.is_connected() {
        return Admission::Unavailable;
    }

    let acquire = Arc::clone(pool).acquire_owned();
    tokio::pin!(acquire);
    let mut health = tokio::time::interval(RESOURCE_POLL_INTERVAL);
    health.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Admission::Cancelled,
            _ = health.tick() => {
                if !resource.is_connected() {
                    return Admission::Unavailable;
                }
            }
            permit = &mut acquire => {
                return match permit {
                    Ok(permit) if cancel.is_cancelled() => {
                        drop(permit);
                        Admission::Cancelled
                    }
                    Ok(permit) if !resource.is_connected() => {
                        drop(permit);
                        Admission::Unavailable
                    }
                    Ok(permit) => Admission::Permit(permit),
                    Err(_) => Admission::Cancelled,
                };
            }
        }
    }
}

async fn run_task(
    index: usize,
    target: Target,
    permit: OwnedSemaphorePermit,
    resource: Arc<dyn AutomationResource>,
    engine: Arc<DetectionEngine>,
    cancel: CancellationToken,
    finished: mpsc::UnboundedSender<Finished>,
) {
    let outcome = if cancel.is_cancelled() {
        DetectionOutcome::cancelled_before_start(target)
    } else if !resource.is_connected() {
        DetectionOutcome::resource_unavailable(target)
    } else {
        tracing::debug!(target: "probe::orchestrator", index, url = %target, "Target running");
        AssertUnwindSafe(engine.evaluate(&target, resource.as_ref(), &cancel))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                let message = panic_message(payload);
                tracing::error!(target: "probe::orchestrator", index, url = %target, panic = %message, "Task panicked");
                DetectionOutcome::task_failure(target.clone(), message)
            })
    };

    let (consumed_tx, consumed_rx) = oneshot::channel();
    let delivered = finished
        .send(Finished {
            index,
            outcome,
            consumed: Some(consumed_tx),
        })
        .is_ok();
    if delivered {
        let _ = consumed_rx.await;
    }
    drop(permit);
}
