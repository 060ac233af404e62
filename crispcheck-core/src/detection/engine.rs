use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::FutureExt;
use tokio::{runtime::Handle, time::timeout};
use tokio_util::sync::CancellationToken;

use crate::{
    automation::{AutomationResource, PageSession, ResponseObserver},
    config::CheckConfiguration,
    detection::{
        markers::{CHAT_AFFORDANCE_SELECTOR, WIDGET_PREDICATE, text_has_marker},
        signal::SignalObserver,
    },
    error::{DiagnosticCategory, TransportError, panic_message},
    model::{Classification, DetectionOutcome, Target, TraceRecorder},
};

/// Fixed bound on releasing a page.
pub const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

const PREDICATE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Where a run of the stage sequence ended up, before the passive signal is
/// folded in.
#[derive(Debug)]
enum Verdict {
    Detected(&'static str),
    NotDetected,
    Failed {
        category: DiagnosticCategory,
        detail: String,
    },
    Cancelled,
}

impl Verdict {
    fn failed(category: DiagnosticCategory, detail: impl Into<String>) -> Self {
        Self::Failed {
            category,
            detail: detail.into(),
        }
    }
}

/// Classifies a single target.
///
/// Stages run strictly in order: open page, navigate, early signal check,
/// best-effort interaction, signal check, script predicate poll, idle wait,
/// final active checks, final signal check. Every stage is bounded by the
/// configuration, cancellation is honoured between stages, and the page is
/// always released. A signal seen at any point, including during teardown,
/// makes the outcome `Detected` whatever else went wrong.
#[derive(Clone, Debug)]
pub struct DetectionEngine {
    config: CheckConfiguration,
}

impl DetectionEngine {
    pub fn new(config: CheckConfiguration) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CheckConfiguration {
        &self.config
    }

    /// Run one check. Never fails: every error ends up in the outcome.
    pub async fn evaluate(
        &self,
        target: &Target,
        resource: &dyn AutomationResource,
        cancel: &CancellationToken,
    ) -> DetectionOutcome {
        let trace = TraceRecorder::new();
        let observer = Arc::new(SignalObserver::new(trace.clone()));

        trace.info(format!(
            "Starting check for {target} with PageTO:{}ms, JSTO:{}ms, IdleTO:{}ms",
            self.config.page_load_timeout_ms,
            self.config.active_probe_timeout_ms,
            self.config.idle_wait_timeout_ms
        ));
        tracing::debug!(target: "probe::engine", url = %target, "Check started");

        let verdict = AssertUnwindSafe(self.run(target, resource, &observer, &trace, cancel))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                let message = panic_message(payload);
                trace.critical(format!("Check aborted by an unexpected failure: {message}"));
                Verdict::failed(DiagnosticCategory::TaskExecutionFailure, message)
            });

        finish(target, verdict, &observer, &trace)
    }

    async fn run(
        &self,
        target: &Target,
        resource: &dyn AutomationResource,
        observer: &Arc<SignalObserver>,
        trace: &TraceRecorder,
        cancel: &CancellationToken,
    ) -> Verdict {
        if cancel.is_cancelled() {
            trace.info("Cancelled before opening a page.");
            return Verdict::Cancelled;
        }
        if !resource.is_connected() {
            trace.error("Automation resource is not connected.");
            return Verdict::failed(DiagnosticCategory::ResourceUnavailable, "resource unavailable");
        }

        let page_observer: Arc<dyn ResponseObserver> = observer.clone();
        let page = match timeout(self.config.page_load_timeout(), resource.open_page(page_observer)).await {
            Ok(Ok(page)) => page,
            Ok(Err(err)) => {
                trace.error(format!("Could not open a page: {err}"));
                let category = match err {
                    TransportError::Disconnected => DiagnosticCategory::ResourceUnavailable,
                    _ => DiagnosticCategory::TaskExecutionFailure,
                };
                return Verdict::failed(category, err.to_string());
            }
            Err(_) => {
                trace.error("Timed out opening a page.");
                return Verdict::failed(DiagnosticCategory::ResourceUnavailable, "timed out opening a page");
            }
        };

        let mut lease = PageLease::new(page, trace.clone());
        let verdict = match lease.page() {
            Some(page) => self.probe(target, page, observer, trace, cancel).await,
            None => Verdict::failed(DiagnosticCategory::TaskExecutionFailure, "page already released"),
        };
        lease.release().await;
        verdict
    }

    async fn probe(
        &self,
        target: &Target,
        page: &mut dyn PageSession,
        observer: &SignalObserver,
        trace: &TraceRecorder,
        cancel: &CancellationToken,
    ) -> Verdict {
        let config = &self.config;

        if cancel.is_cancelled() {
            return cancelled(trace, "navigation");
        }
        trace.info(format!("Navigating to {target}"));
        match timeout(
            config.page_load_timeout(),
            page.navigate(target.as_str(), config.page_load_timeout()),
        )
        .await
        {
            Ok(Ok(())) => trace.info("DOMContentLoaded reached."),
            Ok(Err(err)) => {
                let category = err.category();
                trace.error(format!("{category}: {err}"));
                return Verdict::failed(category, err.to_string());
            }
            Err(_) => {
                let detail = format!("navigation exceeded {}ms", config.page_load_timeout_ms);
                trace.error(format!("Timeout: {detail}"));
                return Verdict::failed(DiagnosticCategory::NavigationTimeout, detail);
            }
        }

        if observer.is_set() {
            return detected(trace, "network interception (early)");
        }

        if cancel.is_cancelled() {
            return cancelled(trace, "interaction");
        }
        trace.debug("Trying to click chat button.");
        match timeout(config.interaction_timeout(), interact(page, config.interaction_timeout())).await {
            Ok(Ok(true)) => {
                trace.info(format!(
                    "Chat button clicked. Waiting {}ms.",
                    config.post_interaction_wait_ms
                ));
                tokio::time::sleep(config.post_interaction_wait()).await;
            }
            Ok(Ok(false)) => trace.info("No obvious chat button found."),
            Ok(Err(TransportError::Timeout)) | Err(_) => trace.warning(format!(
                "{}: no click within {}ms. Continuing...",
                DiagnosticCategory::InteractionTimeout,
                config.interaction_timeout_ms
            )),
            Ok(Err(err)) => trace.warning(format!("Error clicking chat button: {err}. Continuing...")),
        }

        if observer.is_set() {
            return detected(trace, "network interception (post-click)");
        }

        if cancel.is_cancelled() {
            return cancelled(trace, "script probe");
        }
        trace.debug("Waiting for Crisp JS objects.");
        match timeout(config.active_probe_timeout(), poll_widget_predicate(page)).await {
            Ok(Ok(())) => return detected(trace, "JavaScript evaluation"),
            Ok(Err(TransportError::Disconnected)) => return disconnected(trace),
            Ok(Err(err)) => trace.warning(format!("Script probe failed: {err}")),
            Err(_) => trace.info(format!(
                "Crisp JS objects not found (timeout: {}ms).",
                config.active_probe_timeout_ms
            )),
        }

        if cancel.is_cancelled() {
            return cancelled(trace, "idle wait");
        }
        trace.debug("Waiting for network idle (fallback).");
        match timeout(
            config.idle_wait_timeout(),
            page.wait_for_network_idle(config.idle_wait_timeout()),
        )
        .await
        {
            Ok(Ok(())) => trace.info("Network idle state reached."),
            Ok(Err(TransportError::Disconnected)) => return disconnected(trace),
            Ok(Err(err)) => trace.info(format!("Network idle wait ended early: {err}")),
            Err(_) => trace.info(format!(
                "Network not idle within {}ms. Continuing with final checks.",
                config.idle_wait_timeout_ms
            )),
        }

        if cancel.is_cancelled() {
            return cancelled(trace, "final checks");
        }
        trace.debug("Checking JS objects (fallback).");
        match timeout(config.active_probe_timeout(), page.evaluate(&WIDGET_PREDICATE)).await {
            Ok(Ok(true)) => return detected(trace, "JS evaluation (fallback)"),
            Ok(Ok(false)) => {}
            Ok(Err(err)) => return transport_failure(trace, err),
            Err(_) => trace.warning(format!(
                "JS evaluation (fallback) exceeded {}ms.",
                config.active_probe_timeout_ms
            )),
        }

        trace.debug("Checking HTML content.");
        match timeout(config.active_probe_timeout(), page.content()).await {
            Ok(Ok(markup)) if text_has_marker(&markup) => return detected(trace, "HTML content"),
            Ok(Ok(_)) => {}
            Ok(Err(err)) => return transport_failure(trace, err),
            Err(_) => trace.warning(format!(
                "Reading page content exceeded {}ms.",
                config.active_probe_timeout_ms
            )),
        }

        if observer.is_set() {
            return detected(trace, "network interception (final check)");
        }

        trace.info("Crisp NOT found after all checks.");
        Verdict::NotDetected
    }
}

/// Click the first chat affordance, if any. `Ok(false)` when none exists.
async fn interact(page: &mut dyn PageSession, bound: Duration) -> Result<bool, TransportError> {
    if page.count_matching(CHAT_AFFORDANCE_SELECTOR).await? == 0 {
        return Ok(false);
    }
    page.click_first(CHAT_AFFORDANCE_SELECTOR, bound).await?;
    Ok(true)
}

/// Resolves once the widget predicate holds. Unbounded; callers wrap it.
async fn poll_widget_predicate(page: &mut dyn PageSession) -> Result<(), TransportError> {
    loop {
        if page.evaluate(&WIDGET_PREDICATE).await? {
            return Ok(());
        }
        tokio::time::sleep(PREDICATE_POLL_INTERVAL).await;
    }
}

fn detected(trace: &TraceRecorder, via: &'static str) -> Verdict {
    trace.info(format!("Crisp found via {via}."));
    Verdict::Detected(via)
}

fn cancelled(trace: &TraceRecorder, stage: &str) -> Verdict {
    trace.info(format!("Cancelled before {stage}."));
    Verdict::Cancelled
}

fn disconnected(trace: &TraceRecorder) -> Verdict {
    trace.error("Automation resource disconnected mid-check.");
    Verdict::failed(DiagnosticCategory::ResourceUnavailable, "resource disconnected")
}

fn transport_failure(trace: &TraceRecorder, err: TransportError) -> Verdict {
    let category = err.category();
    trace.error(format!("{category}: {err}"));
    Verdict::failed(category, err.to_string())
}

/// Folds the passive signal into the verdict. Runs after teardown, so a
/// signal raised while the page was closing still counts.
fn finish(
    target: &Target,
    verdict: Verdict,
    observer: &SignalObserver,
    trace: &TraceRecorder,
) -> DetectionOutcome {
    let signal = observer.is_set();
    let (classification, diagnostic, detail) = match verdict {
        Verdict::Detected(via) => {
            tracing::debug!(target: "probe::engine", url = %target, via, "Widget detected");
            (Classification::Detected, None, None)
        }
        Verdict::NotDetected if signal => {
            trace.info("Crisp found via network interception (late).");
            (Classification::Detected, None, None)
        }
        Verdict::NotDetected => (Classification::NotDetected, None, None),
        Verdict::Failed { category, detail } if signal => {
            trace.info(format!("Crisp signal already observed; {category} does not change the result."));
            (Classification::Detected, Some(category), Some(detail))
        }
        Verdict::Failed { category, detail } => (Classification::Error, Some(category), Some(detail)),
        Verdict::Cancelled if signal => (
            Classification::Detected,
            Some(DiagnosticCategory::CancelledInFlight),
            Some("cancelled after detection".to_string()),
        ),
        Verdict::Cancelled => (
            Classification::Cancelled,
            Some(DiagnosticCategory::CancelledInFlight),
            Some("cancelled during check".to_string()),
        ),
    };

    trace.info(format!("Finished check for {target}. Status: {classification}"));
    tracing::info!(
        target: "probe::engine",
        url = %target,
        classification = %classification,
        diagnostic = ?diagnostic,
        "Check finished"
    );

    DetectionOutcome {
        target: target.clone(),
        classification,
        diagnostic,
        detail,
        trace: trace.snapshot(),
    }
}

/// Owns an open page until it is released. Dropping an unreleased lease
/// (the check future was dropped or unwound) closes the page in the
/// background.
struct PageLease {
    page: Option<Box<dyn PageSession>>,
    trace: TraceRecorder,
}

impl PageLease {
    fn new(page: Box<dyn PageSession>, trace: TraceRecorder) -> Self {
        Self {
            page: Some(page),
            trace,
        }
    }

    fn page(&mut self) -> Option<&mut (dyn PageSession + 'static)> {
        self.page.as_deref_mut()
    }

    async fn release(&mut self) {
        let Some(page) = self.page.take() else {
            return;
        };
        match timeout(TEARDOWN_TIMEOUT, page.close()).await {
            Ok(Ok(())) => self.trace.debug("Page closed."),
            Ok(Err(err)) => self.trace.error(format!("Error closing page: {err}")),
            Err(_) => self.trace.error(format!(
                "Closing page exceeded {}ms.",
                TEARDOWN_TIMEOUT.as_millis()
            )),
        }
    }
}

impl Drop for PageLease {
    fn drop(&mut self) {
        let Some(page) = self.page.take() else {
            return;
        };
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(close_detached(page));
            }
            Err(_) => {
                tracing::warn!(target: "probe::engine", "Page dropped outside a runtime; not closed");
            }
        }
    }
}

async fn close_detached(page: Box<dyn PageSession>) {
    match timeout(TEARDOWN_TIMEOUT, page.close()).await {
        Ok(Ok(())) => tracing::debug!(target: "probe::engine", "Detached page closed"),
        Ok(Err(err)) => tracing::warn!(target: "probe::engine", error = %err, "Detached page close failed"),
        Err(_) => tracing::warn!(target: "probe::engine", "Detached page close timed out"),
    }
}
