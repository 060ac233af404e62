//! Streaming check sessions.
//!
//! A session is one client conversation: a URL submission, any number of
//! progress notifications, an optional cancellation request, and a single
//! terminal completion. Messages are plain serde types tagged by `type`, so
//! any framed transport (a WebSocket, a pipe of JSON lines) can carry them.

use std::{fmt, sync::Arc};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    automation::AutomationResource,
    config::{CheckConfiguration, CheckOptions},
    error::{ProbeError, Result},
    model::{BatchReport, Classification, DetectionOutcome, Target},
    orchestration::{BatchEvent, TaskOrchestrator},
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    UrlSubmission {
        #[serde(default)]
        urls: Vec<String>,
        #[serde(default)]
        options: CheckOptions,
    },
    CancelChecks,
    /// Any other message type. Ignored.
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Flat per-target result as carried by terminal messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub url: String,
    #[serde(with = "wire_status")]
    pub status: Classification,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&DetectionOutcome> for ResultSummary {
    fn from(outcome: &DetectionOutcome) -> Self {
        let error = outcome.diagnostic_text();
        Self {
            url: outcome.target.to_string(),
            status: outcome.classification,
            error: (!error.is_empty()).then_some(error),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    LogEntry {
        url: String,
        message: String,
    },
    ProgressUpdate {
        progress: u8,
        current_url_processed: String,
        #[serde(with = "wire_status")]
        status: Classification,
    },
    /// Acknowledges a `cancel_checks` request.
    Cancelled,
    Completion {
        complete: bool,
        cancelled: bool,
        results: Vec<ResultSummary>,
        progress: u8,
    },
    ErrorMessage {
        error: String,
        complete: bool,
        results: Vec<ResultSummary>,
    },
}

impl ServerMessage {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    fn error(error: impl Into<String>) -> Self {
        Self::ErrorMessage {
            error: error.into(),
            complete: true,
            results: Vec::new(),
        }
    }

    fn completion(report: &BatchReport) -> Self {
        Self::Completion {
            complete: true,
            cancelled: report.cancelled,
            results: report.outcomes.iter().map(ResultSummary::from).collect(),
            progress: report.progress,
        }
    }
}

/// Runs client conversations against a shared automation resource.
#[derive(Clone)]
pub struct StreamingSession {
    orchestrator: TaskOrchestrator,
    defaults: CheckConfiguration,
}

impl fmt::Debug for StreamingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingSession")
            .field("orchestrator", &self.orchestrator)
            .field("defaults", &self.defaults)
            .finish()
    }
}

impl StreamingSession {
    /// `defaults` fill in whatever a submission's options leave out.
    pub fn new(resource: Arc<dyn AutomationResource>, defaults: CheckConfiguration) -> Self {
        Self {
            orchestrator: TaskOrchestrator::new(resource),
            defaults,
        }
    }

    /// Serve one conversation until its terminal message has been sent.
    ///
    /// Returns the batch report when a batch ran, `None` when the session
    /// ended before one started. Fails only when `outbound` is closed; the
    /// batch is cancelled in that case.
    pub async fn drive(
        &self,
        mut inbound: mpsc::Receiver<ClientMessage>,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Result<Option<BatchReport>> {
        let (urls, options) = match inbound.recv().await {
            Some(ClientMessage::UrlSubmission { urls, options }) => (urls, options),
            Some(other) => {
                tracing::warn!(target: "probe::session", message = ?other, "Unexpected initial message");
                send(&outbound, ServerMessage::error("Invalid initial message. Expected URL submission.")).await?;
                return Ok(None);
            }
            None => {
                tracing::debug!(target: "probe::session", "Client left before submitting");
                return Ok(None);
            }
        };

        let targets: Vec<Target> = urls
            .iter()
            .map(|url| url.trim())
            .filter(|url| !url.is_empty())
            .map(Target::new)
            .collect();

        let config = match options.resolve(self.defaults) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(target: "probe::session", error = %err, "Rejected submission options");
                send(&outbound, ServerMessage::error(format!("{}: {err}", err.category()))).await?;
                return Ok(None);
            }
        };

        tracing::info!(
            target: "probe::session",
            targets = targets.len(),
            concurrency = config.concurrency_limit,
            page_load_timeout_ms = config.page_load_timeout_ms,
            active_probe_timeout_ms = config.active_probe_timeout_ms,
            idle_wait_timeout_ms = config.idle_wait_timeout_ms,
            "Submission accepted"
        );

        let cancel = CancellationToken::new();
        let mut events = self.orchestrator.run(targets, config, cancel.clone())?;
        let mut inbound_open = true;

        loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(BatchEvent::Progress { outcome, progress, .. }) => {
                        let url = outcome.target.to_string();
                        for line in outcome.trace.lines() {
                            send(&outbound, ServerMessage::LogEntry { url: url.clone(), message: line }).await?;
                        }
                        send(
                            &outbound,
                            ServerMessage::ProgressUpdate {
                                progress: progress.percent(),
                                current_url_processed: url,
                                status: outcome.classification,
                            },
                        )
                        .await?;
                    }
                    Some(BatchEvent::Completed(report)) => {
                        send(&outbound, ServerMessage::completion(&report)).await?;
                        tracing::info!(
                            target: "probe::session",
                            batch_id = %report.batch_id,
                            cancelled = report.cancelled,
                            "Session complete"
                        );
                        return Ok(Some(report));
                    }
                    None => {
                        return Err(ProbeError::Protocol("batch ended without a completion event".into()));
                    }
                },
                message = inbound.recv(), if inbound_open => match message {
                    Some(ClientMessage::CancelChecks) => {
                        if !cancel.is_cancelled() {
                            tracing::info!(target: "probe::session", "Cancellation requested by client");
                            cancel.cancel();
                            send(&outbound, ServerMessage::Cancelled).await?;
                        }
                    }
                    Some(other) => {
                        tracing::debug!(target: "probe::session", message = ?other, "Ignoring message during batch");
                    }
                    None => {
                        tracing::info!(target: "probe::session", "Client input closed; cancelling batch");
                        inbound_open = false;
                        cancel.cancel();
                    }
                },
            }
        }
    }
}

/// Clients see the human-readable labels ("Uses Crisp", ...) rather than
/// the enum variant names.
mod wire_status {
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    use crate::model::Classification;

    pub fn serialize<S: Serializer>(status: &Classification, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(status.label())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Classification, D::Error> {
        let label = String::deserialize(deserializer)?;
        Classification::from_label(&label)
            .ok_or_else(|| D::Error::custom(format!("unknown status label `{label}`")))
    }
}

async fn send(outbound: &mpsc::Sender<ServerMessage>, message: ServerMessage) -> Result<()> {
    outbound
        .send(message)
        .await
        .map_err(|_| ProbeError::Protocol("client disconnected".into()))
}
