//! # Crispcheck Core
//!
//! Decides, for a batch of URLs, whether each site embeds the Crisp chat
//! widget. Detection races a passive response observer against a fixed
//! sequence of bounded active probes; the orchestrator runs many detections
//! at once behind a fixed-size pool, streams progress, and honours
//! cooperative cancellation without losing any target's result.
//!
//! ## Architecture
//!
//! - [`model`]: targets, outcomes, traces, task states and progress snapshots
//! - [`config`]: the per-batch [`CheckConfiguration`] and client options
//! - [`error`]: the error enum and the stable diagnostic taxonomy
//! - [`automation`]: the shared automation resource and page session traits,
//!   plus the `reqwest` backend behind the `http-backend` feature and the
//!   headless Chromium backend behind `browser-backend`
//! - [`detection`]: markers, the [`SignalObserver`] and the [`DetectionEngine`]
//! - [`orchestration`]: the [`TaskOrchestrator`] and its batch event stream
//! - [`session`]: the transport-agnostic streaming protocol
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use crispcheck_core::{
//!     CheckConfiguration, TaskOrchestrator, Target,
//!     automation::http::{HttpAutomation, HttpAutomationOptions},
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! async fn check() -> crispcheck_core::Result<()> {
//!     let browser = Arc::new(HttpAutomation::launch(HttpAutomationOptions::default())?);
//!     let orchestrator = TaskOrchestrator::new(browser);
//!     let report = orchestrator
//!         .run_to_completion(
//!             vec![Target::new("https://example.com")],
//!             CheckConfiguration::default(),
//!             CancellationToken::new(),
//!         )
//!         .await?;
//!     println!("{:?}", report.summary());
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod automation;
pub mod config;
pub mod detection;
pub mod error;
pub mod model;
pub mod orchestration;
pub mod session;

pub use automation::{AutomationResource, ObservedResponse, PageSession, ResponseObserver};
pub use config::{CheckConfiguration, CheckOptions, MAX_CONCURRENCY_LIMIT};
pub use detection::{DetectionEngine, SignalObserver};
pub use error::{DiagnosticCategory, ProbeError, Result, TransportError};
pub use model::{
    BatchReport, BatchSummary, Classification, DetectionOutcome, ProgressEvent, Target,
    TaskState, Trace, TraceEvent, TraceLevel,
};
pub use orchestration::{BatchEvent, BatchStream, TaskOrchestrator};
pub use session::{ClientMessage, ResultSummary, ServerMessage, StreamingSession};
