//! Contracts between the detection engine and whatever drives the pages.
//!
//! A single [`AutomationResource`] is owned by the process and shared by every
//! concurrent check. Each check derives its own [`PageSession`] from it and
//! must close that session before finishing. Backends report every response
//! they see to the [`ResponseObserver`] supplied when the page is opened, so
//! the observer is in place before the first navigation.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::error::TransportError;

#[cfg(feature = "browser-backend")]
pub mod browser;
#[cfg(feature = "http-backend")]
pub mod http;

/// One response seen by the transport layer.
#[derive(Clone, Copy)]
pub struct ObservedResponse<'a> {
    pub url: &'a str,
    pub status: u16,
    /// Decoded body, when the backend read it.
    pub body: Option<&'a str>,
}

impl ObservedResponse<'_> {
    pub fn is_success(&self) -> bool {
        (200..=299).contains(&self.status)
    }
}

impl fmt::Debug for ObservedResponse<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservedResponse")
            .field("url", &self.url)
            .field("status", &self.status)
            .field("body_len", &self.body.map(str::len))
            .finish()
    }
}

/// Passive listener invoked synchronously for every response on a page.
pub trait ResponseObserver: Send + Sync {
    fn on_response(&self, response: &ObservedResponse<'_>);
}

/// A JavaScript-level condition over global bindings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScriptPredicate {
    bindings: &'static [&'static str],
}

impl ScriptPredicate {
    /// True when any of `bindings` is defined in the page's global scope.
    pub const fn any_defined(bindings: &'static [&'static str]) -> Self {
        Self { bindings }
    }

    pub fn bindings(&self) -> &'static [&'static str] {
        self.bindings
    }

    /// The bare boolean condition, evaluable as a script expression.
    pub fn condition(&self) -> String {
        let checks = self
            .bindings
            .iter()
            .map(|binding| format!("typeof {binding} !== 'undefined'"))
            .collect::<Vec<_>>()
            .join(" || ");
        format!("({checks})")
    }

    /// The predicate as a JavaScript arrow function, for script-capable backends.
    pub fn expression(&self) -> String {
        format!("() => {}", self.condition())
    }
}

/// Process-wide automation handle (a browser, an HTTP client pool, ...).
///
/// Its lifecycle belongs to the caller; the orchestrator only borrows it.
#[async_trait]
pub trait AutomationResource: Send + Sync {
    /// Whether new pages can still be opened.
    fn is_connected(&self) -> bool;

    /// Create an isolated page with `observer` already attached.
    async fn open_page(
        &self,
        observer: Arc<dyn ResponseObserver>,
    ) -> Result<Box<dyn PageSession>, TransportError>;
}

/// An isolated page derived from the shared resource.
///
/// Timeouts passed in are hints for the backend; the engine enforces its own
/// bound around every call regardless.
#[async_trait]
pub trait PageSession: Send {
    /// Navigate and return once the initial DOM has been built.
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<(), TransportError>;

    /// Number of elements matching `selector`.
    async fn count_matching(&mut self, selector: &str) -> Result<usize, TransportError>;

    /// Activate the first element matching `selector`.
    async fn click_first(&mut self, selector: &str, timeout: Duration) -> Result<(), TransportError>;

    /// Evaluate `predicate` once against the current script environment.
    async fn evaluate(&mut self, predicate: &ScriptPredicate) -> Result<bool, TransportError>;

    /// Resolve once the page has no outstanding network activity.
    async fn wait_for_network_idle(&mut self, timeout: Duration) -> Result<(), TransportError>;

    /// Current serialized document markup.
    async fn content(&mut self) -> Result<String, TransportError>;

    /// Release the page and everything it holds.
    async fn close(self: Box<Self>) -> Result<(), TransportError>;
}
