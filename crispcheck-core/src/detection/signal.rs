use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};

use crate::{
    automation::{ObservedResponse, ResponseObserver},
    detection::markers::{text_has_marker, url_has_provider},
    model::TraceRecorder,
};

/// Passive collector of widget evidence from intercepted traffic.
///
/// The flag is set-once: the first matching response flips it and nothing
/// ever clears it. Active probing never reads or writes it except through
/// [`is_set`](SignalObserver::is_set).
pub struct SignalObserver {
    seen: AtomicBool,
    trace: TraceRecorder,
}

impl fmt::Debug for SignalObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalObserver")
            .field("seen", &self.is_set())
            .finish()
    }
}

impl SignalObserver {
    pub fn new(trace: TraceRecorder) -> Self {
        Self {
            seen: AtomicBool::new(false),
            trace,
        }
    }

    pub fn is_set(&self) -> bool {
        self.seen.load(Ordering::Acquire)
    }

    fn mark(&self, message: String) {
        if !self.seen.swap(true, Ordering::AcqRel) {
            tracing::debug!(target: "probe::signal", "{message}");
            self.trace.info(message);
        }
    }
}

impl ResponseObserver for SignalObserver {
    fn on_response(&self, response: &ObservedResponse<'_>) {
        if self.is_set() {
            return;
        }

        if url_has_provider(response.url) {
            self.mark(format!("Crisp found in network URL: {}", response.url));
            return;
        }

        if response.is_success()
            && let Some(body) = response.body
            && text_has_marker(body)
        {
            self.mark(format!("Crisp found in network content from: {}", response.url));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response<'a>(url: &'a str, status: u16, body: Option<&'a str>) -> ObservedResponse<'a> {
        ObservedResponse { url, status, body }
    }

    #[test]
    fn provider_url_sets_flag_regardless_of_status() {
        let observer = SignalObserver::new(TraceRecorder::new());
        observer.on_response(&response("https://client.crisp.chat/l.js", 404, None));
        assert!(observer.is_set());
    }

    #[test]
    fn body_markers_only_count_for_success_responses() {
        let trace = TraceRecorder::new();
        let observer = SignalObserver::new(trace.clone());
        observer.on_response(&response(
            "https://site.test/boot.js",
            500,
            Some("window.CRISP_WEBSITE_ID = 'x'"),
        ));
        assert!(!observer.is_set());

        observer.on_response(&response(
            "https://site.test/boot.js",
            200,
            Some("window.CRISP_WEBSITE_ID = 'x'"),
        ));
        assert!(observer.is_set());
        assert!(trace.snapshot().contains("network content from: https://site.test/boot.js"));
    }

    #[test]
    fn flag_is_one_way_and_logged_once() {
        let trace = TraceRecorder::new();
        let observer = SignalObserver::new(trace.clone());
        observer.on_response(&response("https://client.crisp.chat/l.js", 200, None));
        observer.on_response(&response("https://site.test/", 200, Some("nothing here")));
        observer.on_response(&response("https://client.crisp.chat/other.js", 200, None));
        assert!(observer.is_set());
        assert_eq!(trace.snapshot().len(), 1);
    }
}
