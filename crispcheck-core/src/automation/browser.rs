//! Headless Chromium backend driven over the DevTools protocol.
//!
//! Unlike the HTTP backend this one renders pages: scripts run, the widget
//! predicate is evaluated in the page, clicks are dispatched to real
//! elements, and every network response the page receives reaches the
//! observer (with its body for textual resources).

use std::{
    collections::{HashMap, HashSet},
    fmt,
    hash::Hash,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chromiumoxide::{
    Browser, BrowserConfig, Page,
    cdp::browser_protocol::network::{
        EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent, EventResponseReceived,
        GetResponseBodyParams, RequestId,
    },
    error::CdpError,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{Mutex, watch},
    task::{JoinHandle, JoinSet},
};

use super::{AutomationResource, ObservedResponse, PageSession, ResponseObserver, ScriptPredicate};
use crate::error::{ProbeError, Result, TransportError};

/// Consecutive handler errors tolerated before the connection counts as lost.
const HANDLER_ERROR_TOLERANCE: usize = 3;

/// How long the network must stay quiet to count as idle.
const NETWORK_QUIET_PERIOD: Duration = Duration::from_millis(500);

const BODY_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChromiumAutomationOptions {
    /// Browser binary; chromiumoxide's lookup is used when unset.
    pub executable: Option<PathBuf>,
    pub headless: bool,
    pub user_agent: Option<String>,
    /// Needed when running as root inside containers.
    pub no_sandbox: bool,
    pub extra_args: Vec<String>,
}

impl Default for ChromiumAutomationOptions {
    fn default() -> Self {
        Self {
            executable: None,
            headless: true,
            user_agent: None,
            no_sandbox: false,
            extra_args: Vec::new(),
        }
    }
}

impl ChromiumAutomationOptions {
    /// Command-line flags passed to the browser on top of chromiumoxide's
    /// defaults.
    pub fn launch_args(&self) -> Vec<String> {
        let mut args = vec![
            "--disable-gpu".to_string(),
            "--disable-dev-shm-usage".to_string(),
            "--mute-audio".to_string(),
        ];
        if self.no_sandbox {
            args.push("--no-sandbox".to_string());
        }
        if let Some(user_agent) = &self.user_agent {
            args.push(format!("--user-agent={user_agent}"));
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// One browser process shared by every page of a batch.
pub struct ChromiumAutomation {
    browser: Mutex<Option<Browser>>,
    connected: Arc<AtomicBool>,
    opened: AtomicUsize,
    handler: JoinHandle<()>,
}

impl fmt::Debug for ChromiumAutomation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChromiumAutomation")
            .field("connected", &self.is_connected())
            .field("pages_opened", &self.opened.load(Ordering::Relaxed))
            .finish()
    }
}

impl ChromiumAutomation {
    pub async fn launch(options: ChromiumAutomationOptions) -> Result<Self> {
        let mut builder = BrowserConfig::builder();
        if let Some(executable) = &options.executable {
            builder = builder.chrome_executable(executable);
        }
        if !options.headless {
            builder = builder.with_head();
        }
        let config = builder
            .args(options.launch_args())
            .build()
            .map_err(|err| ProbeError::Transport(TransportError::Other(format!("browser config: {err}"))))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|err| ProbeError::Transport(map_cdp_error(err, TransportError::Other)))?;

        let connected = Arc::new(AtomicBool::new(true));
        let alive = Arc::clone(&connected);
        let handler = tokio::spawn(async move {
            let mut consecutive_errors = 0usize;
            while let Some(event) = handler.next().await {
                match event {
                    Ok(()) => consecutive_errors = 0,
                    Err(err) => {
                        consecutive_errors += 1;
                        tracing::warn!(
                            target: "probe::browser",
                            error = %err,
                            consecutive_errors,
                            "Browser handler error"
                        );
                        if consecutive_errors >= HANDLER_ERROR_TOLERANCE {
                            break;
                        }
                    }
                }
            }
            alive.store(false, Ordering::Release);
            tracing::warn!(target: "probe::browser", "Browser event loop exited");
        });

        tracing::info!(
            target: "probe::browser",
            headless = options.headless,
            executable = ?options.executable,
            "Chromium automation ready"
        );

        Ok(Self {
            browser: Mutex::new(Some(browser)),
            connected,
            opened: AtomicUsize::new(0),
            handler,
        })
    }

    /// Close the browser. Pages still open fail with `Disconnected`.
    pub async fn shutdown(&self) {
        self.connected.store(false, Ordering::Release);
        let Some(mut browser) = self.browser.lock().await.take() else {
            return;
        };
        if let Err(err) = browser.close().await {
            tracing::debug!(target: "probe::browser", error = %err, "Browser close failed");
        }
        if let Err(err) = browser.wait().await {
            tracing::debug!(target: "probe::browser", error = %err, "Browser process wait failed");
        }
        self.handler.abort();
        tracing::info!(target: "probe::browser", "Chromium automation shut down");
    }
}

#[async_trait]
impl AutomationResource for ChromiumAutomation {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn open_page(
        &self,
        observer: Arc<dyn ResponseObserver>,
    ) -> std::result::Result<Box<dyn PageSession>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        let page = {
            let guard = self.browser.lock().await;
            let browser = guard.as_ref().ok_or(TransportError::Disconnected)?;
            browser
                .new_page("about:blank")
                .await
                .map_err(|err| map_cdp_error(err, TransportError::Other))?
        };
        self.opened.fetch_add(1, Ordering::Relaxed);

        match ChromiumPage::attach(page.clone(), observer).await {
            Ok(session) => Ok(Box::new(session)),
            Err(err) => {
                let _ = page.close().await;
                Err(err)
            }
        }
    }
}

/// Requests a page has issued and responses it is still reading.
#[derive(Debug)]
struct RequestLedger<K> {
    in_flight: HashSet<K>,
    responses: HashMap<K, PendingResponse>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct PendingResponse {
    url: String,
    status: u16,
    wants_body: bool,
}

impl<K: Hash + Eq + Clone> RequestLedger<K> {
    fn new() -> Self {
        Self {
            in_flight: HashSet::new(),
            responses: HashMap::new(),
        }
    }

    fn started(&mut self, id: K) {
        self.in_flight.insert(id);
    }

    fn responded(&mut self, id: K, response: PendingResponse) {
        self.in_flight.insert(id.clone());
        self.responses.insert(id, response);
    }

    /// The request is done; returns its response, if one arrived.
    fn finished(&mut self, id: &K) -> Option<PendingResponse> {
        self.in_flight.remove(id);
        self.responses.remove(id)
    }

    fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

/// Bodies worth reading: anything that can carry markup or script text.
fn wants_body(mime_type: &str) -> bool {
    let mime = mime_type.to_ascii_lowercase();
    mime.starts_with("text/") || mime.contains("javascript") || mime.contains("json") || mime.contains("html")
}

struct ChromiumPage {
    page: Page,
    activity: watch::Receiver<usize>,
    listener: JoinHandle<()>,
}

impl ChromiumPage {
    /// Subscribe to network events before the first navigation.
    async fn attach(page: Page, observer: Arc<dyn ResponseObserver>) -> std::result::Result<Self, TransportError> {
        let mut requests = page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .map_err(|err| map_cdp_error(err, TransportError::Other))?;
        let mut responses = page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(|err| map_cdp_error(err, TransportError::Other))?;
        let mut finished = page
            .event_listener::<EventLoadingFinished>()
            .await
            .map_err(|err| map_cdp_error(err, TransportError::Other))?;
        let mut failed = page
            .event_listener::<EventLoadingFailed>()
            .await
            .map_err(|err| map_cdp_error(err, TransportError::Other))?;

        let (activity_tx, activity) = watch::channel(0usize);
        let body_page = page.clone();

        let listener = tokio::spawn(async move {
            let mut ledger: RequestLedger<RequestId> = RequestLedger::new();
            let mut bodies = JoinSet::new();
            loop {
                tokio::select! {
                    Some(event) = requests.next() => {
                        ledger.started(event.request_id.clone());
                    }
                    Some(event) = responses.next() => {
                        let status = u16::try_from(event.response.status).unwrap_or_default();
                        ledger.responded(
                            event.request_id.clone(),
                            PendingResponse {
                                url: event.response.url.clone(),
                                status,
                                wants_body: wants_body(&event.response.mime_type),
                            },
                        );
                    }
                    Some(event) = finished.next() => {
                        if let Some(response) = ledger.finished(&event.request_id) {
                            if response.wants_body {
                                let page = body_page.clone();
                                let observer = Arc::clone(&observer);
                                let request_id = event.request_id.clone();
                                bodies.spawn(async move {
                                    let body = read_body(&page, request_id).await;
                                    observer.on_response(&ObservedResponse {
                                        url: &response.url,
                                        status: response.status,
                                        body: body.as_deref(),
                                    });
                                });
                            } else {
                                report(observer.as_ref(), &response);
                            }
                        }
                    }
                    Some(event) = failed.next() => {
                        if let Some(response) = ledger.finished(&event.request_id) {
                            report(observer.as_ref(), &response);
                        }
                    }
                    Some(_) = bodies.join_next(), if !bodies.is_empty() => {}
                    else => break,
                }
                activity_tx.send_replace(ledger.in_flight());
            }
        });

        Ok(Self {
            page,
            activity,
            listener,
        })
    }
}

fn report(observer: &dyn ResponseObserver, response: &PendingResponse) {
    observer.on_response(&ObservedResponse {
        url: &response.url,
        status: response.status,
        body: None,
    });
}

async fn read_body(page: &Page, request_id: RequestId) -> Option<String> {
    let fetched = tokio::time::timeout(BODY_FETCH_TIMEOUT, page.execute(GetResponseBodyParams::new(request_id))).await;
    match fetched {
        Ok(Ok(reply)) if !reply.result.base64_encoded => Some(reply.result.body.clone()),
        Ok(Ok(_)) => None,
        Ok(Err(err)) => {
            tracing::trace!(target: "probe::browser", error = %err, "Response body unavailable");
            None
        }
        Err(_) => None,
    }
}

#[async_trait]
impl PageSession for ChromiumPage {
    async fn navigate(&mut self, url: &str, timeout: Duration) -> std::result::Result<(), TransportError> {
        match tokio::time::timeout(timeout, self.page.goto(url)).await {
            Ok(Ok(_)) => {
                tracing::debug!(target: "probe::browser", url, "Document loaded");
                Ok(())
            }
            Ok(Err(err)) => Err(map_cdp_error(err, TransportError::Navigation)),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn count_matching(&mut self, selector: &str) -> std::result::Result<usize, TransportError> {
        self.page
            .find_elements(selector)
            .await
            .map(|elements| elements.len())
            .map_err(|err| map_cdp_error(err, TransportError::Other))
    }

    async fn click_first(&mut self, selector: &str, timeout: Duration) -> std::result::Result<(), TransportError> {
        let click = async {
            let element = self
                .page
                .find_element(selector)
                .await
                .map_err(|err| map_cdp_error(err, TransportError::Other))?;
            element
                .click()
                .await
                .map_err(|err| map_cdp_error(err, TransportError::Other))?;
            Ok(())
        };
        tokio::time::timeout(timeout, click)
            .await
            .unwrap_or(Err(TransportError::Timeout))
    }

    async fn evaluate(&mut self, predicate: &ScriptPredicate) -> std::result::Result<bool, TransportError> {
        let result = self
            .page
            .evaluate(predicate.condition())
            .await
            .map_err(|err| map_cdp_error(err, TransportError::Other))?;
        result
            .into_value::<bool>()
            .map_err(|err| TransportError::Other(format!("predicate result: {err}")))
    }

    async fn wait_for_network_idle(&mut self, timeout: Duration) -> std::result::Result<(), TransportError> {
        let mut activity = self.activity.clone();
        let quiet = async {
            loop {
                let drained = activity.wait_for(|in_flight| *in_flight == 0).await.is_ok();
                if !drained {
                    return Err(TransportError::Disconnected);
                }
                tokio::select! {
                    _ = tokio::time::sleep(NETWORK_QUIET_PERIOD) => return Ok(()),
                    changed = activity.changed() => {
                        if changed.is_err() {
                            return Err(TransportError::Disconnected);
                        }
                    }
                }
            }
        };
        tokio::time::timeout(timeout, quiet)
            .await
            .unwrap_or(Err(TransportError::Timeout))
    }

    async fn content(&mut self) -> std::result::Result<String, TransportError> {
        self.page
            .content()
            .await
            .map_err(|err| map_cdp_error(err, TransportError::Other))
    }

    async fn close(self: Box<Self>) -> std::result::Result<(), TransportError> {
        self.listener.abort();
        self.page
            .close()
            .await
            .map_err(|err| map_cdp_error(err, TransportError::Other))
    }
}

/// Maps a CDP failure onto the transport taxonomy; `wrap` picks the variant
/// for errors that are neither timeouts nor a lost connection.
fn map_cdp_error(err: CdpError, wrap: fn(String) -> TransportError) -> TransportError {
    match err {
        CdpError::Timeout => TransportError::Timeout,
        other => classify_cdp_text(other.to_string(), wrap),
    }
}

fn classify_cdp_text(text: String, wrap: fn(String) -> TransportError) -> TransportError {
    const CONNECTION_LOST: &[&str] = &["receiver is gone", "channel closed", "broken pipe", "connection closed"];
    let lowered = text.to_ascii_lowercase();
    if CONNECTION_LOST.iter().any(|needle| lowered.contains(needle)) {
        TransportError::Disconnected
    } else {
        wrap(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DiagnosticCategory;

    #[test]
    fn launch_args_follow_options() {
        let defaults = ChromiumAutomationOptions::default();
        assert!(defaults.headless);
        assert!(!defaults.launch_args().iter().any(|arg| arg == "--no-sandbox"));

        let options = ChromiumAutomationOptions {
            no_sandbox: true,
            user_agent: Some("crispcheck/1.0".into()),
            extra_args: vec!["--lang=en-US".into()],
            ..ChromiumAutomationOptions::default()
        };
        let args = options.launch_args();
        assert!(args.contains(&"--no-sandbox".to_string()));
        assert!(args.contains(&"--user-agent=crispcheck/1.0".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("--lang=en-US"));
    }

    #[test]
    fn ledger_tracks_in_flight_requests() {
        let mut ledger: RequestLedger<&str> = RequestLedger::new();
        ledger.started("doc");
        ledger.started("script");
        assert_eq!(ledger.in_flight(), 2);

        let response = PendingResponse {
            url: "https://client.crisp.chat/l.js".into(),
            status: 200,
            wants_body: true,
        };
        ledger.responded("script", response.clone());
        assert_eq!(ledger.in_flight(), 2);

        assert_eq!(ledger.finished(&"script"), Some(response));
        assert_eq!(ledger.finished(&"doc"), None);
        assert_eq!(ledger.in_flight(), 0);
        assert_eq!(ledger.finished(&"unknown"), None);
    }

    #[test]
    fn only_textual_bodies_are_read() {
        assert!(wants_body("text/html; charset=utf-8"));
        assert!(wants_body("application/javascript"));
        assert!(wants_body("application/json"));
        assert!(!wants_body("image/png"));
        assert!(!wants_body("font/woff2"));
    }

    #[test]
    fn lost_connections_are_disconnects() {
        assert_eq!(
            classify_cdp_text("send failed because receiver is gone".into(), TransportError::Other),
            TransportError::Disconnected
        );
        let navigation = classify_cdp_text("net::ERR_NAME_NOT_RESOLVED".into(), TransportError::Navigation);
        assert_eq!(navigation.category(), DiagnosticCategory::NameResolutionFailure);
        assert!(matches!(navigation, TransportError::Navigation(_)));
        assert_eq!(map_cdp_error(CdpError::Timeout, TransportError::Other), TransportError::Timeout);
    }
}
