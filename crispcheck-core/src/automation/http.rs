//! Script-less automation backend built on `reqwest`.
//!
//! Pages are fetched rather than rendered: navigation downloads the document,
//! referenced scripts are fetched in the background and reported to the
//! page's observer like a browser's network events would be. Script
//! evaluation is approximated statically by looking for assignments to the
//! requested globals in inline and fetched script sources; documents are
//! parsed with `scraper`, so selectors are real CSS. There is no pointer
//! input, so [`PageSession::click_first`] always reports
//! [`TransportError::Unsupported`].

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use url::Url;

use super::{AutomationResource, ObservedResponse, PageSession, ResponseObserver, ScriptPredicate};
use crate::{
    detection::markers::WIDGET_BINDINGS,
    error::{ProbeError, Result, TransportError},
};

/// Desktop Chrome, so sites serve the same markup a real visitor gets.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpAutomationOptions {
    pub user_agent: String,
    /// Upper bound for each script fetch.
    pub subresource_timeout_ms: u64,
    /// External scripts fetched per page; the rest are ignored.
    pub max_subresources: usize,
    pub accept_invalid_certs: bool,
}

impl Default for HttpAutomationOptions {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            subresource_timeout_ms: 10_000,
            max_subresources: 32,
            accept_invalid_certs: false,
        }
    }
}

impl HttpAutomationOptions {
    pub fn subresource_timeout(&self) -> Duration {
        Duration::from_millis(self.subresource_timeout_ms)
    }
}

/// Shared client pool standing in for a browser process.
pub struct HttpAutomation {
    client: Client,
    options: HttpAutomationOptions,
    connected: AtomicBool,
    opened: AtomicUsize,
}

impl fmt::Debug for HttpAutomation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpAutomation")
            .field("connected", &self.is_connected())
            .field("pages_opened", &self.opened.load(Ordering::Relaxed))
            .field("max_subresources", &self.options.max_subresources)
            .finish()
    }
}

impl HttpAutomation {
    pub fn launch(options: HttpAutomationOptions) -> Result<Self> {
        let client = Client::builder()
            .user_agent(options.user_agent.clone())
            .danger_accept_invalid_certs(options.accept_invalid_certs)
            .build()
            .map_err(|err| ProbeError::Transport(TransportError::Other(error_chain(&err))))?;

        tracing::info!(
            target: "probe::http",
            user_agent = %options.user_agent,
            max_subresources = options.max_subresources,
            "HTTP automation ready"
        );

        Ok(Self {
            client,
            options,
            connected: AtomicBool::new(true),
            opened: AtomicUsize::new(0),
        })
    }

    /// Refuse new pages from now on. Pages already open keep working.
    pub fn shutdown(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            tracing::info!(target: "probe::http", "HTTP automation shut down");
        }
    }
}

#[async_trait]
impl AutomationResource for HttpAutomation {
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
        self.opened.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(HttpPage::new(
            self.client.clone(),
            observer,
            &self.options,
        )))
    }
}

struct HttpPage {
    client: Client,
    observer: Arc<dyn ResponseObserver>,
    subresource_timeout: Duration,
    max_subresources: usize,
    markup: Option<String>,
    scripts: Vec<String>,
    fetches: JoinSet<Option<String>>,
}

impl HttpPage {
    fn new(client: Client, observer: Arc<dyn ResponseObserver>, options: &HttpAutomationOptions) -> Self {
        Self {
            client,
            observer,
            subresource_timeout: options.subresource_timeout(),
            max_subresources: options.max_subresources,
            markup: None,
            scripts: Vec::new(),
            fetches: JoinSet::new(),
        }
    }

    /// Install a freshly loaded document and start fetching its scripts.
    fn absorb_document(&mut self, url: &Url, status: u16, markup: String) {
        self.observer.on_response(&ObservedResponse {
            url: url.as_str(),
            status,
            body: Some(&markup),
        });

        self.fetches.abort_all();
        let ScriptInventory { inline, sources } = script_inventory(&markup);
        self.scripts = inline;

        if sources.len() > self.max_subresources {
            tracing::debug!(
                target: "probe::http",
                url = %url,
                found = sources.len(),
                limit = self.max_subresources,
                "Skipping scripts over the per-page limit"
            );
        }
        for src in sources.into_iter().take(self.max_subresources) {
            match url.join(&src) {
                Ok(resolved) if matches!(resolved.scheme(), "http" | "https") => {
                    self.spawn_fetch(resolved)
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::trace!(target: "probe::http", src = %src, error = %err, "Unresolvable script src");
                }
            }
        }

        self.markup = Some(markup);
    }

    fn spawn_fetch(&mut self, url: Url) {
        let client = self.client.clone();
        let observer = Arc::clone(&self.observer);
        let timeout = self.subresource_timeout;

        self.fetches.spawn(async move {
            let response = match client.get(url.clone()).timeout(timeout).send().await {
                Ok(response) => response,
                Err(err) => {
                    tracing::trace!(target: "probe::http", url = %url, error = %err, "Script fetch failed");
                    return None;
                }
            };
            let status = response.status().as_u16();
            let final_url = response.url().to_string();
            let body = response.text().await.ok();
            observer.on_response(&ObservedResponse {
                url: &final_url,
                status,
                body: body.as_deref(),
            });
            body
        });
    }

    /// Move bodies of already-finished fetches into the script set.
    fn collect_finished(&mut self) {
        while let Some(joined) = self.fetches.try_join_next() {
            if let Ok(Some(body)) = joined {
                self.scripts.push(body);
            }
        }
    }
}

#[async_trait]
impl PageSession for HttpPage {
    async fn navigate(&mut self, url: &str, timeout: Duration) -> std::result::Result<(), TransportError> {
        let parsed = Url::parse(url)
            .map_err(|err| TransportError::Navigation(format!("invalid URL {url}: {err}")))?;

        let response = self
            .client
            .get(parsed)
            .timeout(timeout)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let final_url = response.url().clone();
        let status = response.status().as_u16();
        let markup = response.text().await.map_err(map_reqwest_error)?;

        tracing::debug!(target: "probe::http", url = %final_url, status, bytes = markup.len(), "Document loaded");
        self.absorb_document(&final_url, status, markup);
        Ok(())
    }

    async fn count_matching(&mut self, selector: &str) -> std::result::Result<usize, TransportError> {
        let markup = self
            .markup
            .as_deref()
            .ok_or_else(|| TransportError::Other("no document loaded".into()))?;
        count_selector_matches(markup, selector)
    }

    async fn click_first(&mut self, _selector: &str, _timeout: Duration) -> std::result::Result<(), TransportError> {
        Err(TransportError::Unsupported("clicking"))
    }

    async fn evaluate(&mut self, predicate: &ScriptPredicate) -> std::result::Result<bool, TransportError> {
        if self.markup.is_none() {
            return Err(TransportError::Other("no document loaded".into()));
        }
        self.collect_finished();
        let matchers: Vec<Regex> = predicate
            .bindings()
            .iter()
            .filter_map(|binding| assignment_matcher(binding))
            .collect();
        Ok(matchers
            .iter()
            .any(|matcher| self.scripts.iter().any(|source| matcher.is_match(source))))
    }

    async fn wait_for_network_idle(&mut self, _timeout: Duration) -> std::result::Result<(), TransportError> {
        while let Some(joined) = self.fetches.join_next().await {
            if let Ok(Some(body)) = joined {
                self.scripts.push(body);
            }
        }
        Ok(())
    }

    async fn content(&mut self) -> std::result::Result<String, TransportError> {
        self.markup
            .clone()
            .ok_or_else(|| TransportError::Other("no document loaded".into()))
    }

    async fn close(mut self: Box<Self>) -> std::result::Result<(), TransportError> {
        self.fetches.abort_all();
        Ok(())
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Navigation(error_chain(&err))
    }
}

// reqwest's Display stops at the outermost layer; the useful bit (dns, tls,
// refused) lives further down the source chain.
fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        text.push_str(": ");
        text.push_str(&inner.to_string());
        source = inner.source();
    }
    text
}

/// Scripts declared by a document: inline bodies and external `src` values,
/// both in document order.
#[derive(Debug, Default, PartialEq, Eq)]
struct ScriptInventory {
    inline: Vec<String>,
    sources: Vec<String>,
}

static SCRIPT_ELEMENTS: Lazy<Selector> =
    Lazy::new(|| Selector::parse("script").expect("script selector should compile"));

/// Walks the parsed document, so commented-out or attribute-embedded
/// `<script>` text is never picked up.
fn script_inventory(markup: &str) -> ScriptInventory {
    let document = Html::parse_document(markup);
    let mut inventory = ScriptInventory::default();
    for script in document.select(&SCRIPT_ELEMENTS) {
        match script.value().attr("src").map(str::trim) {
            Some("") => {}
            Some(src) => inventory.sources.push(src.to_string()),
            None => {
                let body = script.text().collect::<String>();
                let body = body.trim();
                if !body.is_empty() {
                    inventory.inline.push(body.to_string());
                }
            }
        }
    }
    inventory
}

/// Counts elements matching a CSS selector list.
fn count_selector_matches(markup: &str, selector: &str) -> std::result::Result<usize, TransportError> {
    let selector = Selector::parse(selector)
        .map_err(|err| TransportError::Other(format!("invalid selector {selector:?}: {err}")))?;
    Ok(Html::parse_document(markup).select(&selector).count())
}

fn assignment_pattern(binding: &str) -> String {
    let escaped = regex::escape(binding);
    format!(r#"(?:^|[^\w$]){escaped}\s*=[^=]|\[\s*["']{escaped}["']\s*\]\s*=[^=]"#)
}

static WIDGET_ASSIGNMENTS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    WIDGET_BINDINGS
        .iter()
        .map(|binding| {
            let pattern = assignment_pattern(binding);
            (*binding, Regex::new(&pattern).expect("assignment regex should compile"))
        })
        .collect()
});

/// Matcher for assignments to `binding`. The widget's own globals are
/// compiled once per process.
fn assignment_matcher(binding: &str) -> Option<Regex> {
    WIDGET_ASSIGNMENTS
        .iter()
        .find(|(known, _)| *known == binding)
        .map(|(_, re)| re.clone())
        .or_else(|| Regex::new(&assignment_pattern(binding)).ok())
}

/// Whether `source` assigns `binding` as a global (`x = ...`,
/// `window.x = ...` or `window["x"] = ...`).
fn assigns_global(source: &str, binding: &str) -> bool {
    assignment_matcher(binding).is_some_and(|re| re.is_match(source))
}
