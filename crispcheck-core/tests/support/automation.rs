//! Scripted automation backend.
//!
//! Each URL maps to a [`PagePlan`] describing what the page does at every
//! stage. The backend records how many pages were opened and closed and the
//! peak number open at once.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use crispcheck_core::{
    AutomationResource, ObservedResponse, PageSession, ResponseObserver, TransportError,
    automation::ScriptPredicate,
};

#[derive(Clone, Debug)]
pub struct Response {
    pub url: String,
    pub status: u16,
    pub body: Option<String>,
}

impl Response {
    pub fn ok(url: &str, body: Option<&str>) -> Self {
        Self {
            url: url.to_string(),
            status: 200,
            body: body.map(str::to_string),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PagePlan {
    pub on_navigate: Vec<Response>,
    pub navigate_delay: Duration,
    pub navigate_error: Option<TransportError>,
    pub panic_on_navigate: bool,
    pub affordances: usize,
    pub click_delay: Duration,
    pub click_error: Option<TransportError>,
    pub on_click: Vec<Response>,
    pub predicate: bool,
    pub idle_delay: Duration,
    pub markup: String,
    pub content_error: Option<TransportError>,
    pub on_close: Vec<Response>,
}

impl Default for PagePlan {
    fn default() -> Self {
        Self {
            on_navigate: Vec::new(),
            navigate_delay: Duration::ZERO,
            navigate_error: None,
            panic_on_navigate: false,
            affordances: 0,
            click_delay: Duration::ZERO,
            click_error: None,
            on_click: Vec::new(),
            predicate: false,
            idle_delay: Duration::ZERO,
            markup: "<html><body><p>Plain page</p></body></html>".to_string(),
            content_error: None,
            on_close: Vec::new(),
        }
    }
}

impl PagePlan {
    /// No widget evidence anywhere.
    pub fn clean() -> Self {
        Self::default()
    }

    pub fn signal_on_navigate(mut self, url: &str) -> Self {
        self.on_navigate.push(Response::ok(url, None));
        self
    }

    pub fn navigate_after(mut self, delay: Duration) -> Self {
        self.navigate_delay = delay;
        self
    }

    pub fn navigate_fails(mut self, error: TransportError) -> Self {
        self.navigate_error = Some(error);
        self
    }

    pub fn panics(mut self) -> Self {
        self.panic_on_navigate = true;
        self
    }

    pub fn clickable(mut self, delay: Duration) -> Self {
        self.affordances = 1;
        self.click_delay = delay;
        self
    }

    pub fn signal_on_click(mut self, url: &str) -> Self {
        self.affordances = self.affordances.max(1);
        self.on_click.push(Response::ok(url, None));
        self
    }

    pub fn with_predicate(mut self) -> Self {
        self.predicate = true;
        self
    }

    pub fn with_markup(mut self, markup: &str) -> Self {
        self.markup = markup.to_string();
        self
    }

    pub fn idle_after(mut self, delay: Duration) -> Self {
        self.idle_delay = delay;
        self
    }

    pub fn signal_on_close(mut self, url: &str) -> Self {
        self.on_close.push(Response::ok(url, None));
        self
    }
}

#[derive(Debug, Default)]
struct Counters {
    opened: AtomicUsize,
    closed: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    navigations: Mutex<Vec<String>>,
}

#[derive(Debug)]
pub struct ScriptedAutomation {
    plans: Mutex<HashMap<String, PagePlan>>,
    connected: AtomicBool,
    counters: Arc<Counters>,
}

impl Default for ScriptedAutomation {
    fn default() -> Self {
        Self {
            plans: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
            counters: Arc::new(Counters::default()),
        }
    }
}

impl ScriptedAutomation {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_plan(self: &Arc<Self>, url: &str, plan: PagePlan) -> Arc<Self> {
        self.plans.lock().unwrap().insert(url.to_string(), plan);
        Arc::clone(self)
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn opened(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.counters.closed.load(Ordering::SeqCst)
    }

    pub fn peak_active(&self) -> usize {
        self.counters.peak_active.load(Ordering::SeqCst)
    }

    pub fn navigations(&self) -> Vec<String> {
        self.counters.navigations.lock().unwrap().clone()
    }

    /// Waits for detached page closes to land.
    pub async fn settle(&self) {
        for _ in 0..50 {
            if self.closed() == self.opened() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl AutomationResource for ScriptedAutomation {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn open_page(
        &self,
        observer: Arc<dyn ResponseObserver>,
    ) -> Result<Box<dyn PageSession>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        let counters = &self.counters;
        counters.opened.fetch_add(1, Ordering::SeqCst);
        let active = counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_active.fetch_max(active, Ordering::SeqCst);

        Ok(Box::new(ScriptedPage {
            plans: self.plans.lock().unwrap().clone(),
            plan: PagePlan::default(),
            observer,
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct ScriptedPage {
    plans: HashMap<String, PagePlan>,
    plan: PagePlan,
    observer: Arc<dyn ResponseObserver>,
    counters: Arc<Counters>,
}

impl ScriptedPage {
    fn report(&self, responses: &[Response]) {
        for response in responses {
            self.observer.on_response(&ObservedResponse {
                url: &response.url,
                status: response.status,
                body: response.body.as_deref(),
            });
        }
    }
}

#[async_trait]
impl PageSession for ScriptedPage {
    async fn navigate(&mut self, url: &str, _timeout: Duration) -> Result<(), TransportError> {
        self.plan = self.plans.get(url).cloned().unwrap_or_default();
        self.counters.navigations.lock().unwrap().push(url.to_string());

        if self.plan.panic_on_navigate {
            panic!("scripted panic while navigating to {url}");
        }
        self.report(&self.plan.on_navigate);
        if !self.plan.navigate_delay.is_zero() {
            tokio::time::sleep(self.plan.navigate_delay).await;
        }
        match self.plan.navigate_error.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn count_matching(&mut self, _selector: &str) -> Result<usize, TransportError> {
        Ok(self.plan.affordances)
    }

    async fn click_first(&mut self, _selector: &str, _timeout: Duration) -> Result<(), TransportError> {
        if !self.plan.click_delay.is_zero() {
            tokio::time::sleep(self.plan.click_delay).await;
        }
        if let Some(error) = self.plan.click_error.clone() {
            return Err(error);
        }
        self.report(&self.plan.on_click);
        Ok(())
    }

    async fn evaluate(&mut self, _predicate: &ScriptPredicate) -> Result<bool, TransportError> {
        Ok(self.plan.predicate)
    }

    async fn wait_for_network_idle(&mut self, _timeout: Duration) -> Result<(), TransportError> {
        if !self.plan.idle_delay.is_zero() {
            tokio::time::sleep(self.plan.idle_delay).await;
        }
        Ok(())
    }

    async fn content(&mut self) -> Result<String, TransportError> {
        match self.plan.content_error.clone() {
            Some(error) => Err(error),
            None => Ok(self.plan.markup.clone()),
        }
    }

    async fn close(self: Box<Self>) -> Result<(), TransportError> {
        self.report(&self.plan.on_close);
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
        self.counters.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}
