//! Scripted in-memory transport.
//!
//! Routes are keyed by absolute URL. Each exchange runs on its own tokio task
//! and follows the dispatch contract: it pauses whenever the handler asks for
//! it and only continues after `resume`, and it stops as soon as `abort` is
//! called. Everything that passes through is recorded so tests can inspect it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use parking_lot::Mutex;
use url::Url;

use super::{AbortFn, DispatchBody, DispatchContext, DispatchHandler, DispatchRequest, Dispatcher, Exchange};
use crate::errors::FetchError;

/// Scripted answer for one URL.
#[derive(Debug, Clone, Default)]
pub struct MockRoute {
    pub status: u16,
    pub headers: HeaderMap,
    pub chunks: Vec<Bytes>,
    /// 1xx statuses sent before the final header block
    pub informational: Vec<u16>,
    /// Hops reported through `DispatchContext::history`
    pub history: Vec<Url>,
    pub fail_before_headers: Option<FetchError>,
    pub fail_after_body: Option<FetchError>,
    /// Keep the exchange open after the last chunk until it is aborted
    pub hold_open: bool,
}

impl MockRoute {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    /// A redirect answer pointing at `location`.
    pub fn redirect(status: u16, location: &str) -> Self {
        Self::new(status).header("location", location)
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                self.headers.append(name, value);
            }
            _ => log::warn!("MockRoute: ignoring invalid header {name:?}: {value:?}"),
        }
        self
    }

    pub fn chunk(mut self, chunk: impl Into<Bytes>) -> Self {
        self.chunks.push(chunk.into());
        self
    }

    pub fn informational(mut self, status: u16) -> Self {
        self.informational.push(status);
        self
    }

    pub fn history(mut self, hop: Url) -> Self {
        self.history.push(hop);
        self
    }

    pub fn fail_before_headers(mut self, err: FetchError) -> Self {
        self.fail_before_headers = Some(err);
        self
    }

    pub fn fail_after_body(mut self, err: FetchError) -> Self {
        self.fail_after_body = Some(err);
        self
    }

    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }
}

/// A request as seen by the mock transport.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub url: String,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<DispatchBody>,
    pub max_redirections: u32,
}

#[derive(Debug, Default)]
struct Stats {
    abort_calls: AtomicUsize,
    data_results: Mutex<Vec<bool>>,
}

#[derive(Debug, Default)]
pub struct MockDispatcher {
    routes: Mutex<HashMap<String, MockRoute>>,
    requests: Mutex<Vec<RecordedRequest>>,
    stats: Arc<Stats>,
}

impl MockDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a route, builder style.
    pub fn route(self, url: &str, route: MockRoute) -> Self {
        self.add_route(url, route);
        self
    }

    pub fn add_route(&self, url: &str, route: MockRoute) {
        let key = Url::parse(url).map(|u| u.to_string()).unwrap_or_else(|_| url.to_string());
        self.routes.lock().insert(key, route);
    }

    /// Every request dispatched so far, in order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    pub fn dispatch_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// How often any exchange's abort callback was invoked.
    pub fn abort_calls(&self) -> usize {
        self.stats.abort_calls.load(Ordering::SeqCst)
    }

    /// Return values of every `on_data` call, in order.
    pub fn data_results(&self) -> Vec<bool> {
        self.stats.data_results.lock().clone()
    }
}

impl Dispatcher for MockDispatcher {
    fn dispatch(&self, request: DispatchRequest, handler: Box<dyn DispatchHandler>) {
        let url = match request.url() {
            Ok(url) => url.to_string(),
            Err(_) => format!("{}{}", request.origin, request.path),
        };
        log::trace!("MockDispatcher: {} {}", request.method, url);

        self.requests.lock().push(RecordedRequest {
            url: url.clone(),
            method: request.method.clone(),
            headers: request.headers.clone(),
            body: request.body.clone(),
            max_redirections: request.max_redirections,
        });

        let route = self.routes.lock().get(&url).cloned();
        tokio::spawn(run_exchange(url, route, handler, self.stats.clone()));
    }
}

async fn run_exchange(
    url: String,
    route: Option<MockRoute>,
    mut handler: Box<dyn DispatchHandler>,
    stats: Arc<Stats>,
) {
    let exchange = Exchange::new();
    let abort: AbortFn = {
        let exchange = exchange.clone();
        let stats = stats.clone();
        Arc::new(move |err| {
            stats.abort_calls.fetch_add(1, Ordering::SeqCst);
            exchange.abort(err);
        })
    };
    let resume = exchange.resume_fn();

    let Some(route) = route else {
        handler.on_error(FetchError::Network(format!("no route for {url}")));
        return;
    };

    let context = DispatchContext {
        history: route.history.clone(),
    };
    if let Err(err) = handler.on_connect(abort, context) {
        handler.on_error(err);
        return;
    }

    // Give an abort racing with the connection a chance to land
    tokio::task::yield_now().await;
    if let Some(err) = exchange.abort_reason() {
        handler.on_error(err);
        return;
    }
    if let Some(err) = route.fail_before_headers {
        handler.on_error(err);
        return;
    }

    for status in &route.informational {
        handler.on_headers(*status, HeaderMap::new(), resume.clone());
    }
    let mut ready = handler.on_headers(route.status, route.headers.clone(), resume.clone());

    for chunk in route.chunks {
        if !ready {
            if let Err(err) = exchange.wait_for_resume().await {
                handler.on_error(err);
                return;
            }
        }
        if let Some(err) = exchange.abort_reason() {
            handler.on_error(err);
            return;
        }
        ready = handler.on_data(&chunk);
        stats.data_results.lock().push(ready);
        if ready {
            exchange.clear_resume();
        }
    }

    if let Some(err) = exchange.abort_reason() {
        handler.on_error(err);
        return;
    }
    if let Some(err) = route.fail_after_body {
        handler.on_error(err);
        return;
    }
    if route.hold_open {
        let err = exchange.aborted().await;
        handler.on_error(err);
        return;
    }

    handler.on_complete();
}
