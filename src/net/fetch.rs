//! The fetch algorithm.
//!
//! A [`Fetcher`] owns a transport ([`Dispatcher`]) and a [`FetchConfig`] and
//! turns a resource plus [`RequestInit`] into a [`Response`]:
//!
//! ```text
//! fetch
//!  └─ main fetch ──────────────── loops for every followed redirect
//!      └─ scheme fetch ────────── http(s) only, anything else is a network error
//!          └─ http fetch ──────── applies the redirect mode
//!              └─ http-network-or-cache fetch (no cache, pass-through)
//!                  └─ http-network fetch ─ dispatch + streaming bridge
//! ```
//!
//! The returned future resolves as soon as the response headers are in; the
//! body keeps streaming through [`Response::body`]. Network errors travel
//! through the internal steps as sentinel responses and are turned into
//! [`FetchError::Network`] once they reach the caller.
//!
//! Aborting the request signal rejects a pending fetch, cancels an unused
//! request body, errors a response body that is still streaming and aborts
//! the transport once.

use std::fmt;
use std::sync::Arc;

use http::Method;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::FetchConfig;
use crate::errors::{FetchError, Result};
use crate::net::body::{Body, ReadableStream};
use crate::net::dispatcher::{DispatchBody, DispatchRequest, Dispatcher};
use crate::net::handler::{BridgeHandle, FetchHandler};
use crate::net::request::{Request, RequestInfo, RequestInit, RequestRedirect};
use crate::net::response::{is_redirect_status, Response};

/// Request headers describing the body; dropped when a redirect drops the body.
const REQUEST_BODY_HEADER_NAMES: [&str; 5] = [
    "content-type",
    "content-length",
    "content-encoding",
    "content-language",
    "content-location",
];

/// Identifies one top-level fetch in the logs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FetchId(Uuid);

impl FetchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FetchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FetchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What an abort has to reach while a fetch is in flight.
#[derive(Default)]
struct InFlight {
    aborted: bool,
    bridge: Option<BridgeHandle>,
    request_body: Option<ReadableStream>,
}

impl InFlight {
    /// Registers the bridge of a new network request. Fails once aborted.
    fn attach(&mut self, bridge: BridgeHandle) -> bool {
        if self.aborted {
            return false;
        }
        self.bridge = Some(bridge);
        true
    }
}

fn abort_in_flight(id: FetchId, in_flight: &Mutex<InFlight>) {
    let (bridge, request_body) = {
        let mut state = in_flight.lock();
        state.aborted = true;
        (state.bridge.take(), state.request_body.take())
    };

    log::debug!("Fetch[{id}]: aborted");
    if let Some(body) = request_body {
        // A body the transport is already reading stays locked; it goes down with the transport
        let _ = body.cancel(FetchError::Aborted);
    }
    if let Some(bridge) = bridge {
        bridge.abort(FetchError::Aborted);
    }
}

/// State of one fetch across its redirects.
struct FetchParams {
    id: FetchId,
    request: Request,
    redirect_count: u32,
    in_flight: Arc<Mutex<InFlight>>,
}

/// Outcome of a single pass through scheme fetch.
enum Step {
    Done(Response),
    /// The request was updated for a redirect; run main fetch again
    Redirect,
}

/// Runs fetches over a transport.
///
/// ```no_run
/// use gosub_fetch::{Fetcher, ReqwestDispatcher, RequestInit};
/// # async fn run() -> gosub_fetch::errors::Result<()> {
/// let fetcher = Fetcher::new(ReqwestDispatcher::new()?);
/// let response = fetcher.fetch("https://example.org/", RequestInit::new()).await?;
/// println!("{} {}", response.status(), response.text().await?);
/// # Ok(()) }
/// ```
pub struct Fetcher<D: Dispatcher> {
    dispatcher: D,
    config: FetchConfig,
}

impl<D: Dispatcher> Fetcher<D> {
    pub fn new(dispatcher: D) -> Self {
        Self::with_config(dispatcher, FetchConfig::default())
    }

    pub fn with_config(dispatcher: D, config: FetchConfig) -> Self {
        Self { dispatcher, config }
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Fetches a resource.
    ///
    /// Construction errors (bad URL, bad method, body on GET, ...) are
    /// returned before anything is sent. Resolves once the response headers
    /// have arrived.
    pub async fn fetch<'a>(&self, input: impl Into<RequestInfo<'a>>, init: RequestInit) -> Result<Response> {
        let request = Request::new(input, init)?;
        self.fetch_request(request).await
    }

    /// Fetches an already constructed request.
    pub async fn fetch_request(&self, mut request: Request) -> Result<Response> {
        let id = FetchId::new();
        let signal = request.signal.clone();

        if signal.is_aborted() {
            log::debug!("Fetch[{id}]: signal aborted before start");
            if let Some(body) = request.body() {
                let _ = body.cancel(FetchError::Aborted);
            }
            return Err(FetchError::Aborted);
        }

        self.apply_default_headers(&mut request)?;
        log::debug!("Fetch[{id}]: {} {}", request.method, request.url());

        let in_flight = Arc::new(Mutex::new(InFlight {
            request_body: request.body(),
            ..Default::default()
        }));
        let observer = {
            let in_flight = in_flight.clone();
            signal.observe(move || abort_in_flight(id, &in_flight))
        };

        let mut params = FetchParams {
            id,
            request,
            redirect_count: 0,
            in_flight,
        };

        let result = tokio::select! {
            biased;
            _ = signal.cancelled() => Err(FetchError::Aborted),
            res = self.main_fetch(&mut params) => res,
        };

        let result = match result {
            Ok(response) if response.is_network_error() => Err(FetchError::Network(
                response
                    .error_reason
                    .clone()
                    .unwrap_or_else(|| "network error".to_string()),
            )),
            other => other,
        };

        match &result {
            Ok(response) => {
                log::debug!("Fetch[{id}]: resolved with {}", response.status());
                // A later abort must still reach the streaming body, so the
                // observer goes once the final exchange has settled
                let bridge = params.in_flight.lock().bridge.clone();
                match bridge {
                    Some(bridge) => {
                        let signal = signal.clone();
                        bridge.on_settled(move || signal.remove_observer(observer));
                    }
                    None => signal.remove_observer(observer),
                }
            }
            Err(err) => {
                log::debug!("Fetch[{id}]: failed: {err}");
                signal.remove_observer(observer);
            }
        }
        result
    }

    fn apply_default_headers(&self, request: &mut Request) -> Result<()> {
        let headers = &mut request.headers;
        if !headers.has("accept") {
            headers.set("accept", &self.config.default_accept)?;
            if !headers.has("accept-language") {
                headers.set("accept-language", &self.config.default_accept_language)?;
            }
        }
        if let Some(user_agent) = &self.config.user_agent {
            if !headers.has("user-agent") {
                headers.set("user-agent", user_agent)?;
            }
        }
        Ok(())
    }

    async fn main_fetch(&self, params: &mut FetchParams) -> Result<Response> {
        loop {
            match self.scheme_fetch(params).await? {
                Step::Done(response) => return Ok(response),
                Step::Redirect => continue,
            }
        }
    }

    async fn scheme_fetch(&self, params: &mut FetchParams) -> Result<Step> {
        let scheme = params.request.current_url().scheme().to_string();
        match scheme.as_str() {
            "http" | "https" => self.http_fetch(params).await,
            _ => Ok(Step::Done(Response::network_error(format!(
                "fetching '{scheme}:' URLs is not supported"
            )))),
        }
    }

    async fn http_fetch(&self, params: &mut FetchParams) -> Result<Step> {
        let response = self.http_network_or_cache_fetch(params).await?;
        if !is_redirect_status(response.status()) {
            return Ok(Step::Done(response));
        }

        match params.request.redirect {
            RequestRedirect::Follow => self.http_redirect_fetch(params, response),
            RequestRedirect::Manual => {
                discard_body(&response);
                Ok(Step::Done(Response::opaque_redirect(
                    params.request.current_url().clone(),
                )))
            }
            RequestRedirect::Error => {
                discard_body(&response);
                Ok(Step::Done(Response::network_error(format!(
                    "redirect ({}) while redirect mode is 'error'",
                    response.status()
                ))))
            }
        }
    }

    /// Prepares the request for the next hop, or settles the fetch.
    fn http_redirect_fetch(&self, params: &mut FetchParams, response: Response) -> Result<Step> {
        let Some(location) = response.headers().get("location") else {
            return Ok(Step::Done(response));
        };

        let request = &mut params.request;
        let location_url = match request.current_url().join(&location) {
            Ok(url) => url,
            Err(err) => {
                return Ok(Step::Done(Response::network_error(format!(
                    "invalid redirect location '{location}': {err}"
                ))))
            }
        };
        if !matches!(location_url.scheme(), "http" | "https") {
            return Ok(Step::Done(Response::network_error(format!(
                "redirect to unsupported URL '{location_url}'"
            ))));
        }
        if params.redirect_count >= self.config.max_redirections {
            return Ok(Step::Done(Response::network_error(format!(
                "too many redirects (limit is {})",
                self.config.max_redirections
            ))));
        }
        params.redirect_count += 1;

        let status = response.status();
        let switch_to_get = (status == 303 && request.method != Method::HEAD)
            || (matches!(status, 301 | 302) && request.method == Method::POST);

        if switch_to_get {
            request.method = Method::GET;
            *request.body.get_mut() = None;
            for name in REQUEST_BODY_HEADER_NAMES {
                request.headers.delete(name);
            }
        } else {
            let body = request.body.get_mut();
            if let Some(current) = body.take() {
                match current.source() {
                    Some(source) => *body = Some(Body::from_source(source.clone())),
                    None => {
                        return Ok(Step::Done(Response::network_error(
                            "cannot replay a streamed request body for a redirect",
                        )))
                    }
                }
            }
        }

        log::debug!(
            "Fetch[{}]: {} redirect #{} to {}",
            params.id,
            status,
            params.redirect_count,
            location_url
        );
        params.in_flight.lock().request_body = request.body();
        request.url_list.push(location_url);
        Ok(Step::Redirect)
    }

    async fn http_network_or_cache_fetch(&self, params: &mut FetchParams) -> Result<Response> {
        self.http_network_fetch(params).await
    }

    async fn http_network_fetch(&self, params: &mut FetchParams) -> Result<Response> {
        let request = &params.request;
        let url = request.current_url().clone();

        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        // In-memory sources go out as they are; only real streams are streamed
        let body = request.body.lock().as_ref().map(|b| match b.source() {
            Some(source) => DispatchBody::Bytes(source.to_bytes()),
            None => DispatchBody::Stream(b.stream()),
        });

        let max_redirections = match request.redirect {
            RequestRedirect::Follow => self.config.max_redirections,
            RequestRedirect::Manual | RequestRedirect::Error => 0,
        };

        let previous = request.url_list[..request.url_list.len() - 1].to_vec();
        let (handler, bridge, rx) = FetchHandler::new(
            params.id,
            url.clone(),
            previous,
            request.redirect,
            self.config.high_water_mark,
        );
        if !params.in_flight.lock().attach(bridge) {
            return Err(FetchError::Aborted);
        }

        log::trace!("Fetch[{}]: dispatching {} {}", params.id, request.method, url);
        self.dispatcher.dispatch(
            DispatchRequest {
                path,
                origin: url.origin().ascii_serialization(),
                method: request.method.clone(),
                body,
                headers: request.headers.as_header_map().clone(),
                signal: request.signal.clone(),
                max_redirections,
            },
            Box::new(handler),
        );

        match rx.await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) if err.is_abort() => Err(err),
            Ok(Err(FetchError::Network(reason))) => Ok(Response::network_error(reason)),
            Ok(Err(err)) => Ok(Response::network_error(err.to_string())),
            Err(_) => Ok(Response::network_error("transport dropped the request")),
        }
    }
}

/// Releases the body of a response that is not handed to the caller.
fn discard_body(response: &Response) {
    if let Some(body) = response.body() {
        let _ = body.cancel(FetchError::Aborted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::dispatcher::{MockDispatcher, MockRoute};
    use crate::net::headers::Headers;
    use crate::net::signal::AbortController;

    #[test]
    fn fetch_ids_are_unique() {
        assert_ne!(FetchId::new(), FetchId::new());
        assert_eq!(FetchId::new().to_string().len(), 36);
    }

    #[test]
    fn default_headers_fill_gaps_only() {
        let fetcher = Fetcher::new(MockDispatcher::new());

        let mut bare = Request::new("https://example.org/", RequestInit::new()).unwrap();
        fetcher.apply_default_headers(&mut bare).unwrap();
        assert_eq!(bare.headers().get("accept").as_deref(), Some("*/*"));
        assert_eq!(bare.headers().get("accept-language").as_deref(), Some("*"));
        assert!(bare.headers().has("user-agent"));

        let headers = Headers::from_pairs([("accept", "text/html"), ("user-agent", "test")]).unwrap();
        let mut custom = Request::new("https://example.org/", RequestInit::new().headers(headers)).unwrap();
        fetcher.apply_default_headers(&mut custom).unwrap();
        assert_eq!(custom.headers().get("accept").as_deref(), Some("text/html"));
        assert!(!custom.headers().has("accept-language"));
        assert_eq!(custom.headers().get("user-agent").as_deref(), Some("test"));
    }

    #[tokio::test]
    async fn descriptors_carry_path_query_origin_and_source_bytes() {
        let mock = Arc::new(
            MockDispatcher::new().route("https://example.org:8443/submit?x=1", MockRoute::new(204)),
        );
        let fetcher = Fetcher::new(mock.clone());
        let init = RequestInit::new().method("post").body("payload");
        let response = fetcher
            .fetch("https://example.org:8443/submit?x=1", init)
            .await
            .unwrap();
        assert_eq!(response.status(), 204);

        let sent = &mock.requests()[0];
        assert_eq!(sent.url, "https://example.org:8443/submit?x=1");
        assert_eq!(sent.method, Method::POST);
        assert_eq!(sent.max_redirections, 20);
        match &sent.body {
            Some(DispatchBody::Bytes(bytes)) => assert_eq!(&bytes[..], b"payload"),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[tokio::test]
    async fn finished_fetches_release_their_abort_observers() {
        let mock = Arc::new(
            MockDispatcher::new().route("https://example.org/data", MockRoute::new(200).chunk("a").chunk("b")),
        );
        let fetcher = Fetcher::new(mock.clone());
        let controller = AbortController::new();
        let shared = controller.signal();
        assert_eq!(shared.observer_count(), 0);

        for _ in 0..1000 {
            let request = Request::new(
                "https://example.org/data",
                RequestInit::new().signal(controller.signal()),
            )
            .unwrap();
            drop(request);
        }
        assert_eq!(shared.observer_count(), 0);

        for _ in 0..100 {
            let response = fetcher
                .fetch("https://example.org/data", RequestInit::new().signal(controller.signal()))
                .await
                .unwrap();
            assert_eq!(response.text().await.unwrap(), "ab");
        }
        assert_eq!(shared.observer_count(), 0);

        // Bodiless and failed fetches release theirs too
        mock.add_route("https://example.org/empty", MockRoute::new(204));
        mock.add_route(
            "https://example.org/broken",
            MockRoute::new(200).fail_before_headers(FetchError::Network("reset".into())),
        );
        for url in ["https://example.org/empty", "https://example.org/broken"] {
            let _ = fetcher
                .fetch(url, RequestInit::new().signal(controller.signal()))
                .await;
        }
        assert_eq!(shared.observer_count(), 0);
    }

    #[tokio::test]
    async fn streaming_bodies_stay_abortable_until_they_finish() {
        let mock = Arc::new(
            MockDispatcher::new().route("https://example.org/slow", MockRoute::new(200).chunk("a").hold_open()),
        );
        let fetcher = Fetcher::new(mock.clone());
        let controller = AbortController::new();

        let response = fetcher
            .fetch("https://example.org/slow", RequestInit::new().signal(controller.signal()))
            .await
            .unwrap();
        assert_eq!(controller.signal().observer_count(), 1);

        controller.abort();
        assert!(response.text().await.unwrap_err().is_abort());
        assert_eq!(controller.signal().observer_count(), 0);
    }

    #[tokio::test]
    async fn manual_and_error_modes_keep_redirects_away_from_the_transport() {
        let mock = Arc::new(MockDispatcher::new().route("https://example.org/", MockRoute::new(200)));
        let fetcher = Fetcher::new(mock.clone());
        fetcher
            .fetch("https://example.org/", RequestInit::new().redirect("manual"))
            .await
            .unwrap();
        assert_eq!(mock.requests()[0].max_redirections, 0);
    }

    #[tokio::test]
    async fn redirect_statuses_without_location_follow_the_mode() {
        let mock = Arc::new(MockDispatcher::new().route("https://example.org/odd", MockRoute::new(302)));
        let fetcher = Fetcher::new(mock.clone());

        let followed = fetcher
            .fetch("https://example.org/odd", RequestInit::new())
            .await
            .unwrap();
        assert_eq!(followed.status(), 302);

        let manual = fetcher
            .fetch("https://example.org/odd", RequestInit::new().redirect("manual"))
            .await
            .unwrap();
        assert_eq!(manual.status(), 0);
        assert_eq!(manual.response_type().as_str(), "opaqueredirect");

        let err = fetcher
            .fetch("https://example.org/odd", RequestInit::new().redirect("error"))
            .await
            .unwrap_err();
        assert!(err.is_network());
    }
}
