//! The `Request` entity.
//!
//! A request is built from a [`RequestInfo`] (a URL or an existing request)
//! and a [`RequestInit`] carrying overrides. Construction validates every
//! option up front, so a request that exists is always well formed:
//!
//! - the URL is absolute and carries no credentials,
//! - the method is uppercase and known,
//! - `GET` and `HEAD` requests never carry a body,
//! - `only-if-cached` is only used together with `same-origin`.
//!
//! Each request owns a fresh [`AbortSignal`]. When a signal is passed in (or
//! the request is built from another request) the fresh signal follows it.

mod options;

use http::Method;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use url::Url;

use crate::errors::{FetchError, Result};
use crate::net::body::{self, extract, Body, BodyInit, ReadableStream};
use crate::net::headers::Headers;
use crate::net::signal::AbortSignal;

pub use options::{
    normalize_method, Referrer, ReferrerPolicy, RequestCache, RequestCredentials, RequestMode,
    RequestRedirect, METHODS,
};

/// Input of [`Request::new`] and [`Fetcher::fetch`](crate::Fetcher::fetch).
#[derive(Debug, Clone, Copy)]
pub enum RequestInfo<'a> {
    Url(&'a str),
    Request(&'a Request),
}

impl<'a> From<&'a str> for RequestInfo<'a> {
    fn from(url: &'a str) -> Self {
        RequestInfo::Url(url)
    }
}

impl<'a> From<&'a String> for RequestInfo<'a> {
    fn from(url: &'a String) -> Self {
        RequestInfo::Url(url.as_str())
    }
}

impl<'a> From<&'a Url> for RequestInfo<'a> {
    fn from(url: &'a Url) -> Self {
        RequestInfo::Url(url.as_str())
    }
}

impl<'a> From<&'a Request> for RequestInfo<'a> {
    fn from(request: &'a Request) -> Self {
        RequestInfo::Request(request)
    }
}

/// Overrides applied while constructing a request.
///
/// Enumerated options are given as their keywords (or as the typed enum,
/// which converts into one) and validated by [`Request::new`].
#[derive(Debug, Default)]
pub struct RequestInit {
    pub method: Option<String>,
    pub headers: Option<Headers>,
    pub body: Option<BodyInit>,
    pub referrer: Option<String>,
    pub referrer_policy: Option<String>,
    pub mode: Option<String>,
    pub credentials: Option<String>,
    pub cache: Option<String>,
    pub redirect: Option<String>,
    pub integrity: Option<String>,
    pub keepalive: Option<bool>,
    pub signal: Option<AbortSignal>,
}

impl RequestInit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn body(mut self, body: impl Into<BodyInit>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn referrer(mut self, referrer: impl Into<String>) -> Self {
        self.referrer = Some(referrer.into());
        self
    }

    pub fn referrer_policy(mut self, policy: impl Into<String>) -> Self {
        self.referrer_policy = Some(policy.into());
        self
    }

    pub fn mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    pub fn credentials(mut self, credentials: impl Into<String>) -> Self {
        self.credentials = Some(credentials.into());
        self
    }

    pub fn cache(mut self, cache: impl Into<String>) -> Self {
        self.cache = Some(cache.into());
        self
    }

    pub fn redirect(mut self, redirect: impl Into<String>) -> Self {
        self.redirect = Some(redirect.into());
        self
    }

    pub fn integrity(mut self, integrity: impl Into<String>) -> Self {
        self.integrity = Some(integrity.into());
        self
    }

    pub fn keepalive(mut self, keepalive: bool) -> Self {
        self.keepalive = Some(keepalive);
        self
    }

    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    /// True when no option is set at all.
    pub fn is_empty(&self) -> bool {
        self.method.is_none()
            && self.headers.is_none()
            && self.body.is_none()
            && self.referrer.is_none()
            && self.referrer_policy.is_none()
            && self.mode.is_none()
            && self.credentials.is_none()
            && self.cache.is_none()
            && self.redirect.is_none()
            && self.integrity.is_none()
            && self.keepalive.is_none()
            && self.signal.is_none()
    }
}

#[derive(Debug)]
pub struct Request {
    pub(crate) method: Method,
    /// First entry is the request URL, the last one the current URL
    pub(crate) url_list: Vec<Url>,
    pub(crate) headers: Headers,
    pub(crate) referrer: Referrer,
    pub(crate) referrer_policy: ReferrerPolicy,
    pub(crate) mode: RequestMode,
    pub(crate) credentials: RequestCredentials,
    pub(crate) cache: RequestCache,
    pub(crate) redirect: RequestRedirect,
    pub(crate) integrity: String,
    pub(crate) keepalive: bool,
    pub(crate) signal: AbortSignal,
    /// Guarded so that a request used as input of another request can hand
    /// out a tee branch through a shared reference
    pub(crate) body: Mutex<Option<Body>>,
}

fn parse_request_url(input: &str) -> Result<Url> {
    let url = Url::parse(input)?;
    if !url.username().is_empty() || url.password().is_some() {
        return Err(FetchError::type_error(format!(
            "request URL '{input}' must not include credentials"
        )));
    }
    Ok(url)
}

impl Request {
    fn for_url(url: Url) -> Self {
        Self {
            method: Method::GET,
            url_list: vec![url],
            headers: Headers::new(),
            referrer: Referrer::Client,
            referrer_policy: ReferrerPolicy::Unset,
            mode: RequestMode::Cors,
            credentials: RequestCredentials::SameOrigin,
            cache: RequestCache::Default,
            redirect: RequestRedirect::Follow,
            integrity: String::new(),
            keepalive: false,
            signal: AbortSignal::new(),
            body: Mutex::new(None),
        }
    }

    /// Copies every field except the body, attaching `signal`.
    fn copy_without_body(&self, signal: AbortSignal) -> Self {
        Self {
            method: self.method.clone(),
            url_list: self.url_list.clone(),
            headers: self.headers.clone(),
            referrer: self.referrer.clone(),
            referrer_policy: self.referrer_policy,
            mode: self.mode,
            credentials: self.credentials,
            cache: self.cache,
            redirect: self.redirect,
            integrity: self.integrity.clone(),
            keepalive: self.keepalive,
            signal,
            body: Mutex::new(None),
        }
    }

    pub fn new<'a>(input: impl Into<RequestInfo<'a>>, init: RequestInit) -> Result<Request> {
        let input = input.into();
        let init_is_empty = init.is_empty();

        let (mut req, fallback_mode, source) = match input {
            RequestInfo::Url(url) => (Request::for_url(parse_request_url(url)?), Some(RequestMode::Cors), None),
            RequestInfo::Request(src) => (src.copy_without_body(AbortSignal::new()), None, Some(src)),
        };

        if !init_is_empty {
            if req.mode == RequestMode::Navigate {
                req.mode = RequestMode::SameOrigin;
            }
            req.referrer = Referrer::Client;
            req.referrer_policy = ReferrerPolicy::Unset;
        }

        if let Some(referrer) = &init.referrer {
            req.referrer = Referrer::parse(referrer)?;
        }
        if let Some(policy) = &init.referrer_policy {
            req.referrer_policy = policy.parse()?;
        }

        let mode = match &init.mode {
            Some(mode) => Some(mode.parse::<RequestMode>()?),
            None => fallback_mode,
        };
        if mode == Some(RequestMode::Navigate) {
            return Err(FetchError::type_error("a request cannot be constructed with mode 'navigate'"));
        }
        if let Some(mode) = mode {
            req.mode = mode;
        }

        if let Some(credentials) = &init.credentials {
            req.credentials = credentials.parse()?;
        }
        if let Some(cache) = &init.cache {
            req.cache = cache.parse()?;
        }
        if req.cache == RequestCache::OnlyIfCached && req.mode != RequestMode::SameOrigin {
            return Err(FetchError::type_error(
                "'only-if-cached' can be set only with 'same-origin' mode",
            ));
        }
        if let Some(redirect) = &init.redirect {
            req.redirect = redirect.parse()?;
        }
        if let Some(integrity) = init.integrity {
            req.integrity = integrity;
        }
        if let Some(keepalive) = init.keepalive {
            req.keepalive = keepalive;
        }
        if let Some(method) = &init.method {
            req.method = normalize_method(method)?;
        }

        let followed = init.signal.or_else(|| source.map(|src| src.signal.clone()));
        req.signal = match followed {
            Some(signal) => signal.follow(),
            None => AbortSignal::new(),
        };

        if let Some(headers) = init.headers {
            req.headers = headers;
        }

        let source_has_body = source.map_or(false, |src| src.body.lock().is_some());
        if (init.body.is_some() || source_has_body)
            && (req.method == Method::GET || req.method == Method::HEAD)
        {
            return Err(FetchError::type_error("request with GET/HEAD method cannot have a body"));
        }

        let mut init_body = None;
        if let Some(body_init) = init.body {
            let (body, content_type) = extract(body_init)?;
            if let Some(content_type) = content_type {
                if !req.headers.has("content-type") {
                    req.headers.append("content-type", &content_type)?;
                }
            }
            init_body = Some(body);
        }

        let streaming_only = match &init_body {
            Some(body) => body.source().is_none(),
            None => source.map_or(false, |src| {
                src.body.lock().as_ref().map_or(false, |b| b.source().is_none())
            }),
        };
        if streaming_only && !matches!(req.mode, RequestMode::SameOrigin | RequestMode::Cors) {
            return Err(FetchError::type_error(
                "a streaming body requires mode 'same-origin' or 'cors'",
            ));
        }

        let body = match (init_body, source) {
            (Some(body), _) => Some(body),
            (None, Some(src)) => {
                let mut guard = src.body.lock();
                match guard.as_mut() {
                    Some(input_body) => {
                        if input_body.is_unusable() {
                            return Err(FetchError::type_error("input request body is unusable"));
                        }
                        Some(input_body.try_clone()?)
                    }
                    None => None,
                }
            }
            (None, None) => None,
        };
        req.body = Mutex::new(body);

        Ok(req)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url_list[0]
    }

    /// The URL the request currently points at (differs from `url()` after redirects).
    pub fn current_url(&self) -> &Url {
        &self.url_list[self.url_list.len() - 1]
    }

    pub fn url_list(&self) -> &[Url] {
        &self.url_list
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn destination(&self) -> &str {
        ""
    }

    pub fn referrer(&self) -> &Referrer {
        &self.referrer
    }

    pub fn referrer_policy(&self) -> ReferrerPolicy {
        self.referrer_policy
    }

    pub fn mode(&self) -> RequestMode {
        self.mode
    }

    pub fn credentials(&self) -> RequestCredentials {
        self.credentials
    }

    pub fn cache(&self) -> RequestCache {
        self.cache
    }

    pub fn redirect(&self) -> RequestRedirect {
        self.redirect
    }

    pub fn integrity(&self) -> &str {
        &self.integrity
    }

    pub fn keepalive(&self) -> bool {
        self.keepalive
    }

    pub fn is_reload_navigation(&self) -> bool {
        false
    }

    pub fn is_history_navigation(&self) -> bool {
        false
    }

    pub fn signal(&self) -> &AbortSignal {
        &self.signal
    }

    /// Body stream, if the request has a body.
    pub fn body(&self) -> Option<ReadableStream> {
        self.body.lock().as_ref().map(|b| b.stream())
    }

    pub fn body_used(&self) -> bool {
        self.body.lock().as_ref().map_or(false, |b| b.is_disturbed())
    }

    pub async fn bytes(&self) -> Result<bytes::Bytes> {
        body::consume(self.body()).await
    }

    pub async fn text(&self) -> Result<String> {
        body::consume_text(self.body()).await
    }

    pub async fn json<T: DeserializeOwned>(&self) -> Result<T> {
        body::consume_json(self.body()).await
    }

    /// Copies the request. The body is teed and the copy's signal follows ours.
    pub fn try_clone(&self) -> Result<Request> {
        let body = {
            let mut guard = self.body.lock();
            match guard.as_mut() {
                Some(b) => Some(b.try_clone()?),
                None => None,
            }
        };
        let copy = self.copy_without_body(self.signal.follow());
        *copy.body.lock() = body;
        Ok(copy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::signal::AbortController;

    #[test]
    fn url_requests_get_defaults() {
        let req = Request::new("https://example.org/a?b=c", RequestInit::new()).unwrap();
        assert_eq!(req.method(), Method::GET);
        assert_eq!(req.url().as_str(), "https://example.org/a?b=c");
        assert_eq!(req.mode(), RequestMode::Cors);
        assert_eq!(req.redirect(), RequestRedirect::Follow);
        assert_eq!(req.cache(), RequestCache::Default);
        assert_eq!(req.referrer(), &Referrer::Client);
        assert!(req.headers().is_empty());
        assert!(req.body().is_none());
        assert_eq!(req.destination(), "");
    }

    #[test]
    fn invalid_urls_and_credentials_are_rejected() {
        assert!(Request::new("not a url", RequestInit::new()).unwrap_err().is_type_error());
        assert!(Request::new("https://user:pw@example.org/", RequestInit::new())
            .unwrap_err()
            .is_type_error());
    }

    #[test]
    fn method_is_uppercased_and_validated() {
        let req = Request::new("https://example.org", RequestInit::new().method("post")).unwrap();
        assert_eq!(req.method(), Method::POST);

        let err = Request::new("https://example.org", RequestInit::new().method("yeet")).unwrap_err();
        assert!(err.is_type_error());
    }

    #[test]
    fn get_and_head_cannot_carry_bodies() {
        for method in ["GET", "head"] {
            for body in [BodyInit::from("x"), BodyInit::from(Vec::<u8>::new())] {
                let err = Request::new(
                    "https://example.org",
                    RequestInit::new().method(method).body(body),
                )
                .unwrap_err();
                assert!(err.is_type_error());
            }
        }
        let err = Request::new("https://example.org", RequestInit::new().body("x")).unwrap_err();
        assert!(err.is_type_error());
    }

    #[test]
    fn enum_options_are_validated() {
        let err = Request::new("https://example.org", RequestInit::new().mode("bogus")).unwrap_err();
        assert!(err.is_type_error());
        let err = Request::new("https://example.org", RequestInit::new().mode(RequestMode::Navigate))
            .unwrap_err();
        assert!(err.is_type_error());
        let err = Request::new("https://example.org", RequestInit::new().cache("only-if-cached"))
            .unwrap_err();
        assert!(err.is_type_error());

        let req = Request::new(
            "https://example.org",
            RequestInit::new().cache("only-if-cached").mode("same-origin").redirect("manual"),
        )
        .unwrap();
        assert_eq!(req.cache(), RequestCache::OnlyIfCached);
        assert_eq!(req.redirect(), RequestRedirect::Manual);
    }

    #[test]
    fn text_bodies_set_content_type_unless_present() {
        let req = Request::new("https://example.org", RequestInit::new().method("POST").body("hi")).unwrap();
        assert_eq!(req.headers().get("content-type").as_deref(), Some("text/plain;charset=UTF-8"));

        let headers = Headers::from_pairs([("Content-Type", "application/x-custom")]).unwrap();
        let req = Request::new(
            "https://example.org",
            RequestInit::new().method("POST").headers(headers).body("hi"),
        )
        .unwrap();
        assert_eq!(req.headers().get("content-type").as_deref(), Some("application/x-custom"));
    }

    #[test]
    fn stream_bodies_need_cors_or_same_origin() {
        let (stream, _ctrl) = ReadableStream::new(16, None);
        let err = Request::new(
            "https://example.org",
            RequestInit::new().method("POST").mode("no-cors").body(stream),
        )
        .unwrap_err();
        assert!(err.is_type_error());
    }

    #[test]
    fn non_empty_init_resets_the_referrer() {
        let base = Request::new(
            "https://example.org",
            RequestInit::new().referrer("https://ref.example/").referrer_policy("origin"),
        )
        .unwrap();
        assert!(matches!(base.referrer(), Referrer::Url(_)));

        let copy = Request::new(&base, RequestInit::new()).unwrap();
        assert_eq!(copy.referrer_policy(), ReferrerPolicy::Origin);

        let reset = Request::new(&base, RequestInit::new().keepalive(true)).unwrap();
        assert_eq!(reset.referrer(), &Referrer::Client);
        assert_eq!(reset.referrer_policy(), ReferrerPolicy::Unset);
        assert!(reset.keepalive());
    }

    #[tokio::test]
    async fn requests_built_from_requests_share_the_body_through_a_tee() {
        let (stream, ctrl) = ReadableStream::new(1024, None);
        let original = Request::new(
            "https://example.org",
            RequestInit::new().method("PUT").body(stream),
        )
        .unwrap();
        let derived = Request::new(&original, RequestInit::new()).unwrap();

        ctrl.enqueue(bytes::Bytes::from_static(b"payload")).unwrap();
        ctrl.close();

        assert_eq!(derived.method(), Method::PUT);
        assert_eq!(derived.text().await.unwrap(), "payload");
        assert_eq!(original.text().await.unwrap(), "payload");
    }

    #[tokio::test]
    async fn used_bodies_cannot_seed_new_requests() {
        let original = Request::new("https://example.org", RequestInit::new().method("POST").body("x")).unwrap();
        original.text().await.unwrap();
        assert!(original.body_used());

        assert!(Request::new(&original, RequestInit::new()).unwrap_err().is_type_error());
        assert!(original.try_clone().unwrap_err().is_type_error());
    }

    #[tokio::test]
    async fn clones_read_independently_and_follow_the_signal() {
        let controller = AbortController::new();
        let req = Request::new(
            "https://example.org",
            RequestInit::new().method("POST").body("same bytes").signal(controller.signal()),
        )
        .unwrap();
        let clone = req.try_clone().unwrap();

        assert_eq!(clone.text().await.unwrap(), "same bytes");
        assert_eq!(req.text().await.unwrap(), "same bytes");

        assert!(!clone.signal().is_aborted());
        controller.abort();
        assert!(req.signal().is_aborted());
        assert!(clone.signal().is_aborted());
    }

    #[test]
    fn dropping_a_clone_aborts_nothing() {
        let controller = AbortController::new();
        let req = Request::new("https://example.org", RequestInit::new().signal(controller.signal())).unwrap();
        let clone = req.try_clone().unwrap();
        drop(clone);
        assert!(!req.signal().is_aborted());
        assert!(!controller.signal().is_aborted());
    }
}
