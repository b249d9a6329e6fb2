//! Streaming bridge between a callback-driven transport and a body stream.
//!
//! One [`FetchHandler`] serves one network request. Its session moves through
//!
//! ```text
//! Pending -> Connected -> Streaming -> Complete
//!    \___________\____________\_____> Errored
//! ```
//!
//! and upholds two invariants:
//! - the response callback fires exactly once, either with a response (on
//!   the final header block) or with an error,
//! - a body stream, once created, receives exactly one terminal signal.
//!
//! The body stream pulls by resuming the transport and cancels by aborting
//! it. The fetcher keeps a [`BridgeHandle`] to abort the exchange from the
//! outside; the transport-level abort runs at most once whoever asks first.

use std::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use http::header::LOCATION;
use http::{HeaderMap, StatusCode};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use url::Url;

use crate::errors::{FetchError, Result};
use crate::net::body::{Body, CancelReason, ReadableStream, StreamController, UnderlyingSource};
use crate::net::dispatcher::{AbortFn, DispatchContext, DispatchHandler, ResumeFn};
use crate::net::fetch::FetchId;
use crate::net::headers::Headers;
use crate::net::request::RequestRedirect;
use crate::net::response::{is_null_body_status, is_redirect_status, Response};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum BridgeState {
    Pending,
    Connected,
    Streaming,
    Complete,
    Errored,
}

impl BridgeState {
    fn is_terminal(self) -> bool {
        matches!(self, BridgeState::Complete | BridgeState::Errored)
    }
}

pub(crate) type ResponseCallback = oneshot::Sender<Result<Response>>;
type SettledHook = Box<dyn FnOnce() + Send>;

struct Session {
    state: BridgeState,
    callback: Option<ResponseCallback>,
    controller: Option<StreamController>,
    abort: Option<AbortFn>,
    /// Reason of an abort requested before the transport connected
    pending_abort: Option<FetchError>,
    transport_aborted: bool,
    /// Runs once the session turns `Complete` or `Errored`
    on_settled: Option<SettledHook>,
}

impl Session {
    /// Moves to a terminal state and hands out the settle hook.
    fn settle(&mut self, state: BridgeState) -> Option<SettledHook> {
        debug_assert!(state.is_terminal());
        self.state = state;
        self.on_settled.take()
    }

    /// Hands out the transport abort callback the first time only.
    fn take_transport_abort(&mut self) -> Option<AbortFn> {
        if self.transport_aborted {
            return None;
        }
        let abort = self.abort.clone()?;
        self.transport_aborted = true;
        Some(abort)
    }
}

type SharedSession = Arc<Mutex<Session>>;

/// Outside control over a running exchange.
#[derive(Clone)]
pub(crate) struct BridgeHandle {
    session: SharedSession,
}

impl BridgeHandle {
    /// Cancels the exchange. The pending response callback fails, an open
    /// body stream errors and the transport is aborted, each at most once.
    pub(crate) fn abort(&self, err: FetchError) {
        abort_session(&self.session, err);
    }

    pub(crate) fn state(&self) -> BridgeState {
        self.session.lock().state
    }

    /// Runs `f` once the exchange has completed or errored; right away when
    /// it already has.
    pub(crate) fn on_settled(&self, f: impl FnOnce() + Send + 'static) {
        let mut s = self.session.lock();
        if s.state.is_terminal() {
            drop(s);
            f();
        } else {
            s.on_settled = Some(Box::new(f));
        }
    }
}

impl fmt::Debug for BridgeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeHandle").field("state", &self.state()).finish()
    }
}

fn abort_session(session: &SharedSession, err: FetchError) {
    let (callback, controller, transport_abort, settled) = {
        let mut s = session.lock();
        if s.state.is_terminal() {
            return;
        }
        let settled = s.settle(BridgeState::Errored);
        let transport_abort = s.take_transport_abort();
        if transport_abort.is_none() && !s.transport_aborted {
            // Not connected yet; on_connect aborts right away
            s.pending_abort = Some(err.clone());
        }
        (s.callback.take(), s.controller.take(), transport_abort, settled)
    };

    if let Some(settled) = settled {
        settled();
    }
    if let Some(callback) = callback {
        let _ = callback.send(Err(err.clone()));
    }
    if let Some(controller) = controller {
        controller.error(err.clone());
    }
    if let Some(abort) = transport_abort {
        abort(err);
    }
}

/// Underlying source of a response body: pulling resumes the transport,
/// canceling aborts it.
struct BridgeSource {
    resume: ResumeFn,
    session: Weak<Mutex<Session>>,
}

impl UnderlyingSource for BridgeSource {
    fn pull(&self) {
        (self.resume)();
    }

    fn cancel(&self, reason: CancelReason) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        let (abort, settled) = {
            let mut s = session.lock();
            s.controller = None;
            let settled = if s.state.is_terminal() {
                None
            } else {
                s.settle(BridgeState::Errored)
            };
            (s.take_transport_abort(), settled)
        };
        if let Some(settled) = settled {
            settled();
        }
        if let Some(abort) = abort {
            abort(reason.into_error());
        }
    }
}

/// Transport handler of a single network request.
pub(crate) struct FetchHandler {
    id: FetchId,
    url: Url,
    /// URLs requested before `url` within the same fetch
    previous: Vec<Url>,
    redirect: RequestRedirect,
    high_water_mark: usize,
    context: DispatchContext,
    session: SharedSession,
}

impl FetchHandler {
    pub(crate) fn new(
        id: FetchId,
        url: Url,
        previous: Vec<Url>,
        redirect: RequestRedirect,
        high_water_mark: usize,
    ) -> (FetchHandler, BridgeHandle, oneshot::Receiver<Result<Response>>) {
        let (tx, rx) = oneshot::channel();
        let session = Arc::new(Mutex::new(Session {
            state: BridgeState::Pending,
            callback: Some(tx),
            controller: None,
            abort: None,
            pending_abort: None,
            transport_aborted: false,
            on_settled: None,
        }));
        let handler = FetchHandler {
            id,
            url,
            previous,
            redirect,
            high_water_mark,
            context: DispatchContext::default(),
            session: session.clone(),
        };
        (handler, BridgeHandle { session }, rx)
    }

    fn deliver(&self, callback: ResponseCallback, response: Response) {
        if callback.send(Ok(response)).is_err() {
            log::debug!("Fetch[{}]: response dropped by caller, aborting", self.id);
            abort_session(&self.session, FetchError::Aborted);
        }
    }

    /// Delivers a redirect outcome and releases the connection.
    fn finish_redirect(&self, callback: ResponseCallback, status: u16, headers: HeaderMap) {
        let response = match self.redirect {
            RequestRedirect::Manual => Response::opaque_redirect(self.url.clone()),
            RequestRedirect::Error => {
                Response::network_error(format!("redirect ({status}) while redirect mode is 'error'"))
            }
            RequestRedirect::Follow => Response::from_network(
                status,
                status_text(status),
                Headers::from(headers),
                self.url_list(),
                None,
            ),
        };

        let (abort, settled) = {
            let mut s = self.session.lock();
            let settled = s.settle(BridgeState::Complete);
            (s.take_transport_abort(), settled)
        };
        if let Some(settled) = settled {
            settled();
        }
        let _ = callback.send(Ok(response));
        if let Some(abort) = abort {
            abort(FetchError::Aborted);
        }
    }

    fn url_list(&self) -> Vec<Url> {
        let mut list = Vec::with_capacity(self.previous.len() + 1 + self.context.history.len());
        list.extend(self.previous.iter().cloned());
        list.push(self.url.clone());
        list.extend(self.context.history.iter().cloned());
        list
    }
}

fn status_text(status: u16) -> String {
    StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("")
        .to_string()
}

impl DispatchHandler for FetchHandler {
    fn on_connect(&mut self, abort: AbortFn, context: DispatchContext) -> Result<()> {
        let pending = {
            let mut s = self.session.lock();
            if s.callback.is_none() {
                s.transport_aborted = true;
                Some(s.pending_abort.take().unwrap_or(FetchError::Aborted))
            } else {
                s.abort = Some(abort.clone());
                s.state = BridgeState::Connected;
                None
            }
        };

        if let Some(err) = pending {
            log::debug!("Fetch[{}]: connected after abort, dropping connection", self.id);
            abort(err);
            return Err(FetchError::Aborted);
        }

        self.context = context;
        Ok(())
    }

    fn on_headers(&mut self, status: u16, headers: HeaderMap, resume: ResumeFn) -> bool {
        if status < 200 {
            log::trace!("Fetch[{}]: ignoring informational status {status}", self.id);
            return true;
        }

        let callback = {
            let mut s = self.session.lock();
            if s.state != BridgeState::Connected {
                return false;
            }
            s.callback.take()
        };
        let Some(callback) = callback else {
            return false;
        };

        log::debug!("Fetch[{}]: {} {}", self.id, status, self.url);

        if is_redirect_status(status) && headers.contains_key(LOCATION) {
            self.finish_redirect(callback, status, headers);
            return false;
        }

        let (body, controller) = if is_null_body_status(status) {
            (None, None)
        } else {
            let source = Arc::new(BridgeSource {
                resume,
                session: Arc::downgrade(&self.session),
            });
            let (stream, controller) = ReadableStream::new(self.high_water_mark, Some(source));
            (Some(Body::from_stream(stream)), Some(controller))
        };
        let wants_pull = controller.is_some();

        {
            let mut s = self.session.lock();
            s.state = BridgeState::Streaming;
            s.controller = controller;
        }

        let response = Response::from_network(
            status,
            status_text(status),
            Headers::from(headers),
            self.url_list(),
            body,
        );
        self.deliver(callback, response);

        // Data flows once the body is pulled for the first time
        !wants_pull
    }

    fn on_data(&mut self, chunk: &[u8]) -> bool {
        let controller = {
            let s = self.session.lock();
            if s.state != BridgeState::Streaming {
                return false;
            }
            s.controller.clone()
        };
        let Some(controller) = controller else {
            // Bodiless response; nothing to deliver the data to
            return true;
        };

        // Copy so the transport is free to reuse its buffer
        if controller.enqueue(Bytes::copy_from_slice(chunk)).is_err() {
            return false;
        }
        controller.desired_size() > 0
    }

    fn on_complete(&mut self) {
        let (callback, controller, settled) = {
            let mut s = self.session.lock();
            if s.state.is_terminal() {
                return;
            }
            let settled = s.settle(BridgeState::Complete);
            (s.callback.take(), s.controller.take(), settled)
        };

        log::trace!("Fetch[{}]: transfer complete", self.id);
        if let Some(settled) = settled {
            settled();
        }
        if let Some(callback) = callback {
            let _ = callback.send(Err(FetchError::Network(
                "connection closed before the response headers".into(),
            )));
        }
        if let Some(controller) = controller {
            controller.close();
        }
    }

    fn on_error(&mut self, err: FetchError) {
        let (callback, controller, settled) = {
            let mut s = self.session.lock();
            if s.state.is_terminal() {
                return;
            }
            let settled = s.settle(BridgeState::Errored);
            (s.callback.take(), s.controller.take(), settled)
        };

        log::debug!("Fetch[{}]: transport error: {}", self.id, err);
        if let Some(settled) = settled {
            settled();
        }
        if let Some(callback) = callback {
            let _ = callback.send(Err(err.clone()));
        }
        if let Some(controller) = controller {
            controller.error(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::response::ResponseType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Transport {
        aborts: Arc<Mutex<Vec<FetchError>>>,
        resumes: Arc<AtomicUsize>,
    }

    impl Transport {
        fn new() -> Self {
            Self {
                aborts: Arc::new(Mutex::new(Vec::new())),
                resumes: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn abort_fn(&self) -> AbortFn {
            let aborts = self.aborts.clone();
            Arc::new(move |err| aborts.lock().push(err))
        }

        fn resume_fn(&self) -> ResumeFn {
            let resumes = self.resumes.clone();
            Arc::new(move || {
                resumes.fetch_add(1, Ordering::SeqCst);
            })
        }

        fn aborts(&self) -> Vec<FetchError> {
            self.aborts.lock().clone()
        }
    }

    fn handler(
        redirect: RequestRedirect,
        hwm: usize,
    ) -> (FetchHandler, BridgeHandle, oneshot::Receiver<Result<Response>>) {
        FetchHandler::new(
            FetchId::new(),
            Url::parse("https://example.org/start").unwrap(),
            Vec::new(),
            redirect,
            hwm,
        )
    }

    fn location(to: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(LOCATION, to.parse().unwrap());
        headers
    }

    #[tokio::test]
    async fn streams_chunks_after_the_final_header_block() {
        let transport = Transport::new();
        let (mut h, bridge, rx) = handler(RequestRedirect::Follow, 1024);

        h.on_connect(transport.abort_fn(), DispatchContext::default()).unwrap();
        assert!(h.on_headers(103, HeaderMap::new(), transport.resume_fn()));
        assert_eq!(bridge.state(), BridgeState::Connected);

        assert!(!h.on_headers(200, HeaderMap::new(), transport.resume_fn()));
        assert_eq!(bridge.state(), BridgeState::Streaming);
        let response = rx.await.unwrap().unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.status_text(), "OK");

        assert!(h.on_data(b"one"));
        assert!(h.on_data(b"two"));
        h.on_complete();
        assert_eq!(bridge.state(), BridgeState::Complete);

        assert_eq!(response.text().await.unwrap(), "onetwo");
        assert!(transport.aborts().is_empty());
    }

    #[tokio::test]
    async fn on_data_reports_backpressure() {
        let transport = Transport::new();
        let (mut h, _bridge, rx) = handler(RequestRedirect::Follow, 4);
        h.on_connect(transport.abort_fn(), DispatchContext::default()).unwrap();
        h.on_headers(200, HeaderMap::new(), transport.resume_fn());
        let response = rx.await.unwrap().unwrap();

        assert!(h.on_data(b"ab"));
        assert!(!h.on_data(b"cd"));

        let mut reader = response.body().unwrap().get_reader().unwrap();
        assert_eq!(reader.read().await.unwrap().unwrap(), Bytes::from_static(b"ab"));
        assert_eq!(reader.read().await.unwrap().unwrap(), Bytes::from_static(b"cd"));
        assert!(transport.resumes.load(Ordering::SeqCst) >= 1);
        assert!(h.on_data(b"e"));
    }

    const REDIRECT_STATUSES: [u16; 5] = [301, 302, 303, 307, 308];

    #[tokio::test]
    async fn manual_redirects_become_opaque() {
        for status in REDIRECT_STATUSES {
            let transport = Transport::new();
            let (mut h, bridge, rx) = handler(RequestRedirect::Manual, 1024);
            h.on_connect(transport.abort_fn(), DispatchContext::default()).unwrap();
            assert!(!h.on_headers(status, location("/next"), transport.resume_fn()));

            let response = rx.await.unwrap().unwrap();
            assert_eq!(response.response_type(), ResponseType::OpaqueRedirect, "{status}");
            assert_eq!(response.status(), 0, "{status}");
            assert_eq!(response.url_list().len(), 1, "{status}");
            assert!(response.body().is_none());
            assert_eq!(bridge.state(), BridgeState::Complete);
            assert_eq!(transport.aborts().len(), 1);

            // The transport reports the released connection; nothing changes
            h.on_error(FetchError::Aborted);
            assert_eq!(bridge.state(), BridgeState::Complete);
        }
    }

    #[tokio::test]
    async fn error_mode_redirects_are_network_errors() {
        for status in REDIRECT_STATUSES {
            let transport = Transport::new();
            let (mut h, bridge, rx) = handler(RequestRedirect::Error, 1024);
            h.on_connect(transport.abort_fn(), DispatchContext::default()).unwrap();
            h.on_headers(status, location("https://elsewhere.example/"), transport.resume_fn());

            let response = rx.await.unwrap().unwrap();
            assert!(response.is_network_error(), "{status}");
            assert_eq!(response.status(), 0, "{status}");
            assert_eq!(bridge.state(), BridgeState::Complete);
        }
    }

    #[tokio::test]
    async fn follow_mode_hands_back_a_bodiless_redirect() {
        let transport = Transport::new();
        let (mut h, _bridge, rx) = handler(RequestRedirect::Follow, 1024);
        h.on_connect(transport.abort_fn(), DispatchContext::default()).unwrap();
        h.on_headers(307, location("/next"), transport.resume_fn());

        let response = rx.await.unwrap().unwrap();
        assert_eq!(response.status(), 307);
        assert_eq!(response.headers().get("location").as_deref(), Some("/next"));
        assert!(response.body().is_none());
    }

    #[tokio::test]
    async fn location_on_a_non_redirect_status_is_a_plain_response() {
        let transport = Transport::new();
        let (mut h, _bridge, rx) = handler(RequestRedirect::Manual, 1024);
        h.on_connect(transport.abort_fn(), DispatchContext::default()).unwrap();
        h.on_headers(201, location("/created"), transport.resume_fn());

        let response = rx.await.unwrap().unwrap();
        assert_eq!(response.status(), 201);
        assert_eq!(response.response_type(), ResponseType::Default);
    }

    #[tokio::test]
    async fn url_list_includes_transport_hops() {
        let transport = Transport::new();
        let (mut h, _bridge, rx) = handler(RequestRedirect::Follow, 1024);
        let hop = Url::parse("https://example.org/final").unwrap();
        h.on_connect(transport.abort_fn(), DispatchContext { history: vec![hop.clone()] })
            .unwrap();
        h.on_headers(204, HeaderMap::new(), transport.resume_fn());

        let response = rx.await.unwrap().unwrap();
        assert!(response.redirected());
        assert_eq!(response.url(), Some(&hop));
        assert!(response.body().is_none());
    }

    #[tokio::test]
    async fn errors_before_headers_fail_the_callback() {
        let transport = Transport::new();
        let (mut h, bridge, rx) = handler(RequestRedirect::Follow, 1024);
        h.on_connect(transport.abort_fn(), DispatchContext::default()).unwrap();
        h.on_error(FetchError::Network("reset".into()));

        assert_eq!(rx.await.unwrap().unwrap_err(), FetchError::Network("reset".into()));
        assert_eq!(bridge.state(), BridgeState::Errored);
    }

    #[tokio::test]
    async fn errors_after_headers_error_the_stream() {
        let transport = Transport::new();
        let (mut h, _bridge, rx) = handler(RequestRedirect::Follow, 1024);
        h.on_connect(transport.abort_fn(), DispatchContext::default()).unwrap();
        h.on_headers(200, HeaderMap::new(), transport.resume_fn());
        let response = rx.await.unwrap().unwrap();

        h.on_data(b"partial");
        h.on_error(FetchError::Network("reset".into()));
        h.on_complete();

        let err = response.bytes().await.unwrap_err();
        assert_eq!(err, FetchError::Network("reset".into()));
    }

    #[tokio::test]
    async fn canceling_the_body_aborts_the_transport_with_a_normalized_reason() {
        let transport = Transport::new();
        let (mut h, _bridge, rx) = handler(RequestRedirect::Follow, 1024);
        h.on_connect(transport.abort_fn(), DispatchContext::default()).unwrap();
        h.on_headers(200, HeaderMap::new(), transport.resume_fn());
        let response = rx.await.unwrap().unwrap();

        response.body().unwrap().cancel("not interested").unwrap();
        assert_eq!(transport.aborts(), vec![FetchError::Stream("not interested".into())]);
        assert!(!h.on_data(b"late"));
    }

    #[tokio::test]
    async fn settle_hook_runs_once_when_the_body_completes() {
        let transport = Transport::new();
        let (mut h, bridge, rx) = handler(RequestRedirect::Follow, 1024);
        h.on_connect(transport.abort_fn(), DispatchContext::default()).unwrap();
        h.on_headers(200, HeaderMap::new(), transport.resume_fn());
        let response = rx.await.unwrap().unwrap();

        let settled = Arc::new(AtomicUsize::new(0));
        let hits = settled.clone();
        bridge.on_settled(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        });
        h.on_data(b"body");
        assert_eq!(settled.load(Ordering::SeqCst), 0);

        h.on_complete();
        h.on_error(FetchError::Aborted);
        bridge.abort(FetchError::Aborted);
        assert_eq!(settled.load(Ordering::SeqCst), 1);
        assert_eq!(response.text().await.unwrap(), "body");
    }

    #[tokio::test]
    async fn settle_hook_runs_on_cancel_and_immediately_once_settled() {
        let transport = Transport::new();
        let (mut h, bridge, rx) = handler(RequestRedirect::Follow, 1024);
        h.on_connect(transport.abort_fn(), DispatchContext::default()).unwrap();
        h.on_headers(200, HeaderMap::new(), transport.resume_fn());
        let response = rx.await.unwrap().unwrap();

        let settled = Arc::new(AtomicUsize::new(0));
        let hits = settled.clone();
        bridge.on_settled(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        });
        response.body().unwrap().cancel("done").unwrap();
        assert_eq!(settled.load(Ordering::SeqCst), 1);

        let hits = settled.clone();
        bridge.on_settled(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(settled.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn abort_before_connect_drops_the_connection_on_arrival() {
        let transport = Transport::new();
        let (mut h, bridge, rx) = handler(RequestRedirect::Follow, 1024);
        bridge.abort(FetchError::Aborted);
        assert_eq!(rx.await.unwrap().unwrap_err(), FetchError::Aborted);

        let err = h.on_connect(transport.abort_fn(), DispatchContext::default()).unwrap_err();
        assert!(err.is_abort());
        assert_eq!(transport.aborts(), vec![FetchError::Aborted]);
    }

    #[tokio::test]
    async fn repeated_aborts_reach_the_transport_once() {
        let transport = Transport::new();
        let (mut h, bridge, rx) = handler(RequestRedirect::Follow, 1024);
        h.on_connect(transport.abort_fn(), DispatchContext::default()).unwrap();
        h.on_headers(200, HeaderMap::new(), transport.resume_fn());
        let response = rx.await.unwrap().unwrap();

        bridge.abort(FetchError::Aborted);
        bridge.abort(FetchError::Aborted);
        h.on_error(FetchError::Aborted);

        assert_eq!(transport.aborts().len(), 1);
        assert!(response.bytes().await.unwrap_err().is_abort());
    }
}
