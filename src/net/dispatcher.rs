//! Transport contract.
//!
//! The fetch engine never talks to the wire itself. It hands a
//! [`DispatchRequest`] and a [`DispatchHandler`] to a [`Dispatcher`], which
//! reports progress back through the handler:
//!
//! ```text
//! on_connect(abort, context)            at most once, first
//! on_headers(status, headers, resume)   1xx blocks may precede the final one
//! on_data(chunk)*                       only after the final header block
//! on_complete() | on_error(err)         exactly one
//! ```
//!
//! `on_headers` and `on_data` return false to ask the transport to pause;
//! the transport continues once the `resume` callback is invoked. Calling
//! the `abort` callback makes the transport stop and report `on_error`.
//!
//! Two dispatchers ship with the crate: [`MockDispatcher`] (scripted, in
//! memory) and [`ReqwestDispatcher`] (feature `reqwest`).

mod mock;
#[cfg(feature = "reqwest")]
mod reqwest_transport;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Method};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::errors::{FetchError, Result};
use crate::net::body::ReadableStream;
use crate::net::signal::AbortSignal;

pub use mock::{MockDispatcher, MockRoute, RecordedRequest};
#[cfg(feature = "reqwest")]
pub use reqwest_transport::ReqwestDispatcher;

/// Stops the transport; the error is reported back through `on_error`.
pub type AbortFn = Arc<dyn Fn(FetchError) + Send + Sync>;

/// Lets a paused transport continue delivering data.
pub type ResumeFn = Arc<dyn Fn() + Send + Sync>;

/// Request body as handed to the transport.
#[derive(Debug, Clone)]
pub enum DispatchBody {
    /// In-memory payload; sent without going through a stream
    Bytes(Bytes),
    Stream(ReadableStream),
}

/// What the transport needs to know to issue a request.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// Path plus query, e.g. `/search?q=1`
    pub path: String,
    /// Serialised origin, e.g. `https://example.org:8443`
    pub origin: String,
    pub method: Method,
    pub body: Option<DispatchBody>,
    pub headers: HeaderMap,
    pub signal: AbortSignal,
    /// Hops the transport may follow on its own; 0 means report redirects
    pub max_redirections: u32,
}

impl DispatchRequest {
    /// Absolute URL rebuilt from origin and path.
    pub fn url(&self) -> Result<Url> {
        Ok(Url::parse(&format!("{}{}", self.origin, self.path))?)
    }
}

/// Extra information the transport passes along with `on_connect`.
#[derive(Debug, Clone, Default)]
pub struct DispatchContext {
    /// Redirect hops the transport followed by itself, in order
    pub history: Vec<Url>,
}

/// Receives transport events for one request.
pub trait DispatchHandler: Send {
    /// The transport is connected. An error tells the transport to give up;
    /// it then reports the error through `on_error`.
    fn on_connect(&mut self, abort: AbortFn, context: DispatchContext) -> Result<()>;

    /// A header block arrived. Returns false to pause until `resume` is called.
    fn on_headers(&mut self, status: u16, headers: HeaderMap, resume: ResumeFn) -> bool;

    /// A body chunk arrived. Returns false to pause until `resume` is called.
    fn on_data(&mut self, chunk: &[u8]) -> bool;

    fn on_complete(&mut self);

    fn on_error(&mut self, err: FetchError);
}

/// A transport.
pub trait Dispatcher: Send + Sync {
    /// Starts the request and returns immediately; progress is reported to
    /// `handler` from the transport's own task.
    fn dispatch(&self, request: DispatchRequest, handler: Box<dyn DispatchHandler>);
}

impl<D: Dispatcher + ?Sized> Dispatcher for Arc<D> {
    fn dispatch(&self, request: DispatchRequest, handler: Box<dyn DispatchHandler>) {
        (**self).dispatch(request, handler)
    }
}

/// Per-request abort and resume plumbing shared by the bundled transports.
pub(crate) struct Exchange {
    token: CancellationToken,
    reason: Mutex<Option<FetchError>>,
    /// Set by a pull, cleared when the handler accepts more data
    resume_requested: AtomicBool,
    resume: Notify,
}

impl Exchange {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            token: CancellationToken::new(),
            reason: Mutex::new(None),
            resume_requested: AtomicBool::new(false),
            resume: Notify::new(),
        })
    }

    pub(crate) fn abort_fn(self: &Arc<Self>) -> AbortFn {
        let exchange = self.clone();
        Arc::new(move |err| exchange.abort(err))
    }

    pub(crate) fn resume_fn(self: &Arc<Self>) -> ResumeFn {
        let exchange = self.clone();
        Arc::new(move || {
            exchange.resume_requested.store(true, Ordering::SeqCst);
            exchange.resume.notify_one();
        })
    }

    /// Forgets resume requests that arrived while the handler was still
    /// accepting data.
    pub(crate) fn clear_resume(&self) {
        self.resume_requested.store(false, Ordering::SeqCst);
    }

    pub(crate) fn abort(&self, err: FetchError) {
        {
            let mut reason = self.reason.lock();
            if reason.is_none() {
                *reason = Some(err);
            }
        }
        self.token.cancel();
    }

    pub(crate) fn abort_reason(&self) -> Option<FetchError> {
        self.reason.lock().clone()
    }

    /// Resolves with the abort reason once the exchange is aborted.
    pub(crate) async fn aborted(&self) -> FetchError {
        self.token.cancelled().await;
        self.abort_reason().unwrap_or(FetchError::Aborted)
    }

    /// Waits for a resume request. Returns the abort reason instead when the
    /// exchange gets aborted first.
    pub(crate) async fn wait_for_resume(&self) -> std::result::Result<(), FetchError> {
        loop {
            if self.resume_requested.swap(false, Ordering::SeqCst) {
                return Ok(());
            }
            // A leftover permit only wakes the loop; the flag decides
            tokio::select! {
                err = self.aborted() => return Err(err),
                _ = self.resume.notified() => {}
            }
        }
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("aborted", &self.token.is_cancelled())
            .finish()
    }
}
