//! [`Dispatcher`] on top of `reqwest`.
//!
//! Requests with `max_redirections == 0` go through a client that never
//! follows redirects, so the fetch engine sees them. Other requests use a
//! client that follows up to the configured number of hops by itself; the
//! final URL is then reported as a hop in the dispatch context.
//!
//! `on_connect` fires once the response head has arrived; before that the
//! exchange is canceled through the request's signal.

use futures::StreamExt;
use reqwest::redirect::Policy;

use super::{DispatchBody, DispatchContext, DispatchHandler, DispatchRequest, Dispatcher, Exchange};
use crate::config::DEFAULT_MAX_REDIRECTIONS;
use crate::errors::{FetchError, Result};

fn network_error(err: reqwest::Error) -> FetchError {
    FetchError::Network(err.to_string())
}

#[derive(Debug, Clone)]
pub struct ReqwestDispatcher {
    direct: reqwest::Client,
    following: reqwest::Client,
}

impl ReqwestDispatcher {
    pub fn new() -> Result<Self> {
        Self::with_max_redirections(DEFAULT_MAX_REDIRECTIONS)
    }

    /// Builds the dispatcher; `max` bounds the hops followed by the transport.
    pub fn with_max_redirections(max: u32) -> Result<Self> {
        let direct = reqwest::Client::builder()
            .redirect(Policy::none())
            .build()
            .map_err(network_error)?;
        let following = reqwest::Client::builder()
            .redirect(Policy::limited(max as usize))
            .build()
            .map_err(network_error)?;
        Ok(Self { direct, following })
    }

    /// Uses caller-provided clients. `direct` must not follow redirects.
    pub fn with_clients(direct: reqwest::Client, following: reqwest::Client) -> Self {
        Self { direct, following }
    }
}

impl Dispatcher for ReqwestDispatcher {
    fn dispatch(&self, request: DispatchRequest, handler: Box<dyn DispatchHandler>) {
        let client = if request.max_redirections > 0 {
            self.following.clone()
        } else {
            self.direct.clone()
        };
        tokio::spawn(run_exchange(client, request, handler));
    }
}

async fn run_exchange(client: reqwest::Client, request: DispatchRequest, mut handler: Box<dyn DispatchHandler>) {
    let exchange = Exchange::new();
    let resume = exchange.resume_fn();

    let url = match request.url() {
        Ok(url) => url,
        Err(err) => {
            handler.on_error(err);
            return;
        }
    };

    let mut builder = client
        .request(request.method.clone(), url.clone())
        .headers(request.headers.clone());
    match request.body {
        Some(DispatchBody::Bytes(bytes)) => builder = builder.body(bytes),
        Some(DispatchBody::Stream(stream)) => match stream.get_reader() {
            Ok(reader) => builder = builder.body(reqwest::Body::wrap_stream(reader)),
            Err(err) => {
                handler.on_error(err);
                return;
            }
        },
        None => {}
    }

    // The handler only learns about the connection once the response head is
    // in, so until then the request signal is what cancels the exchange
    let send = builder.send();
    let response = tokio::select! {
        _ = request.signal.cancelled() => {
            handler.on_error(FetchError::Aborted);
            return;
        }
        response = send => match response {
            Ok(response) => response,
            Err(err) => {
                handler.on_error(network_error(err));
                return;
            }
        },
    };

    let mut context = DispatchContext::default();
    if response.url() != &url {
        context.history.push(response.url().clone());
    }
    if let Err(err) = handler.on_connect(exchange.abort_fn(), context) {
        handler.on_error(err);
        return;
    }

    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let mut ready = handler.on_headers(status, headers, resume);
    let mut body = response.bytes_stream();

    loop {
        if !ready {
            if let Err(err) = exchange.wait_for_resume().await {
                handler.on_error(err);
                return;
            }
        }

        tokio::select! {
            err = exchange.aborted() => {
                handler.on_error(err);
                return;
            }
            chunk = body.next() => match chunk {
                Some(Ok(chunk)) => {
                    ready = handler.on_data(&chunk);
                    if ready {
                        exchange.clear_resume();
                    }
                }
                Some(Err(err)) => {
                    handler.on_error(network_error(err));
                    return;
                }
                None => {
                    handler.on_complete();
                    return;
                }
            },
        }
    }
}
