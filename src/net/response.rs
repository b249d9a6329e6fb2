//! The `Response` entity.
//!
//! Responses either come from the network (with a body that may still be
//! streaming in) or are built directly through [`Response::new`] and the
//! [`error`](Response::error), [`redirect`](Response::redirect) and
//! [`json`](Response::json) factories.
//!
//! ## Notes
//! - A *network error* is a response with status `0`, type `error` and no
//!   body. The fetcher turns it into [`FetchError::Network`] before it
//!   reaches a caller.
//! - An *opaque redirect* has status `0`, type `opaqueredirect`, no body and
//!   only the URL that produced the redirect in its URL list.
//! - `url()` is the last entry of the URL list; `redirected()` is true once
//!   the list holds more than one URL.
//! - Bodies are never attached to null-body statuses (101, 204, 205, 304).
//!   [`Response::new`] rejects such combinations.
use std::fmt;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use url::Url;

use crate::errors::{FetchError, Result};
use crate::net::body::{self, extract, Body, BodyInit, ReadableStream, JSON_CONTENT_TYPE};
use crate::net::headers::Headers;

/// Statuses that count as redirects.
pub const REDIRECT_STATUSES: [u16; 5] = [301, 302, 303, 307, 308];

/// Statuses whose responses never carry a body.
pub const NULL_BODY_STATUSES: [u16; 4] = [101, 204, 205, 304];

pub fn is_redirect_status(status: u16) -> bool {
    REDIRECT_STATUSES.contains(&status)
}

pub fn is_null_body_status(status: u16) -> bool {
    NULL_BODY_STATUSES.contains(&status)
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ResponseType {
    Default,
    Error,
    OpaqueRedirect,
}

impl ResponseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseType::Default => "default",
            ResponseType::Error => "error",
            ResponseType::OpaqueRedirect => "opaqueredirect",
        }
    }
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for [`Response::new`].
#[derive(Debug, Default)]
pub struct ResponseInit {
    pub status: Option<u16>,
    pub status_text: Option<String>,
    pub headers: Option<Headers>,
}

impl ResponseInit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn status_text(mut self, text: impl Into<String>) -> Self {
        self.status_text = Some(text.into());
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = Some(headers);
        self
    }
}

/// `reason-phrase = *( HTAB / SP / VCHAR / obs-text )`
fn is_reason_phrase(text: &str) -> bool {
    text.chars()
        .all(|c| matches!(c, '\t' | ' ' | '\u{21}'..='\u{7e}' | '\u{80}'..='\u{ff}'))
}

#[derive(Debug)]
pub struct Response {
    pub(crate) response_type: ResponseType,
    pub(crate) status: u16,
    pub(crate) status_text: String,
    pub(crate) headers: Headers,
    pub(crate) url_list: Vec<Url>,
    pub(crate) body: Option<Body>,
    /// Why a network error happened; only set on network errors
    pub(crate) error_reason: Option<String>,
}

impl Response {
    fn bare(status: u16, response_type: ResponseType) -> Self {
        Self {
            response_type,
            status,
            status_text: String::new(),
            headers: Headers::new(),
            url_list: Vec::new(),
            body: None,
            error_reason: None,
        }
    }

    pub fn new(body: Option<BodyInit>, init: ResponseInit) -> Result<Response> {
        let status = init.status.unwrap_or(200);
        if !(200..=599).contains(&status) {
            return Err(FetchError::range_error(format!(
                "status {status} is outside of the range 200 to 599"
            )));
        }

        let mut response = Response::bare(status, ResponseType::Default);

        if let Some(text) = init.status_text {
            if !is_reason_phrase(&text) {
                return Err(FetchError::type_error(format!("invalid status text '{text}'")));
            }
            response.status_text = text;
        }
        if let Some(headers) = init.headers {
            response.headers = headers;
        }

        if let Some(body_init) = body {
            if is_null_body_status(status) {
                return Err(FetchError::type_error(format!(
                    "response with status {status} cannot have a body"
                )));
            }
            let (body, content_type) = extract(body_init)?;
            if let Some(content_type) = content_type {
                if !response.headers.has("content-type") {
                    response.headers.set("content-type", &content_type)?;
                }
            }
            response.body = Some(body);
        }

        Ok(response)
    }

    /// A network error.
    pub fn error() -> Response {
        Response::bare(0, ResponseType::Error)
    }

    /// A response redirecting to `url`.
    pub fn redirect(url: &str, status: u16) -> Result<Response> {
        let url = Url::parse(url)?;
        if !is_redirect_status(status) {
            return Err(FetchError::range_error(format!("{status} is not a redirect status")));
        }
        let mut response = Response::bare(status, ResponseType::Default);
        response.headers.append("location", url.as_str())?;
        Ok(response)
    }

    /// A response carrying `value` serialised as JSON.
    pub fn json<T: Serialize + ?Sized>(value: &T, init: ResponseInit) -> Result<Response> {
        let bytes = Bytes::from(serde_json::to_vec(value)?);
        let mut response = Response::new(Some(BodyInit::Bytes(bytes)), init)?;
        if !response.headers.has("content-type") {
            response.headers.set("content-type", JSON_CONTENT_TYPE)?;
        }
        Ok(response)
    }

    pub(crate) fn network_error(reason: impl Into<String>) -> Response {
        let mut response = Response::error();
        response.error_reason = Some(reason.into());
        response
    }

    pub(crate) fn opaque_redirect(url: Url) -> Response {
        let mut response = Response::bare(0, ResponseType::OpaqueRedirect);
        response.url_list = vec![url];
        response
    }

    /// A response as reported by the transport.
    pub(crate) fn from_network(
        status: u16,
        status_text: String,
        headers: Headers,
        url_list: Vec<Url>,
        body: Option<Body>,
    ) -> Response {
        Response {
            response_type: ResponseType::Default,
            status,
            status_text,
            headers,
            url_list,
            body,
            error_reason: None,
        }
    }

    pub fn response_type(&self) -> ResponseType {
        self.response_type
    }

    pub fn is_network_error(&self) -> bool {
        self.response_type == ResponseType::Error
    }

    /// The final URL, `None` when the response has no URL list.
    pub fn url(&self) -> Option<&Url> {
        self.url_list.last()
    }

    pub fn url_list(&self) -> &[Url] {
        &self.url_list
    }

    pub fn redirected(&self) -> bool {
        self.url_list.len() > 1
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// True for statuses in the range 200 to 299.
    pub fn ok(&self) -> bool {
        (200..=299).contains(&self.status)
    }

    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body(&self) -> Option<ReadableStream> {
        self.body.as_ref().map(|b| b.stream())
    }

    pub fn body_used(&self) -> bool {
        self.body.as_ref().map_or(false, |b| b.is_disturbed())
    }

    pub async fn bytes(&self) -> Result<Bytes> {
        body::consume(self.body()).await
    }

    pub async fn text(&self) -> Result<String> {
        body::consume_text(self.body()).await
    }

    pub async fn json_body<T: DeserializeOwned>(&self) -> Result<T> {
        body::consume_json(self.body()).await
    }

    /// Copies the response; a streaming body is teed between both copies.
    pub fn try_clone(&mut self) -> Result<Response> {
        let body = match self.body.as_mut() {
            Some(b) => Some(b.try_clone()?),
            None => None,
        };
        Ok(Response {
            response_type: self.response_type,
            status: self.status,
            status_text: self.status_text.clone(),
            headers: self.headers.clone(),
            url_list: self.url_list.clone(),
            body,
            error_reason: self.error_reason.clone(),
        })
    }
}
