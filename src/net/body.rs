//! Bodies shared by requests, responses and form submissions.
//!
//! Every body is described by `{source, length, stream}`:
//! - `source` keeps the in-memory value the body was extracted from (bytes,
//!   text, url-encoded pairs, form data) so the body can be re-extracted or
//!   sent without going through the stream,
//! - `length` is known whenever a source exists,
//! - `stream` is always present and can be consumed at most once.
//!
//! A body is *disturbed* once its stream has been read from, canceled or
//! teed. Disturbed or locked bodies can no longer be extracted, cloned or
//! consumed.

mod stream;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::errors::{FetchError, Result};
use crate::net::form_data::FormData;

pub use stream::{CancelReason, ReadableStream, StreamController, StreamReader, UnderlyingSource};

pub const TEXT_CONTENT_TYPE: &str = "text/plain;charset=UTF-8";
pub const URL_ENCODED_CONTENT_TYPE: &str = "application/x-www-form-urlencoded;charset=UTF-8";
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// In-memory value a body was extracted from.
#[derive(Debug, Clone, PartialEq)]
pub enum BodySource {
    Bytes(Bytes),
    Text(String),
    /// Already serialised `application/x-www-form-urlencoded` payload
    UrlEncoded(String),
    /// The form together with its multipart serialisation. The encoding is
    /// kept so a re-extracted body matches the boundary in `Content-Type`.
    FormData { form: FormData, encoded: Bytes },
}

impl BodySource {
    pub fn to_bytes(&self) -> Bytes {
        match self {
            BodySource::Bytes(b) => b.clone(),
            BodySource::Text(s) | BodySource::UrlEncoded(s) => Bytes::copy_from_slice(s.as_bytes()),
            BodySource::FormData { encoded, .. } => encoded.clone(),
        }
    }
}

/// Values a body can be created from.
#[derive(Debug)]
pub enum BodyInit {
    Bytes(Bytes),
    Text(String),
    UrlSearchParams(Vec<(String, String)>),
    FormData(FormData),
    Stream(ReadableStream),
}

impl From<Bytes> for BodyInit {
    fn from(b: Bytes) -> Self {
        BodyInit::Bytes(b)
    }
}

impl From<Vec<u8>> for BodyInit {
    fn from(b: Vec<u8>) -> Self {
        BodyInit::Bytes(Bytes::from(b))
    }
}

impl From<&'static [u8]> for BodyInit {
    fn from(b: &'static [u8]) -> Self {
        BodyInit::Bytes(Bytes::from_static(b))
    }
}

impl From<String> for BodyInit {
    fn from(s: String) -> Self {
        BodyInit::Text(s)
    }
}

impl From<&str> for BodyInit {
    fn from(s: &str) -> Self {
        BodyInit::Text(s.to_string())
    }
}

impl From<FormData> for BodyInit {
    fn from(f: FormData) -> Self {
        BodyInit::FormData(f)
    }
}

impl From<ReadableStream> for BodyInit {
    fn from(s: ReadableStream) -> Self {
        BodyInit::Stream(s)
    }
}

#[derive(Debug)]
pub struct Body {
    source: Option<BodySource>,
    length: Option<u64>,
    stream: ReadableStream,
}

impl Body {
    /// Wraps a stream with no in-memory source and unknown length.
    pub fn from_stream(stream: ReadableStream) -> Self {
        Self {
            source: None,
            length: None,
            stream,
        }
    }

    /// Builds a fresh body over an in-memory source.
    pub fn from_source(source: BodySource) -> Self {
        let bytes = source.to_bytes();
        Self {
            length: Some(bytes.len() as u64),
            stream: ReadableStream::from_bytes(bytes),
            source: Some(source),
        }
    }

    pub fn source(&self) -> Option<&BodySource> {
        self.source.as_ref()
    }

    pub fn length(&self) -> Option<u64> {
        self.length
    }

    /// Handle to the body stream. Handles share the same underlying stream.
    pub fn stream(&self) -> ReadableStream {
        self.stream.clone()
    }

    pub fn is_disturbed(&self) -> bool {
        self.stream.is_disturbed()
    }

    pub fn is_locked(&self) -> bool {
        self.stream.is_locked()
    }

    pub fn is_unusable(&self) -> bool {
        self.stream.is_unusable()
    }

    /// Produces a second, independently readable body.
    ///
    /// A body with a source gets a fresh stream over the same source. A
    /// stream-only body is teed: this body keeps one branch and the returned
    /// body receives the other.
    pub fn try_clone(&mut self) -> Result<Body> {
        if self.stream.is_unusable() {
            return Err(FetchError::type_error("cannot clone a body that is locked or disturbed"));
        }

        if let Some(source) = &self.source {
            return Ok(Body::from_source(source.clone()));
        }

        let (ours, theirs) = self.stream.tee()?;
        self.stream = ours;
        Ok(Body {
            source: None,
            length: self.length,
            stream: theirs,
        })
    }
}

/// Turns a body value into a body and the `Content-Type` it implies.
pub fn extract(init: BodyInit) -> Result<(Body, Option<String>)> {
    let (source, content_type) = match init {
        BodyInit::Bytes(bytes) => (BodySource::Bytes(bytes), None),
        BodyInit::Text(text) => (BodySource::Text(text), Some(TEXT_CONTENT_TYPE.to_string())),
        BodyInit::UrlSearchParams(pairs) => {
            let encoded = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(pairs.iter())
                .finish();
            (
                BodySource::UrlEncoded(encoded),
                Some(URL_ENCODED_CONTENT_TYPE.to_string()),
            )
        }
        BodyInit::FormData(form) => {
            let boundary = format!("----formdata-gosub-{}", Uuid::new_v4().simple());
            let encoded = form.to_multipart(&boundary);
            (
                BodySource::FormData { form, encoded },
                Some(format!("multipart/form-data; boundary={boundary}")),
            )
        }
        BodyInit::Stream(stream) => {
            if stream.is_unusable() {
                return Err(FetchError::type_error("body stream is locked or disturbed"));
            }
            return Ok((Body::from_stream(stream), None));
        }
    };

    Ok((Body::from_source(source), content_type))
}

/// Reads a whole body. A missing body reads as empty.
pub(crate) async fn consume(stream: Option<ReadableStream>) -> Result<Bytes> {
    let Some(stream) = stream else {
        return Ok(Bytes::new());
    };
    if stream.is_unusable() {
        return Err(FetchError::type_error("body has already been used"));
    }
    stream.read_all().await
}

pub(crate) async fn consume_text(stream: Option<ReadableStream>) -> Result<String> {
    let bytes = consume(stream).await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

pub(crate) async fn consume_json<T: DeserializeOwned>(stream: Option<ReadableStream>) -> Result<T> {
    let bytes = consume(stream).await?;
    Ok(serde_json::from_slice(&bytes)?)
}
