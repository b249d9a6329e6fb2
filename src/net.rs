//! Fetch entities and the fetch algorithm.

pub mod body;
pub mod dispatcher;
pub mod fetch;
pub mod form_data;
mod handler;
pub mod headers;
pub mod request;
pub mod response;
pub mod signal;

pub use body::{Body, BodyInit, ReadableStream, StreamController, StreamReader};
pub use fetch::{FetchId, Fetcher};
pub use form_data::{File, FormData, FormValue};
pub use headers::Headers;
pub use request::{Request, RequestInfo, RequestInit};
pub use response::{Response, ResponseInit, ResponseType};
pub use signal::{AbortController, AbortSignal};
