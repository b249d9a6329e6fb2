//! # gosub-fetch
//!
//! A WHATWG Fetch engine for the Gosub browser. The crate models the fetch
//! entities ([`Request`], [`Response`], [`Headers`], [`FormData`]), their
//! bodies as pull-driven [`ReadableStream`]s and the fetch algorithm itself,
//! including redirect handling and cancellation through [`AbortSignal`].
//!
//! The wire is somebody else's job: a [`Fetcher`] hands every network
//! request to a [`Dispatcher`] and adapts its callbacks into a streaming
//! response. [`ReqwestDispatcher`] talks HTTP through `reqwest`;
//! [`MockDispatcher`] replays scripted answers for tests.
//!
//! ```no_run
//! use gosub_fetch::{Fetcher, FetchConfig, ReqwestDispatcher, RequestInit};
//!
//! # async fn run() -> gosub_fetch::errors::Result<()> {
//! let config = FetchConfig::builder().max_redirections(5).build()?;
//! let fetcher = Fetcher::with_config(ReqwestDispatcher::with_max_redirections(5)?, config);
//!
//! let response = fetcher
//!     .fetch("https://example.org/", RequestInit::new().redirect("manual"))
//!     .await?;
//! println!("{} {}", response.status(), response.text().await?);
//! # Ok(()) }
//! ```

pub mod config;
pub mod errors;
pub mod net;

pub use config::{FetchConfig, FetchConfigBuilder};
pub use errors::FetchError;
pub use net::dispatcher::{DispatchBody, DispatchContext, DispatchHandler, DispatchRequest, Dispatcher, MockDispatcher};
#[cfg(feature = "reqwest")]
pub use net::dispatcher::ReqwestDispatcher;
pub use net::{
    AbortController, AbortSignal, Body, BodyInit, File, FetchId, Fetcher, FormData, FormValue, Headers,
    ReadableStream, Request, RequestInfo, RequestInit, Response, ResponseInit, ResponseType, StreamController,
    StreamReader,
};
