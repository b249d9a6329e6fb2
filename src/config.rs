//! Fetch engine configuration.
//!
//! `FetchConfig` holds the knobs of a [`Fetcher`](crate::Fetcher): how many
//! redirects are followed, how much unread body data a stream buffers before
//! the transport is asked to pause, and which default request headers are
//! filled in.
//!
//! # Examples
//!
//! ## Use defaults
//! ```rust
//! use gosub_fetch::FetchConfig;
//! let cfg = FetchConfig::default();
//! assert_eq!(cfg.max_redirections, 20);
//! assert_eq!(cfg.high_water_mark, 16 * 1024);
//! ```
//!
//! ## Customize with the builder
//! ```rust
//! use gosub_fetch::FetchConfig;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cfg = FetchConfig::builder()
//!     .max_redirections(5)
//!     .high_water_mark(64 * 1024)
//!     .user_agent("Gosub/0.1")
//!     .build()?;
//! # Ok(()) }
//! ```

use std::fmt;

const DEFAULT_USER_AGENT: &str = "Gosub/1.0 (X11; Linux x86_64) Gecko/20250802 GosubBrowser/1.0";

/// Maximum number of redirects followed when the redirect mode is `follow`.
pub const DEFAULT_MAX_REDIRECTIONS: u32 = 20;

/// Number of queued body bytes above which a body stream reports backpressure.
pub const DEFAULT_HIGH_WATER_MARK: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct FetchConfig {
    /// Redirect budget per fetch (also passed to the transport in `follow` mode)
    pub max_redirections: u32,
    /// Backpressure threshold for response body streams, in bytes
    pub high_water_mark: usize,
    /// Value used for `Accept` when the request has none
    pub default_accept: String,
    /// Value used for `Accept-Language` when the request has neither `Accept` nor `Accept-Language`
    pub default_accept_language: String,
    /// User agent appended to outgoing requests when they do not carry one
    pub user_agent: Option<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_redirections: DEFAULT_MAX_REDIRECTIONS,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            default_accept: "*/*".to_string(),
            default_accept_language: "*".to_string(),
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
        }
    }
}

impl FetchConfig {
    pub fn builder() -> FetchConfigBuilder {
        FetchConfigBuilder::default()
    }
}

/// Builder for [`FetchConfig`].
#[derive(Debug, Clone, Default)]
pub struct FetchConfigBuilder {
    inner: FetchConfig,
}

impl FetchConfigBuilder {
    #[inline]
    fn map(mut self, f: impl FnOnce(&mut FetchConfig)) -> Self {
        f(&mut self.inner);
        self
    }

    pub fn max_redirections(self, n: u32) -> Self { self.map(|c| c.max_redirections = n) }
    pub fn high_water_mark(self, bytes: usize) -> Self { self.map(|c| c.high_water_mark = bytes) }
    pub fn default_accept<S: Into<String>>(self, v: S) -> Self { self.map(|c| c.default_accept = v.into()) }
    pub fn default_accept_language<S: Into<String>>(self, v: S) -> Self { self.map(|c| c.default_accept_language = v.into()) }
    pub fn user_agent<S: Into<String>>(self, ua: S) -> Self { self.map(|c| c.user_agent = Some(ua.into())) }
    pub fn no_user_agent(self) -> Self { self.map(|c| c.user_agent = None) }

    /// Apply multiple changes in one go.
    pub fn with(self, f: impl FnOnce(&mut FetchConfig)) -> Self { self.map(f) }

    /// Validate and build the final config.
    pub fn build(self) -> Result<FetchConfig, FetchConfigError> {
        validate(&self.inner)?;
        Ok(self.inner)
    }
}

// ---------- Validation ----------

#[derive(Debug, Clone, PartialEq)]
pub enum FetchConfigError {
    ZeroHighWaterMark,
    TooManyRedirections(u32),
    EmptyAccept,
}

impl fmt::Display for FetchConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchConfigError::ZeroHighWaterMark =>
                write!(f, "high_water_mark must be at least 1 byte"),
            FetchConfigError::TooManyRedirections(n) =>
                write!(f, "max_redirections {n} is out of range (expected 0..=255)"),
            FetchConfigError::EmptyAccept =>
                write!(f, "default_accept must not be empty"),
        }
    }
}
impl std::error::Error for FetchConfigError {}

fn validate(c: &FetchConfig) -> Result<(), FetchConfigError> {
    if c.high_water_mark == 0 {
        return Err(FetchConfigError::ZeroHighWaterMark);
    }
    if c.max_redirections > 255 {
        return Err(FetchConfigError::TooManyRedirections(c.max_redirections));
    }
    if c.default_accept.trim().is_empty() {
        return Err(FetchConfigError::EmptyAccept);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_fetch_conventions() {
        let cfg = FetchConfig::default();
        assert_eq!(cfg.max_redirections, 20);
        assert_eq!(cfg.high_water_mark, 16384);
        assert_eq!(cfg.default_accept, "*/*");
        assert_eq!(cfg.default_accept_language, "*");
        assert!(cfg.user_agent.is_some());
    }

    #[test]
    fn builder_applies_overrides() {
        let cfg = FetchConfig::builder()
            .max_redirections(3)
            .high_water_mark(10)
            .no_user_agent()
            .build()
            .unwrap();
        assert_eq!(cfg.max_redirections, 3);
        assert_eq!(cfg.high_water_mark, 10);
        assert_eq!(cfg.user_agent, None);
    }

    #[test]
    fn builder_rejects_invalid_values() {
        assert_eq!(
            FetchConfig::builder().high_water_mark(0).build(),
            Err(FetchConfigError::ZeroHighWaterMark)
        );
        assert_eq!(
            FetchConfig::builder().max_redirections(1000).build(),
            Err(FetchConfigError::TooManyRedirections(1000))
        );
        assert_eq!(
            FetchConfig::builder().default_accept("  ").build(),
            Err(FetchConfigError::EmptyAccept)
        );
    }
}
