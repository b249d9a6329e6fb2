//! Enumerated request options.
//!
//! Every option parses from, and prints as, its Fetch keyword
//! (`"same-origin"`, `"no-store"`, ...). Unknown keywords fail with a type
//! error naming the option type.

use std::fmt;
use std::str::FromStr;

use crate::errors::{FetchError, Result};

macro_rules! keyword_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $keyword:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $name::$variant => $keyword ),+
                }
            }
        }

        impl FromStr for $name {
            type Err = FetchError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $( $keyword => Ok($name::$variant), )+
                    _ => Err(FetchError::type_error(format!(
                        "'{s}' is not a valid value of {}",
                        stringify!($name)
                    ))),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> String {
                value.as_str().to_string()
            }
        }
    };
}

keyword_enum! {
    /// How a request interacts with cross-origin policy.
    RequestMode {
        Navigate => "navigate",
        SameOrigin => "same-origin",
        NoCors => "no-cors",
        Cors => "cors",
    }
}

keyword_enum! {
    RequestCredentials {
        Omit => "omit",
        SameOrigin => "same-origin",
        Include => "include",
    }
}

keyword_enum! {
    /// Cache mode. Only validated; no HTTP cache sits behind it.
    RequestCache {
        Default => "default",
        NoStore => "no-store",
        Reload => "reload",
        NoCache => "no-cache",
        ForceCache => "force-cache",
        OnlyIfCached => "only-if-cached",
    }
}

keyword_enum! {
    /// What happens when the server answers with a redirect.
    RequestRedirect {
        Follow => "follow",
        Manual => "manual",
        Error => "error",
    }
}

keyword_enum! {
    ReferrerPolicy {
        /// No policy set
        Unset => "",
        NoReferrer => "no-referrer",
        NoReferrerWhenDowngrade => "no-referrer-when-downgrade",
        SameOrigin => "same-origin",
        Origin => "origin",
        StrictOrigin => "strict-origin",
        OriginWhenCrossOrigin => "origin-when-cross-origin",
        StrictOriginWhenCrossOrigin => "strict-origin-when-cross-origin",
        UnsafeUrl => "unsafe-url",
    }
}

/// Referrer attached to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Referrer {
    NoReferrer,
    Client,
    Url(url::Url),
}

impl Referrer {
    /// Parses the `referrer` request option.
    ///
    /// An empty string means `no-referrer`, `about:client` means the client
    /// itself; anything else has to be an absolute URL.
    pub fn parse(value: &str) -> Result<Self> {
        if value.is_empty() {
            return Ok(Referrer::NoReferrer);
        }
        let url = url::Url::parse(value)
            .map_err(|_| FetchError::type_error(format!("referrer '{value}' is not a valid URL")))?;
        if url.as_str() == "about:client" {
            return Ok(Referrer::Client);
        }
        Ok(Referrer::Url(url))
    }
}

impl fmt::Display for Referrer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Referrer::NoReferrer => f.write_str(""),
            Referrer::Client => f.write_str("about:client"),
            Referrer::Url(url) => f.write_str(url.as_str()),
        }
    }
}

/// Methods a request may use (compared after uppercasing).
pub const METHODS: &[&str] = &[
    "ACL", "BIND", "CHECKOUT", "CONNECT", "COPY", "DELETE", "GET", "HEAD", "LINK", "LOCK",
    "M-SEARCH", "MERGE", "MKACTIVITY", "MKCALENDAR", "MKCOL", "MOVE", "NOTIFY", "OPTIONS",
    "PATCH", "POST", "PROPFIND", "PROPPATCH", "PURGE", "PUT", "REBIND", "REPORT", "SEARCH",
    "SOURCE", "SUBSCRIBE", "TRACE", "UNBIND", "UNLINK", "UNLOCK", "UNSUBSCRIBE",
];

/// Uppercases and validates a method name.
pub fn normalize_method(method: &str) -> Result<http::Method> {
    let upper = method.to_ascii_uppercase();
    if !METHODS.contains(&upper.as_str()) {
        return Err(FetchError::type_error(format!(
            "'{method}' is not a valid HTTP method"
        )));
    }
    http::Method::from_bytes(upper.as_bytes())
        .map_err(|_| FetchError::type_error(format!("'{method}' is not a valid HTTP method")))
}
