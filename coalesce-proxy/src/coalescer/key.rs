//! Request identity used to group concurrent callers.

use std::fmt;

use axum::http::{Method, Uri};

use super::config::CoalescerConfig;

/// Errors deriving a key from an inbound request
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("Request has no path")]
    MissingPath,

    #[error("Request path must be absolute, got {path:?}")]
    NotAbsolute { path: String },

    #[error("Request key is {len} bytes (max: {max})")]
    TooLong { len: usize, max: usize },
}

/// Identity of a logical request. Callers with equal keys share one
/// upstream call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey(String);

impl RequestKey {
    /// Wrap an already-derived identity
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Derive the key for an HTTP request: `METHOD path[?query]`.
    ///
    /// An empty query is dropped. With `normalize_query` the query pairs are
    /// sorted so `?b=2&a=1` and `?a=1&b=2` coalesce.
    pub fn from_request(
        method: &Method,
        uri: &Uri,
        config: &CoalescerConfig,
    ) -> Result<Self, KeyError> {
        let path = uri.path();
        if path.is_empty() {
            return Err(KeyError::MissingPath);
        }
        if !path.starts_with('/') {
            return Err(KeyError::NotAbsolute { path: path.to_string() });
        }

        let mut key = String::with_capacity(method.as_str().len() + 1 + path.len());
        key.push_str(method.as_str());
        key.push(' ');
        key.push_str(path);

        if let Some(query) = uri.query().filter(|q| !q.is_empty()) {
            key.push('?');
            if config.normalize_query {
                key.push_str(&normalize_query(query));
            } else {
                key.push_str(query);
            }
        }

        if key.len() > config.max_key_len {
            return Err(KeyError::TooLong { len: key.len(), max: config.max_key_len });
        }

        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

fn normalize_query(query: &str) -> String {
    let mut pairs: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
    pairs.sort_unstable();
    pairs.join("&")
}
