// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Which transactions the proxy should intercept.
//!
//! Filters compile to the proxy's filter expression language, where clauses are
//! space-separated and ANDed together:
//!
//! * `~u <regex>` matches the request URL,
//! * `~m <METHOD>` matches the HTTP method,
//! * `~hq <text>` matches request headers.
//!
//! An empty expression matches everything.

/// Anything that can be turned into a proxy filter expression.
pub trait Filter: Send + Sync {
    fn filter_string(&self) -> String;
}

/// A raw filter expression, e.g. `~m PUT ~hq syt_aabbccddeeff`.
///
/// Prefer [`FilterParams`] unless it can't express the rule you need.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilterExpression(pub String);

impl FilterExpression {
    pub fn new(expression: impl Into<String>) -> Self {
        Self(expression.into())
    }
}

impl Filter for FilterExpression {
    fn filter_string(&self) -> String {
        self.0.clone()
    }
}

/// Constraints that must all hold for a transaction to be intercepted. Unset
/// constraints don't filter anything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilterParams {
    path_contains: Option<String>,
    access_token: Option<String>,
    method: Option<String>,
}

impl FilterParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// The URL path must contain `path`.
    ///
    /// Paths are used as-is in a regex. That's fine for typical paths, whose only
    /// special characters are percent-encoded.
    pub fn path_contains(mut self, path: impl Into<String>) -> Self {
        self.path_contains = Some(path.into());
        self
    }

    /// The request must carry `token` in a header.
    pub fn access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// The request must use `method` (case-insensitive).
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }
}

impl Filter for FilterParams {
    fn filter_string(&self) -> String {
        let mut clauses = vec![];
        if let Some(path) = self.path_contains.as_deref().filter(|p| !p.is_empty()) {
            clauses.push(format!("~u .*{path}.*"));
        }
        if let Some(method) = self.method.as_deref().filter(|m| !m.is_empty()) {
            clauses.push(format!("~m {}", method.to_uppercase()));
        }
        if let Some(token) = self.access_token.as_deref().filter(|t| !t.is_empty()) {
            clauses.push(format!("~hq {token}"));
        }
        clauses.join(" ")
    }
}

impl<F: Filter + ?Sized> Filter for Box<F> {
    fn filter_string(&self) -> String {
        (**self).filter_string()
    }
}
