// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Webhook payloads exchanged with the proxy.

use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Access tokens minted by Synapse look like `syt_<base64 localpart>_<random>_<crc>`.
const SYNAPSE_TOKEN_PREFIX: &str = "syt_";

/// Callback invoked once per matching transaction.
///
/// Returning `None` lets the transaction through unaltered. Callbacks may be invoked
/// concurrently for different transactions and may block for as long as they like;
/// only the transaction they were called for waits on them.
pub type CallbackFn = Arc<dyn Fn(Data) -> Option<Response> + Send + Sync + 'static>;

/// Wrap a closure as a [`CallbackFn`].
pub fn callback(f: impl Fn(Data) -> Option<Response> + Send + Sync + 'static) -> CallbackFn {
    Arc::new(f)
}

/// Snapshot of one proxied HTTP transaction, as reported by the proxy.
///
/// Bodies are kept as raw JSON and only parsed on demand; they're `None` when the
/// proxy couldn't read the body as JSON (e.g. `GET` requests).
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Data {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub access_token: String,
    /// HTTP status of the real response. 0 for request-phase callbacks.
    #[serde(default)]
    pub response_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<Box<RawValue>>,
    #[serde(default)]
    pub request_body: Option<Box<RawValue>>,
}

impl Data {
    /// Parse the request body into `T`, if there was one.
    pub fn request_json<'a, T: Deserialize<'a>>(&'a self) -> Option<serde_json::Result<T>> {
        self.request_body
            .as_deref()
            .map(|raw| serde_json::from_str(raw.get()))
    }

    /// Parse the real response body into `T`, if there was one.
    pub fn response_json<'a, T: Deserialize<'a>>(&'a self) -> Option<serde_json::Result<T>> {
        self.response_body
            .as_deref()
            .map(|raw| serde_json::from_str(raw.get()))
    }

    /// Best-effort user localpart encoded in the access token, for log lines only.
    pub fn localpart(&self) -> Option<String> {
        let rest = self.access_token.strip_prefix(SYNAPSE_TOKEN_PREFIX)?;
        let encoded = rest.split('_').next()?;
        let decoded = STANDARD_NO_PAD.decode(encoded).ok()?;
        String::from_utf8(decoded).ok()
    }
}

impl fmt::Display for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let req_len = self.request_body.as_deref().map_or(0, |raw| raw.get().len());
        write!(
            f,
            "{} {} (token={}) req_len={} => HTTP {}",
            self.method, self.url, self.access_token, req_len, self.response_code
        )
    }
}

/// An override for a proxied transaction.
///
/// Either field may be left unset, in which case the proxy keeps the real value. A
/// request-phase override stops the request from ever reaching the server, so it
/// should set both.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Response {
    /// If set, changes the HTTP response status code for this request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub respond_status_code: Option<u16>,
    /// If set, changes the HTTP response body for this request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub respond_body: Option<serde_json::Value>,
}

impl Response {
    /// Override only the status code.
    pub fn status(status_code: u16) -> Self {
        Self {
            respond_status_code: Some(status_code),
            respond_body: None,
        }
    }

    /// Override only the body.
    pub fn body(body: serde_json::Value) -> Self {
        Self {
            respond_status_code: None,
            respond_body: Some(body),
        }
    }

    /// Override both the status code and the body.
    pub fn with(status_code: u16, body: serde_json::Value) -> Self {
        Self {
            respond_status_code: Some(status_code),
            respond_body: Some(body),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn decodes_proxy_payloads() {
        let payload = r#"{
            "method": "PUT",
            "access_token": "syt_YWxpY2U_abcdef_123",
            "url": "http://hs1/_matrix/client/v3/user/@alice:hs1/account_data/foo",
            "request_body": {"foo": "bar"},
            "response_code": 200,
            "response_body": {}
        }"#;
        let data: Data = serde_json::from_str(payload).unwrap();
        assert_eq!(data.method, "PUT");
        assert_eq!(data.response_code, 200);
        let body: serde_json::Value = data.request_json().unwrap().unwrap();
        assert_eq!(body, json!({"foo": "bar"}));
        assert_eq!(data.localpart().as_deref(), Some("alice"));
    }

    #[test]
    fn request_phase_payloads_have_no_response() {
        let payload = r#"{"method": "GET", "access_token": "", "url": "http://hs1/x", "request_body": null}"#;
        let data: Data = serde_json::from_str(payload).unwrap();
        assert_eq!(data.response_code, 0);
        assert!(data.request_body.is_none());
        assert!(data.response_json::<serde_json::Value>().is_none());
        assert_eq!(data.to_string(), "GET http://hs1/x (token=) req_len=0 => HTTP 0");
    }

    #[test]
    fn undecodable_tokens_have_no_localpart() {
        let data = Data {
            access_token: "syt_!!!_abc".into(),
            ..Default::default()
        };
        assert_eq!(data.localpart(), None);
        let data = Data {
            access_token: "opaque".into(),
            ..Default::default()
        };
        assert_eq!(data.localpart(), None);
    }

    #[test]
    fn overrides_omit_unset_fields() {
        let encoded = serde_json::to_value(Response::status(404)).unwrap();
        assert_eq!(encoded, json!({"respond_status_code": 404}));
        let encoded = serde_json::to_value(Response::body(json!({"foo": "bar"}))).unwrap();
        assert_eq!(encoded, json!({"respond_body": {"foo": "bar"}}));
        assert_eq!(serde_json::to_value(Response::default()).unwrap(), json!({}));
    }
}
