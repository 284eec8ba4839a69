// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A tiny Matrix client whose traffic goes through the proxy.

use std::thread;
use std::time::Duration;

use anyhow::Context;
use reqwest::blocking::Client;
use reqwest::Method;
use serde_json::{json, Value};
use tracing::info;

use crate::fake_proxy::OVERRIDE_HEADER;

/// What the client got back, after the proxy had its say.
#[derive(Clone, Debug)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
    /// The proxy made this response up instead of relaying the homeserver's.
    pub overridden: bool,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub struct MatrixClient {
    http: Client,
    base_url: String,
    pub user_id: String,
    pub access_token: String,
}

impl MatrixClient {
    pub fn new(
        proxy_url: &str,
        server_name: &str,
        user_id: String,
        access_token: String,
    ) -> anyhow::Result<Self> {
        let http = Client::builder()
            .proxy(reqwest::Proxy::all(proxy_url)?)
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url: format!("http://{server_name}/_matrix/client/v3"),
            user_id,
            access_token,
        })
    }

    fn call(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> anyhow::Result<ApiResponse> {
        let url = format!("{}/{endpoint}", self.base_url);
        let mut request = self
            .http
            .request(method.clone(), &url)
            .bearer_auth(&self.access_token);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().with_context(|| format!("{method} {url}"))?;
        let status = response.status().as_u16();
        let overridden = response.headers().contains_key(OVERRIDE_HEADER);
        let text = response.text()?;
        let body = serde_json::from_str(&text).unwrap_or(Value::Null);
        info!("{} {method} {endpoint} => HTTP {status}", self.user_id);
        Ok(ApiResponse {
            status,
            body,
            overridden,
        })
    }

    pub fn capabilities(&self) -> anyhow::Result<ApiResponse> {
        self.call(Method::GET, "capabilities", None)
    }

    /// Upload `count` fresh one-time keys.
    pub fn upload_keys(&self, count: usize) -> anyhow::Result<ApiResponse> {
        let one_time_keys: serde_json::Map<String, Value> = (0..count)
            .map(|i| {
                (
                    format!("signed_curve25519:{i:04}{:08x}", rand::random::<u32>()),
                    json!({"key": format!("key{i}"), "signatures": {}}),
                )
            })
            .collect();
        self.call(
            Method::POST,
            "keys/upload",
            Some(&json!({ "one_time_keys": one_time_keys })),
        )
    }

    pub fn put_account_data(
        &self,
        event_type: &str,
        content: &Value,
    ) -> anyhow::Result<ApiResponse> {
        let endpoint = format!("user/{}/account_data/{event_type}", self.user_id);
        self.call(Method::PUT, &endpoint, Some(content))
    }

    pub fn get_account_data(&self, event_type: &str) -> anyhow::Result<ApiResponse> {
        let endpoint = format!("user/{}/account_data/{event_type}", self.user_id);
        self.call(Method::GET, &endpoint, None)
    }

    /// Like [`put_account_data`](Self::put_account_data) but retries server errors the
    /// way real clients do, up to `max_attempts` times. Returns the final response and
    /// how many attempts it took.
    pub fn put_account_data_with_retries(
        &self,
        event_type: &str,
        content: &Value,
        max_attempts: usize,
    ) -> anyhow::Result<(ApiResponse, usize)> {
        let mut attempt = 1;
        loop {
            let response = self.put_account_data(event_type, content)?;
            if response.status < 500 || attempt >= max_attempts {
                return Ok((response, attempt));
            }
            info!(
                "{}: attempt {attempt} failed with HTTP {}, retrying",
                self.user_id, response.status
            );
            attempt += 1;
            thread::sleep(Duration::from_millis(50));
        }
    }
}
