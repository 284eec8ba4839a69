// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Client for the proxy's control plane.

use std::fmt;
use std::sync::Arc;

use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::Serialize;
use tracing::info;

use callback_server::{ServerTracker, TestScope};

use crate::config::HarnessConfig;
use crate::configuration::Configuration;
use crate::error::ControlError;

/// Opaque token proving ownership of the proxy's configuration.
#[derive(Clone, PartialEq, Eq)]
pub struct LockId(Vec<u8>);

impl LockId {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<String> for LockId {
    fn from(lock_id: String) -> Self {
        Self(lock_id.into_bytes())
    }
}

impl fmt::Debug for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LockId({})", String::from_utf8_lossy(&self.0))
    }
}

#[derive(Serialize)]
struct LockRequest<'a, T> {
    options: &'a T,
}

/// Talks to the proxy's control endpoints, through the proxy itself.
///
/// One client is normally shared by a whole test binary; every
/// [`Configuration`] made from it shares its [`ServerTracker`].
pub struct Client {
    http: HttpClient,
    controller_url: String,
    hostname_running_harness: String,
    tracker: ServerTracker,
}

impl Client {
    pub fn new(config: &HarnessConfig) -> Result<Self, ControlError> {
        let mut builder = HttpClient::builder().timeout(config.control_timeout());
        if let Some(proxy_url) = &config.proxy_url {
            let proxy = reqwest::Proxy::all(proxy_url).map_err(ControlError::Build)?;
            builder = builder.proxy(proxy);
        }
        let http = builder.build().map_err(ControlError::Build)?;
        Ok(Self {
            http,
            controller_url: config.controller_url.trim_end_matches('/').to_owned(),
            hostname_running_harness: config.hostname_running_harness.clone(),
            tracker: ServerTracker::new(),
        })
    }

    /// Start describing what `scope` wants intercepted.
    pub fn configure(&self, scope: &Arc<TestScope>) -> Configuration<'_> {
        Configuration::new(self, scope.clone())
    }

    pub fn hostname_running_harness(&self) -> &str {
        &self.hostname_running_harness
    }

    pub fn tracker(&self) -> &ServerTracker {
        &self.tracker
    }

    /// Replace the proxy's addon options with `options`, taking exclusive ownership of
    /// its configuration until [`unlock_options`](Self::unlock_options).
    pub fn lock_options(&self, options: &impl Serialize) -> Result<LockId, ControlError> {
        let ctx = "locking proxy options";
        let body = serde_json::to_string(&LockRequest { options }).map_err(|source| {
            ControlError::Encode {
                encoding: "proxy options".into(),
                source,
            }
        })?;
        info!("lockOptions: {body}");
        let response = self
            .http
            .post(format!("{}/options/lock", self.controller_url))
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .map_err(|source| request_error(ctx, source))?;
        let lock_id = expect_ok(ctx, response)?
            .bytes()
            .map_err(|source| request_error(ctx, source))?;
        Ok(LockId(lock_id.to_vec()))
    }

    /// Restore the proxy's default configuration.
    pub fn unlock_options(&self, lock_id: &LockId) -> Result<(), ControlError> {
        let ctx = "unlocking proxy options";
        info!("unlockOptions");
        let response = self
            .http
            .post(format!("{}/options/unlock", self.controller_url))
            .header(CONTENT_TYPE, "application/json")
            .body(lock_id.0.clone())
            .send()
            .map_err(|source| request_error(ctx, source))?;
        expect_ok(ctx, response)?;
        Ok(())
    }
}

fn request_error(ctx: &str, source: reqwest::Error) -> ControlError {
    ControlError::Request {
        ctx: ctx.to_owned(),
        source,
    }
}

fn expect_ok(ctx: &str, response: HttpResponse) -> Result<HttpResponse, ControlError> {
    let status = response.status();
    if status == StatusCode::OK {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(ControlError::Status {
        ctx: ctx.to_owned(),
        status: status.as_u16(),
        body,
    })
}
