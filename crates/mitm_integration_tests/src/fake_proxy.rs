// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-process stand-in for the intercepting proxy.
//!
//! Speaks plain HTTP proxy (absolute-form request targets), forwards to a fixed set of
//! named upstreams, and implements the two pieces the harness relies on: the
//! lock/unlock control endpoints on the controller host, and the callback addon which
//! delivers matching transactions to webhook URLs and applies the overrides they
//! return.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use hyper::http::request::Parts;
use hyper::{Method, Request};
use serde::Deserialize;
use serde_json::value::RawValue;
use tracing::{error, info};

use callback_server::{Data, Response};
use harness_http::response::{self, GenericResponse, StatusCode};
use harness_http::BackgroundServer;

use crate::flow_filter::{FilterError, FlowFilter, FlowInfo};

pub const CONTROLLER_HOST: &str = "mitm.code";

/// Marks responses the proxy made up, so they aren't mistaken for upstream ones.
pub const OVERRIDE_HEADER: &str = "mitm-proxy";

const CALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Default, Deserialize)]
struct CallbackOptions {
    #[serde(default)]
    filter: Option<String>,
    #[serde(default)]
    callback_request_url: Option<String>,
    #[serde(default)]
    callback_response_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LockOptions {
    #[serde(default)]
    callback: Option<CallbackOptions>,
}

#[derive(Debug, Deserialize)]
struct LockRequest {
    #[serde(default)]
    options: LockOptions,
}

#[derive(Debug, Deserialize)]
struct UnlockRequest {
    #[serde(default)]
    reset_id: String,
}

/// The callback addon's active settings.
#[derive(Default)]
struct Addon {
    filter: FlowFilter,
    request_url: Option<String>,
    response_url: Option<String>,
}

impl Addon {
    fn from_options(options: CallbackOptions) -> Result<Self, FilterError> {
        let non_empty = |url: Option<String>| url.filter(|u| !u.is_empty());
        Ok(Self {
            filter: FlowFilter::parse(options.filter.as_deref().unwrap_or_default())?,
            request_url: non_empty(options.callback_request_url),
            response_url: non_empty(options.callback_response_url),
        })
    }
}

#[derive(Default)]
struct Control {
    reset_id: Option<String>,
    addon: Arc<Addon>,
}

/// What the upstream answered.
struct Upstream {
    status: StatusCode,
    content_type: Option<HeaderValue>,
    body: Bytes,
}

impl Upstream {
    fn into_response(self) -> GenericResponse {
        let mut response = response::json(self.status, self.body);
        match self.content_type {
            Some(content_type) => {
                response.headers_mut().insert(CONTENT_TYPE, content_type);
            }
            None => {
                response.headers_mut().remove(CONTENT_TYPE);
            }
        }
        response
    }
}

/// The request half of a transaction, as the addon sees it.
struct Flow {
    method: Method,
    url: String,
    headers: Vec<String>,
    access_token: String,
    request_body: Option<Box<RawValue>>,
}

impl Flow {
    fn new(parts: &Parts, host: &str, body: &[u8]) -> Self {
        let path = parts.uri.path_and_query().map_or("/", |p| p.as_str());
        let headers = parts
            .headers
            .iter()
            .map(|(name, value)| format!("{name}: {}", String::from_utf8_lossy(value.as_bytes())))
            .collect();
        let access_token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.strip_prefix("Bearer ").unwrap_or(value).to_owned())
            .unwrap_or_default();
        Self {
            method: parts.method.clone(),
            url: format!("http://{host}{path}"),
            headers,
            access_token,
            // e.g. GET requests have no body
            request_body: serde_json::from_slice(body).ok(),
        }
    }

    fn info(&self) -> FlowInfo<'_> {
        FlowInfo {
            method: self.method.as_str(),
            url: &self.url,
            headers: &self.headers,
        }
    }

    fn data(&self) -> Data {
        Data {
            method: self.method.to_string(),
            url: self.url.clone(),
            access_token: self.access_token.clone(),
            response_code: 0,
            response_body: None,
            request_body: self.request_body.clone(),
        }
    }

    fn data_with_response(&self, upstream: &Upstream) -> Data {
        Data {
            response_code: upstream.status.as_u16(),
            response_body: serde_json::from_slice(&upstream.body).ok(),
            ..self.data()
        }
    }
}

struct Proxy {
    upstreams: HashMap<String, SocketAddr>,
    control: Mutex<Control>,
    http: reqwest::Client,
}

impl Proxy {
    fn addon(&self) -> Arc<Addon> {
        self.control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .addon
            .clone()
    }

    async fn respond(&self, request: Request<Incoming>) -> GenericResponse {
        let Some(host) = target_host(&request) else {
            return response::text(StatusCode::BAD_REQUEST, "no target host");
        };
        let (parts, body) = request.into_parts();
        let body = match body.collect().await {
            Ok(body) => body.to_bytes(),
            Err(err) => return response::text(StatusCode::BAD_REQUEST, err),
        };
        // The controller is never intercepted.
        if host == CONTROLLER_HOST {
            return self.control(&parts, &body);
        }
        let Some(&upstream) = self.upstreams.get(&host) else {
            return response::text(StatusCode::BAD_GATEWAY, format_args!("unknown host {host}"));
        };

        let flow = Flow::new(&parts, &host, &body);
        let addon = self.addon();
        let intercepted = addon.filter.matches(&flow.info());

        if let (true, Some(url)) = (intercepted, &addon.request_url) {
            info!("hitting request callback for {}", flow.url);
            if let Some(made_up) = self.send_callback(url, flow.data(), None).await {
                return made_up;
            }
        }

        let real = match self.forward(upstream, &parts, body).await {
            Ok(real) => real,
            Err(err) => return response::text(StatusCode::BAD_GATEWAY, err),
        };

        if let (true, Some(url)) = (intercepted, &addon.response_url) {
            info!("hitting response callback for {}", flow.url);
            let data = flow.data_with_response(&real);
            if let Some(made_up) = self.send_callback(url, data, Some(&real)).await {
                return made_up;
            }
        }
        real.into_response()
    }

    fn control(&self, parts: &Parts, body: &[u8]) -> GenericResponse {
        let mut control = self.control.lock().unwrap_or_else(PoisonError::into_inner);
        match (&parts.method, parts.uri.path()) {
            (&Method::POST, "/options/lock") => {
                if control.reset_id.is_some() {
                    return response::text(
                        StatusCode::BAD_REQUEST,
                        "options already locked, did you forget to unlock?",
                    );
                }
                let request: LockRequest = match serde_json::from_slice(body) {
                    Ok(request) => request,
                    Err(err) => return response::text(StatusCode::BAD_REQUEST, err),
                };
                let options = request.options.callback.unwrap_or_default();
                let addon = match Addon::from_options(options) {
                    Ok(addon) => addon,
                    Err(err) => return response::text(StatusCode::BAD_REQUEST, err),
                };
                let reset_id = format!("{:016x}", rand::random::<u64>());
                info!(
                    "locking options: filter={:?} req_url={:?} res_url={:?}",
                    addon.filter, addon.request_url, addon.response_url
                );
                control.reset_id = Some(reset_id.clone());
                control.addon = Arc::new(addon);
                response::json(
                    StatusCode::OK,
                    serde_json::json!({ "reset_id": reset_id }).to_string(),
                )
            }
            (&Method::POST, "/options/unlock") => {
                let request: UnlockRequest = match serde_json::from_slice(body) {
                    Ok(request) => request,
                    Err(err) => return response::text(StatusCode::BAD_REQUEST, err),
                };
                let id_matches = control
                    .reset_id
                    .as_ref()
                    .map(|reset_id| *reset_id == request.reset_id);
                match id_matches {
                    None => response::text(
                        StatusCode::BAD_REQUEST,
                        "options were not locked, mismatched lock/unlock calls",
                    ),
                    Some(false) => response::text(
                        StatusCode::BAD_REQUEST,
                        "refusing to unlock, wrong id supplied",
                    ),
                    Some(true) => {
                        info!("unlocking options");
                        *control = Control::default();
                        response::json(StatusCode::OK, "{}")
                    }
                }
            }
            _ => response::not_found(),
        }
    }

    async fn forward(
        &self,
        upstream: SocketAddr,
        parts: &Parts,
        body: Bytes,
    ) -> Result<Upstream, reqwest::Error> {
        let path = parts.uri.path_and_query().map_or("/", |p| p.as_str());
        let mut request = self
            .http
            .request(parts.method.clone(), format!("http://{upstream}{path}"));
        for (name, value) in &parts.headers {
            if !is_hop_header(name) {
                request = request.header(name, value);
            }
        }
        let response = request.body(body).send().await?;
        Ok(Upstream {
            status: response.status(),
            content_type: response.headers().get(CONTENT_TYPE).cloned(),
            body: response.bytes().await?,
        })
    }

    /// Deliver `data` to a webhook and turn its verdict into a made-up response.
    ///
    /// `None` means the transaction carries on untouched, which is also what happens
    /// when the webhook misbehaves.
    async fn send_callback(
        &self,
        url: &str,
        data: Data,
        real: Option<&Upstream>,
    ) -> Option<GenericResponse> {
        let reply = match self.http.post(url).json(&data).timeout(CALLBACK_TIMEOUT).send().await {
            Ok(reply) => reply,
            Err(err) => {
                error!("ERR: callback for {} returned {err}", data.url);
                return None;
            }
        };
        // Only the content type decides whether there is a verdict; the status of the
        // webhook reply is never consulted.
        let status = reply.status();
        let is_json = reply
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with(response::JSON));
        if !is_json {
            let body = reply.text().await.unwrap_or_default();
            error!("ERR: callback for {} returned HTTP {status}: {body}", data.url);
            return None;
        }
        let verdict: Response = match reply.json().await {
            Ok(verdict) => verdict,
            Err(err) => {
                error!("ERR: callback for {} returned bad json: {err}", data.url);
                return None;
            }
        };
        if verdict == Response::default() {
            return None;
        }

        // Unset fields keep the real values. Requests have no real status, so
        // request-phase overrides must provide one.
        let status_code = verdict
            .respond_status_code
            .or(real.map(|r| r.status.as_u16()))
            .and_then(|code| StatusCode::from_u16(code).ok());
        let Some(status_code) = status_code else {
            error!("ERR: callback for {} gave no usable status code", data.url);
            return None;
        };
        let body = match (&verdict.respond_body, real) {
            (Some(body), _) => Bytes::from(body.to_string()),
            (None, Some(real)) => real.body.clone(),
            (None, None) => Bytes::from_static(b"null"),
        };
        info!(
            "callback for {} returning custom response: HTTP {status_code}",
            data.url
        );
        let mut made_up = response::json(status_code, body);
        made_up.headers_mut().insert(
            HeaderName::from_static(OVERRIDE_HEADER),
            HeaderValue::from_static("yes"),
        );
        Some(made_up)
    }
}

fn target_host(request: &Request<Incoming>) -> Option<String> {
    if let Some(host) = request.uri().host() {
        return Some(host.to_owned());
    }
    let host = request.headers().get(HOST)?.to_str().ok()?;
    Some(host.split(':').next().unwrap_or(host).to_owned())
}

fn is_hop_header(name: &HeaderName) -> bool {
    name == HOST || name == CONTENT_LENGTH || name.as_str() == "proxy-connection"
}

/// The proxy, running in the background until dropped.
pub struct FakeProxy {
    proxy: Arc<Proxy>,
    server: BackgroundServer,
}

impl FakeProxy {
    /// Start proxying to `upstreams`, keyed by the host name clients use for them.
    pub fn start(
        upstreams: impl IntoIterator<Item = (String, SocketAddr)>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .no_proxy()
            .build()
            .context("building fake proxy client")?;
        let proxy = Arc::new(Proxy {
            upstreams: upstreams.into_iter().collect(),
            control: Mutex::default(),
            http,
        });
        let shared = proxy.clone();
        let server = BackgroundServer::bind(
            "fake-proxy",
            SocketAddr::from(([127, 0, 0, 1], 0)),
            move |request, _| {
                let proxy = shared.clone();
                async move { proxy.respond(request).await }
            },
        )
        .context("starting fake proxy")?;
        Ok(Self { proxy, server })
    }

    /// URL clients should use as their HTTP proxy.
    pub fn url(&self) -> String {
        format!("http://{}", self.server.local_addr())
    }

    pub fn is_locked(&self) -> bool {
        self.proxy
            .control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset_id
            .is_some()
    }
}
