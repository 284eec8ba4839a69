// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [`CallbackServer`]-related things

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Method, Request};
use serde_json::json;
use tracing::{debug, info};

use harness_http::response::{self, GenericResponse, StatusCode};
use harness_http::BackgroundServer;

use crate::data::{CallbackFn, Data};
use crate::error::ServerError;
use crate::scope::{ServerTracker, TestScope};

/// Which half of a transaction a webhook call is about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Before the request reaches the upstream server.
    Request,
    /// Before the upstream's response reaches the client.
    Response,
}

impl Phase {
    pub fn path(self) -> &'static str {
        match self {
            Phase::Request => "/request",
            Phase::Response => "/response",
        }
    }

    fn from_path(path: &str) -> Option<Self> {
        match path {
            "/request" => Some(Phase::Request),
            "/response" => Some(Phase::Response),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Phase::Request => "request",
            Phase::Response => "response",
        }
    }
}

#[derive(Default)]
struct Slots {
    on_request: Option<CallbackFn>,
    on_response: Option<CallbackFn>,
}

struct Handlers {
    scope: Arc<TestScope>,
    slots: Mutex<Slots>,
}

impl Handlers {
    fn get(&self, phase: Phase) -> Option<CallbackFn> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        match phase {
            Phase::Request => slots.on_request.clone(),
            Phase::Response => slots.on_response.clone(),
        }
    }

    fn set(&self, phase: Phase, callback: CallbackFn) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        match phase {
            Phase::Request => slots.on_request = Some(callback),
            Phase::Response => slots.on_response = Some(callback),
        }
    }

    async fn respond(&self, request: Request<Incoming>) -> GenericResponse {
        if request.method() != Method::POST {
            return response::text(StatusCode::METHOD_NOT_ALLOWED, "webhooks must be POSTed");
        }
        let Some(phase) = Phase::from_path(request.uri().path()) else {
            return response::not_found();
        };
        // Tell the proxy outright that nobody is listening. The body is JSON but must
        // not be served as such: the proxy treats any JSON reply as an override.
        let Some(callback) = self.get(phase) else {
            let error = format!("no {} handler registered", phase.name());
            return response::text(StatusCode::NOT_FOUND, json!({ "error": error }));
        };

        let body = match request.into_body().collect().await {
            Ok(body) => body.to_bytes(),
            Err(err) => {
                self.scope.error(format!("error reading webhook body: {err}"));
                return response::text(StatusCode::INTERNAL_SERVER_ERROR, err);
            }
        };
        let data: Data = match serde_json::from_slice(&body) {
            Ok(data) => data,
            Err(err) => {
                self.scope.error(format!("error decoding json: {err}"));
                return response::text(StatusCode::INTERNAL_SERVER_ERROR, err);
            }
        };
        self.scope.log(format_args!(
            "CallbackServer[{}]{}: {data}",
            self.scope.name(),
            data.localpart().unwrap_or_default()
        ));

        // Callbacks are synchronous and may block indefinitely (tarpitting), so they
        // get a blocking thread each instead of a runtime worker.
        let decision = match tokio::task::spawn_blocking(move || callback(data)).await {
            Ok(decision) => decision,
            Err(err) => {
                self.scope.error(format!("{} callback failed: {err}", phase.name()));
                return response::text(StatusCode::INTERNAL_SERVER_ERROR, err);
            }
        };
        let Some(decision) = decision else {
            return response::json(StatusCode::OK, "{}");
        };
        match serde_json::to_vec(&decision) {
            Ok(encoded) => {
                debug!("{} callback override: {decision:?}", phase.name());
                response::json(StatusCode::OK, encoded)
            }
            Err(err) => {
                self.scope
                    .error(format!("failed to marshal callback response: {err}"));
                response::text(StatusCode::INTERNAL_SERVER_ERROR, err)
            }
        }
    }
}

/// Local HTTP server that receives webhook calls from the proxy.
///
/// Listens on an OS-assigned port on all interfaces. Register handlers with
/// [`set_on_request_callback`](Self::set_on_request_callback) and
/// [`set_on_response_callback`](Self::set_on_response_callback) and hand the returned
/// URLs to the proxy. Calls for a phase with no handler get a 404.
///
/// Must be [`close`](Self::close)d (or dropped) at the end of the test.
pub struct CallbackServer {
    base_url: String,
    handlers: Arc<Handlers>,
    server: BackgroundServer,
    tracker: ServerTracker,
    closed: bool,
}

impl CallbackServer {
    /// Start a callback server for the test `scope`.
    ///
    /// `hostname_running_harness` is how the proxy reaches this process, which is
    /// not necessarily `localhost` when the proxy runs in a container.
    pub fn new(
        scope: &Arc<TestScope>,
        hostname_running_harness: &str,
        tracker: ServerTracker,
    ) -> Result<Self, ServerError> {
        tracker.opened(scope);

        let handlers = Arc::new(Handlers {
            scope: scope.clone(),
            slots: Mutex::default(),
        });
        let responder_handlers = handlers.clone();
        let responder = move |request: Request<Incoming>, _peer_addr: SocketAddr| {
            let handlers = responder_handlers.clone();
            async move { handlers.respond(request).await }
        };
        let listen_addr = SocketAddr::from(([0, 0, 0, 0], 0));
        let server = match BackgroundServer::bind("callback-server", listen_addr, responder) {
            Ok(server) => server,
            Err(err) => {
                tracker.closed();
                return Err(err.into());
            }
        };
        let base_url = format!("http://{hostname_running_harness}:{}", server.port());
        info!("CallbackServer[{}] listening on {base_url}", scope.name());

        Ok(Self {
            base_url,
            handlers,
            server,
            tracker,
            closed: false,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn port(&self) -> u16 {
        self.server.port()
    }

    /// Replace the request-phase handler, returning the URL the proxy should call.
    pub fn set_on_request_callback(&self, callback: CallbackFn) -> String {
        self.set_callback(Phase::Request, callback)
    }

    /// Replace the response-phase handler, returning the URL the proxy should call.
    pub fn set_on_response_callback(&self, callback: CallbackFn) -> String {
        self.set_callback(Phase::Response, callback)
    }

    pub fn set_callback(&self, phase: Phase, callback: CallbackFn) -> String {
        self.handlers.set(phase, callback);
        format!("{}{}", self.base_url, phase.path())
    }

    /// Shut down the server. Calling this more than once is harmless.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.server.close();
        self.tracker.closed();
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        self.close();
    }
}
