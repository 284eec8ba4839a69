// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Minimal stand-in for the proxy's control endpoints.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use http_body_util::BodyExt;
use hyper::{Method, Request};

use harness_http::response::{self, StatusCode};
use harness_http::BackgroundServer;

use crate::HarnessConfig;

#[derive(Default)]
struct State {
    locked: bool,
    fail_locks: bool,
    locks: Vec<serde_json::Value>,
    unlocks: usize,
}

pub struct FakeController {
    state: Arc<Mutex<State>>,
    server: BackgroundServer,
}

impl FakeController {
    pub const LOCK_ID: &'static str = "lock-1";

    pub fn start() -> Self {
        let state = Arc::new(Mutex::new(State::default()));
        let shared = state.clone();
        let server = BackgroundServer::bind(
            "fake-controller",
            SocketAddr::from(([127, 0, 0, 1], 0)),
            move |request: Request<hyper::body::Incoming>, _| {
                let state = shared.clone();
                async move {
                    let method = request.method().clone();
                    let path = request.uri().path().to_owned();
                    let body = request.into_body().collect().await.unwrap().to_bytes();
                    let mut state = state.lock().unwrap();
                    match (method, path.as_str()) {
                        (Method::POST, "/options/lock") if state.fail_locks => {
                            response::text(StatusCode::SERVICE_UNAVAILABLE, "no")
                        }
                        (Method::POST, "/options/lock") if state.locked => {
                            response::text(StatusCode::BAD_REQUEST, "already locked")
                        }
                        (Method::POST, "/options/lock") => {
                            state.locked = true;
                            state.locks.push(serde_json::from_slice(&body).unwrap());
                            response::text(StatusCode::OK, Self::LOCK_ID)
                        }
                        (Method::POST, "/options/unlock") if body == Self::LOCK_ID.as_bytes() => {
                            state.locked = false;
                            state.unlocks += 1;
                            response::text(StatusCode::OK, "")
                        }
                        (Method::POST, "/options/unlock") => {
                            response::text(StatusCode::BAD_REQUEST, "wrong lock")
                        }
                        _ => response::not_found(),
                    }
                }
            },
        )
        .unwrap();
        Self { state, server }
    }

    pub fn config(&self) -> HarnessConfig {
        HarnessConfig {
            controller_url: format!("http://{}", self.server.local_addr()),
            hostname_running_harness: "127.0.0.1".into(),
            control_timeout_secs: 2,
            ..HarnessConfig::default()
        }
    }

    pub fn fail_locks(&self) {
        self.state.lock().unwrap().fail_locks = true;
    }

    pub fn locks(&self) -> Vec<serde_json::Value> {
        self.state.lock().unwrap().locks.clone()
    }

    pub fn last_lock(&self) -> serde_json::Value {
        self.locks().pop().unwrap()
    }

    pub fn unlocks(&self) -> usize {
        self.state.lock().unwrap().unlocks
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().unwrap().locked
    }
}
