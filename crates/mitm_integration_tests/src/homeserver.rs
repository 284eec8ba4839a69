// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Just enough of a Matrix homeserver for the proxy to have something to intercept.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::AUTHORIZATION;
use hyper::{Method, Request};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Value};
use tracing::debug;

use harness_http::response::{self, GenericResponse, StatusCode};
use harness_http::BackgroundServer;

const CLIENT_PREFIX: &str = "/_matrix/client/v3/";

/// One request the homeserver actually received.
#[derive(Clone, Debug)]
pub struct Hit {
    pub method: Method,
    pub path: String,
    pub access_token: String,
}

#[derive(Default)]
struct State {
    /// access token -> user ID
    users: HashMap<String, String>,
    account_data: HashMap<(String, String), Value>,
    one_time_keys: HashMap<String, usize>,
    hits: Vec<Hit>,
}

struct Homeserver {
    server_name: String,
    state: Mutex<State>,
}

fn matrix_error(status: StatusCode, errcode: &str, error: &str) -> GenericResponse {
    response::json(
        status,
        json!({"errcode": errcode, "error": error}).to_string(),
    )
}

impl Homeserver {
    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn respond(&self, request: Request<Incoming>) -> GenericResponse {
        let method = request.method().clone();
        let path = request.uri().path().to_owned();
        let access_token = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .unwrap_or_default()
            .to_owned();
        let body = match request.into_body().collect().await {
            Ok(body) => body.to_bytes(),
            Err(err) => return response::text(StatusCode::BAD_REQUEST, err),
        };
        debug!("homeserver: {method} {path}");

        let mut state = self.state();
        state.hits.push(Hit {
            method: method.clone(),
            path: path.clone(),
            access_token: access_token.clone(),
        });
        let Some(user_id) = state.users.get(&access_token).cloned() else {
            return matrix_error(
                StatusCode::UNAUTHORIZED,
                "M_UNKNOWN_TOKEN",
                "Unrecognised access token",
            );
        };
        let Some(endpoint) = path.strip_prefix(CLIENT_PREFIX) else {
            return matrix_error(StatusCode::NOT_FOUND, "M_UNRECOGNIZED", "Unrecognized request");
        };
        let segments: Vec<&str> = endpoint.split('/').collect();
        match (&method, segments.as_slice()) {
            (&Method::GET, ["capabilities"]) => response::json(
                StatusCode::OK,
                json!({"capabilities": {"m.change_password": {"enabled": false}}}).to_string(),
            ),
            (&Method::POST, ["keys", "upload"]) => {
                let uploaded = parse(&body)
                    .and_then(|body| body.get("one_time_keys")?.as_object().map(|keys| keys.len()))
                    .unwrap_or(0);
                let count = state.one_time_keys.entry(user_id).or_default();
                *count += uploaded;
                response::json(
                    StatusCode::OK,
                    json!({"one_time_key_counts": {"signed_curve25519": *count}}).to_string(),
                )
            }
            (_, ["user", owner, "account_data", event_type]) => {
                if decode_user_id(owner) != user_id {
                    return matrix_error(
                        StatusCode::FORBIDDEN,
                        "M_FORBIDDEN",
                        "Cannot access other users' account data",
                    );
                }
                let key = (user_id, (*event_type).to_owned());
                match &method {
                    &Method::PUT => match parse(&body) {
                        Some(content) if content.is_object() => {
                            state.account_data.insert(key, content);
                            response::json(StatusCode::OK, "{}")
                        }
                        _ => {
                            matrix_error(StatusCode::BAD_REQUEST, "M_NOT_JSON", "Content not JSON")
                        }
                    },
                    &Method::GET => match state.account_data.get(&key) {
                        Some(content) => response::json(StatusCode::OK, content.to_string()),
                        None => matrix_error(
                            StatusCode::NOT_FOUND,
                            "M_NOT_FOUND",
                            "Account data not found",
                        ),
                    },
                    _ => matrix_error(
                        StatusCode::METHOD_NOT_ALLOWED,
                        "M_UNRECOGNIZED",
                        "Unrecognized request",
                    ),
                }
            }
            _ => matrix_error(StatusCode::NOT_FOUND, "M_UNRECOGNIZED", "Unrecognized request"),
        }
    }
}

fn parse(body: &Bytes) -> Option<Value> {
    serde_json::from_slice(body).ok()
}

fn decode_user_id(segment: &str) -> String {
    segment.replace("%40", "@").replace("%3A", ":").replace("%3a", ":")
}

/// A fake homeserver running in the background until dropped.
pub struct FakeHomeserver {
    homeserver: Arc<Homeserver>,
    server: BackgroundServer,
}

impl FakeHomeserver {
    pub fn start(server_name: &str) -> anyhow::Result<Self> {
        let homeserver = Arc::new(Homeserver {
            server_name: server_name.to_owned(),
            state: Mutex::default(),
        });
        let shared = homeserver.clone();
        let server = BackgroundServer::bind(
            "fake-homeserver",
            SocketAddr::from(([127, 0, 0, 1], 0)),
            move |request, _| {
                let homeserver = shared.clone();
                async move { homeserver.respond(request).await }
            },
        )
        .context("starting fake homeserver")?;
        Ok(Self { homeserver, server })
    }

    pub fn server_name(&self) -> &str {
        &self.homeserver.server_name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Create `localpart` and log them in, returning their user ID and access token.
    ///
    /// Tokens follow Synapse's `syt_<base64 localpart>_<random>_<check>` shape.
    pub fn register(&self, localpart: &str) -> (String, String) {
        let user_id = format!("@{localpart}:{}", self.server_name());
        let mut rng = rand::thread_rng();
        let mut random = |len| -> String {
            (&mut rng)
                .sample_iter(&Alphanumeric)
                .take(len)
                .map(char::from)
                .collect()
        };
        let (secret, check) = (random(20), random(6));
        let token = format!("syt_{}_{secret}_{check}", STANDARD_NO_PAD.encode(localpart));
        self.homeserver
            .state()
            .users
            .insert(token.clone(), user_id.clone());
        (user_id, token)
    }

    /// Every request the homeserver received, in order.
    pub fn hits(&self) -> Vec<Hit> {
        self.homeserver.state().hits.clone()
    }

    /// How many requests reached a path containing `partial_path`, optionally only
    /// those made with `access_token`.
    pub fn hit_count(&self, partial_path: &str, access_token: Option<&str>) -> usize {
        self.hits()
            .iter()
            .filter(|hit| hit.path.contains(partial_path))
            .filter(|hit| access_token.map_or(true, |token| hit.access_token == token))
            .count()
    }
}
