// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Scoped proxy configurations.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, error};

use callback_server::{CallbackFn, CallbackServer, Response, TestScope};

use crate::client::{Client, LockId};
use crate::filter::{Filter, FilterParams};

/// What to intercept and what to do with it, for [`Configuration::apply`].
#[derive(Default)]
pub struct ConfigOpts {
    /// Transactions not matching this are passed through without calling either
    /// callback. No filter means every transaction is intercepted.
    pub filter: Option<Box<dyn Filter>>,
    /// Called before a matching request reaches the server. Returning a [`Response`]
    /// stops the request from ever reaching it.
    pub request_callback: Option<CallbackFn>,
    /// Called after the server answers a matching request. Returning a [`Response`]
    /// replaces the server's response.
    pub response_callback: Option<CallbackFn>,
}

impl ConfigOpts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: impl Filter + 'static) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    pub fn request_callback(mut self, callback: CallbackFn) -> Self {
        self.request_callback = Some(callback);
        self
    }

    pub fn response_callback(mut self, callback: CallbackFn) -> Self {
        self.response_callback = Some(callback);
        self
    }
}

/// Options for the proxy's callback addon.
#[derive(Debug, Default, Serialize)]
struct CallbackAddon {
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    callback_request_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    callback_response_url: Option<String>,
}

#[derive(Serialize)]
struct AddonOptions<'a> {
    callback: &'a CallbackAddon,
}

/// A proxy configuration being built up by one test.
pub struct Configuration<'a> {
    client: &'a Client,
    scope: Arc<TestScope>,
    paths: Mutex<BTreeMap<String, Arc<PathConfiguration>>>,
}

impl<'a> Configuration<'a> {
    pub(crate) fn new(client: &'a Client, scope: Arc<TestScope>) -> Self {
        Self {
            client,
            scope,
            paths: Mutex::default(),
        }
    }

    /// Apply `opts` to the proxy while `inner` runs, then restore the proxy's default
    /// configuration, even if `inner` panics.
    ///
    /// Failing to configure the proxy fails the test: a test that believes it is
    /// intercepting traffic must not carry on when it isn't.
    pub fn apply<R>(&self, opts: ConfigOpts, inner: impl FnOnce() -> R) -> R {
        let server = self.start_server();
        let addon = CallbackAddon {
            filter: opts.filter.map(|filter| filter.filter_string()),
            callback_request_url: opts
                .request_callback
                .map(|cb| server.set_on_request_callback(cb)),
            callback_response_url: opts
                .response_callback
                .map(|cb| server.set_on_response_callback(cb)),
        };
        self.while_locked(&addon, inner)
    }

    /// The configuration for requests whose path contains `partial_path`, created on
    /// first use.
    pub fn for_path(&self, partial_path: &str) -> Arc<PathConfiguration> {
        let mut paths = self.paths.lock().unwrap_or_else(PoisonError::into_inner);
        paths
            .entry(partial_path.to_owned())
            .or_insert_with(|| {
                Arc::new(PathConfiguration {
                    scope: self.scope.clone(),
                    path: partial_path.to_owned(),
                    options: Mutex::default(),
                })
            })
            .clone()
    }

    /// Apply the path configurations built with [`for_path`](Self::for_path) while
    /// `inner` runs.
    ///
    /// Only a single path configuration is supported for now.
    pub fn execute<R>(&self, inner: impl FnOnce() -> R) -> R {
        let paths = self.paths.lock().unwrap_or_else(PoisonError::into_inner);
        if paths.len() > 1 {
            self.scope.fatal(">1 path config currently unsupported");
        }
        let mut addon = CallbackAddon::default();
        let mut server = None;
        if let Some(path_config) = paths.values().next() {
            let options = path_config.options();
            addon.filter = Some(path_config.filter_string(&options));
            let server = server.insert(self.start_server());
            if let Some(listener) = options.listener.clone() {
                addon.callback_response_url = Some(server.set_on_response_callback(listener));
            }
            match options.block {
                Some(Block {
                    phase: BlockPhase::Request,
                    count,
                    status_code,
                }) => {
                    let blocker = block_requests(count, status_code);
                    addon.callback_request_url = Some(server.set_on_request_callback(blocker));
                }
                Some(Block {
                    phase: BlockPhase::Response,
                    ..
                }) => debug!("block_response on {} has no proxy-side effect", path_config.path),
                None => {}
            }
        }
        drop(paths);
        self.while_locked(&addon, inner)
    }

    fn start_server(&self) -> CallbackServer {
        CallbackServer::new(
            &self.scope,
            self.client.hostname_running_harness(),
            self.client.tracker().clone(),
        )
        .unwrap_or_else(|err| self.scope.fatal(err))
    }

    fn while_locked<R>(&self, addon: &CallbackAddon, inner: impl FnOnce() -> R) -> R {
        let lock_id = self
            .client
            .lock_options(&AddonOptions { callback: addon })
            .unwrap_or_else(|err| {
                self.scope
                    .fatal(format_args!("failed to lock proxy options: {err}"))
            });
        let _unlock = Unlock {
            client: self.client,
            scope: &self.scope,
            lock_id,
        };
        inner()
    }
}

/// Unlocks the proxy when dropped.
struct Unlock<'a> {
    client: &'a Client,
    scope: &'a TestScope,
    lock_id: LockId,
}

impl Drop for Unlock<'_> {
    fn drop(&mut self) {
        let Err(err) = self.client.unlock_options(&self.lock_id) else {
            return;
        };
        if thread::panicking() {
            error!("failed to unlock proxy options while unwinding: {err}");
        } else {
            self.scope
                .fatal(format_args!("failed to unlock proxy options: {err}"));
        }
    }
}

/// Request-phase callback that rejects matching requests, the first `count` of them or
/// all of them if `count` is 0.
fn block_requests(count: u32, status_code: u16) -> CallbackFn {
    let seen = AtomicU32::new(0);
    Arc::new(move |_| {
        let seen = seen.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        if count > 0 && seen > count {
            return None;
        }
        Some(Response::with(
            status_code,
            json!({"error": "mitm_control blocked this request"}),
        ))
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BlockPhase {
    Request,
    Response,
}

#[derive(Clone, Copy, Debug)]
struct Block {
    phase: BlockPhase,
    count: u32,
    status_code: u16,
}

#[derive(Clone, Default)]
struct PathOptions {
    access_token: Option<String>,
    method: Option<String>,
    listener: Option<CallbackFn>,
    block: Option<Block>,
}

/// Interception rules for one path, built up with chained calls:
///
/// ```ignore
/// config
///     .for_path("/keys/upload")
///     .access_token(&alice.access_token)
///     .listen(channel.callback());
/// ```
pub struct PathConfiguration {
    scope: Arc<TestScope>,
    path: String,
    options: Mutex<PathOptions>,
}

impl PathConfiguration {
    /// Call `listener` with every matching response.
    pub fn listen(&self, listener: CallbackFn) -> &Self {
        self.update(|options| options.listener = Some(listener));
        self
    }

    /// Only match requests made with `token`.
    pub fn access_token(&self, token: impl Into<String>) -> &Self {
        let token = token.into();
        self.update(|options| options.access_token = Some(token));
        self
    }

    /// Only match requests using `method`.
    pub fn method(&self, method: impl Into<String>) -> &Self {
        let method = method.into();
        self.update(|options| options.method = Some(method));
        self
    }

    /// Answer the first `count` matching requests (all of them if 0) with
    /// `status_code` without letting them reach the server.
    pub fn block_request(&self, count: u32, status_code: u16) -> &Self {
        self.block(BlockPhase::Request, count, status_code)
    }

    /// Record that matching responses should be blocked.
    pub fn block_response(&self, count: u32, status_code: u16) -> &Self {
        self.block(BlockPhase::Response, count, status_code)
    }

    fn block(&self, phase: BlockPhase, count: u32, status_code: u16) -> &Self {
        let mut options = self.options.lock().unwrap_or_else(PoisonError::into_inner);
        if options.block.is_some() {
            drop(options);
            self.scope.fatal(
                "BlockRequest or BlockResponse cannot be called multiple times for the same path",
            );
        }
        options.block = Some(Block {
            phase,
            count,
            status_code,
        });
        self
    }

    fn update(&self, f: impl FnOnce(&mut PathOptions)) {
        f(&mut self.options.lock().unwrap_or_else(PoisonError::into_inner));
    }

    fn options(&self) -> PathOptions {
        self.options
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The path clause is always present, even for an empty path.
    fn filter_string(&self, options: &PathOptions) -> String {
        let mut params = FilterParams::new();
        if let Some(method) = &options.method {
            params = params.method(method);
        }
        if let Some(token) = &options.access_token {
            params = params.access_token(token);
        }
        let path = format!("~u .*{}.*", self.path);
        match params.filter_string() {
            rest if rest.is_empty() => path,
            rest => format!("{path} {rest}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicBool;

    use serde_json::Value;

    use callback_server::{callback, Data};

    use crate::test_controller::FakeController;
    use crate::FilterExpression;

    fn webhook(url: &str, data: &Data) -> Value {
        reqwest::blocking::Client::new()
            .post(url)
            .json(data)
            .send()
            .unwrap()
            .json()
            .unwrap()
    }

    fn keys_upload() -> Data {
        Data {
            method: "POST".into(),
            url: "http://hs1/_matrix/client/v3/keys/upload".into(),
            access_token: "syt_YWxpY2U_abc_123".into(),
            ..Default::default()
        }
    }

    #[test]
    fn apply_locks_around_inner_and_unlocks_after() {
        let controller = FakeController::start();
        let client = Client::new(&controller.config()).unwrap();
        let scope = TestScope::new("apply_locks_around_inner_and_unlocks_after");
        let called = Arc::new(AtomicBool::new(false));

        let opts = ConfigOpts::new()
            .filter(FilterParams::new().path_contains("/keys/upload"))
            .request_callback({
                let called = called.clone();
                callback(move |data| {
                    called.store(true, Ordering::SeqCst);
                    assert_eq!(data.localpart().as_deref(), Some("alice"));
                    Some(Response::status(401))
                })
            });
        let request_url = client.configure(&scope).apply(opts, || {
            assert!(controller.is_locked());
            let lock = controller.last_lock();
            let addon = &lock["options"]["callback"];
            assert_eq!(addon["filter"], "~u .*/keys/upload.*");
            assert!(addon.get("callback_response_url").is_none());

            let request_url = addon["callback_request_url"].as_str().unwrap().to_owned();
            assert!(request_url.starts_with("http://127.0.0.1:"));
            assert!(request_url.ends_with("/request"));
            let verdict = webhook(&request_url, &keys_upload());
            assert_eq!(verdict, serde_json::json!({"respond_status_code": 401}));
            request_url
        });

        assert!(called.load(Ordering::SeqCst));
        assert!(!controller.is_locked());
        assert_eq!(controller.unlocks(), 1);
        assert_eq!(client.tracker().open_server_owner(), None);
        // The callback server goes away with the configuration.
        thread::sleep(std::time::Duration::from_millis(100));
        assert!(reqwest::blocking::Client::new()
            .post(request_url)
            .json(&keys_upload())
            .send()
            .is_err());
    }

    #[test]
    fn apply_unlocks_when_inner_panics() {
        let controller = FakeController::start();
        let client = Client::new(&controller.config()).unwrap();
        let scope = TestScope::new("apply_unlocks_when_inner_panics");

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            client
                .configure(&scope)
                .apply(ConfigOpts::new(), || panic!("assertion failed in test"))
        }));
        assert!(result.is_err());
        assert!(!controller.is_locked());
        assert_eq!(controller.locks(), vec![serde_json::json!({"options": {"callback": {}}})]);
    }

    #[test]
    #[should_panic(expected = "failed to lock proxy options")]
    fn failing_to_lock_fails_the_test() {
        let controller = FakeController::start();
        controller.fail_locks();
        let client = Client::new(&controller.config()).unwrap();
        let scope = TestScope::new("failing_to_lock_fails_the_test");
        client
            .configure(&scope)
            .apply(ConfigOpts::new().filter(FilterExpression::new("~m GET")), || {
                unreachable!("inner ran without a lock")
            });
    }

    #[test]
    fn execute_blocks_the_first_few_requests() {
        let controller = FakeController::start();
        let client = Client::new(&controller.config()).unwrap();
        let scope = TestScope::new("execute_blocks_the_first_few_requests");
        let config = client.configure(&scope);
        config
            .for_path("/keys/upload")
            .method("post")
            .access_token("syt_YWxpY2U_abc_123")
            .block_request(2, 429)
            .listen(callback(|_| None));

        config.execute(|| {
            let lock = controller.last_lock();
            let addon = &lock["options"]["callback"];
            assert_eq!(
                addon["filter"],
                "~u .*/keys/upload.* ~m POST ~hq syt_YWxpY2U_abc_123"
            );
            assert!(addon["callback_response_url"]
                .as_str()
                .unwrap()
                .ends_with("/response"));

            let request_url = addon["callback_request_url"].as_str().unwrap();
            for _ in 0..2 {
                let verdict = webhook(request_url, &keys_upload());
                assert_eq!(verdict["respond_status_code"], 429);
                assert!(verdict["respond_body"]["error"].is_string());
            }
            assert_eq!(webhook(request_url, &keys_upload()), serde_json::json!({}));
        });
        assert!(!controller.is_locked());
    }

    #[test]
    fn zero_count_blocks_forever() {
        let blocker = block_requests(0, 500);
        for _ in 0..5 {
            assert_eq!(
                blocker(keys_upload()).and_then(|r| r.respond_status_code),
                Some(500)
            );
        }
    }

    #[test]
    fn for_path_returns_the_same_configuration() {
        let controller = FakeController::start();
        let client = Client::new(&controller.config()).unwrap();
        let scope = TestScope::new("for_path_returns_the_same_configuration");
        let config = client.configure(&scope);
        config.for_path("/sync").method("get");
        config.for_path("/sync").block_response(1, 500);

        config.execute(|| {
            let lock = controller.last_lock();
            let addon = &lock["options"]["callback"];
            assert_eq!(addon["filter"], "~u .*/sync.* ~m GET");
            assert!(addon.get("callback_request_url").is_none());
            assert!(addon.get("callback_response_url").is_none());
        });
    }

    #[test]
    #[should_panic(expected = "cannot be called multiple times")]
    fn blocking_twice_fails_the_test() {
        let scope = TestScope::new("blocking_twice_fails_the_test");
        let path = PathConfiguration {
            scope,
            path: "/sync".into(),
            options: Mutex::default(),
        };
        path.block_request(1, 500).block_response(1, 500);
    }

    #[test]
    #[should_panic(expected = ">1 path config currently unsupported")]
    fn multiple_paths_fail_the_test() {
        let controller = FakeController::start();
        let client = Client::new(&controller.config()).unwrap();
        let scope = TestScope::new("multiple_paths_fail_the_test");
        let config = client.configure(&scope);
        config.for_path("/sync");
        config.for_path("/keys/upload");
        config.execute(|| {});
    }
}
