// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::{Arc, Mutex};

use callback_server::{
    callback, CallbackServer, Data, PassiveChannel, Phase, Response, ServerTracker, TestScope,
};
use mitm_control::{ConfigOpts, FilterExpression, FilterParams};
use mitm_integration_tests::{Deployment, CHANNEL_TIMEOUT};
use serde_json::{json, Value};

/// Callback that records every transaction it sees and lets it through.
fn recorder() -> (Arc<Mutex<Vec<Data>>>, callback_server::CallbackFn) {
    let seen = Arc::new(Mutex::new(vec![]));
    let record = seen.clone();
    let cb = callback(move |data| {
        record.lock().unwrap().push(data);
        None
    });
    (seen, cb)
}

#[tracing_test::traced_test]
#[test]
fn matching_responses_reach_the_test() {
    let deployment = Deployment::start().unwrap();
    let alice = deployment.login("alice").unwrap();
    let scope = TestScope::current();
    let channel = PassiveChannel::new(CHANNEL_TIMEOUT, false);

    let opts = ConfigOpts::new()
        .filter(FilterParams::new().path_contains("capabilities"))
        .response_callback(channel.callback());
    deployment.mitm().configure(&scope).apply(opts, || {
        assert!(deployment.proxy.is_locked());
        let res = alice.capabilities().unwrap();
        assert_eq!(res.status, 200);
        assert!(!res.overridden);

        let data = channel.recv(&scope, "capabilities response was never intercepted");
        assert_eq!(data.method, "GET");
        assert_eq!(data.url, "http://hs1/_matrix/client/v3/capabilities");
        assert_eq!(data.access_token, alice.access_token);
        assert_eq!(data.localpart().as_deref(), Some("alice"));
        assert_eq!(data.response_code, 200);
        assert!(data.request_body.is_none());
        let body: Value = data.response_json().unwrap().unwrap();
        assert_eq!(body, res.body);

        // Traffic outside the filter is never delivered.
        let put = alice.put_account_data("m.test", &json!({"a": 1})).unwrap();
        assert_eq!(put.status, 200);
        assert!(channel.try_recv().is_none());
    });
    assert!(!deployment.proxy.is_locked());

    // Nor is anything once the configuration is gone.
    alice.capabilities().unwrap();
    assert!(channel.try_recv().is_none());
    channel.close();
}

#[tracing_test::traced_test]
#[test]
fn filters_by_path_method_and_token() {
    let deployment = Deployment::start().unwrap();
    let alice = deployment.login("alice").unwrap();
    let bob = deployment.login("bob").unwrap();
    let scope = TestScope::current();
    let (seen, cb) = recorder();

    let opts = ConfigOpts::new()
        .filter(
            FilterParams::new()
                .path_contains("account_data")
                .method("put")
                .access_token(&alice.access_token),
        )
        .request_callback(cb);
    deployment.mitm().configure(&scope).apply(opts, || {
        let content = json!({"secret": "sauce"});
        assert_eq!(alice.put_account_data("m.test", &content).unwrap().status, 200);
        assert_eq!(alice.get_account_data("m.test").unwrap().body, content);
        assert_eq!(bob.put_account_data("m.test", &content).unwrap().status, 200);
        assert_eq!(alice.capabilities().unwrap().status, 200);
    });

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].method, "PUT");
    assert_eq!(seen[0].access_token, alice.access_token);
    // Request-phase data has no response yet.
    assert_eq!(seen[0].response_code, 0);
    let body: Value = seen[0].request_json().unwrap().unwrap();
    assert_eq!(body, json!({"secret": "sauce"}));
}

#[tracing_test::traced_test]
#[test]
fn key_uploads_are_counted_per_client() {
    let deployment = Deployment::start().unwrap();
    let alice = deployment.login("alice").unwrap();
    let bob = deployment.login("bob").unwrap();
    let scope = TestScope::current();
    let (seen, cb) = recorder();

    let filter = FilterExpression::new(format!(
        "~u .*/keys/upload.* ~hq {}",
        alice.access_token
    ));
    deployment
        .mitm()
        .configure(&scope)
        .apply(ConfigOpts::new().filter(filter).request_callback(cb), || {
            for _ in 0..2 {
                assert!(alice.upload_keys(5).unwrap().is_success());
            }
            assert!(bob.upload_keys(5).unwrap().is_success());
        });

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|data| data.access_token == alice.access_token));
    assert!(seen.iter().all(|data| data.url.ends_with("/keys/upload")));
    assert_eq!(
        deployment
            .homeserver
            .hit_count("/keys/upload", Some(&bob.access_token)),
        1
    );
}

#[tracing_test::traced_test]
#[test]
fn request_overrides_never_reach_the_server() {
    let deployment = Deployment::start().unwrap();
    let alice = deployment.login("alice").unwrap();
    let scope = TestScope::current();

    let opts = ConfigOpts::new()
        .filter(FilterParams::new().path_contains("capabilities"))
        .request_callback(callback(|_| {
            Some(Response::with(503, json!({"errcode": "M_UNKNOWN"})))
        }));
    deployment.mitm().configure(&scope).apply(opts, || {
        let res = alice.capabilities().unwrap();
        assert_eq!(res.status, 503);
        assert_eq!(res.body, json!({"errcode": "M_UNKNOWN"}));
        assert!(res.overridden);
    });
    assert_eq!(deployment.homeserver.hit_count("capabilities", None), 0);

    // Passed through again afterwards.
    assert_eq!(alice.capabilities().unwrap().status, 200);
    assert_eq!(deployment.homeserver.hit_count("capabilities", None), 1);
}

#[tracing_test::traced_test]
#[test]
fn response_overrides_keep_unset_fields() {
    let deployment = Deployment::start().unwrap();
    let alice = deployment.login("alice").unwrap();
    let scope = TestScope::current();
    let real = alice.capabilities().unwrap();

    let filter = || FilterParams::new().path_contains("capabilities");
    let status_only = ConfigOpts::new()
        .filter(filter())
        .response_callback(callback(|_| Some(Response::status(418))));
    deployment.mitm().configure(&scope).apply(status_only, || {
        let res = alice.capabilities().unwrap();
        assert_eq!(res.status, 418);
        assert_eq!(res.body, real.body);
        assert!(res.overridden);
    });

    let body_only = ConfigOpts::new()
        .filter(filter())
        .response_callback(callback(|_| Some(Response::body(json!({"foo": "bar"})))));
    deployment.mitm().configure(&scope).apply(body_only, || {
        let res = alice.capabilities().unwrap();
        assert_eq!(res.status, 200);
        assert_eq!(res.body, json!({"foo": "bar"}));
    });

    // Both requests still reached the server; only the responses were replaced.
    assert_eq!(deployment.homeserver.hit_count("capabilities", None), 3);
}

#[tracing_test::traced_test]
#[test]
fn declining_to_override_passes_through() {
    let deployment = Deployment::start().unwrap();
    let alice = deployment.login("alice").unwrap();
    let scope = TestScope::current();
    let (seen, cb) = recorder();

    // No filter: everything is intercepted.
    deployment
        .mitm()
        .configure(&scope)
        .apply(ConfigOpts::new().response_callback(cb), || {
            let res = alice.put_account_data("m.test", &json!({"b": 2})).unwrap();
            assert_eq!(res.status, 200);
            assert!(!res.overridden);
            assert_eq!(alice.get_account_data("m.test").unwrap().body, json!({"b": 2}));
        });
    assert_eq!(seen.lock().unwrap().len(), 2);
}

#[tracing_test::traced_test]
#[test]
fn phases_without_a_handler_leave_transactions_alone() {
    let deployment = Deployment::start().unwrap();
    let alice = deployment.login("alice").unwrap();
    let scope = TestScope::current();
    let real = alice.capabilities().unwrap();

    // The proxy is pointed at a response webhook nobody registered a handler for.
    let mut cb_server = CallbackServer::new(&scope, "127.0.0.1", ServerTracker::new()).unwrap();
    let unhandled = format!("{}{}", cb_server.base_url(), Phase::Response.path());
    let lock_id = deployment
        .mitm()
        .lock_options(&json!({"callback": {
            "filter": "~u .*capabilities.*",
            "callback_response_url": unhandled,
        }}))
        .unwrap();

    let res = alice.capabilities().unwrap();
    assert_eq!(res.status, 200);
    assert_eq!(res.body, real.body);
    assert!(!res.overridden);

    deployment.mitm().unlock_options(&lock_id).unwrap();
    cb_server.close();
}
