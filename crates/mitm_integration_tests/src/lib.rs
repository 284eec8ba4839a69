// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end harness: a fake homeserver behind an in-process intercepting proxy, and
//! clients whose traffic goes through it.

pub mod fake_proxy;
pub mod flow_filter;
pub mod homeserver;
pub mod matrix_client;

use std::time::Duration;

use anyhow::Context;

use fake_proxy::FakeProxy;
use homeserver::FakeHomeserver;
use matrix_client::MatrixClient;
use mitm_control::HarnessConfig;

/// Server name clients use for the homeserver; the proxy routes it.
pub const HOMESERVER: &str = "hs1";

/// How long tests wait on channels before giving up.
pub const CHANNEL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Deployment {
    pub homeserver: FakeHomeserver,
    pub proxy: FakeProxy,
    mitm: mitm_control::Client,
}

impl Deployment {
    pub fn start() -> anyhow::Result<Self> {
        let homeserver = FakeHomeserver::start(HOMESERVER)?;
        let proxy = FakeProxy::start([(HOMESERVER.to_owned(), homeserver.local_addr())])?;
        let config = HarnessConfig {
            proxy_url: Some(proxy.url()),
            hostname_running_harness: "127.0.0.1".to_owned(),
            ..HarnessConfig::default()
        };
        let mitm = mitm_control::Client::new(&config).context("building control client")?;
        Ok(Self {
            homeserver,
            proxy,
            mitm,
        })
    }

    pub fn mitm(&self) -> &mitm_control::Client {
        &self.mitm
    }

    /// Register `localpart` and return a client logged in as them.
    pub fn login(&self, localpart: &str) -> anyhow::Result<MatrixClient> {
        let (user_id, access_token) = self.homeserver.register(localpart);
        MatrixClient::new(
            &self.proxy.url(),
            self.homeserver.server_name(),
            user_id,
            access_token,
        )
    }
}
