// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use crate::data::{CallbackFn, Response};

/// Callback which answers the first `count` transactions with `status_code` and an
/// error body, then lets everything through. Useful for exercising retry logic.
pub fn send_error(count: u32, status_code: u16) -> CallbackFn {
    let seen = AtomicU32::new(0);
    Arc::new(move |data| {
        let previous = seen
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_add(1))
            })
            .unwrap_or(u32::MAX);
        if previous >= count {
            return None;
        }
        debug!("send_error: failing {} {} with HTTP {status_code}", data.method, data.url);
        Some(Response::with(
            status_code,
            json!({"error": format!("callback_server::send_error ({}/{count})", previous + 1)}),
        ))
    })
}
