// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

/// Errors starting a [`CallbackServer`](crate::CallbackServer).
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to start callback server: {0}")]
    Start(#[from] harness_http::ServerError),
}

/// Errors waiting on a [`PassiveChannel`](crate::PassiveChannel) or
/// [`ActiveChannel`](crate::ActiveChannel).
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("channel is closed")]
    Closed,
}
