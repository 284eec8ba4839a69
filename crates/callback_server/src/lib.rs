// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Receives webhook calls from the intercepting proxy and hands each proxied HTTP
//! transaction to a test-supplied callback, which may override the transaction.
//!
//! The proxy calls `POST /request` before a matching request reaches the upstream
//! server and `POST /response` before a matching response reaches the client. The
//! JSON reply to each call is either `{}` (leave the transaction alone) or a
//! [`Response`] describing the override.

pub mod channel;
pub mod data;
pub mod error;
pub mod scope;
pub mod send_error;
pub mod server;

pub use channel::{ActiveChannel, PassiveChannel};
pub use data::{callback, CallbackFn, Data, Response};
pub use error::{ChannelError, ServerError};
pub use scope::{ServerTracker, TestScope};
pub use send_error::send_error;
pub use server::{CallbackServer, Phase};
