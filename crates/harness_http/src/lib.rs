// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Minimal HTTP plumbing shared by the callback server and the test proxy.
//!
//! Everything here is meant to be driven from synchronous test code, so servers own
//! the tokio runtime they are served on.

pub mod response;
pub mod server;

pub use server::{BackgroundServer, ServerError};
