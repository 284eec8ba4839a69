// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Control plane for the intercepting proxy used by integration tests.
//!
//! A test describes what it wants intercepted (a [`Filter`] plus request and/or
//! response callbacks) and [`Configuration::apply`] installs that on the proxy for the
//! duration of a closure. Installing takes the proxy's configuration lock, so only one
//! test may be configuring the proxy at a time; overlapping `apply` scopes are the
//! caller's responsibility to avoid.
//!
//! ```ignore
//! let client = Client::new(&HarnessConfig::from_env()?)?;
//! let scope = TestScope::current();
//! let channel = PassiveChannel::new(Duration::from_secs(5), false);
//! client.configure(&scope).apply(
//!     ConfigOpts::new()
//!         .filter(FilterParams::new().path_contains("/keys/upload"))
//!         .request_callback(channel.callback()),
//!     || {
//!         upload_keys();
//!         channel.recv(&scope, "keys were never uploaded");
//!     },
//! );
//! ```

pub mod client;
pub mod config;
pub mod configuration;
pub mod error;
pub mod filter;

#[cfg(test)]
mod test_controller;

pub use client::{Client, LockId};
pub use config::HarnessConfig;
pub use configuration::{ConfigOpts, Configuration, PathConfiguration};
pub use error::{ConfigError, ControlError};
pub use filter::{Filter, FilterExpression, FilterParams};
