// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::error::ConfigError;

/// Magic host the proxy answers control requests on. Requests to it are never
/// intercepted.
pub const DEFAULT_CONTROLLER_URL: &str = "http://mitm.code";
pub const DEFAULT_HOSTNAME_RUNNING_HARNESS: &str = "localhost";
pub const DEFAULT_CONTROL_TIMEOUT_SECS: u64 = 5;

/// Where the proxy is and how it reaches back into the test process.
///
/// Usually read from the environment with [`from_env`](Self::from_env), but a TOML
/// file with the same (snake_case) keys works too.
#[derive(Clone, Debug, Deserialize, Parser, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    #[clap(
        long,
        env = "MITM_PROXY_URL",
        help = "HTTP proxy the control plane is reached through. Unset means connect directly"
    )]
    pub proxy_url: Option<String>,

    #[clap(
        long,
        env = "MITM_CONTROLLER_URL",
        default_value = DEFAULT_CONTROLLER_URL,
        help = "Base URL of the proxy's control endpoints"
    )]
    pub controller_url: String,

    #[clap(
        long,
        env = "MITM_HOSTNAME_RUNNING_HARNESS",
        default_value = DEFAULT_HOSTNAME_RUNNING_HARNESS,
        help = "Hostname the proxy uses to reach callback servers in this process"
    )]
    pub hostname_running_harness: String,

    #[clap(
        long,
        env = "MITM_CONTROL_TIMEOUT_SECS",
        default_value_t = DEFAULT_CONTROL_TIMEOUT_SECS,
        help = "Timeout for each control plane request, in seconds"
    )]
    pub control_timeout_secs: u64,
}

impl HarnessConfig {
    /// Read the configuration from `MITM_*` environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_args(["mitm_control"])
    }

    /// Parse command-line style arguments; the first is the program name.
    pub fn from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        Ok(Self::try_parse_from(args)?)
    }

    pub fn from_toml_str(config: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(config)?)
    }

    pub fn from_toml_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml_str(&config)
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_secs(self.control_timeout_secs)
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            proxy_url: None,
            controller_url: DEFAULT_CONTROLLER_URL.to_owned(),
            hostname_running_harness: DEFAULT_HOSTNAME_RUNNING_HARNESS.to_owned(),
            control_timeout_secs: DEFAULT_CONTROL_TIMEOUT_SECS,
        }
    }
}
