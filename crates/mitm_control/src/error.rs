// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::path::PathBuf;

/// Errors talking to the proxy's control plane.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("could not build control plane client: {0}")]
    Build(#[source] reqwest::Error),
    #[error("encoding {encoding}: {source}")]
    Encode {
        encoding: String,
        source: serde_json::Error,
    },
    #[error("while {ctx}: {source}")]
    Request { ctx: String, source: reqwest::Error },
    #[error("while {ctx}: controller returned HTTP {status}: {body}")]
    Status { ctx: String, status: u16, body: String },
}

impl ControlError {
    /// HTTP status the controller answered with, if it answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            ControlError::Status { status, .. } => Some(*status),
            ControlError::Request { source, .. } => source.status().map(|s| s.as_u16()),
            ControlError::Build(_) | ControlError::Encode { .. } => None,
        }
    }
}

/// Errors loading a [`HarnessConfig`](crate::HarnessConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid harness environment: {0}")]
    Env(#[from] clap::Error),
    #[error("couldn't open config TOML {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("couldn't parse as TOML: {0}")]
    Toml(#[from] toml::de::Error),
}
