// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Manually lock or unlock the intercepting proxy, e.g. to recover a proxy left
//! locked by a test run that was killed.

use anyhow::Context;
use clap::{crate_version, Parser, Subcommand};

use mitm_control::{Client, HarnessConfig, LockId};

#[derive(Debug, Parser)]
#[clap(
    name = "mitmctl",
    about = "Lock or unlock the intercepting proxy's options",
    version = crate_version!()
)]
struct Opts {
    #[clap(flatten)]
    harness: HarnessConfig,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Replace the proxy's options and print the lock token.
    Lock {
        #[clap(help = r#"Options as JSON, e.g. {"callback": {"filter": "~m PUT"}}"#)]
        options: String,
    },
    /// Restore the proxy's default options.
    Unlock {
        #[clap(help = "Lock token printed by `lock`")]
        lock_id: String,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let opts = Opts::parse();
    let client = Client::new(&opts.harness)?;
    match opts.command {
        Command::Lock { options } => {
            let options: serde_json::Value =
                serde_json::from_str(&options).context("options must be JSON")?;
            let lock_id = client.lock_options(&options)?;
            println!("{}", String::from_utf8_lossy(lock_id.as_bytes()));
        }
        Command::Unlock { lock_id } => client.unlock_options(&LockId::from(lock_id))?,
    }
    Ok(())
}
