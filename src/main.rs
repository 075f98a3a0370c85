// SPDX-License-Identifier: Apache-2.0

//! `mcbrokerd`: the normal-world broker daemon for a TrustZone secure
//! execution environment.

#![deny(clippy::all)]
#![warn(rust_2018_idioms)]

use std::process::ExitCode;

use clap::Parser;

fn main() -> anyhow::Result<ExitCode> {
    mcbroker::cli::Options::parse().execute()
}
