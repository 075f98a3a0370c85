// SPDX-License-Identifier: Apache-2.0

#![doc = include_str!("../README.md")]
#![deny(clippy::all)]
#![warn(rust_2018_idioms)]

pub mod cli;
pub mod client;
pub mod device;
pub mod error;
pub mod kmod;
pub mod mci;
pub mod proto;
pub mod registry;
pub mod server;
pub mod sync;
pub mod wsm;

/// Default abstract socket name shared by the daemon and its clients.
pub const DEFAULT_SOCKET: &str = "mcbroker.socket";

/// Default kernel driver node.
pub const DEFAULT_DEVICE_NODE: &str = "/dev/mobicore";
