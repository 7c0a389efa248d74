// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! A hand-rolled GDB Remote Serial Protocol server (§4.8/§4.9) driving any
//! `labwired_core::debug::DebugTarget`. Built on `std::net`, plus `socket2`
//! solely to set `SO_REUSEADDR` before bind (`std::net::TcpListener` has no
//! way to set socket options pre-bind): the teacher workspace carries no
//! async runtime anywhere in its dependency graph, and this crate follows
//! that preference rather than reaching for `tokio` or the external
//! `gdbstub`/`gdbstub_arch` crates.

mod protocol;
mod server;
mod session;
mod transport;

pub use server::{GdbError, GdbServer};
