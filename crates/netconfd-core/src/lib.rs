// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! `netconfd-core` implements the session core: per-session buffer
//! pools and NETCONF 1.0/1.1 framing, a single-threaded I/O
//! multiplexer, a schema-directed XML value parser, and the
//! restricted-XPath validator it depends on for `leafref` and
//! `instance-identifier` leaves.
//!
//! The wrapping `netconfd` binary crate owns argument parsing and
//! process setup; this crate exposes `daemon::run` as its entry point.

pub mod config;
pub mod config_watcher;
pub mod consts;
pub mod daemon;
pub mod duration;
pub mod errors;
pub mod framing;
pub mod hooks;
pub mod mux;
pub mod parser;
pub mod schema;
pub mod serialize;
pub mod session;
pub mod test_hooks;
pub mod value;
pub mod xml;
pub mod xpath;

pub use hooks::Hooks;

pub struct NoopHooks;
impl Hooks for NoopHooks {}
