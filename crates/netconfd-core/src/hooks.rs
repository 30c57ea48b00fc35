// Copyright 2024 Google LLC
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

/// Callbacks that the wrapping binary can implement in order to do
/// stuff like inject telemetry into the daemon or trigger background
/// processes keyed off a session's lifecycle.
///
/// Hooks are invoked inline within the multiplexer's control flow, so
/// you MUST NOT block for extended periods of time. If you need to do
/// work that could block for a while, spin up a worker thread and
/// enqueue events so the hooks can be processed async.
///
/// It would be nicer if the hooks took `&mut self`, but they are called
/// from an immutable context and it is nice to avoid the
/// synchronization / interior mutability unless it is required. Users
/// can always get mutable state with a cell / mutex.
///
/// Any errors returned will simply be logged.
///
/// All hooks do nothing by default.
pub trait Hooks {
    /// Triggered once a session's connect handshake has been accepted.
    fn on_session_open(&self, _session_id: u64, _peer_user: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Triggered when a session transitions to `shutdown-requested`
    /// (idle timeout, absolute lifetime, or peer close).
    fn on_session_shutdown_requested(&self, _session_id: u64) -> anyhow::Result<()> {
        Ok(())
    }

    /// Triggered when a session's descriptor is finally closed and its
    /// resources released.
    fn on_session_close(&self, _session_id: u64) -> anyhow::Result<()> {
        Ok(())
    }

    /// Triggered every time an `<rpc-error>` is recorded against a
    /// session's message, regardless of whether the enclosing
    /// operation ultimately succeeds.
    fn on_rpc_error(&self, _session_id: u64, _error_tag: &str) -> anyhow::Result<()> {
        Ok(())
    }
}
