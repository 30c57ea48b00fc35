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

use std::{os::unix::net::UnixListener, path::PathBuf};

use anyhow::Context;
use tracing::{info, instrument};

use crate::{config, hooks, mux};

pub mod signals;

/// Binds the control socket and runs the single-threaded readiness
/// loop until a term signal or an unrecoverable I/O error stops it.
///
/// Binds, spawns the signal handler, hands the listener to
/// `mux::Multiplexer` instead of `thread::spawn`-per-connection, and
/// cleans up the socket on the way out.
#[instrument(skip_all)]
pub fn run(
    config_manager: config::Manager,
    hooks: Box<dyn hooks::Hooks + Send + Sync>,
    log_level_handle: tracing_subscriber::reload::Handle<
        tracing_subscriber::filter::LevelFilter,
        tracing_subscriber::registry::Registry,
    >,
    socket: PathBuf,
) -> anyhow::Result<()> {
    let _ = &log_level_handle;
    info!("\n\n======================== STARTING DAEMON ============================\n\n");

    if socket.exists() {
        info!(path = %socket.display(), "removing stale socket");
        std::fs::remove_file(&socket).context("removing stale socket")?;
    }
    let listener = UnixListener::bind(&socket).context("binding to socket")?;
    listener.set_nonblocking(true).context("setting listener non-blocking")?;

    signals::Handler::new(Some(socket.clone())).spawn()?;

    let mut multiplexer = mux::Multiplexer::new(config_manager, hooks, listener)
        .context("constructing multiplexer")?;
    multiplexer.run()?;

    std::fs::remove_file(&socket).context("cleaning up socket on exit")?;

    Ok(())
}
