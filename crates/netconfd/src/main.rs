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

//! netconfd is a NETCONF server core: it accepts already-authenticated,
//! already-framed byte streams from a local transport adaptor over a
//! Unix control socket and speaks NETCONF 1.0/1.1 session framing and
//! schema-directed XML value parsing against them. See the workspace
//! README for more info.

use std::path::PathBuf;
use std::{env, io};

use anyhow::Context;
use clap::{Parser, Subcommand};
use netconfd_core::{config, consts, daemon, test_hooks, NoopHooks};
use tracing_subscriber::{filter::LevelFilter, fmt::format::FmtSpan, prelude::*};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[arg(
        short,
        long,
        help = "The file to write logs to

Logs are discarded by default. If netconfd is running as a daemon,
logs go to stderr by default instead."
    )]
    log_file: Option<String>,

    #[arg(short, long, action = clap::ArgAction::Count, help = "Show more in logs, may be provided multiple times")]
    verbose: u8,

    #[arg(
        short,
        long,
        help = "The path of the unix control socket to listen on

Defaults to the value baked into the config file, or /tmp/ncxserver.sock
if neither is set."
    )]
    socket: Option<String>,

    #[arg(short, long, help = "a toml file containing configuration")]
    config_file: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Starts the server, listening on the control socket")]
    Serve,

    #[command(about = "Parses the config file (or the default one) and reports any errors, without starting the server")]
    CheckConfig,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let trace_level = match args.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    let filter = LevelFilter::from_level(trace_level);
    let (filter, log_level_handle) = tracing_subscriber::reload::Layer::new(filter);
    let registry = tracing_subscriber::registry().with(filter);

    match (&args.log_file, &args.command) {
        (Some(log_file), _) => {
            let file = std::fs::File::create(log_file).context("creating log file")?;
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_thread_ids(true)
                        .with_target(false)
                        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                        .with_writer(std::sync::Mutex::new(file)),
                )
                .init();
        }
        (None, Commands::Serve) => {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_thread_ids(true)
                        .with_target(false)
                        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                        .with_writer(io::stderr),
                )
                .init();
        }
        (None, Commands::CheckConfig) => {
            registry.with(tracing_subscriber::fmt::layer().with_writer(io::stderr)).init();
        }
    }

    #[cfg(feature = "test_hooks")]
    if let Ok(test_hook_sock) = env::var(consts::TEST_HOOK_SOCKET_VAR) {
        tracing::info!(path = %test_hook_sock, "spawning test hook socket");
        test_hooks::TEST_HOOK_SERVER.set_socket_path(test_hook_sock);
        std::thread::spawn(|| {
            test_hooks::TEST_HOOK_SERVER.start();
        });
        test_hooks::TEST_HOOK_SERVER.wait_for_connect()?;
    }

    match args.command {
        Commands::CheckConfig => check_config(args.config_file),
        Commands::Serve => serve(args.config_file, args.socket, log_level_handle),
    }
}

fn check_config(config_file: Option<String>) -> anyhow::Result<()> {
    let config = config::read_config(&config_file).context("parsing config")?;
    println!("config ok: {config:#?}");
    Ok(())
}

fn serve(
    config_file: Option<String>,
    socket_override: Option<String>,
    log_level_handle: tracing_subscriber::reload::Handle<LevelFilter, tracing_subscriber::Registry>,
) -> anyhow::Result<()> {
    let manager = config::Manager::new(config_file).context("loading config")?;
    let socket = socket_override.unwrap_or_else(|| manager.get().socket_path());

    daemon::run(manager, Box::new(NoopHooks), log_level_handle, PathBuf::from(socket))
}
