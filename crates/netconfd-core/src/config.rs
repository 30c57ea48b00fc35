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

use std::{
    fs,
    sync::{Arc, RwLock},
};

use anyhow::Context;
use serde_derive::Deserialize;
use tracing::{error, info, instrument, warn};

use crate::{config_watcher::ConfigWatcher, consts, duration};

#[instrument(skip_all)]
pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    let mut config = Config::default();
    if let Some(config_path) = config_file {
        info!("parsing explicitly passed in config ({})", config_path);
        let config_str = fs::read_to_string(config_path).context("reading config toml")?;
        config = toml::from_str(&config_str).context("parsing config file")?;
    } else {
        let default_path = std::path::PathBuf::from("/etc/netconfd/config.toml");
        if default_path.exists() {
            let config_str =
                fs::read_to_string(&default_path).context("reading default config toml")?;
            config = toml::from_str(&config_str).context("parsing default config file")?;
        }
    }

    Ok(config)
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Config {
    /// The path of the local control socket the transport adaptor
    /// connects to. Defaults to `consts::DEFAULT_SOCKET_PATH`.
    pub socket: Option<String>,

    /// Shared token the connect handshake's `magic` attribute must
    /// match. If unset, the value of `NETCONFD_CONNECT_MAGIC` is used,
    /// and if that is unset too, the handshake check is skipped
    /// (useful for local testing, never for production).
    pub connect_magic: Option<String>,

    /// Fixed size of every buffer the pool allocates, in bytes.
    pub buf_size: Option<usize>,

    /// Number of free buffers a session's pool holds onto before
    /// letting the allocator reclaim them.
    pub max_free_buffers: Option<usize>,

    /// Hard cap on buffers a single session may have outstanding
    /// before allocation is denied with `resource-denied`.
    pub max_session_buffers: Option<usize>,

    /// Outbound queue depth at which backpressure kicks in.
    pub output_queue_cap: Option<usize>,

    /// Maximum accepted 1.1 chunk `<len>`. Left unstated by design
    /// (see DESIGN.md "open questions"); operators must size it for
    /// their deployment.
    pub max_chunk_len: Option<u32>,

    /// How long a session may sit idle before being moved to
    /// `shutdown-requested`. Accepts the same duration syntax as
    /// `duration::parse` (`"30m"`, `"1h"`, `"1:30:00"`, ...).
    pub idle_timeout: Option<String>,

    /// Absolute session lifetime, same syntax as `idle_timeout`.
    pub session_lifetime: Option<String>,

    /// Freshness window for cached virtual values, same syntax as
    /// `idle_timeout`.
    pub virtual_cache_timeout: Option<String>,

    /// When true, unprefixed / unresolvable XML namespace prefixes
    /// encountered by the XPath sub-evaluator are tolerated rather
    /// than rejected outright ("lax-namespaces flag").
    pub lax_namespaces: Option<bool>,

    /// When true, the schema-directed parser requires container/list
    /// children to arrive in schema-declared order; when false (the
    /// default), any legal child is accepted regardless of position.
    pub enforce_xml_order: Option<bool>,
}

impl Config {
    pub fn socket_path(&self) -> String {
        self.socket.clone().unwrap_or_else(|| consts::DEFAULT_SOCKET_PATH.to_string())
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size.unwrap_or(consts::BUF_SIZE)
    }

    pub fn max_free_buffers(&self) -> usize {
        self.max_free_buffers.unwrap_or(consts::DEFAULT_MAX_FREE_BUFFERS)
    }

    pub fn max_session_buffers(&self) -> usize {
        self.max_session_buffers.unwrap_or(consts::DEFAULT_MAX_SESSION_BUFFERS)
    }

    pub fn output_queue_cap(&self) -> usize {
        self.output_queue_cap.unwrap_or(consts::DEFAULT_OUTPUT_QUEUE_CAP)
    }

    pub fn idle_timeout(&self) -> anyhow::Result<std::time::Duration> {
        match &self.idle_timeout {
            Some(s) => duration::parse(s),
            None => Ok(consts::DEFAULT_IDLE_TIMEOUT),
        }
    }

    pub fn session_lifetime(&self) -> anyhow::Result<std::time::Duration> {
        match &self.session_lifetime {
            Some(s) => duration::parse(s),
            None => Ok(consts::DEFAULT_SESSION_LIFETIME),
        }
    }

    pub fn virtual_cache_timeout(&self) -> anyhow::Result<std::time::Duration> {
        match &self.virtual_cache_timeout {
            Some(s) => duration::parse(s),
            None => Ok(consts::DEFAULT_VIRTUAL_CACHE_TIMEOUT),
        }
    }

    pub fn lax_namespaces(&self) -> bool {
        self.lax_namespaces.unwrap_or(false)
    }

    pub fn enforce_xml_order(&self) -> bool {
        self.enforce_xml_order.unwrap_or(false)
    }
}

/// Holds the live `Config` behind a lock and keeps it fresh by
/// watching the backing file with `config_watcher::ConfigWatcher`.
/// Cloning a `Manager` is cheap; every clone shares the same
/// underlying value and watcher thread.
pub struct Manager {
    inner: Arc<RwLock<Config>>,
    config_file: Option<String>,
    // kept alive for as long as the Manager is; dropping it stops
    // the watcher thread.
    _watcher: Option<Arc<ConfigWatcher>>,
}

impl Clone for Manager {
    fn clone(&self) -> Self {
        Manager {
            inner: self.inner.clone(),
            config_file: self.config_file.clone(),
            _watcher: self._watcher.clone(),
        }
    }
}

impl Manager {
    /// Loads the config once, then starts watching its backing file
    /// (if one was given) for changes so future `get()` calls observe
    /// edits without a daemon restart.
    pub fn new(config_file: Option<String>) -> anyhow::Result<Self> {
        let config = read_config(&config_file)?;
        let inner = Arc::new(RwLock::new(config));

        let watcher = match &config_file {
            Some(path) => {
                let path = path.clone();
                let inner_for_reload = inner.clone();
                let reload_path = path.clone();
                match ConfigWatcher::new(move || {
                    match read_config(&Some(reload_path.clone())) {
                        Ok(fresh) => {
                            info!(path = %reload_path, "reloaded config");
                            *inner_for_reload.write().unwrap() = fresh;
                        }
                        Err(e) => {
                            error!(path = %reload_path, error = %e, "failed to reload config, keeping old value");
                        }
                    }
                }) {
                    Ok(w) => match w.watch(&path) {
                        Ok(()) => Some(Arc::new(w)),
                        Err(e) => {
                            warn!(error = %e, "could not watch config file, hot-reload disabled");
                            None
                        }
                    },
                    Err(e) => {
                        warn!(error = %e, "could not start config watcher, hot-reload disabled");
                        None
                    }
                }
            }
            None => None,
        };

        Ok(Manager { inner, config_file, _watcher: watcher })
    }

    /// Returns a cheap clone of the current config value.
    pub fn get(&self) -> Config {
        self.inner.read().unwrap().clone()
    }

    pub fn config_file(&self) -> Option<&str> {
        self.config_file.as_deref()
    }
}
