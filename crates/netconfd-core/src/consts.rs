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

use std::time;

pub const POLL_TICK: time::Duration = time::Duration::from_millis(200);

/// Fixed size of every buffer the pool allocates.
pub const BUF_SIZE: usize = 1024 * 16;

/// Bytes reserved at the start of every buffer so a 1.1 chunk header
/// (`\n#<len>\n`) can be written in place: `\n#` + up to 10 decimal
/// digits of length + `\n`.
pub const STARTCHUNK_PAD: usize = 13;

/// Default number of free buffers a session's pool will hold onto
/// before letting the allocator reclaim them.
pub const DEFAULT_MAX_FREE_BUFFERS: usize = 32;

/// Default hard cap on buffers a single session may have outstanding
/// before allocation is denied with `resource-denied`.
pub const DEFAULT_MAX_SESSION_BUFFERS: usize = 256;

/// Default outbound queue depth at which backpressure kicks in.
pub const DEFAULT_OUTPUT_QUEUE_CAP: usize = 32;

/// Cap on distinct predicate keys tracked per list step in an XPath
/// path; beyond this a warning is recorded but parsing continues.
pub const MAX_TRACKED_PREDICATE_KEYS: usize = 64;

/// Default idle timeout: close a session that has sent nothing for
/// this long.
pub const DEFAULT_IDLE_TIMEOUT: time::Duration = time::Duration::from_secs(30 * 60);

/// Default absolute session lifetime.
pub const DEFAULT_SESSION_LIFETIME: time::Duration = time::Duration::from_secs(24 * 60 * 60);

/// Default freshness window for cached virtual values.
pub const DEFAULT_VIRTUAL_CACHE_TIMEOUT: time::Duration = time::Duration::from_secs(5);

/// Default cap on an accepted 1.1 chunk `<len>`, used when
/// `max_chunk_len` is unset in config (open question:
/// left configurable rather than fixed by the protocol).
pub const DEFAULT_MAX_CHUNK_LEN: u32 = 16 * 1024 * 1024;

/// Default path of the local control socket the transport adaptor
/// connects to.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/ncxserver.sock";

/// Connect-handshake protocol version understood by this server.
pub const CONNECT_HEADER_VERSION: u32 = 1;

/// Env var the test harness uses to point at the test-hook socket.
pub const TEST_HOOK_SOCKET_VAR: &str = "NETCONFD_TEST_HOOK_SOCKET_PATH";

/// Env var carrying the shared connect-handshake magic token.
pub const CONNECT_MAGIC_VAR: &str = "NETCONFD_CONNECT_MAGIC";
