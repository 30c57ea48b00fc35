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

//! Session control block (component B).
//!
//! A per-connection state struct looked up from a table held by the
//! server, generalized from one shell-process-per-session to one
//! parse/IO-state-per-session and from a name-keyed table to a
//! `SessionId`-keyed one, since NETCONF peers are not named.

use std::time::{Duration, Instant};

use netconfd_protocol::FramingMode;

use crate::framing::{FramingDecoder, OutputQueue};

pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    HelloWait,
    Idle,
    ShutdownRequested,
    Shutdown,
}

/// Per-session state: queues, framing mode, and the bookkeeping the
/// multiplexer needs to enforce idle/lifetime limits and backpressure.
pub struct Session {
    pub id: SessionId,
    pub peer_user: String,
    pub peer_address: String,
    pub state: SessionState,
    pub decoder: FramingDecoder,
    pub inbound_messages: std::collections::VecDeque<Vec<u8>>,
    pub output: OutputQueue,
    pub negotiated_1_1: bool,
    pub cache_timeout: Duration,
    pub idle_timeout: Duration,
    pub lifetime: Duration,
    pub created_at: Instant,
    pub last_activity: Instant,
}

impl Session {
    pub fn new(
        id: SessionId,
        peer_user: String,
        peer_address: String,
        max_chunk_len: u32,
        output_cap: usize,
        idle_timeout: Duration,
        lifetime: Duration,
        cache_timeout: Duration,
    ) -> Self {
        let now = Instant::now();
        Session {
            id,
            peer_user,
            peer_address,
            state: SessionState::Init,
            decoder: FramingDecoder::new(max_chunk_len),
            inbound_messages: std::collections::VecDeque::new(),
            output: OutputQueue::new(output_cap),
            negotiated_1_1: false,
            cache_timeout,
            idle_timeout,
            lifetime,
            created_at: now,
            last_activity: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Upgrades the session's decoder to 1.1 chunked framing once both
    /// peers have advertised the base:1.1 capability.
    pub fn negotiate_1_1(&mut self) {
        self.negotiated_1_1 = true;
        self.decoder.set_mode(FramingMode::Chunked);
    }

    pub fn is_idle_expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_activity) >= self.idle_timeout
    }

    pub fn is_lifetime_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) >= self.lifetime
    }

    /// Transition to `shutdown-requested`: stop accepting new inbound
    /// messages but keep draining whatever is already queued outbound
    /// ("cancellation").
    pub fn request_shutdown(&mut self) {
        if self.state != SessionState::Shutdown {
            self.state = SessionState::ShutdownRequested;
        }
    }

    pub fn accepts_inbound(&self) -> bool {
        matches!(
            self.state,
            SessionState::Init | SessionState::HelloWait | SessionState::Idle
        )
    }

    pub fn ready_to_close(&self) -> bool {
        self.state == SessionState::ShutdownRequested && self.output.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn make(idle: Duration, lifetime: Duration) -> Session {
        Session::new(1, "alice".into(), "127.0.0.1".into(), 1 << 20, 32, idle, lifetime, Duration::from_secs(5))
    }

    #[test]
    fn negotiate_switches_decoder_mode() {
        let mut s = make(Duration::from_secs(60), Duration::from_secs(60));
        assert_eq!(s.decoder.mode(), FramingMode::EndOfMessage);
        s.negotiate_1_1();
        assert_eq!(s.decoder.mode(), FramingMode::Chunked);
    }

    #[test]
    fn shutdown_requested_blocks_new_inbound_but_drains_output() {
        let mut s = make(Duration::from_secs(60), Duration::from_secs(60));
        s.output.enqueue(vec![1, 2, 3]).unwrap();
        s.request_shutdown();
        assert!(!s.accepts_inbound());
        assert!(!s.ready_to_close());
        s.output.pop_front();
        assert!(s.ready_to_close());
    }

    #[test]
    fn idle_and_lifetime_expiry() {
        let s = make(Duration::from_millis(1), Duration::from_secs(600));
        std::thread::sleep(Duration::from_millis(5));
        assert!(s.is_idle_expired(Instant::now()));
        assert!(!s.is_lifetime_expired(Instant::now()));
    }
}
