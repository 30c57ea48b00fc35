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

//! Single-threaded readiness-loop I/O multiplexer (component C).
//!
//! Earlier daemon designs in this vein spawn a thread per connection
//! and block that thread on handshake decode and on blocking
//! reads/writes for the rest of its life. A control socket carrying
//! many long-lived, mostly-idle NETCONF sessions calls instead for a
//! single cooperative loop driven by level-triggered readiness, so
//! this module keeps the familiar accept/dispatch shape (an accept
//! loop, per-message dispatch) but rebuilds it on `mio::Poll` with
//! every session's state held in a table keyed by `mio::Token` instead
//! of captured in a thread's stack.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixListener as StdUnixListener;
use std::time::Instant;

use mio::net::{UnixListener, UnixStream};
use mio::{Events, Interest, Poll, Token};
use netconfd_protocol::{ConnectHeader, ErrorSeverity, ErrorTag, ErrorType, FramingError, RpcError};
use tracing::{debug, info, instrument, warn};

use crate::config;
use crate::consts;
use crate::framing::BufferPool;
use crate::hooks::Hooks;
use crate::session::{Session, SessionId, SessionState};

const LISTENER: Token = Token(0);

/// `urn:ietf:params:netconf:base:1.1` sniffed out of a raw `<hello>`
/// body. A full schema-directed parse of `<hello>` is unnecessary: the
/// multiplexer only needs to know whether to flip the session's
/// framing mode, which components D-G never see since they operate on
/// already-framed RPC bodies.
const BASE_1_1_CAPABILITY: &str = "urn:ietf:params:netconf:base:1.1";

const SERVER_HELLO: &str = concat!(
    "<hello xmlns=\"urn:ietf:params:xml:ns:netconf:base:1.0\">",
    "<capabilities>",
    "<capability>urn:ietf:params:netconf:base:1.0</capability>",
    "<capability>urn:ietf:params:netconf:base:1.1</capability>",
    "</capabilities>",
    "</hello>",
);

/// Bound on how many bytes of un-decodable prefix we'll accumulate
/// before giving up on a connect handshake.
const HANDSHAKE_MAX_BYTES: usize = 4096;

struct Conn {
    stream: UnixStream,
    session: Session,
    pool: BufferPool,
    /// `Some` until the connect handshake has been decoded; holds
    /// whatever prefix has arrived so far.
    handshake: Option<Vec<u8>>,
    /// Bytes of the front output buffer already written, for
    /// resuming a partial `write()`.
    write_offset: usize,
    /// Set when the connection should be torn down at the end of the
    /// current loop iteration, regardless of pending output.
    hard_close: bool,
}

pub struct Multiplexer {
    config: config::Manager,
    hooks: Box<dyn Hooks + Send + Sync>,
    poll: Poll,
    listener: UnixListener,
    conns: HashMap<Token, Conn>,
    next_token: usize,
    next_session_id: SessionId,
}

impl Multiplexer {
    pub fn new(
        config: config::Manager,
        hooks: Box<dyn Hooks + Send + Sync>,
        listener: StdUnixListener,
    ) -> anyhow::Result<Self> {
        listener.set_nonblocking(true)?;
        let mut listener = UnixListener::from_std(listener);
        let poll = Poll::new()?;
        poll.registry().register(&mut listener, LISTENER, Interest::READABLE)?;
        Ok(Multiplexer {
            config,
            hooks,
            poll,
            listener,
            conns: HashMap::new(),
            next_token: 1,
            next_session_id: 1,
        })
    }

    #[instrument(skip_all)]
    pub fn run(&mut self) -> anyhow::Result<()> {
        let mut events = Events::with_capacity(1024);
        loop {
            self.poll.poll(&mut events, Some(consts::POLL_TICK))?;

            for event in events.iter() {
                let token = event.token();
                if token == LISTENER {
                    self.accept_all();
                    continue;
                }
                if event.is_readable() {
                    self.do_read(token);
                }
                if event.is_writable() {
                    self.do_write(token);
                }
                self.update_interest(token);
            }

            self.reap_timeouts();
            self.sweep_closed();
        }
    }

    fn next_token(&mut self) -> Token {
        let t = Token(self.next_token);
        self.next_token += 1;
        t
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => self.on_accept(stream),
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn on_accept(&mut self, stream: UnixStream) {
        let cfg = self.config.get();
        let token = self.next_token();
        let mut stream = stream;
        if let Err(e) = self.poll.registry().register(&mut stream, token, Interest::READABLE) {
            warn!(error = %e, "failed to register new connection, dropping it");
            return;
        }

        let session_id = self.next_session_id;
        self.next_session_id += 1;
        let max_chunk_len = cfg.max_chunk_len.unwrap_or(consts::DEFAULT_MAX_CHUNK_LEN);
        let (idle_timeout, lifetime, cache_timeout) =
            match (cfg.idle_timeout(), cfg.session_lifetime(), cfg.virtual_cache_timeout()) {
                (Ok(i), Ok(l), Ok(c)) => (i, l, c),
                _ => {
                    warn!("invalid duration config, falling back to built-in defaults");
                    (consts::DEFAULT_IDLE_TIMEOUT, consts::DEFAULT_SESSION_LIFETIME, consts::DEFAULT_VIRTUAL_CACHE_TIMEOUT)
                }
            };
        let session = Session::new(
            session_id,
            String::new(),
            String::new(),
            max_chunk_len,
            cfg.output_queue_cap(),
            idle_timeout,
            lifetime,
            cache_timeout,
        );
        let pool = BufferPool::new(cfg.buf_size(), cfg.max_free_buffers(), cfg.max_session_buffers());

        debug!(session = session_id, "accepted connection");
        self.conns.insert(
            token,
            Conn { stream, session, pool, handshake: Some(Vec::new()), write_offset: 0, hard_close: false },
        );
    }

    /// Reads everything currently available on `token`'s socket,
    /// routing bytes through the connect handshake decoder until it
    /// completes and through the session's `FramingDecoder` after.
    fn do_read(&mut self, token: Token) {
        let magic = self.config.get().connect_magic;
        let Some(conn) = self.conns.get_mut(&token) else { return };

        loop {
            let mut buf = match conn.pool.acquire() {
                Ok(b) => b,
                Err(_) => {
                    warn!(session = conn.session.id, "buffer pool exhausted, closing session");
                    conn.hard_close = true;
                    break;
                }
            };

            let read_result = conn.stream.read(buf.write_region());
            let n = match read_result {
                Ok(0) => {
                    conn.pool.release(buf);
                    conn.hard_close = true;
                    break;
                }
                Ok(n) => n,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    conn.pool.release(buf);
                    break;
                }
                Err(e) => {
                    warn!(session = conn.session.id, error = %e, "read error, closing session");
                    conn.pool.release(buf);
                    conn.hard_close = true;
                    break;
                }
            };
            buf.advance_write(n);
            let chunk = buf.payload().to_vec();
            conn.pool.release(buf);

            if conn.handshake.is_some() {
                if !Self::feed_handshake(conn, &chunk, magic.as_deref()) {
                    break;
                }
            } else {
                conn.session.decoder.push(&chunk);
                conn.session.touch();
            }
        }

        let ready_for_dispatch = conn.handshake.is_none() && !conn.hard_close;
        if ready_for_dispatch {
            self.drain_inbound(token);
        }
    }

    /// Appends `chunk` to the in-progress handshake buffer and tries
    /// to decode a complete `ConnectHeader`. Returns `false` if the
    /// connection should stop being read from this iteration (either
    /// because the handshake just completed and any leftover bytes
    /// were already handed to the framing decoder, or because the
    /// handshake was rejected and the connection is closing).
    fn feed_handshake(conn: &mut Conn, chunk: &[u8], expected_magic: Option<&str>) -> bool {
        let hbuf = conn.handshake.as_mut().expect("feed_handshake called without a pending handshake");
        hbuf.extend_from_slice(chunk);

        let mut cursor = std::io::Cursor::new(hbuf.as_slice());
        match rmp_serde::from_read::<_, ConnectHeader>(&mut cursor) {
            Ok(header) => {
                let consumed = cursor.position() as usize;
                let leftover: Vec<u8> = hbuf[consumed..].to_vec();
                conn.handshake = None;

                if let Some(expected) = expected_magic {
                    if header.magic != expected {
                        warn!(session = conn.session.id, "connect handshake magic mismatch, closing");
                        conn.hard_close = true;
                        return false;
                    }
                }

                conn.session.peer_user = header.user;
                conn.session.peer_address = header.address;
                conn.session.state = SessionState::HelloWait;
                if !leftover.is_empty() {
                    conn.session.decoder.push(&leftover);
                    conn.session.touch();
                }
                let _ = conn.session.output.enqueue(crate::framing::encode_eom(SERVER_HELLO.as_bytes()));
                true
            }
            Err(_) if hbuf.len() > HANDSHAKE_MAX_BYTES => {
                warn!(session = conn.session.id, "malformed connect handshake, closing");
                conn.hard_close = true;
                false
            }
            Err(_) => true,
        }
    }

    /// Pulls every complete message the session's decoder can produce
    /// and either consumes it at the multiplexer level (hello
    /// negotiation, framing errors) or hands it off to
    /// `inbound_messages` for the components above this one.
    fn drain_inbound(&mut self, token: Token) {
        loop {
            let next = match self.conns.get_mut(&token) {
                Some(conn) => conn.session.decoder.try_next_message(),
                None => return,
            };
            match next {
                Ok(Some(message)) => {
                    let in_hello_wait = match self.conns.get_mut(&token) {
                        Some(conn) => {
                            conn.session.touch();
                            conn.session.state == SessionState::HelloWait
                        }
                        None => return,
                    };
                    if in_hello_wait {
                        self.handle_client_hello(token, &message);
                    } else if let Some(conn) = self.conns.get_mut(&token) {
                        conn.session.inbound_messages.push_back(message);
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    self.handle_framing_error(token, e);
                    return;
                }
            }
        }
    }

    fn handle_client_hello(&mut self, token: Token, message: &[u8]) {
        let negotiated_1_1 = std::str::from_utf8(message)
            .map(|s| s.contains(BASE_1_1_CAPABILITY))
            .unwrap_or(false);
        if let Some(conn) = self.conns.get_mut(&token) {
            if negotiated_1_1 {
                conn.session.negotiate_1_1();
            }
            conn.session.state = SessionState::Idle;
            let id = conn.session.id;
            let user = conn.session.peer_user.clone();
            if let Err(e) = self.hooks.on_session_open(id, &user) {
                warn!(session = id, error = %e, "on_session_open hook failed");
            }
        }
    }

    fn handle_framing_error(&mut self, token: Token, error: FramingError) {
        let Some(conn) = self.conns.get_mut(&token) else { return };
        let tag = match error {
            FramingError::ChunkTooLarge(..) => ErrorTag::ResourceDenied,
            FramingError::ResourceDenied => ErrorTag::ResourceDenied,
            FramingError::MalformedChunkHeader
            | FramingError::MalformedEom
            | FramingError::PartialChunkAtEof => ErrorTag::MalformedMessage,
        };
        let rpc_error = RpcError::new(ErrorType::Transport, tag).with_message(error.to_string());
        warn!(session = conn.session.id, error = %error, "framing error, closing session");
        let id = conn.session.id;
        if let Err(e) = self.hooks.on_rpc_error(id, &rpc_error.error_tag.to_string()) {
            warn!(session = id, error = %e, "on_rpc_error hook failed");
        }
        if let Some(conn) = self.conns.get_mut(&token) {
            let _ = conn.session.output.enqueue(crate::framing::encode_eom(render_rpc_error(&rpc_error).as_bytes()));
            conn.session.request_shutdown();
        }
    }

    /// Flushes as much of the session's pending output as the socket
    /// will currently accept, resuming from `write_offset` on a
    /// partial write.
    fn do_write(&mut self, token: Token) {
        let Some(conn) = self.conns.get_mut(&token) else { return };
        loop {
            let Some(front) = conn.session.output.pop_front() else { return };
            let mut offset = conn.write_offset;
            conn.write_offset = 0;
            loop {
                match conn.stream.write(&front[offset..]) {
                    Ok(0) => {
                        conn.hard_close = true;
                        return;
                    }
                    Ok(n) => {
                        offset += n;
                        if offset >= front.len() {
                            break;
                        }
                    }
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                        conn.write_offset = offset;
                        conn.session.output.push_front(front);
                        return;
                    }
                    Err(e) => {
                        warn!(session = conn.session.id, error = %e, "write error, closing session");
                        conn.hard_close = true;
                        return;
                    }
                }
            }
        }
    }

    /// Re-registers interest for `token` based on whether it has
    /// pending output, so the poller doesn't spin on writable
    /// readiness once a session is caught up.
    fn update_interest(&mut self, token: Token) {
        let Some(conn) = self.conns.get_mut(&token) else { return };
        if conn.hard_close {
            return;
        }
        let interest = if conn.session.output.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };
        if let Err(e) = self.poll.registry().reregister(&mut conn.stream, token, interest) {
            warn!(session = conn.session.id, error = %e, "reregister failed, closing session");
            conn.hard_close = true;
        }
    }

    /// Moves idle/lifetime-expired sessions to `shutdown-requested`.
    fn reap_timeouts(&mut self) {
        let now = Instant::now();
        let mut to_notify = Vec::new();
        for conn in self.conns.values_mut() {
            if conn.session.state == SessionState::Shutdown || conn.hard_close {
                continue;
            }
            if conn.session.is_idle_expired(now) || conn.session.is_lifetime_expired(now) {
                if conn.session.state != SessionState::ShutdownRequested {
                    conn.session.request_shutdown();
                    to_notify.push(conn.session.id);
                }
            }
        }
        for id in to_notify {
            if let Err(e) = self.hooks.on_session_shutdown_requested(id) {
                warn!(session = id, error = %e, "on_session_shutdown_requested hook failed");
            }
        }
    }

    /// Removes every connection that is either hard-closing or has
    /// finished draining its output after a graceful shutdown.
    fn sweep_closed(&mut self) {
        let done: Vec<Token> =
            self.conns.iter().filter(|(_, c)| c.hard_close || c.session.ready_to_close()).map(|(t, _)| *t).collect();

        for token in done {
            if let Some(mut conn) = self.conns.remove(&token) {
                let _ = conn.session.decoder.finish();
                let _ = self.poll.registry().deregister(&mut conn.stream);
                let _ = conn.stream.shutdown(std::net::Shutdown::Both);
                info!(session = conn.session.id, "session closed");
                if let Err(e) = self.hooks.on_session_close(conn.session.id) {
                    warn!(session = conn.session.id, error = %e, "on_session_close hook failed");
                }
            }
        }
    }
}

/// Renders a single `RpcError` as a minimal `<rpc-reply><rpc-error>`
/// envelope. This is deliberately hand-built rather than routed
/// through the value-tree serializer (component I): a protocol-level
/// error discovered below the framing layer has no value tree to
/// serialize, only the fixed handful of rpc-error fields.
fn render_rpc_error(error: &RpcError) -> String {
    let severity = match error.error_severity {
        ErrorSeverity::Error => "error",
        ErrorSeverity::Warning => "warning",
    };
    let error_type = match error.error_type {
        ErrorType::Transport => "transport",
        ErrorType::Rpc => "rpc",
        ErrorType::Protocol => "protocol",
        ErrorType::Application => "application",
    };
    let mut out = String::new();
    out.push_str("<rpc-reply xmlns=\"urn:ietf:params:xml:ns:netconf:base:1.0\"><rpc-error>");
    out.push_str(&format!("<error-type>{}</error-type>", error_type));
    out.push_str(&format!("<error-tag>{}</error-tag>", error.error_tag));
    out.push_str(&format!("<error-severity>{}</error-severity>", severity));
    if let Some(path) = &error.error_path {
        out.push_str(&format!("<error-path>{}</error-path>", escape_xml_text(path)));
    }
    if let Some(message) = &error.error_message {
        out.push_str(&format!("<error-message>{}</error-message>", escape_xml_text(message)));
    }
    out.push_str("</rpc-error></rpc-reply>");
    out
}

fn escape_xml_text(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rpc_error_renders_well_formed_envelope() {
        let error = RpcError::new(ErrorType::Transport, ErrorTag::MalformedMessage)
            .with_message("chunk length 99 exceeds configured maximum 10");
        let xml = render_rpc_error(&error);
        assert!(xml.starts_with("<rpc-reply "));
        assert!(xml.contains("<error-tag>malformed-message</error-tag>"));
        assert!(xml.contains("<error-type>transport</error-type>"));
        assert!(xml.ends_with("</rpc-reply>"));
    }

    #[test]
    fn escape_xml_text_escapes_reserved_chars() {
        assert_eq!(escape_xml_text("a < b & c > d"), "a &lt; b &amp; c &gt; d");
    }
}
