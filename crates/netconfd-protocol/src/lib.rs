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

//! Wire-level types shared between the session multiplexer, the
//! schema-directed parser, and the error recorder. Nothing in this
//! crate depends on `netconfd-core`, so it can be reused by tooling
//! that only needs to speak the wire format (a standalone capture
//! analyzer, for example).

use serde::{Deserialize, Serialize};
use std::fmt;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The NETCONF end-of-message sentinel used by 1.0 framing.
pub const EOM_SENTINEL: &[u8] = b"]]>]]>";

/// Chunk terminator for 1.1 framing: `\n##\n`.
pub const CHUNK_TERMINATOR: &[u8] = b"\n##\n";

/// The blob of metadata an adaptor process transmits exactly once,
/// immediately after connecting to the local control socket.
///
/// Mirrors a connect handshake header: a transport adaptor
/// (spawned per SSH session) proxies bytes between
/// the peer and this server, and identifies itself with this header
/// before any NETCONF traffic flows.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConnectHeader {
    /// Protocol version of the connect handshake itself (currently
    /// always `1`).
    pub version: u32,
    pub user: String,
    pub address: String,
    /// Shared token proving the peer is a legitimate transport
    /// adaptor, not a local process knocking on the socket directly.
    pub magic: String,
    pub transport: TransportKind,
    pub port: u16,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Ssh,
}

/// The two NETCONF framing modes. A session starts in `EndOfMessage`
/// and may switch to `Chunked` once both peers advertise the
/// `urn:ietf:params:netconf:base:1.1` capability during `<hello>`
/// exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FramingMode {
    #[default]
    EndOfMessage,
    Chunked,
}

/// A single 1.1 chunk header, decoded from `\n#<len>\n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub len: u32,
}

impl ChunkHeader {
    /// `<len>` must fit 1..=2^31-1 per RFC 6242.
    pub const MAX_LEN: u32 = (1u32 << 31) - 1;

    pub fn new(len: u32) -> Result<Self, FramingError> {
        if len == 0 || len > Self::MAX_LEN {
            return Err(FramingError::MalformedChunkHeader);
        }
        Ok(ChunkHeader { len })
    }
}

/// Errors the framing codec can raise. These always terminate the
/// session -- there is no recoverable mid-frame state to roll back to.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("malformed chunk header")]
    MalformedChunkHeader,
    #[error("chunk length {0} exceeds configured maximum {1}")]
    ChunkTooLarge(u32, u32),
    #[error("partial chunk at end of stream")]
    PartialChunkAtEof,
    #[error("malformed end-of-message framing")]
    MalformedEom,
    #[error("buffer pool exhausted for session")]
    ResourceDenied,
}

/// The closed set of RFC 4741/6241-style `error-tag` values this core
/// can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorTag {
    OperationFailed,
    InvalidValue,
    MissingElement,
    UnknownElement,
    UnknownNamespace,
    UnknownAttribute,
    MissingAttribute,
    BadAttribute,
    BadElement,
    DataMissing,
    DataExists,
    LockDenied,
    ResourceDenied,
    RollbackFailed,
    InUse,
    AccessDenied,
    PartialOperation,
    MalformedMessage,
}

impl fmt::Display for ErrorTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorTag::OperationFailed => "operation-failed",
            ErrorTag::InvalidValue => "invalid-value",
            ErrorTag::MissingElement => "missing-element",
            ErrorTag::UnknownElement => "unknown-element",
            ErrorTag::UnknownNamespace => "unknown-namespace",
            ErrorTag::UnknownAttribute => "unknown-attribute",
            ErrorTag::MissingAttribute => "missing-attribute",
            ErrorTag::BadAttribute => "bad-attribute",
            ErrorTag::BadElement => "bad-element",
            ErrorTag::DataMissing => "data-missing",
            ErrorTag::DataExists => "data-exists",
            ErrorTag::LockDenied => "lock-denied",
            ErrorTag::ResourceDenied => "resource-denied",
            ErrorTag::RollbackFailed => "rollback-failed",
            ErrorTag::InUse => "in-use",
            ErrorTag::AccessDenied => "access-denied",
            ErrorTag::PartialOperation => "partial-operation",
            ErrorTag::MalformedMessage => "malformed-message",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorType {
    Transport,
    Rpc,
    Protocol,
    Application,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Error,
    Warning,
}

/// One recorded RPC error, carrying the full NETCONF rpc-error field
/// set. `error_info` is left as an opaque string blob here
/// since its shape is type-specific and the datastore layer (out of
/// scope) is the one that interprets it structurally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub error_type: ErrorType,
    pub error_tag: ErrorTag,
    pub error_severity: ErrorSeverity,
    pub error_app_tag: Option<String>,
    pub error_path: Option<String>,
    pub error_message: Option<String>,
    pub error_info: Option<String>,
}

impl RpcError {
    pub fn new(error_type: ErrorType, error_tag: ErrorTag) -> Self {
        RpcError {
            error_type,
            error_tag,
            error_severity: ErrorSeverity::Error,
            error_app_tag: None,
            error_path: None,
            error_message: None,
            error_info: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.error_path = Some(path.into());
        self
    }

    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.error_message = Some(msg.into());
        self
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.error_info = Some(info.into());
        self
    }
}
