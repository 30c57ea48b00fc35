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

//! Error recorder (component H).
//!
//! A closed, serde-derived error-tag enum (`netconfd_protocol::ErrorTag`)
//! carried over the wire, with `RpcError` holding the full NETCONF
//! rpc-error field set. This module adds the per-message queue the
//! parser (component F) appends to as it walks a subtree, plus the
//! "does this error block a positive reply" predicate.

use netconfd_protocol::{ErrorSeverity, ErrorTag, ErrorType, RpcError};

/// Accumulates every `<rpc-error>` recorded while parsing one inbound
/// message. Errors are never dropped on first failure: subtree errors
/// are recorded and parsing continues past the offending subtree so
/// sibling parsing can still report its own problems.
#[derive(Debug, Default, Clone)]
pub struct ErrorQueue {
    errors: Vec<RpcError>,
}

impl ErrorQueue {
    pub fn new() -> Self {
        ErrorQueue::default()
    }

    pub fn record(&mut self, error: RpcError) {
        self.errors.push(error);
    }

    pub fn record_simple(&mut self, error_type: ErrorType, tag: ErrorTag, path: impl Into<String>) {
        self.record(RpcError::new(error_type, tag).with_path(path));
    }

    /// The presence of any error blocks a positive RPC reply.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn errors(&self) -> &[RpcError] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<RpcError> {
        self.errors
    }

    /// True if any recorded error has `error_severity == Error` (as
    /// opposed to a warning-severity diagnostic, which does not block
    /// the reply on its own).
    pub fn has_blocking_errors(&self) -> bool {
        self.errors.iter().any(|e| e.error_severity == ErrorSeverity::Error)
    }
}

/// Per-node parse-result status: the first non-OK among {value,
/// metadata, instance-count} for error aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseStatus {
    #[default]
    Ok,
    ValueError,
    MetadataError,
    InstanceCountError,
}

impl ParseStatus {
    /// Combines a node's three independent error channels into the
    /// single final status, taking the first non-OK in value,
    /// metadata, instance-count order.
    pub fn combine(value: ParseStatus, metadata: ParseStatus, instance_count: ParseStatus) -> ParseStatus {
        if value != ParseStatus::Ok {
            value
        } else if metadata != ParseStatus::Ok {
            metadata
        } else {
            instance_count
        }
    }
}
