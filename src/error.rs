// Copyright 2022 Ryan Seipp
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

//! Error kinds produced by the transport framework.
//!
//! Internal invariant violations (`BUSY` misuse, double enqueue) are not
//! represented here: they are bugs in a caller and are raised as panics at
//! the violation site instead of being made into a catchable variant.

use std::net::AddrParseError;

/// Errors returned by the public surface of the framework.
#[derive(Debug, thiserror::Error)]
pub enum XprtError {
    /// A class with this name is already registered.
    #[error("transport class '{0}' is already registered")]
    DuplicateClass(String),

    /// No class by this name, even after one autoload retry.
    #[error("no transport class named '{0}'")]
    UnknownClass(String),

    /// `create` received a `sockaddr` whose family this framework does not
    /// understand.
    #[error("unsupported address family")]
    UnsupportedAddressFamily,

    /// The concrete `ops.create` call failed.
    #[error("transport create failed: {0}")]
    TransportCreateFailed(#[source] std::io::Error),

    /// The class's owning module is being unloaded.
    #[error("transport class module is going away")]
    ModuleGone,

    /// Allocation failure for a deferred record, transport, or buffer pages.
    #[error("out of memory")]
    OutOfMemory,

    /// `recvfrom` indicated the peer disconnected.
    #[error("peer closed the transport")]
    PeerClosed,

    /// An upcall exceeded its allotted `thread_wait`.
    #[error("upcall timed out")]
    TimedOut,

    /// The pool or service is tearing down.
    #[error("shutting down")]
    Shutdown,

    /// A `sockaddr` could not be parsed.
    #[error("invalid address: {0}")]
    InvalidAddress(#[from] AddrParseError),

    /// Underlying I/O failure not covered by a more specific variant.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, XprtError>;
