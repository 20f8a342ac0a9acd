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

//! Per-transport state bitset.
//!
//! `BUSY` is the load-bearing bit: its CAS doubles as "owned by a worker"
//! and "enqueued on the ready queue" (spec invariant: a transport sits on at
//! most one ready queue at a time).

use bitflags::bitflags;

bitflags! {
    /// Transport state flags, stored in an `AtomicU32`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct XprtFlags: u32 {
        /// Owned by exactly one worker between dequeue and `received()`;
        /// doubles as "currently enqueued".
        const BUSY        = 1 << 0;
        /// A new connection is pending on a listener.
        const CONN         = 1 << 1;
        /// Data is available to read.
        const DATA         = 1 << 2;
        /// Scheduled for teardown.
        const CLOSE        = 1 << 3;
        /// Teardown has started; set only while `BUSY` is held.
        const DEAD         = 1 << 4;
        /// Accepted connection, not a listener.
        const TEMP         = 1 << 5;
        /// Marked by the aging sweep for the next pass.
        const OLD          = 1 << 6;
        /// Accepts new connections.
        const LISTENER     = 1 << 7;
        /// A handshake (e.g. TLS-equivalent) is pending.
        const HANDSHAKE    = 1 << 8;
        /// The deferred-request list is non-empty.
        const DEFERRED     = 1 << 9;
        /// Exempt from credential-cache revalidation.
        const CACHE_AUTH   = 1 << 10;
        /// Call `kill_temp_xprt` on close.
        const KILL_TEMP    = 1 << 11;
        /// Exempt from temp-connection hard-cap reaping.
        const PEER_VALID   = 1 << 12;
    }
}

impl Default for XprtFlags {
    fn default() -> Self {
        XprtFlags::empty()
    }
}

/// Request-context flags (`RequestFlags` in spec.md §3).
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RequestFlags: u32 {
        /// Holds a per-connection request slot.
        const DATA        = 1 << 0;
        /// Drop this request without a reply (e.g. lost deferred record).
        const DROPME      = 1 << 1;
        /// This request is eligible for deferral if processing can't
        /// complete synchronously.
        const USEDEFERRAL = 1 << 2;
    }
}
