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

//! Deferred-request store (spec.md §4.4): parks requests whose processing
//! can't complete synchronously (e.g. a blocking credential upcall) and
//! re-issues them once the upcall completes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::XprtError;
use crate::flags::RequestFlags;
use crate::xprt::XprtInstance;

/// A single page, the largest argument buffer this store will park.
pub const MAX_DEFERRED_ARGS: usize = 4096;

/// A parked request, owned by the store while queued and by the resuming
/// worker once [`DeferredStore::dequeue`] hands it back.
#[derive(Debug, Clone)]
pub struct DeferredRecord {
    pub(crate) prot: u8,
    pub(crate) peer_addr: Option<SocketAddr>,
    pub(crate) local_addr: Option<SocketAddr>,
    pub(crate) args: Vec<u8>,
    /// Upcall deadline set at defer time (spec.md §4.3, §4.6 step 5); an
    /// upcall that completes after this is treated as timed out.
    pub(crate) deadline: Instant,
}

/// Handle returned by [`DeferredStore::defer`]; the upcall completes it by
/// calling [`DeferredStore::revisit`].
#[derive(Debug)]
pub struct DeferredHandle {
    xprt: Arc<XprtInstance>,
    record: DeferredRecord,
}

/// Parks and re-issues deferred requests. Storage lives on the transport
/// itself (`XprtInstance::deferred_list`); this type is a namespace for the
/// protocol operating on it, not a separate container.
pub struct DeferredStore;

impl DeferredStore {
    /// Defer `req`, returning a handle the upcall will later complete with
    /// [`DeferredStore::revisit`]. Returns `None` if the request isn't
    /// eligible: either it didn't request deferral, or its argument buffer
    /// is larger than a single page (spec.md §4.4). `thread_wait` is the
    /// upcall deadline set per spec.md §4.3/§4.6 step 5 (`THREAD_WAIT_IDLE`
    /// or `THREAD_WAIT_BUSY`, picked by the caller from current pool load).
    pub fn defer(
        xprt: &Arc<XprtInstance>,
        flags: &mut RequestFlags,
        prot: u8,
        peer_addr: Option<SocketAddr>,
        local_addr: Option<SocketAddr>,
        args: &[u8],
        thread_wait: Duration,
    ) -> Option<DeferredHandle> {
        if !flags.contains(RequestFlags::USEDEFERRAL) || args.len() > MAX_DEFERRED_ARGS {
            return None;
        }

        flags.insert(RequestFlags::DROPME);
        let handle = DeferredHandle {
            xprt: xprt.get(),
            record: DeferredRecord {
                prot,
                peer_addr,
                local_addr,
                args: args.to_vec(),
                deadline: Instant::now() + thread_wait,
            },
        };
        trace!(xprt = xprt.id(), bytes = args.len(), "request deferred");
        Some(handle)
    }

    /// Complete a deferred handle. If `too_many` is set, the upcall missed
    /// its deadline, or the transport has already started tearing down, the
    /// record is dropped and the request is lost (spec.md §4.4 step 2,
    /// §4.3 timeout, §7 `TimedOut`). Otherwise the record is pushed onto the
    /// transport's deferred list and the transport is re-enqueued.
    pub fn revisit(handle: DeferredHandle, too_many: bool) {
        let DeferredHandle { xprt, record } = handle;

        let expired = Instant::now() >= record.deadline;
        if expired {
            trace!(xprt = xprt.id(), err = %XprtError::TimedOut, "deferred upcall missed its deadline");
        }

        if too_many || expired || xprt.flags().contains(crate::flags::XprtFlags::DEAD) {
            trace!(xprt = xprt.id(), too_many, expired, "deferred record dropped");
            xprt.put();
            return;
        }

        xprt.deferred_list().lock().push_front(record);
        xprt.set_flags(crate::flags::XprtFlags::DEFERRED);
        xprt.try_enqueue();
        xprt.put();
    }

    /// Pop the most recently deferred entry for `xprt`. Two defers of the
    /// same request return in reverse order (stack discipline), matching
    /// the ordering guarantee in spec.md §4.4.
    pub fn dequeue(xprt: &Arc<XprtInstance>) -> Option<DeferredRecord> {
        let mut list = xprt.deferred_list().lock();
        let record = list.pop_front();
        if list.is_empty() {
            xprt.clear_flags(crate::flags::XprtFlags::DEFERRED);
        }
        record
    }
}

impl DeferredRecord {
    /// The protocol identifier captured at defer time.
    pub fn prot(&self) -> u8 {
        self.prot
    }

    /// The peer address captured at defer time.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// The local address captured at defer time.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// The argument bytes captured at defer time.
    pub fn args(&self) -> &[u8] {
        &self.args
    }
}
