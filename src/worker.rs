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

//! Top-level worker entry points (spec.md §4.6, §4.7): the loop a worker
//! thread runs to pull one ready transport off its pool, turn it into a
//! [`RequestContext`] (or dispatch it directly, for listeners and
//! housekeeping events), and later push a reply back out.
//!
//! Parsing the RPC message itself and deciding what to do with it is out of
//! scope here -- `RequestContext::arg` is handed to the caller's own
//! `process` callback untouched.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{trace, warn};

use crate::class::TransportOps;
use crate::config::{ServerConfig, THREAD_WAIT_BUSY, THREAD_WAIT_IDLE};
use crate::deferred::DeferredStore;
use crate::flags::{RequestFlags, XprtFlags};
use crate::pool::{Pool, WaitOutcome};
use crate::service::Service;
use crate::xprt::XprtInstance;

/// Per-request scratch state threaded between `recvfrom`/`sendto` and the
/// caller's own message processing (spec.md §4.2 `svc_rqst`-equivalent).
#[derive(Debug)]
pub struct RequestContext {
    xprt: Arc<XprtInstance>,
    /// Transaction id, opaque to this crate; echoed back by callers that
    /// parse their own request format out of `arg`.
    pub xid: u32,
    /// Protocol identifier the transport was created with (e.g. 6 for TCP).
    pub prot: u8,
    /// Raw request bytes read by [`TransportOps::recvfrom`].
    pub arg: Vec<u8>,
    /// Raw reply bytes to be written by [`TransportOps::sendto`].
    pub res: Vec<u8>,
    /// Bytes currently reserved against the transport's reply budget.
    pub reserved: i64,
    /// Fixed header/prefix length counted against every reservation.
    pub head_len: u32,
    pub peer_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,
    pub flags: RequestFlags,
    /// Upcall deadline for this request (spec.md §4.3, §4.6 step 5):
    /// `THREAD_WAIT_IDLE` if another worker was parked when this request was
    /// pulled off the ready queue, `THREAD_WAIT_BUSY` otherwise.
    pub thread_wait: Duration,
}

impl RequestContext {
    fn new(xprt: Arc<XprtInstance>) -> Self {
        let peer_addr = xprt.remote_addr();
        let local_addr = xprt.local_addr();
        Self {
            xprt,
            xid: 0,
            prot: 0,
            arg: Vec::new(),
            res: Vec::new(),
            reserved: 0,
            head_len: 0,
            peer_addr,
            local_addr,
            flags: RequestFlags::empty(),
            thread_wait: THREAD_WAIT_BUSY,
        }
    }

    /// Build a standalone context for unit tests.
    #[cfg(test)]
    pub fn new_for_test(xprt: Arc<XprtInstance>) -> Self {
        Self::new(xprt)
    }

    /// The transport this request arrived on.
    pub fn xprt(&self) -> &Arc<XprtInstance> {
        &self.xprt
    }

    /// Request this context's processing be parked rather than replied to
    /// synchronously; the caller must later complete it with
    /// [`DeferredStore::revisit`].
    pub fn request_deferral(&mut self) {
        self.flags.insert(RequestFlags::USEDEFERRAL);
    }
}

/// Outcome of one [`run_once`] iteration.
#[derive(Debug)]
pub enum RecvOutcome {
    /// A request is ready for the caller to process and eventually pass to
    /// [`send`].
    Request(RequestContext),
    /// A listener accepted a new connection; it has already been linked
    /// onto `service` and scheduled. Nothing further to do this iteration.
    Accepted(Arc<XprtInstance>),
    /// The transport was torn down (peer closed, explicit close, or a read
    /// error). Nothing further to do.
    Closed(Arc<XprtInstance>),
    /// No request was ready in this pass; the caller should loop back to
    /// `run_once` to park again.
    WouldBlock,
    /// The pool is shutting down; the caller should exit its loop after the
    /// wake-up cascade this call already performed.
    Shutdown,
}

/// Run one iteration of the worker loop against `pool`: park until work
/// appears, dequeue the next ready transport, and dispatch it according to
/// its flags (spec.md §4.6).
pub fn run_once(
    pool: &Arc<Pool>,
    worker_id: u64,
    service: &Arc<Service>,
    cfg: &ServerConfig,
) -> RecvOutcome {
    match pool.wait_for_work(worker_id, Some(service)) {
        WaitOutcome::Shutdown => {
            pool.wake_next(Some(service));
            return RecvOutcome::Shutdown;
        }
        WaitOutcome::Work => {}
    }

    // more work may be visible behind the item we're about to take.
    pool.wake_next(Some(service));

    let xprt = match pool.dequeue() {
        Some(xprt) => xprt,
        None => return RecvOutcome::WouldBlock,
    };

    // other idle capacity on this pool means an upcall can afford to wait
    // longer before being treated as timed out (spec.md §4.3, §4.6 step 5).
    let thread_wait = if pool.idle_count() > 0 {
        THREAD_WAIT_IDLE
    } else {
        THREAD_WAIT_BUSY
    };

    recv(xprt, service, cfg, thread_wait)
}

/// Dispatch a single dequeued, `BUSY`-held transport (spec.md §4.6 body).
fn recv(
    xprt: Arc<XprtInstance>,
    service: &Arc<Service>,
    cfg: &ServerConfig,
    thread_wait: Duration,
) -> RecvOutcome {
    let flags = xprt.flags();

    if flags.contains(XprtFlags::CLOSE) {
        trace!(xprt = xprt.id(), "closing on dispatch");
        xprt.delete();
        return RecvOutcome::Closed(xprt);
    }

    if flags.contains(XprtFlags::LISTENER) {
        return match xprt.class().ops().accept(&xprt) {
            Some(accepted) => {
                // the cap is enforced against the pre-accept count, and the
                // eviction it may trigger must land before this new
                // connection is linked (spec.md §4.5, §8 exactly-at-limit).
                crate::aging::enforce_hard_cap(service, cfg.max_tmp_conn);
                if let Some(creds) = xprt.credentials() {
                    accepted.set_credentials(creds);
                }
                service.link_temp(accepted.clone());
                accepted.received();
                xprt.received();
                RecvOutcome::Accepted(accepted)
            }
            None => {
                xprt.received();
                RecvOutcome::WouldBlock
            }
        };
    }

    if flags.contains(XprtFlags::HANDSHAKE) {
        if let Err(err) = xprt.class().ops().handshake(&xprt) {
            warn!(xprt = xprt.id(), %err, "handshake failed");
            xprt.close();
            return RecvOutcome::Closed(xprt);
        }
        xprt.clear_flags(XprtFlags::HANDSHAKE);
        xprt.set_flags(XprtFlags::DATA);
        xprt.received();
        return RecvOutcome::WouldBlock;
    }

    if !xprt.try_take_slot(cfg.per_connection_limit) {
        // caller's own limit check in `Pool::is_ready` should have
        // prevented this, but stay defensive under races.
        xprt.received();
        return RecvOutcome::WouldBlock;
    }

    // a deferred record, if any, was the reason this transport got
    // re-enqueued; it takes priority over reading fresh bytes off the wire.
    if let Some(mut req) = recv_from_deferred(&xprt) {
        crate::aging::touch(&xprt);
        req.flags.insert(RequestFlags::DATA);
        req.thread_wait = thread_wait;
        if let Some(pool) = xprt.assigned_pool() {
            pool.record_message_arrived();
        }
        service.record_request();
        return RecvOutcome::Request(req);
    }

    let max_payload = xprt.class().max_payload();
    xprt.reserve_initial(max_payload as i64);

    let mut req = RequestContext::new(xprt.get());
    req.head_len = max_payload as u32;
    req.reserved = xprt.reserved_bytes();
    req.arg = vec![0u8; max_payload];
    req.thread_wait = thread_wait;

    let n = xprt.class().ops().recvfrom(&xprt, &mut req);
    if n < 0 {
        trace!(xprt = xprt.id(), "read error, closing");
        xprt.release_slot();
        xprt.set_flags(XprtFlags::CLOSE);
        xprt.delete();
        return RecvOutcome::Closed(xprt);
    }
    if n == 0 {
        xprt.release_slot();
        xprt.received();
        return RecvOutcome::WouldBlock;
    }

    req.arg.truncate(n as usize);
    crate::aging::touch(&xprt);
    req.flags.insert(RequestFlags::DATA);
    if let Some(pool) = xprt.assigned_pool() {
        pool.record_message_arrived();
    }
    service.record_request();
    RecvOutcome::Request(req)
}

/// Write a reply and release the transport back to the scheduler (spec.md
/// §4.7). Must be called exactly once per [`RecvOutcome::Request`].
pub fn send(mut req: RequestContext) {
    let xprt = req.xprt.clone();
    if req.flags.contains(RequestFlags::DROPME) {
        // the caller deferred this request; the transport's slot and
        // `BUSY` are released by `DeferredStore::revisit`, not here.
        xprt.release_slot();
        return;
    }

    let n = xprt.class().ops().sendto(&xprt, &req);
    if n < 0 {
        warn!(xprt = xprt.id(), "write error, closing");
        xprt.release_reservation(&mut req);
        xprt.release_slot();
        xprt.set_flags(XprtFlags::CLOSE);
        xprt.delete();
        return;
    }

    xprt.release_reservation(&mut req);
    xprt.class().ops().release_ctxt(&xprt);
    xprt.release_slot();
    xprt.received();
}

/// Complete a deferred request once the upcall that parked it finishes,
/// re-injecting it as a fresh [`RecvOutcome::Request`]-shaped context for
/// the caller to reply to via [`send`] (spec.md §4.4, §4.7).
pub fn recv_from_deferred(xprt: &Arc<XprtInstance>) -> Option<RequestContext> {
    let record = DeferredStore::dequeue(xprt)?;
    let mut req = RequestContext::new(xprt.get());
    req.prot = record.prot();
    req.peer_addr = record.peer_addr();
    req.local_addr = record.local_addr();
    req.arg = record.args().to_vec();
    Some(req)
}
