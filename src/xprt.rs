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

//! The transport instance: all mutable state for one listener or connection
//! (spec.md §3, §4.2).

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::trace;

use crate::class::TransportClass;
use crate::deferred::DeferredRecord;
use crate::flags::XprtFlags;
use crate::pool::Pool;
use crate::service::Service;
use crate::worker::RequestContext;

static NEXT_XPRT_ID: AtomicU64 = AtomicU64::new(1);

type UserCallback = Box<dyn FnOnce(&Arc<XprtInstance>) + Send>;

/// The central scheduling entity: one listener or one connection.
pub struct XprtInstance {
    id: u64,
    class: Arc<TransportClass>,
    service: Weak<Service>,
    pool: Mutex<Option<Arc<Pool>>>,

    flags: AtomicU32,
    refcount: AtomicUsize,
    reserved_bytes: AtomicI64,
    nr_rqsts: AtomicI32,

    remote_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    remote_text: String,

    deferred_list: Mutex<VecDeque<DeferredRecord>>,
    user_list: Mutex<Vec<UserCallback>>,
    user_list_ran: AtomicBool,

    enqueue_time: Mutex<Option<Instant>>,
    credentials: Mutex<Option<Vec<u8>>>,
    network_namespace: String,
}

impl fmt::Debug for XprtInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XprtInstance")
            .field("id", &self.id)
            .field("class", &self.class.name())
            .field("flags", &self.flags())
            .field("refcount", &self.refcount.load(Ordering::Relaxed))
            .field("remote", &self.remote_text)
            .finish()
    }
}

impl XprtInstance {
    /// Construct a new instance, owned by `service`, with `BUSY` held and a
    /// refcount of 1 (spec.md §3 Lifecycle).
    pub fn new(
        class: Arc<TransportClass>,
        service: &Arc<Service>,
        local_addr: Option<SocketAddr>,
        remote_addr: Option<SocketAddr>,
        mut flags: XprtFlags,
    ) -> Arc<Self> {
        flags.insert(XprtFlags::BUSY);
        let remote_text = remote_addr
            .map(|a| a.to_string())
            .unwrap_or_else(|| "-".to_string());

        Arc::new(Self {
            id: NEXT_XPRT_ID.fetch_add(1, Ordering::Relaxed),
            class,
            service: Arc::downgrade(service),
            pool: Mutex::new(None),
            flags: AtomicU32::new(flags.bits()),
            refcount: AtomicUsize::new(1),
            reserved_bytes: AtomicI64::new(0),
            nr_rqsts: AtomicI32::new(0),
            remote_addr,
            local_addr,
            remote_text,
            deferred_list: Mutex::new(VecDeque::new()),
            user_list: Mutex::new(Vec::new()),
            user_list_ran: AtomicBool::new(false),
            enqueue_time: Mutex::new(None),
            credentials: Mutex::new(None),
            network_namespace: "default".to_string(),
        })
    }

    /// Build a standalone instance for unit tests that don't need a real
    /// class or service relationship.
    #[cfg(test)]
    pub fn new_for_test(addr: SocketAddr, flags: XprtFlags) -> Arc<Self> {
        use crate::class::TransportClass;

        #[derive(Debug)]
        struct NullOps;
        impl crate::class::TransportOps for NullOps {
            fn create(
                &self,
                _class: &Arc<TransportClass>,
                _service: &Arc<Service>,
                _net: &str,
                _addr: SocketAddr,
                _flags: XprtFlags,
            ) -> std::io::Result<Arc<XprtInstance>> {
                unreachable!()
            }
            fn recvfrom(&self, _xprt: &Arc<XprtInstance>, _req: &mut RequestContext) -> isize {
                0
            }
            fn sendto(&self, _xprt: &Arc<XprtInstance>, _req: &RequestContext) -> isize {
                0
            }
            fn detach(&self, _xprt: &Arc<XprtInstance>) {}
            fn free(&self, _xprt: &Arc<XprtInstance>) {}
            fn accept(&self, _xprt: &Arc<XprtInstance>) -> Option<Arc<XprtInstance>> {
                None
            }
            fn has_wspace(&self, _xprt: &Arc<XprtInstance>) -> bool {
                true
            }
        }

        let class = Arc::new(TransportClass::new("test", 65536, Arc::new(NullOps)));
        let service = Service::new("test");
        Self::new(class, &service, Some(addr), None, flags)
    }

    /// Numeric identity, useful for logging/tracing spans.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The class this instance belongs to.
    pub fn class(&self) -> &Arc<TransportClass> {
        &self.class
    }

    /// The owning service, if it still exists.
    pub fn service(&self) -> Option<Arc<Service>> {
        self.service.upgrade()
    }

    /// Local bind address, if known.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Remote peer address, if known.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Display form of the remote address.
    pub fn remote_text(&self) -> &str {
        &self.remote_text
    }

    /// Current flag bitset.
    pub fn flags(&self) -> XprtFlags {
        XprtFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn set_flags(&self, f: XprtFlags) -> XprtFlags {
        let prev = self.flags.fetch_or(f.bits(), Ordering::AcqRel);
        XprtFlags::from_bits_truncate(prev)
    }

    pub(crate) fn clear_flags(&self, f: XprtFlags) -> XprtFlags {
        let prev = self.flags.fetch_and(!f.bits(), Ordering::AcqRel);
        XprtFlags::from_bits_truncate(prev)
    }

    /// Try to take ownership (set `BUSY`). Returns `true` if this call won
    /// the race.
    pub(crate) fn try_acquire_busy(&self) -> bool {
        let prev = self
            .flags
            .fetch_or(XprtFlags::BUSY.bits(), Ordering::AcqRel);
        XprtFlags::from_bits_truncate(prev).intersection(XprtFlags::BUSY) != XprtFlags::BUSY
    }

    /// Outstanding request count against this transport.
    pub fn nr_rqsts(&self) -> i32 {
        self.nr_rqsts.load(Ordering::Acquire)
    }

    /// Try to reserve a per-connection request slot. Invariant: never lets
    /// the counter go negative or above `limit` when `limit > 0`.
    pub fn try_take_slot(&self, limit: u32) -> bool {
        if limit == 0 {
            self.nr_rqsts.fetch_add(1, Ordering::AcqRel);
            return true;
        }
        let mut cur = self.nr_rqsts.load(Ordering::Acquire);
        loop {
            if cur < 0 {
                // underflow guard: treat as a free slot, matching spec.md §9.
                cur = 0;
            }
            if cur as u32 >= limit {
                return false;
            }
            match self.nr_rqsts.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Release a previously taken request slot.
    pub fn release_slot(&self) {
        self.nr_rqsts.fetch_sub(1, Ordering::AcqRel);
    }

    /// Current outstanding reply-buffer reservation.
    pub fn reserved_bytes(&self) -> i64 {
        self.reserved_bytes.load(Ordering::Acquire)
    }

    fn add_reservation(&self, bytes: i64) {
        self.reserved_bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Adjust the reservation held on behalf of `req` to `head_len +
    /// additional_bytes`. If the reservation shrank, re-enqueues the
    /// transport so a thread waiting on space observes the change
    /// (spec.md §4.2, §5 backpressure).
    pub fn reserve(self: &Arc<Self>, req: &mut RequestContext, additional_bytes: i64) {
        let new_reserved = req.head_len as i64 + additional_bytes;
        let delta = req.reserved - new_reserved;
        if delta <= 0 {
            return;
        }

        let mut prev = self.reserved_bytes.load(Ordering::Acquire);
        loop {
            let next = (prev - delta).max(0);
            match self.reserved_bytes.compare_exchange_weak(
                prev,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => prev = actual,
            }
        }
        req.reserved = new_reserved.max(0);
        self.try_enqueue();
    }

    /// Release the whole remaining reservation held for `req` back to the
    /// transport's budget, as the request completes (spec.md §4.6 step 7
    /// "release reservation"). Unlike `reserve`, which shrinks a
    /// reservation down to a new in-flight size, this drops it entirely.
    pub fn release_reservation(self: &Arc<Self>, req: &mut RequestContext) {
        let amount = req.reserved;
        if amount <= 0 {
            return;
        }

        let mut prev = self.reserved_bytes.load(Ordering::Acquire);
        loop {
            let next = (prev - amount).max(0);
            match self.reserved_bytes.compare_exchange_weak(
                prev,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => prev = actual,
            }
        }
        req.reserved = 0;
        self.try_enqueue();
    }

    /// Reserve `bytes` on behalf of a new request before it starts.
    pub fn reserve_initial(&self, bytes: i64) {
        self.add_reservation(bytes);
    }

    /// Take a strong reference (spec.md §4.2 `get()`).
    pub fn get(self: &Arc<Self>) -> Arc<Self> {
        self.refcount.fetch_add(1, Ordering::AcqRel);
        self.clone()
    }

    /// Drop a strong reference; when it reaches zero, calls the class `free`
    /// op (spec.md §4.2 `put()`).
    pub fn put(self: &Arc<Self>) {
        if self.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            trace!(id = self.id, "freeing transport");
            self.class.ops().free(self);
            self.run_user_list_once();
        }
    }

    fn run_user_list_once(self: &Arc<Self>) {
        if self
            .user_list_ran
            .swap(true, Ordering::AcqRel)
        {
            return;
        }
        let callbacks = std::mem::take(&mut *self.user_list.lock());
        for cb in callbacks {
            cb(self);
        }
    }

    /// Register a callback to run exactly once, at teardown, after `DEAD`
    /// is set.
    pub fn on_teardown(&self, cb: impl FnOnce(&Arc<XprtInstance>) + Send + 'static) {
        self.user_list.lock().push(Box::new(cb));
    }

    /// Associate this instance with the pool it was first scheduled on.
    /// Subsequent enqueues reuse the same pool (sticky assignment).
    pub(crate) fn assign_pool(&self, pool: Arc<Pool>) {
        let mut slot = self.pool.lock();
        if slot.is_none() {
            *slot = Some(pool);
        }
    }

    pub(crate) fn assigned_pool(&self) -> Option<Arc<Pool>> {
        self.pool.lock().clone()
    }

    pub(crate) fn mark_enqueued_now(&self) {
        *self.enqueue_time.lock() = Some(Instant::now());
    }

    /// How long this transport has been sitting on the ready queue, if it
    /// is currently enqueued.
    pub fn time_since_enqueue(&self) -> Option<std::time::Duration> {
        self.enqueue_time.lock().map(|t| t.elapsed())
    }

    /// Re-enqueue on whichever pool this transport is already assigned to,
    /// if any. A transport that has never been scheduled has no pool yet
    /// and this is a no-op -- the dispatcher's first `notify` call performs
    /// the initial pool assignment.
    pub(crate) fn try_enqueue(self: &Arc<Self>) {
        if let Some(pool) = self.assigned_pool() {
            pool.enqueue(self.clone());
        }
    }

    /// Opaque credentials attached at create time (spec.md §4.1 step 4).
    pub fn set_credentials(&self, creds: Vec<u8>) {
        *self.credentials.lock() = Some(creds);
    }

    /// Read back the attached credentials, if any.
    pub fn credentials(&self) -> Option<Vec<u8>> {
        self.credentials.lock().clone()
    }

    /// The network namespace this transport was created in.
    pub fn network_namespace(&self) -> &str {
        &self.network_namespace
    }

    pub(crate) fn deferred_list(&self) -> &Mutex<VecDeque<DeferredRecord>> {
        &self.deferred_list
    }

    /// Set `CLOSE`; if no worker currently holds `BUSY`, tear the transport
    /// down immediately. Otherwise enqueue so the owning worker observes
    /// the close on its next drain (spec.md §4.2).
    pub fn close(self: &Arc<Self>) {
        let prev = self.set_flags(XprtFlags::CLOSE);
        if !prev.contains(XprtFlags::BUSY) {
            self.set_flags(XprtFlags::BUSY);
            self.delete();
        } else {
            self.try_enqueue();
        }
    }

    /// Lighter variant of [`XprtInstance::close`] safe to call from
    /// contexts that must not block.
    pub fn defer_close(self: &Arc<Self>) {
        self.set_flags(XprtFlags::CLOSE);
        self.try_enqueue();
    }

    /// Called by the owning worker once it is done with a dequeued
    /// transport: clears `BUSY` and re-enqueues if any event bit remains
    /// set. Panics if `BUSY` was not held -- this indicates a control-flow
    /// bug in the caller (spec.md §4.2, §7 `TransportBusyAssertion`).
    pub fn received(self: &Arc<Self>) {
        let prev = self.clear_flags(XprtFlags::BUSY);
        assert!(
            prev.contains(XprtFlags::BUSY),
            "received() called without BUSY held (transport {})",
            self.id
        );
        self.try_enqueue();
    }

    /// Teardown path: detach, remove from the service list, drain deferred
    /// and user-callback lists, drop the creation reference.
    pub(crate) fn delete(self: &Arc<Self>) {
        self.set_flags(XprtFlags::DEAD);
        self.class.ops().detach(self);
        if let Some(service) = self.service() {
            service.unlink(self);
        }
        for record in std::mem::take(&mut *self.deferred_list.lock()) {
            drop(record);
        }
        self.clear_flags(XprtFlags::DEFERRED);
        self.put();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 20049)
    }

    #[test]
    fn received_without_busy_panics() {
        let xprt = XprtInstance::new_for_test(addr(), XprtFlags::empty());
        xprt.clear_flags(XprtFlags::BUSY);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| xprt.received()));
        assert!(result.is_err());
    }

    #[test]
    fn slot_limit_is_enforced() {
        let xprt = XprtInstance::new_for_test(addr(), XprtFlags::empty());
        assert!(xprt.try_take_slot(2));
        assert!(xprt.try_take_slot(2));
        assert!(!xprt.try_take_slot(2));
        xprt.release_slot();
        assert!(xprt.try_take_slot(2));
    }

    #[test]
    fn slot_limit_zero_means_unlimited() {
        let xprt = XprtInstance::new_for_test(addr(), XprtFlags::empty());
        for _ in 0..100 {
            assert!(xprt.try_take_slot(0));
        }
    }

    #[test]
    fn reservation_never_goes_negative() {
        let xprt = XprtInstance::new_for_test(addr(), XprtFlags::empty());
        xprt.reserve_initial(100);
        let mut req = RequestContext::new_for_test(xprt.clone());
        req.head_len = 10;
        req.reserved = 100;
        xprt.reserve(&mut req, 0);
        assert_eq!(xprt.reserved_bytes(), 10);
        assert!(xprt.reserved_bytes() >= 0);
    }

    #[test]
    fn reserve_with_no_shrink_is_a_noop() {
        let xprt = XprtInstance::new_for_test(addr(), XprtFlags::empty());
        xprt.reserve_initial(50);
        let mut req = RequestContext::new_for_test(xprt.clone());
        req.head_len = 10;
        req.reserved = 50;
        // n + head_len >= old_reserved: leave unchanged.
        xprt.reserve(&mut req, 40);
        assert_eq!(xprt.reserved_bytes(), 50);
    }

    #[test]
    fn user_callback_runs_exactly_once() {
        let xprt = XprtInstance::new_for_test(addr(), XprtFlags::empty());
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count2 = count.clone();
        xprt.on_teardown(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        xprt.delete();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
