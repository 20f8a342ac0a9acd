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

//! Pool scheduler: one scheduling domain per CPU/NUMA node, each with its
//! own lock-free-ish ready queue and an idle-thread stack (spec.md §4.3).
//!
//! The ready queue is a `crossbeam_queue::SegQueue`, a lock-free MPMC FIFO;
//! the idle-thread stack is a locked `VecDeque` + `Condvar`, which spec.md
//! §9 explicitly allows as a substitute for a lock-free Treiber stack
//! provided the "enqueue at most once" and "wake one, no thundering herd"
//! properties hold. Those properties are enforced here by the `BUSY` CAS on
//! [`crate::xprt::XprtInstance`] and by popping exactly one idle id per wake.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::flags::XprtFlags;
use crate::service::Service;
use crate::xprt::XprtInstance;

/// Outcome of a call to [`Pool::wait_for_work`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// There is work available; the caller should dequeue.
    Work,
    /// The pool is shutting down; the caller should exit after propagating
    /// the wake-up to the next idle thread.
    Shutdown,
}

/// Point-in-time counters for the stats surface (spec.md §6.3).
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    /// Pool identity.
    pub id: usize,
    /// Messages successfully read off a transport in this pool.
    pub messages_arrived: u64,
    /// Transports pushed onto this pool's ready queue.
    pub sockets_queued: u64,
    /// Idle threads woken by this pool.
    pub threads_woken: u64,
}

/// One scheduling domain: a ready queue plus an idle-thread stack.
#[derive(Debug)]
pub struct Pool {
    id: usize,
    per_connection_limit: u32,
    ready_queue: SegQueue<Arc<XprtInstance>>,
    idle: Mutex<VecDeque<u64>>,
    idle_cv: Condvar,
    task_pending: AtomicBool,
    should_stop: AtomicBool,
    sockets_queued: AtomicU64,
    messages_arrived: AtomicU64,
    threads_woken: AtomicU64,
    next_worker_id: AtomicU64,
}

impl Pool {
    /// Construct an empty pool with the given numeric id. `per_connection_limit`
    /// bounds outstanding requests per transport scheduled on this pool; `0`
    /// means unlimited. Applied on every enqueue, not just the first, since
    /// `xprt::XprtInstance::try_enqueue` re-enqueues onto whichever pool a
    /// transport is already assigned to.
    pub fn new(id: usize, per_connection_limit: u32) -> Arc<Self> {
        Arc::new(Self {
            id,
            per_connection_limit,
            ready_queue: SegQueue::new(),
            idle: Mutex::new(VecDeque::new()),
            idle_cv: Condvar::new(),
            task_pending: AtomicBool::new(false),
            should_stop: AtomicBool::new(false),
            sockets_queued: AtomicU64::new(0),
            messages_arrived: AtomicU64::new(0),
            threads_woken: AtomicU64::new(0),
            next_worker_id: AtomicU64::new(1),
        })
    }

    /// This pool's numeric id.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Allocate a fresh worker identity for parking in this pool's idle
    /// stack.
    pub fn next_worker_id(&self) -> u64 {
        self.next_worker_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of workers currently parked idle on this pool. Used to decide
    /// between `THREAD_WAIT_IDLE` and `THREAD_WAIT_BUSY` for a request's
    /// upcall deadline (spec.md §4.3, §4.6 step 5).
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Readiness probe (spec.md §4.3 enqueue step 1).
    fn is_ready(&self, xprt: &Arc<XprtInstance>) -> bool {
        let flags = xprt.flags();
        if flags.contains(XprtFlags::BUSY) {
            return false;
        }
        if flags.intersects(XprtFlags::CONN | XprtFlags::CLOSE | XprtFlags::HANDSHAKE) {
            return true;
        }
        if flags.intersects(XprtFlags::DATA | XprtFlags::DEFERRED) {
            let has_space = xprt.class().ops().has_wspace(xprt);
            let within_limit = self.per_connection_limit == 0
                || xprt.nr_rqsts() < self.per_connection_limit as i32;
            return has_space && within_limit;
        }
        false
    }

    /// Attempt to enqueue `xprt` onto this pool. Returns `true` if it was
    /// actually pushed (spec.md §4.3 `enqueue`).
    pub fn enqueue(self: &Arc<Self>, xprt: Arc<XprtInstance>) -> bool {
        if !self.is_ready(&xprt) {
            return false;
        }
        if !xprt.try_acquire_busy() {
            return false;
        }

        xprt.assign_pool(self.clone());
        xprt.mark_enqueued_now();
        self.sockets_queued.fetch_add(1, Ordering::Relaxed);
        trace!(pool = self.id, xprt = xprt.id(), "enqueued");
        self.ready_queue.push(xprt);
        self.wake_one();
        true
    }

    /// Pop one transport from the ready queue. The returned transport
    /// already carries `BUSY`; the caller owns it exclusively until it
    /// calls `received()`.
    pub fn dequeue(&self) -> Option<Arc<XprtInstance>> {
        self.ready_queue.pop()
    }

    /// Record that a message was successfully read off a transport in this
    /// pool (feeds the stats surface, spec.md §6.3).
    pub fn record_message_arrived(&self) {
        self.messages_arrived.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot the pool's counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            id: self.id,
            messages_arrived: self.messages_arrived.load(Ordering::Relaxed),
            sockets_queued: self.sockets_queued.load(Ordering::Relaxed),
            threads_woken: self.threads_woken.load(Ordering::Relaxed),
        }
    }

    /// Pop one idle worker and wake it; if none are idle, leave
    /// `TASK_PENDING` set so the next worker that looks for work doesn't
    /// park (spec.md §4.3 "wake-one").
    fn wake_one(&self) {
        let mut idle = self.idle.lock();
        if idle.pop_back().is_some() {
            drop(idle);
            self.threads_woken.fetch_add(1, Ordering::Relaxed);
            self.idle_cv.notify_one();
        } else {
            self.task_pending.store(true, Ordering::Release);
        }
    }

    /// Wake one idle thread for out-of-band work that doesn't correspond to
    /// any particular transport (spec.md §6.1 `wake_up`). Sets `TASK_PENDING`
    /// if nobody is currently parked, same as the tail of [`Pool::enqueue`].
    pub fn notify(&self) {
        self.wake_one();
    }

    /// Called after a worker dequeues a transport: if more work is visible,
    /// wake one more idle thread to keep latency low without a wakeup
    /// storm (spec.md §4.3 "wake-next").
    pub fn wake_next(&self, service: Option<&Arc<Service>>) {
        if !self.should_park(service) {
            self.wake_one();
        }
    }

    fn should_park(&self, service: Option<&Arc<Service>>) -> bool {
        !self.task_pending.load(Ordering::Acquire)
            && self.ready_queue.is_empty()
            && !self.should_stop.load(Ordering::Acquire)
            && service.map(|s| s.backchannel_is_empty()).unwrap_or(true)
    }

    /// Park the calling worker until work appears or shutdown is requested
    /// (spec.md §4.3 `wait_for_work`).
    pub fn wait_for_work(&self, worker_id: u64, service: Option<&Arc<Service>>) -> WaitOutcome {
        if self.should_stop.load(Ordering::Acquire) {
            self.wake_one();
            return WaitOutcome::Shutdown;
        }

        if !self.should_park(service) {
            self.task_pending.store(false, Ordering::Release);
            return WaitOutcome::Work;
        }

        loop {
            let mut idle = self.idle.lock();
            idle.push_back(worker_id);
            if self.should_park(service) {
                self.idle_cv.wait(&mut idle);
            }

            // Attempt to unlink our own node. If we still find it, nobody
            // claimed us yet (spurious wake or we lost the wake race) --
            // pull it and loop back to parking. If it's gone, `wake_one`
            // already claimed this slot for us.
            match idle.iter().position(|&id| id == worker_id) {
                Some(pos) => {
                    idle.remove(pos);
                    drop(idle);
                    if self.should_stop.load(Ordering::Acquire) {
                        return WaitOutcome::Shutdown;
                    }
                    continue;
                }
                None => {
                    drop(idle);
                    self.task_pending.store(false, Ordering::Release);
                    return if self.should_stop.load(Ordering::Acquire) {
                        WaitOutcome::Shutdown
                    } else {
                        WaitOutcome::Work
                    };
                }
            }
        }
    }

    /// Request cooperative shutdown of this pool. Wakes one idle thread to
    /// start the wake-next cascade described in spec.md Scenario E; every
    /// worker that subsequently observes shutdown must call
    /// [`Pool::wake_next`] before exiting to keep the cascade moving.
    pub fn request_shutdown(&self) {
        self.should_stop.store(true, Ordering::Release);
        self.wake_one();
    }

    /// Whether shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.should_stop.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 2049)
    }

    #[test]
    fn enqueue_is_idempotent_while_busy() {
        let pool = Pool::new(0, 0);
        let xprt = XprtInstance::new_for_test(addr(), XprtFlags::CONN);
        xprt.clear_flags(XprtFlags::BUSY);

        assert!(pool.enqueue(xprt.clone()));
        // already BUSY (taken by the first enqueue): a second enqueue
        // attempt before `received()` must not push again.
        assert!(!pool.enqueue(xprt.clone()));
        assert!(pool.dequeue().is_some());
        assert!(pool.dequeue().is_none());
    }

    #[test]
    fn not_ready_transport_is_not_queued() {
        let pool = Pool::new(0, 0);
        let xprt = XprtInstance::new_for_test(addr(), XprtFlags::empty());
        xprt.clear_flags(XprtFlags::BUSY);
        assert!(!pool.enqueue(xprt));
    }

    #[test]
    fn per_connection_cap_blocks_enqueue() {
        let pool = Pool::new(0, 2);
        let xprt = XprtInstance::new_for_test(addr(), XprtFlags::DATA);
        xprt.clear_flags(XprtFlags::BUSY);
        assert!(xprt.try_take_slot(2));
        assert!(xprt.try_take_slot(2));
        assert_eq!(xprt.nr_rqsts(), 2);

        assert!(!pool.enqueue(xprt));
    }

    #[test]
    fn shutdown_cascades_through_idle_workers() {
        use std::sync::atomic::AtomicUsize;
        use std::thread;

        let pool = Pool::new(0, 0);
        let exited = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = pool.clone();
            let exited = exited.clone();
            handles.push(thread::spawn(move || {
                let id = pool.next_worker_id();
                loop {
                    match pool.wait_for_work(id, None) {
                        WaitOutcome::Work => continue,
                        WaitOutcome::Shutdown => {
                            pool.wake_next(None);
                            exited.fetch_add(1, Ordering::SeqCst);
                            break;
                        }
                    }
                }
            }));
        }

        // give the workers a moment to park.
        thread::sleep(std::time::Duration::from_millis(50));
        pool.request_shutdown();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(exited.load(Ordering::SeqCst), 4);
    }
}
