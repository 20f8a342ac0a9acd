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

//! Aging and limit control (spec.md §4.5): a periodic two-pass sweep that
//! evicts idle temporary connections, a hard cap enforced on every accept,
//! and an address-targeted immediate close.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::AGE_RETRY;
use crate::flags::XprtFlags;
use crate::service::Service;
use crate::xprt::XprtInstance;

/// Mark every temporary transport not already marked `OLD` as `OLD`, and
/// close every transport that already carried `OLD` from the previous
/// sweep. A transport touched since the last sweep has its `OLD` bit
/// cleared by normal traffic (callers are expected to clear `OLD` wherever
/// they clear `BUSY` on a transport that was just used; this crate clears
/// it implicitly by never setting it outside this sweep, so only
/// eviction-eligible idle connections accumulate the mark across two
/// consecutive calls).
///
/// Returns the number of transports closed this pass. Blocks on the
/// service's temp-list lock; prefer [`try_sweep`] from the periodic
/// controller, which must not block.
pub fn sweep(service: &Arc<Service>) -> usize {
    sweep_over(service.temporary())
}

/// Non-blocking variant of [`sweep`] for the periodic controller (spec.md
/// §4.5): returns `None` without doing anything if the service's temp list
/// is currently locked by another caller.
pub fn try_sweep(service: &Arc<Service>) -> Option<usize> {
    service.try_temporary().map(sweep_over)
}

fn sweep_over(xprts: Vec<Arc<XprtInstance>>) -> usize {
    let mut closed = 0;
    for xprt in xprts {
        let flags = xprt.flags();
        if flags.contains(XprtFlags::PEER_VALID) {
            continue;
        }
        if flags.contains(XprtFlags::OLD) {
            trace!(xprt = xprt.id(), "aging sweep: evicting idle connection");
            if flags.contains(XprtFlags::KILL_TEMP) {
                xprt.class().ops().kill_temp_xprt(&xprt);
            }
            xprt.defer_close();
            closed += 1;
        } else {
            xprt.set_flags(XprtFlags::OLD);
        }
    }
    closed
}

/// Clear the `OLD` mark on a transport that was just used, so the next
/// sweep gives it a full cycle of idleness before reconsidering it for
/// eviction. Callers that process a request should call this once they're
/// done with the transport.
pub fn touch(xprt: &Arc<crate::xprt::XprtInstance>) {
    xprt.clear_flags(XprtFlags::OLD);
}

/// Enforce `max_tmp_conn` on every accept: if the temp list is at or above
/// the cap, evict the single oldest non-`PEER_VALID` entry to make room
/// (spec.md §4.5 hard-cap step). Returns `true` if an eviction happened.
pub fn enforce_hard_cap(service: &Arc<Service>, max_tmp_conn: usize) -> bool {
    if service.tmp_count() < max_tmp_conn {
        return false;
    }
    let victim = service
        .temporary()
        .into_iter()
        .find(|x| !x.flags().contains(XprtFlags::PEER_VALID));
    match victim {
        Some(xprt) => {
            debug!(xprt = xprt.id(), "temp connection cap reached, evicting oldest");
            xprt.defer_close();
            true
        }
        None => false,
    }
}

/// Immediately close every temporary transport bound to local address
/// `addr`, as if the address had been removed from the host (spec.md §4.5
/// `age_now`). The permanent (listener) list is left untouched, per spec.md
/// §8's boundary behavior. Marks `KILL_TEMP` first so the concrete
/// transport's `kill_temp_xprt` hook runs during teardown.
pub fn age_now(service: &Arc<Service>, addr: SocketAddr) {
    for xprt in service
        .temporary()
        .into_iter()
        .filter(|x| x.local_addr() == Some(addr))
    {
        xprt.set_flags(XprtFlags::KILL_TEMP);
        xprt.class().ops().kill_temp_xprt(&xprt);
        xprt.close();
    }
}

/// A background thread that periodically calls [`sweep`] for one service,
/// until dropped via [`AgingController::stop`].
pub struct AgingController {
    handle: Mutex<Option<JoinHandle<()>>>,
    stop: Arc<std::sync::atomic::AtomicBool>,
}

impl AgingController {
    /// Spawn the periodic sweep thread for `service`, running every
    /// `period`.
    pub fn spawn(service: Arc<Service>, period: Duration) -> Self {
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let stop2 = stop.clone();
        let handle = std::thread::spawn(move || {
            while !stop2.load(std::sync::atomic::Ordering::Acquire) {
                std::thread::sleep(period);
                if stop2.load(std::sync::atomic::Ordering::Acquire) {
                    break;
                }
                // the sweep must not block on the service's temp-list lock;
                // on contention, back off AGE_RETRY and try again rather
                // than waiting out the rest of this period (spec.md §4.5).
                loop {
                    match try_sweep(&service) {
                        Some(closed) => {
                            if closed > 0 {
                                debug!(service = service.name(), closed, "aging sweep complete");
                            }
                            break;
                        }
                        None => {
                            if stop2.load(std::sync::atomic::Ordering::Acquire) {
                                break;
                            }
                            std::thread::sleep(AGE_RETRY);
                        }
                    }
                }
            }
        });
        Self {
            handle: Mutex::new(Some(handle)),
            stop,
        }
    }

    /// Signal the sweep thread to stop and join it. Blocks for up to one
    /// sweep period if a sleep is currently in progress.
    pub fn stop(&self) {
        self.stop.store(true, std::sync::atomic::Ordering::Release);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AgingController {
    fn drop(&mut self) {
        self.stop.store(true, std::sync::atomic::Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xprt::XprtInstance;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    #[test]
    fn first_sweep_marks_old_second_sweep_evicts() {
        let service = Service::new("test");
        let xprt = XprtInstance::new_for_test(addr(20048), XprtFlags::TEMP);
        xprt.clear_flags(XprtFlags::BUSY);
        service.link_temp(xprt.clone());

        assert_eq!(sweep(&service), 0);
        assert!(xprt.flags().contains(XprtFlags::OLD));

        assert_eq!(sweep(&service), 1);
        assert!(xprt.flags().contains(XprtFlags::CLOSE));
    }

    #[test]
    fn touching_a_connection_resets_its_aging_clock() {
        let service = Service::new("test");
        let xprt = XprtInstance::new_for_test(addr(20048), XprtFlags::TEMP);
        xprt.clear_flags(XprtFlags::BUSY);
        service.link_temp(xprt.clone());

        sweep(&service);
        assert!(xprt.flags().contains(XprtFlags::OLD));
        touch(&xprt);
        assert!(!xprt.flags().contains(XprtFlags::OLD));
        assert_eq!(sweep(&service), 0);
    }

    #[test]
    fn peer_valid_connections_are_never_evicted() {
        let service = Service::new("test");
        let xprt = XprtInstance::new_for_test(
            addr(20048),
            XprtFlags::TEMP | XprtFlags::PEER_VALID,
        );
        xprt.clear_flags(XprtFlags::BUSY);
        service.link_temp(xprt.clone());

        for _ in 0..5 {
            assert_eq!(sweep(&service), 0);
        }
        assert!(!xprt.flags().contains(XprtFlags::CLOSE));
    }

    #[test]
    fn hard_cap_evicts_the_oldest_non_sticky_entry() {
        let service = Service::new("test");
        let sticky = XprtInstance::new_for_test(addr(1), XprtFlags::TEMP | XprtFlags::PEER_VALID);
        sticky.clear_flags(XprtFlags::BUSY);
        service.link_temp(sticky.clone());
        let ordinary = XprtInstance::new_for_test(addr(2), XprtFlags::TEMP);
        ordinary.clear_flags(XprtFlags::BUSY);
        service.link_temp(ordinary.clone());

        assert!(enforce_hard_cap(&service, 2));
        assert!(ordinary.flags().contains(XprtFlags::CLOSE));
        assert!(!sticky.flags().contains(XprtFlags::CLOSE));
    }

    #[test]
    fn try_sweep_matches_sweep_when_uncontended() {
        let service = Service::new("test");
        let xprt = XprtInstance::new_for_test(addr(20048), XprtFlags::TEMP);
        xprt.clear_flags(XprtFlags::BUSY);
        service.link_temp(xprt.clone());

        assert_eq!(try_sweep(&service), Some(0));
        assert!(xprt.flags().contains(XprtFlags::OLD));
    }

    #[test]
    fn age_now_closes_only_matching_temps_and_leaves_permanent_list_untouched() {
        let service = Service::new("test");
        let target = addr(2049);
        let listener = XprtInstance::new_for_test(target, XprtFlags::LISTENER);
        listener.clear_flags(XprtFlags::BUSY);
        service.link_permanent(listener.clone());
        let matching = XprtInstance::new_for_test(target, XprtFlags::TEMP);
        matching.clear_flags(XprtFlags::BUSY);
        service.link_temp(matching.clone());
        let other = XprtInstance::new_for_test(addr(111), XprtFlags::TEMP);
        other.clear_flags(XprtFlags::BUSY);
        service.link_temp(other.clone());

        age_now(&service, target);
        assert!(!listener.flags().contains(XprtFlags::CLOSE));
        assert!(matching.flags().contains(XprtFlags::CLOSE));
        assert!(!other.flags().contains(XprtFlags::CLOSE));
    }
}
