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

//! The owning service: permanent (listener) and temporary (accepted)
//! transport lists, plus the counters the aging controller and stats
//! surface read (spec.md §3, §5).

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::xprt::XprtInstance;

/// One RPC service: a name plus the transports registered against it.
#[derive(Debug)]
pub struct Service {
    name: String,
    perm: Mutex<VecDeque<Arc<XprtInstance>>>,
    temp: Mutex<VecDeque<Arc<XprtInstance>>>,
    tmp_count: AtomicUsize,
    requests_processed: AtomicU64,
    backchannel: Mutex<VecDeque<Arc<XprtInstance>>>,
}

impl Service {
    /// Construct a new, empty service.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            perm: Mutex::new(VecDeque::new()),
            temp: Mutex::new(VecDeque::new()),
            tmp_count: AtomicUsize::new(0),
            requests_processed: AtomicU64::new(0),
            backchannel: Mutex::new(VecDeque::new()),
        })
    }

    /// The service's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Link a newly created listener/permanent transport onto this service.
    pub fn link_permanent(&self, xprt: Arc<XprtInstance>) {
        self.perm.lock().push_back(xprt);
    }

    /// Link a newly accepted connection onto this service's temp list.
    pub fn link_temp(&self, xprt: Arc<XprtInstance>) {
        self.temp.lock().push_back(xprt);
        self.tmp_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Remove a transport from whichever list it's on (called once, from
    /// [`XprtInstance::delete`]).
    pub fn unlink(&self, xprt: &Arc<XprtInstance>) {
        let mut perm = self.perm.lock();
        let before = perm.len();
        perm.retain(|x| !Arc::ptr_eq(x, xprt));
        if perm.len() != before {
            return;
        }
        drop(perm);

        let mut temp = self.temp.lock();
        let before = temp.len();
        temp.retain(|x| !Arc::ptr_eq(x, xprt));
        if temp.len() != before {
            self.tmp_count.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Current count of live temporary connections.
    pub fn tmp_count(&self) -> usize {
        self.tmp_count.load(Ordering::Acquire)
    }

    /// Snapshot of the permanent (listener) list.
    pub fn permanent(&self) -> Vec<Arc<XprtInstance>> {
        self.perm.lock().iter().cloned().collect()
    }

    /// Snapshot of the temporary (connection) list.
    pub fn temporary(&self) -> Vec<Arc<XprtInstance>> {
        self.temp.lock().iter().cloned().collect()
    }

    /// Non-blocking variant of [`Service::temporary`]: returns `None` rather
    /// than waiting if the list is currently locked by another caller
    /// (spec.md §4.5's periodic sweep must not block on this lock).
    pub fn try_temporary(&self) -> Option<Vec<Arc<XprtInstance>>> {
        self.temp.try_lock().map(|list| list.iter().cloned().collect())
    }

    /// Find a registered transport of `class_name` bound to `port`
    /// (spec.md §6.1 `find_xprt`). Linear scan of the permanent list.
    pub fn find_xprt(&self, class_name: &str, port: u16) -> Option<Arc<XprtInstance>> {
        self.perm
            .lock()
            .iter()
            .find(|x| x.class().name() == class_name && x.local_addr().map(|a| a.port()) == Some(port))
            .cloned()
    }

    /// Find a listener of `class_name` bound to `addr` (spec.md §6.1
    /// `find_listener`).
    pub fn find_listener(&self, class_name: &str, addr: SocketAddr) -> Option<Arc<XprtInstance>> {
        self.perm
            .lock()
            .iter()
            .find(|x| x.class().name() == class_name && x.local_addr() == Some(addr))
            .cloned()
    }

    /// Format `"<class> <port>\n"` for every permanent transport
    /// (spec.md §6.1 `xprt_names`). Entries that would overflow `max_len`
    /// are omitted rather than truncated.
    pub fn xprt_names(&self, max_len: usize) -> String {
        let mut out = String::new();
        for xprt in self.perm.lock().iter() {
            let port = xprt.local_addr().map(|a| a.port()).unwrap_or(0);
            let line = format!("{} {}\n", xprt.class().name(), port);
            if out.len() + line.len() > max_len {
                continue;
            }
            out.push_str(&line);
        }
        out
    }

    /// Record that a request finished processing (used by the `recv` loop
    /// and surfaced through the stats iterator's future extension points).
    pub fn record_request(&self) {
        self.requests_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Total requests processed since this service was created.
    pub fn requests_processed(&self) -> u64 {
        self.requests_processed.load(Ordering::Relaxed)
    }

    /// Push a transport onto the backchannel work list the worker loop
    /// polls for out-of-band backchannel RPC client work (spec.md §1, §4.3
    /// `wait_for_work`). The backchannel client itself is out of scope;
    /// this is only the hook the scheduler checks.
    pub fn push_backchannel(&self, xprt: Arc<XprtInstance>) {
        self.backchannel.lock().push_back(xprt);
    }

    /// Whether the backchannel work list is empty -- used by
    /// `wait_for_work`'s `should_sleep` decision.
    pub fn backchannel_is_empty(&self) -> bool {
        self.backchannel.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::XprtFlags;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    #[test]
    fn xprt_names_round_trips_into_the_same_multiset() {
        let service = Service::new("nfsd");
        let a = XprtInstance::new_for_test(addr(2049), XprtFlags::empty());
        let b = XprtInstance::new_for_test(addr(20048), XprtFlags::empty());
        service.link_permanent(a);
        service.link_permanent(b);

        let text = service.xprt_names(4096);
        let mut parsed: Vec<(String, u16)> = text
            .lines()
            .map(|line| {
                let mut it = line.split(' ');
                let class = it.next().unwrap().to_string();
                let port: u16 = it.next().unwrap().parse().unwrap();
                (class, port)
            })
            .collect();
        parsed.sort();

        let mut expected: Vec<(String, u16)> = service
            .permanent()
            .iter()
            .map(|x| (x.class().name().to_string(), x.local_addr().unwrap().port()))
            .collect();
        expected.sort();

        assert_eq!(parsed, expected);
    }

    #[test]
    fn unlink_decrements_tmp_count_only_for_temp_members() {
        let service = Service::new("nfsd");
        let listener = XprtInstance::new_for_test(addr(2049), XprtFlags::LISTENER);
        service.link_permanent(listener.clone());

        let conn = XprtInstance::new_for_test(addr(20048), XprtFlags::TEMP);
        service.link_temp(conn.clone());
        assert_eq!(service.tmp_count(), 1);

        service.unlink(&listener);
        assert_eq!(service.tmp_count(), 1);
        assert_eq!(service.permanent().len(), 0);

        service.unlink(&conn);
        assert_eq!(service.tmp_count(), 0);
    }

    #[test]
    fn try_temporary_returns_none_while_the_list_is_held() {
        let service = Service::new("nfsd");
        let conn = XprtInstance::new_for_test(addr(20048), XprtFlags::TEMP);
        service.link_temp(conn);

        let guard = service.temp.lock();
        assert!(service.try_temporary().is_none());
        drop(guard);

        assert_eq!(service.try_temporary().unwrap().len(), 1);
    }
}
