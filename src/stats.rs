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

//! Stats surface (spec.md §6.3): a text rendering of registered classes and
//! per-pool scheduling counters. Deliberately plain text, matching
//! `xprt_names`'s `"<class> <value>\n"` convention -- no structured metrics
//! format is specified.

use crate::class::ClassRegistry;
use crate::pool::Pool;

/// Format `"<class> <max_payload>\n"` for every class currently registered
/// in `registry` (spec.md §6.1 `print_xprts`) -- the process-wide class
/// table, not any one service's instantiated transports.
pub fn print_xprts(registry: &ClassRegistry) -> String {
    let mut classes = registry.classes();
    classes.sort_by(|a, b| a.name().cmp(b.name()));
    let mut out = String::new();
    for class in classes {
        out.push_str(&format!("{} {}\n", class.name(), class.max_payload()));
    }
    out
}

/// Format the per-pool scheduling counters as one line per pool, preceded
/// by a header line, exactly as spec.md §6.3 specifies. The trailing `0` on
/// each data line is a once-tracked "threads timed out" counter kept only
/// for output compatibility; this crate doesn't track it separately.
pub fn print_pool_stats(pools: &[std::sync::Arc<Pool>]) -> String {
    let mut out =
        String::from("# pool packets-arrived sockets-enqueued threads-woken threads-timedout\n");
    for pool in pools {
        let s = pool.stats();
        out.push_str(&format!(
            "{} {} {} {} 0\n",
            s.id, s.messages_arrived, s.sockets_queued, s.threads_woken
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::TransportClass;
    use crate::flags::XprtFlags;
    use crate::service::Service;
    use crate::worker::RequestContext;
    use crate::xprt::XprtInstance;
    use std::net::SocketAddr;
    use std::sync::Arc;

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

    #[test]
    fn print_xprts_lists_every_registered_class() {
        let registry = ClassRegistry::default();
        registry
            .register(TransportClass::new("tcp", 65536, Arc::new(NullOps)))
            .unwrap();
        registry
            .register(TransportClass::new("udp", 8192, Arc::new(NullOps)))
            .unwrap();

        let out = print_xprts(&registry);
        assert_eq!(out, "tcp 65536\nudp 8192\n");
    }

    #[test]
    fn print_pool_stats_has_one_line_per_pool_plus_header() {
        let pools = vec![Pool::new(0, 0), Pool::new(1, 0)];
        let out = print_pool_stats(&pools);
        let mut lines = out.lines();
        assert_eq!(
            lines.next(),
            Some("# pool packets-arrived sockets-enqueued threads-woken threads-timedout")
        );
        assert_eq!(lines.next(), Some("0 0 0 0 0"));
        assert_eq!(lines.next(), Some("1 0 0 0 0"));
        assert_eq!(lines.next(), None);
    }
}
