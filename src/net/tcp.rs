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

//! A demo wire collaborator: a plain TCP [`TransportOps`] implementation
//! over `mio`, standing in for the RDMA/TLS/whatever-verbs transports a
//! real deployment would register. Not part of the scheduling framework
//! proper -- it exists so the framework can be exercised end to end without
//! a caller having to bring their own socket plumbing.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use mio::net::{TcpListener as MioTcpListener, TcpStream as MioTcpStream};
use mio::{Events, Interest, Poll, Token};
use parking_lot::Mutex;
use slab::Slab;
use tracing::{trace, warn};

use crate::class::{TransportClass, TransportOps};
use crate::flags::XprtFlags;
use crate::service::Service;
use crate::worker::RequestContext;
use crate::xprt::XprtInstance;

enum Entry {
    Listener(MioTcpListener),
    Connection(MioTcpStream),
}

/// Bookkeeping shared between the poll thread and the [`TransportOps`]
/// methods invoked from worker threads. Sockets live in a `Slab` keyed by
/// `mio::Token`; a transport's id maps to its token via `tokens_by_xprt`.
struct Registered {
    sockets: Mutex<Slab<Entry>>,
    owners: Mutex<HashMap<usize, Weak<XprtInstance>>>,
    tokens_by_xprt: Mutex<HashMap<u64, usize>>,
    poll_registry: mio::Registry,
}

impl Registered {
    fn token_for(&self, xprt: &XprtInstance) -> Option<usize> {
        self.tokens_by_xprt.lock().get(&xprt.id()).copied()
    }
}

/// TCP transport operations, plus the background poll thread that turns
/// socket readiness into scheduler wake-ups.
pub struct TcpOps {
    registered: Arc<Registered>,
    poll_thread: Mutex<Option<JoinHandle<()>>>,
    stop: Arc<std::sync::atomic::AtomicBool>,
}

impl std::fmt::Debug for TcpOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpOps").finish_non_exhaustive()
    }
}

impl TcpOps {
    /// Start the poll thread and return operations ready to register with
    /// [`crate::class::ClassRegistry`].
    pub fn spawn() -> io::Result<Arc<Self>> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let registered = Arc::new(Registered {
            sockets: Mutex::new(Slab::new()),
            owners: Mutex::new(HashMap::new()),
            tokens_by_xprt: Mutex::new(HashMap::new()),
            poll_registry: registry,
        });
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let poll_registered = registered.clone();
        let poll_stop = stop.clone();
        let handle = std::thread::spawn(move || poll_loop(poll, poll_registered, poll_stop));

        Ok(Arc::new(Self {
            registered,
            poll_thread: Mutex::new(Some(handle)),
            stop,
        }))
    }

    /// Stop the poll thread. Idempotent.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.poll_thread.lock().take() {
            let _ = handle.join();
        }
    }

    fn link(&self, token: usize, xprt: &Arc<XprtInstance>) {
        self.registered
            .owners
            .lock()
            .insert(token, Arc::downgrade(xprt));
        self.registered
            .tokens_by_xprt
            .lock()
            .insert(xprt.id(), token);
    }
}

impl Drop for TcpOps {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll_loop(mut poll: Poll, registered: Arc<Registered>, stop: Arc<std::sync::atomic::AtomicBool>) {
    let mut events = Events::with_capacity(128);
    while !stop.load(Ordering::Acquire) {
        if let Err(err) = poll.poll(&mut events, Some(Duration::from_millis(200))) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            warn!(%err, "poll failed");
            continue;
        }

        for event in events.iter() {
            let token = event.token().0;
            let xprt = match registered.owners.lock().get(&token).and_then(Weak::upgrade) {
                Some(xprt) => xprt,
                None => continue,
            };

            let is_listener = matches!(
                registered.sockets.lock().get(token),
                Some(Entry::Listener(_))
            );
            if is_listener {
                xprt.set_flags(XprtFlags::CONN);
            } else {
                xprt.set_flags(XprtFlags::DATA);
            }
            trace!(xprt = xprt.id(), token, "socket ready");
            xprt.try_enqueue();
        }
    }
}

impl TransportOps for TcpOps {
    fn create(
        &self,
        class: &Arc<TransportClass>,
        service: &Arc<Service>,
        _net: &str,
        addr: SocketAddr,
        mut flags: XprtFlags,
    ) -> io::Result<Arc<XprtInstance>> {
        let mut listener = MioTcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;

        let mut sockets = self.registered.sockets.lock();
        let entry = sockets.vacant_entry();
        let token = entry.key();
        self.registered
            .poll_registry
            .register(&mut listener, Token(token), Interest::READABLE)?;
        entry.insert(Entry::Listener(listener));
        drop(sockets);

        flags.insert(XprtFlags::LISTENER);
        let xprt = XprtInstance::new(class.clone(), service, Some(local_addr), None, flags);
        self.link(token, &xprt);
        Ok(xprt)
    }

    fn recvfrom(&self, xprt: &Arc<XprtInstance>, req: &mut RequestContext) -> isize {
        let token = match self.registered.token_for(xprt) {
            Some(t) => t,
            None => return -1,
        };
        let mut sockets = self.registered.sockets.lock();
        let stream = match sockets.get_mut(token) {
            Some(Entry::Connection(stream)) => stream,
            _ => return -1,
        };
        match stream.read(&mut req.arg) {
            Ok(0) => -1,
            Ok(n) => n as isize,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                xprt.clear_flags(XprtFlags::DATA);
                0
            }
            Err(_) => -1,
        }
    }

    fn sendto(&self, xprt: &Arc<XprtInstance>, req: &RequestContext) -> isize {
        let token = match self.registered.token_for(xprt) {
            Some(t) => t,
            None => return -1,
        };
        let mut sockets = self.registered.sockets.lock();
        let stream = match sockets.get_mut(token) {
            Some(Entry::Connection(stream)) => stream,
            _ => return -1,
        };
        match stream.write(&req.res) {
            Ok(n) => n as isize,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => 0,
            Err(_) => -1,
        }
    }

    fn detach(&self, xprt: &Arc<XprtInstance>) {
        let token = match self.registered.tokens_by_xprt.lock().remove(&xprt.id()) {
            Some(t) => t,
            None => return,
        };
        let mut sockets = self.registered.sockets.lock();
        if sockets.contains(token) {
            match sockets.get_mut(token) {
                Some(Entry::Listener(l)) => {
                    let _ = self.registered.poll_registry.deregister(l);
                }
                Some(Entry::Connection(s)) => {
                    let _ = self.registered.poll_registry.deregister(s);
                }
                None => {}
            }
            sockets.remove(token);
        }
        self.registered.owners.lock().remove(&token);
    }

    fn free(&self, _xprt: &Arc<XprtInstance>) {}

    fn accept(&self, xprt: &Arc<XprtInstance>) -> Option<Arc<XprtInstance>> {
        let token = self.registered.token_for(xprt)?;
        let mut sockets = self.registered.sockets.lock();
        let (mut stream, peer) = match sockets.get_mut(token) {
            Some(Entry::Listener(listener)) => match listener.accept() {
                Ok(pair) => pair,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    xprt.clear_flags(XprtFlags::CONN);
                    return None;
                }
                Err(_) => return None,
            },
            _ => return None,
        };

        let local_addr = stream.local_addr().ok()?;
        let entry = sockets.vacant_entry();
        let new_token = entry.key();
        if let Err(err) =
            self.registered
                .poll_registry
                .register(&mut stream, Token(new_token), Interest::READABLE)
        {
            warn!(%err, "failed to register accepted connection");
            return None;
        }
        entry.insert(Entry::Connection(stream));
        drop(sockets);

        let service = xprt.service()?;
        let accepted = XprtInstance::new(
            xprt.class().clone(),
            &service,
            Some(local_addr),
            Some(peer),
            XprtFlags::TEMP | XprtFlags::DATA,
        );
        self.link(new_token, &accepted);
        Some(accepted)
    }

    fn has_wspace(&self, _xprt: &Arc<XprtInstance>) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::ClassRegistry;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn loopback() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 0)
    }

    #[test]
    fn create_binds_a_listener_and_registers_it_for_polling() {
        let ops = TcpOps::spawn().unwrap();
        let registry = ClassRegistry::default();
        registry
            .register(TransportClass::new("tcp-test", 65536, ops.clone()))
            .unwrap();
        let service = Service::new("test");

        let port = registry
            .create(&service, "tcp-test", "tcp", loopback(), XprtFlags::empty(), None)
            .unwrap();
        assert_ne!(port, 0);
        assert_eq!(service.permanent().len(), 1);
        ops.stop();
    }

    #[test]
    fn accept_round_trips_a_client_connection() {
        let ops = TcpOps::spawn().unwrap();
        let registry = ClassRegistry::default();
        registry
            .register(TransportClass::new("tcp-test", 65536, ops.clone()))
            .unwrap();
        let service = Service::new("test");

        let port = registry
            .create(&service, "tcp-test", "tcp", loopback(), XprtFlags::empty(), None)
            .unwrap();
        let listener = service.permanent().into_iter().next().unwrap();

        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port);
        let _client = std::net::TcpStream::connect(addr).unwrap();

        // give the poll thread a moment to observe the pending connection.
        let mut accepted = None;
        for _ in 0..50 {
            if let Some(xprt) = ops.accept(&listener) {
                accepted = Some(xprt);
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(accepted.is_some());
        ops.stop();
    }
}
