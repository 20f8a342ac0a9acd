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

//! Transport class registry (spec.md §4.1).
//!
//! A process-wide, name-keyed table of wire-protocol classes. Registry
//! operations are serialized by a single lock; the hot dispatch path never
//! takes it, since every transport already carries a strong reference to
//! its class.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{Result, XprtError};
use crate::flags::XprtFlags;
use crate::service::Service;
use crate::worker::RequestContext;
use crate::xprt::XprtInstance;

/// Operations a concrete wire protocol must provide (spec.md §6.2).
///
/// Every method takes the already-constructed [`XprtInstance`] so a single
/// `ops` value can back any number of listeners/connections of that class.
pub trait TransportOps: fmt::Debug + Send + Sync {
    /// Create a new listener or connection for `service`, bound to `addr`.
    /// `class` is the caller's own registry entry, handed back so the
    /// implementation can stamp it onto the new [`XprtInstance`] without
    /// needing a back-reference to its own registration.
    fn create(
        &self,
        class: &Arc<TransportClass>,
        service: &Arc<Service>,
        net: &str,
        addr: SocketAddr,
        flags: XprtFlags,
    ) -> std::io::Result<Arc<XprtInstance>>;

    /// Read one message. Returns bytes consumed, `0` if no data, negative on
    /// error (the caller maps a negative return to transport teardown).
    fn recvfrom(&self, xprt: &Arc<XprtInstance>, req: &mut RequestContext) -> isize;

    /// Write a reply. Same return convention as [`TransportOps::recvfrom`].
    fn sendto(&self, xprt: &Arc<XprtInstance>, req: &RequestContext) -> isize;

    /// Release any implementation-private per-request context.
    fn release_ctxt(&self, _xprt: &Arc<XprtInstance>) {}

    /// Detach the transport from whatever the concrete implementation keeps
    /// alive for it (socket deregistration, etc). Called once, just before
    /// `free`.
    fn detach(&self, xprt: &Arc<XprtInstance>);

    /// Release implementation-owned resources. Called once refcount hits 0.
    fn free(&self, xprt: &Arc<XprtInstance>);

    /// Listeners only: accept one pending connection.
    fn accept(&self, xprt: &Arc<XprtInstance>) -> Option<Arc<XprtInstance>>;

    /// Whether there is reply-buffer space to proceed with a read.
    fn has_wspace(&self, xprt: &Arc<XprtInstance>) -> bool;

    /// Optional: called on address-based or out-of-band eviction.
    fn kill_temp_xprt(&self, _xprt: &Arc<XprtInstance>) {}

    /// Optional: drive a pending handshake (TLS-equivalent).
    fn handshake(&self, _xprt: &Arc<XprtInstance>) -> std::io::Result<()> {
        Ok(())
    }
}

/// An immutable-after-registration transport class.
#[derive(Debug)]
pub struct TransportClass {
    name: String,
    max_payload: usize,
    ops: Arc<dyn TransportOps>,
    unloading: AtomicBool,
}

impl TransportClass {
    /// Construct a class ready for [`ClassRegistry::register`].
    pub fn new(name: impl Into<String>, max_payload: usize, ops: Arc<dyn TransportOps>) -> Self {
        Self {
            name: name.into(),
            max_payload,
            ops,
            unloading: AtomicBool::new(false),
        }
    }

    /// The class's unique name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Maximum payload this class's transports can carry.
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// The operations vtable.
    pub fn ops(&self) -> &Arc<dyn TransportOps> {
        &self.ops
    }

    /// Mark the class as unloading; in-flight `create` calls will fail with
    /// [`XprtError::ModuleGone`].
    pub fn begin_unload(&self) {
        self.unloading.store(true, Ordering::Release);
    }

    fn is_unloading(&self) -> bool {
        self.unloading.load(Ordering::Acquire)
    }
}

/// Hook invoked when a class lookup misses, mirroring the kernel's
/// `request_module("%sproto-%s", prefix, name)` autoload-and-retry. Returns
/// `true` if a class matching `name` is now registered.
pub type AutoloadHook = Arc<dyn Fn(&str) -> bool + Send + Sync>;

struct RegistryInner {
    classes: HashMap<String, Arc<TransportClass>>,
    autoload: Option<AutoloadHook>,
}

/// Process-wide table of registered transport classes.
pub struct ClassRegistry {
    inner: Mutex<RegistryInner>,
}

impl fmt::Debug for ClassRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ClassRegistry")
            .field("classes", &inner.classes.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// The single process-wide registry instance.
pub static REGISTRY: Lazy<ClassRegistry> = Lazy::new(ClassRegistry::new);

impl ClassRegistry {
    fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                classes: HashMap::new(),
                autoload: None,
            }),
        }
    }

    /// Install a hook used to autoload a missing class by name (spec.md
    /// §4.1 step 1). Without a hook installed, a missing class goes
    /// straight to [`XprtError::UnknownClass`].
    pub fn set_autoload_hook(&self, hook: AutoloadHook) {
        self.inner.lock().autoload = Some(hook);
    }

    /// Convenience for installing a plain closure without wrapping it in an
    /// `Arc` at the call site.
    pub fn set_autoload_fn(&self, hook: impl Fn(&str) -> bool + Send + Sync + 'static) {
        self.set_autoload_hook(Arc::new(hook));
    }

    /// Register a new class. Fails if the name is already taken.
    pub fn register(&self, class: TransportClass) -> Result<Arc<TransportClass>> {
        let mut inner = self.inner.lock();
        if inner.classes.contains_key(&class.name) {
            return Err(XprtError::DuplicateClass(class.name));
        }
        let name = class.name.clone();
        let class = Arc::new(class);
        inner.classes.insert(name.clone(), class.clone());
        debug!(class = %name, "transport class registered");
        Ok(class)
    }

    /// Unregister a class. Callers must have quiesced all instances first.
    pub fn unregister(&self, name: &str) {
        let mut inner = self.inner.lock();
        if let Some(class) = inner.classes.remove(name) {
            class.begin_unload();
            debug!(class = %name, "transport class unregistered");
        }
    }

    /// Look up a class by name without triggering autoload.
    pub fn lookup(&self, name: &str) -> Option<Arc<TransportClass>> {
        self.inner.lock().classes.get(name).cloned()
    }

    /// Every currently registered class, in no particular order (spec.md
    /// §6.1 `print_xprts` enumerates the process-wide class table, not any
    /// one service's instantiated transports).
    pub fn classes(&self) -> Vec<Arc<TransportClass>> {
        self.inner.lock().classes.values().cloned().collect()
    }

    /// Create a new listener/connection of class `class_name` on `service`
    /// (spec.md §4.1 step-by-step). `creds`, if given, is attached to the
    /// new transport (step 4) before `received()` clears `BUSY`.
    pub fn create(
        &self,
        service: &Arc<Service>,
        class_name: &str,
        net: &str,
        addr: SocketAddr,
        flags: XprtFlags,
        creds: Option<Vec<u8>>,
    ) -> Result<u16> {
        let class = match self.lookup(class_name) {
            Some(class) => class,
            None => {
                let hook = self.inner.lock().autoload.clone();
                let retried = hook.map(|hook| hook(class_name));
                if retried == Some(true) {
                    self.lookup(class_name)
                } else {
                    None
                }
                .ok_or_else(|| XprtError::UnknownClass(class_name.to_string()))?
            }
        };

        if class.is_unloading() {
            return Err(XprtError::ModuleGone);
        }

        if !matches!(addr, SocketAddr::V4(_) | SocketAddr::V6(_)) {
            return Err(XprtError::UnsupportedAddressFamily);
        }

        trace!(class = class_name, %addr, "creating transport");
        let xprt = class
            .ops()
            .create(&class, service, net, addr, flags)
            .map_err(XprtError::TransportCreateFailed)?;

        if let Some(c) = creds {
            xprt.set_credentials(c);
        }

        service.link_permanent(xprt.clone());
        xprt.received();

        let port = xprt.local_addr().map(|a| a.port()).unwrap_or(0);
        Ok(port)
    }
}

impl Default for ClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::Service;
    use crate::worker::RequestContext;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Mutex as StdMutex;

    #[derive(Debug)]
    struct FakeOps {
        created: StdMutex<u32>,
    }

    impl TransportOps for FakeOps {
        fn create(
            &self,
            _class: &Arc<TransportClass>,
            _service: &Arc<Service>,
            _net: &str,
            addr: SocketAddr,
            flags: XprtFlags,
        ) -> std::io::Result<Arc<XprtInstance>> {
            *self.created.lock().unwrap() += 1;
            Ok(XprtInstance::new_for_test(addr, flags))
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

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 20049)
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = ClassRegistry::new();
        let ops = Arc::new(FakeOps {
            created: StdMutex::new(0),
        });
        registry
            .register(TransportClass::new("dup", 1024, ops.clone()))
            .unwrap();
        let err = registry
            .register(TransportClass::new("dup", 1024, ops))
            .unwrap_err();
        assert!(matches!(err, XprtError::DuplicateClass(name) if name == "dup"));
    }

    #[test]
    fn unknown_class_without_autoload_errors() {
        let registry = ClassRegistry::new();
        let service = Service::new("test");
        let err = registry
            .create(&service, "nope", "tcp", addr(), XprtFlags::empty(), None)
            .unwrap_err();
        assert!(matches!(err, XprtError::UnknownClass(_)));
    }

    #[test]
    fn autoload_hook_reports_failure_without_retry_success() {
        let registry = ClassRegistry::new();
        registry.set_autoload_fn(|_name| false);
        let err = registry
            .create(&Service::new("test"), "late", "tcp", addr(), XprtFlags::empty(), None)
            .unwrap_err();
        assert!(matches!(err, XprtError::UnknownClass(_)));
    }

    #[test]
    fn autoload_hook_success_is_followed_by_a_real_lookup() {
        // the hook reporting `true` without the class actually having been
        // registered must still surface `UnknownClass`, not a panic or a
        // bogus success -- the registry always re-checks the table.
        let registry = ClassRegistry::new();
        registry.set_autoload_fn(|_name| true);
        let err = registry
            .create(&Service::new("test"), "late", "tcp", addr(), XprtFlags::empty(), None)
            .unwrap_err();
        assert!(matches!(err, XprtError::UnknownClass(_)));
    }

    #[test]
    fn registered_class_autoloads_are_not_needed() {
        let registry = ClassRegistry::new();
        let ops = Arc::new(FakeOps {
            created: StdMutex::new(0),
        });
        registry
            .register(TransportClass::new("late", 1024, ops.clone()))
            .unwrap();
        let port = registry
            .create(&Service::new("test"), "late", "tcp", addr(), XprtFlags::empty(), None)
            .unwrap();
        assert_eq!(port, 20049);
        assert_eq!(*ops.created.lock().unwrap(), 1);
    }

    #[test]
    fn unsupported_address_family_is_rejected() {
        // SocketAddr in std is always v4/v6, so this boundary is exercised
        // via the explicit match guard rather than a constructible bad
        // variant; verify the guard compiles and accepts both real kinds.
        let registry = ClassRegistry::new();
        let ops = Arc::new(FakeOps {
            created: StdMutex::new(0),
        });
        registry
            .register(TransportClass::new("stream", 1024, ops))
            .unwrap();
        let service = Service::new("test");
        assert!(registry
            .create(&service, "stream", "tcp", addr(), XprtFlags::empty(), None)
            .is_ok());
    }
}
