//
// registry.rs
//
// Copyright (C) 2025 ktransport contributors. All rights reserved.
//
//

//! The registry of running kernels.
//!
//! Passed by reference to whichever component needs kernel lookup; created by
//! the embedding application at startup and cleared when it shuts down. The
//! registry also carries the shared reserved-port list so that two kernels
//! starting up concurrently cannot be handed the same port.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;

/// A running kernel known to the registry.
#[derive(Debug, Clone)]
pub struct KernelRecord {
    /// The kernel's session ID
    pub session_id: String,

    /// The kernel's display name, from its spec
    pub display_name: String,

    /// The kernel's language, from its spec
    pub language: String,

    /// The process ID of the kernel
    pub pid: u32,
}

/// A shared registry of running kernels and the ports they hold.
#[derive(Default)]
pub struct KernelRegistry {
    kernels: RwLock<HashMap<String, KernelRecord>>,

    /// Ports reserved by running or starting kernels
    reserved_ports: Arc<RwLock<Vec<u16>>>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        KernelRegistry {
            kernels: RwLock::new(HashMap::new()),
            reserved_ports: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// The shared reserved-port list, for connection file generation.
    pub fn reserved_ports(&self) -> Arc<RwLock<Vec<u16>>> {
        self.reserved_ports.clone()
    }

    pub fn register(&self, record: KernelRecord) {
        let mut kernels = self.kernels.write().unwrap();
        log::debug!(
            "Registering kernel '{}' (session {}, pid {})",
            record.display_name,
            record.session_id,
            record.pid
        );
        kernels.insert(record.session_id.clone(), record);
    }

    pub fn get(&self, session_id: &str) -> Option<KernelRecord> {
        self.kernels.read().unwrap().get(session_id).cloned()
    }

    pub fn list(&self) -> Vec<KernelRecord> {
        self.kernels.read().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.kernels.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.read().unwrap().is_empty()
    }

    /// Remove a kernel and release the ports it held.
    pub fn unregister(&self, session_id: &str, ports: &[u16]) {
        let mut kernels = self.kernels.write().unwrap();
        if kernels.remove(session_id).is_some() {
            log::debug!("Unregistered kernel session {}", session_id);
        }
        let mut reserved = self.reserved_ports.write().unwrap();
        reserved.retain(|port| !ports.contains(port));
    }

    /// Drop every record and release every port.
    pub fn clear(&self) {
        self.kernels.write().unwrap().clear();
        self.reserved_ports.write().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(session_id: &str, pid: u32) -> KernelRecord {
        KernelRecord {
            session_id: session_id.to_string(),
            display_name: "Test Kernel".to_string(),
            language: "test".to_string(),
            pid,
        }
    }

    #[test]
    fn unregister_releases_ports() {
        let registry = KernelRegistry::new();
        registry.register(record("s1", 100));
        {
            let ports = registry.reserved_ports();
            ports.write().unwrap().extend([5001, 5002]);
        }

        registry.unregister("s1", &[5001, 5002]);
        assert!(registry.get("s1").is_none());
        assert!(registry.reserved_ports().read().unwrap().is_empty());
    }

    #[test]
    fn register_and_lookup() {
        let registry = KernelRegistry::new();
        registry.register(record("s1", 100));
        registry.register(record("s2", 200));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("s2").unwrap().pid, 200);
        registry.clear();
        assert!(registry.is_empty());
    }
}
