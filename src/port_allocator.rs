//! TCP port allocation for managed services.
//!
//! A port is probed by binding a throwaway listener and releasing it
//! immediately. Because a probe does not keep the port bound, concurrent
//! allocations could race to the same answer; `allocate` therefore serializes
//! probe-and-reserve under one lock and tracks which service owns each
//! reservation until it is released.

use std::collections::HashMap;
use std::net::TcpListener;
use tokio::sync::Mutex;

use crate::supervisor::error::WardenError;

pub struct PortAllocator {
    range_lo: u16,
    range_hi: u16,
    /// port -> owning service name
    reserved: Mutex<HashMap<u16, String>>,
}

impl PortAllocator {
    pub fn new(range_lo: u16, range_hi: u16) -> Self {
        Self {
            range_lo,
            range_hi,
            reserved: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a port can currently be bound on the loopback interface.
    pub fn is_free(port: u16) -> bool {
        TcpListener::bind(("127.0.0.1", port)).is_ok()
    }

    /// Return `preferred` if it is free, or already reserved by `owner`
    /// itself; otherwise scan the configured range in ascending order for the
    /// first free unreserved port. Fails with `PortExhaustion` when the whole
    /// range is taken.
    pub async fn allocate(&self, preferred: u16, owner: &str) -> Result<u16, WardenError> {
        let mut reserved = self.reserved.lock().await;

        if preferred != 0 {
            match reserved.get(&preferred) {
                // The owner re-requesting its own port keeps it, even while
                // its process has the port bound.
                Some(holder) if holder == owner => return Ok(preferred),
                Some(_) => {}
                None if Self::is_free(preferred) => {
                    reserved.insert(preferred, owner.to_string());
                    return Ok(preferred);
                }
                None => {}
            }
        }

        for port in self.range_lo..=self.range_hi {
            if !reserved.contains_key(&port) && Self::is_free(port) {
                reserved.insert(port, owner.to_string());
                tracing::info!(
                    "Allocated port {} to '{}' (preferred {} unavailable)",
                    port, owner, preferred
                );
                return Ok(port);
            }
        }

        Err(WardenError::PortExhaustion {
            lo: self.range_lo,
            hi: self.range_hi,
        })
    }

    /// Mark a port as reserved without probing it. Returns false if the port
    /// is already held by another owner.
    pub async fn reserve(&self, port: u16, owner: &str) -> bool {
        let mut reserved = self.reserved.lock().await;
        match reserved.get(&port) {
            Some(holder) => holder == owner,
            None => {
                reserved.insert(port, owner.to_string());
                true
            }
        }
    }

    /// Release a reservation so the port becomes allocatable again.
    pub async fn release(&self, port: u16) {
        self.reserved.lock().await.remove(&port);
    }

    /// Snapshot of currently reserved ports, ascending.
    pub async fn reserved_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.reserved.lock().await.keys().copied().collect();
        ports.sort_unstable();
        ports
    }
}
