//! Port allocation for agent-server instances.
//!
//! Ports come from an inclusive configured range. A candidate is handed
//! out only if it is not already assigned by this allocator and a
//! loopback bind probe succeeds.

use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::Mutex;

use tracing::debug;

use crate::config::PortRange;
use crate::{AppError, Result};

/// Hands out free TCP ports and tracks the ones currently assigned.
#[derive(Debug)]
pub struct PortAllocator {
    range: PortRange,
    used: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    /// Create an allocator over `range`.
    #[must_use]
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            used: Mutex::new(HashSet::new()),
        }
    }

    /// Assign the first free port in the range.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NoPortsAvailable` when every port is assigned or
    /// refuses a bind, or `AppError::Io` if the tracking lock is poisoned.
    pub fn allocate(&self) -> Result<u16> {
        let mut used = self
            .used
            .lock()
            .map_err(|_| AppError::Io("port allocator lock poisoned".into()))?;

        for port in self.range.start..=self.range.end {
            if used.contains(&port) {
                continue;
            }
            if is_port_available(port) {
                used.insert(port);
                debug!(port, "port allocated");
                return Ok(port);
            }
        }

        Err(AppError::NoPortsAvailable(format!(
            "no free port in {}-{}",
            self.range.start, self.range.end
        )))
    }

    /// Mark a caller-chosen port as assigned without probing it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::AlreadyExists` if the port is already assigned.
    pub fn reserve(&self, port: u16) -> Result<()> {
        let mut used = self
            .used
            .lock()
            .map_err(|_| AppError::Io("port allocator lock poisoned".into()))?;
        if !used.insert(port) {
            return Err(AppError::AlreadyExists(format!("port {port} already assigned")));
        }
        Ok(())
    }

    /// Return `port` to the pool. Releasing an unassigned port is a no-op.
    pub fn release(&self, port: u16) {
        if let Ok(mut used) = self.used.lock() {
            if used.remove(&port) {
                debug!(port, "port released");
            }
        }
    }

    /// Whether `port` is currently assigned.
    #[must_use]
    pub fn is_assigned(&self, port: u16) -> bool {
        self.used.lock().is_ok_and(|used| used.contains(&port))
    }

    /// Number of assigned ports.
    #[must_use]
    pub fn assigned_count(&self) -> usize {
        self.used.lock().map_or(0, |used| used.len())
    }
}

/// Probe whether `port` can be bound on the loopback interface.
#[must_use]
pub fn is_port_available(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}
