//! Process-wide registry of open port names.
//!
//! Holding a [`PortClaim`] means this process owns the named port. A second
//! claim on the same name fails with [`LinkError::Connect`] instead of opening
//! a second OS handle. Dropping the claim frees the name.

use crate::error::{LinkError, LinkResult};
use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::sync::Mutex;
use tracing::debug;

static OPEN_PORTS: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

fn open_ports() -> std::sync::MutexGuard<'static, HashSet<String>> {
    OPEN_PORTS.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// RAII ownership of one port name.
#[derive(Debug)]
pub struct PortClaim {
    name: String,
}

impl PortClaim {
    /// Claim `name` for this process.
    ///
    /// # Errors
    /// [`LinkError::Connect`] if the name is already claimed.
    pub fn acquire(name: &str) -> LinkResult<Self> {
        let mut ports = open_ports();
        if !ports.insert(name.to_string()) {
            return Err(LinkError::Connect {
                port: name.to_string(),
                reason: "port is already open in this process".into(),
            });
        }
        debug!(port = name, "port claimed");
        Ok(Self {
            name: name.to_string(),
        })
    }

    /// Claimed port name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether `name` is currently claimed by anyone in this process.
    pub fn is_claimed(name: &str) -> bool {
        open_ports().contains(name)
    }
}

impl Drop for PortClaim {
    fn drop(&mut self) {
        open_ports().remove(&self.name);
        debug!(port = %self.name, "port released");
    }
}
