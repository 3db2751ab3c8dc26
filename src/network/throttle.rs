//! Per-address connection counting
//!
//! Tracks how many live sessions each source IP holds and refuses a new one
//! once the configured cap is met. Not synchronized on its own; the session
//! manager keeps it behind the same lock as the session registry so the two
//! never disagree.

use std::collections::HashMap;
use std::net::IpAddr;

#[derive(Debug)]
pub struct AddressQuota {
    /// Live connection count per source address. Zero counts are removed.
    counts: HashMap<IpAddr, usize>,
    max_per_address: usize,
}

impl AddressQuota {
    /// `max_per_address == 0` means no limit.
    pub fn new(max_per_address: usize) -> Self {
        Self {
            counts: HashMap::new(),
            max_per_address,
        }
    }

    pub fn max_per_address(&self) -> usize {
        self.max_per_address
    }

    pub fn count(&self, ip: IpAddr) -> usize {
        self.counts.get(&ip).copied().unwrap_or(0)
    }

    pub fn is_full(&self, ip: IpAddr) -> bool {
        self.max_per_address != 0 && self.count(ip) >= self.max_per_address
    }

    /// Records one more connection from `ip`. Returns false, leaving the
    /// count unchanged, when the cap is already met.
    pub fn try_acquire(&mut self, ip: IpAddr) -> bool {
        if self.is_full(ip) {
            return false;
        }
        *self.counts.entry(ip).or_insert(0) += 1;
        tracing::trace!("[throttle] acquire ip={} count={}", ip, self.counts[&ip]);
        true
    }

    pub fn release(&mut self, ip: IpAddr) {
        if let Some(count) = self.counts.get_mut(&ip) {
            *count -= 1;
            if *count == 0 {
                self.counts.remove(&ip);
            }
        }
    }

    /// Number of distinct addresses holding at least one connection.
    pub fn unique_addresses(&self) -> usize {
        self.counts.len()
    }

    pub fn clear(&mut self) {
        self.counts.clear();
    }
}
