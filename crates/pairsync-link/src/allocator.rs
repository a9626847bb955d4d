//! Session port allocation.
//!
//! The counter is seeded from pair history so a restarted host does not hand
//! out a port an old peer may still remember. History is a hint, not a
//! reservation: two hosts reading the same file can still collide, and a
//! collision surfaces as a bind failure that simply advances the counter.

use std::collections::HashSet;

use crate::error::{LinkError, Result};

#[derive(Debug, Clone)]
pub struct PortAllocator {
    floor: u16,
    next: u32,
}

impl PortAllocator {
    /// Start at `max(last_used + 1, floor)`.
    pub fn new(floor: u16, last_used: Option<u16>) -> Self {
        let seed = last_used.map_or(0, |p| u32::from(p) + 1);
        Self {
            floor,
            next: seed.max(u32::from(floor)),
        }
    }

    /// Hand out the next port not present in `in_use`.
    ///
    /// Ports are strictly increasing across calls, whether or not the caller
    /// manages to bind them.
    pub fn next(&mut self, in_use: &HashSet<u16>) -> Result<u16> {
        loop {
            let candidate = u16::try_from(self.next)
                .map_err(|_| LinkError::PortsExhausted { floor: self.floor })?;
            self.next += 1;
            if !in_use.contains(&candidate) {
                return Ok(candidate);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_above_discovery_port() {
        let mut alloc = PortAllocator::new(3001, None);
        let none = HashSet::new();
        assert_eq!(alloc.next(&none).unwrap(), 3001);
        assert_eq!(alloc.next(&none).unwrap(), 3002);
        assert_eq!(alloc.next(&none).unwrap(), 3003);
    }

    #[test]
    fn seeds_from_history() {
        let mut alloc = PortAllocator::new(3001, Some(3017));
        assert_eq!(alloc.next(&HashSet::new()).unwrap(), 3018);

        // Stale history below the floor is ignored.
        let mut alloc = PortAllocator::new(3001, Some(80));
        assert_eq!(alloc.next(&HashSet::new()).unwrap(), 3001);
    }

    #[test]
    fn skips_live_ports() {
        let mut alloc = PortAllocator::new(3001, None);
        let in_use: HashSet<u16> = [3001, 3002, 3004].into_iter().collect();
        assert_eq!(alloc.next(&in_use).unwrap(), 3003);
        assert_eq!(alloc.next(&in_use).unwrap(), 3005);
    }

    #[test]
    fn concurrent_allocations_never_repeat() {
        let mut alloc = PortAllocator::new(3001, None);
        let mut live = HashSet::new();
        let mut previous = 0;
        for round in 0..200 {
            let port = alloc.next(&live).unwrap();
            assert!(port > previous, "round {round}: {port} <= {previous}");
            assert!(live.insert(port), "duplicate port {port}");
            previous = port;
            if round % 3 == 0 {
                live.remove(&port);
            }
        }
    }

    #[test]
    fn exhausts_at_top_of_range() {
        let mut alloc = PortAllocator::new(3001, Some(u16::MAX - 1));
        assert_eq!(alloc.next(&HashSet::new()).unwrap(), u16::MAX);
        assert!(matches!(
            alloc.next(&HashSet::new()),
            Err(LinkError::PortsExhausted { floor: 3001 })
        ));
    }
}
