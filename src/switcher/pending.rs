//! Pending-ICMP table: time-bounded mapping from a locally generated
//! acknowledgement id to the original IP frame, used to correlate
//! asynchronous remote echo replies back to a synthesized local response.

use std::collections::HashMap;

use rand::Rng;

use crate::packet::IpFrame;

/// How long a forwarded echo may wait for its remote reply.
pub const ICMP_ECHO_TIMEOUT_MS: u64 = 3_000;

/// Acknowledgement ids are 24-bit and never zero.
pub const MAX_ACK_ID: u32 = (1 << 24) - 1;

#[derive(Debug)]
struct PendingEntry {
    expires_at: u64,
    frame: IpFrame,
}

/// Table of echoes parked while the remote peer answers.
///
/// Ids are allocated monotonically with wraparound, skipping any id that
/// is still live. The allocation scan is bounded; when no free id can be
/// found the operation fails instead of spinning (the original retried
/// forever).
#[derive(Debug)]
pub struct PendingIcmpTable {
    entries: HashMap<u32, PendingEntry>,
    next_id: u32,
}

impl Default for PendingIcmpTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingIcmpTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_id: rand::thread_rng().gen_range(1..=MAX_ACK_ID),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, ack_id: u32) -> bool {
        self.entries.contains_key(&ack_id)
    }

    /// Park a frame under a fresh acknowledgement id.
    ///
    /// Insertion happens here, before the caller attempts the send that
    /// can fail; a failed send must call [`remove`](Self::remove) so the
    /// sweep never sees a half-committed entry.
    pub fn park(&mut self, frame: IpFrame, now: u64) -> Option<u32> {
        let ack_id = self.allocate()?;
        self.entries.insert(
            ack_id,
            PendingEntry {
                expires_at: now + ICMP_ECHO_TIMEOUT_MS,
                frame,
            },
        );
        Some(ack_id)
    }

    /// Atomically remove-and-fetch the frame for a reply correlation.
    /// Each entry is consumed at most once.
    pub fn remove(&mut self, ack_id: u32) -> Option<IpFrame> {
        self.entries.remove(&ack_id).map(|e| e.frame)
    }

    /// Drop every entry whose deadline has passed. Expired echoes are
    /// silently dropped, never retried.
    pub fn sweep(&mut self, now: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }

    fn allocate(&mut self) -> Option<u32> {
        // Bounded scan: live entries plus slack. Beyond that the 24-bit
        // space is effectively saturated and the echo fails.
        let budget = self.entries.len() + 16;
        for _ in 0..budget {
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id < 1 || self.next_id > MAX_ACK_ID {
                self.next_id = 0;
                continue;
            }
            if !self.entries.contains_key(&self.next_id) {
                return Some(self.next_id);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::IpProtocol;
    use bytes::Bytes;
    use std::net::Ipv4Addr;

    fn frame() -> IpFrame {
        IpFrame {
            protocol: IpProtocol::Icmp,
            source: Ipv4Addr::new(10, 0, 0, 2),
            destination: Ipv4Addr::new(8, 8, 8, 8),
            ttl: 5,
            identification: 1,
            payload: Bytes::new(),
        }
    }

    #[test]
    fn ids_are_unique_and_nonzero() {
        let mut table = PendingIcmpTable::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..512 {
            let id = table.park(frame(), 0).unwrap();
            assert!(id >= 1 && id <= MAX_ACK_ID);
            assert!(seen.insert(id), "duplicate live id {id}");
        }
    }

    #[test]
    fn ids_wrap_around_the_24_bit_ceiling() {
        let mut table = PendingIcmpTable::new();
        table.next_id = MAX_ACK_ID - 1;
        let a = table.park(frame(), 0).unwrap();
        let b = table.park(frame(), 0).unwrap();
        let c = table.park(frame(), 0).unwrap();
        assert_eq!(a, MAX_ACK_ID);
        assert_eq!(b, 1);
        assert_eq!(c, 2);
    }

    #[test]
    fn allocation_skips_live_ids() {
        let mut table = PendingIcmpTable::new();
        table.next_id = 9;
        let first = table.park(frame(), 0).unwrap();
        assert_eq!(first, 10);
        table.next_id = 9; // force a collision with the live id
        let second = table.park(frame(), 0).unwrap();
        assert_eq!(second, 11);
    }

    #[test]
    fn entry_is_removed_exactly_once() {
        let mut table = PendingIcmpTable::new();
        let id = table.park(frame(), 0).unwrap();
        assert!(table.remove(id).is_some());
        assert!(table.remove(id).is_none());
    }

    #[test]
    fn sweep_expires_by_deadline() {
        let mut table = PendingIcmpTable::new();
        let id = table.park(frame(), 1_000).unwrap();
        // Present strictly before the deadline.
        assert_eq!(table.sweep(1_000 + ICMP_ECHO_TIMEOUT_MS - 1), 0);
        assert!(table.contains(id));
        // Gone at any sweep at or past it.
        assert_eq!(table.sweep(1_000 + ICMP_ECHO_TIMEOUT_MS), 1);
        assert!(!table.contains(id));
    }
}
