//! Out-of-order segment cache.
//!
//! Segments that arrive ahead of the receiver's cumulative frontier wait here,
//! keyed by their exact sequence number.  Keys carry no ordering meaning
//! beyond exact lookup; a later segment with the same key replaces the
//! earlier one.  [`OutOfOrderCache::drain_from`] removes the run of
//! segments that has become contiguous with the frontier.

use std::collections::HashMap;

use crate::packet::Packet;

#[derive(Debug, Default)]
pub struct OutOfOrderCache {
    entries: HashMap<u32, Packet>,
}

impl OutOfOrderCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer `packet` under its sequence number.
    ///
    /// Returns the entry it replaced, if any.
    pub fn insert(&mut self, packet: Packet) -> Option<Packet> {
        self.entries.insert(packet.header.seq, packet)
    }

    pub fn get(&self, seq: u32) -> Option<&Packet> {
        self.entries.get(&seq)
    }

    pub fn contains(&self, seq: u32) -> bool {
        self.entries.contains_key(&seq)
    }

    pub fn remove(&mut self, seq: u32) -> Option<Packet> {
        self.entries.remove(&seq)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Discard everything.  Returns how many entries were dropped.
    pub fn clear(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        n
    }

    /// Remove, in order, every segment that continues the stream from
    /// `frontier`: the entry keyed at `frontier`, then the one keyed at that
    /// entry's end, and so on until a key is missing.
    ///
    /// The iterator is lazy; dropping it early leaves the rest cached.
    pub fn drain_from(&mut self, frontier: u32) -> DrainContiguous<'_> {
        DrainContiguous {
            cache: self,
            next: frontier,
        }
    }
}

/// Iterator returned by [`OutOfOrderCache::drain_from`].
#[derive(Debug)]
pub struct DrainContiguous<'a> {
    cache: &'a mut OutOfOrderCache,
    next: u32,
}

impl Iterator for DrainContiguous<'_> {
    type Item = Packet;

    fn next(&mut self) -> Option<Packet> {
        let pkt = self.cache.remove(self.next)?;
        self.next = pkt.seq_end();
        Some(pkt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Header;

    fn seg(seq: u32, len: usize) -> Packet {
        Packet::new(Header::new(seq, 0, 0), vec![seq as u8; len])
    }

    #[test]
    fn insert_and_lookup_by_exact_key() {
        let mut cache = OutOfOrderCache::new();
        assert!(cache.insert(seg(100, 10)).is_none());
        assert!(cache.contains(100));
        assert!(!cache.contains(101));
        assert_eq!(cache.get(100).map(|p| p.payload.len()), Some(10));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn duplicate_key_overwrites() {
        let mut cache = OutOfOrderCache::new();
        cache.insert(seg(100, 10));
        let replaced = cache.insert(seg(100, 4)).unwrap();
        assert_eq!(replaced.payload.len(), 10);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(100).unwrap().payload.len(), 4);
    }

    #[test]
    fn drain_follows_the_contiguous_run() {
        let mut cache = OutOfOrderCache::new();
        cache.insert(seg(20, 10));
        cache.insert(seg(10, 10));
        cache.insert(seg(50, 10)); // gap at 30..50

        let drained: Vec<u32> = cache.drain_from(10).map(|p| p.header.seq).collect();
        assert_eq!(drained, vec![10, 20]);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(50));
    }

    #[test]
    fn drain_without_match_removes_nothing() {
        let mut cache = OutOfOrderCache::new();
        cache.insert(seg(20, 10));
        assert_eq!(cache.drain_from(10).count(), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn drain_terminates_on_empty_segment() {
        let mut cache = OutOfOrderCache::new();
        cache.insert(seg(10, 0));
        assert_eq!(cache.drain_from(10).count(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn drain_crosses_sequence_wrap() {
        let start = u32::MAX - 3;
        let mut cache = OutOfOrderCache::new();
        cache.insert(seg(start, 8));
        cache.insert(seg(start.wrapping_add(8), 8));
        assert_eq!(cache.drain_from(start).count(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn clear_reports_dropped_entries() {
        let mut cache = OutOfOrderCache::new();
        cache.insert(seg(1, 1));
        cache.insert(seg(5, 1));
        assert_eq!(cache.clear(), 2);
        assert!(cache.is_empty());
    }
}
