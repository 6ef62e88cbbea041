//! Hash slot ownership bitmaps.
//!
//! Every primary advertises the slots it owns as a fixed-size bitmap with one
//! bit per slot, which is also exactly how it travels on the wire.

/// Total number of hash slots in the cluster (Redis Cluster standard).
pub const SLOT_COUNT: u16 = 16384;

/// Size of a slot bitmap in bytes.
pub const SLOT_BITMAP_LEN: usize = SLOT_COUNT as usize / 8;

/// A contiguous range of slots, used for display.
///
/// # Invariants
///
/// `start <= end < SLOT_COUNT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16, // inclusive
}

impl SlotRange {
    /// Creates a new slot range (end is inclusive).
    ///
    /// # Panics
    ///
    /// Panics if `start > end` or if `end >= SLOT_COUNT`.
    pub fn new(start: u16, end: u16) -> Self {
        assert!(start <= end, "SlotRange requires start <= end");
        assert!(end < SLOT_COUNT, "slot must be < {SLOT_COUNT}");
        Self { start, end }
    }

    /// Returns the number of slots in this range (always >= 1).
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u16 {
        self.end - self.start + 1
    }

    /// Returns an iterator over all slots in this range.
    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl std::fmt::Display for SlotRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// One bit per hash slot.
#[derive(Clone, PartialEq, Eq)]
pub struct SlotBitmap {
    // boxed to keep ClusterNode and ClusterMessage small on the stack
    bits: Box<[u8; SLOT_BITMAP_LEN]>,
}

impl Default for SlotBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotBitmap {
    /// Creates an empty bitmap.
    pub fn new() -> Self {
        Self {
            bits: Box::new([0; SLOT_BITMAP_LEN]),
        }
    }

    /// Creates a bitmap with every slot in `ranges` set.
    pub fn from_ranges(ranges: &[SlotRange]) -> Self {
        let mut map = Self::new();
        for range in ranges {
            for slot in range.iter() {
                map.set(slot);
            }
        }
        map
    }

    /// Creates a bitmap from its raw wire bytes.
    pub fn from_bytes(bytes: [u8; SLOT_BITMAP_LEN]) -> Self {
        Self {
            bits: Box::new(bytes),
        }
    }

    /// Raw wire bytes.
    pub fn as_bytes(&self) -> &[u8; SLOT_BITMAP_LEN] {
        &self.bits
    }

    pub fn set(&mut self, slot: u16) {
        debug_assert!(slot < SLOT_COUNT);
        self.bits[slot as usize / 8] |= 1 << (slot % 8);
    }

    pub fn clear(&mut self, slot: u16) {
        debug_assert!(slot < SLOT_COUNT);
        self.bits[slot as usize / 8] &= !(1 << (slot % 8));
    }

    /// Returns true if `slot` is set.
    pub fn contains(&self, slot: u16) -> bool {
        slot < SLOT_COUNT && self.bits[slot as usize / 8] & (1 << (slot % 8)) != 0
    }

    /// Number of slots set.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    /// Returns true if every slot is set.
    pub fn is_full(&self) -> bool {
        self.bits.iter().all(|&b| b == u8::MAX)
    }

    /// Sets every slot that is set in `other`.
    pub fn union_with(&mut self, other: &SlotBitmap) {
        for (a, b) in self.bits.iter_mut().zip(other.bits.iter()) {
            *a |= b;
        }
    }

    /// Iterates over every set slot in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        (0..SLOT_COUNT).filter(move |&s| self.contains(s))
    }

    /// Collapses the set slots into contiguous ranges.
    pub fn ranges(&self) -> Vec<SlotRange> {
        let mut ranges = Vec::new();
        let mut current: Option<(u16, u16)> = None;

        for slot in self.iter() {
            current = match current {
                Some((start, end)) if end + 1 == slot => Some((start, slot)),
                Some((start, end)) => {
                    ranges.push(SlotRange::new(start, end));
                    Some((slot, slot))
                }
                None => Some((slot, slot)),
            };
        }

        if let Some((start, end)) = current {
            ranges.push(SlotRange::new(start, end));
        }
        ranges
    }
}

impl std::fmt::Debug for SlotBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.ranges()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_range_display() {
        assert_eq!(SlotRange::new(0, 5460).to_string(), "0-5460");
        assert_eq!(SlotRange::new(100, 100).to_string(), "100");
    }

    #[test]
    #[should_panic(expected = "start <= end")]
    fn slot_range_rejects_inverted() {
        SlotRange::new(10, 5);
    }

    #[test]
    fn set_clear_contains() {
        let mut map = SlotBitmap::new();
        assert!(map.is_empty());

        map.set(0);
        map.set(7);
        map.set(16383);
        assert!(map.contains(0));
        assert!(map.contains(7));
        assert!(map.contains(16383));
        assert!(!map.contains(8));
        assert_eq!(map.count(), 3);

        map.clear(7);
        assert!(!map.contains(7));
        assert_eq!(map.count(), 2);
    }

    #[test]
    fn out_of_range_is_never_contained() {
        let map = SlotBitmap::from_ranges(&[SlotRange::new(0, SLOT_COUNT - 1)]);
        assert!(!map.contains(SLOT_COUNT));
    }

    #[test]
    fn ranges_collapse_contiguous_slots() {
        let map = SlotBitmap::from_ranges(&[
            SlotRange::new(0, 99),
            SlotRange::new(100, 199),
            SlotRange::new(500, 500),
            SlotRange::new(16000, 16383),
        ]);
        assert_eq!(
            map.ranges(),
            vec![
                SlotRange::new(0, 199),
                SlotRange::new(500, 500),
                SlotRange::new(16000, 16383),
            ]
        );
        assert_eq!(map.count(), 200 + 1 + 384);
    }

    #[test]
    fn union_fills_the_map() {
        let mut map = SlotBitmap::from_ranges(&[SlotRange::new(0, 8191)]);
        assert!(!map.is_full());
        map.union_with(&SlotBitmap::from_ranges(&[SlotRange::new(8192, 16383)]));
        assert!(map.is_full());
        assert_eq!(map.count(), SLOT_COUNT as usize);
    }

    #[test]
    fn bytes_roundtrip_preserves_bits() {
        let map = SlotBitmap::from_ranges(&[SlotRange::new(42, 4242)]);
        let copy = SlotBitmap::from_bytes(*map.as_bytes());
        assert_eq!(map, copy);
    }
}
