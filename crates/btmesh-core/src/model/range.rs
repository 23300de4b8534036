//! Address ranges and the checks built on them.
//!
//! Provisioners own closed intervals of unicast addresses, group addresses
//! and scene numbers. Range lists are kept normalized (sorted, merged and
//! disjoint) so overlap checks are a linear merge.

use std::fmt;

use btmesh_proto::address::{
    MAX_GROUP_ADDRESS, MAX_UNICAST_ADDRESS, MIN_GROUP_ADDRESS, MIN_UNICAST_ADDRESS,
};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Closed interval `[low, high]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AddressRange {
    /// First address
    pub low: u16,
    /// Last address
    pub high: u16,
}

impl AddressRange {
    /// Build a range. Bounds are checked by [`RangeKind::validate`].
    pub const fn new(low: u16, high: u16) -> Self {
        Self { low, high }
    }

    /// Number of addresses in the range.
    pub fn size(&self) -> u32 {
        u32::from(self.high).saturating_sub(u32::from(self.low)) + 1
    }

    /// True if `address` lies inside.
    pub fn contains(&self, address: u16) -> bool {
        (self.low..=self.high).contains(&address)
    }

    /// Closed-interval overlap.
    pub fn overlaps(&self, other: &Self) -> bool {
        self.low <= other.high && other.low <= self.high
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}-{:04X}", self.low, self.high)
    }
}

/// The three kinds of range a provisioner owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RangeKind {
    /// Unicast addresses, `0x0001..=0x7FFF`
    Unicast,
    /// Group addresses, `0xC000..=0xFEFF`
    Group,
    /// Scene numbers, `0x0001..=0xFFFF`
    Scene,
}

impl RangeKind {
    /// The legal domain of this kind.
    pub const fn domain(self) -> AddressRange {
        match self {
            Self::Unicast => AddressRange::new(MIN_UNICAST_ADDRESS, MAX_UNICAST_ADDRESS),
            Self::Group => AddressRange::new(MIN_GROUP_ADDRESS, MAX_GROUP_ADDRESS),
            Self::Scene => AddressRange::new(0x0001, 0xFFFF),
        }
    }

    /// Size of the range a new provisioner gets by default.
    pub const fn default_size(self) -> u16 {
        match self {
            Self::Unicast | Self::Scene => 0x1000,
            Self::Group => 0x0100,
        }
    }

    /// Check bounds against the domain.
    pub fn validate(self, range: &AddressRange) -> Result<(), ModelError> {
        let domain = self.domain();
        if range.low > range.high || !domain.contains(range.low) || !domain.contains(range.high) {
            return Err(ModelError::InvalidRange { kind: self, low: range.low, high: range.high });
        }
        Ok(())
    }
}

impl fmt::Display for RangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unicast => "unicast",
            Self::Group => "group",
            Self::Scene => "scene",
        })
    }
}

/// Sort and merge overlapping or adjacent ranges.
pub fn normalize(mut ranges: Vec<AddressRange>) -> Vec<AddressRange> {
    ranges.sort();
    let mut merged: Vec<AddressRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if u32::from(range.low) <= u32::from(last.high) + 1 => {
                last.high = last.high.max(range.high);
            },
            _ => merged.push(range),
        }
    }
    merged
}

/// True if any range of `a` overlaps any range of `b`.
pub fn ranges_overlap(a: &[AddressRange], b: &[AddressRange]) -> bool {
    a.iter().any(|x| b.iter().any(|y| x.overlaps(y)))
}

/// True if `address` lies in any of `ranges`.
pub fn is_address_in_ranges(address: u16, ranges: &[AddressRange]) -> bool {
    ranges.iter().any(|range| range.contains(address))
}

/// Find room for a new range of `size` inside `domain`, avoiding `taken`.
///
/// Prefers the first gap that fits entirely. When no gap is large enough the
/// largest remaining gap is returned instead.
pub fn first_free_range(
    taken: &[AddressRange],
    domain: AddressRange,
    size: u16,
) -> Option<AddressRange> {
    let taken = normalize(taken.to_vec());
    let want = u32::from(size.max(1));
    let mut gaps = Vec::new();
    let mut cursor = u32::from(domain.low);
    for range in taken.iter().filter(|range| range.overlaps(&domain)) {
        if u32::from(range.low) > cursor {
            gaps.push((cursor, u32::from(range.low) - 1));
        }
        cursor = cursor.max(u32::from(range.high) + 1);
    }
    if cursor <= u32::from(domain.high) {
        gaps.push((cursor, u32::from(domain.high)));
    }

    let fits = gaps.iter().find(|(low, high)| high - low + 1 >= want).map(|&(low, _)| {
        let high = low + want - 1;
        (low, high)
    });
    let (low, high) = fits.or_else(|| gaps.iter().copied().max_by_key(|(low, high)| high - low))?;
    Some(AddressRange::new(low as u16, high as u16))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_is_closed() {
        let a = AddressRange::new(0x0001, 0x00FF);
        assert!(a.overlaps(&AddressRange::new(0x00FF, 0x0200)));
        assert!(!a.overlaps(&AddressRange::new(0x0100, 0x0200)));
        assert!(a.overlaps(&AddressRange::new(0x0010, 0x0020)));
    }

    #[test]
    fn normalize_merges_adjacent_and_overlapping() {
        let ranges = normalize(vec![
            AddressRange::new(0x0200, 0x02FF),
            AddressRange::new(0x0001, 0x00FF),
            AddressRange::new(0x0100, 0x0150),
            AddressRange::new(0x0140, 0x0160),
        ]);
        assert_eq!(ranges, vec![AddressRange::new(0x0001, 0x0160), AddressRange::new(0x0200, 0x02FF)]);
    }

    #[test]
    fn validate_rejects_reversed_and_foreign_bounds() {
        assert!(RangeKind::Unicast.validate(&AddressRange::new(0x0001, 0x7FFF)).is_ok());
        assert!(RangeKind::Unicast.validate(&AddressRange::new(0x0010, 0x0001)).is_err());
        assert!(RangeKind::Unicast.validate(&AddressRange::new(0x0000, 0x0010)).is_err());
        assert!(RangeKind::Group.validate(&AddressRange::new(0xC000, 0xFF00)).is_err());
        assert!(RangeKind::Scene.validate(&AddressRange::new(0x0001, 0xFFFF)).is_ok());
    }

    #[test]
    fn first_free_range_skips_taken_space() {
        let domain = RangeKind::Unicast.domain();
        assert_eq!(first_free_range(&[], domain, 0x1000), Some(AddressRange::new(0x0001, 0x1000)));

        let taken = [AddressRange::new(0x0001, 0x1000)];
        assert_eq!(first_free_range(&taken, domain, 0x1000), Some(AddressRange::new(0x1001, 0x2000)));

        let full = [AddressRange::new(0x0001, 0x7FF0)];
        assert_eq!(first_free_range(&full, domain, 0x1000), Some(AddressRange::new(0x7FF1, 0x7FFF)));

        assert_eq!(first_free_range(&[domain], domain, 0x1000), None);
    }
}
