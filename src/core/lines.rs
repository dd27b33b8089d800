//! Digital output levels as a bitmask.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Most output lines a matrix may declare (one bit each in [`OutputMask`]).
pub const MAX_OUTPUTS: usize = 32;

/// Most input lines a matrix may declare.
pub const MAX_INPUTS: usize = 32;

/// Set of asserted output lines, bit `i` being output `i` of the matrix.
///
/// The empty mask is the safe-default state: every controllable line cleared.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputMask(u32);

impl OutputMask {
    /// All outputs cleared.
    pub const EMPTY: OutputMask = OutputMask(0);

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    /// Mask with only line `index` set.
    pub fn line(index: usize) -> Self {
        debug_assert!(index < MAX_OUTPUTS);
        Self(1 << index)
    }

    pub fn with(self, index: usize) -> Self {
        Self(self.0 | Self::line(index).0)
    }

    pub fn contains(self, index: usize) -> bool {
        index < MAX_OUTPUTS && self.0 & (1 << index) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn intersects(self, other: OutputMask) -> bool {
        self.0 & other.0 != 0
    }

    /// Entry action of a state: assert `on`, then clear `off`.
    ///
    /// Clearing is applied last, so a line present in both ends up cleared.
    pub fn apply(self, on: OutputMask, off: OutputMask) -> Self {
        Self((self.0 | on.0) & !off.0)
    }

    /// Indices of the asserted lines, lowest first.
    pub fn indices(self) -> impl Iterator<Item = usize> {
        (0..MAX_OUTPUTS).filter(move |i| self.contains(*i))
    }
}

impl fmt::Display for OutputMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_mask_is_safe_default() {
        assert!(OutputMask::EMPTY.is_empty());
        assert_eq!(OutputMask::default(), OutputMask::EMPTY);
    }

    #[test]
    fn apply_asserts_then_clears() {
        let current = OutputMask::line(0);
        let next = current.apply(OutputMask::line(1), OutputMask::line(0));
        assert!(!next.contains(0));
        assert!(next.contains(1));
    }

    #[test]
    fn clear_wins_when_line_in_both_sets() {
        let both = OutputMask::line(3);
        let next = OutputMask::EMPTY.apply(both, both);
        assert!(next.is_empty());
    }

    #[test]
    fn untouched_lines_keep_their_level() {
        let current = OutputMask::line(2);
        let next = current.apply(OutputMask::line(0), OutputMask::EMPTY);
        assert!(next.contains(0));
        assert!(next.contains(2));
    }

    #[test]
    fn indices_lists_set_bits() {
        let mask = OutputMask::line(1).with(4).with(31);
        assert_eq!(mask.indices().collect::<Vec<_>>(), vec![1, 4, 31]);
        assert!(!mask.contains(40));
    }
}
