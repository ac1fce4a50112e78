//! Interval primitives for slot timelines.
//!
//! # Responsibility
//! - Represent UTC instants, interval bounds and half-open ranges.
//! - Provide the interval algebra used by the applier and the extender.
//!
//! # Invariants
//! - `Bound` ordering is `-∞ < At(t) < +∞`.
//! - A `UtcRange` lower bound is never `+∞` and its upper bound is never `-∞`.
//! - `lower >= upper` means the range is empty.

use serde::{Deserialize, Serialize};
use std::cmp::{max, min, Ordering};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Duration;

/// UTC instant in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current wall-clock instant.
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(i64::try_from(millis).unwrap_or(i64::MAX))
    }

    pub fn as_millis(self) -> i64 {
        self.0
    }

    /// Adds a duration, saturating at the representable maximum.
    pub fn saturating_add(self, span: Duration) -> Self {
        let millis = i64::try_from(span.as_millis()).unwrap_or(i64::MAX);
        Self(self.0.saturating_add(millis))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One side of a range. Variant order is the total order of bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Bound {
    NegInfinity,
    At(Timestamp),
    PosInfinity,
}

impl Bound {
    pub fn at(millis: i64) -> Self {
        Self::At(Timestamp(millis))
    }

    /// Finite instant carried by this bound, if any.
    pub fn timestamp(self) -> Option<Timestamp> {
        match self {
            Self::At(value) => Some(value),
            Self::NegInfinity | Self::PosInfinity => None,
        }
    }

    pub fn is_finite(self) -> bool {
        matches!(self, Self::At(_))
    }
}

impl Display for Bound {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NegInfinity => write!(f, "-inf"),
            Self::At(value) => write!(f, "{value}"),
            Self::PosInfinity => write!(f, "+inf"),
        }
    }
}

/// Rejected range construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    /// Lower bound was `+∞`.
    LowerIsPosInfinity,
    /// Upper bound was `-∞`.
    UpperIsNegInfinity,
}

impl Display for RangeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LowerIsPosInfinity => write!(f, "range lower bound cannot be +inf"),
            Self::UpperIsNegInfinity => write!(f, "range upper bound cannot be -inf"),
        }
    }
}

impl Error for RangeError {}

/// Half-open UTC range `[lower, upper)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UtcRange {
    lower: Bound,
    upper: Bound,
}

impl UtcRange {
    pub fn new(lower: Bound, upper: Bound) -> Result<Self, RangeError> {
        if lower == Bound::PosInfinity {
            return Err(RangeError::LowerIsPosInfinity);
        }
        if upper == Bound::NegInfinity {
            return Err(RangeError::UpperIsNegInfinity);
        }
        Ok(Self { lower, upper })
    }

    /// `[lower, upper)` between two finite instants.
    pub fn between(lower_ms: i64, upper_ms: i64) -> Self {
        Self {
            lower: Bound::at(lower_ms),
            upper: Bound::at(upper_ms),
        }
    }

    /// `[lower, +∞)`.
    pub fn since(lower_ms: i64) -> Self {
        Self {
            lower: Bound::at(lower_ms),
            upper: Bound::PosInfinity,
        }
    }

    /// `(-∞, upper)`.
    pub fn until(upper_ms: i64) -> Self {
        Self {
            lower: Bound::NegInfinity,
            upper: Bound::at(upper_ms),
        }
    }

    /// `(-∞, +∞)`.
    pub fn all() -> Self {
        Self {
            lower: Bound::NegInfinity,
            upper: Bound::PosInfinity,
        }
    }

    pub fn lower(&self) -> Bound {
        self.lower
    }

    pub fn upper(&self) -> Bound {
        self.upper
    }

    pub fn is_empty(&self) -> bool {
        self.lower >= self.upper
    }

    pub fn contains(&self, instant: Timestamp) -> bool {
        let point = Bound::At(instant);
        self.lower <= point && point < self.upper
    }

    pub fn overlaps(&self, other: &UtcRange) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.lower < other.upper
            && other.lower < self.upper
    }

    /// Common part of two ranges, `None` when they do not overlap.
    pub fn intersect(&self, other: &UtcRange) -> Option<UtcRange> {
        let candidate = UtcRange {
            lower: max(self.lower, other.lower),
            upper: min(self.upper, other.upper),
        };
        (!candidate.is_empty()).then_some(candidate)
    }

    /// `self.upper == other.lower` on a finite instant.
    pub fn adjacent_to(&self, other: &UtcRange) -> bool {
        self.upper.is_finite() && self.upper == other.lower
    }

    /// Same range with another lower bound; `+∞` collapses to an empty range.
    pub fn with_lower(&self, lower: Bound) -> UtcRange {
        UtcRange {
            lower: min(lower, self.upper),
            upper: self.upper,
        }
    }

    /// Same range with another upper bound; `-∞` collapses to an empty range.
    pub fn with_upper(&self, upper: Bound) -> UtcRange {
        UtcRange {
            lower: self.lower,
            upper: max(upper, self.lower),
        }
    }

    /// Finite duration, `None` when either side is unbounded.
    pub fn duration(&self) -> Option<Duration> {
        match (self.lower, self.upper) {
            (Bound::At(lower), Bound::At(upper)) if upper > lower => {
                Some(Duration::from_millis(upper.0.abs_diff(lower.0)))
            }
            (Bound::At(_), Bound::At(_)) => Some(Duration::ZERO),
            _ => None,
        }
    }
}

impl PartialOrd for UtcRange {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for UtcRange {
    fn cmp(&self, other: &Self) -> Ordering {
        self.lower
            .cmp(&other.lower)
            .then_with(|| self.upper.cmp(&other.upper))
    }
}

impl Display for UtcRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.lower {
            Bound::NegInfinity => write!(f, "(")?,
            _ => write!(f, "[")?,
        }
        write!(f, "{},{})", self.lower, self.upper)
    }
}

#[cfg(test)]
mod tests {
    use super::{Bound, RangeError, Timestamp, UtcRange};
    use std::time::Duration;

    #[test]
    fn bounds_order_infinities_outside_instants() {
        assert!(Bound::NegInfinity < Bound::at(i64::MIN));
        assert!(Bound::at(i64::MAX) < Bound::PosInfinity);
        assert!(Bound::at(1) < Bound::at(2));
    }

    #[test]
    fn new_rejects_inverted_infinities() {
        assert_eq!(
            UtcRange::new(Bound::PosInfinity, Bound::PosInfinity),
            Err(RangeError::LowerIsPosInfinity)
        );
        assert_eq!(
            UtcRange::new(Bound::NegInfinity, Bound::NegInfinity),
            Err(RangeError::UpperIsNegInfinity)
        );
    }

    #[test]
    fn half_open_contains_lower_but_not_upper() {
        let range = UtcRange::between(10, 20);
        assert!(range.contains(Timestamp(10)));
        assert!(range.contains(Timestamp(19)));
        assert!(!range.contains(Timestamp(20)));
        assert!(UtcRange::all().contains(Timestamp(i64::MIN)));
    }

    #[test]
    fn adjacent_ranges_do_not_overlap() {
        let left = UtcRange::between(0, 10);
        let right = UtcRange::between(10, 20);
        assert!(!left.overlaps(&right));
        assert!(left.adjacent_to(&right));
        assert!(!right.adjacent_to(&left));
        assert_eq!(left.intersect(&right), None);
    }

    #[test]
    fn intersect_clips_to_common_part() {
        let slot = UtcRange::since(5);
        let association = UtcRange::between(0, 8);
        assert_eq!(slot.intersect(&association), Some(UtcRange::between(5, 8)));
        assert_eq!(
            UtcRange::all().intersect(&UtcRange::until(3)),
            Some(UtcRange::until(3))
        );
    }

    #[test]
    fn empty_ranges_overlap_nothing() {
        let empty = UtcRange::between(7, 7);
        assert!(empty.is_empty());
        assert!(!empty.overlaps(&UtcRange::all()));
        assert!(UtcRange::between(9, 3).is_empty());
    }

    #[test]
    fn unbounded_ranges_are_never_adjacent() {
        assert!(!UtcRange::since(4).adjacent_to(&UtcRange::all()));
    }

    #[test]
    fn duration_is_only_known_for_finite_ranges() {
        assert_eq!(
            UtcRange::between(1_000, 3_500).duration(),
            Some(Duration::from_millis(2_500))
        );
        assert_eq!(UtcRange::since(0).duration(), None);
    }

    #[test]
    fn duration_spans_the_whole_instant_domain() {
        assert_eq!(
            UtcRange::between(i64::MIN, i64::MAX).duration(),
            Some(Duration::from_millis(u64::MAX))
        );
    }

    #[test]
    fn ordering_is_lexicographic_on_lower_bound() {
        let mut ranges = vec![
            UtcRange::between(5, 6),
            UtcRange::since(1),
            UtcRange::until(0),
        ];
        ranges.sort();
        assert_eq!(
            ranges,
            vec![
                UtcRange::until(0),
                UtcRange::since(1),
                UtcRange::between(5, 6)
            ]
        );
    }
}
