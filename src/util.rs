//! Miscellaneous utility structs and functions.

use std::fmt::Debug;

use cgmath::num_traits::Float;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// An interval on the real number line.
#[derive(Copy, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Interval<T> {
    pub min: T,
    pub max: T,
}

impl<T> Interval<T> {
    /// Creates a new interval.
    pub const fn new(min: T, max: T) -> Self {
        Self { min, max }
    }
}

impl<T: std::cmp::PartialOrd> Interval<T> {
    /// Returns true if this interval contains the value.
    pub fn contains(&self, value: T) -> bool {
        value >= self.min && value <= self.max
    }

    /// Returns true if `min <= max`. False if either end is NaN.
    pub fn is_valid(&self) -> bool {
        self.min <= self.max
    }
}

impl<T: Float> Interval<T> {
    /// An interval spanning the whole real line.
    pub fn unbounded() -> Self {
        Self {
            min: T::neg_infinity(),
            max: T::infinity(),
        }
    }

    /// Clamps a value into the interval.
    pub fn clamp(&self, value: T) -> T {
        value.max(self.min).min(self.max)
    }
}

impl<T: Debug> Debug for Interval<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Interval({:?}, {:?})", &self.min, &self.max)
    }
}

#[cfg(test)]
mod test {
    use super::Interval;

    #[test]
    fn clamp_and_contains() {
        let range = Interval::new(2.0, 4.0);
        assert_eq!(range.clamp(5.0), 4.0);
        assert_eq!(range.clamp(-1.0), 2.0);
        assert!(range.contains(2.0) && range.contains(4.0));
        assert!(!range.contains(4.5));
        assert!(Interval::<f64>::unbounded().contains(1e300));
    }

    #[test]
    fn nan_is_never_valid() {
        assert!(!Interval::new(f64::NAN, 1.0).is_valid());
        assert!(!Interval::new(0.0, f64::NAN).is_valid());
        assert!(Interval::new(1.0, 1.0).is_valid());
    }
}
