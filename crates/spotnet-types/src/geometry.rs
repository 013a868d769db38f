//! World coordinates and the distance metric used by every evaluation policy.

use serde::{Deserialize, Serialize};

/// An integer point on the world grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    /// Horizontal coordinate.
    pub x: i32,
    /// Vertical coordinate.
    pub y: i32,
}

impl Position {
    /// Create a position from its coordinates.
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to `other`, truncated toward zero.
    ///
    /// Truncation (not rounding) is part of the acceptance rules: a lot at
    /// true distance 10.9 passes a `max_distance` of 10.
    pub fn distance_to(self, other: Self) -> u32 {
        distance(self, other)
    }
}

impl core::fmt::Display for Position {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Euclidean distance between two positions, truncated to an integer.
///
/// Computed with an exact integer square root so the truncation never
/// depends on floating-point rounding. Saturates at `u32::MAX`.
pub fn distance(a: Position, b: Position) -> u32 {
    let dx = u128::from(i64::from(a.x).abs_diff(i64::from(b.x)));
    let dy = u128::from(i64::from(a.y).abs_diff(i64::from(b.y)));
    // Each delta is below 2^33, so the squares and their sum fit in u128.
    let squared = dx
        .saturating_mul(dx)
        .saturating_add(dy.saturating_mul(dy));
    u32::try_from(squared.isqrt()).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_to_self_is_zero() {
        let p = Position::new(4, -7);
        assert_eq!(distance(p, p), 0);
    }

    #[test]
    fn pythagorean_triple_is_exact() {
        assert_eq!(distance(Position::new(0, 0), Position::new(3, 4)), 5);
        assert_eq!(distance(Position::new(-6, -8), Position::new(0, 0)), 10);
    }

    #[test]
    fn distance_is_truncated_not_rounded() {
        // sqrt(1 + 1) = 1.414..
        assert_eq!(distance(Position::new(0, 0), Position::new(1, 1)), 1);
        // sqrt(100 + 16) = 10.77.. truncates to 10, rounding would give 11
        assert_eq!(distance(Position::new(0, 0), Position::new(10, 4)), 10);
        // sqrt(9 + 81) = 9.486..
        assert_eq!(distance(Position::new(2, 1), Position::new(5, 10)), 9);
    }

    #[test]
    fn distance_is_symmetric() {
        let a = Position::new(12, -3);
        let b = Position::new(-5, 20);
        assert_eq!(distance(a, b), distance(b, a));
        assert_eq!(a.distance_to(b), distance(a, b));
    }

    #[test]
    fn extreme_coordinates_do_not_overflow() {
        let a = Position::new(i32::MIN, i32::MIN);
        let b = Position::new(i32::MAX, i32::MAX);
        // sqrt(2) * (2^32 - 1) is above u32::MAX.
        assert_eq!(distance(a, b), u32::MAX);
    }
}
