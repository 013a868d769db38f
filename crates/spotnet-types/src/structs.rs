//! Records and protocol payloads exchanged between cars and lots.
//!
//! Everything here is a plain value: offers are snapshots of a lot's state
//! at send time and never change afterwards, even if the lot's inventory
//! does.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::enums::{EvaluationPolicyKind, SpotCategory};
use crate::geometry::Position;
use crate::ids::{CarId, LotId};

// ---------------------------------------------------------------------------
// Category sets and per-category counts
// ---------------------------------------------------------------------------

/// A subset of [`SpotCategory`] values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpotCategorySet {
    /// Regular spots are included.
    pub regular: bool,
    /// Luxury spots are included.
    pub luxury: bool,
    /// Handicap spots are included.
    pub handicap: bool,
}

impl SpotCategorySet {
    /// The empty set.
    pub const EMPTY: Self = Self {
        regular: false,
        luxury: false,
        handicap: false,
    };

    /// The set of every category.
    pub const ALL: Self = Self {
        regular: true,
        luxury: true,
        handicap: true,
    };

    /// Build a set from the given categories.
    pub fn of(categories: &[SpotCategory]) -> Self {
        let mut set = Self::EMPTY;
        for &category in categories {
            set.insert(category);
        }
        set
    }

    /// Parse a three-digit `RLH` flag string such as `"101"`.
    ///
    /// `1` means the category is included and `0` that it is not, in the
    /// order Regular, Luxury, Handicap. Returns `None` for anything else.
    pub fn from_flags(flags: &str) -> Option<Self> {
        let mut digits = flags.trim().chars();
        let mut next = || match digits.next() {
            Some('1') => Some(true),
            Some('0') => Some(false),
            _ => None,
        };
        let set = Self {
            regular: next()?,
            luxury: next()?,
            handicap: next()?,
        };
        if digits.next().is_some() {
            return None;
        }
        Some(set)
    }

    /// Whether `category` is in the set.
    pub const fn contains(self, category: SpotCategory) -> bool {
        match category {
            SpotCategory::Regular => self.regular,
            SpotCategory::Luxury => self.luxury,
            SpotCategory::Handicap => self.handicap,
        }
    }

    /// Add `category` to the set.
    pub const fn insert(&mut self, category: SpotCategory) {
        match category {
            SpotCategory::Regular => self.regular = true,
            SpotCategory::Luxury => self.luxury = true,
            SpotCategory::Handicap => self.handicap = true,
        }
    }

    /// Whether the set holds no category at all.
    pub const fn is_empty(self) -> bool {
        !self.regular && !self.luxury && !self.handicap
    }

    /// Number of categories in the set.
    pub fn len(self) -> usize {
        self.iter().count()
    }

    /// Categories in the set, in declaration order.
    pub fn iter(self) -> impl Iterator<Item = SpotCategory> {
        SpotCategory::ALL
            .into_iter()
            .filter(move |&category| self.contains(category))
    }

    /// Categories present in both sets.
    #[must_use]
    pub const fn intersection(self, other: Self) -> Self {
        Self {
            regular: self.regular && other.regular,
            luxury: self.luxury && other.luxury,
            handicap: self.handicap && other.handicap,
        }
    }
}

impl core::fmt::Display for SpotCategorySet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let names: Vec<&str> = self.iter().map(SpotCategory::as_str).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

/// A non-negative count per [`SpotCategory`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpotCounts {
    /// Count of regular spots.
    #[serde(default)]
    pub regular: u32,
    /// Count of luxury spots.
    #[serde(default)]
    pub luxury: u32,
    /// Count of handicap spots.
    #[serde(default)]
    pub handicap: u32,
}

impl SpotCounts {
    /// Create counts from explicit values.
    pub const fn new(regular: u32, luxury: u32, handicap: u32) -> Self {
        Self {
            regular,
            luxury,
            handicap,
        }
    }

    /// The count for `category`.
    pub const fn get(&self, category: SpotCategory) -> u32 {
        match category {
            SpotCategory::Regular => self.regular,
            SpotCategory::Luxury => self.luxury,
            SpotCategory::Handicap => self.handicap,
        }
    }

    /// Mutable access to the count for `category`.
    pub const fn get_mut(&mut self, category: SpotCategory) -> &mut u32 {
        match category {
            SpotCategory::Regular => &mut self.regular,
            SpotCategory::Luxury => &mut self.luxury,
            SpotCategory::Handicap => &mut self.handicap,
        }
    }

    /// Sum over all categories, or `None` on overflow.
    pub fn total(&self) -> Option<u32> {
        self.regular
            .checked_add(self.luxury)?
            .checked_add(self.handicap)
    }

    /// Categories whose count is above zero.
    pub const fn nonzero(&self) -> SpotCategorySet {
        SpotCategorySet {
            regular: self.regular > 0,
            luxury: self.luxury > 0,
            handicap: self.handicap > 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Participant records
// ---------------------------------------------------------------------------

/// A car looking for a spot. Immutable once generated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarRecord {
    /// Unique car identifier.
    pub id: CarId,
    /// Human-readable name used in logs (`car-0`, `car-1`, ...).
    pub name: String,
    /// Where the car is.
    pub position: Position,
    /// Highest hourly cost the car tolerates.
    pub max_hourly_cost: u32,
    /// Farthest distance the car tolerates.
    pub max_distance: u32,
    /// How many simulated hours the car will occupy a spot.
    pub hours_needed: u32,
    /// Categories the car is willing to park in.
    pub desired: SpotCategorySet,
    /// Rule the car uses to score offers.
    pub policy: EvaluationPolicyKind,
}

/// A parking lot and its starting capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotRecord {
    /// Unique lot identifier.
    pub id: LotId,
    /// Human-readable name used in logs (`lot-0`, `lot-1`, ...).
    pub name: String,
    /// Where the lot is.
    pub position: Position,
    /// Hourly cost of a regular or handicap spot.
    pub hourly_cost: u32,
    /// Percent of `hourly_cost` charged for a luxury spot.
    pub luxury_cost_percent: u32,
    /// Categories the lot supports.
    pub supported: SpotCategorySet,
    /// Starting number of spots per category.
    pub capacity: SpotCounts,
}

// ---------------------------------------------------------------------------
// Protocol payloads
// ---------------------------------------------------------------------------

/// The call for proposals a car broadcasts to every lot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpotRequest {
    /// Requesting car.
    pub car_id: CarId,
    /// Requesting car's display name.
    pub car_name: String,
    /// Where the car is.
    pub position: Position,
    /// Highest hourly cost the car tolerates.
    pub max_hourly_cost: u32,
    /// Farthest distance the car tolerates.
    pub max_distance: u32,
    /// Simulated hours the car needs.
    pub hours_needed: u32,
    /// Categories the car asks for.
    pub desired: SpotCategorySet,
}

impl From<&CarRecord> for SpotRequest {
    fn from(car: &CarRecord) -> Self {
        Self {
            car_id: car.id,
            car_name: car.name.clone(),
            position: car.position,
            max_hourly_cost: car.max_hourly_cost,
            max_distance: car.max_distance,
            hours_needed: car.hours_needed,
            desired: car.desired,
        }
    }
}

/// A lot's non-binding answer to a [`SpotRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    /// Offering lot.
    pub lot_id: LotId,
    /// Offering lot's display name.
    pub lot_name: String,
    /// Where the lot is.
    pub position: Position,
    /// Hourly cost of a regular or handicap spot.
    pub hourly_cost: u32,
    /// Percent of `hourly_cost` charged for a luxury spot.
    pub luxury_cost_percent: u32,
    /// Categories with at least one free spot when the offer was built.
    pub available: SpotCategorySet,
}

impl Offer {
    /// Hourly cost of a luxury spot, rounded half-up.
    ///
    /// `round(hourly_cost * luxury_cost_percent / 100)` in exact integer
    /// arithmetic. Saturates at `u32::MAX`.
    pub fn luxury_cost(&self) -> u32 {
        let scaled = u64::from(self.hourly_cost)
            .saturating_mul(u64::from(self.luxury_cost_percent))
            .saturating_add(50)
            / 100;
        u32::try_from(scaled).unwrap_or(u32::MAX)
    }

    /// Hourly cost of a spot in `category`.
    pub fn cost_of(&self, category: SpotCategory) -> u32 {
        match category {
            SpotCategory::Regular | SpotCategory::Handicap => self.hourly_cost,
            SpotCategory::Luxury => self.luxury_cost(),
        }
    }
}

/// How a lot answered a [`SpotRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LotReply {
    /// The lot has a free spot in a requested category.
    Propose(Offer),
    /// None of the requested categories has a free spot.
    Refuse {
        /// Refusing lot.
        lot_id: LotId,
        /// Refusing lot's display name.
        lot_name: String,
    },
}

impl LotReply {
    /// The lot that sent this reply.
    pub const fn lot_id(&self) -> LotId {
        match self {
            Self::Propose(offer) => offer.lot_id,
            Self::Refuse { lot_id, .. } => *lot_id,
        }
    }
}

/// A spot granted to a car, from acceptance until release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    /// Parked car.
    pub car_id: CarId,
    /// Lot holding the car.
    pub lot_id: LotId,
    /// Category of the occupied spot.
    pub category: SpotCategory,
    /// Simulated hours the spot stays occupied.
    pub hours: u32,
    /// Wall-clock time the spot was granted.
    pub granted_at: DateTime<Utc>,
}
