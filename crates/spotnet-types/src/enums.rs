//! Enumeration types for the spotnet parking market.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Spot categories
// ---------------------------------------------------------------------------

/// The kind of parking spot a lot offers and a car may ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpotCategory {
    /// A standard spot billed at the lot's hourly cost.
    Regular,
    /// A premium spot billed at the hourly cost scaled by the luxury percent.
    Luxury,
    /// An accessible spot billed at the lot's hourly cost.
    Handicap,
}

impl SpotCategory {
    /// All categories in declaration order (Regular, Luxury, Handicap).
    ///
    /// This is also the order in which capacity rounding excess is trimmed.
    pub const ALL: [Self; 3] = [Self::Regular, Self::Luxury, Self::Handicap];

    /// Order in which a car picks the category to accept from a winning
    /// offer, and in which the hourly cost of an offer is derived.
    pub const ACCEPTANCE_PRIORITY: [Self; 3] = [Self::Regular, Self::Handicap, Self::Luxury];

    /// Lowercase display name used in logs and reports.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Regular => "regular",
            Self::Luxury => "luxury",
            Self::Handicap => "handicap",
        }
    }
}

impl core::fmt::Display for SpotCategory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Evaluation policies
// ---------------------------------------------------------------------------

/// Which scoring rule a car applies to lot offers.
///
/// The aliases accept the upper-case names used by older fixture files
/// (`STRICT`, `LOWERCOST`, `LOWERDIST`, `FLEXIBLE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationPolicyKind {
    /// Both distance and cost must be within bounds.
    #[serde(alias = "STRICT")]
    Strict,
    /// Only cost matters; distance is ignored.
    #[serde(alias = "LOWERCOST")]
    LowerCost,
    /// Only distance matters; cost is ignored.
    #[serde(alias = "LOWERDIST", alias = "LOWERDISTANCE")]
    LowerDistance,
    /// Bounds may be exceeded up to a combined overhead margin.
    #[serde(alias = "FLEXIBLE")]
    Flexible,
}

impl EvaluationPolicyKind {
    /// All policy kinds, in the index order used by random generation.
    pub const ALL: [Self; 4] = [
        Self::Strict,
        Self::LowerCost,
        Self::LowerDistance,
        Self::Flexible,
    ];
}

impl core::fmt::Display for EvaluationPolicyKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::Strict => "strict",
            Self::LowerCost => "lower_cost",
            Self::LowerDistance => "lower_distance",
            Self::Flexible => "flexible",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Offer rejection reasons
// ---------------------------------------------------------------------------

/// Why a car scored an offer as zero (automatic rejection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    /// The lot is farther away than the car tolerates.
    Distance,
    /// The derived hourly cost exceeds what the car tolerates.
    Cost,
    /// The combined distance and cost overhead went above the flexible margin.
    DistanceCostOverhead,
    /// The offer does not carry any category the car desires.
    NoMatchingCategory,
    /// Every bound held but the score came out as zero.
    ZeroScore,
}

impl core::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let text = match self {
            Self::Distance => "distance",
            Self::Cost => "cost",
            Self::DistanceCostOverhead => "distance+cost overhead",
            Self::NoMatchingCategory => "no matching category",
            Self::ZeroScore => "zero score",
        };
        f.write_str(text)
    }
}

// ---------------------------------------------------------------------------
// Negotiation round lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle of a single car's negotiation round.
///
/// ```text
/// Queued -> Broadcasting -> Collecting -> Evaluating -> Accepted    -> Closed
///                                                    \-> AllRejected -> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundState {
    /// Waiting in the negotiation queue.
    Queued,
    /// Sending the call for proposals to every lot.
    Broadcasting,
    /// Waiting for offers and refusals until the reply deadline.
    Collecting,
    /// Scoring the collected offers.
    Evaluating,
    /// An offer won and its lot is finalising the allocation.
    Accepted,
    /// No offer scored above zero.
    AllRejected,
    /// The round is over; advancing the queue comes next.
    Closed,
}

impl RoundState {
    /// Whether `next` is a legal successor of this state.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Broadcasting)
                | (Self::Broadcasting, Self::Collecting)
                | (Self::Collecting, Self::Evaluating)
                | (Self::Evaluating, Self::Accepted | Self::AllRejected)
                | (Self::Accepted | Self::AllRejected, Self::Closed)
        )
    }
}

// ---------------------------------------------------------------------------
// Stale acceptance handling
// ---------------------------------------------------------------------------

/// How a lot treats an acceptance naming a category it did not advertise
/// as available in the offer it sent to that car.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleAcceptance {
    /// Trust the car's choice and allocate anyway.
    #[default]
    Permissive,
    /// Refuse the acceptance and report a protocol violation.
    Strict,
}
