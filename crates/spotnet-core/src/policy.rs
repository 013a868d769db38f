//! Offer scoring.
//!
//! Every policy turns a car's bounds and a lot's [`Offer`] into a score
//! where lower is better and zero means the offer is rejected. The four
//! variants share the hourly-cost derivation in [`derive_cost`].

use serde::Serialize;
use spotnet_types::{
    CarRecord, EvaluationPolicyKind, Offer, RejectionReason, SpotCategory, SpotCategorySet,
};

/// Default overhead tolerance of the flexible policy.
pub const DEFAULT_FLEXIBLE_MARGIN: f64 = 0.3;

/// Slack added to the margin so an overhead equal to it in exact
/// arithmetic is not rejected by rounding (13 / 10 - 1 > 0.3 in f64).
const MARGIN_EPSILON: f64 = 1e-9;

/// Pick the category a car would park in and its hourly cost.
///
/// Categories are tried in the order Regular, Handicap, Luxury, keeping the
/// first the car desires and the offer advertises. Returns `None` when the
/// offer shares no category with the car.
pub fn derive_cost(desired: SpotCategorySet, offer: &Offer) -> Option<(SpotCategory, u32)> {
    SpotCategory::ACCEPTANCE_PRIORITY
        .into_iter()
        .find(|&category| desired.contains(category) && offer.available.contains(category))
        .map(|category| (category, offer.cost_of(category)))
}

/// Outcome of scoring one offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Verdict {
    /// The offer is acceptable with this score.
    Score {
        /// Score, always above zero.
        score: u32,
    },
    /// The offer scored zero.
    Rejected {
        /// Why the offer was rejected.
        reason: RejectionReason,
    },
}

/// Everything a policy worked out about one offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Evaluation {
    /// Truncated distance from car to lot.
    pub distance: u32,
    /// Category the car would park in, if any matches.
    pub category: Option<SpotCategory>,
    /// Hourly cost of that category.
    pub cost: Option<u32>,
    /// Score or rejection.
    pub verdict: Verdict,
}

impl Evaluation {
    /// The score, with zero standing for rejection.
    pub const fn score(&self) -> u32 {
        match self.verdict {
            Verdict::Score { score } => score,
            Verdict::Rejected { .. } => 0,
        }
    }

    /// Why the offer was rejected, if it was.
    pub const fn rejection(&self) -> Option<RejectionReason> {
        match self.verdict {
            Verdict::Score { .. } => None,
            Verdict::Rejected { reason } => Some(reason),
        }
    }
}

/// A car's scoring rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EvaluationPolicy {
    /// Reject when either bound is exceeded; score is distance plus cost.
    Strict,
    /// Reject when the cost bound is exceeded; score is cost.
    LowerCost,
    /// Reject when the distance bound is exceeded; score is distance.
    LowerDistance,
    /// Tolerate exceeding the bounds up to a combined relative overhead;
    /// score is distance plus cost.
    Flexible {
        /// Largest tolerated overhead.
        margin: f64,
    },
}

impl EvaluationPolicy {
    /// Build the policy for `kind`. `margin` only applies to the flexible
    /// policy.
    pub const fn from_kind(kind: EvaluationPolicyKind, margin: f64) -> Self {
        match kind {
            EvaluationPolicyKind::Strict => Self::Strict,
            EvaluationPolicyKind::LowerCost => Self::LowerCost,
            EvaluationPolicyKind::LowerDistance => Self::LowerDistance,
            EvaluationPolicyKind::Flexible => Self::Flexible { margin },
        }
    }

    /// The kind of this policy.
    pub const fn kind(&self) -> EvaluationPolicyKind {
        match self {
            Self::Strict => EvaluationPolicyKind::Strict,
            Self::LowerCost => EvaluationPolicyKind::LowerCost,
            Self::LowerDistance => EvaluationPolicyKind::LowerDistance,
            Self::Flexible { .. } => EvaluationPolicyKind::Flexible,
        }
    }

    /// Score `offer` for `car`; zero means rejected.
    pub fn score(&self, car: &CarRecord, offer: &Offer) -> u32 {
        self.evaluate(car, offer).score()
    }

    /// Score `offer` for `car` and keep the intermediate values.
    pub fn evaluate(&self, car: &CarRecord, offer: &Offer) -> Evaluation {
        let distance = car.position.distance_to(offer.position);
        let derived = derive_cost(car.desired, offer);
        let category = derived.map(|(category, _)| category);
        let cost = derived.map(|(_, cost)| cost);

        let verdict = match self {
            Self::Strict => {
                if distance > car.max_distance {
                    Err(RejectionReason::Distance)
                } else {
                    cost.ok_or(RejectionReason::NoMatchingCategory)
                        .and_then(|cost| {
                            if cost > car.max_hourly_cost {
                                Err(RejectionReason::Cost)
                            } else {
                                Ok(distance.saturating_add(cost))
                            }
                        })
                }
            }
            Self::LowerCost => cost
                .ok_or(RejectionReason::NoMatchingCategory)
                .and_then(|cost| {
                    if cost > car.max_hourly_cost {
                        Err(RejectionReason::Cost)
                    } else {
                        Ok(cost)
                    }
                }),
            Self::LowerDistance => {
                if distance > car.max_distance {
                    Err(RejectionReason::Distance)
                } else if category.is_none() {
                    Err(RejectionReason::NoMatchingCategory)
                } else {
                    Ok(distance)
                }
            }
            Self::Flexible { margin } => flexible(*margin, car, distance, cost),
        };

        let verdict = match verdict {
            Ok(0) => Verdict::Rejected {
                reason: RejectionReason::ZeroScore,
            },
            Ok(score) => Verdict::Score { score },
            Err(reason) => Verdict::Rejected { reason },
        };

        Evaluation {
            distance,
            category,
            cost,
            verdict,
        }
    }
}

/// Relative amount by which `actual` exceeds `bound`, or zero.
///
/// A zero bound that is exceeded gives an infinite overhead.
fn overhead(actual: u32, bound: u32) -> f64 {
    if actual <= bound {
        return 0.0;
    }
    if bound == 0 {
        return f64::INFINITY;
    }
    f64::from(actual) / f64::from(bound) - 1.0
}

fn flexible(
    margin: f64,
    car: &CarRecord,
    distance: u32,
    cost: Option<u32>,
) -> Result<u32, RejectionReason> {
    let limit = margin + MARGIN_EPSILON;
    // Distance alone is checked first so the rejection names the right cause.
    let mut total = overhead(distance, car.max_distance);
    if total > limit {
        return Err(RejectionReason::Distance);
    }

    let cost = cost.ok_or(RejectionReason::NoMatchingCategory)?;
    total += overhead(cost, car.max_hourly_cost);
    if total > limit {
        return Err(RejectionReason::DistanceCostOverhead);
    }

    Ok(distance.saturating_add(cost))
}
