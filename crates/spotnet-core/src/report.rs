//! Per-round results and the end-of-run market report.

use serde::Serialize;
use spotnet_types::{Allocation, CarId, EvaluationPolicyKind, LotId, SpotCategory, SpotCounts};
use tracing::{info, warn};

use crate::policy::Evaluation;

/// How a car scored one offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OfferAssessment {
    /// The offering lot.
    pub lot_id: LotId,
    /// The offering lot's display name.
    pub lot_name: String,
    /// Distance, cost, and verdict.
    pub evaluation: Evaluation,
}

/// What happened after the car sent its acceptance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConfirmationStatus {
    /// The lot granted the spot.
    Confirmed {
        /// The granted spot.
        allocation: Allocation,
    },
    /// The lot refused the acceptance.
    Refused {
        /// The lot's explanation.
        reason: String,
    },
    /// The lot went away without answering.
    Lost,
    /// No confirmation arrived before the confirmation deadline.
    TimedOut,
}

/// The terminal outcome of a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RoundOutcome {
    /// The car accepted an offer.
    Accepted {
        /// The winning lot.
        lot_id: LotId,
        /// The winning lot's display name.
        lot_name: String,
        /// Category named in the acceptance.
        category: SpotCategory,
        /// Winning score.
        score: u32,
        /// Distance to the winning lot.
        distance: u32,
        /// Hourly cost of the accepted category.
        cost: u32,
        /// What the lot answered.
        confirmation: ConfirmationStatus,
    },
    /// No offer scored above zero, or no offer arrived.
    AllRejected,
}

/// Everything that happened in one car's round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoundReport {
    /// The negotiating car.
    pub car_id: CarId,
    /// The car's display name.
    pub car_name: String,
    /// The car's scoring rule.
    pub policy: EvaluationPolicyKind,
    /// Accepted or all-rejected.
    #[serde(flatten)]
    pub outcome: RoundOutcome,
    /// Every offer received, in arrival order.
    pub offers: Vec<OfferAssessment>,
    /// Lots that refused to propose.
    pub refused: Vec<String>,
    /// Lots that did not answer before the reply deadline.
    pub silent: Vec<String>,
}

impl RoundReport {
    /// Whether the round ended with an acceptance.
    pub const fn is_accepted(&self) -> bool {
        matches!(self.outcome, RoundOutcome::Accepted { .. })
    }

    /// The granted spot, when the lot confirmed.
    pub const fn allocation(&self) -> Option<&Allocation> {
        match &self.outcome {
            RoundOutcome::Accepted {
                confirmation: ConfirmationStatus::Confirmed { allocation },
                ..
            } => Some(allocation),
            _ => None,
        }
    }
}

/// Final state of one lot after every release has fired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LotAudit {
    /// The audited lot.
    pub lot_id: LotId,
    /// The lot's display name.
    pub lot_name: String,
    /// Starting spots.
    pub capacity: SpotCounts,
    /// Free spots at the end of the run.
    pub available: SpotCounts,
    /// Cars still parked at the end of the run.
    pub occupied: usize,
}

impl LotAudit {
    /// Whether every spot is free again.
    pub fn is_restored(&self) -> bool {
        self.occupied == 0 && self.capacity == self.available
    }
}

/// Summary of a whole market run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MarketReport {
    /// Rounds in queue order.
    pub rounds: Vec<RoundReport>,
    /// Rounds that ended with an acceptance.
    pub accepted: usize,
    /// Rounds that ended with every offer rejected.
    pub all_rejected: usize,
    /// Acceptances that did not end in a granted spot.
    pub unconfirmed: usize,
    /// Spots returned by the release scheduler.
    pub releases: usize,
    /// Times the negotiation queue advanced.
    pub queue_advances: u64,
    /// Per-lot final state.
    pub audit: Vec<LotAudit>,
    /// Wall-clock duration of the run in milliseconds.
    pub elapsed_ms: u64,
}

impl MarketReport {
    /// Tally `rounds` into a report.
    pub fn new(
        rounds: Vec<RoundReport>,
        releases: usize,
        queue_advances: u64,
        audit: Vec<LotAudit>,
        elapsed_ms: u64,
    ) -> Self {
        let accepted = rounds.iter().filter(|r| r.is_accepted()).count();
        let unconfirmed = rounds
            .iter()
            .filter(|r| r.is_accepted() && r.allocation().is_none())
            .count();
        let all_rejected = rounds.len().saturating_sub(accepted);
        Self {
            rounds,
            accepted,
            all_rejected,
            unconfirmed,
            releases,
            queue_advances,
            audit,
            elapsed_ms,
        }
    }

    /// Whether every lot ended with all of its spots free.
    pub fn is_balanced(&self) -> bool {
        self.audit.iter().all(LotAudit::is_restored)
    }

    /// Render the report as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Emit the report through `tracing`.
    pub fn log_summary(&self) {
        for round in &self.rounds {
            match &round.outcome {
                RoundOutcome::Accepted {
                    lot_name,
                    category,
                    score,
                    distance,
                    cost,
                    confirmation,
                    ..
                } => info!(
                    car = %round.car_name,
                    policy = %round.policy,
                    lot = %lot_name,
                    category = %category,
                    score,
                    distance,
                    cost,
                    confirmed = matches!(confirmation, ConfirmationStatus::Confirmed { .. }),
                    "Round accepted"
                ),
                RoundOutcome::AllRejected => {
                    let reasons: Vec<String> = round
                        .offers
                        .iter()
                        .filter_map(|o| {
                            o.evaluation
                                .rejection()
                                .map(|reason| format!("{}: {reason}", o.lot_name))
                        })
                        .collect();
                    info!(
                        car = %round.car_name,
                        policy = %round.policy,
                        offers = round.offers.len(),
                        refused = round.refused.len(),
                        silent = round.silent.len(),
                        reasons = %reasons.join(", "),
                        "Round rejected every offer"
                    );
                }
            }
        }

        for lot in &self.audit {
            if !lot.is_restored() {
                warn!(
                    lot = %lot.lot_name,
                    occupied = lot.occupied,
                    "Lot not fully restored at end of run"
                );
            }
        }

        info!(
            rounds = self.rounds.len(),
            accepted = self.accepted,
            all_rejected = self.all_rejected,
            unconfirmed = self.unconfirmed,
            releases = self.releases,
            queue_advances = self.queue_advances,
            balanced = self.is_balanced(),
            elapsed_ms = self.elapsed_ms,
            "Market run complete"
        );
    }
}
