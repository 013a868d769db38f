//! One car's negotiation round.
//!
//! A [`CarNegotiator`] waits for its turn in the [`NegotiationQueue`],
//! broadcasts a call for proposals to every lot, collects replies until the
//! reply deadline, scores them, accepts the best and rejects the rest, and
//! finally advances the queue exactly once.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use spotnet_lots::{Confirmation, LotHandle, ResponderError};
use spotnet_types::{
    CarRecord, LotId, LotReply, MarketEvent, MarketObserver, Offer, RoundState, SpotCategory,
    SpotRequest,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SimulationConfig;
use crate::error::NegotiationError;
use crate::policy::{DEFAULT_FLEXIBLE_MARGIN, EvaluationPolicy};
use crate::queue::NegotiationQueue;
use crate::report::{ConfirmationStatus, OfferAssessment, RoundOutcome, RoundReport};

/// Protocol timing and scoring parameters shared by every car.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NegotiationSettings {
    /// How long to collect replies after broadcasting.
    pub reply_timeout: Duration,
    /// How long to wait for the winning lot's confirmation.
    pub confirmation_timeout: Duration,
    /// Overhead tolerance of the flexible policy.
    pub flexible_margin: f64,
}

impl NegotiationSettings {
    /// Settings taken from a loaded configuration.
    pub const fn from_config(config: &SimulationConfig) -> Self {
        Self {
            reply_timeout: config.protocol.reply_timeout(),
            confirmation_timeout: config.protocol.confirmation_timeout(),
            flexible_margin: config.evaluation.flexible_margin,
        }
    }
}

impl Default for NegotiationSettings {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(10),
            confirmation_timeout: Duration::from_secs(10),
            flexible_margin: DEFAULT_FLEXIBLE_MARGIN,
        }
    }
}

/// Replies gathered during the collecting phase.
struct Collected {
    /// Replies in arrival order.
    replies: Vec<LotReply>,
    /// Lots that never answered.
    silent: Vec<String>,
}

/// Replies after scoring.
struct Scored {
    /// Every proposal with its assessment, in arrival order.
    offers: Vec<(Offer, OfferAssessment)>,
    /// Lots that declined to propose.
    refused: Vec<String>,
    /// The lowest-scoring acceptable offer.
    winner: Option<Winner>,
}

/// The offer a car settles on.
#[derive(Debug, Clone, Copy)]
struct Winner {
    lot_id: LotId,
    category: SpotCategory,
    score: u32,
    distance: u32,
    cost: u32,
}

/// Drives one car through its round.
pub struct CarNegotiator {
    car: CarRecord,
    policy: EvaluationPolicy,
    lots: Arc<[LotHandle]>,
    queue: Arc<NegotiationQueue>,
    observer: Arc<dyn MarketObserver>,
    settings: NegotiationSettings,
    state: RoundState,
}

impl CarNegotiator {
    /// Prepare a round for `car`. The car must already be enqueued.
    pub fn new(
        car: CarRecord,
        lots: Arc<[LotHandle]>,
        queue: Arc<NegotiationQueue>,
        observer: Arc<dyn MarketObserver>,
        settings: NegotiationSettings,
    ) -> Self {
        let policy = EvaluationPolicy::from_kind(car.policy, settings.flexible_margin);
        Self {
            car,
            policy,
            lots,
            queue,
            observer,
            settings,
            state: RoundState::Queued,
        }
    }

    /// Wait for the car's turn, negotiate, and advance the queue.
    ///
    /// The queue is advanced even when the round fails, so a fatal error
    /// in one round never strands the cars behind it.
    pub async fn run(mut self) -> Result<RoundReport, NegotiationError> {
        self.queue.wait_for_turn(self.car.id).await?;
        info!(car = %self.car.name, policy = %self.policy.kind(), "Round started");
        self.observer.on_event(&MarketEvent::RoundStarted {
            car_id: self.car.id,
        });

        let closed = self
            .negotiate()
            .await
            .and_then(|report| self.close(report));

        let advanced = self.queue.advance(self.car.id).await;
        let report = closed?;
        advanced?;
        Ok(report)
    }

    fn close(&mut self, report: RoundReport) -> Result<RoundReport, NegotiationError> {
        self.transition(RoundState::Closed)?;
        let accepted = report.is_accepted();
        info!(car = %self.car.name, accepted, "Round closed");
        self.observer.on_event(&MarketEvent::RoundClosed {
            car_id: self.car.id,
            accepted,
        });
        Ok(report)
    }

    fn transition(&mut self, next: RoundState) -> Result<(), NegotiationError> {
        if !self.state.can_transition_to(next) {
            return Err(NegotiationError::IllegalTransition {
                car_id: self.car.id,
                from: self.state,
                to: next,
            });
        }
        debug!(car = %self.car.name, from = ?self.state, to = ?next, "Round transition");
        self.state = next;
        Ok(())
    }

    async fn negotiate(&mut self) -> Result<RoundReport, NegotiationError> {
        // --- Broadcasting ---
        self.transition(RoundState::Broadcasting)?;
        let (reply_to, replies) = mpsc::channel(self.lots.len().max(1));
        let addressed = self.broadcast(&reply_to).await;
        drop(reply_to);

        // --- Collecting ---
        self.transition(RoundState::Collecting)?;
        let Collected { replies, silent } = self.collect(replies, addressed).await;

        // --- Evaluating ---
        self.transition(RoundState::Evaluating)?;
        let Scored {
            offers,
            refused,
            winner,
        } = self.score(replies);

        // Every proposer except the winner gets a rejection.
        let losers: Vec<LotId> = offers
            .iter()
            .map(|(offer, _)| offer.lot_id)
            .filter(|&lot_id| winner.is_none_or(|won| won.lot_id != lot_id))
            .collect();
        self.reject_all(&losers).await;

        let outcome = if let Some(winner) = winner {
            self.accept_winner(winner).await?
        } else {
            self.transition(RoundState::AllRejected)?;
            info!(
                car = %self.car.name,
                offers = offers.len(),
                refused = refused.len(),
                silent = silent.len(),
                "No acceptable offer"
            );
            self.observer.on_event(&MarketEvent::AllRejected {
                car_id: self.car.id,
                offers: offers.len(),
            });
            RoundOutcome::AllRejected
        };

        Ok(RoundReport {
            car_id: self.car.id,
            car_name: self.car.name.clone(),
            policy: self.car.policy,
            outcome,
            offers: offers.into_iter().map(|(_, assessment)| assessment).collect(),
            refused,
            silent,
        })
    }

    /// Score every reply in arrival order and pick the lowest score.
    fn score(&self, replies: Vec<LotReply>) -> Scored {
        let mut offers: Vec<(Offer, OfferAssessment)> = Vec::new();
        let mut refused = Vec::new();
        let mut best: Option<(usize, u32)> = None;

        for reply in replies {
            match reply {
                LotReply::Propose(offer) => {
                    self.observer.on_event(&MarketEvent::OfferReceived {
                        car_id: self.car.id,
                        offer: offer.clone(),
                    });
                    let evaluation = self.policy.evaluate(&self.car, &offer);
                    let score = evaluation.score();
                    if let Some(reason) = evaluation.rejection() {
                        info!(
                            car = %self.car.name,
                            lot = %offer.lot_name,
                            reason = %reason,
                            "Rejecting offer"
                        );
                        self.observer.on_event(&MarketEvent::OfferRejected {
                            car_id: self.car.id,
                            lot_id: offer.lot_id,
                            reason,
                        });
                    } else {
                        debug!(car = %self.car.name, lot = %offer.lot_name, score, "Offer scored");
                        self.observer.on_event(&MarketEvent::OfferScored {
                            car_id: self.car.id,
                            lot_id: offer.lot_id,
                            score,
                        });
                        // Strictly lower wins, so ties keep the earlier arrival.
                        if best.is_none_or(|(_, best_score)| score < best_score) {
                            best = Some((offers.len(), score));
                        }
                    }
                    let assessment = OfferAssessment {
                        lot_id: offer.lot_id,
                        lot_name: offer.lot_name.clone(),
                        evaluation,
                    };
                    offers.push((offer, assessment));
                }
                LotReply::Refuse { lot_id, lot_name } => {
                    info!(car = %self.car.name, lot = %lot_name, "Lot refused to propose");
                    self.observer.on_event(&MarketEvent::LotRefused {
                        car_id: self.car.id,
                        lot_id,
                    });
                    refused.push(lot_name);
                }
            }
        }

        let winner = best.and_then(|(index, score)| {
            let (offer, assessment) = offers.get(index)?;
            Some(Winner {
                lot_id: offer.lot_id,
                category: assessment.evaluation.category?,
                score,
                distance: assessment.evaluation.distance,
                cost: assessment.evaluation.cost?,
            })
        });

        Scored {
            offers,
            refused,
            winner,
        }
    }

    async fn accept_winner(&mut self, winner: Winner) -> Result<RoundOutcome, NegotiationError> {
        self.transition(RoundState::Accepted)?;
        let lot_name = self.lot_name(winner.lot_id);
        info!(
            car = %self.car.name,
            lot = %lot_name,
            category = %winner.category,
            score = winner.score,
            "Accepting offer"
        );
        self.observer.on_event(&MarketEvent::ProposalAccepted {
            car_id: self.car.id,
            lot_id: winner.lot_id,
            category: winner.category,
            score: winner.score,
        });
        let confirmation = self.accept(winner.lot_id, winner.category).await?;
        Ok(RoundOutcome::Accepted {
            lot_id: winner.lot_id,
            lot_name,
            category: winner.category,
            score: winner.score,
            distance: winner.distance,
            cost: winner.cost,
            confirmation,
        })
    }

    /// Send the call for proposals to every lot at once.
    ///
    /// Returns the lots that received it. A lot whose mailbox is closed is
    /// treated like a silent lot.
    async fn broadcast(&self, reply_to: &mpsc::Sender<LotReply>) -> BTreeMap<LotId, String> {
        let request = SpotRequest::from(&self.car);
        let sends = self.lots.iter().map(|lot| {
            let request = request.clone();
            let reply_to = reply_to.clone();
            async move { (lot, lot.call_for_proposals(request, reply_to).await) }
        });

        let mut addressed = BTreeMap::new();
        for (lot, sent) in join_all(sends).await {
            match sent {
                Ok(()) => {
                    addressed.insert(lot.lot_id(), String::from(lot.name()));
                }
                Err(e) => warn!(car = %self.car.name, lot = %lot.name(), error = %e, "Broadcast failed"),
            }
        }

        info!(
            car = %self.car.name,
            lots = addressed.len(),
            desired = %self.car.desired,
            "Call for proposals sent"
        );
        self.observer.on_event(&MarketEvent::RequestBroadcast {
            car_id: self.car.id,
            lot_count: addressed.len(),
        });
        addressed
    }

    /// Gather replies until every addressed lot answered or the deadline
    /// passed.
    async fn collect(
        &self,
        mut replies: mpsc::Receiver<LotReply>,
        mut pending: BTreeMap<LotId, String>,
    ) -> Collected {
        let mut collected = Vec::with_capacity(pending.len());
        let deadline = Instant::now()
            .checked_add(self.settings.reply_timeout)
            .unwrap_or_else(Instant::now);

        while !pending.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, replies.recv()).await {
                Ok(Some(reply)) => {
                    if pending.remove(&reply.lot_id()).is_some() {
                        collected.push(reply);
                    } else {
                        debug!(
                            car = %self.car.name,
                            lot_id = %reply.lot_id(),
                            "Ignoring reply from a lot that already answered"
                        );
                    }
                }
                // Deadline hit, or every lot dropped its reply handle.
                Ok(None) | Err(_) => break,
            }
        }

        let mut silent = Vec::with_capacity(pending.len());
        for (lot_id, lot_name) in pending {
            warn!(car = %self.car.name, lot = %lot_name, "Lot did not reply before the deadline");
            self.observer.on_event(&MarketEvent::LotSilent {
                car_id: self.car.id,
                lot_id,
            });
            silent.push(lot_name);
        }

        Collected {
            replies: collected,
            silent,
        }
    }

    async fn reject_all(&self, lot_ids: &[LotId]) {
        let rejections = self
            .lots
            .iter()
            .filter(|lot| lot_ids.contains(&lot.lot_id()))
            .map(|lot| async move { (lot, lot.reject(self.car.id).await) });
        for (lot, sent) in join_all(rejections).await {
            if let Err(e) = sent {
                warn!(car = %self.car.name, lot = %lot.name(), error = %e, "Rejection not delivered");
            }
        }
    }

    /// Send the acceptance and wait for the confirmation.
    async fn accept(
        &self,
        lot_id: LotId,
        category: SpotCategory,
    ) -> Result<ConfirmationStatus, NegotiationError> {
        let Some(lot) = self.lots.iter().find(|lot| lot.lot_id() == lot_id) else {
            return Ok(ConfirmationStatus::Lost);
        };

        let confirmation: oneshot::Receiver<Confirmation> =
            match lot.accept(self.car.id, category, self.car.hours_needed).await {
                Ok(receiver) => receiver,
                Err(e) => {
                    warn!(car = %self.car.name, lot = %lot.name(), error = %e, "Acceptance not delivered");
                    return Ok(ConfirmationStatus::Lost);
                }
            };

        match tokio::time::timeout(self.settings.confirmation_timeout, confirmation).await {
            Ok(Ok(Ok(allocation))) => {
                info!(
                    car = %self.car.name,
                    lot = %lot.name(),
                    category = %allocation.category,
                    hours = allocation.hours,
                    "Spot confirmed"
                );
                Ok(ConfirmationStatus::Confirmed { allocation })
            }
            Ok(Ok(Err(e))) => refused(lot, e),
            Ok(Err(_dropped)) => {
                warn!(car = %self.car.name, lot = %lot.name(), "Lot dropped the confirmation");
                Ok(ConfirmationStatus::Lost)
            }
            Err(_elapsed) => {
                warn!(car = %self.car.name, lot = %lot.name(), "Confirmation timed out");
                Ok(ConfirmationStatus::TimedOut)
            }
        }
    }

    fn lot_name(&self, lot_id: LotId) -> String {
        self.lots
            .iter()
            .find(|lot| lot.lot_id() == lot_id)
            .map_or_else(|| lot_id.to_string(), |lot| String::from(lot.name()))
    }
}

fn refused(lot: &LotHandle, error: ResponderError) -> Result<ConfirmationStatus, NegotiationError> {
    if error.is_fatal() {
        return Err(NegotiationError::Lot {
            lot_id: lot.lot_id(),
            source: error,
        });
    }
    warn!(lot = %lot.name(), error = %error, "Acceptance refused");
    Ok(ConfirmationStatus::Refused {
        reason: error.to_string(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use spotnet_lots::{
        DEFAULT_RELEASE_WORKERS, LotResponder, ReleaseScheduler, ResponderSettings, SpawnedLot,
    };
    use spotnet_types::{
        CarId, EvaluationPolicyKind, LotRecord, NoOpObserver, Position, RecordingObserver,
        SpotCategorySet, SpotCounts,
    };

    use super::*;

    fn car(name: &str, policy: EvaluationPolicyKind, desired: &[SpotCategory]) -> CarRecord {
        CarRecord {
            id: CarId::new(),
            name: String::from(name),
            position: Position::new(0, 0),
            max_hourly_cost: 10,
            max_distance: 10,
            hours_needed: 2,
            desired: SpotCategorySet::of(desired),
            policy,
        }
    }

    fn lot(name: &str, at: Position, hourly_cost: u32, capacity: SpotCounts) -> LotRecord {
        LotRecord {
            id: LotId::new(),
            name: String::from(name),
            position: at,
            hourly_cost,
            luxury_cost_percent: 150,
            supported: SpotCategorySet::ALL,
            capacity,
        }
    }

    fn spawn(records: &[LotRecord], scheduler: &ReleaseScheduler) -> Vec<SpawnedLot> {
        records
            .iter()
            .map(|record| {
                LotResponder::new(
                    record.clone(),
                    scheduler.handle(),
                    Arc::new(NoOpObserver),
                    ResponderSettings::default(),
                )
                .spawn()
            })
            .collect()
    }

    async fn negotiate_once(
        car: CarRecord,
        lots: &[SpawnedLot],
        observer: Arc<dyn MarketObserver>,
    ) -> (RoundReport, Arc<NegotiationQueue>) {
        let queue = Arc::new(NegotiationQueue::new());
        queue.enqueue(car.id).await.unwrap();
        let handles: Arc<[LotHandle]> = lots.iter().map(|l| l.handle.clone()).collect();
        let report = CarNegotiator::new(
            car,
            handles,
            Arc::clone(&queue),
            observer,
            NegotiationSettings::default(),
        )
        .run()
        .await
        .unwrap();
        (report, queue)
    }

    #[tokio::test(start_paused = true)]
    async fn lowest_score_wins_and_queue_advances_once() {
        let scheduler = ReleaseScheduler::start(DEFAULT_RELEASE_WORKERS, Arc::new(NoOpObserver));
        let records = [
            lot("far", Position::new(0, 9), 5, SpotCounts::new(1, 0, 0)),
            lot("near", Position::new(0, 3), 5, SpotCounts::new(1, 0, 0)),
        ];
        let lots = spawn(&records, &scheduler);
        let c = car("car-0", EvaluationPolicyKind::LowerDistance, &[SpotCategory::Regular]);

        let (report, queue) = negotiate_once(c, &lots, Arc::new(NoOpObserver)).await;

        assert!(report.is_accepted());
        let RoundOutcome::Accepted { lot_name, score, .. } = &report.outcome else {
            return;
        };
        assert_eq!(lot_name, "near");
        assert_eq!(*score, 3);
        assert!(report.allocation().is_some());
        assert_eq!(queue.advances(), 1);
        assert_eq!(lots.get(1).unwrap().inventory.lock().await.available().regular, 0);
        assert_eq!(lots.first().unwrap().inventory.lock().await.available().regular, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ties_keep_the_first_arrival() {
        let scheduler = ReleaseScheduler::start(DEFAULT_RELEASE_WORKERS, Arc::new(NoOpObserver));
        let records = [
            lot("first", Position::new(3, 4), 5, SpotCounts::new(1, 0, 0)),
            lot("second", Position::new(4, 3), 5, SpotCounts::new(1, 0, 0)),
        ];
        let lots = spawn(&records, &scheduler);
        let c = car("car-0", EvaluationPolicyKind::Strict, &[SpotCategory::Regular]);

        let (report, _) = negotiate_once(c, &lots, Arc::new(NoOpObserver)).await;

        // Both score 10; the offer that arrived first wins.
        let first_arrival = report.offers.first().map(|o| o.lot_name.clone()).unwrap();
        assert!(report.is_accepted());
        let RoundOutcome::Accepted { lot_name, .. } = &report.outcome else {
            return;
        };
        assert_eq!(lot_name, &first_arrival);
        assert_eq!(report.offers.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn all_rejected_still_advances_and_rejects_every_proposer() {
        let scheduler = ReleaseScheduler::start(DEFAULT_RELEASE_WORKERS, Arc::new(NoOpObserver));
        let records = [lot("pricey", Position::new(0, 1), 50, SpotCounts::new(1, 0, 0))];
        let lots = spawn(&records, &scheduler);
        let recorder = Arc::new(RecordingObserver::new());
        let c = car("car-0", EvaluationPolicyKind::Strict, &[SpotCategory::Regular]);

        let (report, queue) = negotiate_once(c, &lots, recorder.clone()).await;

        assert_eq!(report.outcome, RoundOutcome::AllRejected);
        assert_eq!(
            report.offers.first().and_then(|o| o.evaluation.rejection()),
            Some(spotnet_types::RejectionReason::Cost)
        );
        assert_eq!(queue.advances(), 1);
        assert_eq!(recorder.count(|e| matches!(e, MarketEvent::AllRejected { offers: 1, .. })), 1);
        assert_eq!(recorder.count(|e| matches!(e, MarketEvent::RoundClosed { accepted: false, .. })), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_lot_is_skipped_after_the_deadline() {
        let scheduler = ReleaseScheduler::start(DEFAULT_RELEASE_WORKERS, Arc::new(NoOpObserver));
        let records = [lot("live", Position::new(0, 2), 5, SpotCounts::new(1, 0, 0))];
        let lots = spawn(&records, &scheduler);
        let recorder = Arc::new(RecordingObserver::new());

        // A lot whose mailbox is never read.
        let mute = lot("mute", Position::new(0, 1), 1, SpotCounts::new(1, 0, 0));
        let (mute_handle, _mailbox) = LotHandle::channel(&mute);
        let c = car("car-0", EvaluationPolicyKind::Strict, &[SpotCategory::Regular]);
        let queue = Arc::new(NegotiationQueue::new());
        queue.enqueue(c.id).await.unwrap();
        let handles: Arc<[LotHandle]> = lots
            .iter()
            .map(|l| l.handle.clone())
            .chain(std::iter::once(mute_handle))
            .collect();

        let started = Instant::now();
        let report = CarNegotiator::new(
            c,
            handles,
            Arc::clone(&queue),
            recorder.clone(),
            NegotiationSettings::default(),
        )
        .run()
        .await
        .unwrap();

        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(report.is_accepted());
        assert_eq!(report.silent, vec![String::from("mute")]);
        assert_eq!(recorder.count(|e| matches!(e, MarketEvent::LotSilent { .. })), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn no_lots_at_all_is_all_rejected() {
        let c = car("car-0", EvaluationPolicyKind::Flexible, &[SpotCategory::Regular]);
        let (report, queue) = negotiate_once(c, &[], Arc::new(NoOpObserver)).await;
        assert_eq!(report.outcome, RoundOutcome::AllRejected);
        assert_eq!(queue.advances(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn acceptance_names_category_by_priority() {
        let scheduler = ReleaseScheduler::start(DEFAULT_RELEASE_WORKERS, Arc::new(NoOpObserver));
        let records = [lot("all", Position::new(0, 1), 5, SpotCounts::new(0, 1, 1))];
        let lots = spawn(&records, &scheduler);
        let c = car("car-0", EvaluationPolicyKind::LowerCost, &SpotCategory::ALL);

        let (report, _) = negotiate_once(c, &lots, Arc::new(NoOpObserver)).await;

        // Regular is full, so Handicap beats Luxury.
        assert_eq!(
            report.allocation().map(|a| a.category),
            Some(SpotCategory::Handicap)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_acceptance_still_closes_the_round() {
        let record = lot("mute", Position::new(0, 1), 5, SpotCounts::new(1, 0, 0));
        let (handle, mut mailbox) = LotHandle::channel(&record);
        let c = car("car-0", EvaluationPolicyKind::Strict, &[SpotCategory::Regular]);
        let car_id = c.id;

        // Answer the call for proposals by hand, then sit on the acceptance.
        let offered = record;
        let responder = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Some(message) = mailbox.recv().await {
                if let spotnet_lots::LotMessage::CallForProposals { request, reply_to } = message {
                    let offer = Offer {
                        lot_id: offered.id,
                        lot_name: offered.name.clone(),
                        position: offered.position,
                        hourly_cost: offered.hourly_cost,
                        luxury_cost_percent: offered.luxury_cost_percent,
                        available: SpotCategorySet::of(&[SpotCategory::Regular]),
                    };
                    assert_eq!(request.car_id, car_id);
                    reply_to.send(LotReply::Propose(offer)).await.unwrap();
                } else {
                    held.push(message);
                }
            }
            held.len()
        });

        let queue = Arc::new(NegotiationQueue::new());
        queue.enqueue(car_id).await.unwrap();
        let handles: Arc<[LotHandle]> = Arc::from(vec![handle]);
        let report = CarNegotiator::new(
            c,
            handles,
            Arc::clone(&queue),
            Arc::new(NoOpObserver),
            NegotiationSettings::default(),
        )
        .run()
        .await
        .unwrap();

        assert!(report.is_accepted());
        let RoundOutcome::Accepted { confirmation, .. } = &report.outcome else {
            return;
        };
        assert_eq!(confirmation, &ConfirmationStatus::TimedOut);
        assert_eq!(queue.advances(), 1);
        responder.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn release_during_a_later_round_frees_the_spot_for_the_next_car() {
        let recorder = Arc::new(RecordingObserver::new());
        let scheduler = ReleaseScheduler::start(DEFAULT_RELEASE_WORKERS, recorder.clone());
        let record = lot("single", Position::new(0, 1), 5, SpotCounts::new(1, 0, 0));
        let single = LotResponder::new(
            record.clone(),
            scheduler.handle(),
            recorder.clone(),
            ResponderSettings::default(),
        )
        .spawn();
        let mute = lot("mute", Position::new(0, 2), 1, SpotCounts::new(1, 0, 0));
        let (mute_handle, _mailbox) = LotHandle::channel(&mute);

        // One simulated hour is five seconds, so the first car leaves while
        // the second is still waiting on the mute lot.
        let mut first = car("car-0", EvaluationPolicyKind::Strict, &[SpotCategory::Regular]);
        first.hours_needed = 1;
        let slow = car("car-1", EvaluationPolicyKind::Strict, &[SpotCategory::Regular]);
        let last = car("car-2", EvaluationPolicyKind::Strict, &[SpotCategory::Regular]);
        let (first_id, slow_id, last_id) = (first.id, slow.id, last.id);

        let queue = Arc::new(NegotiationQueue::new());
        for id in [first_id, slow_id, last_id] {
            queue.enqueue(id).await.unwrap();
        }
        let direct: Arc<[LotHandle]> = Arc::from(vec![single.handle.clone()]);
        let with_mute: Arc<[LotHandle]> = Arc::from(vec![single.handle.clone(), mute_handle]);
        let round = |record: CarRecord, lots: Arc<[LotHandle]>| {
            tokio::spawn(
                CarNegotiator::new(
                    record,
                    lots,
                    Arc::clone(&queue),
                    recorder.clone(),
                    NegotiationSettings::default(),
                )
                .run(),
            )
        };
        let tasks = [
            round(first, Arc::clone(&direct)),
            round(slow, with_mute),
            round(last, direct),
        ];
        let mut reports = Vec::new();
        for task in tasks {
            reports.push(task.await.unwrap().unwrap());
        }

        let [first_report, slow_report, last_report] = reports.as_slice() else {
            return;
        };
        assert!(first_report.allocation().is_some());
        assert_eq!(slow_report.outcome, RoundOutcome::AllRejected);
        assert_eq!(slow_report.refused, vec![String::from("single")]);
        assert_eq!(slow_report.silent, vec![String::from("mute")]);
        assert_eq!(last_report.allocation().map(|a| a.lot_id), Some(record.id));

        // The release landed inside the second round and before the third
        // car was granted the same spot.
        let events = recorder.events();
        let at = |wanted: &dyn Fn(&MarketEvent) -> bool| events.iter().position(wanted).unwrap();
        let released = at(&|e| {
            matches!(e, MarketEvent::SpotReleased { allocation, .. } if allocation.car_id == first_id)
        });
        let slow_started = at(&|e| matches!(e, MarketEvent::RoundStarted { car_id } if *car_id == slow_id));
        let slow_closed =
            at(&|e| matches!(e, MarketEvent::RoundClosed { car_id, .. } if *car_id == slow_id));
        let last_allocated = at(&|e| {
            matches!(e, MarketEvent::SpotAllocated { allocation } if allocation.car_id == last_id)
        });
        assert!(slow_started < released);
        assert!(released < slow_closed);
        assert!(released < last_allocated);

        {
            let inventory = single.inventory.lock().await;
            assert!(inventory.verify_conservation().is_ok());
            assert_eq!(inventory.occupant_count(), 1);
            assert_eq!(inventory.available().regular, 0);
        }

        // The last car holds two hours; after that the lot is empty again.
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(single.inventory.lock().await.is_fully_vacant());
        assert_eq!(recorder.count(|e| matches!(e, MarketEvent::SpotReleased { .. })), 2);
        assert_eq!(queue.advances(), 3);
    }
}
