//! The market runner.
//!
//! A [`Market`] is the one explicit context of a run. It spawns the release
//! scheduler and one responder per lot, admits every car to the negotiation
//! queue in record order, runs each car's round as its own task, and after
//! the last round tears everything down in dependency order: car tasks,
//! then lot responders, then the release scheduler. The inventories are
//! audited once every release has fired. A failed round closes the queue,
//! so no further round starts.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use spotnet_lots::{
    DEFAULT_RELEASE_WORKERS, LotHandle, LotResponder, ReleaseScheduler, ResponderSettings,
    SpawnedLot, SpotInventory,
};
use spotnet_types::{CarRecord, LotRecord, MarketObserver, NoOpObserver, Position};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, SimulationConfig, invalid};
use crate::error::{MarketError, NegotiationError, QueueError};
use crate::negotiator::{CarNegotiator, NegotiationSettings};
use crate::queue::NegotiationQueue;
use crate::report::{LotAudit, MarketReport, RoundReport};

/// Everything a run needs besides the records.
#[derive(Debug, Clone, Copy)]
pub struct MarketSettings {
    /// Car-side protocol timing and scoring.
    pub negotiation: NegotiationSettings,
    /// Lot-side behaviour.
    pub responder: ResponderSettings,
    /// Concurrent release limit.
    pub release_workers: usize,
}

impl MarketSettings {
    /// Settings taken from a loaded configuration.
    pub const fn from_config(config: &SimulationConfig) -> Self {
        Self {
            negotiation: NegotiationSettings::from_config(config),
            responder: ResponderSettings {
                stale_acceptance: config.protocol.stale_acceptance,
                hour: config.timing.hour(),
            },
            release_workers: config.timing.release_workers,
        }
    }
}

impl Default for MarketSettings {
    fn default() -> Self {
        Self {
            negotiation: NegotiationSettings::default(),
            responder: ResponderSettings::default(),
            release_workers: DEFAULT_RELEASE_WORKERS,
        }
    }
}

/// One market run.
pub struct Market {
    settings: MarketSettings,
    observer: Arc<dyn MarketObserver>,
}

impl Market {
    /// A market that reports events only through `tracing`.
    pub fn new(settings: MarketSettings) -> Self {
        Self {
            settings,
            observer: Arc::new(NoOpObserver),
        }
    }

    /// Deliver every protocol event to `observer` as well.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn MarketObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Negotiate every car in order and wait for every release.
    ///
    /// Records are validated before anything is spawned. The first failed
    /// round closes the queue: the round holding the turn at that moment
    /// still finishes, every car behind it is skipped, and the failure is
    /// returned after the market has been torn down.
    pub async fn run(
        &self,
        cars: Vec<CarRecord>,
        lots: Vec<LotRecord>,
    ) -> Result<MarketReport, MarketError> {
        validate_records(&cars, &lots)?;
        let started = Instant::now();

        info!(
            cars = cars.len(),
            lots = lots.len(),
            stale_acceptance = ?self.settings.responder.stale_acceptance,
            "Market opening"
        );

        // 1. Release scheduler and lot responders
        let scheduler =
            ReleaseScheduler::start(self.settings.release_workers, Arc::clone(&self.observer));
        let spawned: Vec<SpawnedLot> = lots
            .into_iter()
            .map(|record| {
                LotResponder::new(
                    record,
                    scheduler.handle(),
                    Arc::clone(&self.observer),
                    self.settings.responder,
                )
                .spawn()
            })
            .collect();

        // 2. Queue admission in record order
        let queue = Arc::new(NegotiationQueue::new());
        for car in &cars {
            queue.enqueue(car.id).await?;
        }
        debug!(queued = queue.len().await, "Cars admitted");

        // 3. One task per car; the queue serializes their rounds
        let handles: Arc<[LotHandle]> = spawned.iter().map(|lot| lot.handle.clone()).collect();
        let rounds: Vec<(String, RoundTask)> = cars
            .into_iter()
            .map(|car| {
                let name = car.name.clone();
                let negotiator = CarNegotiator::new(
                    car,
                    Arc::clone(&handles),
                    Arc::clone(&queue),
                    Arc::clone(&self.observer),
                    self.settings.negotiation,
                );
                (name, tokio::spawn(negotiator.run()))
            })
            .collect();
        drop(handles);

        let (reports, first_error) = settle_rounds(rounds, &queue).await;
        if !queue.is_empty().await {
            warn!(queued = queue.len().await, "Queue not drained after the last round");
        }

        // 4. Stop the lots, then let every pending release fire
        let inventories = stop_lots(spawned).await?;
        let releases = scheduler.drain().await?;

        if let Some(e) = first_error {
            return Err(e);
        }

        // 5. Audit
        let audit = audit_lots(inventories).await?;

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        Ok(MarketReport::new(
            reports,
            releases.count(),
            queue.advances(),
            audit,
            elapsed_ms,
        ))
    }
}

/// A spawned car round.
type RoundTask = JoinHandle<Result<RoundReport, NegotiationError>>;

/// Await every round in admission order.
///
/// The first failure closes the queue, so no round starts after it. Cars
/// turned away by the closed queue are skipped, not reported as failures.
async fn settle_rounds(
    rounds: Vec<(String, RoundTask)>,
    queue: &NegotiationQueue,
) -> (Vec<RoundReport>, Option<MarketError>) {
    let mut reports = Vec::with_capacity(rounds.len());
    let mut first_error: Option<MarketError> = None;

    for (name, task) in rounds {
        let failure = match task.await {
            Ok(Ok(report)) => {
                reports.push(report);
                continue;
            }
            Ok(Err(NegotiationError::Queue {
                source: QueueError::Closed { .. },
            })) => {
                info!(car = %name, "Round skipped after an earlier failure");
                continue;
            }
            Ok(Err(e)) => {
                error!(car = %name, error = %e, "Round failed");
                MarketError::from(e)
            }
            Err(e) => {
                error!(car = %name, error = %e, "Car task failed");
                MarketError::Task {
                    message: format!("car {name}: {e}"),
                }
            }
        };
        if first_error.is_none() {
            let turned_away = queue.close().await;
            warn!(turned_away, "Queue closed after a failed round");
            first_error = Some(failure);
        }
    }
    (reports, first_error)
}

/// Drop every lot handle and wait for the responders to exit.
async fn stop_lots(
    spawned: Vec<SpawnedLot>,
) -> Result<Vec<(String, Arc<Mutex<SpotInventory>>)>, MarketError> {
    let mut inventories = Vec::with_capacity(spawned.len());
    for SpawnedLot {
        handle,
        inventory,
        task,
    } in spawned
    {
        let name = String::from(handle.name());
        drop(handle);
        task.await.map_err(|e| MarketError::Task {
            message: format!("lot {name}: {e}"),
        })?;
        inventories.push((name, inventory));
    }
    Ok(inventories)
}

/// Check conservation on every lot and snapshot its counters.
async fn audit_lots(
    inventories: Vec<(String, Arc<Mutex<SpotInventory>>)>,
) -> Result<Vec<LotAudit>, MarketError> {
    let mut audit = Vec::with_capacity(inventories.len());
    for (lot_name, inventory) in inventories {
        let inventory = inventory.lock().await;
        inventory.verify_conservation()?;
        debug!(
            lot = %lot_name,
            fully_vacant = inventory.is_fully_vacant(),
            "Lot audited"
        );
        audit.push(LotAudit {
            lot_id: inventory.lot_id(),
            lot_name,
            capacity: inventory.capacity(),
            available: inventory.available(),
            occupied: inventory.occupant_count(),
        });
    }
    Ok(audit)
}

/// Reject records no round could handle.
///
/// Cars must desire and lots must support at least one category, IDs must
/// be unique, and no two agents may share a position.
pub fn validate_records(cars: &[CarRecord], lots: &[LotRecord]) -> Result<(), ConfigError> {
    let mut positions: BTreeSet<Position> = BTreeSet::new();
    let mut car_ids = BTreeSet::new();
    let mut lot_ids = BTreeSet::new();

    for car in cars {
        if car.desired.is_empty() {
            return Err(invalid(&car.name, "car desires no spot category"));
        }
        if car.hours_needed == 0 {
            return Err(invalid(&car.name, "hours_needed must be above zero"));
        }
        if !car_ids.insert(car.id) {
            return Err(invalid(&car.name, format!("duplicate car id {}", car.id)));
        }
        if !positions.insert(car.position) {
            return Err(invalid(
                &car.name,
                format!("position {} is already taken", car.position),
            ));
        }
    }

    for lot in lots {
        if lot.supported.is_empty() {
            return Err(invalid(&lot.name, "lot supports no spot category"));
        }
        let unsupported_capacity = lot
            .capacity
            .nonzero()
            .iter()
            .find(|&category| !lot.supported.contains(category));
        if let Some(category) = unsupported_capacity {
            return Err(invalid(
                &lot.name,
                format!("has {category} spots but does not support {category}"),
            ));
        }
        if !lot_ids.insert(lot.id) {
            return Err(invalid(&lot.name, format!("duplicate lot id {}", lot.id)));
        }
        if !positions.insert(lot.position) {
            return Err(invalid(
                &lot.name,
                format!("position {} is already taken", lot.position),
            ));
        }
    }
    Ok(())
}

/// Upper bound on how long a run with `cars` cars can negotiate, ignoring
/// releases.
///
/// Each round waits at most one reply deadline and one confirmation
/// deadline.
pub fn negotiation_budget(settings: &MarketSettings, cars: usize) -> Duration {
    let per_round = settings
        .negotiation
        .reply_timeout
        .saturating_add(settings.negotiation.confirmation_timeout);
    per_round.saturating_mul(u32::try_from(cars).unwrap_or(u32::MAX))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use spotnet_types::{
        CarId, EvaluationPolicyKind, LotId, RoundState, SpotCategory, SpotCategorySet, SpotCounts,
    };

    use super::*;

    fn car(name: &str, at: Position) -> CarRecord {
        CarRecord {
            id: CarId::new(),
            name: String::from(name),
            position: at,
            max_hourly_cost: 10,
            max_distance: 10,
            hours_needed: 1,
            desired: SpotCategorySet::of(&[SpotCategory::Regular]),
            policy: EvaluationPolicyKind::Strict,
        }
    }

    fn lot(name: &str, at: Position) -> LotRecord {
        LotRecord {
            id: LotId::new(),
            name: String::from(name),
            position: at,
            hourly_cost: 5,
            luxury_cost_percent: 100,
            supported: SpotCategorySet::of(&[SpotCategory::Regular]),
            capacity: SpotCounts::new(1, 0, 0),
        }
    }

    #[test]
    fn shared_position_is_rejected() {
        let cars = [car("car-0", Position::new(1, 1))];
        let lots = [lot("lot-0", Position::new(1, 1))];
        let err = validate_records(&cars, &lots).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field, .. } if field == "lot-0"));
    }

    #[test]
    fn car_without_desires_is_rejected() {
        let mut c = car("car-0", Position::new(0, 0));
        c.desired = SpotCategorySet::EMPTY;
        assert!(validate_records(&[c], &[]).is_err());
    }

    #[test]
    fn capacity_in_unsupported_category_is_rejected() {
        let mut l = lot("lot-0", Position::new(2, 2));
        l.capacity = SpotCounts::new(1, 1, 0);
        let err = validate_records(&[], &[l]).unwrap_err();
        assert!(err.to_string().contains("luxury"));
    }

    #[test]
    fn settings_follow_config() {
        let config = SimulationConfig::parse(
            "protocol:\n  reply_timeout_ms: 250\n  stale_acceptance: strict\ntiming:\n  simulated_seconds_per_hour: 2\n  release_workers: 3\n",
        )
        .unwrap();
        let settings = MarketSettings::from_config(&config);
        assert_eq!(settings.negotiation.reply_timeout, Duration::from_millis(250));
        assert_eq!(settings.responder.hour, Duration::from_secs(2));
        assert_eq!(
            settings.responder.stale_acceptance,
            spotnet_types::StaleAcceptance::Strict
        );
        assert_eq!(settings.release_workers, 3);
        assert_eq!(negotiation_budget(&settings, 2), Duration::from_millis(2 * (250 + 10_000)));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_market_reports_nothing() {
        let report = Market::new(MarketSettings::default())
            .run(Vec::new(), vec![lot("lot-0", Position::new(0, 0))])
            .await
            .unwrap();
        assert!(report.rounds.is_empty());
        assert_eq!(report.queue_advances, 0);
        assert!(report.is_balanced());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_round_stops_later_rounds_from_starting() {
        let queue = Arc::new(NegotiationQueue::new());
        let failing = CarId::new();
        let holding = car("car-1", Position::new(0, 1));
        let waiting = car("car-2", Position::new(0, 2));
        for id in [failing, holding.id, waiting.id] {
            queue.enqueue(id).await.unwrap();
        }

        // A lot that never answers keeps the second round open.
        let (mute, _mailbox) = LotHandle::channel(&lot("mute", Position::new(5, 5)));
        let handles: Arc<[LotHandle]> = Arc::from(vec![mute]);
        let negotiator = |record: CarRecord| {
            CarNegotiator::new(
                record,
                Arc::clone(&handles),
                Arc::clone(&queue),
                Arc::new(NoOpObserver),
                NegotiationSettings::default(),
            )
        };

        let broken: RoundTask = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue.wait_for_turn(failing).await.unwrap();
                queue.advance(failing).await.unwrap();
                Err::<RoundReport, _>(NegotiationError::IllegalTransition {
                    car_id: failing,
                    from: RoundState::Queued,
                    to: RoundState::Closed,
                })
            })
        };
        let rounds = vec![
            (String::from("car-0"), broken),
            (String::from("car-1"), tokio::spawn(negotiator(holding).run())),
            (String::from("car-2"), tokio::spawn(negotiator(waiting).run())),
        ];

        let (reports, first_error) = settle_rounds(rounds, &queue).await;

        assert!(matches!(
            first_error,
            Some(MarketError::Negotiation {
                source: NegotiationError::IllegalTransition { .. }
            })
        ));
        // The round already holding the turn finished; the one behind it
        // never started.
        assert_eq!(reports.len(), 1);
        assert_eq!(reports.first().unwrap().car_name, "car-1");
        assert_eq!(queue.advances(), 2);
        assert!(queue.is_closed());
        assert!(queue.is_empty().await);
    }
}
