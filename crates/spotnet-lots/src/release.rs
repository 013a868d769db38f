//! Delayed return of granted spots.
//!
//! The [`ReleaseScheduler`] owns a single dispatcher task holding a
//! min-heap of pending releases keyed by their due instant. When a release
//! comes due it is handed to a worker task; at most `workers` releases run
//! at once. Releases never touch the negotiation queue. They only lock the
//! owning lot's inventory, the same lock the lot responder takes to
//! allocate.
//!
//! Due instants use the tokio clock, so tests with a paused runtime see
//! exact hold durations.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use spotnet_types::{Allocation, CarId, LotId, MarketEvent, MarketObserver};
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info};

use crate::error::ReleaseError;
use crate::inventory::SpotInventory;

/// Default number of releases allowed to run at the same time.
pub const DEFAULT_RELEASE_WORKERS: usize = 50;

/// Longest hold the scheduler honours, about thirty years.
///
/// Longer holds are clamped so the due instant stays representable.
pub const MAX_HOLD: Duration = Duration::from_secs(946_080_000);

/// A spot that has been returned to its lot.
#[derive(Debug, Clone)]
pub struct ReleasedSpot {
    /// The allocation that ended.
    pub allocation: Allocation,
    /// Time between scheduling and release on the tokio clock.
    pub held: Duration,
}

/// Everything the scheduler released before shutting down.
#[derive(Debug, Clone, Default)]
pub struct ReleaseSummary {
    /// Released spots in completion order.
    pub released: Vec<ReleasedSpot>,
}

impl ReleaseSummary {
    /// Number of releases performed.
    pub const fn count(&self) -> usize {
        self.released.len()
    }
}

/// A release waiting for its due instant.
struct ReleaseJob {
    car_id: CarId,
    lot_id: LotId,
    inventory: Arc<Mutex<SpotInventory>>,
    scheduled_at: Instant,
    due: Instant,
    seq: u64,
}

impl PartialEq for ReleaseJob {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ReleaseJob {}

impl PartialOrd for ReleaseJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReleaseJob {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due
            .cmp(&other.due)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Cloneable handle used by lot responders to schedule releases.
#[derive(Clone)]
pub struct ReleaseHandle {
    sender: mpsc::UnboundedSender<ReleaseJob>,
}

impl ReleaseHandle {
    /// Schedule `allocation` to be returned to `inventory` after `hold`,
    /// counted from now. Holds above [`MAX_HOLD`] are clamped to it.
    pub fn schedule(
        &self,
        allocation: &Allocation,
        inventory: Arc<Mutex<SpotInventory>>,
        hold: Duration,
    ) -> Result<(), ReleaseError> {
        let scheduled_at = Instant::now();
        let hold = hold.min(MAX_HOLD);
        let job = ReleaseJob {
            car_id: allocation.car_id,
            lot_id: allocation.lot_id,
            inventory,
            scheduled_at,
            due: scheduled_at.checked_add(hold).unwrap_or(scheduled_at),
            seq: 0,
        };
        debug!(
            car_id = %allocation.car_id,
            lot_id = %allocation.lot_id,
            hold_ms = hold.as_millis(),
            "Release scheduled"
        );
        self.sender
            .send(job)
            .map_err(|_closed| ReleaseError::SchedulerClosed {
                car_id: allocation.car_id,
                lot_id: allocation.lot_id,
            })
    }
}

/// The release dispatcher and its worker pool.
pub struct ReleaseScheduler {
    handle: ReleaseHandle,
    dispatcher: JoinHandle<Result<ReleaseSummary, ReleaseError>>,
}

impl ReleaseScheduler {
    /// Spawn the dispatcher with room for `workers` concurrent releases.
    ///
    /// A worker count of zero is raised to one.
    pub fn start(workers: usize, observer: Arc<dyn MarketObserver>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(dispatch(receiver, workers.max(1), observer));
        Self {
            handle: ReleaseHandle { sender },
            dispatcher,
        }
    }

    /// A new handle for scheduling releases.
    pub fn handle(&self) -> ReleaseHandle {
        self.handle.clone()
    }

    /// Wait until every scheduled release has fired, then stop.
    ///
    /// The dispatcher only stops once every [`ReleaseHandle`] is dropped,
    /// so callers must shut down the lot responders first.
    pub async fn drain(self) -> Result<ReleaseSummary, ReleaseError> {
        let Self { handle, dispatcher } = self;
        drop(handle);
        dispatcher.await.map_err(|e| ReleaseError::Worker {
            message: format!("release dispatcher failed: {e}"),
        })?
    }
}

async fn dispatch(
    mut receiver: mpsc::UnboundedReceiver<ReleaseJob>,
    workers: usize,
    observer: Arc<dyn MarketObserver>,
) -> Result<ReleaseSummary, ReleaseError> {
    let permits = Arc::new(Semaphore::new(workers));
    let mut pending: BinaryHeap<Reverse<ReleaseJob>> = BinaryHeap::new();
    let mut running: JoinSet<Result<ReleasedSpot, ReleaseError>> = JoinSet::new();
    let mut summary = ReleaseSummary::default();
    let mut first_error: Option<ReleaseError> = None;
    let mut next_seq: u64 = 0;
    let mut open = true;

    debug!(workers, "Release dispatcher started");

    loop {
        if !open && pending.is_empty() {
            break;
        }
        let next_due = pending.peek().map(|Reverse(job)| job.due);

        tokio::select! {
            incoming = receiver.recv(), if open => {
                match incoming {
                    Some(mut job) => {
                        // Ties on the due instant fire in scheduling order.
                        job.seq = next_seq;
                        next_seq = next_seq.wrapping_add(1);
                        pending.push(Reverse(job));
                    }
                    None => open = false,
                }
            }
            () = sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                let now = Instant::now();
                while pending.peek().is_some_and(|Reverse(job)| job.due <= now) {
                    if let Some(Reverse(job)) = pending.pop() {
                        running.spawn(run_release(
                            job,
                            Arc::clone(&permits),
                            Arc::clone(&observer),
                        ));
                    }
                }
            }
            Some(joined) = running.join_next(), if !running.is_empty() => {
                record(joined, &mut summary, &mut first_error);
            }
        }
    }

    while let Some(joined) = running.join_next().await {
        record(joined, &mut summary, &mut first_error);
    }

    info!(released = summary.count(), "Release dispatcher drained");

    first_error.map_or(Ok(summary), Err)
}

fn record(
    joined: Result<Result<ReleasedSpot, ReleaseError>, tokio::task::JoinError>,
    summary: &mut ReleaseSummary,
    first_error: &mut Option<ReleaseError>,
) {
    let outcome = joined.unwrap_or_else(|e| {
        Err(ReleaseError::Worker {
            message: e.to_string(),
        })
    });
    match outcome {
        Ok(spot) => summary.released.push(spot),
        Err(e) => {
            error!(error = %e, "Release failed");
            if first_error.is_none() {
                *first_error = Some(e);
            }
        }
    }
}

async fn run_release(
    job: ReleaseJob,
    permits: Arc<Semaphore>,
    observer: Arc<dyn MarketObserver>,
) -> Result<ReleasedSpot, ReleaseError> {
    let _permit = permits
        .acquire_owned()
        .await
        .map_err(|e| ReleaseError::Worker {
            message: format!("release pool closed: {e}"),
        })?;

    let allocation = {
        let mut inventory = job.inventory.lock().await;
        inventory
            .release(job.car_id)
            .map_err(|source| ReleaseError::Inventory {
                car_id: job.car_id,
                lot_id: job.lot_id,
                source,
            })?
    };

    let held = job.scheduled_at.elapsed();
    info!(
        car_id = %allocation.car_id,
        lot_id = %allocation.lot_id,
        category = %allocation.category,
        held_ms = held.as_millis(),
        "Spot released"
    );
    observer.on_event(&MarketEvent::SpotReleased {
        allocation: allocation.clone(),
        held_ms: u64::try_from(held.as_millis()).unwrap_or(u64::MAX),
    });

    Ok(ReleasedSpot { allocation, held })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use spotnet_types::{
        LotRecord, NoOpObserver, Position, RecordingObserver, SpotCategory, SpotCategorySet,
        SpotCounts,
    };

    use super::*;

    fn inventory(regular: u32) -> Arc<Mutex<SpotInventory>> {
        let lot = LotRecord {
            id: LotId::new(),
            name: String::from("lot-0"),
            position: Position::new(0, 0),
            hourly_cost: 10,
            luxury_cost_percent: 100,
            supported: SpotCategorySet::ALL,
            capacity: SpotCounts::new(regular, 0, 0),
        };
        Arc::new(Mutex::new(SpotInventory::new(&lot)))
    }

    #[tokio::test(start_paused = true)]
    async fn release_fires_after_hold() {
        let inv = inventory(1);
        let recorder = Arc::new(RecordingObserver::new());
        let scheduler = ReleaseScheduler::start(DEFAULT_RELEASE_WORKERS, recorder.clone());

        let car = CarId::new();
        let allocation = inv.lock().await.allocate(car, SpotCategory::Regular, 3).unwrap();
        scheduler
            .handle()
            .schedule(&allocation, Arc::clone(&inv), Duration::from_secs(15))
            .unwrap();

        let started = Instant::now();
        let summary = scheduler.drain().await.unwrap();

        assert_eq!(summary.count(), 1);
        assert_eq!(started.elapsed(), Duration::from_secs(15));
        assert_eq!(summary.released.first().map(|s| s.held), Some(Duration::from_secs(15)));
        assert!(inv.lock().await.is_fully_vacant());
        assert_eq!(
            recorder.count(|e| matches!(e, MarketEvent::SpotReleased { held_ms: 15_000, .. })),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn releases_fire_in_due_order() {
        let inv = inventory(3);
        let scheduler = ReleaseScheduler::start(2, Arc::new(NoOpObserver));
        let handle = scheduler.handle();

        let mut cars = Vec::new();
        for hold in [20_u64, 5, 10] {
            let car = CarId::new();
            let allocation = inv.lock().await.allocate(car, SpotCategory::Regular, 1).unwrap();
            handle
                .schedule(&allocation, Arc::clone(&inv), Duration::from_secs(hold))
                .unwrap();
            cars.push((hold, car));
        }
        drop(handle);

        let summary = scheduler.drain().await.unwrap();
        let order: Vec<CarId> = summary.released.iter().map(|s| s.allocation.car_id).collect();
        cars.sort_by_key(|(hold, _)| *hold);
        let expected: Vec<CarId> = cars.iter().map(|(_, car)| *car).collect();
        assert_eq!(order, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn spot_is_held_until_release() {
        let inv = inventory(1);
        let scheduler = ReleaseScheduler::start(DEFAULT_RELEASE_WORKERS, Arc::new(NoOpObserver));

        let allocation = inv
            .lock()
            .await
            .allocate(CarId::new(), SpotCategory::Regular, 2)
            .unwrap();
        scheduler
            .handle()
            .schedule(&allocation, Arc::clone(&inv), Duration::from_secs(10))
            .unwrap();

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(inv.lock().await.available().regular, 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(inv.lock().await.available().regular, 1);

        scheduler.drain().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_hold_is_clamped_not_fired_early() {
        let inv = inventory(1);
        let scheduler = ReleaseScheduler::start(DEFAULT_RELEASE_WORKERS, Arc::new(NoOpObserver));

        let allocation = inv
            .lock()
            .await
            .allocate(CarId::new(), SpotCategory::Regular, u32::MAX)
            .unwrap();
        let hold = Duration::from_secs(u64::MAX)
            .checked_mul(2)
            .unwrap_or(Duration::MAX);
        scheduler
            .handle()
            .schedule(&allocation, Arc::clone(&inv), hold)
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(inv.lock().await.available().regular, 0);

        // A year later the spot is still held.
        tokio::time::sleep(Duration::from_secs(365 * 86_400)).await;
        assert_eq!(inv.lock().await.available().regular, 0);
        assert_eq!(inv.lock().await.occupant_count(), 1);
        drop(scheduler);
    }

    #[tokio::test]
    async fn releasing_a_missing_allocation_is_reported() {
        let inv = inventory(1);
        let scheduler = ReleaseScheduler::start(1, Arc::new(NoOpObserver));
        let ghost = Allocation {
            car_id: CarId::new(),
            lot_id: inv.lock().await.lot_id(),
            category: SpotCategory::Regular,
            hours: 1,
            granted_at: chrono::Utc::now(),
        };
        scheduler
            .handle()
            .schedule(&ghost, Arc::clone(&inv), Duration::ZERO)
            .unwrap();

        let err = scheduler.drain().await.unwrap_err();
        assert!(matches!(err, ReleaseError::Inventory { .. }));
    }
}
