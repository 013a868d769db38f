//! The lot side of the negotiation protocol.
//!
//! Each lot runs as one actor task that owns its mailbox. Calls for
//! proposals, acceptances, and rejections are processed strictly in
//! arrival order, so the offer a lot advertised to a car is always the
//! one checked when that car's acceptance arrives. Inventory is shared
//! with the release scheduler behind a single async mutex; both sides
//! mutate it only while holding that lock.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use spotnet_types::{
    Allocation, CarId, LotId, LotRecord, LotReply, MarketEvent, MarketObserver, Offer,
    SpotCategory, SpotCategorySet, SpotRequest, StaleAcceptance,
};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::ResponderError;
use crate::inventory::SpotInventory;
use crate::release::ReleaseHandle;

/// Number of messages a lot mailbox buffers before senders wait.
pub const LOT_MAILBOX_CAPACITY: usize = 64;

/// Result a lot sends back for an acceptance.
pub type Confirmation = Result<Allocation, ResponderError>;

/// Messages a lot responder understands.
#[derive(Debug)]
pub enum LotMessage {
    /// A car asks for an offer.
    CallForProposals {
        /// What the car is looking for.
        request: SpotRequest,
        /// Where to send the offer or refusal.
        reply_to: mpsc::Sender<LotReply>,
    },
    /// A car accepts this lot's offer for one category.
    Accept {
        /// The accepting car.
        car_id: CarId,
        /// Category chosen from the offer.
        category: SpotCategory,
        /// Simulated hours to hold the spot.
        hours: u32,
        /// Where to send the confirmation.
        confirm: oneshot::Sender<Confirmation>,
    },
    /// A car declines this lot's offer.
    Reject {
        /// The declining car.
        car_id: CarId,
    },
}

/// Per-lot behaviour knobs.
#[derive(Debug, Clone, Copy)]
pub struct ResponderSettings {
    /// What to do with an acceptance for a category never advertised.
    pub stale_acceptance: StaleAcceptance,
    /// Wall-clock length of one simulated hour.
    pub hour: Duration,
}

impl Default for ResponderSettings {
    fn default() -> Self {
        Self {
            stale_acceptance: StaleAcceptance::default(),
            hour: Duration::from_secs(5),
        }
    }
}

/// Address of a lot responder.
#[derive(Debug, Clone)]
pub struct LotHandle {
    lot_id: LotId,
    name: Arc<str>,
    sender: mpsc::Sender<LotMessage>,
}

impl LotHandle {
    /// Create a handle and the mailbox it feeds.
    pub fn channel(lot: &LotRecord) -> (Self, mpsc::Receiver<LotMessage>) {
        let (sender, receiver) = mpsc::channel(LOT_MAILBOX_CAPACITY);
        let handle = Self {
            lot_id: lot.id,
            name: Arc::from(lot.name.as_str()),
            sender,
        };
        (handle, receiver)
    }

    /// The lot this handle addresses.
    pub const fn lot_id(&self) -> LotId {
        self.lot_id
    }

    /// The lot's display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send a call for proposals. The reply arrives on `reply_to`.
    pub async fn call_for_proposals(
        &self,
        request: SpotRequest,
        reply_to: mpsc::Sender<LotReply>,
    ) -> Result<(), ResponderError> {
        self.send(LotMessage::CallForProposals { request, reply_to })
            .await
    }

    /// Accept this lot's offer for `category`.
    ///
    /// Returns the receiver on which the confirmation will arrive.
    pub async fn accept(
        &self,
        car_id: CarId,
        category: SpotCategory,
        hours: u32,
    ) -> Result<oneshot::Receiver<Confirmation>, ResponderError> {
        let (confirm, confirmation) = oneshot::channel();
        self.send(LotMessage::Accept {
            car_id,
            category,
            hours,
            confirm,
        })
        .await?;
        Ok(confirmation)
    }

    /// Decline this lot's offer.
    pub async fn reject(&self, car_id: CarId) -> Result<(), ResponderError> {
        self.send(LotMessage::Reject { car_id }).await
    }

    async fn send(&self, message: LotMessage) -> Result<(), ResponderError> {
        self.sender
            .send(message)
            .await
            .map_err(|_closed| ResponderError::MailboxClosed {
                lot_id: self.lot_id,
            })
    }
}

/// A running lot: its address, its shared inventory, and its task.
pub struct SpawnedLot {
    /// Address for cars.
    pub handle: LotHandle,
    /// Inventory shared with the release scheduler and the final audit.
    pub inventory: Arc<Mutex<SpotInventory>>,
    /// The actor task. Ends once every handle is dropped.
    pub task: JoinHandle<()>,
}

/// The actor state of one lot.
pub struct LotResponder {
    record: LotRecord,
    inventory: Arc<Mutex<SpotInventory>>,
    releases: ReleaseHandle,
    observer: Arc<dyn MarketObserver>,
    settings: ResponderSettings,
    /// Categories the last offer to each car advertised as free.
    advertised: BTreeMap<CarId, SpotCategorySet>,
}

impl LotResponder {
    /// Build a responder with a fresh inventory for `record`.
    pub fn new(
        record: LotRecord,
        releases: ReleaseHandle,
        observer: Arc<dyn MarketObserver>,
        settings: ResponderSettings,
    ) -> Self {
        let inventory = Arc::new(Mutex::new(SpotInventory::new(&record)));
        Self {
            record,
            inventory,
            releases,
            observer,
            settings,
            advertised: BTreeMap::new(),
        }
    }

    /// Spawn the responder onto the runtime.
    pub fn spawn(self) -> SpawnedLot {
        let (handle, receiver) = LotHandle::channel(&self.record);
        let inventory = Arc::clone(&self.inventory);
        let task = tokio::spawn(self.run(receiver));
        SpawnedLot {
            handle,
            inventory,
            task,
        }
    }

    /// Process messages until every sender is gone.
    pub async fn run(mut self, mut receiver: mpsc::Receiver<LotMessage>) {
        debug!(lot = %self.record.name, "Lot responder started");
        while let Some(message) = receiver.recv().await {
            match message {
                LotMessage::CallForProposals { request, reply_to } => {
                    let reply = self.answer(&request).await;
                    if reply_to.send(reply).await.is_err() {
                        debug!(
                            lot = %self.record.name,
                            car = %request.car_name,
                            "Reply dropped, car stopped collecting"
                        );
                    }
                }
                LotMessage::Accept {
                    car_id,
                    category,
                    hours,
                    confirm,
                } => {
                    let outcome = self.grant(car_id, category, hours).await;
                    if let Err(e) = &outcome {
                        if e.is_fatal() {
                            error!(lot = %self.record.name, error = %e, "Allocation failed");
                        } else {
                            warn!(lot = %self.record.name, error = %e, "Acceptance refused");
                        }
                    }
                    if confirm.send(outcome).is_err() {
                        warn!(
                            lot = %self.record.name,
                            car_id = %car_id,
                            "Confirmation dropped, car stopped waiting"
                        );
                    }
                }
                LotMessage::Reject { car_id } => {
                    self.advertised.remove(&car_id);
                    debug!(lot = %self.record.name, car_id = %car_id, "Offer declined");
                }
            }
        }
        debug!(lot = %self.record.name, "Lot responder stopped");
    }

    /// Build an offer if any requested category has a free spot.
    async fn answer(&mut self, request: &SpotRequest) -> LotReply {
        let (vacant, wanted) = {
            let inventory = self.inventory.lock().await;
            (
                inventory.vacant_categories(),
                inventory.vacancies_for(request.desired),
            )
        };

        debug!(
            lot = %self.record.name,
            car = %request.car_name,
            desired = %request.desired,
            "Call for proposals received"
        );

        if wanted.is_empty() {
            self.advertised.remove(&request.car_id);
            info!(
                lot = %self.record.name,
                car = %request.car_name,
                "Refusing, no requested category has a free spot"
            );
            return LotReply::Refuse {
                lot_id: self.record.id,
                lot_name: self.record.name.clone(),
            };
        }

        self.advertised.insert(request.car_id, vacant);
        info!(
            lot = %self.record.name,
            car = %request.car_name,
            available = %vacant,
            "Proposing"
        );
        LotReply::Propose(Offer {
            lot_id: self.record.id,
            lot_name: self.record.name.clone(),
            position: self.record.position,
            hourly_cost: self.record.hourly_cost,
            luxury_cost_percent: self.record.luxury_cost_percent,
            available: vacant,
        })
    }

    /// Allocate the accepted category and schedule its release.
    async fn grant(
        &mut self,
        car_id: CarId,
        category: SpotCategory,
        hours: u32,
    ) -> Result<Allocation, ResponderError> {
        let advertised = self
            .advertised
            .remove(&car_id)
            .unwrap_or(SpotCategorySet::EMPTY);

        if !advertised.contains(category) {
            let honored = self.settings.stale_acceptance == StaleAcceptance::Permissive;
            warn!(
                lot = %self.record.name,
                car_id = %car_id,
                category = %category,
                advertised = %advertised,
                honored,
                "Acceptance names a category that was not advertised"
            );
            self.observer.on_event(&MarketEvent::StaleAcceptance {
                car_id,
                lot_id: self.record.id,
                category,
                honored,
            });
            if !honored {
                return Err(ResponderError::UnadvertisedCategory {
                    lot_id: self.record.id,
                    car_id,
                    category,
                });
            }
        }

        let allocation = self
            .inventory
            .lock()
            .await
            .allocate(car_id, category, hours)?;

        let hold = self
            .settings
            .hour
            .checked_mul(hours)
            .unwrap_or(Duration::MAX);
        self.releases
            .schedule(&allocation, Arc::clone(&self.inventory), hold)?;

        info!(
            lot = %self.record.name,
            car_id = %car_id,
            category = %category,
            hours,
            release_in_ms = hold.as_millis(),
            "Spot allocated"
        );
        self.observer.on_event(&MarketEvent::SpotAllocated {
            allocation: allocation.clone(),
        });
        Ok(allocation)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use spotnet_types::{NoOpObserver, Position, RecordingObserver, SpotCounts};

    use super::*;
    use crate::release::{DEFAULT_RELEASE_WORKERS, ReleaseScheduler};

    fn lot(capacity: SpotCounts) -> LotRecord {
        LotRecord {
            id: LotId::new(),
            name: String::from("lot-0"),
            position: Position::new(3, 4),
            hourly_cost: 20,
            luxury_cost_percent: 50,
            supported: SpotCategorySet::ALL,
            capacity,
        }
    }

    fn request(desired: &[SpotCategory]) -> SpotRequest {
        SpotRequest {
            car_id: CarId::new(),
            car_name: String::from("car-0"),
            position: Position::new(0, 0),
            max_hourly_cost: 10,
            max_distance: 10,
            hours_needed: 3,
            desired: SpotCategorySet::of(desired),
        }
    }

    async fn ask(handle: &LotHandle, request: SpotRequest) -> LotReply {
        let (reply_to, mut replies) = mpsc::channel(1);
        handle.call_for_proposals(request, reply_to).await.unwrap();
        replies.recv().await.unwrap()
    }

    #[tokio::test]
    async fn offers_snapshot_of_free_categories() {
        let scheduler = ReleaseScheduler::start(DEFAULT_RELEASE_WORKERS, Arc::new(NoOpObserver));
        let record = lot(SpotCounts::new(1, 2, 0));
        let lot = LotResponder::new(
            record.clone(),
            scheduler.handle(),
            Arc::new(NoOpObserver),
            ResponderSettings::default(),
        )
        .spawn();

        let reply = ask(&lot.handle, request(&[SpotCategory::Luxury])).await;
        assert!(matches!(reply, LotReply::Propose(_)));
        let LotReply::Propose(offer) = reply else {
            return;
        };
        assert_eq!(offer.lot_id, record.id);
        assert_eq!(offer.position, record.position);
        // The snapshot lists every free category, not just the requested one.
        assert!(offer.available.contains(SpotCategory::Regular));
        assert!(offer.available.contains(SpotCategory::Luxury));
        assert!(!offer.available.contains(SpotCategory::Handicap));
        assert_eq!(offer.luxury_cost(), 10);
    }

    #[tokio::test]
    async fn refuses_when_no_requested_category_is_free() {
        let scheduler = ReleaseScheduler::start(DEFAULT_RELEASE_WORKERS, Arc::new(NoOpObserver));
        let lot = LotResponder::new(
            lot(SpotCounts::new(1, 0, 0)),
            scheduler.handle(),
            Arc::new(NoOpObserver),
            ResponderSettings::default(),
        )
        .spawn();

        let reply = ask(&lot.handle, request(&[SpotCategory::Handicap])).await;
        assert!(matches!(reply, LotReply::Refuse { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn acceptance_allocates_and_schedules_release() {
        let scheduler = ReleaseScheduler::start(DEFAULT_RELEASE_WORKERS, Arc::new(NoOpObserver));
        let SpawnedLot {
            handle,
            inventory,
            task,
        } = LotResponder::new(
            lot(SpotCounts::new(1, 0, 0)),
            scheduler.handle(),
            Arc::new(NoOpObserver),
            ResponderSettings::default(),
        )
        .spawn();

        let req = request(&[SpotCategory::Regular]);
        let car_id = req.car_id;
        ask(&handle, req).await;
        let allocation = handle
            .accept(car_id, SpotCategory::Regular, 3)
            .await
            .unwrap()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(allocation.category, SpotCategory::Regular);
        assert_eq!(inventory.lock().await.available().regular, 0);

        drop(handle);
        task.await.unwrap();
        let started = tokio::time::Instant::now();
        let summary = scheduler.drain().await.unwrap();
        assert_eq!(summary.count(), 1);
        // 3 hours at 5 seconds per simulated hour.
        assert_eq!(started.elapsed(), Duration::from_secs(15));
        assert!(inventory.lock().await.is_fully_vacant());
    }

    #[tokio::test]
    async fn permissive_lot_honors_unadvertised_category() {
        let recorder = Arc::new(RecordingObserver::new());
        let scheduler = ReleaseScheduler::start(DEFAULT_RELEASE_WORKERS, Arc::new(NoOpObserver));
        let lot = LotResponder::new(
            lot(SpotCounts::new(1, 1, 0)),
            scheduler.handle(),
            recorder.clone(),
            ResponderSettings::default(),
        )
        .spawn();

        // The car never asked, so nothing was advertised to it.
        let car_id = CarId::new();
        let confirmation = lot
            .handle
            .accept(car_id, SpotCategory::Luxury, 1)
            .await
            .unwrap()
            .await
            .unwrap();
        assert!(confirmation.is_ok());
        assert_eq!(lot.inventory.lock().await.available().luxury, 0);
        assert_eq!(
            recorder.count(|e| matches!(e, MarketEvent::StaleAcceptance { honored: true, .. })),
            1
        );
    }

    #[tokio::test]
    async fn strict_lot_refuses_unadvertised_category() {
        let recorder = Arc::new(RecordingObserver::new());
        let scheduler = ReleaseScheduler::start(DEFAULT_RELEASE_WORKERS, Arc::new(NoOpObserver));
        let settings = ResponderSettings {
            stale_acceptance: StaleAcceptance::Strict,
            ..ResponderSettings::default()
        };
        let lot = LotResponder::new(
            lot(SpotCounts::new(1, 1, 0)),
            scheduler.handle(),
            recorder.clone(),
            settings,
        )
        .spawn();

        let confirmation = lot
            .handle
            .accept(CarId::new(), SpotCategory::Luxury, 1)
            .await
            .unwrap()
            .await
            .unwrap();
        let err = confirmation.unwrap_err();
        assert!(matches!(err, ResponderError::UnadvertisedCategory { .. }));
        assert!(!err.is_fatal());
        assert_eq!(lot.inventory.lock().await.available().luxury, 1);
        assert_eq!(
            recorder.count(|e| matches!(e, MarketEvent::StaleAcceptance { honored: false, .. })),
            1
        );
    }

    #[tokio::test]
    async fn honoring_an_exhausted_category_is_fatal() {
        let scheduler = ReleaseScheduler::start(DEFAULT_RELEASE_WORKERS, Arc::new(NoOpObserver));
        let lot = LotResponder::new(
            lot(SpotCounts::new(1, 0, 0)),
            scheduler.handle(),
            Arc::new(NoOpObserver),
            ResponderSettings::default(),
        )
        .spawn();

        let confirmation = lot
            .handle
            .accept(CarId::new(), SpotCategory::Luxury, 1)
            .await
            .unwrap()
            .await
            .unwrap();
        let err = confirmation.unwrap_err();
        assert!(err.is_fatal());
        assert!(lot.inventory.lock().await.verify_conservation().is_ok());
    }
}
