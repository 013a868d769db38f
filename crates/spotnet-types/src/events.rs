//! Observable protocol events.
//!
//! Every protocol transition of a negotiation round, and every allocation
//! and release, is published as a [`MarketEvent`]. Events are observational
//! only: nothing in the market reads them back.

use serde::{Deserialize, Serialize};

use crate::enums::{RejectionReason, SpotCategory};
use crate::ids::{CarId, LotId};
use crate::structs::{Allocation, Offer};

/// A single observable step in the market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MarketEvent {
    /// A car reached the head of the queue and started its round.
    RoundStarted {
        /// The negotiating car.
        car_id: CarId,
    },
    /// The call for proposals went out.
    RequestBroadcast {
        /// The negotiating car.
        car_id: CarId,
        /// Number of lots addressed.
        lot_count: usize,
    },
    /// A lot sent an offer.
    OfferReceived {
        /// The negotiating car.
        car_id: CarId,
        /// The offer snapshot.
        offer: Offer,
    },
    /// A lot refused to propose.
    LotRefused {
        /// The negotiating car.
        car_id: CarId,
        /// The refusing lot.
        lot_id: LotId,
    },
    /// A lot did not answer before the reply deadline.
    LotSilent {
        /// The negotiating car.
        car_id: CarId,
        /// The silent lot.
        lot_id: LotId,
    },
    /// An offer scored above zero.
    OfferScored {
        /// The negotiating car.
        car_id: CarId,
        /// The offering lot.
        lot_id: LotId,
        /// Score (lower is better).
        score: u32,
    },
    /// An offer scored zero and was rejected.
    OfferRejected {
        /// The negotiating car.
        car_id: CarId,
        /// The offering lot.
        lot_id: LotId,
        /// Why the offer was rejected.
        reason: RejectionReason,
    },
    /// The car accepted an offer.
    ProposalAccepted {
        /// The negotiating car.
        car_id: CarId,
        /// The winning lot.
        lot_id: LotId,
        /// Category named in the acceptance.
        category: SpotCategory,
        /// Winning score.
        score: u32,
    },
    /// The car rejected every offer.
    AllRejected {
        /// The negotiating car.
        car_id: CarId,
        /// Number of offers that were received and rejected.
        offers: usize,
    },
    /// A lot granted a spot.
    SpotAllocated {
        /// The new allocation.
        allocation: Allocation,
    },
    /// A lot received an acceptance for a category it never advertised.
    StaleAcceptance {
        /// The accepting car.
        car_id: CarId,
        /// The lot that received the acceptance.
        lot_id: LotId,
        /// Category named in the acceptance.
        category: SpotCategory,
        /// Whether the lot allocated anyway.
        honored: bool,
    },
    /// A spot was returned to its lot.
    SpotReleased {
        /// The released allocation.
        allocation: Allocation,
        /// Time the spot was held, in milliseconds of runtime clock.
        held_ms: u64,
    },
    /// The round ended. The queue advances right after.
    RoundClosed {
        /// The car whose round ended.
        car_id: CarId,
        /// Whether the round ended with an allocation.
        accepted: bool,
    },
}

impl MarketEvent {
    /// The car this event concerns.
    pub const fn car_id(&self) -> CarId {
        match self {
            Self::RoundStarted { car_id }
            | Self::RequestBroadcast { car_id, .. }
            | Self::OfferReceived { car_id, .. }
            | Self::LotRefused { car_id, .. }
            | Self::LotSilent { car_id, .. }
            | Self::OfferScored { car_id, .. }
            | Self::OfferRejected { car_id, .. }
            | Self::ProposalAccepted { car_id, .. }
            | Self::AllRejected { car_id, .. }
            | Self::StaleAcceptance { car_id, .. }
            | Self::RoundClosed { car_id, .. } => *car_id,
            Self::SpotAllocated { allocation } | Self::SpotReleased { allocation, .. } => {
                allocation.car_id
            }
        }
    }
}

/// Receives every [`MarketEvent`] as it happens.
///
/// Observers are shared between cars, lots, and the release scheduler, so
/// they take `&self` and must be thread-safe.
pub trait MarketObserver: Send + Sync {
    /// Called once per event, from the task that produced it.
    fn on_event(&self, event: &MarketEvent);
}

/// An observer that discards every event.
pub struct NoOpObserver;

impl MarketObserver for NoOpObserver {
    fn on_event(&self, _event: &MarketEvent) {}
}

/// An observer that keeps every event in arrival order.
#[derive(Default)]
pub struct RecordingObserver {
    events: std::sync::Mutex<Vec<MarketEvent>>,
}

impl RecordingObserver {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of every event recorded so far.
    pub fn events(&self) -> Vec<MarketEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Number of recorded events matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&MarketEvent) -> bool) -> usize {
        self.events
            .lock()
            .map_or(0, |events| events.iter().filter(|e| predicate(e)).count())
    }
}

impl MarketObserver for RecordingObserver {
    fn on_event(&self, event: &MarketEvent) {
        // A poisoned lock only means another recorder call panicked; the
        // event is dropped rather than propagating the panic.
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
