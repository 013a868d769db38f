//! Error types for the spotnet-lots crate.
//!
//! Inventory errors split into two families: ordinary lookups that a caller
//! may recover from, and integrity violations that mean the allocate/release
//! pairing is broken. Integrity violations are never clamped away; they
//! propagate until the run aborts.

use spotnet_types::{CarId, LotId, SpotCategory};

/// Errors raised by [`SpotInventory`](crate::inventory::SpotInventory).
#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    /// A spot was requested in a category with no free spots.
    #[error("lot {lot_id}: no free {category} spot (would drive availability negative)")]
    Exhausted {
        /// The lot whose inventory was asked.
        lot_id: LotId,
        /// The empty category.
        category: SpotCategory,
    },

    /// The car already occupies a spot in this lot.
    #[error("lot {lot_id}: car {car_id} already holds a spot")]
    DuplicateOccupant {
        /// The lot whose inventory was asked.
        lot_id: LotId,
        /// The car that is already parked.
        car_id: CarId,
    },

    /// No allocation exists for the car in this lot.
    #[error("lot {lot_id}: car {car_id} holds no spot")]
    UnknownOccupant {
        /// The lot whose inventory was asked.
        lot_id: LotId,
        /// The car that is not parked here.
        car_id: CarId,
    },

    /// `available + occupied != capacity` for a category.
    #[error(
        "lot {lot_id}: {category} conservation violated (available {available} + occupied {occupied} != capacity {capacity})"
    )]
    ConservationViolated {
        /// The lot whose counters are incoherent.
        lot_id: LotId,
        /// The incoherent category.
        category: SpotCategory,
        /// Free spots recorded.
        available: u32,
        /// Spots held by allocations.
        occupied: u32,
        /// Starting capacity.
        capacity: u32,
    },

    /// A counter would overflow.
    #[error("lot {lot_id}: arithmetic overflow in {context}")]
    ArithmeticOverflow {
        /// The lot whose counters overflowed.
        lot_id: LotId,
        /// What was being computed.
        context: String,
    },
}

impl InventoryError {
    /// Whether this error means the inventory counters can no longer be
    /// trusted. Such errors must abort the run.
    pub const fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            Self::Exhausted { .. }
                | Self::ConservationViolated { .. }
                | Self::ArithmeticOverflow { .. }
        )
    }
}

/// Errors raised while talking to, or inside, a lot responder.
#[derive(Debug, thiserror::Error)]
pub enum ResponderError {
    /// The responder task is gone and its mailbox is closed.
    #[error("lot {lot_id} is not accepting messages")]
    MailboxClosed {
        /// The unreachable lot.
        lot_id: LotId,
    },

    /// The responder dropped the confirmation channel without answering.
    #[error("lot {lot_id} dropped the confirmation for car {car_id}")]
    ConfirmationDropped {
        /// The lot that never confirmed.
        lot_id: LotId,
        /// The accepting car.
        car_id: CarId,
    },

    /// The acceptance named a category the lot never advertised to this
    /// car, and the lot runs with strict stale-acceptance handling.
    #[error("lot {lot_id}: car {car_id} accepted {category}, which was never advertised")]
    UnadvertisedCategory {
        /// The lot that received the acceptance.
        lot_id: LotId,
        /// The accepting car.
        car_id: CarId,
        /// The category named in the acceptance.
        category: SpotCategory,
    },

    /// The allocation itself failed.
    #[error("inventory error: {source}")]
    Inventory {
        /// The underlying inventory error.
        #[from]
        source: InventoryError,
    },

    /// The allocation could not be handed to the release scheduler.
    #[error("release error: {source}")]
    Release {
        /// The underlying scheduler error.
        #[from]
        source: ReleaseError,
    },
}

impl ResponderError {
    /// Whether the error leaves inventory in an untrustworthy state or a
    /// granted spot without a pending release.
    pub const fn is_fatal(&self) -> bool {
        match self {
            Self::Inventory { source } => source.is_integrity_violation(),
            Self::Release { .. } => true,
            Self::MailboxClosed { .. }
            | Self::ConfirmationDropped { .. }
            | Self::UnadvertisedCategory { .. } => false,
        }
    }
}

/// Errors raised by the release scheduler.
#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    /// The scheduler has shut down and no longer accepts jobs.
    #[error("release scheduler is closed; allocation for car {car_id} at lot {lot_id} cannot be scheduled")]
    SchedulerClosed {
        /// The car whose release was dropped.
        car_id: CarId,
        /// The lot holding the car.
        lot_id: LotId,
    },

    /// A release worker failed to return a spot.
    #[error("release of car {car_id} at lot {lot_id} failed: {source}")]
    Inventory {
        /// The car being released.
        car_id: CarId,
        /// The lot holding the car.
        lot_id: LotId,
        /// The underlying inventory error.
        source: InventoryError,
    },

    /// A release worker task panicked or was aborted.
    #[error("release worker failed: {message}")]
    Worker {
        /// Description of the worker failure.
        message: String,
    },
}
