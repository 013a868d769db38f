//! Error types for the negotiation core.

use spotnet_lots::{InventoryError, ReleaseError, ResponderError};
use spotnet_types::{CarId, LotId, RoundState};

use crate::config::ConfigError;

/// Errors raised by the [`NegotiationQueue`](crate::queue::NegotiationQueue).
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The car was never enqueued, or already had its turn.
    #[error("car {car_id} is not in the negotiation queue")]
    NotQueued {
        /// The unknown car.
        car_id: CarId,
    },

    /// The car is already waiting in the queue.
    #[error("car {car_id} is already in the negotiation queue")]
    AlreadyQueued {
        /// The duplicate car.
        car_id: CarId,
    },

    /// A car other than the head tried to advance the queue.
    #[error("car {car_id} tried to advance the queue but is not its head")]
    NotHead {
        /// The car that tried to advance.
        car_id: CarId,
        /// The actual head, if any.
        head: Option<CarId>,
    },

    /// The queue stopped admitting rounds before this car's turn came.
    #[error("car {car_id} was not admitted: the negotiation queue is closed")]
    Closed {
        /// The car that was turned away.
        car_id: CarId,
    },
}

/// Errors that end a negotiation round abnormally.
///
/// Ordinary outcomes (no replies, every offer rejected, a refused or lost
/// confirmation) are not errors; they are reported in the round result.
#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    /// The negotiation queue was misused.
    #[error("queue error: {source}")]
    Queue {
        /// The underlying queue error.
        #[from]
        source: QueueError,
    },

    /// A lot reported a failure that leaves inventory untrustworthy.
    #[error("lot {lot_id} failed fatally: {source}")]
    Lot {
        /// The failing lot.
        lot_id: LotId,
        /// The underlying responder error.
        source: ResponderError,
    },

    /// The round tried to move between two states that are not adjacent.
    #[error("car {car_id}: illegal round transition {from:?} -> {to:?}")]
    IllegalTransition {
        /// The negotiating car.
        car_id: CarId,
        /// Current state.
        from: RoundState,
        /// Requested state.
        to: RoundState,
    },
}

/// Errors that abort a whole market run.
#[derive(Debug, thiserror::Error)]
pub enum MarketError {
    /// The configuration or records are unusable.
    #[error("configuration error: {source}")]
    Config {
        /// The underlying configuration error.
        #[from]
        source: ConfigError,
    },

    /// A negotiation round failed.
    #[error("negotiation error: {source}")]
    Negotiation {
        /// The underlying negotiation error.
        #[from]
        source: NegotiationError,
    },

    /// A queue operation outside a round failed.
    #[error("queue error: {source}")]
    Queue {
        /// The underlying queue error.
        #[from]
        source: QueueError,
    },

    /// A release failed.
    #[error("release error: {source}")]
    Release {
        /// The underlying release error.
        #[from]
        source: ReleaseError,
    },

    /// The final audit found a lot whose counters do not add up.
    #[error("final audit failed: {source}")]
    Audit {
        /// The underlying inventory error.
        #[from]
        source: InventoryError,
    },

    /// A car or lot task panicked or was cancelled.
    #[error("task failed: {message}")]
    Task {
        /// Description of the failure.
        message: String,
    },
}
