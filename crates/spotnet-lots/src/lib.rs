//! Lot-side machinery for the spotnet parking market.
//!
//! - [`inventory`] -- Per-lot free/occupied counters with conservation checks
//! - [`responder`] -- The lot actor answering calls for proposals and acceptances
//! - [`release`] -- Delayed return of granted spots on a bounded worker pool
//! - [`error`] -- Error types for all of the above

pub mod error;
pub mod inventory;
pub mod release;
pub mod responder;

pub use error::{InventoryError, ReleaseError, ResponderError};
pub use inventory::SpotInventory;
pub use release::{
    DEFAULT_RELEASE_WORKERS, MAX_HOLD, ReleaseHandle, ReleaseScheduler, ReleaseSummary, ReleasedSpot,
};
pub use responder::{
    Confirmation, LOT_MAILBOX_CAPACITY, LotHandle, LotMessage, LotResponder, ResponderSettings,
    SpawnedLot,
};
