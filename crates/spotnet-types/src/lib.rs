//! Shared type definitions for the spotnet parking market.
//!
//! This crate is the single source of truth for the values that flow
//! between cars, lots, and the release scheduler. It has no behaviour
//! beyond small derivations (distance, luxury cost, category sets).
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe UUID wrappers for cars and lots
//! - [`enums`] -- Spot categories, policy kinds, rejection reasons, round states
//! - [`geometry`] -- World positions and the truncated Euclidean distance
//! - [`structs`] -- Participant records and protocol payloads
//! - [`events`] -- Observable protocol events and the observer trait

pub mod enums;
pub mod events;
pub mod geometry;
pub mod ids;
pub mod structs;

// Re-export all public types at crate root for convenience.
pub use enums::{EvaluationPolicyKind, RejectionReason, RoundState, SpotCategory, StaleAcceptance};
pub use events::{MarketEvent, MarketObserver, NoOpObserver, RecordingObserver};
pub use geometry::{Position, distance};
pub use ids::{CarId, LotId};
pub use structs::{
    Allocation, CarRecord, LotRecord, LotReply, Offer, SpotCategorySet, SpotCounts, SpotRequest,
};
