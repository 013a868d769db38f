//! Negotiation core for the spotnet parking market.
//!
//! This crate drives the car side of the Contract-Net protocol and the run
//! as a whole: it admits cars one at a time, lets each broadcast to every
//! lot, scores the replies, and settles on one offer or none.
//!
//! # Modules
//!
//! - [`config`] -- Configuration loading from `spotnet-config.yaml` into
//!   strongly-typed structs.
//! - [`policy`] -- The four offer scoring rules.
//! - [`queue`] -- [`NegotiationQueue`], the FIFO gate for rounds.
//! - [`negotiator`] -- [`CarNegotiator`], one car's round end to end.
//! - [`market`] -- [`Market`], the run context and teardown order.
//! - [`report`] -- Per-round results and the final audit.
//! - [`error`] -- Queue, negotiation, and market errors.
//!
//! [`NegotiationQueue`]: queue::NegotiationQueue
//! [`CarNegotiator`]: negotiator::CarNegotiator
//! [`Market`]: market::Market

pub mod config;
pub mod error;
pub mod market;
pub mod negotiator;
pub mod policy;
pub mod queue;
pub mod report;

pub use config::{ConfigError, SimulationConfig};
pub use error::{MarketError, NegotiationError, QueueError};
pub use market::{Market, MarketSettings, validate_records};
pub use negotiator::{CarNegotiator, NegotiationSettings};
pub use policy::{Evaluation, EvaluationPolicy, Verdict};
pub use queue::NegotiationQueue;
pub use report::{ConfirmationStatus, LotAudit, MarketReport, RoundOutcome, RoundReport};
