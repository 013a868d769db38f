//! Error types for the market binary.
//!
//! [`EngineError`] is the top-level error type that wraps all possible
//! failure modes during startup, record generation, and the run itself.

/// Top-level error for the market binary.
///
/// Each variant wraps a specific subsystem error, providing a single
/// error type that `main` can propagate with `?`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration loading or validation failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: spotnet_core::ConfigError,
    },

    /// The market run failed.
    #[error("market error: {source}")]
    Market {
        /// The underlying market error.
        #[from]
        source: spotnet_core::MarketError,
    },

    /// Car or lot record generation failed.
    #[error("spawner error: {message}")]
    Spawner {
        /// Description of the spawner failure.
        message: String,
    },

    /// The run report could not be written.
    #[error("report error: {message}")]
    Report {
        /// Description of the report failure.
        message: String,
    },
}
