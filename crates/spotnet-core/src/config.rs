//! Configuration loading and typed config structures for the spotnet market.
//!
//! The canonical configuration lives in `spotnet-config.yaml` at the project
//! root. This module defines strongly-typed structs that mirror the YAML
//! structure, a loader that reads the file, and [`SimulationConfig::validate`]
//! which rejects inconsistent settings before any negotiation starts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use spotnet_types::{EvaluationPolicyKind, SpotCategorySet, StaleAcceptance};

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// A value is out of range or inconsistent with another value.
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        /// Dotted path of the offending key.
        field: String,
        /// What is wrong with it.
        reason: String,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: String::from(field),
        reason: reason.into(),
    }
}

/// Top-level market configuration.
///
/// Mirrors the structure of `spotnet-config.yaml`. Every field has a
/// default, so an empty file is a valid configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SimulationConfig {
    /// Negotiation protocol timing and strictness.
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// Simulated time scale and release pool size.
    #[serde(default)]
    pub timing: TimingConfig,

    /// Evaluation policy parameters.
    #[serde(default)]
    pub evaluation: EvaluationConfig,

    /// How car and lot records are produced.
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Where to write the run report.
    #[serde(default)]
    pub output: OutputConfig,
}

impl SimulationConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// The result is not validated; call [`validate`](Self::validate).
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yml::from_str(yaml)?;
        Ok(config)
    }

    /// Check every value that would otherwise fail mid-run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol.reply_timeout_ms == 0 {
            return Err(invalid("protocol.reply_timeout_ms", "must be above zero"));
        }
        if self.protocol.confirmation_timeout_ms == 0 {
            return Err(invalid(
                "protocol.confirmation_timeout_ms",
                "must be above zero",
            ));
        }
        if self.timing.simulated_seconds_per_hour > MAX_SIMULATED_SECONDS_PER_HOUR {
            return Err(invalid(
                "timing.simulated_seconds_per_hour",
                format!(
                    "must be at most {MAX_SIMULATED_SECONDS_PER_HOUR}, got {}",
                    self.timing.simulated_seconds_per_hour
                ),
            ));
        }
        if self.timing.release_workers == 0 {
            return Err(invalid("timing.release_workers", "must be above zero"));
        }
        let margin = self.evaluation.flexible_margin;
        if !margin.is_finite() || margin < 0.0 {
            return Err(invalid(
                "evaluation.flexible_margin",
                format!("must be a finite non-negative number, got {margin}"),
            ));
        }
        match self.generation.mode {
            GenerationMode::Random => self.generation.random.validate(),
            GenerationMode::Fixed => self.generation.validate_fixed(),
        }
    }
}

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

/// Negotiation protocol configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProtocolConfig {
    /// How long a car collects replies after broadcasting.
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,

    /// How long a car waits for the winning lot's confirmation.
    #[serde(default = "default_confirmation_timeout_ms")]
    pub confirmation_timeout_ms: u64,

    /// How lots treat an acceptance for a category they never advertised.
    #[serde(default)]
    pub stale_acceptance: StaleAcceptance,
}

impl ProtocolConfig {
    /// Reply deadline as a [`Duration`].
    pub const fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    /// Confirmation deadline as a [`Duration`].
    pub const fn confirmation_timeout(&self) -> Duration {
        Duration::from_millis(self.confirmation_timeout_ms)
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            reply_timeout_ms: default_reply_timeout_ms(),
            confirmation_timeout_ms: default_confirmation_timeout_ms(),
            stale_acceptance: StaleAcceptance::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

/// Simulated time configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TimingConfig {
    /// Real seconds that stand for one simulated hour of parking.
    #[serde(default = "default_simulated_seconds_per_hour")]
    pub simulated_seconds_per_hour: u64,

    /// Maximum number of releases processed at the same time.
    #[serde(default = "default_release_workers")]
    pub release_workers: usize,
}

impl TimingConfig {
    /// One simulated hour as a [`Duration`].
    pub const fn hour(&self) -> Duration {
        Duration::from_secs(self.simulated_seconds_per_hour)
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            simulated_seconds_per_hour: default_simulated_seconds_per_hour(),
            release_workers: default_release_workers(),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluation policy configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EvaluationConfig {
    /// Largest combined overhead the flexible policy tolerates.
    #[serde(default = "default_flexible_margin")]
    pub flexible_margin: f64,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            flexible_margin: default_flexible_margin(),
        }
    }
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

/// Where car and lot records come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    /// Draw records from the bounds in [`RandomGenerationConfig`].
    #[default]
    #[serde(alias = "RANDOM")]
    Random,
    /// Use the explicit car and lot lists.
    #[serde(alias = "FIXED")]
    Fixed,
}

/// Record generation configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct GenerationConfig {
    /// Random or fixed records.
    #[serde(default)]
    pub mode: GenerationMode,

    /// Seed for random generation. Absent means seeded from entropy.
    #[serde(default)]
    pub seed: Option<u64>,

    /// Bounds for random mode.
    #[serde(default)]
    pub random: RandomGenerationConfig,

    /// Explicit cars for fixed mode, in queue order.
    #[serde(default)]
    pub cars: Vec<FixedCarEntry>,

    /// Explicit lots for fixed mode.
    #[serde(default)]
    pub lots: Vec<FixedLotEntry>,
}

impl GenerationConfig {
    fn validate_fixed(&self) -> Result<(), ConfigError> {
        if self.lots.is_empty() {
            return Err(invalid("generation.lots", "fixed mode needs at least one lot"));
        }
        for (i, car) in self.cars.iter().enumerate() {
            let field = format!("generation.cars[{i}]");
            let desired = parse_flags(&format!("{field}.desired"), &car.desired)?;
            if desired.is_empty() {
                return Err(invalid(&field, "car desires no spot category"));
            }
            if car.hours_needed == 0 {
                return Err(invalid(&field, "hours_needed must be above zero"));
            }
        }
        for (i, lot) in self.lots.iter().enumerate() {
            let field = format!("generation.lots[{i}]");
            let supported = parse_flags(&format!("{field}.spots"), &lot.spots)?;
            if supported.is_empty() {
                return Err(invalid(&field, "lot supports no spot category"));
            }
        }
        Ok(())
    }
}

/// Parse an `RLH` flag string, naming `field` on failure.
pub fn parse_flags(field: &str, flags: &str) -> Result<SpotCategorySet, ConfigError> {
    SpotCategorySet::from_flags(flags).ok_or_else(|| {
        invalid(
            field,
            format!("expected three 0/1 digits in Regular, Luxury, Handicap order, got {flags:?}"),
        )
    })
}

/// An inclusive `[min, max]` range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Bounds {
    /// Smallest value drawn.
    pub min: u32,
    /// Largest value drawn.
    pub max: u32,
}

impl Bounds {
    /// Create a range.
    pub const fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    fn validate(self, field: &str) -> Result<(), ConfigError> {
        if self.min > self.max {
            return Err(invalid(
                field,
                format!("min {} is above max {}", self.min, self.max),
            ));
        }
        Ok(())
    }
}

/// Share of a lot's spots per category, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SpotPercentages {
    /// Percent of regular spots.
    #[serde(default)]
    pub regular: u32,
    /// Percent of luxury spots.
    #[serde(default)]
    pub luxury: u32,
    /// Percent of handicap spots.
    #[serde(default)]
    pub handicap: u32,
}

/// Bounds for random record generation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RandomGenerationConfig {
    /// Number of cars to create.
    #[serde(default = "default_car_count")]
    pub car_count: u32,

    /// Number of lots to create.
    #[serde(default = "default_lot_count")]
    pub lot_count: u32,

    /// World width; x coordinates are drawn from `0..world_width`.
    #[serde(default = "default_world_size")]
    pub world_width: u32,

    /// World height; y coordinates are drawn from `0..world_height`.
    #[serde(default = "default_world_size")]
    pub world_height: u32,

    /// Range of the highest hourly cost a car tolerates.
    #[serde(default = "default_car_max_hourly_cost")]
    pub car_max_hourly_cost: Bounds,

    /// Range of the farthest distance a car tolerates.
    #[serde(default = "default_car_max_distance")]
    pub car_max_distance: Bounds,

    /// Range of simulated hours a car parks for.
    #[serde(default = "default_car_hours_needed")]
    pub car_hours_needed: Bounds,

    /// Range of total spots per lot.
    #[serde(default = "default_lot_spots")]
    pub lot_spots: Bounds,

    /// How a lot's spots split across categories.
    #[serde(default = "default_lot_spot_percent")]
    pub lot_spot_percent: SpotPercentages,

    /// Range of a lot's hourly cost.
    #[serde(default = "default_lot_hourly_cost")]
    pub lot_hourly_cost: Bounds,

    /// Luxury cost modifier applied to every lot, in percent.
    #[serde(default = "default_lot_luxury_cost_percent")]
    pub lot_luxury_cost_percent: u32,

    /// Categories in play, as an `RLH` flag string.
    #[serde(default = "default_enabled_spots")]
    pub enabled_spots: String,

    /// Pin every car to one policy instead of drawing uniformly.
    #[serde(default)]
    pub policy: Option<EvaluationPolicyKind>,
}

impl RandomGenerationConfig {
    /// The enabled categories.
    pub fn enabled(&self) -> Result<SpotCategorySet, ConfigError> {
        parse_flags("generation.random.enabled_spots", &self.enabled_spots)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.lot_count == 0 {
            return Err(invalid("generation.random.lot_count", "must be above zero"));
        }
        if self.world_width == 0 || self.world_height == 0 {
            return Err(invalid("generation.random.world_*", "world must not be empty"));
        }
        if i32::try_from(self.world_width).is_err() || i32::try_from(self.world_height).is_err() {
            return Err(invalid(
                "generation.random.world_*",
                "world size must fit a signed 32-bit coordinate",
            ));
        }
        let cells = u64::from(self.world_width).saturating_mul(u64::from(self.world_height));
        let agents = u64::from(self.car_count).saturating_add(u64::from(self.lot_count));
        if agents > cells {
            return Err(invalid(
                "generation.random",
                format!("{agents} agents do not fit on {cells} distinct world cells"),
            ));
        }
        self.car_max_hourly_cost
            .validate("generation.random.car_max_hourly_cost")?;
        self.car_max_distance
            .validate("generation.random.car_max_distance")?;
        self.car_hours_needed
            .validate("generation.random.car_hours_needed")?;
        if self.car_hours_needed.min == 0 {
            return Err(invalid(
                "generation.random.car_hours_needed",
                "cars must park for at least one hour",
            ));
        }
        self.lot_spots.validate("generation.random.lot_spots")?;
        self.lot_hourly_cost
            .validate("generation.random.lot_hourly_cost")?;

        let p = self.lot_spot_percent;
        let sum = p
            .regular
            .checked_add(p.luxury)
            .and_then(|s| s.checked_add(p.handicap));
        if sum != Some(100) {
            return Err(invalid(
                "generation.random.lot_spot_percent",
                "percentages must add up to 100",
            ));
        }
        if self.enabled()?.is_empty() {
            return Err(invalid(
                "generation.random.enabled_spots",
                "at least one category must be enabled",
            ));
        }
        Ok(())
    }
}

impl Default for RandomGenerationConfig {
    fn default() -> Self {
        Self {
            car_count: default_car_count(),
            lot_count: default_lot_count(),
            world_width: default_world_size(),
            world_height: default_world_size(),
            car_max_hourly_cost: default_car_max_hourly_cost(),
            car_max_distance: default_car_max_distance(),
            car_hours_needed: default_car_hours_needed(),
            lot_spots: default_lot_spots(),
            lot_spot_percent: default_lot_spot_percent(),
            lot_hourly_cost: default_lot_hourly_cost(),
            lot_luxury_cost_percent: default_lot_luxury_cost_percent(),
            enabled_spots: default_enabled_spots(),
            policy: None,
        }
    }
}

/// One explicit car for fixed mode.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FixedCarEntry {
    /// Horizontal coordinate.
    pub x: i32,
    /// Vertical coordinate.
    pub y: i32,
    /// Highest hourly cost tolerated.
    pub max_hourly_cost: u32,
    /// Farthest distance tolerated.
    pub max_distance: u32,
    /// Simulated hours to park.
    pub hours_needed: u32,
    /// Desired categories as an `RLH` flag string.
    pub desired: String,
    /// Scoring rule.
    pub policy: EvaluationPolicyKind,
}

/// One explicit lot for fixed mode.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FixedLotEntry {
    /// Horizontal coordinate.
    pub x: i32,
    /// Vertical coordinate.
    pub y: i32,
    /// Regular spot count.
    #[serde(default)]
    pub regular: u32,
    /// Luxury spot count.
    #[serde(default)]
    pub luxury: u32,
    /// Handicap spot count.
    #[serde(default)]
    pub handicap: u32,
    /// Hourly cost of a regular or handicap spot.
    pub hourly_cost: u32,
    /// Luxury cost modifier in percent.
    pub luxury_cost_percent: u32,
    /// Supported categories as an `RLH` flag string.
    pub spots: String,
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Report output configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct OutputConfig {
    /// Write the JSON run report here when set.
    #[serde(default)]
    pub report_path: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Longest simulated hour accepted, one real day.
pub const MAX_SIMULATED_SECONDS_PER_HOUR: u64 = 86_400;

const fn default_reply_timeout_ms() -> u64 {
    10_000
}

const fn default_confirmation_timeout_ms() -> u64 {
    10_000
}

const fn default_simulated_seconds_per_hour() -> u64 {
    5
}

const fn default_release_workers() -> usize {
    50
}

const fn default_flexible_margin() -> f64 {
    0.3
}

const fn default_car_count() -> u32 {
    10
}

const fn default_lot_count() -> u32 {
    4
}

const fn default_world_size() -> u32 {
    50
}

const fn default_car_max_hourly_cost() -> Bounds {
    Bounds::new(5, 25)
}

const fn default_car_max_distance() -> Bounds {
    Bounds::new(5, 30)
}

const fn default_car_hours_needed() -> Bounds {
    Bounds::new(1, 5)
}

const fn default_lot_spots() -> Bounds {
    Bounds::new(2, 8)
}

const fn default_lot_spot_percent() -> SpotPercentages {
    SpotPercentages {
        regular: 60,
        luxury: 20,
        handicap: 20,
    }
}

const fn default_lot_hourly_cost() -> Bounds {
    Bounds::new(5, 20)
}

const fn default_lot_luxury_cost_percent() -> u32 {
    150
}

fn default_enabled_spots() -> String {
    String::from("111")
}
