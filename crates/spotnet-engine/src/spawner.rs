//! Car and lot record generation.
//!
//! In random mode every agent gets a distinct world cell and its bounds
//! are drawn uniformly from the configured ranges. In fixed mode the
//! explicit entries are converted as they are. Either way the records come
//! out in queue order, named `car-0`, `car-1`, ... and `lot-0`, `lot-1`, ...

use std::collections::BTreeSet;

use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use spotnet_core::config::{
    Bounds, GenerationConfig, GenerationMode, RandomGenerationConfig, SpotPercentages,
    parse_flags,
};
use spotnet_types::{
    CarId, CarRecord, EvaluationPolicyKind, LotId, LotRecord, Position, SpotCategory,
    SpotCategorySet, SpotCounts,
};
use tracing::{debug, info};

use crate::error::EngineError;

/// Random placement tries before falling back to a scan for a free cell.
const MAX_PLACEMENT_ATTEMPTS: u32 = 10_000;

/// The records a run negotiates over.
#[derive(Debug)]
pub struct SpawnResult {
    /// Cars in queue order.
    pub cars: Vec<CarRecord>,
    /// Lots.
    pub lots: Vec<LotRecord>,
    /// Seed the random generator used, when random mode ran.
    pub seed: Option<u64>,
}

/// Produce records as configured.
pub fn spawn_records(config: &GenerationConfig) -> Result<SpawnResult, EngineError> {
    match config.mode {
        GenerationMode::Random => {
            let seed = config.seed.unwrap_or_else(|| rand::rng().random());
            let mut rng = StdRng::seed_from_u64(seed);
            let (cars, lots) = random_records(&config.random, &mut rng)?;
            info!(
                seed,
                cars = cars.len(),
                lots = lots.len(),
                "Random records generated"
            );
            Ok(SpawnResult {
                cars,
                lots,
                seed: Some(seed),
            })
        }
        GenerationMode::Fixed => {
            let (cars, lots) = fixed_records(config)?;
            info!(cars = cars.len(), lots = lots.len(), "Fixed records loaded");
            Ok(SpawnResult {
                cars,
                lots,
                seed: None,
            })
        }
    }
}

// -----------------------------------------------------------------------
// Random mode
// -----------------------------------------------------------------------

/// Draw every car and lot from the configured bounds.
pub fn random_records<R: Rng>(
    config: &RandomGenerationConfig,
    rng: &mut R,
) -> Result<(Vec<CarRecord>, Vec<LotRecord>), EngineError> {
    let enabled = config.enabled()?;
    let mut taken: BTreeSet<Position> = BTreeSet::new();

    let mut cars = Vec::new();
    for i in 0..config.car_count {
        let position = place(rng, config, &mut taken)?;
        let car = CarRecord {
            id: CarId::new(),
            name: format!("car-{i}"),
            position,
            max_hourly_cost: draw(rng, config.car_max_hourly_cost),
            max_distance: draw(rng, config.car_max_distance),
            hours_needed: draw(rng, config.car_hours_needed),
            desired: draw_desired(rng, enabled),
            policy: config.policy.unwrap_or_else(|| {
                EvaluationPolicyKind::ALL
                    .choose(rng)
                    .copied()
                    .unwrap_or(EvaluationPolicyKind::Strict)
            }),
        };
        debug!(
            car = %car.name,
            position = %car.position,
            policy = %car.policy,
            desired = %car.desired,
            "Car generated"
        );
        cars.push(car);
    }

    let mut lots = Vec::new();
    for i in 0..config.lot_count {
        let position = place(rng, config, &mut taken)?;
        let spots = draw(rng, config.lot_spots);
        let lot = LotRecord {
            id: LotId::new(),
            name: format!("lot-{i}"),
            position,
            hourly_cost: draw(rng, config.lot_hourly_cost),
            luxury_cost_percent: config.lot_luxury_cost_percent,
            supported: enabled,
            capacity: split_capacity(spots, config.lot_spot_percent, enabled),
        };
        debug!(
            lot = %lot.name,
            position = %lot.position,
            spots,
            capacity = ?lot.capacity,
            "Lot generated"
        );
        lots.push(lot);
    }

    Ok((cars, lots))
}

/// Uniform draw from an inclusive range.
fn draw<R: Rng>(rng: &mut R, bounds: Bounds) -> u32 {
    rng.random_range(bounds.min..=bounds.max.max(bounds.min))
}

/// Each enabled category is desired with even odds; at least one always is.
fn draw_desired<R: Rng>(rng: &mut R, enabled: SpotCategorySet) -> SpotCategorySet {
    let mut desired = SpotCategorySet::EMPTY;
    for category in enabled.iter() {
        if rng.random_bool(0.5) {
            desired.insert(category);
        }
    }
    if desired.is_empty() {
        desired = enabled
            .iter()
            .next()
            .map_or(desired, |first| SpotCategorySet::of(&[first]));
    }
    desired
}

/// Pick a world cell no other agent occupies.
fn place<R: Rng>(
    rng: &mut R,
    config: &RandomGenerationConfig,
    taken: &mut BTreeSet<Position>,
) -> Result<Position, EngineError> {
    let width = coordinate_limit(config.world_width)?;
    let height = coordinate_limit(config.world_height)?;

    for _ in 0..MAX_PLACEMENT_ATTEMPTS {
        let candidate = Position::new(rng.random_range(0..width), rng.random_range(0..height));
        if taken.insert(candidate) {
            return Ok(candidate);
        }
    }

    // Crowded world: take the first free cell.
    let free = (0..height)
        .flat_map(|y| (0..width).map(move |x| Position::new(x, y)))
        .find(|cell| !taken.contains(cell));
    let Some(cell) = free else {
        return Err(EngineError::Spawner {
            message: format!("no free cell left in a {width}x{height} world"),
        });
    };
    taken.insert(cell);
    Ok(cell)
}

fn coordinate_limit(size: u32) -> Result<i32, EngineError> {
    if size == 0 {
        return Err(EngineError::Spawner {
            message: String::from("world has no cells"),
        });
    }
    i32::try_from(size).map_err(|e| EngineError::Spawner {
        message: format!("world size {size} does not fit a coordinate: {e}"),
    })
}

/// Split `total` spots across the `supported` categories.
///
/// Percentages of unsupported categories are shared evenly among the
/// supported ones, each count is rounded half up, and any rounding excess
/// is taken back from the categories in Regular, Luxury, Handicap order so
/// the counts never add up to more than `total`.
pub fn split_capacity(
    total: u32,
    percent: SpotPercentages,
    supported: SpotCategorySet,
) -> SpotCounts {
    let share = |category: SpotCategory| match category {
        SpotCategory::Regular => u64::from(percent.regular),
        SpotCategory::Luxury => u64::from(percent.luxury),
        SpotCategory::Handicap => u64::from(percent.handicap),
    };
    let mut counts = SpotCounts::default();
    let Ok(supported_count) = u64::try_from(supported.len()) else {
        return counts;
    };
    if supported_count == 0 {
        return counts;
    }

    let unsupported: u64 = SpotCategory::ALL
        .into_iter()
        .filter(|&category| !supported.contains(category))
        .map(share)
        .sum();
    // count = total * (pct + unsupported / k) / 100, kept in integers.
    let denominator = supported_count.saturating_mul(100);
    for category in supported.iter() {
        let numerator = u64::from(total).saturating_mul(
            share(category)
                .saturating_mul(supported_count)
                .saturating_add(unsupported),
        );
        let rounded = numerator
            .saturating_mul(2)
            .saturating_add(denominator)
            .checked_div(denominator.saturating_mul(2))
            .unwrap_or(0);
        *counts.get_mut(category) = u32::try_from(rounded).unwrap_or(u32::MAX);
    }

    let mut excess = counts.total().unwrap_or(u32::MAX).saturating_sub(total);
    for category in SpotCategory::ALL {
        if excess == 0 {
            break;
        }
        let count = counts.get_mut(category);
        let cut = excess.min(*count);
        *count = count.saturating_sub(cut);
        excess = excess.saturating_sub(cut);
    }
    counts
}

// -----------------------------------------------------------------------
// Fixed mode
// -----------------------------------------------------------------------

/// Convert the explicit entries into records.
pub fn fixed_records(
    config: &GenerationConfig,
) -> Result<(Vec<CarRecord>, Vec<LotRecord>), EngineError> {
    let mut taken: BTreeSet<Position> = BTreeSet::new();
    let mut claim = |position: Position, name: &str| {
        if taken.insert(position) {
            Ok(position)
        } else {
            Err(EngineError::Spawner {
                message: format!("{name} at {position} overlaps another agent"),
            })
        }
    };

    let mut cars = Vec::with_capacity(config.cars.len());
    for (i, entry) in config.cars.iter().enumerate() {
        let name = format!("car-{i}");
        let desired = parse_flags(&format!("generation.cars[{i}].desired"), &entry.desired)?;
        cars.push(CarRecord {
            id: CarId::new(),
            position: claim(Position::new(entry.x, entry.y), &name)?,
            name,
            max_hourly_cost: entry.max_hourly_cost,
            max_distance: entry.max_distance,
            hours_needed: entry.hours_needed,
            desired,
            policy: entry.policy,
        });
    }

    let mut lots = Vec::with_capacity(config.lots.len());
    for (i, entry) in config.lots.iter().enumerate() {
        let name = format!("lot-{i}");
        let supported = parse_flags(&format!("generation.lots[{i}].spots"), &entry.spots)?;
        lots.push(LotRecord {
            id: LotId::new(),
            position: claim(Position::new(entry.x, entry.y), &name)?,
            name,
            hourly_cost: entry.hourly_cost,
            luxury_cost_percent: entry.luxury_cost_percent,
            supported,
            capacity: SpotCounts::new(entry.regular, entry.luxury, entry.handicap),
        });
    }

    Ok((cars, lots))
}
