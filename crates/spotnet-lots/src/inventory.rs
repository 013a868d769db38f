//! Per-lot spot inventory with checked counters.
//!
//! A [`SpotInventory`] tracks, for each category, how many spots are free
//! and which cars hold the others. Every mutation re-verifies
//! `available + occupied == capacity` per category, in the same spirit as
//! the market-wide audit the runner performs at shutdown. A violation is
//! reported, never silently corrected.

use std::collections::BTreeMap;

use chrono::Utc;
use spotnet_types::{Allocation, CarId, LotId, LotRecord, SpotCategory, SpotCategorySet, SpotCounts};

use crate::error::InventoryError;

/// Free and occupied spots of one lot.
#[derive(Debug, Clone)]
pub struct SpotInventory {
    lot_id: LotId,
    capacity: SpotCounts,
    available: SpotCounts,
    occupied: BTreeMap<CarId, Allocation>,
}

impl SpotInventory {
    /// Start with every spot of the lot free.
    ///
    /// Categories the lot does not support start (and stay) at zero even
    /// if the record carries a stray count for them.
    pub fn new(lot: &LotRecord) -> Self {
        let mut capacity = SpotCounts::default();
        for category in lot.supported.iter() {
            *capacity.get_mut(category) = lot.capacity.get(category);
        }
        Self {
            lot_id: lot.id,
            capacity,
            available: capacity,
            occupied: BTreeMap::new(),
        }
    }

    /// The lot this inventory belongs to.
    pub const fn lot_id(&self) -> LotId {
        self.lot_id
    }

    /// Starting spots per category.
    pub const fn capacity(&self) -> SpotCounts {
        self.capacity
    }

    /// Free spots per category.
    pub const fn available(&self) -> SpotCounts {
        self.available
    }

    /// Categories with at least one free spot.
    pub const fn vacant_categories(&self) -> SpotCategorySet {
        self.available.nonzero()
    }

    /// Categories in `desired` with at least one free spot.
    pub const fn vacancies_for(&self, desired: SpotCategorySet) -> SpotCategorySet {
        self.vacant_categories().intersection(desired)
    }

    /// Number of cars currently parked in `category`.
    pub fn occupied_count(&self, category: SpotCategory) -> usize {
        self.occupied
            .values()
            .filter(|allocation| allocation.category == category)
            .count()
    }

    /// Number of cars currently parked in any category.
    pub fn occupant_count(&self) -> usize {
        self.occupied.len()
    }

    /// Whether every spot is free again.
    pub fn is_fully_vacant(&self) -> bool {
        self.occupied.is_empty() && self.available == self.capacity
    }

    /// Grant one spot of `category` to `car_id` for `hours`.
    ///
    /// Fails with [`InventoryError::Exhausted`] when the category has no
    /// free spot. That error is an integrity violation: the caller only
    /// allocates after checking availability, so reaching it means two
    /// grants raced for one spot.
    pub fn allocate(
        &mut self,
        car_id: CarId,
        category: SpotCategory,
        hours: u32,
    ) -> Result<Allocation, InventoryError> {
        if self.occupied.contains_key(&car_id) {
            return Err(InventoryError::DuplicateOccupant {
                lot_id: self.lot_id,
                car_id,
            });
        }

        let lot_id = self.lot_id;
        let free = self.available.get_mut(category);
        *free = free
            .checked_sub(1)
            .ok_or(InventoryError::Exhausted { lot_id, category })?;

        let allocation = Allocation {
            car_id,
            lot_id,
            category,
            hours,
            granted_at: Utc::now(),
        };
        self.occupied.insert(car_id, allocation.clone());
        self.verify_conservation()?;
        Ok(allocation)
    }

    /// Return the spot held by `car_id`.
    pub fn release(&mut self, car_id: CarId) -> Result<Allocation, InventoryError> {
        let lot_id = self.lot_id;
        let allocation = self
            .occupied
            .remove(&car_id)
            .ok_or(InventoryError::UnknownOccupant { lot_id, car_id })?;

        let free = self.available.get_mut(allocation.category);
        *free = free
            .checked_add(1)
            .ok_or_else(|| InventoryError::ArithmeticOverflow {
                lot_id,
                context: format!("{} availability on release", allocation.category),
            })?;

        self.verify_conservation()?;
        Ok(allocation)
    }

    /// Check `available + occupied == capacity` for every category.
    pub fn verify_conservation(&self) -> Result<(), InventoryError> {
        for category in SpotCategory::ALL {
            let available = self.available.get(category);
            let capacity = self.capacity.get(category);
            let occupied = u32::try_from(self.occupied_count(category)).map_err(|e| {
                InventoryError::ArithmeticOverflow {
                    lot_id: self.lot_id,
                    context: format!("{category} occupant count: {e}"),
                }
            })?;
            let accounted =
                available
                    .checked_add(occupied)
                    .ok_or_else(|| InventoryError::ArithmeticOverflow {
                        lot_id: self.lot_id,
                        context: format!("{category} conservation sum"),
                    })?;
            if accounted != capacity {
                return Err(InventoryError::ConservationViolated {
                    lot_id: self.lot_id,
                    category,
                    available,
                    occupied,
                    capacity,
                });
            }
        }
        Ok(())
    }
}
