//! Corrida Geo - Geospatial Driver Index
//!
//! Tracks each online driver's last known position and answers
//! "drivers within radius R of point P" queries.
//!
//! Positions are bucketed by H3 cell (resolution 9, ~240 m cells).
//! A radius query covers the search disk with `grid_disk`, collects the
//! bucket members, then filters and ranks precisely by haversine
//! distance. Presence records are overwritten on every ping and treated
//! as offline once older than the staleness window.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use h3o::{CellIndex, LatLng, Resolution};
use tracing::debug;

use corrida_types::{CoreError, DriverId, GeoPoint, Result, RideCategory};

/// Approximate distance between adjacent resolution-9 cell centers, in km.
/// Used to size the `grid_disk` ring that covers a query radius.
const CELL_SPACING_KM: f64 = 0.3;

/// Driver index configuration
#[derive(Debug, Clone)]
pub struct GeoConfig {
    /// H3 resolution for presence buckets
    pub resolution: Resolution,
    /// Presence older than this is treated as offline
    pub staleness: Duration,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            resolution: Resolution::Nine,
            staleness: Duration::seconds(30),
        }
    }
}

/// Last known state of an online driver
#[derive(Debug, Clone)]
pub struct DriverPresence {
    pub driver_id: DriverId,
    pub position: GeoPoint,
    pub heading: Option<f64>,
    pub category: RideCategory,
    pub updated_at: DateTime<Utc>,
    cell: CellIndex,
}

/// One row of a radius query result, distance-ranked
#[derive(Debug, Clone, serde::Serialize)]
pub struct NearbyDriver {
    pub driver_id: DriverId,
    pub position: GeoPoint,
    pub heading: Option<f64>,
    pub category: RideCategory,
    pub distance_km: f64,
}

/// The geospatial driver index
///
/// Thread-safe; every operation touches only the affected driver's entry
/// and its cell bucket.
pub struct DriverIndex {
    config: GeoConfig,
    presences: DashMap<DriverId, DriverPresence>,
    cells: DashMap<CellIndex, Vec<DriverId>>,
}

impl DriverIndex {
    pub fn new(config: GeoConfig) -> Self {
        Self {
            config,
            presences: DashMap::new(),
            cells: DashMap::new(),
        }
    }

    fn cell_for(&self, point: &GeoPoint) -> Result<CellIndex> {
        point.validate("position")?;
        let latlng = LatLng::new(point.latitude, point.longitude).map_err(|e| {
            CoreError::invalid_input("position", format!("invalid coordinates: {e}"))
        })?;
        Ok(latlng.to_cell(self.config.resolution))
    }

    fn remove_from_cell(&self, driver: DriverId, cell: CellIndex) {
        if let Some(mut bucket) = self.cells.get_mut(&cell) {
            bucket.retain(|&d| d != driver);
            let empty = bucket.is_empty();
            drop(bucket);
            if empty {
                self.cells.remove_if(&cell, |_, b| b.is_empty());
            }
        }
    }

    fn insert_into_cell(&self, driver: DriverId, cell: CellIndex) {
        let mut bucket = self.cells.entry(cell).or_default();
        if !bucket.contains(&driver) {
            bucket.push(driver);
        }
    }

    /// Bring a driver online at the given position, serving one category.
    pub fn set_online(
        &self,
        driver: DriverId,
        position: GeoPoint,
        heading: Option<f64>,
        category: RideCategory,
    ) -> Result<()> {
        let cell = self.cell_for(&position)?;
        let previous_cell = self.presences.get(&driver).map(|p| p.cell);
        if let Some(prev) = previous_cell {
            if prev != cell {
                self.remove_from_cell(driver, prev);
            }
        }
        self.presences.insert(
            driver,
            DriverPresence {
                driver_id: driver,
                position,
                heading,
                category,
                updated_at: Utc::now(),
                cell,
            },
        );
        self.insert_into_cell(driver, cell);
        debug!(driver = %driver, %position, %category, "driver online");
        Ok(())
    }

    /// Overwrite a driver's position on a location ping.
    ///
    /// The driver must already be online.
    pub fn update_location(
        &self,
        driver: DriverId,
        position: GeoPoint,
        heading: Option<f64>,
    ) -> Result<DriverPresence> {
        let cell = self.cell_for(&position)?;
        let mut entry = self
            .presences
            .get_mut(&driver)
            .ok_or_else(|| CoreError::not_found("driver presence", driver))?;
        let previous_cell = entry.cell;
        entry.position = position;
        entry.heading = heading;
        entry.updated_at = Utc::now();
        entry.cell = cell;
        let updated = entry.clone();
        drop(entry);

        if previous_cell != cell {
            self.remove_from_cell(driver, previous_cell);
            self.insert_into_cell(driver, cell);
        }
        Ok(updated)
    }

    /// Take a driver offline and drop their presence record.
    pub fn set_offline(&self, driver: DriverId) {
        if let Some((_, presence)) = self.presences.remove(&driver) {
            self.remove_from_cell(driver, presence.cell);
            debug!(driver = %driver, "driver offline");
        }
    }

    pub fn is_online(&self, driver: DriverId) -> bool {
        self.presences.contains_key(&driver)
    }

    pub fn presence(&self, driver: DriverId) -> Option<DriverPresence> {
        self.presences.get(&driver).map(|p| p.clone())
    }

    /// Number of drivers currently online
    pub fn online_count(&self) -> usize {
        self.presences.len()
    }

    /// Drivers within `radius_km` of `point`, freshest-presence only,
    /// optionally category-filtered, ranked by distance.
    pub fn nearby(
        &self,
        point: &GeoPoint,
        radius_km: f64,
        category: Option<RideCategory>,
        limit: usize,
    ) -> Result<Vec<NearbyDriver>> {
        if !radius_km.is_finite() || radius_km <= 0.0 {
            return Err(CoreError::invalid_input(
                "radius",
                format!("radius {radius_km} must be positive"),
            ));
        }
        let origin = self.cell_for(point)?;
        let k = (radius_km / CELL_SPACING_KM).ceil() as u32 + 1;
        let disk: Vec<CellIndex> = origin.grid_disk::<Vec<_>>(k);

        let cutoff = Utc::now() - self.config.staleness;
        let mut found = Vec::new();
        for cell in disk {
            let Some(bucket) = self.cells.get(&cell) else {
                continue;
            };
            for &driver in bucket.iter() {
                let Some(presence) = self.presences.get(&driver) else {
                    continue;
                };
                if presence.updated_at < cutoff {
                    continue;
                }
                if let Some(wanted) = category {
                    if presence.category != wanted {
                        continue;
                    }
                }
                let distance_km = point.haversine_km(&presence.position);
                if distance_km <= radius_km {
                    found.push(NearbyDriver {
                        driver_id: driver,
                        position: presence.position,
                        heading: presence.heading,
                        category: presence.category,
                        distance_km,
                    });
                }
            }
        }

        found.sort_by(|a, b| {
            a.distance_km
                .partial_cmp(&b.distance_km)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        found.truncate(limit);
        debug!(
            %point,
            radius_km,
            count = found.len(),
            "nearby driver query"
        );
        Ok(found)
    }

    /// Drop presences that have gone silent past the staleness window.
    ///
    /// Runs from a periodic sweep, not from request paths.
    pub fn purge_stale(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.config.staleness;
        let stale: Vec<DriverId> = self
            .presences
            .iter()
            .filter(|p| p.updated_at < cutoff)
            .map(|p| p.driver_id)
            .collect();
        for driver in &stale {
            self.set_offline(*driver);
        }
        if !stale.is_empty() {
            debug!(count = stale.len(), "purged stale driver presences");
        }
        stale.len()
    }
}

impl Default for DriverIndex {
    fn default() -> Self {
        Self::new(GeoConfig::default())
    }
}
