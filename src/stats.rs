//! Process-lifetime detection statistics.
//!
//! Counters, a bounded recent-events window and a geolocation log live
//! behind one mutex so that a publish is observed whole or not at all.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::detect::Detection;
use crate::model::ModelType;

pub const DEFAULT_RECENT_CAPACITY: usize = 5;

/// A WGS84 coordinate attached to a processed unit.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(anyhow!("latitude {} out of range", latitude));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(anyhow!("longitude {} out of range", longitude));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }
}

/// One entry of the recent-events window.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionEvent {
    #[serde(rename = "Type")]
    pub category: String,
    /// Rounded to two decimals.
    #[serde(rename = "Confidence")]
    pub confidence: f64,
    #[serde(rename = "Model")]
    pub model: ModelType,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LocationEvent {
    pub event: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Consistent copy of the counters and the recent window.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    /// Keyed by display key, both models always present.
    pub counters: BTreeMap<String, u64>,
    /// Oldest first.
    pub recent: Vec<DetectionEvent>,
}

impl StatsSnapshot {
    pub fn count(&self, model: ModelType) -> u64 {
        self.counters.get(model.stats_key()).copied().unwrap_or(0)
    }
}

struct StatsState {
    counters: BTreeMap<ModelType, u64>,
    recent: VecDeque<DetectionEvent>,
    locations: VecDeque<LocationEvent>,
}

pub struct StatsAggregator {
    state: Mutex<StatsState>,
    recent_capacity: usize,
    max_locations: Option<usize>,
}

impl StatsAggregator {
    pub fn new(recent_capacity: usize, max_locations: Option<usize>) -> Self {
        let recent_capacity = recent_capacity.max(1);
        Self {
            state: Mutex::new(StatsState {
                counters: ModelType::ALL.iter().map(|m| (*m, 0)).collect(),
                recent: VecDeque::with_capacity(recent_capacity),
                locations: VecDeque::new(),
            }),
            recent_capacity,
            max_locations,
        }
    }

    pub fn recent_capacity(&self) -> usize {
        self.recent_capacity
    }

    /// Record the detections of one processed unit.
    pub fn publish(&self, model: ModelType, detections: &[Detection], location: Option<GeoPoint>) {
        let timestamp = now_secs();
        let mut state = self.lock();

        *state.counters.entry(model).or_insert(0) += detections.len() as u64;

        for det in detections {
            if state.recent.len() == self.recent_capacity {
                state.recent.pop_front();
            }
            state.recent.push_back(DetectionEvent {
                category: det.category.clone(),
                confidence: round2(det.confidence),
                model,
                timestamp,
                latitude: location.map(|p| p.latitude),
                longitude: location.map(|p| p.longitude),
            });

            if let Some(point) = location {
                if let Some(max) = self.max_locations {
                    if max == 0 {
                        continue;
                    }
                    while state.locations.len() >= max {
                        state.locations.pop_front();
                    }
                }
                state.locations.push_back(LocationEvent {
                    event: det.category.clone(),
                    latitude: point.latitude,
                    longitude: point.longitude,
                });
            }
        }

        log::debug!(
            "stats: {} +{} (total {})",
            model,
            detections.len(),
            state.counters.get(&model).copied().unwrap_or(0)
        );
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let state = self.lock();
        StatsSnapshot {
            counters: state
                .counters
                .iter()
                .map(|(model, count)| (model.stats_key().to_string(), *count))
                .collect(),
            recent: state.recent.iter().cloned().collect(),
        }
    }

    /// Copy of the geolocation log, oldest first.
    pub fn locations(&self) -> Vec<LocationEvent> {
        self.lock().locations.iter().cloned().collect()
    }

    // poisoning ignored: every publish leaves the state consistent
    fn lock(&self) -> MutexGuard<'_, StatsState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_RECENT_CAPACITY, None)
    }
}

fn round2(value: f32) -> f64 {
    (f64::from(value) * 100.0).round() / 100.0
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
