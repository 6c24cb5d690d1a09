//! Pointset manager
//!
//! Keeps the device's points and their present values, applies
//! `set_value` overrides from config and produces telemetry events.

use chrono::Utc;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::model::config::PointsetConfig;
use crate::model::entry::{Entry, Level, category};
use crate::model::events::{PointPointsetEvent, PointsetEvents};
use crate::model::state::{PointPointsetState, PointsetState, ValueState};

#[derive(Debug, Clone)]
struct Point {
    /// Value reported when no override is configured
    reading: serde_json::Value,
    present: serde_json::Value,
}

pub struct PointsetManager {
    points: BTreeMap<String, Point>,
    default_sample_rate: Duration,
    sample_rate: Duration,
}

impl PointsetManager {
    pub fn new(points: &BTreeMap<String, serde_json::Value>, default_sample_rate: Duration) -> Self {
        let points = points
            .iter()
            .map(|(name, value)| {
                let point = Point {
                    reading: value.clone(),
                    present: value.clone(),
                };
                (name.clone(), point)
            })
            .collect();
        Self {
            points,
            default_sample_rate,
            sample_rate: default_sample_rate,
        }
    }

    /// Current telemetry cadence
    pub fn sample_rate(&self) -> Duration {
        self.sample_rate
    }

    /// Update the local reading of a point; unknown points are ignored
    pub fn set_reading(&mut self, name: &str, value: serde_json::Value) -> bool {
        match self.points.get_mut(name) {
            Some(point) => {
                point.reading = value.clone();
                point.present = value;
                true
            }
            None => false,
        }
    }

    /// Apply the pointset block of a config
    ///
    /// Returns entries for configured points the device does not have.
    pub fn update_config(
        &mut self,
        config: Option<&PointsetConfig>,
        state: &mut Option<PointsetState>,
    ) -> Vec<Entry> {
        self.sample_rate = config
            .and_then(|c| c.sample_rate_sec)
            .filter(|secs| *secs > 0)
            .map(|secs| Duration::from_secs(u64::from(secs)))
            .unwrap_or(self.default_sample_rate);

        if self.points.is_empty() && config.is_none() {
            *state = None;
            return Vec::new();
        }

        let mut entries = Vec::new();
        let mut reported: BTreeMap<String, PointPointsetState> = self
            .points
            .keys()
            .map(|name| (name.clone(), PointPointsetState::default()))
            .collect();

        for point in self.points.values_mut() {
            point.present = point.reading.clone();
        }

        let configured = config.map(|c| &c.points);
        for (name, point_config) in configured.into_iter().flatten() {
            match self.points.get_mut(name) {
                Some(point) => {
                    if let Some(value) = &point_config.set_value {
                        point.present = value.clone();
                        if let Some(point_state) = reported.get_mut(name) {
                            point_state.value_state = Some(ValueState::Applied);
                        }
                    }
                }
                None => {
                    let entry = Entry::new(
                        Level::Error,
                        category::POINTSET_POINT_INVALID,
                        format!("Configured point {} does not exist", name),
                    );
                    reported.insert(
                        name.clone(),
                        PointPointsetState {
                            value_state: Some(ValueState::Invalid),
                            status: Some(entry.clone()),
                        },
                    );
                    entries.push(entry);
                }
            }
        }

        *state = Some(PointsetState { points: reported });
        entries
    }

    /// Telemetry event with every present value, if the device has points
    pub fn take_event(&self) -> Option<PointsetEvents> {
        if self.points.is_empty() {
            return None;
        }
        let points = self
            .points
            .iter()
            .map(|(name, point)| {
                let event = PointPointsetEvent {
                    present_value: point.present.clone(),
                };
                (name.clone(), event)
            })
            .collect();
        Some(PointsetEvents {
            version: None,
            timestamp: Utc::now(),
            points,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::PointPointsetConfig;
    use serde_json::json;

    fn manager() -> PointsetManager {
        let points = BTreeMap::from([
            ("supply_temp".to_string(), json!(21.5)),
            ("fan_speed".to_string(), json!(40)),
        ]);
        PointsetManager::new(&points, Duration::from_secs(10))
    }

    fn config(points: &[(&str, Option<serde_json::Value>)], rate: Option<u32>) -> PointsetConfig {
        PointsetConfig {
            sample_rate_sec: rate,
            points: points
                .iter()
                .map(|(name, value)| {
                    let point = PointPointsetConfig {
                        set_value: value.clone(),
                        point_ref: None,
                    };
                    (name.to_string(), point)
                })
                .collect(),
        }
    }

    #[test]
    fn test_set_value_applied_then_reverted() {
        let mut pointset = manager();
        let mut state = None;

        let entries =
            pointset.update_config(Some(&config(&[("fan_speed", Some(json!(80)))], Some(5))), &mut state);
        assert!(entries.is_empty());
        assert_eq!(pointset.sample_rate(), Duration::from_secs(5));
        let reported = state.as_ref().unwrap();
        assert_eq!(reported.points["fan_speed"].value_state, Some(ValueState::Applied));
        assert_eq!(reported.points["supply_temp"].value_state, None);
        assert_eq!(pointset.take_event().unwrap().points["fan_speed"].present_value, json!(80));

        pointset.update_config(Some(&config(&[], None)), &mut state);
        assert_eq!(pointset.sample_rate(), Duration::from_secs(10));
        assert_eq!(pointset.take_event().unwrap().points["fan_speed"].present_value, json!(40));
    }

    #[test]
    fn test_unknown_point_is_invalid() {
        let mut pointset = manager();
        let mut state = None;

        let entries =
            pointset.update_config(Some(&config(&[("damper", Some(json!(1)))], None)), &mut state);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].category, category::POINTSET_POINT_INVALID);
        let damper = &state.unwrap().points["damper"];
        assert_eq!(damper.value_state, Some(ValueState::Invalid));
        assert!(damper.status.is_some());
    }

    #[test]
    fn test_no_points_no_telemetry() {
        let mut pointset = PointsetManager::new(&BTreeMap::new(), Duration::from_secs(10));
        let mut state = Some(PointsetState::default());
        pointset.update_config(None, &mut state);
        assert!(state.is_none());
        assert!(pointset.take_event().is_none());
        assert!(!pointset.set_reading("anything", json!(1)));
    }
}
