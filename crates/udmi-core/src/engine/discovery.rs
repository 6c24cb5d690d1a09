//! Discovery scheduler
//!
//! Per-family state machine scheduling, rescheduling and cancelling
//! discovery scans from the `generation` anchor and interval in config.
//!
//! The scheduler performs no I/O. Each operation mutates the discovery
//! block of the state and reports which timers to arm and whether the
//! state changed; the device runtime arms the timers and publishes.
//!
//! ## Phases
//!
//! ```text
//!            schedule               timer fires            scan done
//! STOPPED ─────────────▶ PENDING ─────────────────▶ ACTIVE ───────────▶ STOPPED
//!    ▲                      │  (phase and generation     │                │
//!    └──── cancel ──────────┘   must still match)        │   periodic:    │
//!                                                        │   reschedule ──┘
//! ```
//!
//! A timer armed for a superseded generation finds a different phase or
//! generation when it fires and does nothing.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;

use crate::model::config::{DiscoveryConfig, FamilyDiscoveryConfig, ScanDepth};
use crate::model::entry::{Entry, Level, category};
use crate::model::state::{DiscoveryPhase, DiscoveryState, FamilyDiscoveryState};

/// A scan timer to arm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArmedScan {
    pub family: String,
    pub generation: DateTime<Utc>,
}

/// A scan to start now
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    pub family: String,
    pub generation: DateTime<Utc>,
    pub depth: Option<ScanDepth>,
}

/// What a scheduler operation asks the runtime to do
#[derive(Debug, Default, PartialEq)]
pub struct DiscoveryUpdate {
    pub timers: Vec<ArmedScan>,
    /// Families stopped or removed; their armed timers can be aborted
    pub cancelled: Vec<String>,
    pub state_changed: bool,
    pub entries: Vec<Entry>,
}

impl DiscoveryUpdate {
    fn merge(&mut self, other: DiscoveryUpdate) {
        self.timers.extend(other.timers);
        self.cancelled.extend(other.cancelled);
        self.state_changed |= other.state_changed;
        self.entries.extend(other.entries);
    }

    fn changed() -> Self {
        Self {
            state_changed: true,
            ..Self::default()
        }
    }
}

/// Next instant at or after `now` congruent with `generation` modulo `interval_sec`
///
/// Computed in milliseconds with a non-negative modulo, so the result is
/// exactly phase-aligned and less than one interval away.
pub fn aligned_generation(
    generation: DateTime<Utc>,
    now: DateTime<Utc>,
    interval_sec: i64,
) -> DateTime<Utc> {
    let interval_ms = interval_sec.max(1) * 1000;
    let delta_ms = (generation.timestamp_millis() - now.timestamp_millis()).rem_euclid(interval_ms);
    let start = DateTime::from_timestamp_millis(now.timestamp_millis() + delta_ms).unwrap_or(now);
    // `now` may carry sub-millisecond precision that the aligned instant lacks
    if start < now {
        start + Duration::milliseconds(interval_ms)
    } else {
        start
    }
}

pub struct DiscoveryScheduler {
    device_start: DateTime<Utc>,
    configs: BTreeMap<String, FamilyDiscoveryConfig>,
}

impl DiscoveryScheduler {
    pub fn new(device_start: DateTime<Utc>) -> Self {
        Self {
            device_start,
            configs: BTreeMap::new(),
        }
    }

    /// Apply the discovery block of a config
    ///
    /// Families no longer configured are cancelled and removed; every
    /// configured family is (re)scheduled.
    pub fn update_discovery_scan(
        &mut self,
        config: Option<&DiscoveryConfig>,
        state: &mut Option<DiscoveryState>,
        now: DateTime<Utc>,
    ) -> DiscoveryUpdate {
        self.configs = config.map(|c| c.families.clone()).unwrap_or_default();
        let mut update = DiscoveryUpdate::default();

        let discovery = state.get_or_insert_with(DiscoveryState::default);

        let removed: Vec<String> = discovery
            .families
            .keys()
            .filter(|family| !self.configs.contains_key(*family))
            .cloned()
            .collect();
        for family in removed {
            Self::cancel_discovery_scan(&family, None, discovery);
            discovery.families.remove(&family);
            tracing::debug!("Discovery family {} removed", family);
            update.state_changed = true;
            update.cancelled.push(family);
        }

        let families: Vec<String> = self.configs.keys().cloned().collect();
        for family in families {
            update.merge(self.schedule_discovery_scan(&family, discovery, now));
        }

        if discovery.families.is_empty() {
            *state = None;
        }
        update
    }

    /// (Re)schedule one family from its config
    pub fn schedule_discovery_scan(
        &mut self,
        family: &str,
        discovery: &mut DiscoveryState,
        now: DateTime<Utc>,
    ) -> DiscoveryUpdate {
        let config = self.configs.get(family).cloned().unwrap_or_default();
        let interval = config.scan_interval_sec.unwrap_or(0);

        if interval < 0 {
            return Self::reject(
                family,
                discovery,
                format!("Negative scan_interval_sec {} for family {}", interval, family),
            );
        }
        if let Some(generation) = config.generation {
            if generation.timestamp_millis() <= 0 {
                return Self::reject(
                    family,
                    discovery,
                    format!(
                        "Generation {} for family {} is not after the epoch",
                        generation.to_rfc3339(),
                        family
                    ),
                );
            }
        }

        if config.generation.is_none() && interval == 0 {
            let changed = Self::cancel_discovery_scan(family, None, discovery);
            return DiscoveryUpdate {
                cancelled: vec![family.to_string()],
                state_changed: changed,
                ..DiscoveryUpdate::default()
            };
        }

        let raw_generation = config.generation.unwrap_or(self.device_start);
        let recorded = discovery.families.get(family).and_then(|s| s.generation);

        // A running scan keeps its generation; completion reschedules periodic families
        let active = discovery
            .families
            .get(family)
            .is_some_and(|s| s.phase == DiscoveryPhase::Active);
        if active && (interval > 0 || recorded == Some(raw_generation)) {
            return DiscoveryUpdate::default();
        }

        let start = if interval > 0 {
            aligned_generation(raw_generation, now, interval)
        } else if recorded.is_some_and(|recorded| raw_generation < recorded) {
            tracing::debug!("Ignoring stale discovery generation for family {}", family);
            let changed = Self::cancel_discovery_scan(family, Some(raw_generation), discovery);
            return DiscoveryUpdate {
                cancelled: vec![family.to_string()],
                state_changed: changed,
                ..DiscoveryUpdate::default()
            };
        } else {
            raw_generation
        };

        if recorded == Some(start) {
            return DiscoveryUpdate::default();
        }

        let family_state = discovery
            .families
            .entry(family.to_string())
            .or_insert_with(|| FamilyDiscoveryState {
                phase: DiscoveryPhase::Stopped,
                generation: None,
                active_count: None,
                status: None,
            });
        family_state.phase = DiscoveryPhase::Pending;
        family_state.generation = Some(start);
        family_state.status = None;

        tracing::debug!("Discovery family {} scheduled for {}", family, start.to_rfc3339());
        DiscoveryUpdate {
            timers: vec![ArmedScan {
                family: family.to_string(),
                generation: start,
            }],
            ..DiscoveryUpdate::changed()
        }
    }

    /// Check a fired timer; returns the scan to start if it is still current
    pub fn check_discovery_scan(
        &self,
        family: &str,
        generation: DateTime<Utc>,
        state: &mut Option<DiscoveryState>,
    ) -> Option<ScanRequest> {
        let family_state = state.as_mut()?.families.get_mut(family)?;
        if family_state.phase != DiscoveryPhase::Pending
            || family_state.generation != Some(generation)
        {
            return None;
        }
        family_state.phase = DiscoveryPhase::Active;
        Some(ScanRequest {
            family: family.to_string(),
            generation,
            depth: self.configs.get(family).and_then(|c| c.depth),
        })
    }

    /// Record the end of a scan and schedule the next one for periodic families
    ///
    /// `outcome` is the number of devices found, or the entry describing
    /// why the scan failed. Ignored if the family moved on meanwhile.
    pub fn complete_discovery_scan(
        &mut self,
        family: &str,
        generation: DateTime<Utc>,
        outcome: Result<usize, Entry>,
        state: &mut Option<DiscoveryState>,
        now: DateTime<Utc>,
    ) -> DiscoveryUpdate {
        let Some(discovery) = state.as_mut() else {
            return DiscoveryUpdate::default();
        };
        let Some(family_state) = discovery.families.get_mut(family) else {
            return DiscoveryUpdate::default();
        };
        if family_state.phase != DiscoveryPhase::Active
            || family_state.generation != Some(generation)
        {
            return DiscoveryUpdate::default();
        }

        let mut update = DiscoveryUpdate::changed();
        family_state.phase = DiscoveryPhase::Stopped;
        match outcome {
            Ok(count) => {
                family_state.active_count = Some(u32::try_from(count).unwrap_or(u32::MAX));
                family_state.status = None;
            }
            Err(entry) => {
                family_state.status = Some(entry.clone());
                update.entries.push(entry);
            }
        }

        let periodic = self
            .configs
            .get(family)
            .and_then(|c| c.scan_interval_sec)
            .is_some_and(|interval| interval > 0);
        if periodic {
            let after = now.max(generation + Duration::milliseconds(1));
            update.merge(self.schedule_discovery_scan(family, discovery, after));
        }
        update
    }

    /// Stop a family, recording `generation` as given
    ///
    /// Returns whether the state changed.
    pub fn cancel_discovery_scan(
        family: &str,
        generation: Option<DateTime<Utc>>,
        discovery: &mut DiscoveryState,
    ) -> bool {
        let family_state = discovery
            .families
            .entry(family.to_string())
            .or_insert_with(|| FamilyDiscoveryState {
                phase: DiscoveryPhase::Pending,
                generation: None,
                active_count: None,
                status: None,
            });
        let changed =
            family_state.phase != DiscoveryPhase::Stopped || family_state.generation != generation;
        family_state.phase = DiscoveryPhase::Stopped;
        family_state.generation = generation;
        changed
    }

    fn reject(family: &str, discovery: &mut DiscoveryState, message: String) -> DiscoveryUpdate {
        let entry = Entry::new(Level::Error, category::DISCOVERY_FAMILY_CONFIG, message);
        Self::cancel_discovery_scan(family, None, discovery);
        if let Some(family_state) = discovery.families.get_mut(family) {
            family_state.status = Some(entry.clone());
        }
        DiscoveryUpdate {
            cancelled: vec![family.to_string()],
            entries: vec![entry],
            ..DiscoveryUpdate::changed()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    fn discovery_config(family: &str, config: FamilyDiscoveryConfig) -> DiscoveryConfig {
        DiscoveryConfig {
            families: BTreeMap::from([(family.to_string(), config)]),
        }
    }

    fn family(generation: Option<DateTime<Utc>>, interval: Option<i64>) -> FamilyDiscoveryConfig {
        FamilyDiscoveryConfig {
            generation,
            scan_interval_sec: interval,
            depth: None,
        }
    }

    fn phase(state: &Option<DiscoveryState>, family: &str) -> DiscoveryPhase {
        state.as_ref().unwrap().families[family].phase
    }

    #[test]
    fn test_alignment_property() {
        let generation = at(9, 3, 17);
        let interval = 600;
        for offset_ms in [0_i64, 1, 999, 59_999, 600_000, 1_234_567, 86_400_000] {
            let now = at(10, 0, 0) + Duration::milliseconds(offset_ms);
            let start = aligned_generation(generation, now, interval);
            assert!(start >= now);
            assert!(start - now < Duration::seconds(interval));
            assert_eq!(
                (start - generation).num_milliseconds().rem_euclid(interval * 1000),
                0
            );
        }
    }

    #[test]
    fn test_alignment_with_future_generation() {
        let now = at(10, 0, 0);
        let generation = at(12, 5, 0);
        let start = aligned_generation(generation, now, 600);
        assert_eq!(start, at(10, 5, 0));
    }

    #[test]
    fn test_idempotent_rescheduling() {
        let mut scheduler = DiscoveryScheduler::new(at(9, 0, 0));
        let config = discovery_config("vendor", family(Some(at(9, 3, 0)), Some(600)));
        let mut state = None;

        let first = scheduler.update_discovery_scan(Some(&config), &mut state, at(10, 0, 0));
        assert_eq!(first.timers.len(), 1);
        assert!(first.state_changed);
        assert_eq!(first.timers[0].generation, at(10, 3, 0));

        let second = scheduler.update_discovery_scan(Some(&config), &mut state, at(10, 0, 5));
        assert!(second.timers.is_empty(), "same schedule must not arm a second timer");
        assert!(!second.state_changed, "same schedule must not publish state");
        assert_eq!(phase(&state, "vendor"), DiscoveryPhase::Pending);
    }

    #[test]
    fn test_no_generation_and_no_interval_stops() {
        let mut scheduler = DiscoveryScheduler::new(at(9, 0, 0));
        let config = discovery_config("vendor", family(None, None));
        let mut state = None;

        let update = scheduler.update_discovery_scan(Some(&config), &mut state, at(10, 0, 0));
        assert!(update.timers.is_empty());
        assert_eq!(phase(&state, "vendor"), DiscoveryPhase::Stopped);
        assert_eq!(state.as_ref().unwrap().families["vendor"].generation, None);
    }

    #[test]
    fn test_stale_one_shot_is_cancelled() {
        let mut scheduler = DiscoveryScheduler::new(at(9, 0, 0));
        let mut state = None;

        let newer = discovery_config("vendor", family(Some(at(11, 0, 0)), None));
        let update = scheduler.update_discovery_scan(Some(&newer), &mut state, at(10, 0, 0));
        assert_eq!(update.timers.len(), 1);

        let older = discovery_config("vendor", family(Some(at(10, 30, 0)), None));
        let update = scheduler.update_discovery_scan(Some(&older), &mut state, at(10, 0, 0));
        assert!(update.timers.is_empty());
        let family_state = &state.as_ref().unwrap().families["vendor"];
        assert_eq!(family_state.phase, DiscoveryPhase::Stopped);
        assert_eq!(family_state.generation, Some(at(10, 30, 0)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut scheduler = DiscoveryScheduler::new(at(9, 0, 0));
        let mut state = None;

        let negative = discovery_config("vendor", family(None, Some(-5)));
        let update = scheduler.update_discovery_scan(Some(&negative), &mut state, at(10, 0, 0));
        assert!(update.timers.is_empty());
        assert_eq!(update.entries.len(), 1);
        assert_eq!(update.entries[0].category, category::DISCOVERY_FAMILY_CONFIG);
        assert_eq!(phase(&state, "vendor"), DiscoveryPhase::Stopped);

        let epoch = discovery_config("vendor", family(Some(DateTime::UNIX_EPOCH), Some(60)));
        let update = scheduler.update_discovery_scan(Some(&epoch), &mut state, at(10, 0, 0));
        assert_eq!(update.entries.len(), 1);
    }

    #[test]
    fn test_removed_family_is_dropped() {
        let mut scheduler = DiscoveryScheduler::new(at(9, 0, 0));
        let mut state = None;
        let config = discovery_config("vendor", family(Some(at(11, 0, 0)), None));
        scheduler.update_discovery_scan(Some(&config), &mut state, at(10, 0, 0));
        assert!(state.is_some());

        let update = scheduler.update_discovery_scan(None, &mut state, at(10, 0, 0));
        assert!(update.state_changed);
        assert!(state.is_none());
    }

    #[test]
    fn test_fire_checks_phase_and_generation() {
        let mut scheduler = DiscoveryScheduler::new(at(9, 0, 0));
        let mut state = None;
        let config = discovery_config("vendor", family(Some(at(11, 0, 0)), None));
        scheduler.update_discovery_scan(Some(&config), &mut state, at(10, 0, 0));

        // Superseded generation is a no-op
        assert!(
            scheduler
                .check_discovery_scan("vendor", at(10, 59, 0), &mut state)
                .is_none()
        );

        let request = scheduler
            .check_discovery_scan("vendor", at(11, 0, 0), &mut state)
            .unwrap();
        assert_eq!(request.family, "vendor");
        assert_eq!(phase(&state, "vendor"), DiscoveryPhase::Active);

        // Already active: a duplicate fire does nothing
        assert!(
            scheduler
                .check_discovery_scan("vendor", at(11, 0, 0), &mut state)
                .is_none()
        );
    }

    #[test]
    fn test_periodic_completion_reschedules() {
        let mut scheduler = DiscoveryScheduler::new(at(9, 0, 0));
        let mut state = None;
        let config = discovery_config("vendor", family(Some(at(9, 0, 0)), Some(600)));
        let update = scheduler.update_discovery_scan(Some(&config), &mut state, at(10, 0, 0));
        assert_eq!(update.timers[0].generation, at(10, 0, 0));

        scheduler.check_discovery_scan("vendor", at(10, 0, 0), &mut state);
        let update = scheduler.complete_discovery_scan(
            "vendor",
            at(10, 0, 0),
            Ok(3),
            &mut state,
            at(10, 0, 0),
        );
        assert_eq!(update.timers.len(), 1);
        assert_eq!(update.timers[0].generation, at(10, 10, 0));
        let family_state = &state.as_ref().unwrap().families["vendor"];
        assert_eq!(family_state.phase, DiscoveryPhase::Pending);
        assert_eq!(family_state.active_count, Some(3));
    }

    #[test]
    fn test_redelivery_during_scan_keeps_result() {
        let mut scheduler = DiscoveryScheduler::new(at(9, 0, 0));
        let mut state = None;
        let config = discovery_config("vendor", family(Some(at(10, 0, 0)), Some(600)));
        scheduler.update_discovery_scan(Some(&config), &mut state, at(10, 0, 0));
        scheduler
            .check_discovery_scan("vendor", at(10, 0, 0), &mut state)
            .unwrap();

        let redelivered = scheduler.update_discovery_scan(Some(&config), &mut state, at(10, 0, 5));
        assert!(redelivered.timers.is_empty());
        assert!(!redelivered.state_changed);
        assert_eq!(phase(&state, "vendor"), DiscoveryPhase::Active);

        let update = scheduler.complete_discovery_scan(
            "vendor",
            at(10, 0, 0),
            Ok(3),
            &mut state,
            at(10, 0, 10),
        );
        assert!(update.state_changed);
        assert_eq!(update.timers.len(), 1);
        assert_eq!(update.timers[0].generation, at(10, 10, 0));
        let family_state = &state.as_ref().unwrap().families["vendor"];
        assert_eq!(family_state.active_count, Some(3));
        assert_eq!(family_state.phase, DiscoveryPhase::Pending);
    }

    #[test]
    fn test_cancelled_families_reported() {
        let mut scheduler = DiscoveryScheduler::new(at(9, 0, 0));
        let mut state = None;
        let config = DiscoveryConfig {
            families: BTreeMap::from([
                ("vendor".to_string(), family(Some(at(11, 0, 0)), None)),
                ("bacnet".to_string(), family(Some(at(11, 0, 0)), None)),
            ]),
        };
        let update = scheduler.update_discovery_scan(Some(&config), &mut state, at(10, 0, 0));
        assert!(update.cancelled.is_empty());

        let stopped = discovery_config("vendor", family(None, None));
        let update = scheduler.update_discovery_scan(Some(&stopped), &mut state, at(10, 0, 0));
        assert_eq!(update.cancelled, vec!["bacnet".to_string(), "vendor".to_string()]);
    }

    #[test]
    fn test_one_shot_completion_stops() {
        let mut scheduler = DiscoveryScheduler::new(at(9, 0, 0));
        let mut state = None;
        let config = discovery_config("vendor", family(Some(at(10, 0, 0)), None));
        scheduler.update_discovery_scan(Some(&config), &mut state, at(10, 0, 0));
        scheduler.check_discovery_scan("vendor", at(10, 0, 0), &mut state);

        let failure = Entry::new(Level::Error, category::DISCOVERY_FAMILY_SCAN, "boom");
        let update = scheduler.complete_discovery_scan(
            "vendor",
            at(10, 0, 0),
            Err(failure),
            &mut state,
            at(10, 0, 1),
        );
        assert!(update.timers.is_empty());
        assert_eq!(update.entries.len(), 1);
        assert_eq!(phase(&state, "vendor"), DiscoveryPhase::Stopped);

        // Re-sending the same one-shot config does not scan again
        let update = scheduler.update_discovery_scan(Some(&config), &mut state, at(10, 0, 2));
        assert!(update.timers.is_empty());
    }
}
