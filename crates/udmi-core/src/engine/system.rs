//! System lifecycle controller
//!
//! Owns the system block of the device state: operating mode, identity and
//! the log buffer. Decides restart/shutdown/terminate transitions from
//! config and filters outgoing log entries by severity.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;

use crate::config::{DeviceIdentity, DeviceOptions};
use crate::model::config::SystemConfig;
use crate::model::entry::{Entry, Level, category};
use crate::model::events::SystemEvents;
use crate::model::state::{HardwareState, SystemMode, SystemState};

/// Minimum level of entries sent out when config does not set one
pub const DEFAULT_MIN_LOG_LEVEL: Level = Level::Info;

pub struct SystemLifecycle {
    device_id: String,
    device_start: DateTime<Utc>,
    smoke_check: bool,
    fixed_log_level: Option<Level>,
    config: SystemConfig,
    /// Entries waiting for the next outgoing system event
    pending: Vec<Entry>,
    /// Always-on local log, bounded
    local_log: VecDeque<Entry>,
    local_log_capacity: usize,
    event_count: u64,
}

impl SystemLifecycle {
    pub fn new(
        device_id: impl Into<String>,
        device_start: DateTime<Utc>,
        options: &DeviceOptions,
        local_log_capacity: usize,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_start,
            smoke_check: options.smoke_check,
            fixed_log_level: options.fixed_log_level.map(Level::from_value),
            config: SystemConfig::default(),
            pending: Vec::new(),
            local_log: VecDeque::with_capacity(local_log_capacity.min(1024)),
            local_log_capacity,
            event_count: 0,
        }
    }

    /// Fill the identity and start fields of the system state
    pub fn initialize_state(
        &self,
        identity: &DeviceIdentity,
        restart_count: u32,
        state: &mut SystemState,
    ) {
        state.serial_no = identity.serial_no.clone();
        state.hardware = HardwareState {
            make: identity.make.clone(),
            model: identity.model.clone(),
        };
        state.software = identity.software.clone();
        state.operation.last_start = Some(self.device_start);
        state.operation.restart_count = restart_count;
    }

    pub fn update_config(&mut self, config: Option<&SystemConfig>) {
        self.config = config.cloned().unwrap_or_default();
    }

    /// Decide whether config forces a lifecycle transition
    ///
    /// Checks run in a fixed order and the last transition found wins, so
    /// the `last_start` checks take precedence over a configured restart.
    pub fn maybe_restart_system(&mut self, state: &mut SystemState) -> Option<SystemMode> {
        let operation = self.config.operation.clone().unwrap_or_default();
        let mut transition = None;

        if state.operation.mode == SystemMode::Active && operation.mode == Some(SystemMode::Restart)
        {
            self.publish_log_message(Entry::new(
                Level::Notice,
                category::SYSTEM_BASE_SHUTDOWN,
                "Configured for restart",
            ));
            transition = Some(SystemMode::Restart);
        }

        if operation.mode == Some(SystemMode::Active) {
            state.operation.mode = SystemMode::Active;
        }

        if let Some(last_start) = operation.last_start {
            if last_start.timestamp() < self.device_start.timestamp() {
                self.publish_log_message(Entry::new(
                    Level::Error,
                    category::SYSTEM_BASE_SHUTDOWN,
                    format!(
                        "Configured last_start {} is before device start {}, terminating",
                        last_start.to_rfc3339(),
                        self.device_start.to_rfc3339()
                    ),
                ));
                transition = Some(SystemMode::Terminate);
            }

            if self.smoke_check && last_start.timestamp() == self.device_start.timestamp() {
                self.publish_log_message(Entry::new(
                    Level::Notice,
                    category::SYSTEM_BASE_SHUTDOWN,
                    "Smoke check complete, shutting down",
                ));
                transition = Some(SystemMode::Shutdown);
            }
        }

        if let Some(mode) = transition {
            state.operation.mode = mode;
            state.operation.operational = false;
        }
        transition
    }

    /// Effective minimum level for outgoing entries
    pub fn min_log_level(&self) -> Level {
        self.fixed_log_level.unwrap_or_else(|| {
            self.config
                .min_loglevel
                .map(Level::from_value)
                .unwrap_or(DEFAULT_MIN_LOG_LEVEL)
        })
    }

    pub fn should_log_level(&self, level: Level) -> bool {
        level >= self.min_log_level()
    }

    /// Record an entry locally and queue it for the next system event if
    /// it passes the level filter
    pub fn publish_log_message(&mut self, entry: Entry) {
        entry.trace_local(&self.device_id);

        if self.local_log_capacity > 0 {
            if self.local_log.len() == self.local_log_capacity {
                self.local_log.pop_front();
            }
            self.local_log.push_back(entry.clone());
        }

        if self.should_log_level(entry.level) {
            self.pending.push(entry);
        }
    }

    /// Drain buffered entries into an outgoing system event
    pub fn take_system_event(&mut self) -> Option<SystemEvents> {
        if self.pending.is_empty() {
            return None;
        }
        self.event_count += 1;
        Some(SystemEvents {
            version: None,
            timestamp: Utc::now(),
            event_count: self.event_count,
            logentries: std::mem::take(&mut self.pending),
        })
    }

    /// Recent entries of the local log, oldest first
    pub fn local_log(&self) -> Vec<Entry> {
        self.local_log.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::OperationConfig;
    use chrono::{Duration, TimeZone};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    fn lifecycle(options: DeviceOptions) -> SystemLifecycle {
        SystemLifecycle::new("AHU-1", start(), &options, 16)
    }

    fn config(mode: Option<SystemMode>, last_start: Option<DateTime<Utc>>) -> SystemConfig {
        SystemConfig {
            operation: Some(OperationConfig { mode, last_start }),
            ..SystemConfig::default()
        }
    }

    fn active_state() -> SystemState {
        let mut state = SystemState::default();
        state.operation.mode = SystemMode::Active;
        state
    }

    #[test]
    fn test_active_mirrors_into_state() {
        let mut system = lifecycle(DeviceOptions::default());
        let mut state = SystemState::default();
        system.update_config(Some(&config(Some(SystemMode::Active), None)));

        assert_eq!(system.maybe_restart_system(&mut state), None);
        assert_eq!(state.operation.mode, SystemMode::Active);
    }

    #[test]
    fn test_restart_only_from_active() {
        let mut system = lifecycle(DeviceOptions::default());
        system.update_config(Some(&config(Some(SystemMode::Restart), None)));

        let mut initial = SystemState::default();
        assert_eq!(system.maybe_restart_system(&mut initial), None);

        let mut state = active_state();
        let mode = system.maybe_restart_system(&mut state);
        assert_eq!(mode, Some(SystemMode::Restart));
        assert_eq!(mode.map(SystemMode::exit_code), Some(192));
        assert_eq!(state.operation.mode, SystemMode::Restart);
    }

    #[test]
    fn test_stale_last_start_takes_precedence() {
        let mut system = lifecycle(DeviceOptions::default());
        system.update_config(Some(&config(
            Some(SystemMode::Restart),
            Some(start() - Duration::seconds(30)),
        )));

        let mut state = active_state();
        let mode = system.maybe_restart_system(&mut state);
        assert_eq!(mode, Some(SystemMode::Terminate));
        assert_eq!(mode.map(SystemMode::exit_code), Some(193));
    }

    #[test]
    fn test_smoke_check_matches_to_the_second() {
        let options = DeviceOptions {
            smoke_check: true,
            ..DeviceOptions::default()
        };
        let mut system = lifecycle(options);
        system.update_config(Some(&config(
            Some(SystemMode::Active),
            Some(start() + Duration::milliseconds(400)),
        )));

        let mut state = SystemState::default();
        assert_eq!(system.maybe_restart_system(&mut state), Some(SystemMode::Shutdown));
        assert!(!state.operation.operational);

        // Without the smoke check the same config is a plain activation
        let mut plain = lifecycle(DeviceOptions::default());
        plain.update_config(Some(&config(Some(SystemMode::Active), Some(start()))));
        let mut state = SystemState::default();
        assert_eq!(plain.maybe_restart_system(&mut state), None);
    }

    #[test]
    fn test_debug_kept_locally_but_not_sent() {
        let mut system = lifecycle(DeviceOptions::default());
        system.update_config(Some(&SystemConfig {
            min_loglevel: Some(Level::Info.value()),
            ..SystemConfig::default()
        }));

        system.publish_log_message(Entry::new(Level::Debug, "test.debug", "quiet"));
        system.publish_log_message(Entry::new(Level::Info, "test.info", "loud"));

        assert_eq!(system.local_log().len(), 2);
        let event = system.take_system_event().unwrap();
        assert_eq!(event.logentries.len(), 1);
        assert_eq!(event.logentries[0].category, "test.info");
        assert_eq!(event.event_count, 1);

        // Buffer was cleared on send
        assert!(system.take_system_event().is_none());
    }

    #[test]
    fn test_fixed_level_overrides_config() {
        let options = DeviceOptions {
            fixed_log_level: Some(Level::Debug.value()),
            ..DeviceOptions::default()
        };
        let mut system = lifecycle(options);
        system.update_config(Some(&SystemConfig {
            min_loglevel: Some(Level::Error.value()),
            ..SystemConfig::default()
        }));
        assert!(system.should_log_level(Level::Debug));
        assert!(!system.should_log_level(Level::Trace));
    }

    #[test]
    fn test_local_log_is_bounded() {
        let mut system = SystemLifecycle::new("AHU-1", start(), &DeviceOptions::default(), 2);
        for n in 0..5 {
            system.publish_log_message(Entry::new(Level::Info, "test", format!("entry {}", n)));
        }
        let log = system.local_log();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].message, "entry 3");
        assert_eq!(system.take_system_event().unwrap().logentries.len(), 5);
    }
}
