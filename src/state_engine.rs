//! Threshold and hysteresis rules that derive the installation's health signals.
//!
//! Every accepted [`Reading`] runs one pass over [`SystemState`]:
//!
//! 1. overwrite the field named by the reading's channel (or apply an operator override)
//! 2. append the current energy and impact to their histories
//! 3. trip or recover the emergency/microgrid pair
//! 4. accrue impact while energy is over the strain limit
//! 5. escalate maintenance once impact passes its limit
//!
//! Operator overrides on status channels never defeat a safety trip. A threshold breach
//! re-trips in the same pass, and an operator trip is only released by an operator clear.

use crate::history_buffer::{HistoryBuffer, DEFAULT_HISTORY_CAPACITY};
use crate::reading::{
    Channel, EmergencyStatus, MaintenanceStatus, MicrogridStatus, Reading, ReadingValue,
};
use chrono::{DateTime, Utc};
use tracing::debug;

/// Limits that drive the state machine. The defaults match the installation's
/// inverter protection settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub voltage_limit: f64,
    pub smoke_limit: f64,
    pub energy_strain_limit: f64,
    pub impact_maintenance_limit: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            voltage_limit: 250.0,
            smoke_limit: 5.0,
            energy_strain_limit: 80.0,
            impact_maintenance_limit: 10.0,
        }
    }
}

/// One (timestamp, value) point in a history trace
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistorySample {
    pub observed_at: DateTime<Utc>,
    pub value: f64,
}

/// What put the microgrid into `ShuttingDown`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TripCause {
    Threshold,
    Operator,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StateTransition {
    EmergencyTripped { cause: TripCause },
    EmergencyCleared,
    MaintenanceEscalated { impact: f64 },
    OverrideApplied { channel: Channel, text: String },
    OverrideIgnored { channel: Channel, text: String },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOutcome {
    pub transitions: Vec<StateTransition>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SystemState {
    pub voltage: f64,
    pub smoke: f64,
    pub energy: f64,
    pub impact: f64,
    pub maintenance: MaintenanceStatus,
    pub microgrid: MicrogridStatus,
    pub emergency: EmergencyStatus,
    pub energy_history: HistoryBuffer<HistorySample>,
    pub impact_history: HistoryBuffer<HistorySample>,
    pub trip_cause: Option<TripCause>,
    /// Impact level at which an operator last cleared maintenance
    pub maintenance_acknowledged_at: Option<f64>,
    pub sequence: u64,
    pub last_observed_at: Option<DateTime<Utc>>,
}

impl SystemState {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            voltage: 0.0,
            smoke: 0.0,
            energy: 0.0,
            impact: 0.0,
            maintenance: MaintenanceStatus::Operational,
            microgrid: MicrogridStatus::Stable,
            emergency: EmergencyStatus::Safe,
            energy_history: HistoryBuffer::new(history_capacity),
            impact_history: HistoryBuffer::new(history_capacity),
            trip_cause: None,
            maintenance_acknowledged_at: None,
            sequence: 0,
            last_observed_at: None,
        }
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

/// Owns one installation's [`SystemState`]. Mutation goes through `&mut self`, so a
/// pass can never interleave with another.
#[derive(Debug, Clone)]
pub struct DerivedStateEngine {
    state: SystemState,
    thresholds: Thresholds,
}

impl DerivedStateEngine {
    pub fn new(thresholds: Thresholds, history_capacity: usize) -> Self {
        Self {
            state: SystemState::new(history_capacity),
            thresholds,
        }
    }

    pub fn state(&self) -> &SystemState {
        &self.state
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Applies one reading and reports the transitions it caused.
    pub fn apply(&mut self, reading: &Reading) -> UpdateOutcome {
        let mut outcome = UpdateOutcome::default();

        self.update_field(reading, &mut outcome);
        self.append_history(reading.observed_at);
        self.evaluate_emergency(&mut outcome);
        self.accrue_impact();
        self.evaluate_maintenance(&mut outcome);

        self.state.sequence += 1;
        self.state.last_observed_at = Some(reading.observed_at);
        outcome
    }

    fn update_field(&mut self, reading: &Reading, outcome: &mut UpdateOutcome) {
        match (reading.channel, &reading.value) {
            (Channel::Voltage, ReadingValue::Numeric(value)) => self.state.voltage = *value,
            (Channel::Smoke, ReadingValue::Numeric(value)) => self.state.smoke = *value,
            (Channel::Energy, ReadingValue::Numeric(value)) => self.state.energy = *value,
            // Upstream impact can seed the counter but never wind it back
            (Channel::Impact, ReadingValue::Numeric(value)) => {
                self.state.impact = self.state.impact.max(*value)
            }
            (channel @ Channel::Maintenance, ReadingValue::Text(text)) => {
                match MaintenanceStatus::from_status_text(text) {
                    Some(MaintenanceStatus::Operational) => {
                        self.state.maintenance = MaintenanceStatus::Operational;
                        self.state.maintenance_acknowledged_at = Some(self.state.impact);
                        outcome.override_applied(channel, text);
                    }
                    Some(MaintenanceStatus::MaintenanceRequired) => {
                        self.state.maintenance = MaintenanceStatus::MaintenanceRequired;
                        self.state.maintenance_acknowledged_at = None;
                        outcome.override_applied(channel, text);
                    }
                    None => outcome.override_ignored(channel, text),
                }
            }
            (channel @ Channel::Microgrid, ReadingValue::Text(text)) => {
                match MicrogridStatus::from_status_text(text) {
                    Some(MicrogridStatus::ShuttingDown) => {
                        self.operator_trip(outcome);
                        outcome.override_applied(channel, text);
                    }
                    Some(MicrogridStatus::Stable) => {
                        self.operator_clear(outcome);
                        outcome.override_applied(channel, text);
                    }
                    None => outcome.override_ignored(channel, text),
                }
            }
            (channel @ Channel::Emergency, ReadingValue::Text(text)) => {
                match EmergencyStatus::from_status_text(text) {
                    Some(EmergencyStatus::CriticalAlert) => {
                        self.operator_trip(outcome);
                        outcome.override_applied(channel, text);
                    }
                    Some(EmergencyStatus::Safe) => {
                        self.operator_clear(outcome);
                        outcome.override_applied(channel, text);
                    }
                    None => outcome.override_ignored(channel, text),
                }
            }
            (channel, value) => {
                debug!("Reading {value} on {channel} does not update any field");
            }
        }
    }

    fn operator_trip(&mut self, outcome: &mut UpdateOutcome) {
        let state = &mut self.state;
        if state.microgrid != MicrogridStatus::ShuttingDown {
            outcome
                .transitions
                .push(StateTransition::EmergencyTripped {
                    cause: TripCause::Operator,
                });
        }
        state.trip_cause = Some(TripCause::Operator);
        state.emergency = EmergencyStatus::CriticalAlert;
        state.microgrid = MicrogridStatus::ShuttingDown;
    }

    fn operator_clear(&mut self, outcome: &mut UpdateOutcome) {
        let state = &mut self.state;
        if state.microgrid == MicrogridStatus::ShuttingDown {
            outcome.transitions.push(StateTransition::EmergencyCleared);
        }
        state.emergency = EmergencyStatus::Safe;
        state.microgrid = MicrogridStatus::Stable;
        state.trip_cause = None;
    }

    fn append_history(&mut self, observed_at: DateTime<Utc>) {
        let state = &mut self.state;
        state.energy_history.append(HistorySample {
            observed_at,
            value: state.energy,
        });
        state.impact_history.append(HistorySample {
            observed_at,
            value: state.impact,
        });
    }

    fn evaluate_emergency(&mut self, outcome: &mut UpdateOutcome) {
        let limits = self.thresholds;
        let state = &mut self.state;
        let breached = state.voltage > limits.voltage_limit || state.smoke > limits.smoke_limit;

        if breached {
            if state.microgrid != MicrogridStatus::ShuttingDown {
                outcome
                    .transitions
                    .push(StateTransition::EmergencyTripped {
                        cause: TripCause::Threshold,
                    });
            }
            state.emergency = EmergencyStatus::CriticalAlert;
            state.microgrid = MicrogridStatus::ShuttingDown;
            // An operator trip outlives the breach that overlaps it
            if state.trip_cause != Some(TripCause::Operator) {
                state.trip_cause = Some(TripCause::Threshold);
            }
        } else if state.microgrid == MicrogridStatus::ShuttingDown
            && state.trip_cause == Some(TripCause::Threshold)
        {
            // Both channels are back within bounds at the same time
            state.microgrid = MicrogridStatus::Stable;
            state.emergency = EmergencyStatus::Safe;
            state.trip_cause = None;
            outcome.transitions.push(StateTransition::EmergencyCleared);
        }
    }

    fn accrue_impact(&mut self) {
        if self.state.energy > self.thresholds.energy_strain_limit {
            self.state.impact += 1.0;
        }
    }

    fn evaluate_maintenance(&mut self, outcome: &mut UpdateOutcome) {
        let state = &mut self.state;
        if state.impact <= self.thresholds.impact_maintenance_limit
            || state.maintenance == MaintenanceStatus::MaintenanceRequired
        {
            return;
        }
        let acknowledged = state
            .maintenance_acknowledged_at
            .is_some_and(|level| state.impact <= level);
        if !acknowledged {
            state.maintenance = MaintenanceStatus::MaintenanceRequired;
            state.maintenance_acknowledged_at = None;
            outcome
                .transitions
                .push(StateTransition::MaintenanceEscalated {
                    impact: state.impact,
                });
        }
    }
}

impl Default for DerivedStateEngine {
    fn default() -> Self {
        Self::new(Thresholds::default(), DEFAULT_HISTORY_CAPACITY)
    }
}

impl UpdateOutcome {
    fn override_applied(&mut self, channel: Channel, text: &str) {
        self.transitions.push(StateTransition::OverrideApplied {
            channel,
            text: text.to_string(),
        });
    }

    fn override_ignored(&mut self, channel: Channel, text: &str) {
        self.transitions.push(StateTransition::OverrideIgnored {
            channel,
            text: text.to_string(),
        });
    }
}
