use crate::history_buffer::HistoryBuffer;
use crate::reading::{EmergencyStatus, MaintenanceStatus, MicrogridStatus};
use crate::state_engine::{HistorySample, SystemState};
use chrono::{DateTime, Utc};
use serde_derive::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

/// Chart-ready history point
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryPoint {
    pub time: String,
    pub value: f64,
}

impl From<&HistorySample> for HistoryPoint {
    fn from(sample: &HistorySample) -> Self {
        Self {
            time: sample.observed_at.format("%H:%M:%S").to_string(),
            value: sample.value,
        }
    }
}

/// Immutable point-in-time copy of the derived state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub voltage: f64,
    pub smoke: f64,
    pub energy: f64,
    pub impact: f64,
    pub maintenance: MaintenanceStatus,
    pub microgrid: MicrogridStatus,
    pub emergency: EmergencyStatus,
    pub energy_history: Vec<HistoryPoint>,
    pub impact_history: Vec<HistoryPoint>,
    pub sequence: u64,
    pub last_update: Option<DateTime<Utc>>,
}

impl Snapshot {
    pub fn capture(state: &SystemState) -> Self {
        Self {
            voltage: state.voltage,
            smoke: state.smoke,
            energy: state.energy,
            impact: state.impact,
            maintenance: state.maintenance,
            microgrid: state.microgrid,
            emergency: state.emergency,
            energy_history: points(&state.energy_history),
            impact_history: points(&state.impact_history),
            sequence: state.sequence,
            last_update: state.last_observed_at,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::capture(&SystemState::default())
    }
}

fn points(history: &HistoryBuffer<HistorySample>) -> Vec<HistoryPoint> {
    history.iter().map(HistoryPoint::from).collect()
}

/// Write side of the snapshot feed, owned by the ingestion loop
pub struct SnapshotPublisher {
    sender: watch::Sender<Arc<Snapshot>>,
}

/// Read side of the snapshot feed. Cheap to clone, never blocks the writer.
#[derive(Clone)]
pub struct SnapshotHandle {
    receiver: watch::Receiver<Arc<Snapshot>>,
}

impl SnapshotPublisher {
    pub fn new(initial: Snapshot) -> (Self, SnapshotHandle) {
        let (sender, receiver) = watch::channel(Arc::new(initial));
        (Self { sender }, SnapshotHandle { receiver })
    }

    /// Captures and publishes the state. Publishing still succeeds when nobody is
    /// subscribed, the latest value is simply retained for the next reader.
    pub fn publish(&self, state: &SystemState) -> Arc<Snapshot> {
        let snapshot = Arc::new(Snapshot::capture(state));
        self.sender.send_replace(snapshot.clone());
        snapshot
    }

    pub fn subscribe(&self) -> SnapshotHandle {
        SnapshotHandle {
            receiver: self.sender.subscribe(),
        }
    }
}

impl SnapshotHandle {
    /// Latest published snapshot
    pub fn current(&self) -> Arc<Snapshot> {
        self.receiver.borrow().clone()
    }

    /// Waits for the next publish. Returns `None` once the publisher is gone.
    pub async fn changed(&mut self) -> Option<Arc<Snapshot>> {
        self.receiver.changed().await.ok()?;
        Some(self.receiver.borrow_and_update().clone())
    }
}
