//! Solar Telemetry Bridge Library
//!
//! Ingests raw sensor and status readings for a solar installation, derives the
//! emergency, microgrid and maintenance state from them and publishes consistent
//! snapshots for dashboards and Modbus clients.

pub mod config;
pub mod history_buffer;
pub mod home_assistant;
pub mod home_assistant_reader;
pub mod ingestion;
pub mod line_feed_reader;
pub mod mqtt_reader;
pub mod reading;
pub mod simulated_source;
pub mod snapshot;
pub mod source_coordinator;
pub mod state_engine;
pub mod status_register_server;

// Re-export commonly used types for easier access
pub use config::BridgeConfig;
pub use ingestion::IngestionLoop;
pub use reading::{Channel, Reading, TopicMessage};
pub use snapshot::{Snapshot, SnapshotHandle, SnapshotPublisher};
pub use source_coordinator::{SourceCoordinator, TelemetrySource};
pub use state_engine::{DerivedStateEngine, SystemState};
pub use status_register_server::StatusRegisterServer;
