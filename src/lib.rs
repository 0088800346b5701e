//! Linky Sensor Bridge Library
//!
//! Polls the Conso API for the consumption and production series of a Linky
//! smart meter and exposes them as read-only sensors backed by a single
//! update coordinator per meter.

pub mod config;
pub mod conso_api;
pub mod coordinator;
pub mod error;
pub mod meters;
pub mod normalizer;
pub mod sensor;
pub mod series;
pub mod snapshot;

// Re-export commonly used types for easier access
pub use config::{select_meter, ConfigError, Settings};
pub use conso_api::{ConsoApi, MeteringSource};
pub use coordinator::{
    Condition, CoordinatorHandle, CoordinatorSettings, CoordinatorState, CycleOutcome,
    EntryConfig, UpdateCoordinator,
};
pub use error::LinkyError;
pub use meters::{list_meters, AuthToken, MeterId};
pub use sensor::{SensorProjection, SensorReading};
pub use snapshot::{Metric, MetricState, Snapshot, UnavailableReason};
