//! Services - business logic and state management
//!
//! This module contains the core business logic services:
//! - `occupancy` - Maps vehicle boxes onto spot regions
//! - `status_store` - Authoritative current status per spot
//! - `event_bus` - Non-blocking fan-out of status changes
//! - `camera_monitor` - Per-camera sampling and detection loop
//! - `persistence_worker` - Bus subscriber writing durable state
//! - `navigation` - A* routing and turn-by-turn instructions
//! - `assignment` - First-free spot assignment
//! - `analytics` - Occupancy summaries

pub mod analytics;
pub mod assignment;
pub mod camera_monitor;
pub mod event_bus;
pub mod navigation;
pub mod occupancy;
pub mod persistence_worker;
pub mod status_store;

// Re-export commonly used types
pub use camera_monitor::{CameraMonitor, MonitorContext, MonitorTimings};
pub use event_bus::{EventBus, Subscription};
pub use persistence_worker::PersistenceWorker;
pub use status_store::StatusStore;
