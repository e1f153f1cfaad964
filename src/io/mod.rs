//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `frame_source` - Camera frame sources (HTTP snapshot polling)
//! - `detector` - Vehicle detection and plate reading client
//! - `persistence` - Spot status snapshot file and parking log
//! - `api` - Public HTTP/WebSocket API (axum)
//! - `mqtt_egress` - MQTT publisher for status changes
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod api;
pub mod detector;
pub mod frame_source;
pub mod mqtt_egress;
pub mod persistence;
pub mod prometheus;

// Re-export commonly used types
pub use api::AppState;
pub use detector::{Detector, HttpDetector};
pub use frame_source::{Frame, FrameSource, HttpSnapshotConnector, SourceConnector};
pub use mqtt_egress::MqttPublisher;
pub use persistence::{ParkingLog, SnapshotFile};
