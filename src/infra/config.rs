//! Configuration loading from TOML files
//!
//! The binary picks the file with `--config <path>` (default `config/dev.toml`).
//! A missing or invalid file falls back to defaults.

use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Unique site identifier (e.g., "mall-north")
    #[serde(default = "default_site_id")]
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id() }
    }
}

fn default_site_id() -> String {
    "cloudpark".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { bind_address: default_api_bind_address(), port: default_api_port() }
    }
}

fn default_api_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8000
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval(), prometheus_port: default_prometheus_port() }
    }
}

fn default_metrics_interval() -> u64 {
    10
}

fn default_prometheus_port() -> u16 {
    9090
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Frames processed per second per camera
    #[serde(default = "default_target_fps")]
    pub target_fps: f64,
    /// Wait before reopening a failed stream
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
    /// Sleep between unthrottled read attempts
    #[serde(default = "default_idle_sleep_ms")]
    pub idle_sleep_ms: u64,
    /// HTTP timeout for a single snapshot fetch
    #[serde(default = "default_source_timeout_ms")]
    pub source_timeout_ms: u64,
    /// Read plates on free -> occupied transitions
    #[serde(default)]
    pub read_plates: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            target_fps: default_target_fps(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            idle_sleep_ms: default_idle_sleep_ms(),
            source_timeout_ms: default_source_timeout_ms(),
            read_plates: false,
        }
    }
}

fn default_target_fps() -> f64 {
    2.0
}

fn default_reconnect_backoff_ms() -> u64 {
    5000
}

fn default_idle_sleep_ms() -> u64 {
    10
}

fn default_source_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    /// Base URL of the inference service
    #[serde(default = "default_detector_url")]
    pub url: String,
    #[serde(default = "default_detector_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            url: default_detector_url(),
            timeout_ms: default_detector_timeout_ms(),
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

fn default_detector_url() -> String {
    "http://localhost:9000".to_string()
}

fn default_detector_timeout_ms() -> u64 {
    10_000
}

fn default_confidence_threshold() -> f32 {
    0.5
}

#[derive(Debug, Clone, Deserialize)]
pub struct LayoutConfig {
    #[serde(default = "default_layout_file")]
    pub file: String,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self { file: default_layout_file() }
    }
}

fn default_layout_file() -> String {
    "config/layout.toml".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// JSON snapshot of the last known status per spot
    #[serde(default = "default_snapshot_file")]
    pub snapshot_file: String,
    /// JSONL log of plate readings on arrival
    #[serde(default = "default_parking_log_file")]
    pub parking_log_file: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            snapshot_file: default_snapshot_file(),
            parking_log_file: default_parking_log_file(),
        }
    }
}

fn default_snapshot_file() -> String {
    "data/spot_status.json".to_string()
}

fn default_parking_log_file() -> String {
    "data/parking_log.jsonl".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    /// Per-subscriber queue depth before the subscriber is dropped
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { subscriber_buffer: default_subscriber_buffer() }
    }
}

fn default_subscriber_buffer() -> usize {
    1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttEgressConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Topic for spot status changes (QoS 1)
    #[serde(default = "default_spots_topic")]
    pub topic: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for MqttEgressConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            topic: default_spots_topic(),
            username: None,
            password: None,
        }
    }
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_spots_topic() -> String {
    "cloudpark/spots".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AssignmentConfig {
    /// Atomically mark the assigned spot as reserved
    #[serde(default)]
    pub reserve_on_assign: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub layout: LayoutConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub mqtt_egress: MqttEgressConfig,
    #[serde(default)]
    pub assignment: AssignmentConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    api_bind_address: String,
    api_port: u16,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    target_fps: f64,
    reconnect_backoff_ms: u64,
    idle_sleep_ms: u64,
    source_timeout_ms: u64,
    read_plates: bool,
    detector_url: String,
    detector_timeout_ms: u64,
    confidence_threshold: f32,
    layout_file: String,
    snapshot_file: String,
    parking_log_file: String,
    subscriber_buffer: usize,
    mqtt_egress_enabled: bool,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_topic: String,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    reserve_on_assign: bool,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        Self {
            site_id: toml_config.site.id,
            api_bind_address: toml_config.api.bind_address,
            api_port: toml_config.api.port,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            target_fps: toml_config.monitor.target_fps,
            reconnect_backoff_ms: toml_config.monitor.reconnect_backoff_ms,
            idle_sleep_ms: toml_config.monitor.idle_sleep_ms,
            source_timeout_ms: toml_config.monitor.source_timeout_ms,
            read_plates: toml_config.monitor.read_plates,
            detector_url: toml_config.detector.url,
            detector_timeout_ms: toml_config.detector.timeout_ms,
            confidence_threshold: toml_config.detector.confidence_threshold,
            layout_file: toml_config.layout.file,
            snapshot_file: toml_config.persistence.snapshot_file,
            parking_log_file: toml_config.persistence.parking_log_file,
            subscriber_buffer: toml_config.bus.subscriber_buffer,
            mqtt_egress_enabled: toml_config.mqtt_egress.enabled,
            mqtt_host: toml_config.mqtt_egress.host,
            mqtt_port: toml_config.mqtt_egress.port,
            mqtt_topic: toml_config.mqtt_egress.topic,
            mqtt_username: toml_config.mqtt_egress.username,
            mqtt_password: toml_config.mqtt_egress.password,
            reserve_on_assign: toml_config.assignment.reserve_on_assign,
            config_file,
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        if !(toml_config.monitor.target_fps > 0.0) {
            anyhow::bail!(
                "monitor.target_fps must be positive in {} (got {})",
                path.display(),
                toml_config.monitor.target_fps
            );
        }

        Ok(Self::from_toml(toml_config, path.display().to_string()))
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn api_bind_address(&self) -> &str {
        &self.api_bind_address
    }

    pub fn api_port(&self) -> u16 {
        self.api_port
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn target_fps(&self) -> f64 {
        self.target_fps
    }

    /// Minimum time between processed frames
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.target_fps)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_millis(self.source_timeout_ms)
    }

    pub fn read_plates(&self) -> bool {
        self.read_plates
    }

    pub fn detector_url(&self) -> &str {
        &self.detector_url
    }

    pub fn detector_timeout(&self) -> Duration {
        Duration::from_millis(self.detector_timeout_ms)
    }

    pub fn confidence_threshold(&self) -> f32 {
        self.confidence_threshold
    }

    pub fn layout_file(&self) -> &str {
        &self.layout_file
    }

    pub fn snapshot_file(&self) -> &str {
        &self.snapshot_file
    }

    pub fn parking_log_file(&self) -> &str {
        &self.parking_log_file
    }

    pub fn subscriber_buffer(&self) -> usize {
        self.subscriber_buffer
    }

    pub fn mqtt_egress_enabled(&self) -> bool {
        self.mqtt_egress_enabled
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_topic(&self) -> &str {
        &self.mqtt_topic
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn reserve_on_assign(&self) -> bool {
        self.reserve_on_assign
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to shorten monitor timings
    #[cfg(test)]
    pub fn with_monitor_timings(mut self, target_fps: f64, backoff_ms: u64, idle_ms: u64) -> Self {
        self.target_fps = target_fps;
        self.reconnect_backoff_ms = backoff_ms;
        self.idle_sleep_ms = idle_ms;
        self
    }

    /// Builder method for tests to enable plate reading
    #[cfg(test)]
    pub fn with_read_plates(mut self, enabled: bool) -> Self {
        self.read_plates = enabled;
        self
    }

    /// Builder method for tests to enable reservation on assign
    #[cfg(test)]
    pub fn with_reserve_on_assign(mut self, enabled: bool) -> Self {
        self.reserve_on_assign = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.site_id(), "cloudpark");
        assert_eq!(config.api_port(), 8000);
        assert_eq!(config.target_fps(), 2.0);
        assert_eq!(config.frame_interval(), Duration::from_millis(500));
        assert_eq!(config.reconnect_backoff(), Duration::from_secs(5));
        assert_eq!(config.idle_sleep(), Duration::from_millis(10));
        assert_eq!(config.confidence_threshold(), 0.5);
        assert!(!config.read_plates());
        assert!(!config.mqtt_egress_enabled());
        assert!(!config.reserve_on_assign());
        assert_eq!(config.config_file(), "default");
    }

    #[test]
    fn test_partial_sections_use_defaults() {
        let toml_config: TomlConfig = toml::from_str("[monitor]\ntarget_fps = 4.0\n").unwrap();
        let config = Config::from_toml(toml_config, "inline".to_string());
        assert_eq!(config.frame_interval(), Duration::from_millis(250));
        assert_eq!(config.reconnect_backoff(), Duration::from_secs(5));
        assert_eq!(config.snapshot_file(), "data/spot_status.json");
    }

    #[test]
    fn test_builders_override_defaults() {
        let config = Config::default()
            .with_monitor_timings(10.0, 250, 1)
            .with_read_plates(true)
            .with_reserve_on_assign(true);
        assert_eq!(config.frame_interval(), Duration::from_millis(100));
        assert_eq!(config.reconnect_backoff(), Duration::from_millis(250));
        assert_eq!(config.idle_sleep(), Duration::from_millis(1));
        assert_eq!(config.source_timeout(), Duration::from_secs(5));
        assert!(config.read_plates());
        assert!(config.reserve_on_assign());
    }
}
