/// Configuration structures that can be tested independently
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    pub wifi: WifiConfig,
    pub http: HttpConfig,
    pub connectivity: ConnectivityConfig,
    pub ota: OtaConfig,
    pub stream: StreamConfig,
    pub camera: CameraConfig,
    pub poll_interval_secs: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            wifi: WifiConfig::default(),
            http: HttpConfig::default(),
            connectivity: ConnectivityConfig::default(),
            ota: OtaConfig::default(),
            stream: StreamConfig::default(),
            camera: CameraConfig::default(),
            poll_interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct WifiConfig {
    pub ssid: String,
    pub password: String,
}

/// Settings handed to the HTTP daemon when it is started.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
    pub max_uri_handlers: usize,
    pub max_resp_headers: usize,
    pub max_open_sockets: usize,
    pub stack_size: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 80,
            max_uri_handlers: 10,
            max_resp_headers: 8,
            max_open_sockets: 7,
            stack_size: 8192,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectivityConfig {
    pub connect_timeout_ms: u32,
    pub retry_delay_ms: u32,
    pub task_stack_size: usize,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            retry_delay_ms: 1000,
            task_stack_size: 4096,
        }
    }
}

impl ConnectivityConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms as u64)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OtaConfig {
    pub chunk_size: usize,
    pub progress_interval: usize,
    pub restart_delay_ms: u32,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024,
            progress_interval: 64 * 1024,
            restart_delay_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    pub frame_interval_ms: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        // ~30 fps
        Self { frame_interval_ms: 33 }
    }
}

impl StreamConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms as u64)
    }
}

/// Capture driver settings. The fallback values apply when no PSRAM is found.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CameraConfig {
    pub jpeg_quality: u8,
    pub fb_count: u8,
    pub xclk_freq_hz: u32,
    pub fallback_jpeg_quality: u8,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: 12,
            fb_count: 2,
            xclk_freq_hz: 10_000_000,
            fallback_jpeg_quality: 20,
        }
    }
}

impl DeviceConfig {
    /// Defaults with the given WiFi credentials.
    pub fn with_credentials(ssid: &str, password: &str) -> Self {
        Self {
            wifi: WifiConfig {
                ssid: ssid.to_string(),
                password: password.to_string(),
            },
            ..Default::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1) as u64)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wifi.ssid.is_empty() {
            return Err(ConfigError::EmptySsid);
        }
        if self.http.port == 0 {
            return Err(ConfigError::Invalid("http.port must be non-zero"));
        }
        if self.connectivity.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid("connectivity.connect_timeout_ms must be non-zero"));
        }
        if self.ota.chunk_size == 0 {
            return Err(ConfigError::Invalid("ota.chunk_size must be non-zero"));
        }
        if self.ota.progress_interval == 0 {
            return Err(ConfigError::Invalid("ota.progress_interval must be non-zero"));
        }
        if self.camera.jpeg_quality > 63 || self.camera.fallback_jpeg_quality > 63 {
            return Err(ConfigError::Invalid("camera jpeg quality must be 0-63"));
        }
        if self.camera.fb_count == 0 {
            return Err(ConfigError::Invalid("camera.fb_count must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_firmware_constants() {
        let config = DeviceConfig::with_credentials("lab", "secret");
        assert_eq!(config.connectivity.connect_timeout(), Duration::from_millis(5000));
        assert_eq!(config.ota.chunk_size, 1024);
        assert_eq!(config.ota.progress_interval, 65536);
        assert_eq!(config.stream.frame_interval(), Duration::from_millis(33));
        assert_eq!(config.http.port, 80);
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let json = r#"{"wifi":{"ssid":"cam","password":""},"stream":{"frame_interval_ms":50}}"#;
        let config: DeviceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.wifi.ssid, "cam");
        assert_eq!(config.stream.frame_interval_ms, 50);
        assert_eq!(config.http, HttpConfig::default());
        assert_eq!(config.ota, OtaConfig::default());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = DeviceConfig::with_credentials("", "x");
        assert!(matches!(config.validate(), Err(ConfigError::EmptySsid)));

        config.wifi.ssid = "cam".into();
        config.camera.jpeg_quality = 64;
        assert!(config.validate().is_err());

        config.camera.jpeg_quality = 12;
        config.ota.chunk_size = 0;
        assert!(config.validate().is_err());
    }
}
