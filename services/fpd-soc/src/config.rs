//! Detector configuration surface.
//!
//! Parameters are either *hot* (applicable while a scan runs: frame rate,
//! destination address, ports, log level) or *cold* (resolution, bit depth,
//! SPI and CSI-2 link parameters, scan mode) which require the sequencer to
//! be idle. `SetConfig` requests arrive as UTF-8 `key=value` pairs and go
//! through [`DetectorConfig::apply`], which enforces the classification and
//! re-validates the whole struct before committing.

use serde::{Deserialize, Serialize};

use crate::api::{ScanMode, SocError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamClass {
    /// editable at runtime
    Hot,
    /// requires the scan to be stopped
    Cold,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub rows: u32,
    pub cols: u32,
    pub bit_depth: u8,
    pub frame_rate: u32,
    pub spi_speed_hz: u32,
    pub spi_mode: u8,
    pub csi2_lane_speed_mbps: u32,
    pub csi2_lanes: u8,
    pub host_ip: String,
    pub data_port: u16,
    pub control_port: u16,
    pub send_buffer_size: u32,
    pub scan_mode: ScanMode,
    pub log_level: String,
}

impl Default for DetectorConfig {
    fn default() -> DetectorConfig {
        DetectorConfig {
            rows: 2048,
            cols: 2048,
            bit_depth: 16,
            frame_rate: 15,
            spi_speed_hz: 10_000_000,
            spi_mode: 0,
            csi2_lane_speed_mbps: 800,
            csi2_lanes: 4,
            host_ip: "127.0.0.1".to_string(),
            data_port: fpd_protocol::DATA_PORT,
            control_port: fpd_protocol::CONTROL_PORT,
            send_buffer_size: 4 * 1024 * 1024,
            scan_mode: ScanMode::Continuous,
            log_level: "info".to_string(),
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<(), SocError> {
        if self.rows < 128 || self.rows > 4096 {
            return Err(SocError::ConfigRange("rows"));
        }
        if self.cols < 128 || self.cols > 4096 {
            return Err(SocError::ConfigRange("cols"));
        }
        if self.bit_depth != 14 && self.bit_depth != 16 {
            return Err(SocError::ConfigRange("bit_depth"));
        }
        if self.frame_rate < 1 || self.frame_rate > 60 {
            return Err(SocError::ConfigRange("frame_rate"));
        }
        if self.spi_speed_hz < 1_000_000 || self.spi_speed_hz > 50_000_000 {
            return Err(SocError::ConfigRange("spi_speed_hz"));
        }
        if self.spi_mode > 3 {
            return Err(SocError::ConfigRange("spi_mode"));
        }
        if self.csi2_lane_speed_mbps != 400 && self.csi2_lane_speed_mbps != 800 {
            return Err(SocError::ConfigRange("csi2_lane_speed_mbps"));
        }
        if self.csi2_lanes < 1 || self.csi2_lanes > 4 {
            return Err(SocError::ConfigRange("csi2_lanes"));
        }
        if self.host_ip.parse::<std::net::IpAddr>().is_err() {
            return Err(SocError::ConfigRange("host_ip"));
        }
        if self.data_port < 1024 {
            return Err(SocError::ConfigRange("data_port"));
        }
        if self.control_port < 1024 || self.control_port == self.data_port {
            return Err(SocError::ConfigRange("control_port"));
        }
        Ok(())
    }

    pub fn frame_bytes(&self) -> usize { self.rows as usize * self.cols as usize * 2 }

    pub fn frame_period_ns(&self) -> u64 { 1_000_000_000 / self.frame_rate as u64 }

    pub fn classify(key: &str) -> Option<ParamClass> {
        match key {
            "frame_rate" | "host_ip" | "data_port" | "control_port" | "log_level"
            | "send_buffer_size" => Some(ParamClass::Hot),
            "rows" | "cols" | "bit_depth" | "spi_speed_hz" | "spi_mode"
            | "csi2_lane_speed_mbps" | "csi2_lanes" | "scan_mode" => Some(ParamClass::Cold),
            _ => None,
        }
    }

    /// Apply one `key=value` update.
    ///
    /// Cold parameters are refused while `scanning` is true. The update is
    /// staged on a copy and validated before it is committed, so a bad value
    /// never leaves the config half-applied.
    pub fn apply(&mut self, key: &str, value: &str, scanning: bool) -> Result<ParamClass, SocError> {
        let class = Self::classify(key)
            .ok_or_else(|| SocError::ConfigParse(format!("unknown parameter: {}", key)))?;
        if class == ParamClass::Cold && scanning {
            return Err(SocError::ColdParam(Self::static_key(key)));
        }
        let mut staged = self.clone();
        staged.set_field(key, value)?;
        staged.validate()?;
        *self = staged;
        Ok(class)
    }

    fn static_key(key: &str) -> &'static str {
        match key {
            "rows" => "rows",
            "cols" => "cols",
            "bit_depth" => "bit_depth",
            "spi_speed_hz" => "spi_speed_hz",
            "spi_mode" => "spi_mode",
            "csi2_lane_speed_mbps" => "csi2_lane_speed_mbps",
            "csi2_lanes" => "csi2_lanes",
            "scan_mode" => "scan_mode",
            _ => "cold",
        }
    }

    fn set_field(&mut self, key: &str, value: &str) -> Result<(), SocError> {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, SocError> {
            value
                .parse::<T>()
                .map_err(|_| SocError::ConfigParse(format!("bad value for {}: {}", key, value)))
        }
        match key {
            "rows" => self.rows = parse(key, value)?,
            "cols" => self.cols = parse(key, value)?,
            "bit_depth" => self.bit_depth = parse(key, value)?,
            "frame_rate" => self.frame_rate = parse(key, value)?,
            "spi_speed_hz" => self.spi_speed_hz = parse(key, value)?,
            "spi_mode" => self.spi_mode = parse(key, value)?,
            "csi2_lane_speed_mbps" => self.csi2_lane_speed_mbps = parse(key, value)?,
            "csi2_lanes" => self.csi2_lanes = parse(key, value)?,
            "host_ip" => self.host_ip = value.to_string(),
            "data_port" => self.data_port = parse(key, value)?,
            "control_port" => self.control_port = parse(key, value)?,
            "send_buffer_size" => self.send_buffer_size = parse(key, value)?,
            "scan_mode" => {
                self.scan_mode = value
                    .parse::<ScanMode>()
                    .map_err(|_| SocError::ConfigParse(format!("bad scan mode: {}", value)))?
            }
            "log_level" => self.log_level = value.to_string(),
            _ => return Err(SocError::ConfigParse(format!("unknown parameter: {}", key))),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        DetectorConfig::default().validate().unwrap();
    }

    #[test]
    fn range_checks() {
        let mut cfg = DetectorConfig::default();
        cfg.rows = 64;
        assert_eq!(cfg.validate(), Err(SocError::ConfigRange("rows")));
        cfg = DetectorConfig::default();
        cfg.bit_depth = 12; // panel supports 12 internally, config surface does not
        assert_eq!(cfg.validate(), Err(SocError::ConfigRange("bit_depth")));
        cfg = DetectorConfig::default();
        cfg.control_port = cfg.data_port;
        assert_eq!(cfg.validate(), Err(SocError::ConfigRange("control_port")));
    }

    #[test]
    fn hot_param_applies_while_scanning() {
        let mut cfg = DetectorConfig::default();
        assert_eq!(cfg.apply("frame_rate", "30", true).unwrap(), ParamClass::Hot);
        assert_eq!(cfg.frame_rate, 30);
    }

    #[test]
    fn cold_param_refused_while_scanning() {
        let mut cfg = DetectorConfig::default();
        assert_eq!(cfg.apply("rows", "1024", true), Err(SocError::ColdParam("rows")));
        assert_eq!(cfg.rows, 2048);
        cfg.apply("rows", "1024", false).unwrap();
        assert_eq!(cfg.rows, 1024);
    }

    #[test]
    fn bad_value_leaves_config_untouched() {
        let mut cfg = DetectorConfig::default();
        let before = cfg.clone();
        assert!(cfg.apply("frame_rate", "900", false).is_err());
        assert!(cfg.apply("frame_rate", "fast", false).is_err());
        assert!(cfg.apply("warp_speed", "9", false).is_err());
        assert_eq!(cfg, before);
    }

    #[test]
    fn scan_mode_parses() {
        let mut cfg = DetectorConfig::default();
        cfg.apply("scan_mode", "single", false).unwrap();
        assert_eq!(cfg.scan_mode, ScanMode::Single);
    }

    #[test]
    fn frame_geometry_helpers() {
        let mut cfg = DetectorConfig::default();
        cfg.rows = 512;
        cfg.cols = 256;
        cfg.frame_rate = 20;
        assert_eq!(cfg.frame_bytes(), 512 * 256 * 2);
        assert_eq!(cfg.frame_period_ns(), 50_000_000);
    }
}
