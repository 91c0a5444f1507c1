//! Session configuration using Figment
//!
//! Beamline-level settings that outlive a single scan. Configuration is loaded from:
//! 1. `tomo_daq.toml` (base configuration)
//! 2. Environment variables (prefixed with `TOMO_DAQ_`)
//!
//! Every field has a default, so an absent file yields a usable debug session.
//!
//! # Example
//! ```no_run
//! use tomo_daq::config::SessionConfig;
//!
//! let config = SessionConfig::load()?;
//! println!("Beamline: {}", config.session.beamline_id);
//! # Ok::<(), tomo_daq::error::TomoError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppResult, TomoError};
use crate::mode::Mode;

/// Top-level session configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session-wide settings
    #[serde(default)]
    pub session: SessionSection,
    /// Per-device-kind command timeouts
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Beam-loss suspender thresholds
    #[serde(default)]
    pub suspenders: SuspenderConfig,
    /// Fly-scan watchdog settings
    #[serde(default)]
    pub fly: FlyWatchdogConfig,
}

/// Session-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    /// Device binding mode
    #[serde(default)]
    pub mode: Mode,
    /// Beamline identifier recorded in run metadata
    #[serde(default = "default_beamline_id")]
    pub beamline_id: String,
    /// Proposal identifier recorded in run metadata
    #[serde(default = "default_proposal_id")]
    pub proposal_id: String,
    /// Output directory used when a scan document omits `filepath`
    #[serde(default = "default_file_path")]
    pub file_path: PathBuf,
    /// File prefix used when a scan document omits `fileprefix`
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            beamline_id: default_beamline_id(),
            proposal_id: default_proposal_id(),
            file_path: default_file_path(),
            file_prefix: default_file_prefix(),
            log_level: default_log_level(),
        }
    }
}

/// Command timeouts, one per device kind
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Motor move completion
    #[serde(default = "default_motor_timeout", with = "humantime_serde")]
    pub motor: Duration,
    /// Shutter actuation
    #[serde(default = "default_shutter_timeout", with = "humantime_serde")]
    pub shutter: Duration,
    /// Detector parameter writes and trigger-and-wait
    #[serde(default = "default_detector_timeout", with = "humantime_serde")]
    pub detector: Duration,
    /// Fly controller taxi and fly
    #[serde(default = "default_fly_timeout", with = "humantime_serde")]
    pub fly: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            motor: default_motor_timeout(),
            shutter: default_shutter_timeout(),
            detector: default_detector_timeout(),
            fly: default_fly_timeout(),
        }
    }
}

/// Suspender thresholds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SuspenderConfig {
    /// Shutter PSS state below this value means no beam
    #[serde(default = "default_shutter_floor")]
    pub shutter_floor: f64,
    /// Ring current (mA) below this value suspends the scan
    #[serde(default = "default_current_floor")]
    pub current_floor: f64,
    /// Ring current (mA) required before a suspended scan resumes
    #[serde(default = "default_current_resume")]
    pub current_resume: f64,
}

impl Default for SuspenderConfig {
    fn default() -> Self {
        Self {
            shutter_floor: default_shutter_floor(),
            current_floor: default_current_floor(),
            current_resume: default_current_resume(),
        }
    }
}

/// Fly-scan stall watchdog
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlyWatchdogConfig {
    /// How often the detector image counter is sampled
    #[serde(default = "default_stall_poll", with = "humantime_serde")]
    pub stall_poll: Duration,
    /// Counter idle time after which the acquisition is forced to finish
    #[serde(default = "default_stall_timeout", with = "humantime_serde")]
    pub stall_timeout: Duration,
}

impl Default for FlyWatchdogConfig {
    fn default() -> Self {
        Self {
            stall_poll: default_stall_poll(),
            stall_timeout: default_stall_timeout(),
        }
    }
}

// Default value functions
fn default_beamline_id() -> String {
    "APS 6-BM-A".to_string()
}

fn default_proposal_id() -> String {
    "internal test".to_string()
}

fn default_file_path() -> PathBuf {
    PathBuf::from("/data/tomo/")
}

fn default_file_prefix() -> String {
    "test".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_motor_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_shutter_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_detector_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_fly_timeout() -> Duration {
    Duration::from_secs(3600)
}

fn default_shutter_floor() -> f64 {
    1.0
}

fn default_current_floor() -> f64 {
    2.0
}

fn default_current_resume() -> f64 {
    10.0
}

fn default_stall_poll() -> Duration {
    Duration::from_secs(5)
}

fn default_stall_timeout() -> Duration {
    Duration::from_secs(60)
}

impl SessionConfig {
    /// Load configuration from `tomo_daq.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `TOMO_DAQ_`.
    /// Example: `TOMO_DAQ_SESSION__LOG_LEVEL=debug`
    pub fn load() -> AppResult<Self> {
        Self::load_from("tomo_daq.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(SessionConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("TOMO_DAQ_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.session.log_level.to_ascii_lowercase().as_str()) {
            return Err(TomoError::InvalidConfig(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.session.log_level,
                valid_levels.join(", ")
            )));
        }

        let s = &self.suspenders;
        if s.current_resume < s.current_floor {
            return Err(TomoError::InvalidConfig(format!(
                "current_resume {} must not be below current_floor {}",
                s.current_resume, s.current_floor
            )));
        }

        if self.fly.stall_poll.is_zero() || self.fly.stall_timeout < self.fly.stall_poll {
            return Err(TomoError::InvalidConfig(
                "fly.stall_timeout must be at least one non-zero stall_poll".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.session.mode, Mode::Debug);
        assert_eq!(config.suspenders.current_floor, 2.0);
        assert_eq!(config.suspenders.current_resume, 10.0);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = SessionConfig::load_from("/nonexistent/tomo_daq.toml").unwrap();
        assert_eq!(config.timeouts, TimeoutConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[session]
mode = "dryrun"
file_prefix = "sample_b"

[timeouts]
motor = "45s"

[suspenders]
current_floor = 5.0
current_resume = 20.0
"#
        )
        .unwrap();

        let config = SessionConfig::load_from(file.path()).unwrap();
        assert_eq!(config.session.mode, Mode::DryRun);
        assert_eq!(config.session.file_prefix, "sample_b");
        assert_eq!(config.timeouts.motor, Duration::from_secs(45));
        assert_eq!(config.timeouts.shutter, Duration::from_secs(30));
        assert_eq!(config.suspenders.current_resume, 20.0);
    }

    #[test]
    fn test_resume_below_floor_rejected() {
        let mut config = SessionConfig::default();
        config.suspenders.current_resume = 1.0;
        assert!(matches!(
            config.validate(),
            Err(TomoError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_bad_log_level_rejected() {
        let mut config = SessionConfig::default();
        config.session.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }
}
