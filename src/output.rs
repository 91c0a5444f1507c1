//! Detector file output selection
//!
//! The detector carries two file sinks, TIFF and HDF5. A scan writes through
//! exactly one of them: the configurator disables the other sink first, then
//! enables and arms the chosen one for the whole run.

use std::path::PathBuf;
use tracing::info;

use crate::config::SessionSection;
use crate::devices::{AreaDetector, SinkKind, SinkSettings, WriteMode};
use crate::error::{AppResult, TomoError};
use crate::scan::{OutputFormat, OutputSpec};

/// Resolved sink configuration for one run
#[derive(Debug, Clone, PartialEq)]
pub struct SinkPlan {
    /// Requested format
    pub format: OutputFormat,
    /// Sink that writes the run
    pub sink: SinkKind,
    /// Settings for `sink`
    pub settings: SinkSettings,
}

impl SinkPlan {
    /// The sink that must be disabled
    pub fn disabled_sink(&self) -> SinkKind {
        self.sink.other()
    }
}

/// Chooses and arms the detector file sink
#[derive(Debug, Clone)]
pub struct OutputConfigurator {
    default_path: PathBuf,
    default_prefix: String,
}

impl OutputConfigurator {
    /// Configurator with fallbacks for a missing path or prefix
    pub fn new(default_path: impl Into<PathBuf>, default_prefix: &str) -> Self {
        Self {
            default_path: default_path.into(),
            default_prefix: default_prefix.to_string(),
        }
    }

    /// Configurator using the session defaults
    pub fn from_session(session: &SessionSection) -> Self {
        Self::new(session.file_path.clone(), &session.file_prefix)
    }

    /// Work out which sink to enable and how, without touching the detector
    pub fn plan(&self, output: &OutputSpec, total_frames: u32) -> AppResult<SinkPlan> {
        let format = output.output_format()?;
        if total_frames == 0 {
            return Err(TomoError::InvalidConfig(
                "output capture count must be at least 1".to_string(),
            ));
        }

        let sink = SinkKind::from(format);
        let settings = SinkSettings {
            enabled: true,
            num_capture: total_frames,
            file_path: output
                .filepath
                .clone()
                .unwrap_or_else(|| self.default_path.clone()),
            file_name: output
                .fileprefix
                .clone()
                .unwrap_or_else(|| self.default_prefix.clone()),
            file_template: format!("%s%s_%06d.{}", output.extension()),
            write_mode: WriteMode::Stream,
            capture: true,
        };
        Ok(SinkPlan {
            format,
            sink,
            settings,
        })
    }

    /// Disable the unused sink and arm the requested one
    ///
    /// An unknown format fails before either sink is written.
    pub async fn configure(
        &self,
        detector: &dyn AreaDetector,
        output: &OutputSpec,
        total_frames: u32,
    ) -> AppResult<SinkPlan> {
        let plan = self.plan(output, total_frames)?;
        let disabled = plan.disabled_sink();

        detector
            .configure_sink(disabled, SinkSettings::disabled())
            .await
            .map_err(|e| TomoError::device(detector.name(), "configure_sink", e))?;
        detector
            .configure_sink(plan.sink, plan.settings.clone())
            .await
            .map_err(|e| TomoError::device(detector.name(), "configure_sink", e))?;

        info!(
            sink = %plan.sink,
            num_capture = total_frames,
            path = %plan.settings.file_path.display(),
            prefix = %plan.settings.file_name,
            "Output configured"
        );
        Ok(plan)
    }
}
