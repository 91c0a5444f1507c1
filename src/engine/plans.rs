//! Tomography plans
//!
//! Plans don't touch hardware. They yield [`PlanCommand`]s one at a time and
//! the [`RunEngine`](super::RunEngine) executes each before asking for the
//! next, so a plan can be inspected with [`summarize`] without any device.
//!
//! # Phases
//!
//! ```text
//! Setup        record positions, select sink, camera timing, open shutter,
//!              install suspenders
//! WhiteFront   sample out, tag, acquire, sample in
//! Projections  step: per angle checkpoint, rotate, acquire
//!              fly:  configure, taxi, external trigger, fly and collect
//! WhiteBack    sample out, tag, acquire, sample in
//! Dark         remove suspenders, close shutter, tag, acquire
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::devices::{
    ArrayPort, Axis, DetectorSetting, FlyParams, ImageMode, SinkKind, SinkSettings, TriggerMode,
};
use crate::error::AppResult;
use crate::output::{OutputConfigurator, SinkPlan};
use crate::scan::{FrameType, ScanConfig, ScanMode};

/// Acquisition phase a command belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPhase {
    /// Device preparation
    Setup,
    /// White fields before the projections
    WhiteFront,
    /// Projections over the angle range
    Projections,
    /// White fields after the projections
    WhiteBack,
    /// Dark fields with the shutter closed
    Dark,
}

impl fmt::Display for ScanPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanPhase::Setup => write!(f, "setup"),
            ScanPhase::WhiteFront => write!(f, "white_front"),
            ScanPhase::Projections => write!(f, "projections"),
            ScanPhase::WhiteBack => write!(f, "white_back"),
            ScanPhase::Dark => write!(f, "dark"),
        }
    }
}

/// Where a move goes
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MoveTarget {
    /// Absolute position
    Absolute(f64),
    /// Position recorded at the start of the run
    Initial,
    /// Recorded position plus an offset
    InitialOffset(f64),
}

/// Commands that plans yield for the RunEngine to execute
#[derive(Debug, Clone, PartialEq)]
pub enum PlanCommand {
    /// Enter a new phase
    BeginPhase(ScanPhase),
    /// Record the position of every axis for restoration
    RecordPositions,
    /// Replace the settings of a detector file sink
    ConfigureSink {
        /// Sink to configure
        sink: SinkKind,
        /// New settings
        settings: SinkSettings,
    },
    /// Write one detector parameter
    SetDetector(DetectorSetting),
    /// Open the shutter
    OpenShutter,
    /// Close the shutter
    CloseShutter,
    /// Install the beam suspenders
    InstallSuspender,
    /// Remove the beam suspenders
    RemoveSuspender,
    /// Move an axis and wait
    MoveTo {
        /// Axis to move
        axis: Axis,
        /// Destination
        target: MoveTarget,
    },
    /// Resume point for the step projection loop
    Checkpoint {
        /// Checkpoint label
        label: String,
    },
    /// Acquire with the current detector settings and wait
    TriggerAndRead,
    /// Load the fly sweep
    ConfigureFly(FlyParams),
    /// Move the rotation stage to its run-up position
    Taxi,
    /// Start the detector, fly, and wait for both
    FlyAndCollect,
}

impl fmt::Display for PlanCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanCommand::BeginPhase(phase) => write!(f, "-- {} --", phase),
            PlanCommand::RecordPositions => write!(f, "record positions"),
            PlanCommand::ConfigureSink { sink, settings } if settings.enabled => write!(
                f,
                "enable {} ({} frames, {}{})",
                sink,
                settings.num_capture,
                settings.file_path.display(),
                settings.file_name
            ),
            PlanCommand::ConfigureSink { sink, .. } => write!(f, "disable {}", sink),
            PlanCommand::SetDetector(setting) => write!(f, "set detector {:?}", setting),
            PlanCommand::OpenShutter => write!(f, "open shutter"),
            PlanCommand::CloseShutter => write!(f, "close shutter"),
            PlanCommand::InstallSuspender => write!(f, "install suspenders"),
            PlanCommand::RemoveSuspender => write!(f, "remove suspenders"),
            PlanCommand::MoveTo { axis, target } => match target {
                MoveTarget::Absolute(p) => write!(f, "move {} to {}", axis, p),
                MoveTarget::Initial => write!(f, "move {} to initial", axis),
                MoveTarget::InitialOffset(d) => write!(f, "move {} to initial{:+}", axis, d),
            },
            PlanCommand::Checkpoint { label } => write!(f, "checkpoint {}", label),
            PlanCommand::TriggerAndRead => write!(f, "trigger and read"),
            PlanCommand::ConfigureFly(p) => write!(
                f,
                "configure fly {}..{} step {} at {} deg/s",
                p.start, p.end, p.step, p.slew_speed
            ),
            PlanCommand::Taxi => write!(f, "taxi"),
            PlanCommand::FlyAndCollect => write!(f, "fly and collect"),
        }
    }
}

/// Plan trait - all plans implement this to generate commands
pub trait Plan: Send + Sync {
    /// Plan name recorded in the start document
    fn plan_name(&self) -> &str;

    /// Plan arguments for documentation
    fn plan_args(&self) -> HashMap<String, String>;

    /// Number of projection angles
    fn num_points(&self) -> usize;

    /// Generate the next command, returning None when complete
    fn next_command(&mut self) -> Option<PlanCommand>;

    /// Reset the plan to start from the beginning
    fn reset(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum TomoStep {
    Setup,
    WhiteFront,
    Projection { index: u32 },
    FlyProjections,
    WhiteBack,
    Dark,
    Done,
}

/// Full tomography acquisition in step or fly mode
#[derive(Debug, Clone)]
pub struct TomoScan {
    config: ScanConfig,
    mode: ScanMode,
    sink: SinkPlan,

    // Execution state
    step: TomoStep,
    pending: VecDeque<PlanCommand>,
}

impl TomoScan {
    /// Create a plan for an already resolved output sink
    pub fn new(config: ScanConfig, mode: ScanMode, sink: SinkPlan) -> Self {
        Self {
            config,
            mode,
            sink,
            step: TomoStep::Setup,
            pending: VecDeque::new(),
        }
    }

    /// Validate `config`, resolve its output and build the plan
    pub fn from_config(
        config: &ScanConfig,
        mode: ScanMode,
        output: &OutputConfigurator,
    ) -> AppResult<Self> {
        config.validate()?;
        let sink = output.plan(&config.output, config.total_images())?;
        Ok(Self::new(config.clone(), mode, sink))
    }

    /// Scan mode this plan runs in
    pub fn mode(&self) -> ScanMode {
        self.mode
    }

    /// Configuration this plan runs
    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Sink the plan writes through
    pub fn sink(&self) -> &SinkPlan {
        &self.sink
    }

    /// Images the camera takes per archived background frame
    fn images_per_frame(&self) -> u32 {
        match self.mode {
            ScanMode::Step => self.config.n_frames,
            ScanMode::Fly => 1,
        }
    }

    fn fly_params(&self) -> FlyParams {
        FlyParams {
            start: self.config.omega_start,
            end: self.config.omega_end,
            step: self.config.omega_step,
            slew_speed: self.config.effective_slew_speed(),
            acceleration: self.config.accl,
        }
    }

    fn push(&mut self, cmd: PlanCommand) {
        self.pending.push_back(cmd);
    }

    fn queue_setup(&mut self) {
        self.push(PlanCommand::BeginPhase(ScanPhase::Setup));
        self.push(PlanCommand::RecordPositions);
        self.push(PlanCommand::ConfigureSink {
            sink: self.sink.disabled_sink(),
            settings: SinkSettings::disabled(),
        });
        self.push(PlanCommand::ConfigureSink {
            sink: self.sink.sink,
            settings: self.sink.settings.clone(),
        });
        self.push(PlanCommand::SetDetector(DetectorSetting::ImageMode(
            ImageMode::Multiple,
        )));
        self.push(PlanCommand::SetDetector(DetectorSetting::TriggerMode(
            TriggerMode::Internal,
        )));
        self.push(PlanCommand::SetDetector(DetectorSetting::AcquireTime(
            self.config.acquire_time,
        )));
        self.push(PlanCommand::SetDetector(DetectorSetting::AcquirePeriod(
            self.config.acquire_period,
        )));
        match self.mode {
            ScanMode::Step => {
                self.push(PlanCommand::SetDetector(DetectorSetting::SinkPort(
                    ArrayPort::Proc1,
                )));
                self.push(PlanCommand::SetDetector(DetectorSetting::FrameFilter(Some(
                    self.config.n_frames,
                ))));
            }
            ScanMode::Fly => {
                self.push(PlanCommand::SetDetector(DetectorSetting::SinkPort(
                    ArrayPort::Pg1,
                )));
                self.push(PlanCommand::SetDetector(DetectorSetting::FrameFilter(None)));
            }
        }
        self.push(PlanCommand::OpenShutter);
        self.push(PlanCommand::InstallSuspender);
    }

    fn queue_white(&mut self, phase: ScanPhase, tag: FrameType) {
        let out = self.config.sample_out;
        let rotate = self.mode == ScanMode::Step;

        self.push(PlanCommand::BeginPhase(phase));
        self.push(PlanCommand::MoveTo {
            axis: Axis::SampleX,
            target: MoveTarget::InitialOffset(out.dx),
        });
        self.push(PlanCommand::MoveTo {
            axis: Axis::SampleY,
            target: MoveTarget::InitialOffset(out.dy),
        });
        if rotate {
            self.push(PlanCommand::MoveTo {
                axis: Axis::Rotation,
                target: MoveTarget::InitialOffset(out.dr),
            });
        }
        self.push(PlanCommand::SetDetector(DetectorSetting::FrameType(tag)));
        self.push(PlanCommand::SetDetector(DetectorSetting::NumImages(
            self.config.n_white.saturating_mul(self.images_per_frame()),
        )));
        self.push(PlanCommand::TriggerAndRead);
        self.push(PlanCommand::MoveTo {
            axis: Axis::SampleX,
            target: MoveTarget::Initial,
        });
        self.push(PlanCommand::MoveTo {
            axis: Axis::SampleY,
            target: MoveTarget::Initial,
        });
        if rotate {
            self.push(PlanCommand::MoveTo {
                axis: Axis::Rotation,
                target: MoveTarget::Initial,
            });
        }
    }

    fn queue_projection_start(&mut self) {
        self.push(PlanCommand::BeginPhase(ScanPhase::Projections));
        self.push(PlanCommand::SetDetector(DetectorSetting::FrameType(
            FrameType::Projection,
        )));
        if self.mode == ScanMode::Step {
            self.push(PlanCommand::SetDetector(DetectorSetting::NumImages(
                self.config.n_frames,
            )));
        }
    }

    fn queue_angle(&mut self, index: u32) {
        let angle = self.config.angle_at(index);
        self.push(PlanCommand::Checkpoint {
            label: format!("angle_{}", index),
        });
        self.push(PlanCommand::MoveTo {
            axis: Axis::Rotation,
            target: MoveTarget::Absolute(angle),
        });
        self.push(PlanCommand::TriggerAndRead);
    }

    fn queue_fly(&mut self) {
        self.push(PlanCommand::ConfigureFly(self.fly_params()));
        self.push(PlanCommand::Taxi);
        self.push(PlanCommand::SetDetector(DetectorSetting::TriggerMode(
            TriggerMode::Bulb,
        )));
        self.push(PlanCommand::SetDetector(DetectorSetting::NumImages(
            self.config.n_projections(),
        )));
        self.push(PlanCommand::FlyAndCollect);
        self.push(PlanCommand::SetDetector(DetectorSetting::TriggerMode(
            TriggerMode::Internal,
        )));
    }

    fn queue_dark(&mut self) {
        self.push(PlanCommand::BeginPhase(ScanPhase::Dark));
        self.push(PlanCommand::RemoveSuspender);
        self.push(PlanCommand::CloseShutter);
        self.push(PlanCommand::SetDetector(DetectorSetting::FrameType(
            FrameType::Dark,
        )));
        self.push(PlanCommand::SetDetector(DetectorSetting::NumImages(
            self.config.n_dark.saturating_mul(self.images_per_frame()),
        )));
        self.push(PlanCommand::TriggerAndRead);
    }

    /// Queue the next batch of commands and advance the step
    fn advance(&mut self) {
        self.step = match self.step {
            TomoStep::Setup => {
                self.queue_setup();
                TomoStep::WhiteFront
            }
            TomoStep::WhiteFront => {
                self.queue_white(ScanPhase::WhiteFront, FrameType::WhiteFront);
                self.queue_projection_start();
                match self.mode {
                    ScanMode::Step => TomoStep::Projection { index: 0 },
                    ScanMode::Fly => TomoStep::FlyProjections,
                }
            }
            TomoStep::Projection { index } => {
                self.queue_angle(index);
                if index + 1 < self.config.n_projections() {
                    TomoStep::Projection { index: index + 1 }
                } else {
                    TomoStep::WhiteBack
                }
            }
            TomoStep::FlyProjections => {
                self.queue_fly();
                TomoStep::WhiteBack
            }
            TomoStep::WhiteBack => {
                self.queue_white(ScanPhase::WhiteBack, FrameType::WhiteBack);
                TomoStep::Dark
            }
            TomoStep::Dark => {
                self.queue_dark();
                TomoStep::Done
            }
            TomoStep::Done => TomoStep::Done,
        };
    }
}

impl Plan for TomoScan {
    fn plan_name(&self) -> &str {
        match self.mode {
            ScanMode::Step => "tomo_step",
            ScanMode::Fly => "tomo_fly",
        }
    }

    fn plan_args(&self) -> HashMap<String, String> {
        let c = &self.config;
        let mut args = HashMap::new();
        args.insert("mode".to_string(), self.mode.to_string());
        args.insert("acquire_time".to_string(), c.acquire_time.to_string());
        args.insert("acquire_period".to_string(), c.acquire_period.to_string());
        args.insert("n_frames".to_string(), c.n_frames.to_string());
        args.insert("n_white".to_string(), c.n_white.to_string());
        args.insert("n_dark".to_string(), c.n_dark.to_string());
        args.insert("omega_start".to_string(), c.omega_start.to_string());
        args.insert("omega_end".to_string(), c.omega_end.to_string());
        args.insert("omega_step".to_string(), c.omega_step.to_string());
        args.insert("n_projections".to_string(), c.n_projections().to_string());
        args.insert("sample_out_dx".to_string(), c.sample_out.dx.to_string());
        args.insert("sample_out_dy".to_string(), c.sample_out.dy.to_string());
        args.insert("sample_out_dr".to_string(), c.sample_out.dr.to_string());
        args.insert("output_format".to_string(), self.sink.format.to_string());
        args.insert(
            "output_path".to_string(),
            self.sink.settings.file_path.display().to_string(),
        );
        args.insert("output_prefix".to_string(), self.sink.settings.file_name.clone());
        if self.mode == ScanMode::Fly {
            args.insert(
                "slew_speed".to_string(),
                c.effective_slew_speed().to_string(),
            );
        }
        args
    }

    fn num_points(&self) -> usize {
        self.config.n_projections() as usize
    }

    fn next_command(&mut self) -> Option<PlanCommand> {
        loop {
            if let Some(cmd) = self.pending.pop_front() {
                return Some(cmd);
            }
            if self.step == TomoStep::Done {
                return None;
            }
            self.advance();
        }
    }

    fn reset(&mut self) {
        self.step = TomoStep::Setup;
        self.pending.clear();
    }
}

/// Every command `plan` would issue, without touching devices
///
/// The plan is reset before and after.
pub fn summarize(plan: &mut dyn Plan) -> Vec<PlanCommand> {
    plan.reset();
    let mut commands = Vec::new();
    while let Some(cmd) = plan.next_command() {
        commands.push(cmd);
    }
    plan.reset();
    commands
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(config: ScanConfig, mode: ScanMode) -> TomoScan {
        TomoScan::from_config(&config, mode, &OutputConfigurator::new("/data/", "t")).unwrap()
    }

    fn frame_tags(commands: &[PlanCommand]) -> Vec<FrameType> {
        commands
            .iter()
            .filter_map(|c| match c {
                PlanCommand::SetDetector(DetectorSetting::FrameType(t)) => Some(*t),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_step_plan_triggers_once_per_angle_plus_backgrounds() {
        let mut p = plan(ScanConfig::new(0.0, 5.0, 0.5), ScanMode::Step);
        let commands = summarize(&mut p);
        let triggers = commands
            .iter()
            .filter(|c| **c == PlanCommand::TriggerAndRead)
            .count();
        // 11 angles, front white, back white, dark
        assert_eq!(triggers, 14);
        assert_eq!(p.num_points(), 11);
    }

    #[test]
    fn test_frame_type_order() {
        for mode in [ScanMode::Step, ScanMode::Fly] {
            let mut p = plan(ScanConfig::new(0.0, 5.0, 0.5), mode);
            assert_eq!(
                frame_tags(&summarize(&mut p)),
                vec![
                    FrameType::WhiteFront,
                    FrameType::Projection,
                    FrameType::WhiteBack,
                    FrameType::Dark
                ]
            );
        }
    }

    #[test]
    fn test_step_backgrounds_scaled_by_frame_filter() {
        let config = ScanConfig::new(0.0, 1.0, 0.5)
            .with_backgrounds(3, 2)
            .with_frames(4);
        let commands = summarize(&mut plan(config, ScanMode::Step));
        assert!(commands.contains(&PlanCommand::SetDetector(DetectorSetting::NumImages(12))));
        assert!(commands.contains(&PlanCommand::SetDetector(DetectorSetting::NumImages(8))));
        assert!(commands.contains(&PlanCommand::SetDetector(DetectorSetting::FrameFilter(
            Some(4)
        ))));
    }

    #[test]
    fn test_fly_plan_ignores_frame_count_and_rotation_offset() {
        let config = ScanConfig::new(0.0, 999.0, 1.0)
            .with_frames(5)
            .with_backgrounds(2, 2)
            .with_sample_out(-3.0, 0.0, 90.0);
        let commands = summarize(&mut plan(config, ScanMode::Fly));
        assert!(commands.contains(&PlanCommand::SetDetector(DetectorSetting::NumImages(1000))));
        assert!(commands.contains(&PlanCommand::SetDetector(DetectorSetting::NumImages(2))));
        assert!(!commands.iter().any(|c| matches!(
            c,
            PlanCommand::MoveTo {
                axis: Axis::Rotation,
                ..
            }
        )));
        assert!(commands.contains(&PlanCommand::SetDetector(DetectorSetting::SinkPort(
            ArrayPort::Pg1
        ))));
    }

    #[test]
    fn test_dark_phase_removes_suspender_before_closing() {
        let commands = summarize(&mut plan(ScanConfig::new(0.0, 1.0, 1.0), ScanMode::Step));
        let remove = commands
            .iter()
            .position(|c| *c == PlanCommand::RemoveSuspender)
            .unwrap();
        let close = commands
            .iter()
            .position(|c| *c == PlanCommand::CloseShutter)
            .unwrap();
        let dark = commands
            .iter()
            .position(|c| *c == PlanCommand::SetDetector(DetectorSetting::FrameType(FrameType::Dark)))
            .unwrap();
        assert!(remove < close && close < dark);
    }

    #[test]
    fn test_descending_sweep_angles() {
        let commands = summarize(&mut plan(ScanConfig::new(10.0, 0.0, -5.0), ScanMode::Step));
        let angles: Vec<f64> = commands
            .iter()
            .filter_map(|c| match c {
                PlanCommand::MoveTo {
                    axis: Axis::Rotation,
                    target: MoveTarget::Absolute(a),
                } => Some(*a),
                _ => None,
            })
            .collect();
        assert_eq!(angles, vec![10.0, 5.0, 0.0]);
    }

    #[test]
    fn test_unknown_output_rejected_at_build() {
        let config = ScanConfig::new(0.0, 1.0, 1.0).with_output(crate::scan::OutputSpec::new(
            "jpeg", "/d/", "x",
        ));
        let err = TomoScan::from_config(
            &config,
            ScanMode::Step,
            &OutputConfigurator::new("/data/", "t"),
        )
        .unwrap_err();
        assert!(matches!(err, crate::error::TomoError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_oversized_scans_rejected_at_build() {
        let configurator = OutputConfigurator::new("/data/", "t");
        for config in [
            ScanConfig::new(0.0, 180.0, 1e-9),
            ScanConfig::new(0.0, 1.0, 1.0)
                .with_backgrounds(70_000, 1)
                .with_frames(70_000),
        ] {
            let err = TomoScan::from_config(&config, ScanMode::Step, &configurator).unwrap_err();
            assert!(matches!(err, crate::error::TomoError::InvalidConfig(_)));
        }
    }
}
