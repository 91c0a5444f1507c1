//! Scan document and session file integration tests
//!
//! Loads scan documents and session configuration from disk and runs them
//! end to end on the simulated beamline.

use std::io::Write;
use std::time::Duration;

use tempfile::NamedTempFile;
use tomo_daq::config::SessionConfig;
use tomo_daq::devices::SinkKind;
use tomo_daq::engine::RunEngine;
use tomo_daq::error::TomoError;
use tomo_daq::mode::{Mode, ModeController};
use tomo_daq::scan::{FrameType, ScanConfig, ScanMode};

const SCAN_YAML: &str = r#"
tomo:
  acquire_time: 0.01
  acquire_period: 0.012
  n_frames: 2
  n_white: 3
  n_dark: 2
  omega_start: 0.0
  omega_end: 3.0
  omega_step: 1.0
  mode: fly
  sample_out_position:
    samx: -3.0
    samy: 0.5
    preci: 0.0
output:
  type: TIFF
"#;

const SESSION_TOML: &str = r#"
[session]
mode = "debug"
beamline_id = "APS 2-BM-A"
proposal_id = "GUP-71234"
file_path = "/data/2-bm/"
file_prefix = "basalt"
log_level = "debug"

[timeouts]
motor = "5s"
detector = "10s"

[suspenders]
current_floor = 5.0
current_resume = 20.0

[fly]
stall_poll = "20ms"
stall_timeout = "2s"
"#;

fn write_temp(contents: &str, suffix: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_scan_document_from_file() {
    let file = write_temp(SCAN_YAML, ".yaml");
    let scan = ScanConfig::load(file.path()).unwrap();

    assert_eq!(scan.mode, ScanMode::Fly);
    assert_eq!(scan.n_projections(), 4);
    assert_eq!(scan.sample_out.dx, -3.0);
    assert_eq!(scan.sample_out.dy, 0.5);
    assert_eq!(scan.total_images(), 2 * 3 + 4 + 2);
    assert!(scan.output.filepath.is_none());

    let from_source = ScanConfig::from_source(file.path()).unwrap();
    assert_eq!(from_source, scan);
}

#[test]
fn test_scan_document_missing_file() {
    let err = ScanConfig::load("/nonexistent/scan.yaml").unwrap_err();
    assert!(matches!(err, TomoError::Io(_)));
}

#[test]
fn test_session_file_overrides_defaults() {
    let file = write_temp(SESSION_TOML, ".toml");
    let session = SessionConfig::load_from(file.path()).unwrap();

    assert_eq!(session.session.mode, Mode::Debug);
    assert_eq!(session.session.beamline_id, "APS 2-BM-A");
    assert_eq!(session.timeouts.motor, Duration::from_secs(5));
    assert_eq!(session.timeouts.shutter, Duration::from_secs(30));
    assert_eq!(session.suspenders.current_resume, 20.0);
    assert_eq!(session.fly.stall_poll, Duration::from_millis(20));
}

#[tokio::test]
async fn test_scan_file_runs_with_session_output_defaults() {
    let session = SessionConfig::load_from(write_temp(SESSION_TOML, ".toml").path()).unwrap();
    let scan = ScanConfig::load(write_temp(SCAN_YAML, ".yaml").path()).unwrap();

    let controller = ModeController::new();
    let devices = controller.bind(session.session.mode).await.unwrap();
    let engine = RunEngine::new(devices, session);
    let mut docs = engine.subscribe();

    let result = engine.run(&scan, scan.mode).await.unwrap();
    let summary = result.summary().expect("scan should succeed");
    assert_eq!(summary.sink, SinkKind::Tiff);
    assert_eq!(summary.archived, scan.total_images());

    let archive = controller.simulation().detector.archive().await;
    assert_eq!(archive[0].file_name, "/data/2-bm/basalt_000000.tiff");
    assert_eq!(archive[0].frame_type, Some(FrameType::WhiteFront));

    let Ok(tomo_daq::documents::Document::Start(start)) = docs.recv().await else {
        panic!("first document should be a start document");
    };
    assert_eq!(start.plan_name, "tomo_fly");
    assert_eq!(start.metadata["beamline_id"], "APS 2-BM-A");
    assert_eq!(start.metadata["proposal_id"], "GUP-71234");
}
