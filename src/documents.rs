//! Run documents
//!
//! Every run emits, in order:
//!
//! ```text
//! StartDoc (1)   plan arguments and session metadata
//!    │
//!    ├── EventDoc (N, one per detector trigger)
//!    │
//! StopDoc (1)    exit status and reason
//! ```
//!
//! Documents are broadcast by the run engine; persistence and live display
//! subscribe to the stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;
use uuid::Uuid;

use crate::scan::FrameType;

/// Generate a new unique document ID
pub fn new_uid() -> String {
    Uuid::new_v4().to_string()
}

/// Current timestamp in nanoseconds since Unix epoch
pub fn now_ns() -> u64 {
    Utc::now()
        .timestamp_nanos_opt()
        .map_or(0, |ns| u64::try_from(ns).unwrap_or(0))
}

/// Time this process first asked for its session start
pub fn session_started() -> DateTime<Utc> {
    static STARTED: OnceLock<DateTime<Utc>> = OnceLock::new();
    *STARTED.get_or_init(Utc::now)
}

/// `user@host` of the operator running the process
pub fn login_id() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}@{}", user, host)
}

/// Standard metadata recorded with every run
pub fn session_metadata(beamline_id: &str, proposal_id: &str) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    metadata.insert("beamline_id".to_string(), beamline_id.to_string());
    metadata.insert("proposal_id".to_string(), proposal_id.to_string());
    metadata.insert("pid".to_string(), std::process::id().to_string());
    metadata.insert("login_id".to_string(), login_id());
    metadata.insert("session_started".to_string(), session_started().to_rfc3339());
    metadata.insert(
        "software_version".to_string(),
        env!("CARGO_PKG_VERSION").to_string(),
    );
    metadata
}

/// Document types emitted during a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Document {
    /// Run start - intent and metadata
    Start(StartDoc),
    /// One detector trigger
    Event(EventDoc),
    /// Run end - completion status
    Stop(StopDoc),
}

impl Document {
    /// Run UID this document belongs to
    pub fn run_uid(&self) -> &str {
        match self {
            Document::Start(d) => &d.uid,
            Document::Event(d) => &d.run_uid,
            Document::Stop(d) => &d.run_uid,
        }
    }
}

/// Start document - emitted once the run has its devices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartDoc {
    /// Unique run identifier (this IS the run_uid)
    pub uid: String,
    /// Monotonic run number within this engine
    pub run_id: u64,
    /// Plan name, e.g. `tomo_step`
    pub plan_name: String,
    /// Plan arguments
    pub plan_args: HashMap<String, String>,
    /// Session metadata
    pub metadata: HashMap<String, String>,
    /// Timestamp when run started
    pub time_ns: u64,
}

impl StartDoc {
    /// New start document for run `run_id`
    pub fn new(run_id: u64, plan_name: &str) -> Self {
        Self {
            uid: new_uid(),
            run_id,
            plan_name: plan_name.to_string(),
            plan_args: HashMap::new(),
            metadata: HashMap::new(),
            time_ns: now_ns(),
        }
    }

    /// Attach plan arguments
    pub fn with_args(mut self, args: HashMap<String, String>) -> Self {
        self.plan_args = args;
        self
    }

    /// Attach metadata
    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Event document - one detector trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDoc {
    /// Unique event ID
    pub uid: String,
    /// Links to StartDoc
    pub run_uid: String,
    /// Sequence number within the run, from 1
    pub seq_num: u32,
    /// Timestamp
    pub time_ns: u64,
    /// Frame type active for this trigger
    pub frame_type: Option<FrameType>,
    /// Images the camera produced
    pub images: u32,
    /// Frames the sink archived
    pub archived: u32,
    /// Axis positions (axis name -> position)
    pub positions: HashMap<String, f64>,
}

impl EventDoc {
    /// New event document
    pub fn new(run_uid: &str, seq_num: u32) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            seq_num,
            time_ns: now_ns(),
            frame_type: None,
            images: 0,
            archived: 0,
            positions: HashMap::new(),
        }
    }

    /// Record the acquisition counts
    pub fn with_counts(mut self, images: u32, archived: u32) -> Self {
        self.images = images;
        self.archived = archived;
        self
    }

    /// Record the frame type
    pub fn with_frame_type(mut self, frame_type: Option<FrameType>) -> Self {
        self.frame_type = frame_type;
        self
    }

    /// Record one axis position
    pub fn with_position(mut self, axis: &str, position: f64) -> Self {
        self.positions.insert(axis.to_string(), position);
        self
    }
}

/// Stop document - emitted after cleanup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopDoc {
    /// Unique stop doc ID
    pub uid: String,
    /// Links to StartDoc
    pub run_uid: String,
    /// Exit status: "success" or "fail"
    pub exit_status: String,
    /// Reason for failure
    pub reason: String,
    /// Timestamp when run ended
    pub time_ns: u64,
    /// Total events emitted
    pub num_events: u32,
}

impl StopDoc {
    /// Run completed every phase
    pub fn success(run_uid: &str, num_events: u32) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            exit_status: "success".to_string(),
            reason: String::new(),
            time_ns: now_ns(),
            num_events,
        }
    }

    /// Run failed with `reason`
    pub fn fail(run_uid: &str, reason: &str, num_events: u32) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            exit_status: "fail".to_string(),
            reason: reason.to_string(),
            time_ns: now_ns(),
            num_events,
        }
    }

    /// Whether the run succeeded
    pub fn is_success(&self) -> bool {
        self.exit_status == "success"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_serialization_tags_type() {
        let doc = Document::Stop(StopDoc::fail("run-1", "shutter fault", 3));
        let json = serde_json::to_string(&doc).unwrap();
        assert!(json.contains("\"type\":\"stop\""));
        assert!(json.contains("shutter fault"));
        assert_eq!(doc.run_uid(), "run-1");
    }

    #[test]
    fn test_session_metadata_fields() {
        let meta = session_metadata("APS 6-BM-A", "GUP-1234");
        assert_eq!(meta["beamline_id"], "APS 6-BM-A");
        assert_eq!(meta["pid"], std::process::id().to_string());
        assert!(meta["login_id"].contains('@'));
        assert_eq!(meta["session_started"], session_started().to_rfc3339());
    }

    #[test]
    fn test_event_builder() {
        let event = EventDoc::new("run-1", 4)
            .with_counts(5, 1)
            .with_frame_type(Some(FrameType::Projection))
            .with_position("rotation", 1.5);
        assert_eq!(event.positions["rotation"], 1.5);
        assert_eq!(event.archived, 1);
    }
}
