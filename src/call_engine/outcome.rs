//! Call outcome events for the external call-log collaborator

use async_trait::async_trait;
use serde::Serialize;

// ============================================================================
// CALL OUTCOME
// ============================================================================

/// Emitted once per call attempt, from the local side's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CallOutcome {
    Missed,
    Rejected,
    Completed {
        #[serde(rename = "durationMs")]
        duration_ms: u64,
    },
}

impl CallOutcome {
    pub fn duration_ms(&self) -> Option<u64> {
        match self {
            CallOutcome::Completed { duration_ms } => Some(*duration_ms),
            _ => None,
        }
    }

    /// Line written into the conversation log
    pub fn log_text(&self, is_video: bool) -> String {
        match self {
            CallOutcome::Missed => "Missed call".to_string(),
            CallOutcome::Rejected => "Call declined".to_string(),
            CallOutcome::Completed { duration_ms } => {
                let kind = if is_video { "Video call" } else { "Voice call" };
                format!("{} - {}", kind, format_duration(*duration_ms))
            }
        }
    }
}

/// `m:ss`, or `h:mm:ss` from one hour on
pub fn format_duration(duration_ms: u64) -> String {
    let total = duration_ms / 1000;
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

// ============================================================================
// CALL LOG COLLABORATOR
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeReport {
    pub pair_id: String,
    pub remote_id: String,
    pub outcome: CallOutcome,
    pub is_video: bool,
}

#[async_trait]
pub trait CallLog: Send + Sync {
    async fn on_call_outcome(&self, report: OutcomeReport);
}

/// Writes outcomes to the tracing log only
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingCallLog;

#[async_trait]
impl CallLog for TracingCallLog {
    async fn on_call_outcome(&self, report: OutcomeReport) {
        tracing::info!(
            "Call with {} ({}): {}",
            report.remote_id,
            report.pair_id,
            report.outcome.log_text(report.is_video)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "0:00");
        assert_eq!(format_duration(65_400), "1:05");
        assert_eq!(format_duration(3_600_000 + 61_000), "1:01:01");
    }

    #[test]
    fn test_log_text() {
        let completed = CallOutcome::Completed { duration_ms: 65_000 };
        assert_eq!(completed.log_text(true), "Video call - 1:05");
        assert_eq!(completed.log_text(false), "Voice call - 1:05");
        assert_eq!(CallOutcome::Missed.log_text(true), "Missed call");
        assert_eq!(CallOutcome::Rejected.log_text(false), "Call declined");
    }

    #[test]
    fn test_outcome_event_shape() {
        let value = serde_json::to_value(CallOutcome::Completed { duration_ms: 1200 }).unwrap();
        assert_eq!(value, serde_json::json!({ "kind": "completed", "durationMs": 1200 }));
        assert_eq!(CallOutcome::Missed.duration_ms(), None);
    }
}
