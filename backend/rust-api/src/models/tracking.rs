use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingEventType {
    ProblemShow,
    ProblemCheck,
    SaveProblemSuccess,
}

impl TrackingEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackingEventType::ProblemShow => "problem_show",
            TrackingEventType::ProblemCheck => "problem_check",
            TrackingEventType::SaveProblemSuccess => "save_problem_success",
        }
    }
}

/// Structured analytics event emitted by the answering engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingEvent {
    #[serde(rename = "_id")]
    pub id: String,
    pub event_type: TrackingEventType,
    pub timestamp: DateTime<Utc>,
    pub question_id: String,
    pub assignment_id: Option<String>,
    pub user_token: String,
    pub payload: serde_json::Value,
}
