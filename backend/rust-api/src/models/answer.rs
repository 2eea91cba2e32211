use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// One finalized response cycle. Expert and sample answers are seed data with no cycle key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Answer {
    #[serde(rename = "_id")]
    pub id: String,
    pub question_id: String,
    pub assignment_id: Option<String>,
    pub user_token: String,
    pub first_answer_choice: u32,
    pub rationale: String,
    pub second_answer_choice: Option<u32>,
    /// Id of the peer answer picked during review; `None` means "kept own rationale"
    pub chosen_rationale_id: Option<String>,
    #[serde(default)]
    pub expert: bool,
    #[serde(default)]
    pub sample: bool,
    #[serde(default)]
    pub upvotes: u32,
    #[serde(default)]
    pub downvotes: u32,
    pub datetime_start: Option<DateTime<Utc>>,
    pub datetime_first: Option<DateTime<Utc>>,
    pub datetime_second: Option<DateTime<Utc>>,
    pub grade: Option<f64>,
    /// Uniqueness key for student answers, backed by a unique sparse index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle_key: Option<String>,
}

impl Answer {
    pub fn net_votes(&self) -> i64 {
        i64::from(self.upvotes) - i64::from(self.downvotes)
    }
}

/// Candidate answer presented to a student during review.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShownRationale {
    #[serde(rename = "_id")]
    pub id: String,
    pub shown_for_answer_id: String,
    pub shown_answer_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoteType {
    Upvote,
    Downvote,
    FinalChoice,
}

impl VoteType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteType::Upvote => "upvote",
            VoteType::Downvote => "downvote",
            VoteType::FinalChoice => "final_choice",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FakeAttribution {
    pub username: String,
    pub country: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnswerVote {
    #[serde(rename = "_id")]
    pub id: String,
    pub answer_id: String,
    pub assignment_id: Option<String>,
    pub user_token: String,
    pub vote_type: VoteType,
    pub fake_attribution: Option<FakeAttribution>,
    pub created_at: DateTime<Utc>,
}

/// Form payload of one step, tagged by the state it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum StepSubmission {
    Start(StartSubmission),
    SequentialVote(SequentialVoteSubmission),
    Review(ReviewSubmission),
}

impl StepSubmission {
    pub fn name(&self) -> &'static str {
        match self {
            StepSubmission::Start(_) => "start",
            StepSubmission::SequentialVote(_) => "sequential_vote",
            StepSubmission::Review(_) => "review",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StartSubmission {
    #[validate(range(min = 1, message = "Please choose an answer"))]
    pub first_answer_choice: u32,
    #[validate(length(min = 1, max = 5000, message = "Please explain your answer"))]
    pub rationale: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequentialVote {
    Upvote,
    Downvote,
}

impl From<SequentialVote> for VoteType {
    fn from(vote: SequentialVote) -> Self {
        match vote {
            SequentialVote::Upvote => VoteType::Upvote,
            SequentialVote::Downvote => VoteType::Downvote,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequentialVoteSubmission {
    pub rationale_id: String,
    pub vote: SequentialVote,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ReviewSubmission {
    #[validate(range(min = 1, message = "Please choose an answer"))]
    pub second_answer_choice: u32,
    /// `None` keeps the student's own rationale
    pub chosen_rationale_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_submission_is_tagged() {
        let payload = json!({
            "step": "start",
            "first_answer_choice": 2,
            "rationale": "Because"
        });
        let parsed: StepSubmission = serde_json::from_value(payload).unwrap();
        assert_eq!(parsed.name(), "start");

        let payload = json!({
            "step": "sequential_vote",
            "rationale_id": "a1",
            "vote": "downvote"
        });
        let parsed: StepSubmission = serde_json::from_value(payload).unwrap();
        match parsed {
            StepSubmission::SequentialVote(vote) => {
                assert_eq!(VoteType::from(vote.vote), VoteType::Downvote)
            }
            other => panic!("unexpected submission {:?}", other),
        }
    }

    #[test]
    fn test_start_submission_validation() {
        let empty = StartSubmission {
            first_answer_choice: 0,
            rationale: String::new(),
        };
        let errors = empty.validate().unwrap_err();
        let fields = errors.field_errors();
        assert!(fields.contains_key("first_answer_choice"));
        assert!(fields.contains_key("rationale"));
    }

    #[test]
    fn test_cycle_key_not_serialized_for_seed_answers() {
        let answer = Answer {
            id: "e1".to_string(),
            question_id: "q".to_string(),
            assignment_id: None,
            user_token: String::new(),
            first_answer_choice: 1,
            rationale: "expert".to_string(),
            second_answer_choice: Some(1),
            chosen_rationale_id: None,
            expert: true,
            sample: false,
            upvotes: 0,
            downvotes: 0,
            datetime_start: None,
            datetime_first: None,
            datetime_second: None,
            grade: None,
            cycle_key: None,
        };
        let value = serde_json::to_value(&answer).unwrap();
        assert!(value.get("cycle_key").is_none());
        assert_eq!(value["_id"], "e1");
    }
}
