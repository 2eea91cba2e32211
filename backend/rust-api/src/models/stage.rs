use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::answer::{FakeAttribution, SequentialVote};

/// Bumped whenever the serialized layout of [`StageRecord`] changes.
pub const STAGE_RECORD_VERSION: u32 = 1;

/// Assignment component of the key when a question is answered outside an assignment.
pub const NO_ASSIGNMENT: &str = "test";

/// Scope of one answer cycle: (user, assignment-or-"test", question).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StageKey {
    pub user_token: String,
    pub assignment_id: Option<String>,
    pub question_id: String,
}

impl StageKey {
    pub fn new(user_token: &str, assignment_id: Option<&str>, question_id: &str) -> Self {
        Self {
            user_token: user_token.to_string(),
            assignment_id: assignment_id.map(|s| s.to_string()),
            question_id: question_id.to_string(),
        }
    }

    pub fn assignment_part(&self) -> &str {
        self.assignment_id.as_deref().unwrap_or(NO_ASSIGNMENT)
    }

    pub fn cache_key(&self) -> String {
        format!(
            "stage:{}:{}:{}",
            self.user_token,
            self.assignment_part(),
            self.question_id
        )
    }

    /// Key of the finalized answer guarded by the unique index.
    pub fn cycle_key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.question_id,
            self.assignment_part(),
            self.user_token
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompletedStage {
    Start,
    SequentialReview,
}

/// One candidate inside a bucket. `answer_id == None` is the "keep my own rationale" entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RationaleCandidate {
    pub answer_id: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RationaleBucket {
    pub choice: u32,
    pub label: String,
    pub rationales: Vec<RationaleCandidate>,
}

/// Realized output of a selection algorithm, cached for the rest of the cycle.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RationaleChoices {
    pub buckets: Vec<RationaleBucket>,
}

impl RationaleChoices {
    pub fn bucket(&self, choice: u32) -> Option<&RationaleBucket> {
        self.buckets.iter().find(|b| b.choice == choice)
    }

    /// Bucket holding the candidate with the given answer id.
    pub fn bucket_of(&self, answer_id: &str) -> Option<u32> {
        self.buckets
            .iter()
            .find(|b| {
                b.rationales
                    .iter()
                    .any(|r| r.answer_id.as_deref() == Some(answer_id))
            })
            .map(|b| b.choice)
    }

    pub fn candidate_ids(&self) -> BTreeSet<String> {
        self.buckets
            .iter()
            .flat_map(|b| b.rationales.iter())
            .filter_map(|r| r.answer_id.clone())
            .collect()
    }

    pub fn text_of(&self, answer_id: &str) -> Option<&str> {
        self.buckets
            .iter()
            .flat_map(|b| b.rationales.iter())
            .find(|r| r.answer_id.as_deref() == Some(answer_id))
            .map(|r| r.text.as_str())
    }

    /// Round-robin merge across buckets, skipping the "keep own" entry.
    pub fn round_robin(&self) -> Vec<String> {
        let per_bucket: Vec<Vec<&str>> = self
            .buckets
            .iter()
            .map(|b| {
                b.rationales
                    .iter()
                    .filter_map(|r| r.answer_id.as_deref())
                    .collect()
            })
            .collect();
        let longest = per_bucket.iter().map(|b| b.len()).max().unwrap_or(0);

        let mut sequence = Vec::new();
        for idx in 0..longest {
            for bucket in &per_bucket {
                if let Some(id) = bucket.get(idx) {
                    sequence.push((*id).to_string());
                }
            }
        }
        sequence
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageVote {
    pub answer_id: String,
    pub vote: SequentialVote,
    pub voted_at: DateTime<Utc>,
}

/// Serializable continuation of one answer cycle, kept in the session-scoped store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub version: u32,
    pub first_answer_choice: Option<u32>,
    pub rationale: Option<String>,
    pub datetime_start: Option<DateTime<Utc>>,
    pub datetime_first: Option<DateTime<Utc>>,
    pub completed_stage: Option<CompletedStage>,
    pub rationale_choices: Option<RationaleChoices>,
    pub rationale_sequence: Option<Vec<String>>,
    #[serde(default)]
    pub rationale_votes: Vec<StageVote>,
    #[serde(default)]
    pub rationale_index: usize,
    pub fake_attributions: Option<BTreeMap<String, FakeAttribution>>,
}

impl Default for StageRecord {
    fn default() -> Self {
        Self {
            version: STAGE_RECORD_VERSION,
            first_answer_choice: None,
            rationale: None,
            datetime_start: None,
            datetime_first: None,
            completed_stage: None,
            rationale_choices: None,
            rationale_sequence: None,
            rationale_votes: Vec::new(),
            rationale_index: 0,
            fake_attributions: None,
        }
    }
}

impl StageRecord {
    pub fn attribution_for(&self, answer_id: &str) -> Option<&FakeAttribution> {
        self.fake_attributions
            .as_ref()
            .and_then(|map| map.get(answer_id))
    }
}
