use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::answer::FakeAttribution;
use super::question::{LabelledChoice, Question, QuestionKind};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestionView {
    pub id: String,
    pub title: String,
    pub text: String,
    pub kind: QuestionKind,
    pub choices: Vec<LabelledChoice>,
}

impl From<&Question> for QuestionView {
    fn from(question: &Question) -> Self {
        Self {
            id: question.id.clone(),
            title: question.title.clone(),
            text: question.text.clone(),
            kind: question.kind,
            choices: question.labelled_choices(),
        }
    }
}

/// A rationale as rendered to the student. `text_html` is always safe to embed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DisplayedRationale {
    pub answer_id: Option<String>,
    pub text_html: String,
    pub attribution: Option<FakeAttribution>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DisplayedBucket {
    pub choice: u32,
    pub label: String,
    pub rationales: Vec<DisplayedRationale>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FirstAnswerView {
    pub choice: u32,
    pub label: String,
    pub rationale: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SummaryView {
    pub answer_id: String,
    pub first_answer_choice: u32,
    pub first_answer_label: String,
    pub first_correct: bool,
    pub rationale: String,
    pub second_answer_choice: u32,
    pub second_answer_label: String,
    pub second_correct: bool,
    pub chosen_rationale: Option<String>,
    pub grade: f64,
}

/// Render directive for the state the cycle is currently in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StepView {
    Start {
        question: QuestionView,
    },
    SequentialReview {
        question: QuestionView,
        first_answer: FirstAnswerView,
        rationale: DisplayedRationale,
        /// 1-based position within the sequence
        position: usize,
        total: usize,
    },
    Review {
        question: QuestionView,
        first_answer: FirstAnswerView,
        buckets: Vec<DisplayedBucket>,
    },
    Summary {
        question: QuestionView,
        summary: SummaryView,
    },
}

impl StepView {
    pub fn state_name(&self) -> &'static str {
        match self {
            StepView::Start { .. } => "start",
            StepView::SequentialReview { .. } => "sequential_review",
            StepView::Review { .. } => "review",
            StepView::Summary { .. } => "summary",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// Plain render of the current state
    Rendered,
    /// Moved (or stayed, for sequential review) to the state in `view`
    Advanced,
    /// Field validation failed; `view` is the unchanged current state
    Invalid,
    /// Stage data was inconsistent; the cycle restarted from START
    Reset,
    /// A finalized answer already exists; nothing was written
    AlreadyCompleted,
}

pub type FieldErrors = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResponse {
    pub outcome: StepOutcome,
    pub view: StepView,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: FieldErrors,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
}
