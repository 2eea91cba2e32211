use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChoiceStats {
    pub choice: u32,
    pub label: String,
    pub correct: bool,
    pub first_count: u32,
    pub second_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransitionStats {
    pub from_choice: u32,
    pub to_choice: u32,
    pub count: u32,
}

/// Aggregate first→second statistics for one question.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultsView {
    pub question_id: String,
    pub assignment_id: Option<String>,
    pub total_answers: u32,
    pub choices: Vec<ChoiceStats>,
    pub transitions: Vec<TransitionStats>,
    pub first_correct_ratio: f64,
    pub second_correct_ratio: f64,
    pub own_first_answer_choice: u32,
    pub own_second_answer_choice: u32,
    pub own_grade: f64,
}
