use serde::{Deserialize, Serialize};

/// Question as authored by the content subsystem. Read-only for the answering engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    #[serde(rename = "_id")]
    pub id: String,
    pub title: String,
    pub text: String,
    #[serde(default)]
    pub kind: QuestionKind,
    /// Ordered answer choices; ordinal position 1..=n drives the label
    pub answer_choices: Vec<AnswerChoice>,
    #[serde(default)]
    pub answer_style: AnswerStyle,
    #[serde(default)]
    pub grading_scheme: GradingScheme,
    #[serde(default = "default_algorithm")]
    pub rationale_selection_algorithm: String,
    #[serde(default)]
    pub sequential_review: bool,
    #[serde(default)]
    pub fake_attributions: bool,
}

fn default_algorithm() -> String {
    "prefer_expert_and_highly_voted".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerChoice {
    pub text: String,
    pub correct: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    #[default]
    PeerInstruction,
    RationaleOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerStyle {
    #[default]
    Alpha,
    Numeric,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradingScheme {
    #[default]
    Standard,
    Advanced,
}

impl GradingScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            GradingScheme::Standard => "standard",
            GradingScheme::Advanced => "advanced",
        }
    }
}

impl Question {
    /// Label of the 1-based choice, e.g. `B` (alpha) or `2` (numeric).
    pub fn choice_label(&self, choice: u32) -> String {
        match self.answer_style {
            AnswerStyle::Alpha => {
                let mut n = choice;
                let mut label = Vec::new();
                while n > 0 {
                    let rem = ((n - 1) % 26) as u8;
                    label.push((b'A' + rem) as char);
                    n = (n - 1) / 26;
                }
                label.iter().rev().collect()
            }
            AnswerStyle::Numeric => choice.to_string(),
        }
    }

    pub fn choice_count(&self) -> u32 {
        self.answer_choices.len() as u32
    }

    pub fn has_choice(&self, choice: u32) -> bool {
        choice >= 1 && choice <= self.choice_count()
    }

    pub fn is_correct(&self, choice: u32) -> bool {
        if !self.has_choice(choice) {
            return false;
        }
        self.answer_choices[(choice - 1) as usize].correct
    }

    pub fn correct_choices(&self) -> Vec<u32> {
        (1..=self.choice_count())
            .filter(|c| self.is_correct(*c))
            .collect()
    }

    /// Choices rendered for the student: (choice, label, text)
    pub fn labelled_choices(&self) -> Vec<LabelledChoice> {
        self.answer_choices
            .iter()
            .enumerate()
            .map(|(idx, choice)| {
                let number = idx as u32 + 1;
                LabelledChoice {
                    choice: number,
                    label: self.choice_label(number),
                    text: choice.text.clone(),
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LabelledChoice {
    pub choice: u32,
    pub label: String,
    pub text: String,
}
