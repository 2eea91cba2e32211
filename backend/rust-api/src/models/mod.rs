pub mod answer;
pub mod question;
pub mod results;
pub mod stage;
pub mod step;
pub mod tracking;

pub use answer::{Answer, AnswerVote, FakeAttribution, ShownRationale, StepSubmission, VoteType};
pub use question::{AnswerChoice, AnswerStyle, GradingScheme, Question, QuestionKind};
pub use stage::{CompletedStage, RationaleChoices, StageKey, StageRecord};
pub use step::{StepOutcome, StepResponse, StepView};
