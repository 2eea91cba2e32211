use crate::models::step::FieldErrors;

use super::selection::SelectionError;

/// Conditions the answering engine recovers from or reports to the caller.
#[derive(Debug, thiserror::Error)]
pub enum AnsweringError {
    /// Stage data is missing or inconsistent; the cycle restarts from START
    #[error("Reload: {0}")]
    Reload(String),
    #[error("Selection error: {0}")]
    Selection(#[from] SelectionError),
    /// A finalized answer already exists for this (question, assignment, user)
    #[error("Answer already finalized")]
    DuplicateAnswer,
    #[error("Invalid submission")]
    Validation(FieldErrors),
    #[error("Question {0} not found")]
    QuestionNotFound(String),
    #[error("No finalized answer for question {0}")]
    NotFinalized(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AnsweringError {
    pub fn reload(message: impl Into<String>) -> Self {
        AnsweringError::Reload(message.into())
    }

    pub fn field(field: &str, message: impl Into<String>) -> Self {
        let mut errors = FieldErrors::new();
        errors.insert(field.to_string(), vec![message.into()]);
        AnsweringError::Validation(errors)
    }

    pub fn from_validation(errors: &validator::ValidationErrors) -> Self {
        let mut fields = FieldErrors::new();
        for (field, errs) in errors.field_errors() {
            let messages = errs
                .iter()
                .map(|e| {
                    e.message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| e.code.to_string())
                })
                .collect();
            fields.insert(field.to_string(), messages);
        }
        AnsweringError::Validation(fields)
    }
}
