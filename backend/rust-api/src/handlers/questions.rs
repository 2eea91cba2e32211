use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::{
    extractors::AppJson,
    middlewares::auth::JwtClaims,
    models::{results::ResultsView, StepOutcome, StepResponse, StepSubmission},
    services::{answering::QuestionAnsweringService, errors::AnsweringError, AppState},
};

#[derive(Debug, Default, Deserialize)]
pub struct AssignmentQuery {
    pub assignment_id: Option<String>,
}

impl AssignmentQuery {
    /// `?assignment_id=` with an empty value means standalone practice
    fn assignment_id(&self) -> Option<&str> {
        self.assignment_id.as_deref().filter(|id| !id.is_empty())
    }
}

pub async fn get_step(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(question_id): Path<String>,
    Query(query): Query<AssignmentQuery>,
) -> Result<Json<StepResponse>, QuestionApiError> {
    let service = QuestionAnsweringService::new(&state);
    let response = service
        .render(&claims.learner(), &question_id, query.assignment_id())
        .await?;
    Ok(Json(response))
}

pub async fn post_step(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(question_id): Path<String>,
    Query(query): Query<AssignmentQuery>,
    AppJson(submission): AppJson<StepSubmission>,
) -> Result<Response, QuestionApiError> {
    let service = QuestionAnsweringService::new(&state);
    let response = service
        .submit(
            &claims.learner(),
            &question_id,
            query.assignment_id(),
            submission,
        )
        .await?;

    if response.outcome == StepOutcome::AlreadyCompleted {
        let location = step_location(&question_id, query.assignment_id());
        let mut redirect = (StatusCode::SEE_OTHER, Json(response)).into_response();
        if let Ok(value) = HeaderValue::from_str(&location) {
            redirect.headers_mut().insert(header::LOCATION, value);
        }
        return Ok(redirect);
    }

    Ok(Json(response).into_response())
}

pub async fn delete_step(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(question_id): Path<String>,
    Query(query): Query<AssignmentQuery>,
) -> Result<Json<StepResponse>, QuestionApiError> {
    let service = QuestionAnsweringService::new(&state);
    let response = service
        .reset(&claims.learner(), &question_id, query.assignment_id())
        .await?;
    Ok(Json(response))
}

pub async fn get_results(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(question_id): Path<String>,
    Query(query): Query<AssignmentQuery>,
) -> Result<Json<ResultsView>, QuestionApiError> {
    let service = QuestionAnsweringService::new(&state);
    let results = service
        .results(&claims.learner(), &question_id, query.assignment_id())
        .await?;
    Ok(Json(results))
}

fn step_location(question_id: &str, assignment_id: Option<&str>) -> String {
    let mut location = url::form_urlencoded::Serializer::new(String::new());
    if let Some(assignment_id) = assignment_id {
        location.append_pair("assignment_id", assignment_id);
    }
    let query = location.finish();
    let path = format!(
        "/api/v1/questions/{}/steps",
        url::form_urlencoded::byte_serialize(question_id.as_bytes()).collect::<String>()
    );
    if query.is_empty() {
        path
    } else {
        format!("{}?{}", path, query)
    }
}

#[derive(Debug)]
pub enum QuestionApiError {
    NotFound(String),
    Conflict(String),
    BadRequest(String),
    Internal(String),
}

impl From<AnsweringError> for QuestionApiError {
    fn from(error: AnsweringError) -> Self {
        match error {
            AnsweringError::QuestionNotFound(_) | AnsweringError::NotFinalized(_) => {
                QuestionApiError::NotFound(error.to_string())
            }
            AnsweringError::DuplicateAnswer => QuestionApiError::Conflict(error.to_string()),
            AnsweringError::Validation(errors) => QuestionApiError::BadRequest(
                errors
                    .into_iter()
                    .map(|(field, messages)| format!("{}: {}", field, messages.join(", ")))
                    .collect::<Vec<_>>()
                    .join("; "),
            ),
            // Normally recovered inside the service
            AnsweringError::Reload(message) => QuestionApiError::Conflict(message),
            AnsweringError::Selection(e) => QuestionApiError::Conflict(e.message),
            AnsweringError::Internal(e) => {
                tracing::error!("Answering request failed: {:#}", e);
                QuestionApiError::Internal("Internal server error".to_string())
            }
        }
    }
}

impl IntoResponse for QuestionApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            QuestionApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            QuestionApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            QuestionApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            QuestionApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (
            status,
            Json(json!({ "message": message, "status": status.as_u16() })),
        )
            .into_response()
    }
}
