use axum::{
    extract::{FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// JSON extractor for step submissions.
///
/// Malformed bodies (unknown `step` tag, wrong field types) are rejected with
/// the same `{message, status}` body the question handlers use for errors.
pub struct AppJson<T>(pub T);

impl<T, S> FromRequest<S> for AppJson<T>
where
    T: serde::de::DeserializeOwned + 'static,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(AppJson(value)),
            Err(rejection) => {
                let message = format!("Malformed submission: {}", rejection.body_text());
                tracing::warn!(status = %rejection.status(), "{}", message);
                Err((
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "message": message, "status": 400 })),
                )
                    .into_response())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StepSubmission;
    use axum::body::{to_bytes, Body};

    #[tokio::test]
    async fn test_unknown_step_is_bad_request() {
        let request = Request::builder()
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"step":"teleport"}"#))
            .unwrap();

        let rejection = match AppJson::<StepSubmission>::from_request(request, &()).await {
            Ok(_) => panic!("unknown step accepted"),
            Err(response) => response,
        };
        assert_eq!(rejection.status(), StatusCode::BAD_REQUEST);
        let body = to_bytes(rejection.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], 400);
        assert!(json["message"]
            .as_str()
            .unwrap()
            .starts_with("Malformed submission"));
    }
}
