#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{HeaderMap, Request, StatusCode},
    Router,
};
use peerinstruction_api::{
    config::{Config, EngineConfig},
    create_router,
    middlewares::auth::{JwtClaims, JwtService},
    models::{Answer, AnswerChoice, AnswerStyle, GradingScheme, Question, QuestionKind},
    services::{
        answer_store::InMemoryAnswerStore,
        grade_delivery::{GradeDelivery, GradeReport},
        quality_filter::StaticQualityFilter,
        question_store::InMemoryQuestionStore,
        stage_store::InMemoryStageStore,
        tracking::InMemoryEventSink,
        AppState, Stores,
    },
};
use tower::ServiceExt;

pub const JWT_SECRET: &str = "test-secret";

/// Records every delivered grade; optionally fails like an unreachable LMS.
#[derive(Default)]
pub struct RecordingGradeDelivery {
    pub fail: bool,
    reports: Mutex<Vec<GradeReport>>,
}

impl RecordingGradeDelivery {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn reports(&self) -> Vec<GradeReport> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl GradeDelivery for RecordingGradeDelivery {
    async fn deliver(&self, report: &GradeReport) -> anyhow::Result<()> {
        self.reports.lock().unwrap().push(report.clone());
        if self.fail {
            return Err(anyhow!("LMS returned 503"));
        }
        Ok(())
    }
}

pub struct TestApp {
    pub router: Router,
    pub questions: Arc<InMemoryQuestionStore>,
    pub answers: Arc<InMemoryAnswerStore>,
    pub stages: Arc<InMemoryStageStore>,
    pub events: Arc<InMemoryEventSink>,
    pub grades: Arc<RecordingGradeDelivery>,
}

pub struct TestAppBuilder {
    engine: EngineConfig,
    filter: StaticQualityFilter,
    grades: RecordingGradeDelivery,
}

impl TestAppBuilder {
    pub fn new() -> Self {
        Self {
            engine: EngineConfig::default(),
            filter: StaticQualityFilter::default(),
            grades: RecordingGradeDelivery::default(),
        }
    }

    pub fn rationales_per_bucket(mut self, per_bucket: usize) -> Self {
        self.engine.rationales_per_bucket = per_bucket;
        self
    }

    pub fn fake_attributions(mut self, usernames: &[&str], countries: &[&str]) -> Self {
        self.engine.fake_usernames = usernames.iter().map(|s| s.to_string()).collect();
        self.engine.fake_countries = countries.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn filter(mut self, filter: StaticQualityFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn failing_grade_delivery(mut self) -> Self {
        self.grades = RecordingGradeDelivery::failing();
        self
    }

    pub fn build(self) -> TestApp {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();

        let questions = Arc::new(InMemoryQuestionStore::new());
        let answers = Arc::new(InMemoryAnswerStore::new());
        let stages = Arc::new(InMemoryStageStore::new(self.engine.stage_ttl_seconds));
        let events = Arc::new(InMemoryEventSink::new());
        let grades = Arc::new(self.grades);

        let config = Config {
            mongo_uri: "mongodb://unused".to_string(),
            redis_uri: "redis://unused".to_string(),
            mongo_database: "peerinstruction_test".to_string(),
            jwt_secret: JWT_SECRET.to_string(),
            bind_addr: "127.0.0.1:0".to_string(),
            engine: self.engine,
            grade_delivery: None,
        };

        let stores = Stores {
            questions: questions.clone(),
            answers: answers.clone(),
            stages: stages.clone(),
            events: events.clone(),
            grade_delivery: grades.clone(),
            rationale_filter: Arc::new(self.filter),
        };

        let state = Arc::new(AppState::with_stores(config, stores));

        TestApp {
            router: create_router(state),
            questions,
            answers,
            stages,
            events,
            grades,
        }
    }
}

pub fn create_test_app() -> TestApp {
    TestAppBuilder::new().build()
}

pub fn token_for(user: &str, course_id: Option<&str>) -> String {
    let now = chrono::Utc::now().timestamp() as usize;
    JwtService::new(JWT_SECRET)
        .generate_token(JwtClaims {
            sub: user.to_string(),
            role: "student".to_string(),
            course_id: course_id.map(|c| c.to_string()),
            exp: now + 3600,
            iat: now,
        })
        .unwrap()
}

/// Question with `correct.len()` choices, `correct[i]` telling whether choice i+1 is correct.
pub fn question(id: &str, correct: &[bool]) -> Question {
    Question {
        id: id.to_string(),
        title: format!("Question {}", id),
        text: "Which statements are true?".to_string(),
        kind: QuestionKind::PeerInstruction,
        answer_choices: correct
            .iter()
            .enumerate()
            .map(|(i, correct)| AnswerChoice {
                text: format!("Statement {}", i + 1),
                correct: *correct,
            })
            .collect(),
        answer_style: AnswerStyle::Alpha,
        grading_scheme: GradingScheme::Standard,
        rationale_selection_algorithm: "prefer_expert_and_highly_voted".to_string(),
        sequential_review: false,
        fake_attributions: false,
    }
}

/// A finalized peer answer usable as a rationale candidate.
pub fn peer_answer(id: &str, question_id: &str, first_choice: u32, rationale: &str) -> Answer {
    Answer {
        id: id.to_string(),
        question_id: question_id.to_string(),
        assignment_id: None,
        user_token: format!("peer-{}", id),
        first_answer_choice: first_choice,
        rationale: rationale.to_string(),
        second_answer_choice: Some(first_choice),
        chosen_rationale_id: None,
        expert: false,
        sample: false,
        upvotes: 0,
        downvotes: 0,
        datetime_start: None,
        datetime_first: None,
        datetime_second: None,
        grade: None,
        cycle_key: None,
    }
}

impl TestApp {
    pub fn add_question(&self, question: Question) {
        self.questions.insert(question).unwrap();
    }

    /// Seeds `count` peer answers per listed choice, ids `{question}-c{choice}-{n}`.
    pub fn add_peers(&self, question_id: &str, choices: &[u32], count: usize) {
        for choice in choices {
            for n in 1..=count {
                self.answers
                    .insert(peer_answer(
                        &format!("{}-c{}-{}", question_id, choice, n),
                        question_id,
                        *choice,
                        &format!("Peer reasoning {} for choice {}", n, choice),
                    ))
                    .unwrap();
            }
        }
    }

    pub async fn request(
        &self,
        method: &str,
        uri: &str,
        token: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, HeaderMap, serde_json::Value) {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {}", token));
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let response = self
            .router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, headers, json)
    }

    pub async fn get_step(&self, token: &str, question_id: &str) -> (StatusCode, serde_json::Value) {
        let (status, _, json) = self
            .request("GET", &steps_uri(question_id), token, None)
            .await;
        (status, json)
    }

    pub async fn post_step(
        &self,
        token: &str,
        question_id: &str,
        body: serde_json::Value,
    ) -> (StatusCode, HeaderMap, serde_json::Value) {
        self.request("POST", &steps_uri(question_id), token, Some(body))
            .await
    }
}

pub fn steps_uri(question_id: &str) -> String {
    format!("/api/v1/questions/{}/steps", question_id)
}

/// Answer ids displayed in a review view, bucket by bucket (`None` = keep own).
pub fn displayed_ids(view: &serde_json::Value) -> Vec<(u64, Option<String>)> {
    view["buckets"]
        .as_array()
        .unwrap()
        .iter()
        .flat_map(|bucket| {
            let choice = bucket["choice"].as_u64().unwrap();
            bucket["rationales"]
                .as_array()
                .unwrap()
                .iter()
                .map(move |r| (choice, r["answer_id"].as_str().map(|s| s.to_string())))
        })
        .collect()
}

pub fn start_body(first_choice: u32, rationale: &str) -> serde_json::Value {
    serde_json::json!({
        "step": "start",
        "first_answer_choice": first_choice,
        "rationale": rationale,
    })
}

pub fn review_body(second_choice: u32, chosen: Option<&str>) -> serde_json::Value {
    serde_json::json!({
        "step": "review",
        "second_answer_choice": second_choice,
        "chosen_rationale_id": chosen,
    })
}

impl TestApp {
    /// Submits the first answer and returns the view of the next state.
    pub async fn answer_first(
        &self,
        token: &str,
        question_id: &str,
        first_choice: u32,
    ) -> serde_json::Value {
        let (status, _, json) = self
            .post_step(
                token,
                question_id,
                start_body(first_choice, "This is long enough text"),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "unexpected response: {}", json);
        assert_eq!(json["outcome"], "advanced", "unexpected response: {}", json);
        json["view"].clone()
    }

    pub fn answers_of(&self, user: &str) -> Vec<Answer> {
        self.answers
            .answers()
            .unwrap()
            .into_iter()
            .filter(|a| a.user_token == user && a.cycle_key.is_some())
            .collect()
    }

    pub fn event_types(&self) -> Vec<&'static str> {
        self.events
            .events()
            .iter()
            .map(|e| e.event_type.as_str())
            .collect()
    }
}
