mod common;

use axum::http::{header, StatusCode};
use peerinstruction_api::models::{CompletedStage, StageKey, StageRecord};
use peerinstruction_api::services::stage_store::StageStore;

use common::{question, review_body, steps_uri, token_for, TestAppBuilder};

#[tokio::test]
async fn test_missing_choices_on_review_submit_resets_to_start() {
    let app = common::create_test_app();
    app.add_question(question("c1", &[false, true, false, true]));
    app.add_peers("c1", &[2, 4], 3);
    let token = token_for("student-c1", None);

    let corrupted = StageRecord {
        first_answer_choice: Some(2),
        rationale: Some("This is long enough text".to_string()),
        completed_stage: Some(CompletedStage::Start),
        ..StageRecord::default()
    };
    let key = StageKey::new("student-c1", None, "c1");
    app.stages
        .put_raw(&key, &serde_json::to_string(&corrupted).unwrap())
        .unwrap();

    let (status, _, json) = app
        .post_step(&token, "c1", review_body(4, Some("c1-c4-1")))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["outcome"], "reset");
    assert_eq!(json["view"]["state"], "start");
    assert_eq!(json["notice"], "Please start over.");
    assert!(app.answers_of("student-c1").is_empty());

    let stored: StageRecord =
        serde_json::from_str(&app.stages.load_raw(&key).await.unwrap().unwrap()).unwrap();
    assert!(stored.completed_stage.is_none());
    assert!(stored.first_answer_choice.is_none());
}

#[tokio::test]
async fn test_unreadable_stage_is_treated_as_absent() {
    let app = common::create_test_app();
    app.add_question(question("c2", &[true, false]));
    let token = token_for("student-c2", None);
    let key = StageKey::new("student-c2", None, "c2");
    app.stages.put_raw(&key, "{not json").unwrap();

    let (status, json) = app.get_step(&token, "c2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["outcome"], "rendered");
    assert_eq!(json["view"]["state"], "start");
}

#[tokio::test]
async fn test_chosen_rationale_from_other_bucket_resets() {
    let app = TestAppBuilder::new().rationales_per_bucket(3).build();
    app.add_question(question("c3", &[false, true, false, true]));
    app.add_peers("c3", &[2, 4], 3);
    let token = token_for("student-c3", None);

    let view = app.answer_first(&token, "c3", 2).await;
    let from_bucket_two = view["buckets"][0]["rationales"][1]["answer_id"]
        .as_str()
        .unwrap()
        .to_string();

    let (status, _, json) = app
        .post_step(&token, "c3", review_body(4, Some(&from_bucket_two)))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["outcome"], "reset");
    assert!(app.answers_of("student-c3").is_empty());

    let (status, _, json) = app
        .post_step(&token, "c3", review_body(4, Some("never-shown")))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["view"]["state"], "start");
}

#[tokio::test]
async fn test_resubmitting_review_after_summary_redirects() {
    let app = common::create_test_app();
    app.add_question(question("c4", &[true, false]));
    app.add_peers("c4", &[1, 2], 2);
    let token = token_for("student-c4", None);

    app.answer_first(&token, "c4", 1).await;
    let (status, _, _) = app.post_step(&token, "c4", review_body(1, None)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, headers, json) = app.post_step(&token, "c4", review_body(1, None)).await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(
        headers.get(header::LOCATION).unwrap(),
        &steps_uri("c4")
    );
    assert_eq!(json["outcome"], "already_completed");
    assert_eq!(json["view"]["state"], "summary");
    assert_eq!(app.answers_of("student-c4").len(), 1);
}

#[tokio::test]
async fn test_concurrent_finalize_persists_one_answer() {
    let app = common::create_test_app();
    app.add_question(question("c5", &[true, false]));
    app.add_peers("c5", &[1, 2], 2);
    let token = token_for("student-c5", None);

    app.answer_first(&token, "c5", 1).await;

    let (first, second) = tokio::join!(
        app.post_step(&token, "c5", review_body(1, None)),
        app.post_step(&token, "c5", review_body(1, None)),
    );

    let mut statuses = vec![first.0.as_u16(), second.0.as_u16()];
    statuses.sort();
    assert_eq!(statuses, vec![200, 303]);
    assert_eq!(app.answers_of("student-c5").len(), 1);
    assert_eq!(
        app.event_types()
            .iter()
            .filter(|t| **t == "save_problem_success")
            .count(),
        1
    );
}

#[tokio::test]
async fn test_stale_form_keeps_current_state() {
    let app = common::create_test_app();
    app.add_question(question("c6", &[true, false]));
    app.add_peers("c6", &[1, 2], 2);
    let token = token_for("student-c6", None);

    let (_, _, json) = app.post_step(&token, "c6", review_body(1, None)).await;
    assert_eq!(json["outcome"], "invalid");
    assert_eq!(json["view"]["state"], "start");
    assert!(json["errors"]["step"].is_array());

    app.answer_first(&token, "c6", 1).await;
    let (_, _, json) = app
        .post_step(&token, "c6", common::start_body(2, "Changed my mind"))
        .await;
    assert_eq!(json["outcome"], "invalid");
    assert_eq!(json["view"]["state"], "review");
    assert_eq!(json["view"]["first_answer"]["choice"], 1);
}

#[tokio::test]
async fn test_start_over_clears_unfinished_cycle_only() {
    let app = common::create_test_app();
    app.add_question(question("c7", &[true, false]));
    app.add_peers("c7", &[1, 2], 2);
    let token = token_for("student-c7", None);

    app.answer_first(&token, "c7", 2).await;
    let (status, _, json) = app.request("DELETE", &steps_uri("c7"), &token, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["outcome"], "reset");
    assert_eq!(json["view"]["state"], "start");

    let (_, json) = app.get_step(&token, "c7").await;
    assert_eq!(json["view"]["state"], "start");

    app.answer_first(&token, "c7", 1).await;
    app.post_step(&token, "c7", review_body(1, None)).await;

    let (status, _, _) = app.request("DELETE", &steps_uri("c7"), &token, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(app.answers_of("student-c7").len(), 1);
}

#[tokio::test]
async fn test_cycles_are_scoped_by_assignment() {
    let app = common::create_test_app();
    app.add_question(question("c8", &[true, false]));
    app.add_peers("c8", &[1, 2], 2);
    let token = token_for("student-c8", None);

    app.answer_first(&token, "c8", 1).await;
    app.post_step(&token, "c8", review_body(1, None)).await;

    let (status, _, json) = app
        .request(
            "GET",
            &format!("{}?assignment_id=hw-2", steps_uri("c8")),
            &token,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["view"]["state"], "start");

    let (_, json) = app.get_step(&token, "c8").await;
    assert_eq!(json["view"]["state"], "summary");
}

#[tokio::test]
async fn test_requests_without_token_are_rejected() {
    let app = common::create_test_app();
    app.add_question(question("c9", &[true, false]));

    let (status, _, _) = app.request("GET", &steps_uri("c9"), "garbage", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}
