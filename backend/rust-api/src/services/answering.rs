//! Peer-instruction answering state machine.
//!
//! Each request derives the current [`AnswerState`] from the stage record and the presence
//! of a finalized answer, runs the handler for that state and returns a render directive.
//! Consistency violations raise [`AnsweringError::Reload`] and are recovered here by
//! clearing the stage and rendering START again.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use rand::rngs::StdRng;
use serde_json::json;
use uuid::Uuid;
use validator::Validate;

use crate::metrics::{
    ANSWERS_FINALIZED_TOTAL, DUPLICATE_ANSWERS_TOTAL, GRADE_DELIVERY_TOTAL,
    RATIONALE_VOTES_TOTAL, STAGE_RESETS_TOTAL,
};
use crate::models::answer::{ReviewSubmission, SequentialVoteSubmission, StartSubmission};
use crate::models::results::{ChoiceStats, ResultsView, TransitionStats};
use crate::models::stage::StageVote;
use crate::models::step::{
    DisplayedBucket, DisplayedRationale, FirstAnswerView, QuestionView, SummaryView,
};
use crate::models::tracking::TrackingEventType;
use crate::models::{
    Answer, AnswerVote, CompletedStage, FakeAttribution, Question, QuestionKind,
    RationaleChoices, ShownRationale, StageKey, StageRecord, StepOutcome, StepResponse,
    StepSubmission, StepView, VoteType,
};

use super::answer_store::{AnswerStore, FinalizeOutcome, FinalizedCycle};
use super::attribution::{render_rationale, FakeAttributionService};
use super::errors::AnsweringError;
use super::grade_delivery::{GradeDelivery, GradeReport};
use super::grading::grade;
use super::question_store::QuestionStore;
use super::selection::{cycle_rng, AlgorithmInfo, AlgorithmRegistry, RationaleSelectionEngine};
use super::stage_store::{StageHandle, StageStore};
use super::tracking::Tracker;
use super::AppState;

const START_OVER_NOTICE: &str = "Please start over.";

/// Who is answering, as established by the authentication layer.
#[derive(Debug, Clone)]
pub struct Learner {
    pub user_token: String,
    /// LMS course context; grades are only delivered when present
    pub course_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerState {
    Start,
    SequentialReview,
    Review,
    Summary,
}

/// Pure transition table over (stage record, finalized answer present).
pub fn determine_state(
    stage: Option<&StageRecord>,
    finalized: bool,
    question: &Question,
) -> AnswerState {
    if finalized {
        return AnswerState::Summary;
    }
    if question.kind == QuestionKind::RationaleOnly {
        return AnswerState::Start;
    }

    let Some(record) = stage else {
        return AnswerState::Start;
    };

    match record.completed_stage {
        None => AnswerState::Start,
        Some(CompletedStage::Start) if question.sequential_review => {
            let exhausted = record
                .rationale_sequence
                .as_ref()
                .is_some_and(|sequence| record.rationale_index >= sequence.len());
            if exhausted {
                AnswerState::Review
            } else {
                AnswerState::SequentialReview
            }
        }
        Some(CompletedStage::Start) | Some(CompletedStage::SequentialReview) => {
            AnswerState::Review
        }
    }
}

/// Shared per-request values handed to every stage handler.
struct CycleContext {
    key: StageKey,
    question: Question,
    course_id: Option<String>,
}

/// View plus whether rendering had to restart the cycle.
struct Rendered {
    view: StepView,
    notice: Option<String>,
    reset: bool,
}

pub struct QuestionAnsweringService {
    questions: Arc<dyn QuestionStore>,
    answers: Arc<dyn AnswerStore>,
    stages: Arc<dyn StageStore>,
    selection: RationaleSelectionEngine,
    registry: Arc<AlgorithmRegistry>,
    attribution: FakeAttributionService,
    tracker: Tracker,
    grade_delivery: Arc<dyn GradeDelivery>,
}

impl QuestionAnsweringService {
    pub fn new(state: &AppState) -> Self {
        Self {
            questions: state.questions.clone(),
            answers: state.answers.clone(),
            stages: state.stages.clone(),
            selection: RationaleSelectionEngine::new(
                state.answers.clone(),
                state.rationale_filter.clone(),
                state.config.engine.rationales_per_bucket,
            ),
            registry: state.algorithms.clone(),
            attribution: FakeAttributionService::from_config(&state.config.engine),
            tracker: Tracker::new(state.events.clone()),
            grade_delivery: state.grade_delivery.clone(),
        }
    }

    /// GET of the step route: renders whatever state the cycle is in.
    pub async fn render(
        &self,
        learner: &Learner,
        question_id: &str,
        assignment_id: Option<&str>,
    ) -> Result<StepResponse, AnsweringError> {
        let ctx = self.context(learner, question_id, assignment_id).await?;
        let mut stage = StageHandle::open(self.stages.clone(), ctx.key.clone()).await?;

        let rendered = self.render_or_restart(&ctx, &mut stage).await?;
        Ok(StepResponse {
            outcome: if rendered.reset {
                StepOutcome::Reset
            } else {
                StepOutcome::Rendered
            },
            view: rendered.view,
            errors: BTreeMap::new(),
            notice: rendered.notice,
        })
    }

    /// POST of the step route.
    pub async fn submit(
        &self,
        learner: &Learner,
        question_id: &str,
        assignment_id: Option<&str>,
        submission: StepSubmission,
    ) -> Result<StepResponse, AnsweringError> {
        let ctx = self.context(learner, question_id, assignment_id).await?;
        let mut stage = StageHandle::open(self.stages.clone(), ctx.key.clone()).await?;

        tracing::info!(
            "Processing {} step: question={}, assignment={}, user={}",
            submission.name(),
            ctx.key.question_id,
            ctx.key.assignment_part(),
            ctx.key.user_token
        );

        match self.dispatch(&ctx, &mut stage, submission).await {
            Ok(response) => Ok(response),
            Err(AnsweringError::Validation(errors)) => {
                let rendered = self.render_or_restart(&ctx, &mut stage).await?;
                Ok(StepResponse {
                    outcome: if rendered.reset {
                        StepOutcome::Reset
                    } else {
                        StepOutcome::Invalid
                    },
                    view: rendered.view,
                    errors: if rendered.reset { BTreeMap::new() } else { errors },
                    notice: rendered.notice,
                })
            }
            Err(AnsweringError::DuplicateAnswer) => {
                let answer = self
                    .answers
                    .find_finalized(&ctx.key)
                    .await?
                    .ok_or_else(|| AnsweringError::NotFinalized(ctx.key.question_id.clone()))?;
                Ok(StepResponse {
                    outcome: StepOutcome::AlreadyCompleted,
                    view: self.summary_view(&ctx, &answer).await?,
                    errors: BTreeMap::new(),
                    notice: None,
                })
            }
            Err(e @ AnsweringError::Reload(_)) | Err(e @ AnsweringError::Selection(_)) => {
                let rendered = self.restart(&ctx, &mut stage, &e).await?;
                Ok(StepResponse {
                    outcome: StepOutcome::Reset,
                    view: rendered.view,
                    errors: BTreeMap::new(),
                    notice: rendered.notice,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Explicit "start over" for an unfinished cycle.
    pub async fn reset(
        &self,
        learner: &Learner,
        question_id: &str,
        assignment_id: Option<&str>,
    ) -> Result<StepResponse, AnsweringError> {
        let ctx = self.context(learner, question_id, assignment_id).await?;
        if self.answers.find_finalized(&ctx.key).await?.is_some() {
            return Err(AnsweringError::DuplicateAnswer);
        }

        let mut stage = StageHandle::open(self.stages.clone(), ctx.key.clone()).await?;
        stage.clear().await?;
        STAGE_RESETS_TOTAL.with_label_values(&["user"]).inc();
        let view = self.render_start(&ctx, &mut stage).await?;

        Ok(StepResponse {
            outcome: StepOutcome::Reset,
            view,
            errors: BTreeMap::new(),
            notice: None,
        })
    }

    /// Aggregate first→second statistics; only available after finalizing.
    pub async fn results(
        &self,
        learner: &Learner,
        question_id: &str,
        assignment_id: Option<&str>,
    ) -> Result<ResultsView, AnsweringError> {
        let ctx = self.context(learner, question_id, assignment_id).await?;
        let own = self
            .answers
            .find_finalized(&ctx.key)
            .await?
            .ok_or_else(|| AnsweringError::NotFinalized(question_id.to_string()))?;
        let answers = self
            .answers
            .finalized_answers(question_id, assignment_id)
            .await?;

        Ok(compute_results(&ctx.question, assignment_id, &answers, &own))
    }

    async fn context(
        &self,
        learner: &Learner,
        question_id: &str,
        assignment_id: Option<&str>,
    ) -> Result<CycleContext, AnsweringError> {
        let question = self
            .questions
            .get(question_id)
            .await?
            .ok_or_else(|| AnsweringError::QuestionNotFound(question_id.to_string()))?;

        Ok(CycleContext {
            key: StageKey::new(&learner.user_token, assignment_id, question_id),
            question,
            course_id: learner.course_id.clone(),
        })
    }

    async fn dispatch(
        &self,
        ctx: &CycleContext,
        stage: &mut StageHandle,
        submission: StepSubmission,
    ) -> Result<StepResponse, AnsweringError> {
        // Back button or a second tab: never process anything once finalized
        if self.answers.find_finalized(&ctx.key).await?.is_some() {
            if stage.get().is_some() {
                stage.clear().await?;
            }
            return Err(AnsweringError::DuplicateAnswer);
        }

        if let StepSubmission::SequentialVote(form) = &submission {
            if stage
                .get()
                .is_some_and(|r| is_repeated_vote(r, &form.rationale_id))
            {
                tracing::info!(
                    "Repeated vote for {} on {}, already recorded",
                    form.rationale_id,
                    ctx.key.cache_key()
                );
                let view = self.render_current(ctx, stage).await?;
                return Ok(advanced(view));
            }
        }

        let state = determine_state(stage.get(), false, &ctx.question);
        match (state, submission) {
            (AnswerState::Start, StepSubmission::Start(form)) => {
                self.submit_start(ctx, stage, form).await
            }
            (AnswerState::SequentialReview, StepSubmission::SequentialVote(form)) => {
                self.submit_sequential_vote(ctx, stage, form).await
            }
            (AnswerState::Review, StepSubmission::Review(form)) => {
                self.submit_review(ctx, stage, form).await
            }
            (state, submission) => {
                tracing::info!(
                    "Ignoring stale {} form while in {:?} for {}",
                    submission.name(),
                    state,
                    ctx.key.cache_key()
                );
                Err(AnsweringError::field(
                    "step",
                    "This step is no longer current",
                ))
            }
        }
    }

    async fn render_or_restart(
        &self,
        ctx: &CycleContext,
        stage: &mut StageHandle,
    ) -> Result<Rendered, AnsweringError> {
        match self.render_current(ctx, stage).await {
            Ok(view) => Ok(Rendered {
                view,
                notice: None,
                reset: false,
            }),
            Err(e @ AnsweringError::Reload(_)) | Err(e @ AnsweringError::Selection(_)) => {
                self.restart(ctx, stage, &e).await
            }
            Err(e) => Err(e),
        }
    }

    /// Clears the stage and renders START with a notice explaining the reset.
    async fn restart(
        &self,
        ctx: &CycleContext,
        stage: &mut StageHandle,
        cause: &AnsweringError,
    ) -> Result<Rendered, AnsweringError> {
        let (reason, notice) = match cause {
            AnsweringError::Selection(e) => {
                ("selection", format!("{} {}", e.message, START_OVER_NOTICE))
            }
            _ => ("reload", START_OVER_NOTICE.to_string()),
        };
        tracing::warn!(
            "Restarting answer cycle {} ({}): {}",
            ctx.key.cache_key(),
            reason,
            cause
        );
        STAGE_RESETS_TOTAL.with_label_values(&[reason]).inc();

        stage.clear().await?;
        let view = self.render_start(ctx, stage).await?;
        Ok(Rendered {
            view,
            notice: Some(notice),
            reset: true,
        })
    }

    async fn render_current(
        &self,
        ctx: &CycleContext,
        stage: &mut StageHandle,
    ) -> Result<StepView, AnsweringError> {
        if let Some(answer) = self.answers.find_finalized(&ctx.key).await? {
            return self.summary_view(ctx, &answer).await;
        }

        match determine_state(stage.get(), false, &ctx.question) {
            AnswerState::Start => self.render_start(ctx, stage).await,
            AnswerState::SequentialReview => self.render_sequential_review(ctx, stage).await,
            AnswerState::Review => self.render_review(ctx, stage).await,
            // determine_state only yields Summary for finalized answers, handled above
            AnswerState::Summary => Err(AnsweringError::reload("Summary without an answer")),
        }
    }

    /// Algorithm recorded with analytics events; none for rationale-only questions.
    fn algorithm_info(&self, question: &Question) -> Option<AlgorithmInfo> {
        (question.kind != QuestionKind::RationaleOnly)
            .then(|| self.registry.resolve(&question.rationale_selection_algorithm).info())
    }

    async fn render_start(
        &self,
        ctx: &CycleContext,
        stage: &mut StageHandle,
    ) -> Result<StepView, AnsweringError> {
        let first_render = stage.get().and_then(|r| r.datetime_start).is_none();
        if first_render {
            stage.update(|r| r.datetime_start = Some(Utc::now()));
            stage.store().await?;
            self.tracker
                .track(
                    TrackingEventType::ProblemShow,
                    &ctx.key,
                    json!({
                        "question_title": ctx.question.title,
                        "rationale_algorithm": self.algorithm_info(&ctx.question),
                    }),
                )
                .await;
        }

        Ok(StepView::Start {
            question: QuestionView::from(&ctx.question),
        })
    }

    async fn render_sequential_review(
        &self,
        ctx: &CycleContext,
        stage: &mut StageHandle,
    ) -> Result<StepView, AnsweringError> {
        let record = stage
            .get()
            .ok_or_else(|| AnsweringError::reload("Sequential review without stage"))?;
        let (first_choice, rationale) = first_answer(record)?;

        if record.rationale_sequence.is_none() {
            let algorithm = self
                .registry
                .resolve(&ctx.question.rationale_selection_algorithm);
            let mut rng = cycle_rng(&ctx.key, algorithm.name());
            let selection = self
                .selection
                .select_sequential(
                    algorithm.as_ref(),
                    &mut rng,
                    &ctx.key,
                    first_choice,
                    &rationale,
                    &ctx.question,
                )
                .await?;
            let attributions = self.attribute(&ctx.question, &selection.choices, &mut rng);

            stage.update(|r| {
                r.rationale_choices = Some(selection.choices);
                r.rationale_sequence = selection.sequence;
                r.rationale_index = 0;
                r.fake_attributions = attributions;
            });
            stage.store().await?;
        }

        let record = stage
            .get()
            .ok_or_else(|| AnsweringError::reload("Sequential review without stage"))?;
        let sequence = record
            .rationale_sequence
            .as_ref()
            .ok_or_else(|| AnsweringError::reload("Missing rationale sequence"))?;
        let choices = record
            .rationale_choices
            .as_ref()
            .ok_or_else(|| AnsweringError::reload("Missing rationale choices"))?;
        let answer_id = sequence
            .get(record.rationale_index)
            .ok_or_else(|| AnsweringError::reload("Rationale sequence exhausted"))?;
        let text = choices
            .text_of(answer_id)
            .ok_or_else(|| AnsweringError::reload("Sequence entry not among choices"))?;
        let attribution = record.attribution_for(answer_id).cloned();

        Ok(StepView::SequentialReview {
            question: QuestionView::from(&ctx.question),
            first_answer: first_answer_view(&ctx.question, record)?,
            rationale: DisplayedRationale {
                answer_id: Some(answer_id.clone()),
                text_html: render_rationale(text, attribution.as_ref()),
                attribution,
            },
            position: record.rationale_index + 1,
            total: sequence.len(),
        })
    }

    async fn render_review(
        &self,
        ctx: &CycleContext,
        stage: &mut StageHandle,
    ) -> Result<StepView, AnsweringError> {
        let record = stage
            .get()
            .ok_or_else(|| AnsweringError::reload("Review without stage"))?;
        let (first_choice, rationale) = first_answer(record)?;

        if record.rationale_choices.is_none() {
            if record.completed_stage == Some(CompletedStage::SequentialReview) {
                return Err(AnsweringError::reload(
                    "Sequential review completed without rationale choices",
                ));
            }

            let algorithm = self
                .registry
                .resolve(&ctx.question.rationale_selection_algorithm);
            let mut rng = cycle_rng(&ctx.key, algorithm.name());
            let selection = self
                .selection
                .select(
                    algorithm.as_ref(),
                    &mut rng,
                    &ctx.key,
                    first_choice,
                    &rationale,
                    &ctx.question,
                )
                .await?;
            let attributions = self.attribute(&ctx.question, &selection.choices, &mut rng);

            stage.update(|r| {
                r.rationale_choices = Some(selection.choices);
                r.fake_attributions = attributions;
            });
            stage.store().await?;
        }

        let record = stage
            .get()
            .ok_or_else(|| AnsweringError::reload("Review without stage"))?;
        let choices = record
            .rationale_choices
            .as_ref()
            .ok_or_else(|| AnsweringError::reload("Missing rationale choices"))?;

        Ok(StepView::Review {
            question: QuestionView::from(&ctx.question),
            first_answer: first_answer_view(&ctx.question, record)?,
            buckets: displayed_buckets(record, choices),
        })
    }

    async fn submit_start(
        &self,
        ctx: &CycleContext,
        stage: &mut StageHandle,
        form: StartSubmission,
    ) -> Result<StepResponse, AnsweringError> {
        form.validate()
            .map_err(|e| AnsweringError::from_validation(&e))?;
        if !ctx.question.has_choice(form.first_answer_choice) {
            return Err(AnsweringError::field(
                "first_answer_choice",
                "Please choose one of the listed answers",
            ));
        }

        let now = Utc::now();

        if ctx.question.kind == QuestionKind::RationaleOnly {
            let datetime_start = stage.get().and_then(|r| r.datetime_start).or(Some(now));
            let correct = ctx.question.is_correct(form.first_answer_choice);
            let answer = Answer {
                id: Uuid::new_v4().to_string(),
                question_id: ctx.key.question_id.clone(),
                assignment_id: ctx.key.assignment_id.clone(),
                user_token: ctx.key.user_token.clone(),
                first_answer_choice: form.first_answer_choice,
                rationale: form.rationale.clone(),
                second_answer_choice: Some(form.first_answer_choice),
                chosen_rationale_id: None,
                expert: false,
                sample: false,
                upvotes: 0,
                downvotes: 0,
                datetime_start,
                datetime_first: Some(now),
                datetime_second: Some(now),
                grade: Some(grade(ctx.question.grading_scheme, correct, correct)),
                cycle_key: Some(ctx.key.cycle_key()),
            };
            let cycle = FinalizedCycle {
                answer,
                shown: Vec::new(),
                votes: Vec::new(),
            };
            return self
                .finalize_cycle(ctx, stage, cycle, &RationaleChoices::default())
                .await;
        }

        stage.update(|r| {
            r.first_answer_choice = Some(form.first_answer_choice);
            r.rationale = Some(form.rationale.clone());
            r.datetime_start = r.datetime_start.or(Some(now));
            r.datetime_first = Some(now);
            r.completed_stage = Some(CompletedStage::Start);
        });
        stage.store().await?;

        let view = self.render_current(ctx, stage).await?;
        Ok(advanced(view))
    }

    async fn submit_sequential_vote(
        &self,
        ctx: &CycleContext,
        stage: &mut StageHandle,
        form: SequentialVoteSubmission,
    ) -> Result<StepResponse, AnsweringError> {
        let record = stage
            .get()
            .ok_or_else(|| AnsweringError::reload("Vote without stage"))?;
        first_answer(record)?;
        let sequence = record
            .rationale_sequence
            .as_ref()
            .ok_or_else(|| AnsweringError::reload("Vote before the sequence was shown"))?;
        let current = sequence
            .get(record.rationale_index)
            .ok_or_else(|| AnsweringError::reload("Rationale sequence exhausted"))?;
        if current != &form.rationale_id {
            return Err(AnsweringError::reload(format!(
                "Vote for {} but {} is on display",
                form.rationale_id, current
            )));
        }
        let exhausted = record.rationale_index + 1 >= sequence.len();

        stage.update(|r| {
            r.rationale_votes.push(StageVote {
                answer_id: form.rationale_id.clone(),
                vote: form.vote,
                voted_at: Utc::now(),
            });
            r.rationale_index += 1;
            if exhausted {
                r.completed_stage = Some(CompletedStage::SequentialReview);
            }
        });
        stage.store().await?;

        let vote_type: VoteType = form.vote.into();
        RATIONALE_VOTES_TOTAL
            .with_label_values(&[vote_type.as_str()])
            .inc();

        let view = self.render_current(ctx, stage).await?;
        Ok(advanced(view))
    }

    async fn submit_review(
        &self,
        ctx: &CycleContext,
        stage: &mut StageHandle,
        form: ReviewSubmission,
    ) -> Result<StepResponse, AnsweringError> {
        form.validate()
            .map_err(|e| AnsweringError::from_validation(&e))?;
        if !ctx.question.has_choice(form.second_answer_choice) {
            return Err(AnsweringError::field(
                "second_answer_choice",
                "Please choose one of the listed answers",
            ));
        }

        let record = stage
            .get()
            .ok_or_else(|| AnsweringError::reload("Review submitted without stage"))?;
        let (first_choice, rationale) = first_answer(record)?;
        let choices = record
            .rationale_choices
            .as_ref()
            .ok_or_else(|| AnsweringError::reload("Review submitted before rationales were shown"))?;

        match form.chosen_rationale_id.as_deref() {
            Some(chosen) => {
                let bucket = choices.bucket_of(chosen).ok_or_else(|| {
                    AnsweringError::reload(format!("Chosen rationale {} was not shown", chosen))
                })?;
                if bucket != form.second_answer_choice {
                    return Err(AnsweringError::reload(format!(
                        "Chosen rationale {} belongs to choice {}, not {}",
                        chosen, bucket, form.second_answer_choice
                    )));
                }
            }
            None => {
                if form.second_answer_choice != first_choice {
                    return Err(AnsweringError::reload(
                        "Kept own rationale but changed the answer",
                    ));
                }
            }
        }

        let now = Utc::now();
        let first_correct = ctx.question.is_correct(first_choice);
        let second_correct = ctx.question.is_correct(form.second_answer_choice);
        let answer = Answer {
            id: Uuid::new_v4().to_string(),
            question_id: ctx.key.question_id.clone(),
            assignment_id: ctx.key.assignment_id.clone(),
            user_token: ctx.key.user_token.clone(),
            first_answer_choice: first_choice,
            rationale,
            second_answer_choice: Some(form.second_answer_choice),
            chosen_rationale_id: form.chosen_rationale_id.clone(),
            expert: false,
            sample: false,
            upvotes: 0,
            downvotes: 0,
            datetime_start: record.datetime_start,
            datetime_first: record.datetime_first,
            datetime_second: Some(now),
            grade: Some(grade(
                ctx.question.grading_scheme,
                first_correct,
                second_correct,
            )),
            cycle_key: Some(ctx.key.cycle_key()),
        };

        let mut votes = Vec::new();
        if let Some(chosen) = form.chosen_rationale_id.as_deref() {
            votes.push(audit_vote(
                ctx,
                chosen,
                VoteType::FinalChoice,
                record.attribution_for(chosen).cloned(),
                now,
            ));
        }
        for vote in &record.rationale_votes {
            votes.push(audit_vote(
                ctx,
                &vote.answer_id,
                vote.vote.into(),
                record.attribution_for(&vote.answer_id).cloned(),
                vote.voted_at,
            ));
        }

        let shown = choices
            .candidate_ids()
            .into_iter()
            .map(|shown_answer_id| ShownRationale {
                id: Uuid::new_v4().to_string(),
                shown_for_answer_id: answer.id.clone(),
                shown_answer_id,
            })
            .collect();

        let choices = choices.clone();
        let cycle = FinalizedCycle {
            answer,
            shown,
            votes,
        };
        self.finalize_cycle(ctx, stage, cycle, &choices).await
    }

    /// Persists the cycle atomically, then clears the stage and runs best-effort side effects.
    async fn finalize_cycle(
        &self,
        ctx: &CycleContext,
        stage: &mut StageHandle,
        cycle: FinalizedCycle,
        choices: &RationaleChoices,
    ) -> Result<StepResponse, AnsweringError> {
        let answer = cycle.answer.clone();
        let algorithm = self.algorithm_info(&ctx.question);

        if self.answers.finalize(cycle).await? == FinalizeOutcome::Duplicate {
            DUPLICATE_ANSWERS_TOTAL.inc();
            tracing::info!(
                "Answer for {} was already finalized by another request",
                ctx.key.cycle_key()
            );
            if let Err(e) = stage.clear().await {
                tracing::warn!("Failed to clear stage after duplicate finalize: {:#}", e);
            }
            return Err(AnsweringError::DuplicateAnswer);
        }

        if let Err(e) = stage.clear().await {
            tracing::warn!(
                "Failed to clear stage {} after finalize: {:#}",
                ctx.key.cache_key(),
                e
            );
        }

        let grade_value = answer.grade.unwrap_or(0.0);
        let second_choice = answer
            .second_answer_choice
            .unwrap_or(answer.first_answer_choice);
        ANSWERS_FINALIZED_TOTAL
            .with_label_values(&[ctx.question.grading_scheme.as_str()])
            .inc();

        tracing::info!(
            "Answer finalized: question={}, user={}, first={}, second={}, grade={}",
            ctx.key.question_id,
            ctx.key.user_token,
            answer.first_answer_choice,
            second_choice,
            grade_value
        );

        self.tracker
            .track(
                TrackingEventType::ProblemCheck,
                &ctx.key,
                json!({
                    "answer_id": answer.id,
                    "first_answer_choice": answer.first_answer_choice,
                    "second_answer_choice": second_choice,
                    "first_correct": ctx.question.is_correct(answer.first_answer_choice),
                    "second_correct": ctx.question.is_correct(second_choice),
                    "grade": grade_value,
                    "rationale_algorithm": algorithm,
                }),
            )
            .await;

        let shown: Vec<serde_json::Value> = choices
            .buckets
            .iter()
            .map(|bucket| {
                json!({
                    "choice": bucket.choice,
                    "label": bucket.label,
                    "rationales": bucket
                        .rationales
                        .iter()
                        .map(|r| json!({ "id": r.answer_id, "text": r.text }))
                        .collect::<Vec<_>>(),
                })
            })
            .collect();
        self.tracker
            .track(
                TrackingEventType::SaveProblemSuccess,
                &ctx.key,
                json!({
                    "answer_id": answer.id,
                    "grade": grade_value,
                    "chosen_rationale_id": answer.chosen_rationale_id,
                    "rationale_algorithm": algorithm,
                    "shown_rationales": shown,
                }),
            )
            .await;

        self.deliver_grade(ctx, grade_value).await;

        Ok(advanced(self.summary_view(ctx, &answer).await?))
    }

    async fn deliver_grade(&self, ctx: &CycleContext, grade_value: f64) {
        let Some(course_id) = ctx.course_id.clone() else {
            GRADE_DELIVERY_TOTAL.with_label_values(&["skipped"]).inc();
            return;
        };

        let report = GradeReport {
            user_id: ctx.key.user_token.clone(),
            course_id,
            assignment_id: ctx.key.assignment_id.clone(),
            question_id: ctx.key.question_id.clone(),
            grade: grade_value,
        };

        match self.grade_delivery.deliver(&report).await {
            Ok(()) => GRADE_DELIVERY_TOTAL.with_label_values(&["success"]).inc(),
            Err(e) => {
                GRADE_DELIVERY_TOTAL.with_label_values(&["failure"]).inc();
                tracing::warn!(
                    "Grade delivery failed for user={} question={}: {:#}",
                    report.user_id,
                    report.question_id,
                    e
                );
            }
        }
    }

    fn attribute(
        &self,
        question: &Question,
        choices: &RationaleChoices,
        rng: &mut StdRng,
    ) -> Option<BTreeMap<String, FakeAttribution>> {
        if !question.fake_attributions || !self.attribution.is_configured() {
            return None;
        }
        let ids: Vec<String> = choices
            .buckets
            .iter()
            .flat_map(|b| b.rationales.iter())
            .filter_map(|r| r.answer_id.clone())
            .collect();
        Some(self.attribution.attribute(&ids, rng))
    }

    async fn summary_view(
        &self,
        ctx: &CycleContext,
        answer: &Answer,
    ) -> Result<StepView, AnsweringError> {
        let chosen_rationale = match answer.chosen_rationale_id.as_deref() {
            Some(id) => self.answers.find_by_id(id).await?.map(|a| a.rationale),
            None => None,
        };
        let second = answer
            .second_answer_choice
            .unwrap_or(answer.first_answer_choice);

        Ok(StepView::Summary {
            question: QuestionView::from(&ctx.question),
            summary: SummaryView {
                answer_id: answer.id.clone(),
                first_answer_choice: answer.first_answer_choice,
                first_answer_label: ctx.question.choice_label(answer.first_answer_choice),
                first_correct: ctx.question.is_correct(answer.first_answer_choice),
                rationale: answer.rationale.clone(),
                second_answer_choice: second,
                second_answer_label: ctx.question.choice_label(second),
                second_correct: ctx.question.is_correct(second),
                chosen_rationale,
                grade: answer.grade.unwrap_or(0.0),
            },
        })
    }
}

fn advanced(view: StepView) -> StepResponse {
    StepResponse {
        outcome: StepOutcome::Advanced,
        view,
        errors: BTreeMap::new(),
        notice: None,
    }
}

/// First choice and rationale, which every state after START depends on.
fn first_answer(record: &StageRecord) -> Result<(u32, String), AnsweringError> {
    match (record.first_answer_choice, record.rationale.as_ref()) {
        (Some(choice), Some(rationale)) => Ok((choice, rationale.clone())),
        _ => Err(AnsweringError::reload("First answer missing from stage")),
    }
}

fn first_answer_view(
    question: &Question,
    record: &StageRecord,
) -> Result<FirstAnswerView, AnsweringError> {
    let (choice, rationale) = first_answer(record)?;
    Ok(FirstAnswerView {
        choice,
        label: question.choice_label(choice),
        rationale,
    })
}

fn displayed_buckets(record: &StageRecord, choices: &RationaleChoices) -> Vec<DisplayedBucket> {
    choices
        .buckets
        .iter()
        .map(|bucket| DisplayedBucket {
            choice: bucket.choice,
            label: bucket.label.clone(),
            rationales: bucket
                .rationales
                .iter()
                .map(|candidate| {
                    let attribution = candidate
                        .answer_id
                        .as_deref()
                        .and_then(|id| record.attribution_for(id))
                        .cloned();
                    DisplayedRationale {
                        answer_id: candidate.answer_id.clone(),
                        text_html: render_rationale(&candidate.text, attribution.as_ref()),
                        attribution,
                    }
                })
                .collect(),
        })
        .collect()
}

fn audit_vote(
    ctx: &CycleContext,
    answer_id: &str,
    vote_type: VoteType,
    fake_attribution: Option<FakeAttribution>,
    created_at: chrono::DateTime<Utc>,
) -> AnswerVote {
    AnswerVote {
        id: Uuid::new_v4().to_string(),
        answer_id: answer_id.to_string(),
        assignment_id: ctx.key.assignment_id.clone(),
        user_token: ctx.key.user_token.clone(),
        vote_type,
        fake_attribution,
        created_at,
    }
}

/// Per-choice counts and the first→second transition matrix.
/// A vote for the entry just before the current sequence position was already recorded.
fn is_repeated_vote(record: &StageRecord, rationale_id: &str) -> bool {
    record.rationale_index > 0
        && record
            .rationale_sequence
            .as_ref()
            .and_then(|sequence| sequence.get(record.rationale_index - 1))
            .is_some_and(|previous| previous.as_str() == rationale_id)
}

pub fn compute_results(
    question: &Question,
    assignment_id: Option<&str>,
    answers: &[Answer],
    own: &Answer,
) -> ResultsView {
    let mut first_counts: BTreeMap<u32, u32> = BTreeMap::new();
    let mut second_counts: BTreeMap<u32, u32> = BTreeMap::new();
    let mut transitions: BTreeMap<(u32, u32), u32> = BTreeMap::new();
    let mut first_correct = 0u32;
    let mut second_correct = 0u32;

    for answer in answers {
        let first = answer.first_answer_choice;
        let second = answer.second_answer_choice.unwrap_or(first);
        *first_counts.entry(first).or_default() += 1;
        *second_counts.entry(second).or_default() += 1;
        *transitions.entry((first, second)).or_default() += 1;
        if question.is_correct(first) {
            first_correct += 1;
        }
        if question.is_correct(second) {
            second_correct += 1;
        }
    }

    let total = answers.len() as u32;
    let ratio = |count: u32| {
        if total == 0 {
            0.0
        } else {
            f64::from(count) / f64::from(total)
        }
    };

    ResultsView {
        question_id: question.id.clone(),
        assignment_id: assignment_id.map(|s| s.to_string()),
        total_answers: total,
        choices: (1..=question.choice_count())
            .map(|choice| ChoiceStats {
                choice,
                label: question.choice_label(choice),
                correct: question.is_correct(choice),
                first_count: first_counts.get(&choice).copied().unwrap_or(0),
                second_count: second_counts.get(&choice).copied().unwrap_or(0),
            })
            .collect(),
        transitions: transitions
            .into_iter()
            .map(|((from_choice, to_choice), count)| TransitionStats {
                from_choice,
                to_choice,
                count,
            })
            .collect(),
        first_correct_ratio: ratio(first_correct),
        second_correct_ratio: ratio(second_correct),
        own_first_answer_choice: own.first_answer_choice,
        own_second_answer_choice: own
            .second_answer_choice
            .unwrap_or(own.first_answer_choice),
        own_grade: own.grade.unwrap_or(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AnswerChoice, AnswerStyle, GradingScheme};

    fn question(kind: QuestionKind, sequential_review: bool) -> Question {
        Question {
            id: "q1".to_string(),
            title: "Test".to_string(),
            text: "Pick".to_string(),
            kind,
            answer_choices: vec![
                AnswerChoice {
                    text: "a".to_string(),
                    correct: true,
                },
                AnswerChoice {
                    text: "b".to_string(),
                    correct: false,
                },
            ],
            answer_style: AnswerStyle::Alpha,
            grading_scheme: GradingScheme::Standard,
            rationale_selection_algorithm: "simple".to_string(),
            sequential_review,
            fake_attributions: false,
        }
    }

    fn started() -> StageRecord {
        StageRecord {
            first_answer_choice: Some(1),
            rationale: Some("mine".to_string()),
            completed_stage: Some(CompletedStage::Start),
            ..StageRecord::default()
        }
    }

    #[test]
    fn test_state_without_stage_is_start() {
        let q = question(QuestionKind::PeerInstruction, false);
        assert_eq!(determine_state(None, false, &q), AnswerState::Start);
        assert_eq!(
            determine_state(Some(&StageRecord::default()), false, &q),
            AnswerState::Start
        );
    }

    #[test]
    fn test_finalized_answer_is_always_summary() {
        let q = question(QuestionKind::PeerInstruction, true);
        assert_eq!(determine_state(None, true, &q), AnswerState::Summary);
        assert_eq!(
            determine_state(Some(&started()), true, &q),
            AnswerState::Summary
        );
    }

    #[test]
    fn test_completed_start_goes_to_review_or_sequential_review() {
        let plain = question(QuestionKind::PeerInstruction, false);
        let sequential = question(QuestionKind::PeerInstruction, true);
        assert_eq!(
            determine_state(Some(&started()), false, &plain),
            AnswerState::Review
        );
        assert_eq!(
            determine_state(Some(&started()), false, &sequential),
            AnswerState::SequentialReview
        );
    }

    #[test]
    fn test_sequential_review_ends_when_sequence_exhausted() {
        let sequential = question(QuestionKind::PeerInstruction, true);
        let mut record = started();
        record.rationale_sequence = Some(vec!["a".to_string(), "b".to_string()]);
        record.rationale_index = 1;
        assert_eq!(
            determine_state(Some(&record), false, &sequential),
            AnswerState::SequentialReview
        );

        record.rationale_index = 2;
        record.completed_stage = Some(CompletedStage::SequentialReview);
        assert_eq!(
            determine_state(Some(&record), false, &sequential),
            AnswerState::Review
        );
    }

    #[test]
    fn test_rationale_only_never_reviews() {
        let q = question(QuestionKind::RationaleOnly, false);
        assert_eq!(determine_state(Some(&started()), false, &q), AnswerState::Start);
    }

    #[test]
    fn test_first_answer_requires_both_fields() {
        let mut record = started();
        assert_eq!(first_answer(&record).unwrap(), (1, "mine".to_string()));
        record.rationale = None;
        assert!(matches!(
            first_answer(&record),
            Err(AnsweringError::Reload(_))
        ));
    }

    #[test]
    fn test_compute_results_counts_transitions() {
        let q = question(QuestionKind::PeerInstruction, false);
        let make = |id: &str, first: u32, second: u32| Answer {
            id: id.to_string(),
            question_id: "q1".to_string(),
            assignment_id: None,
            user_token: id.to_string(),
            first_answer_choice: first,
            rationale: "r".to_string(),
            second_answer_choice: Some(second),
            chosen_rationale_id: None,
            expert: false,
            sample: false,
            upvotes: 0,
            downvotes: 0,
            datetime_start: None,
            datetime_first: None,
            datetime_second: None,
            grade: Some(if second == 1 { 1.0 } else { 0.0 }),
            cycle_key: Some(format!("q1|test|{}", id)),
        };
        let answers = vec![make("u1", 2, 1), make("u2", 2, 1), make("u3", 1, 1), make("u4", 1, 2)];

        let results = compute_results(&q, None, &answers, &answers[0]);
        assert_eq!(results.total_answers, 4);
        assert_eq!(results.choices[0].first_count, 2);
        assert_eq!(results.choices[0].second_count, 3);
        assert_eq!(results.choices[1].first_count, 2);
        assert_eq!(results.choices[1].second_count, 1);
        assert_eq!(
            results.transitions,
            vec![
                TransitionStats { from_choice: 1, to_choice: 1, count: 1 },
                TransitionStats { from_choice: 1, to_choice: 2, count: 1 },
                TransitionStats { from_choice: 2, to_choice: 1, count: 2 },
            ]
        );
        assert_eq!(results.first_correct_ratio, 0.5);
        assert_eq!(results.second_correct_ratio, 0.75);
        assert_eq!(results.own_grade, 1.0);
    }
}
