use std::future::Future;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{doc, Document};
use mongodb::error::{
    ErrorKind, WriteFailure, TRANSIENT_TRANSACTION_ERROR, UNKNOWN_TRANSACTION_COMMIT_RESULT,
};
use mongodb::options::IndexOptions;
use mongodb::{Client, ClientSession, Collection, Database, IndexModel};

use crate::metrics::track_db_operation;
use crate::utils::retry::{retry_async_with_config, RetryConfig};
use crate::models::{Answer, AnswerVote, ShownRationale, StageKey, VoteType};

/// Everything written when a cycle is finalized. Persisted all-or-nothing.
#[derive(Debug, Clone)]
pub struct FinalizedCycle {
    pub answer: Answer,
    pub shown: Vec<ShownRationale>,
    pub votes: Vec<AnswerVote>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Created,
    /// Another request already finalized this (question, assignment, user); nothing written
    Duplicate,
}

#[async_trait]
pub trait AnswerStore: Send + Sync {
    async fn find_finalized(&self, key: &StageKey) -> Result<Option<Answer>>;
    async fn find_by_id(&self, answer_id: &str) -> Result<Option<Answer>>;
    /// Every answer to the question carrying a rationale, seed answers included
    async fn candidate_pool(&self, question_id: &str) -> Result<Vec<Answer>>;
    async fn finalize(&self, cycle: FinalizedCycle) -> Result<FinalizeOutcome>;
    /// Finalized student answers, optionally restricted to one assignment
    async fn finalized_answers(
        &self,
        question_id: &str,
        assignment_id: Option<&str>,
    ) -> Result<Vec<Answer>>;
}

fn vote_counter(vote_type: VoteType) -> Option<&'static str> {
    match vote_type {
        VoteType::Upvote => Some("upvotes"),
        VoteType::Downvote => Some("downvotes"),
        VoteType::FinalChoice => None,
    }
}

pub fn is_duplicate_key(error: &mongodb::error::Error) -> bool {
    const DUPLICATE_KEY: i32 = 11000;
    match *error.kind {
        ErrorKind::Write(WriteFailure::WriteError(ref we)) => we.code == DUPLICATE_KEY,
        ErrorKind::Command(ref ce) => ce.code == DUPLICATE_KEY,
        ErrorKind::InsertMany(ref ime) => ime
            .write_errors
            .as_ref()
            .is_some_and(|errors| errors.iter().any(|we| we.code == DUPLICATE_KEY)),
        _ => false,
    }
}

const FINALIZE_ATTEMPTS: usize = 3;

/// Why one finalize transaction did not commit.
#[derive(Debug)]
enum AttemptError {
    Duplicate,
    /// Write conflict with a concurrent transaction; safe to run again
    Transient(String),
    Fatal(anyhow::Error),
}

impl AttemptError {
    fn from_mongo(error: mongodb::error::Error, context: &'static str) -> Self {
        if is_duplicate_key(&error) {
            AttemptError::Duplicate
        } else if error.contains_label(TRANSIENT_TRANSACTION_ERROR)
            || error.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT)
        {
            AttemptError::Transient(error.to_string())
        } else {
            AttemptError::Fatal(anyhow!(error).context(context))
        }
    }
}

/// Runs `attempt` until it commits or fails for good.
///
/// A transient conflict usually means a concurrent request for the same cycle is
/// committing, so `already_finalized` is checked before trying again.
async fn finalize_with_retry<A, AFut, C, CFut>(
    max_attempts: usize,
    mut attempt: A,
    mut already_finalized: C,
) -> Result<FinalizeOutcome>
where
    A: FnMut() -> AFut,
    AFut: Future<Output = Result<(), AttemptError>>,
    C: FnMut() -> CFut,
    CFut: Future<Output = Result<bool>>,
{
    let max_attempts = max_attempts.max(1);
    let mut last_conflict = String::new();

    for n in 1..=max_attempts {
        match attempt().await {
            Ok(()) => return Ok(FinalizeOutcome::Created),
            Err(AttemptError::Duplicate) => return Ok(FinalizeOutcome::Duplicate),
            Err(AttemptError::Fatal(e)) => return Err(e),
            Err(AttemptError::Transient(message)) => {
                tracing::debug!(attempt = n, "Finalize conflict: {}", message);
                if already_finalized().await? {
                    return Ok(FinalizeOutcome::Duplicate);
                }
                last_conflict = message;
            }
        }
    }

    Err(anyhow!(
        "Finalize still conflicting after {} attempts: {}",
        max_attempts,
        last_conflict
    ))
}

pub struct MongoAnswerStore {
    client: Client,
    mongo: Database,
}

impl MongoAnswerStore {
    pub fn new(client: Client, mongo: Database) -> Self {
        Self { client, mongo }
    }

    fn answers(&self) -> Collection<Answer> {
        self.mongo.collection("answers")
    }

    fn shown_rationales(&self) -> Collection<ShownRationale> {
        self.mongo.collection("shown_rationales")
    }

    fn votes(&self) -> Collection<AnswerVote> {
        self.mongo.collection("answer_votes")
    }

    /// Unique sparse index on `cycle_key` enforces one finalized answer per cycle.
    pub async fn ensure_indexes(&self) -> Result<()> {
        let unique_cycle = IndexModel::builder()
            .keys(doc! { "cycle_key": 1 })
            .options(
                IndexOptions::builder()
                    .unique(true)
                    .sparse(true)
                    .name("cycle_key_unique".to_string())
                    .build(),
            )
            .build();
        self.answers()
            .create_index(unique_cycle)
            .await
            .context("Failed to create cycle_key index")?;

        self.answers()
            .create_index(IndexModel::builder().keys(doc! { "question_id": 1 }).build())
            .await
            .context("Failed to create question_id index")?;

        self.shown_rationales()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "shown_for_answer_id": 1 })
                    .build(),
            )
            .await
            .context("Failed to create shown_rationales index")?;

        tracing::info!("Answer store indexes ensured");
        Ok(())
    }

    async fn write_cycle(
        &self,
        cycle: &FinalizedCycle,
        session: &mut ClientSession,
    ) -> mongodb::error::Result<()> {
        self.answers()
            .insert_one(&cycle.answer)
            .session(&mut *session)
            .await?;

        if !cycle.shown.is_empty() {
            self.shown_rationales()
                .insert_many(&cycle.shown)
                .session(&mut *session)
                .await?;
        }

        if !cycle.votes.is_empty() {
            self.votes()
                .insert_many(&cycle.votes)
                .session(&mut *session)
                .await?;
        }

        for vote in &cycle.votes {
            if let Some(counter) = vote_counter(vote.vote_type) {
                let mut increment = Document::new();
                increment.insert(counter, 1);
                self.answers()
                    .update_one(
                        doc! { "_id": &vote.answer_id },
                        doc! { "$inc": increment },
                    )
                    .session(&mut *session)
                    .await?;
            }
        }

        Ok(())
    }

    async fn try_finalize(&self, cycle: &FinalizedCycle) -> Result<(), AttemptError> {
        let mut session = self
            .client
            .start_session()
            .await
            .map_err(|e| AttemptError::Fatal(anyhow!(e).context("Failed to start MongoDB session")))?;
        session
            .start_transaction()
            .await
            .map_err(|e| AttemptError::Fatal(anyhow!(e).context("Failed to start transaction")))?;

        if let Err(e) = self.write_cycle(cycle, &mut session).await {
            if let Err(abort_err) = session.abort_transaction().await {
                tracing::warn!("Failed to abort finalize transaction: {}", abort_err);
            }
            return Err(AttemptError::from_mongo(e, "Finalize transaction failed"));
        }

        session
            .commit_transaction()
            .await
            .map_err(|e| AttemptError::from_mongo(e, "Failed to commit finalize transaction"))
    }
}

#[async_trait]
impl AnswerStore for MongoAnswerStore {
    async fn find_finalized(&self, key: &StageKey) -> Result<Option<Answer>> {
        let cycle_key = key.cycle_key();
        retry_async_with_config(RetryConfig::default(), || async {
            track_db_operation("find_one", "answers", async {
                self.answers()
                    .find_one(doc! { "cycle_key": &cycle_key })
                    .await
                    .context("Failed to query finalized answer")
            })
            .await
        })
        .await
    }

    async fn find_by_id(&self, answer_id: &str) -> Result<Option<Answer>> {
        self.answers()
            .find_one(doc! { "_id": answer_id })
            .await
            .context("Failed to query answer")
    }

    async fn candidate_pool(&self, question_id: &str) -> Result<Vec<Answer>> {
        track_db_operation("find", "answers", async {
            let mut cursor = self
                .answers()
                .find(doc! { "question_id": question_id, "rationale": { "$ne": "" } })
                .await
                .context("Failed to query candidate answers")?;

            let mut answers = Vec::new();
            while let Some(answer) = cursor
                .try_next()
                .await
                .context("Candidate cursor error")?
            {
                answers.push(answer);
            }
            Ok(answers)
        })
        .await
    }

    async fn finalize(&self, cycle: FinalizedCycle) -> Result<FinalizeOutcome> {
        let cycle_key = cycle.answer.cycle_key.clone().unwrap_or_default();
        let outcome = finalize_with_retry(
            FINALIZE_ATTEMPTS,
            || self.try_finalize(&cycle),
            || async {
                self.answers()
                    .find_one(doc! { "cycle_key": &cycle_key })
                    .await
                    .map(|existing| existing.is_some())
                    .context("Failed to re-check finalized answer")
            },
        )
        .await?;

        match outcome {
            FinalizeOutcome::Created => tracing::info!(
                "Finalized answer {} (shown={}, votes={})",
                cycle.answer.id,
                cycle.shown.len(),
                cycle.votes.len()
            ),
            FinalizeOutcome::Duplicate => tracing::info!(
                "Duplicate finalize for cycle {}, keeping existing answer",
                cycle_key
            ),
        }
        Ok(outcome)
    }

    async fn finalized_answers(
        &self,
        question_id: &str,
        assignment_id: Option<&str>,
    ) -> Result<Vec<Answer>> {
        let mut filter = doc! {
            "question_id": question_id,
            "cycle_key": { "$exists": true },
        };
        if let Some(assignment_id) = assignment_id {
            filter.insert("assignment_id", assignment_id);
        }

        let mut cursor = self
            .answers()
            .find(filter)
            .await
            .context("Failed to query finalized answers")?;
        let mut answers = Vec::new();
        while let Some(answer) = cursor.try_next().await.context("Answer cursor error")? {
            answers.push(answer);
        }
        Ok(answers)
    }
}

#[derive(Debug, Default)]
struct InMemoryAnswerData {
    answers: Vec<Answer>,
    shown: Vec<ShownRationale>,
    votes: Vec<AnswerVote>,
}

/// Answer store backed by process memory. Finalize is atomic under one lock.
#[derive(Debug, Default)]
pub struct InMemoryAnswerStore {
    data: Mutex<InMemoryAnswerData>,
}

impl InMemoryAnswerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, InMemoryAnswerData>> {
        self.data
            .lock()
            .map_err(|_| anyhow!("answer store lock poisoned"))
    }

    /// Inserts seed or peer answers directly.
    pub fn insert(&self, answer: Answer) -> Result<()> {
        self.lock()?.answers.push(answer);
        Ok(())
    }

    pub fn answers(&self) -> Result<Vec<Answer>> {
        Ok(self.lock()?.answers.clone())
    }

    pub fn shown_rationales(&self) -> Result<Vec<ShownRationale>> {
        Ok(self.lock()?.shown.clone())
    }

    pub fn votes(&self) -> Result<Vec<AnswerVote>> {
        Ok(self.lock()?.votes.clone())
    }
}

#[async_trait]
impl AnswerStore for InMemoryAnswerStore {
    async fn find_finalized(&self, key: &StageKey) -> Result<Option<Answer>> {
        let cycle_key = key.cycle_key();
        Ok(self
            .lock()?
            .answers
            .iter()
            .find(|a| a.cycle_key.as_deref() == Some(cycle_key.as_str()))
            .cloned())
    }

    async fn find_by_id(&self, answer_id: &str) -> Result<Option<Answer>> {
        Ok(self
            .lock()?
            .answers
            .iter()
            .find(|a| a.id == answer_id)
            .cloned())
    }

    async fn candidate_pool(&self, question_id: &str) -> Result<Vec<Answer>> {
        Ok(self
            .lock()?
            .answers
            .iter()
            .filter(|a| a.question_id == question_id && !a.rationale.is_empty())
            .cloned()
            .collect())
    }

    async fn finalize(&self, cycle: FinalizedCycle) -> Result<FinalizeOutcome> {
        let mut data = self.lock()?;

        if let Some(cycle_key) = cycle.answer.cycle_key.as_deref() {
            if data
                .answers
                .iter()
                .any(|a| a.cycle_key.as_deref() == Some(cycle_key))
            {
                return Ok(FinalizeOutcome::Duplicate);
            }
        }

        // Validate every write before applying any of them
        for vote in &cycle.votes {
            if !data.answers.iter().any(|a| a.id == vote.answer_id) {
                return Err(anyhow!("Vote references unknown answer {}", vote.answer_id));
            }
        }

        for vote in &cycle.votes {
            if let Some(target) = data.answers.iter_mut().find(|a| a.id == vote.answer_id) {
                match vote.vote_type {
                    VoteType::Upvote => target.upvotes += 1,
                    VoteType::Downvote => target.downvotes += 1,
                    VoteType::FinalChoice => {}
                }
            }
        }
        data.answers.push(cycle.answer);
        data.shown.extend(cycle.shown);
        data.votes.extend(cycle.votes);

        Ok(FinalizeOutcome::Created)
    }

    async fn finalized_answers(
        &self,
        question_id: &str,
        assignment_id: Option<&str>,
    ) -> Result<Vec<Answer>> {
        Ok(self
            .lock()?
            .answers
            .iter()
            .filter(|a| a.question_id == question_id && a.cycle_key.is_some())
            .filter(|a| assignment_id.is_none() || a.assignment_id.as_deref() == assignment_id)
            .cloned()
            .collect())
    }
}
