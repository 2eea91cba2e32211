use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use mongodb::bson::doc;
use mongodb::Database;

use crate::metrics::track_db_operation;
use crate::models::Question;

/// Read access to questions owned by the authoring subsystem.
#[async_trait]
pub trait QuestionStore: Send + Sync {
    async fn get(&self, question_id: &str) -> Result<Option<Question>>;
}

pub struct MongoQuestionStore {
    mongo: Database,
}

impl MongoQuestionStore {
    pub fn new(mongo: Database) -> Self {
        Self { mongo }
    }
}

#[async_trait]
impl QuestionStore for MongoQuestionStore {
    async fn get(&self, question_id: &str) -> Result<Option<Question>> {
        track_db_operation("find_one", "questions", async {
            self.mongo
                .collection::<Question>("questions")
                .find_one(doc! { "_id": question_id })
                .await
                .context("Failed to query questions collection")
        })
        .await
    }
}

#[derive(Default)]
pub struct InMemoryQuestionStore {
    questions: RwLock<HashMap<String, Question>>,
}

impl InMemoryQuestionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, question: Question) -> Result<()> {
        self.questions
            .write()
            .map_err(|_| anyhow!("question store lock poisoned"))?
            .insert(question.id.clone(), question);
        Ok(())
    }
}

#[async_trait]
impl QuestionStore for InMemoryQuestionStore {
    async fn get(&self, question_id: &str) -> Result<Option<Question>> {
        Ok(self
            .questions
            .read()
            .map_err(|_| anyhow!("question store lock poisoned"))?
            .get(question_id)
            .cloned())
    }
}
