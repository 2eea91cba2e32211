use std::collections::HashSet;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{doc, Document};
use mongodb::Database;

use crate::models::Answer;

/// Decides which peer answers may be shown to other students.
///
/// Provided by the scoring/consent subsystems; the selection engine only consumes it.
#[async_trait]
pub trait RationaleFilter: Send + Sync {
    async fn retain_showable(&self, question_id: &str, pool: Vec<Answer>) -> Result<Vec<Answer>>;
}

/// Drops answers a teacher annotated as low quality (score 0) and answers of users who
/// withdrew consent.
pub struct MongoQualityFilter {
    mongo: Database,
}

impl MongoQualityFilter {
    pub fn new(mongo: Database) -> Self {
        Self { mongo }
    }

    async fn low_quality_ids(&self, ids: Vec<String>) -> Result<HashSet<String>> {
        let collection = self.mongo.collection::<Document>("answer_annotations");
        let mut cursor = collection
            .find(doc! { "answer_id": { "$in": ids }, "score": 0 })
            .await
            .context("Failed to query answer annotations")?;

        let mut flagged = HashSet::new();
        while let Some(annotation) = cursor
            .try_next()
            .await
            .context("Annotation cursor error")?
        {
            if let Ok(answer_id) = annotation.get_str("answer_id") {
                flagged.insert(answer_id.to_string());
            }
        }
        Ok(flagged)
    }

    async fn withdrawn_users(&self, tokens: Vec<String>) -> Result<HashSet<String>> {
        let collection = self.mongo.collection::<Document>("consent_withdrawals");
        let mut cursor = collection
            .find(doc! { "user_token": { "$in": tokens } })
            .await
            .context("Failed to query consent withdrawals")?;

        let mut withdrawn = HashSet::new();
        while let Some(row) = cursor.try_next().await.context("Consent cursor error")? {
            if let Ok(token) = row.get_str("user_token") {
                withdrawn.insert(token.to_string());
            }
        }
        Ok(withdrawn)
    }
}

#[async_trait]
impl RationaleFilter for MongoQualityFilter {
    async fn retain_showable(&self, question_id: &str, pool: Vec<Answer>) -> Result<Vec<Answer>> {
        if pool.is_empty() {
            return Ok(pool);
        }

        let ids: Vec<String> = pool.iter().map(|a| a.id.clone()).collect();
        let tokens: Vec<String> = pool
            .iter()
            .filter(|a| !a.user_token.is_empty())
            .map(|a| a.user_token.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let flagged = self.low_quality_ids(ids).await?;
        let withdrawn = self.withdrawn_users(tokens).await?;

        let before = pool.len();
        let kept: Vec<Answer> = pool
            .into_iter()
            .filter(|a| !flagged.contains(&a.id) && !withdrawn.contains(&a.user_token))
            .collect();

        tracing::debug!(
            "Quality filter for question={}: kept {} of {} candidates",
            question_id,
            kept.len(),
            before
        );
        Ok(kept)
    }
}

/// Filter over fixed sets, for tests and local runs without the scoring subsystem.
#[derive(Debug, Clone, Default)]
pub struct StaticQualityFilter {
    low_quality: HashSet<String>,
    withdrawn: HashSet<String>,
}

impl StaticQualityFilter {
    pub fn flag_low_quality(mut self, answer_id: &str) -> Self {
        self.low_quality.insert(answer_id.to_string());
        self
    }

    pub fn withdraw_consent(mut self, user_token: &str) -> Self {
        self.withdrawn.insert(user_token.to_string());
        self
    }
}

#[async_trait]
impl RationaleFilter for StaticQualityFilter {
    async fn retain_showable(&self, _question_id: &str, pool: Vec<Answer>) -> Result<Vec<Answer>> {
        Ok(pool
            .into_iter()
            .filter(|a| !self.low_quality.contains(&a.id) && !self.withdrawn.contains(&a.user_token))
            .collect())
    }
}
