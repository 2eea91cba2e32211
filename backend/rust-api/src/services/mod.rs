use std::sync::Arc;

use crate::config::Config;
use mongodb::{Client as MongoClient, Database};
use redis::aio::ConnectionManager;

use answer_store::{AnswerStore, MongoAnswerStore};
use grade_delivery::{GradeDelivery, HttpGradeDelivery, NoopGradeDelivery};
use quality_filter::{MongoQualityFilter, RationaleFilter};
use question_store::{MongoQuestionStore, QuestionStore};
use selection::AlgorithmRegistry;
use stage_store::{RedisStageStore, StageStore};
use tracking::{EventSink, MongoEventSink};

pub mod answer_store;
pub mod answering;
pub mod attribution;
pub mod errors;
pub mod grade_delivery;
pub mod grading;
pub mod quality_filter;
pub mod question_store;
pub mod selection;
pub mod stage_store;
pub mod tracking;

/// Storage and integration backends the answering engine runs against.
pub struct Stores {
    pub questions: Arc<dyn QuestionStore>,
    pub answers: Arc<dyn AnswerStore>,
    pub stages: Arc<dyn StageStore>,
    pub events: Arc<dyn EventSink>,
    pub grade_delivery: Arc<dyn GradeDelivery>,
    pub rationale_filter: Arc<dyn RationaleFilter>,
}

pub struct AppState {
    pub config: Config,
    /// Raw handles, kept for health checks; absent when running on in-memory stores
    pub mongo: Option<Database>,
    pub redis: Option<ConnectionManager>,
    pub questions: Arc<dyn QuestionStore>,
    pub answers: Arc<dyn AnswerStore>,
    pub stages: Arc<dyn StageStore>,
    pub events: Arc<dyn EventSink>,
    pub grade_delivery: Arc<dyn GradeDelivery>,
    pub rationale_filter: Arc<dyn RationaleFilter>,
    pub algorithms: Arc<AlgorithmRegistry>,
}

impl AppState {
    pub async fn new(
        config: Config,
        mongo_client: MongoClient,
        redis_client: redis::Client,
    ) -> anyhow::Result<Self> {
        let mongo = mongo_client.database(&config.mongo_database);

        tracing::info!("Attempting to connect to Redis...");

        let redis = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            ConnectionManager::new(redis_client),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Redis connection timeout after 30s"))??;

        tracing::info!("Redis ConnectionManager created, testing with PING...");

        let mut conn = redis.clone();
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            redis::cmd("PING").query_async::<String>(&mut conn),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Redis PING timeout after 5s"))??;

        tracing::info!("Redis connection established successfully");

        let answers = MongoAnswerStore::new(mongo_client.clone(), mongo.clone());
        answers.ensure_indexes().await?;

        let grade_delivery: Arc<dyn GradeDelivery> = match &config.grade_delivery {
            Some(delivery) => {
                tracing::info!("Grade delivery enabled: {}", delivery.url);
                Arc::new(HttpGradeDelivery::new(delivery)?)
            }
            None => {
                tracing::info!("Grade delivery not configured, grades stay local");
                Arc::new(NoopGradeDelivery)
            }
        };

        let stores = Stores {
            questions: Arc::new(MongoQuestionStore::new(mongo.clone())),
            answers: Arc::new(answers),
            stages: Arc::new(RedisStageStore::new(
                redis.clone(),
                config.engine.stage_ttl_seconds,
            )),
            events: Arc::new(MongoEventSink::new(mongo.clone())),
            grade_delivery,
            rationale_filter: Arc::new(MongoQualityFilter::new(mongo.clone())),
        };

        let mut state = Self::with_stores(config, stores);
        state.mongo = Some(mongo);
        state.redis = Some(redis);
        Ok(state)
    }

    /// State over caller-supplied backends, with no database handles.
    pub fn with_stores(config: Config, stores: Stores) -> Self {
        let algorithms = Arc::new(AlgorithmRegistry::builtin(
            &config.engine.default_algorithm,
        ));
        tracing::info!(
            "Rationale selection algorithms: {:?}",
            algorithms.names()
        );

        Self {
            config,
            mongo: None,
            redis: None,
            questions: stores.questions,
            answers: stores.answers,
            stages: stores.stages,
            events: stores.events,
            grade_delivery: stores.grade_delivery,
            rationale_filter: stores.rationale_filter,
            algorithms,
        }
    }
}
