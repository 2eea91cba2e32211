use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Serialize;
use sha2::Sha256;
use url::Url;

use crate::config::GradeDeliveryConfig;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-signature";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GradeReport {
    pub user_id: String,
    pub course_id: String,
    pub assignment_id: Option<String>,
    pub question_id: String,
    pub grade: f64,
}

/// Outcome endpoint of the external learning-management system.
#[async_trait]
pub trait GradeDelivery: Send + Sync {
    async fn deliver(&self, report: &GradeReport) -> Result<()>;
}

/// Used when no outcome endpoint is configured.
pub struct NoopGradeDelivery;

#[async_trait]
impl GradeDelivery for NoopGradeDelivery {
    async fn deliver(&self, report: &GradeReport) -> Result<()> {
        tracing::debug!(
            "Grade delivery disabled, dropping grade {} for user={}",
            report.grade,
            report.user_id
        );
        Ok(())
    }
}

pub struct HttpGradeDelivery {
    http_client: Client,
    endpoint: Url,
    secret: String,
}

impl HttpGradeDelivery {
    pub fn new(config: &GradeDeliveryConfig) -> Result<Self> {
        let endpoint = Url::parse(&config.url).context("Invalid grade delivery URL")?;
        Ok(Self {
            http_client: Client::new(),
            endpoint,
            secret: config.secret.clone(),
        })
    }

    fn sign(&self, body: &[u8]) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| anyhow!("Invalid grade delivery secret: {}", e))?;
        mac.update(body);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn endpoint_for(&self, report: &GradeReport) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("course_id", &report.course_id);
        url
    }
}

#[async_trait]
impl GradeDelivery for HttpGradeDelivery {
    async fn deliver(&self, report: &GradeReport) -> Result<()> {
        let body = serde_json::to_vec(report).context("Failed to serialize grade report")?;
        let signature = self.sign(&body)?;
        let url = self.endpoint_for(report);

        let response = self
            .http_client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(body)
            .timeout(std::time::Duration::from_secs(5))
            .send()
            .await
            .context("Failed to call grade delivery endpoint")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!(
                "Grade delivery endpoint returned {}: {}",
                status,
                error_text
            ));
        }

        tracing::info!(
            "Delivered grade {} for user={} question={}",
            report.grade,
            report.user_id,
            report.question_id
        );
        Ok(())
    }
}
