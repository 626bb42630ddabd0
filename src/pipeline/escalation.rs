//! External policy escalation.
//!
//! Text the rule table could not decide on is submitted to an external
//! policy evaluator as a single blocking job. Every policy section whose
//! outcome is affirmative comes back as a category.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ClassifierConfig;
use crate::error::ClassifierError;

const JOB_STATUS_COMPLETED: &str = "JOB_STATUS_COMPLETED";
const OUTCOME_TRUE: &str = "OUTCOME_TRUE";
const OUTCOME_FAILED: &str = "OUTCOME_FAILED";

/// Classifies free text into policy categories.
#[async_trait]
pub trait PolicyClassifier: Send + Sync {
    /// Categories whose evaluation outcome is affirmative. Empty when none.
    async fn classify(&self, text: &str) -> Result<Vec<String>, ClassifierError>;
}

/// Comment attached to a subject when escalation finds categories.
pub fn escalation_comment(categories: &[String]) -> String {
    format!(
        "Policy evaluation identified the following labels: {}",
        categories.join(", ")
    )
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct JobRequest<'a> {
    content_data: Vec<ContentData<'a>>,
    policy_id: &'a str,
    wait_for_completion: bool,
}

#[derive(Debug, Serialize)]
struct ContentData<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateJobResponse {
    job: Job,
}

#[derive(Debug, Deserialize)]
struct Job {
    #[serde(default)]
    status: String,
    #[serde(default)]
    results: Vec<JobResult>,
}

#[derive(Debug, Deserialize)]
struct JobResult {
    report: Report,
}

#[derive(Debug, Deserialize)]
struct Report {
    #[serde(default)]
    result: String,
    #[serde(
        default,
        rename = "sectionEvaluationReports",
        alias = "section_evaluation_reports"
    )]
    sections: Vec<SectionReport>,
}

#[derive(Debug, Deserialize)]
struct SectionReport {
    name: String,
    #[serde(default)]
    result: String,
}

/// Extract affirmative categories from a finished job.
fn categories(job: Job) -> Result<Vec<String>, ClassifierError> {
    if !job.status.is_empty() && job.status != JOB_STATUS_COMPLETED {
        return Err(ClassifierError::JobFailed { status: job.status });
    }

    // One content item is submitted, so only the first result matters.
    let report = job
        .results
        .into_iter()
        .next()
        .ok_or(ClassifierError::NoResults)?
        .report;

    if report.result == OUTCOME_FAILED {
        return Err(ClassifierError::EvaluationFailed);
    }

    Ok(report
        .sections
        .into_iter()
        .filter(|s| s.result == OUTCOME_TRUE)
        .map(|s| s.name)
        .collect())
}

// ── HTTP classifier ─────────────────────────────────────────────────

/// [`PolicyClassifier`] backed by a job-based HTTP evaluation API.
pub struct HttpPolicyClassifier {
    http: reqwest::Client,
    config: ClassifierConfig,
}

impl HttpPolicyClassifier {
    pub fn new(config: ClassifierConfig) -> Result<Self, ClassifierError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ClassifierError::RequestFailed {
                reason: e.to_string(),
            })?;
        Ok(Self { http, config })
    }
}

#[async_trait]
impl PolicyClassifier for HttpPolicyClassifier {
    async fn classify(&self, text: &str) -> Result<Vec<String>, ClassifierError> {
        let request = JobRequest {
            content_data: vec![ContentData { text }],
            policy_id: &self.config.policy_id,
            wait_for_completion: true,
        };

        let response = self
            .http
            .post(&self.config.endpoint)
            .bearer_auth(self.config.auth_token.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ClassifierError::Timeout(self.config.timeout)
                } else {
                    ClassifierError::RequestFailed {
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "Classifier rejected job");
            return Err(ClassifierError::RequestFailed {
                reason: format!("{status}: {body}"),
            });
        }

        let created: CreateJobResponse =
            response
                .json()
                .await
                .map_err(|e| ClassifierError::RequestFailed {
                    reason: format!("invalid job response: {e}"),
                })?;

        let found = categories(created.job)?;
        debug!(count = found.len(), "Classifier job completed");
        Ok(found)
    }
}
