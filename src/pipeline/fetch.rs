//! Default external collaborators for the worker binary.
//!
//! `HttpPageFetcher` serves both the job scrape stage and the company fetch
//! stage with a plain GET: no selector logic, just the raw body for the
//! extraction agents to work on. `BaselineScorer` is a stand-in scoring
//! engine that rates extractions by completeness; deployments with a real
//! scoring formula plug it in through the `ScoringEngine` seam.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::debug;

use super::{CompanyFetcher, FetchError, JobScraper, ScoreReport, ScoringEngine};

/// Plain HTTP fetcher. The target's `url` field is fetched with a GET and
/// returned as `{url, status, body, fetched_at}`.
pub struct HttpPageFetcher {
    client: reqwest::Client,
}

impl HttpPageFetcher {
    /// Creates a fetcher with the given per-request timeout.
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("jobforge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError(e.to_string()))?;

        Ok(Self { client })
    }

    async fn get(&self, target: &Value) -> Result<Value, FetchError> {
        let url = target
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| FetchError("target has no url".to_string()))?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError(e.to_string()))?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(FetchError(format!("GET {url} returned status {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetchError(e.to_string()))?;
        debug!(url = %url, bytes = body.len(), "fetched page");

        Ok(json!({
            "url": url,
            "status": status,
            "body": body,
            "fetched_at": Utc::now().to_rfc3339(),
        }))
    }
}

#[async_trait]
impl JobScraper for HttpPageFetcher {
    async fn scrape(&self, target: &Value) -> Result<Value, FetchError> {
        self.get(target).await
    }
}

#[async_trait]
impl CompanyFetcher for HttpPageFetcher {
    async fn fetch(&self, target: &Value) -> Result<Value, FetchError> {
        self.get(target).await
    }
}

/// Facts the baseline scorer looks for.
const SCORED_FIELDS: [&str; 5] = [
    "title",
    "company",
    "salary_min",
    "technologies",
    "work_arrangement",
];

/// Completeness-based scoring engine: the score is the share of the key
/// fact fields the extraction actually filled in, scaled to 0-100. A
/// posting with no usable title never passes.
pub struct BaselineScorer;

impl ScoringEngine for BaselineScorer {
    fn score(&self, facts: &Value) -> ScoreReport {
        let mut present = Vec::new();
        let mut missing = Vec::new();
        for field in SCORED_FIELDS {
            match facts.get(field) {
                Some(value) if !value.is_null() => present.push(field),
                _ => missing.push(field),
            }
        }

        let final_score = 100.0 * present.len() as f64 / SCORED_FIELDS.len() as f64;
        ScoreReport {
            final_score,
            passed: present.contains(&"title"),
            breakdown: json!({
                "present": present,
                "missing": missing,
            }),
        }
    }
}
