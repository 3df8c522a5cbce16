use std::time::Duration;

use log::{debug, error, info, warn};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::config::ProviderSettings;
use crate::error::{Error, Result};
use crate::model::{KeywordJob, RankingMatch};

/// The provider operations the orchestrator drives.
pub trait RankingApi {
    /// Submits every job in one request. Returns one task id per job, in
    /// input order, or an error meaning nothing in the batch was submitted.
    fn submit_batch(&self, jobs: &[KeywordJob]) -> Result<Vec<String>>;

    /// Fetches the current result of one task. Never fails: transport and
    /// provider problems come back as `FetchStatus::Error`.
    fn fetch_result(&self, task_id: &str) -> FetchResult;
}

impl<T: RankingApi + ?Sized> RankingApi for &T {
    fn submit_batch(&self, jobs: &[KeywordJob]) -> Result<Vec<String>> {
        (**self).submit_batch(jobs)
    }

    fn fetch_result(&self, task_id: &str) -> FetchResult {
        (**self).fetch_result(task_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    /// Result pages exist (the match list may still be empty).
    Completed,
    /// The provider has no result pages for the task yet.
    NotReady,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult {
    pub status: FetchStatus,
    pub matches: Vec<RankingMatch>,
    /// The task object as returned by the provider, kept for diagnostics.
    pub raw: Option<Value>,
    pub error: Option<String>,
}

impl FetchResult {
    pub fn completed(matches: Vec<RankingMatch>, raw: Option<Value>) -> Self {
        FetchResult { status: FetchStatus::Completed, matches, raw, error: None }
    }

    pub fn not_ready(raw: Option<Value>) -> Self {
        FetchResult { status: FetchStatus::NotReady, matches: Vec::new(), raw, error: None }
    }

    pub fn error(message: impl Into<String>) -> Self {
        FetchResult {
            status: FetchStatus::Error,
            matches: Vec::new(),
            raw: None,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug, Serialize)]
struct TaskPostItem<'a> {
    keyword: &'a str,
    location_coordinate: String,
    language_code: &'a str,
    device: &'a str,
    os: &'a str,
    depth: u32,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    tasks: Option<Vec<T>>,
    #[serde(default)]
    status_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PostedTask {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskResult {
    #[serde(default)]
    result: Option<Vec<ResultPage>>,
}

/// One SERP result page of a task.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultPage {
    #[serde(default)]
    pub items: Option<Vec<SerpItem>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SerpItem {
    #[serde(rename = "type", default)]
    pub item_type: Option<String>,
    #[serde(default)]
    pub rank_group: Option<u32>,
    #[serde(default)]
    pub url: Option<String>,
}

/// Organic items whose URL contains `target_domain` (case-sensitive), in
/// page order then item order.
pub fn extract_matches(pages: &[ResultPage], target_domain: &str) -> Vec<RankingMatch> {
    let mut matches = Vec::new();
    for page in pages {
        for item in page.items.iter().flatten() {
            if item.item_type.as_deref() != Some("organic") {
                continue;
            }
            let (Some(rank), Some(url)) = (item.rank_group, item.url.as_deref()) else {
                continue;
            };
            if rank >= 1 && url.contains(target_domain) {
                debug!("Match for {} at rank {}: {}", target_domain, rank, url);
                matches.push(RankingMatch { rank, url: url.to_string() });
            }
        }
    }
    matches
}

/// Blocking client for the DataForSEO `serp/google/organic` task API.
pub struct RankingClient {
    client: Client,
    task_post_url: Url,
    task_get_url: Url,
    settings: ProviderSettings,
}

impl RankingClient {
    pub fn new(settings: ProviderSettings, token: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Basic {}", token))
            .map_err(|_| Error::configuration("provider token contains invalid characters"))?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("rank_tracker/", env!("CARGO_PKG_VERSION"))),
        );

        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::configuration(format!("failed to build HTTP client: {}", e)))?;

        let base = base_url(&settings.base_url)?;
        let task_post_url = join(&base, "task_post")?;
        let task_get_url = join(&base, "task_get/regular/")?;

        Ok(RankingClient { client, task_post_url, task_get_url, settings })
    }

    pub fn task_post_url(&self) -> &Url {
        &self.task_post_url
    }

    pub fn task_get_url(&self, task_id: &str) -> Result<Url> {
        join(&self.task_get_url, task_id)
    }

    fn get_task(&self, task_id: &str) -> Result<Value> {
        let url = self.task_get_url(task_id)?;
        let resp = self
            .client
            .get(url)
            .send()
            .map_err(|e| Error::Fetch(format!("request failed: {}", e)))?;
        let status = resp.status();
        let text = resp
            .text()
            .map_err(|e| Error::Fetch(format!("failed to read response: {}", e)))?;
        if !status.is_success() {
            return Err(Error::Fetch(format!("HTTP {}: {}", status, snippet(&text))));
        }
        serde_json::from_str(&text).map_err(|e| Error::Fetch(format!("invalid JSON: {}", e)))
    }
}

impl RankingApi for RankingClient {
    fn submit_batch(&self, jobs: &[KeywordJob]) -> Result<Vec<String>> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        let s = &self.settings;
        let body: Vec<TaskPostItem> = jobs
            .iter()
            .map(|job| TaskPostItem {
                keyword: &job.keyword,
                location_coordinate: job.location_coordinate(),
                language_code: &s.language_code,
                device: &s.device,
                os: &s.os,
                depth: s.depth,
            })
            .collect();

        info!("Submitting batch of {} keywords", jobs.len());

        let resp = self
            .client
            .post(self.task_post_url.clone())
            .header(CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .map_err(|e| Error::Submission(format!("request failed: {}", e)))?;

        let status = resp.status();
        let text = resp
            .text()
            .map_err(|e| Error::Submission(format!("failed to read response: {}", e)))?;
        if !status.is_success() {
            return Err(Error::Submission(format!("HTTP {}: {}", status, snippet(&text))));
        }

        let envelope: Envelope<PostedTask> = serde_json::from_str(&text)
            .map_err(|e| Error::Submission(format!("invalid JSON: {}", e)))?;
        let tasks = envelope.tasks.unwrap_or_default();
        if tasks.is_empty() {
            let reason = envelope.status_message.unwrap_or_else(|| "no tasks returned".into());
            return Err(Error::Submission(reason));
        }

        let ids: Vec<String> = tasks.into_iter().filter_map(|t| t.id).collect();
        if ids.len() != jobs.len() {
            return Err(Error::Submission(format!(
                "expected {} task ids, provider returned {}",
                jobs.len(),
                ids.len()
            )));
        }

        info!("Batch submitted: {} task ids", ids.len());
        Ok(ids)
    }

    fn fetch_result(&self, task_id: &str) -> FetchResult {
        debug!("Fetching task {}", task_id);

        let body = match self.get_task(task_id) {
            Ok(v) => v,
            Err(e) => {
                error!("Failed to fetch task {}: {}", task_id, e);
                return FetchResult::error(e.to_string());
            }
        };

        let Some(task) = body.get("tasks").and_then(|t| t.get(0)).cloned() else {
            warn!("Task {}: response carries no task object", task_id);
            return FetchResult::error("no task object in response");
        };

        let parsed: TaskResult = match serde_json::from_value(task.clone()) {
            Ok(t) => t,
            Err(e) => return FetchResult::error(format!("unexpected task shape: {}", e)),
        };

        match parsed.result {
            Some(pages) if !pages.is_empty() => {
                let matches = extract_matches(&pages, &self.settings.target_domain);
                info!("Task {}: {} domain matches", task_id, matches.len());
                FetchResult::completed(matches, Some(task))
            }
            _ => {
                debug!("Task {} not ready yet", task_id);
                FetchResult::not_ready(Some(task))
            }
        }
    }
}

fn base_url(raw: &str) -> Result<Url> {
    let mut s = raw.trim().to_string();
    if !s.ends_with('/') {
        s.push('/');
    }
    Url::parse(&s).map_err(|e| Error::configuration(format!("invalid base url {:?}: {}", raw, e)))
}

fn join(base: &Url, path: &str) -> Result<Url> {
    base.join(path)
        .map_err(|e| Error::configuration(format!("invalid endpoint {:?}: {}", path, e)))
}

fn snippet(text: &str) -> &str {
    match text.char_indices().nth(200) {
        Some((i, _)) => &text[..i],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pages(v: Value) -> Vec<ResultPage> {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn extracts_only_organic_items_for_the_domain() {
        let pages = pages(json!([
            { "items": [
                { "type": "paid", "rank_group": 1, "url": "https://example.com/ad" },
                { "type": "organic", "rank_group": 4, "url": "https://other.com/" },
                { "type": "organic", "rank_group": 7, "url": "https://www.example.com/raccoons" },
                { "type": "local_pack", "rank_group": 2 }
            ]},
            { "items": null },
            { "items": [
                { "type": "organic", "rank_group": 12, "url": "https://example.com/bats" }
            ]}
        ]));
        let matches = extract_matches(&pages, "example.com");
        assert_eq!(
            matches,
            vec![
                RankingMatch { rank: 7, url: "https://www.example.com/raccoons".into() },
                RankingMatch { rank: 12, url: "https://example.com/bats".into() },
            ]
        );
    }

    #[test]
    fn envelope_without_tasks_parses() {
        let envelope: Envelope<PostedTask> =
            serde_json::from_value(json!({ "status_message": "Insufficient funds." })).unwrap();
        assert!(envelope.tasks.is_none());
        assert_eq!(envelope.status_message.as_deref(), Some("Insufficient funds."));

        let envelope: Envelope<PostedTask> =
            serde_json::from_value(json!({ "tasks": [ { "id": "a" }, {} ] })).unwrap();
        let ids: Vec<Option<String>> = envelope.tasks.unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![Some("a".to_string()), None]);
    }

    #[test]
    fn matching_is_case_sensitive() {
        let pages = pages(json!([
            { "items": [ { "type": "organic", "rank_group": 1, "url": "https://EXAMPLE.com/" } ] }
        ]));
        assert!(extract_matches(&pages, "example.com").is_empty());
    }

    #[test]
    fn endpoints_are_joined_onto_the_base() {
        let settings = ProviderSettings {
            base_url: "http://localhost:9999/v3/serp/google/organic".into(),
            ..ProviderSettings::default()
        };
        let client = RankingClient::new(settings, "dG9rZW4=").unwrap();
        assert_eq!(
            client.task_post_url().as_str(),
            "http://localhost:9999/v3/serp/google/organic/task_post"
        );
        assert_eq!(
            client.task_get_url("abc-123").unwrap().as_str(),
            "http://localhost:9999/v3/serp/google/organic/task_get/regular/abc-123"
        );
    }

    #[test]
    fn snippet_truncates_long_bodies() {
        let long = "x".repeat(500);
        assert_eq!(snippet(&long).len(), 200);
        assert_eq!(snippet("short"), "short");
    }
}
