use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use once_cell::unsync::OnceCell;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, USER_AGENT};
use serde_json::Value;

const CLIENT_USER_AGENT: &str = "rally-elo/0.1";

/// The remote system records are extracted from. Every method returns a
/// list of JSON objects; an empty list means the record has no data.
pub trait RemoteSource {
    fn tournaments(&self) -> Result<Vec<Value>>;
    fn matches(&self) -> Result<Vec<Value>>;
    fn match_detail(&self, match_no: i64) -> Result<Vec<Value>>;
    fn tournament_ranking(&self, tournament_no: i64) -> Result<Vec<Value>>;
}

/// JSON-over-HTTP source.
///
/// Endpoints: `/tournaments`, `/matches`, `/matches/{no}` and
/// `/tournaments/{no}/ranking` relative to `base_url`.
pub struct HttpSource {
    base_url: String,
    timeout: Duration,
    client: OnceCell<Client>,
}

impl HttpSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
            client: OnceCell::new(),
        }
    }

    fn client(&self) -> Result<&Client> {
        self.client.get_or_try_init(|| {
            Client::builder()
                .timeout(self.timeout)
                .build()
                .context("failed to build http client")
        })
    }

    fn fetch_records(&self, path: &str) -> Result<Vec<Value>> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .client()?
            .get(&url)
            .header(USER_AGENT, CLIENT_USER_AGENT)
            .header(ACCEPT, "application/json")
            .send()
            .with_context(|| format!("request {url}"))?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }
        let body = resp
            .text()
            .with_context(|| format!("read body {url}"))?;
        if !status.is_success() {
            return Err(anyhow!("http {status} for {url}: {}", truncate(&body, 200)));
        }
        parse_records(&body).with_context(|| format!("decode payload from {url}"))
    }
}

impl RemoteSource for HttpSource {
    fn tournaments(&self) -> Result<Vec<Value>> {
        self.fetch_records("/tournaments")
    }

    fn matches(&self) -> Result<Vec<Value>> {
        self.fetch_records("/matches")
    }

    fn match_detail(&self, match_no: i64) -> Result<Vec<Value>> {
        self.fetch_records(&format!("/matches/{match_no}"))
    }

    fn tournament_ranking(&self, tournament_no: i64) -> Result<Vec<Value>> {
        self.fetch_records(&format!("/tournaments/{tournament_no}/ranking"))
    }
}

/// Accepts a bare array, a single object, or either wrapped in `{"data": ..}`.
pub fn parse_records(body: &str) -> Result<Vec<Value>> {
    let trimmed = body.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(trimmed).context("invalid json")?;
    let value = match value {
        Value::Object(mut obj) if obj.contains_key("data") => {
            obj.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    };
    match value {
        Value::Array(items) => Ok(items.into_iter().filter(Value::is_object).collect()),
        Value::Object(_) => Ok(vec![value]),
        Value::Null => Ok(Vec::new()),
        other => Err(anyhow!("expected object or array, got {other}")),
    }
}

fn truncate(raw: &str, max: usize) -> &str {
    match raw.char_indices().nth(max) {
        Some((idx, _)) => &raw[..idx],
        None => raw,
    }
}
