//! Blocking HTTP client for the agent's Local API, grounded on
//! `shipper-registry`'s builder-with-timeout-and-user-agent client shape but
//! synchronous, since the CLI is a short-lived process with no runtime of
//! its own.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;

const USER_AGENT: &str = concat!("superagent-cli/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ApiClient {
    base_url: String,
    token: Option<String>,
    http: reqwest::blocking::Client,
}

/// Mirrors the agent's `{status, data|error}` envelope without depending on
/// `superagent-api`, which pulls in the whole async server stack.
#[derive(serde::Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum Envelope {
    Success { data: Value },
    Error { error: ErrorBody },
}

#[derive(serde::Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self> {
        let http = reqwest::blocking::Client::builder().timeout(REQUEST_TIMEOUT).user_agent(USER_AGENT).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            http,
        })
    }

    fn authed(&self, req: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        match &self.token {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }

    fn decode<T: DeserializeOwned>(resp: reqwest::blocking::Response) -> Result<T> {
        let envelope: Envelope = resp.json().context("failed to parse agent response")?;
        match envelope {
            Envelope::Success { data } => serde_json::from_value(data).context("unexpected shape in success response"),
            Envelope::Error { error } => Err(anyhow!("agent returned {}: {}", error.code, error.message)),
        }
    }

    pub fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self.authed(self.http.get(format!("{}{path}", self.base_url))).send().with_context(|| format!("request to {path} failed"))?;
        Self::decode(resp)
    }

    pub fn post<B: serde::Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let resp = self
            .authed(self.http.post(format!("{}{path}", self.base_url)).json(body))
            .send()
            .with_context(|| format!("request to {path} failed"))?;
        Self::decode(resp)
    }

    pub fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self.authed(self.http.delete(format!("{}{path}", self.base_url))).send().with_context(|| format!("request to {path} failed"))?;
        Self::decode(resp)
    }
}
