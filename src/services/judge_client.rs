use crate::models::grading::JudgeStatus;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JudgeError {
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Submission error: {0}")]
    SubmissionError(String),

    #[error("Judge did not finish after {attempts} status checks")]
    PollTimeout { attempts: u32 },
}

/// Backend language ids understood by the judge.
const LANGUAGES: &[(&str, i32)] = &[
    ("python", 71),
    ("python3", 71),
    ("javascript", 63),
    ("js", 63),
    ("node", 63),
    ("typescript", 74),
    ("java", 62),
    ("c", 50),
    ("cpp", 54),
    ("c++", 54),
    ("csharp", 51),
    ("go", 60),
    ("rust", 73),
    ("ruby", 72),
    ("php", 68),
    ("kotlin", 78),
    ("swift", 83),
];

pub fn language_id(language: &str) -> Option<i32> {
    let wanted = language.trim().to_ascii_lowercase();
    LANGUAGES
        .iter()
        .find(|(name, _)| *name == wanted)
        .map(|(_, id)| *id)
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusBody {
    pub id: i32,
    #[serde(default)]
    pub description: String,
}

/// Poll response from the judge.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JudgeResponse {
    pub status: StatusBody,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
    #[serde(default)]
    pub compile_output: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub time: Option<String>,
    #[serde(default)]
    pub memory: Option<i64>,
}

impl JudgeResponse {
    pub fn judge_status(&self) -> JudgeStatus {
        JudgeStatus::from_id(self.status.id)
    }
}

fn string_or_number<'de, D>(d: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(d)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_attempts: 30,
        }
    }
}

/// Remote code execution service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExecutionClient: Send + Sync {
    /// Queue a run and return its job token.
    async fn submit(&self, code: &str, language: &str, stdin: &str) -> Result<String, JudgeError>;

    /// Fetch the current state of a job.
    async fn fetch(&self, token: &str) -> Result<JudgeResponse, JudgeError>;
}

/// Fetch `token` until the judge reports a terminal status, at most `policy.max_attempts` times.
pub async fn poll_until_terminal(
    client: &dyn ExecutionClient,
    token: &str,
    policy: PollPolicy,
) -> Result<JudgeResponse, JudgeError> {
    for attempt in 1..=policy.max_attempts {
        let response = client.fetch(token).await?;
        if response.judge_status().is_terminal() {
            return Ok(response);
        }
        tracing::debug!(
            token,
            attempt,
            status = %response.status.description,
            "judge job not finished yet"
        );
        if attempt < policy.max_attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }
    Err(JudgeError::PollTimeout {
        attempts: policy.max_attempts,
    })
}

#[derive(Serialize)]
struct SubmitRequest<'a> {
    language_id: i32,
    source_code: &'a str,
    stdin: &'a str,
}

#[derive(Deserialize)]
struct SubmitResponse {
    token: String,
}

/// HTTP client for a Judge0-compatible execution service.
#[derive(Clone)]
pub struct Judge0Client {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
}

impl Judge0Client {
    pub fn new(client: Client, mut base_url: Url, api_key: Option<String>) -> Self {
        // `Url::join` replaces the last segment unless the base ends in a slash.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self {
            client,
            base_url,
            api_key,
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, JudgeError> {
        self.base_url
            .join(path)
            .map_err(|e| JudgeError::SubmissionError(format!("invalid judge url: {}", e)))
    }

    fn with_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("X-Auth-Token", key),
            None => req,
        }
    }
}

#[async_trait]
impl ExecutionClient for Judge0Client {
    async fn submit(&self, code: &str, language: &str, stdin: &str) -> Result<String, JudgeError> {
        let language_id = language_id(language)
            .ok_or_else(|| JudgeError::UnsupportedLanguage(language.to_string()))?;

        let url = self.endpoint("submissions?base64_encoded=false&wait=false")?;
        let req = SubmitRequest {
            language_id,
            source_code: code,
            stdin,
        };
        let resp = self
            .with_auth(self.client.post(url))
            .json(&req)
            .send()
            .await
            .map_err(|e| JudgeError::SubmissionError(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(JudgeError::SubmissionError(format!(
                "judge returned {}: {}",
                status, body
            )));
        }

        let body: SubmitResponse = resp
            .json()
            .await
            .map_err(|e| JudgeError::SubmissionError(e.to_string()))?;
        tracing::debug!(token = %body.token, language_id, "submitted code to judge");
        Ok(body.token)
    }

    async fn fetch(&self, token: &str) -> Result<JudgeResponse, JudgeError> {
        let url = self.endpoint(&format!(
            "submissions/{}?base64_encoded=false&fields=status,stdout,stderr,compile_output,message,time,memory",
            token
        ))?;
        let resp = self
            .with_auth(self.client.get(url))
            .send()
            .await
            .map_err(|e| JudgeError::SubmissionError(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(JudgeError::SubmissionError(format!(
                "judge returned {} for token {}",
                resp.status(),
                token
            )));
        }
        resp.json::<JudgeResponse>()
            .await
            .map_err(|e| JudgeError::SubmissionError(e.to_string()))
    }
}
